//! The transport contract.

use crate::error::Result;
use crate::packet::{ClientId, TransportPacket};
use std::sync::Arc;

/// Callback a store registers to receive packets from its peers.
pub type ReceiveCallback = Arc<dyn Fn(TransportPacket) + Send + Sync>;

/// A channel that moves packets between store replicas.
///
/// Implementations deliver every packet to all receivers on the same channel
/// except the one whose client id matches `packet.source_id`. Delivery is
/// best effort; nothing is retried.
pub trait Transport: Send + Sync {
    /// Short name of the transport kind, used in logs.
    fn kind(&self) -> &'static str;

    /// Deliver `packet` to every other receiver on the channel.
    fn send(&self, packet: TransportPacket) -> Result<()>;

    /// Register the receive callback for `client_id`. Fails with
    /// [`TransportError::RegistrationConflict`](crate::TransportError::RegistrationConflict)
    /// if one is already registered.
    fn set_receive(&self, client_id: &ClientId, callback: ReceiveCallback) -> Result<()>;

    /// Remove the receive callback for `client_id`, if any.
    fn clear_receive(&self, client_id: &ClientId);

    /// Deregister every callback registered through this transport and
    /// release its resources. No callback is invoked afterwards.
    fn close(&self);
}
