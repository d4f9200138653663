//! Synchronous in-process transport.

use crate::broker::{Broker, Room};
use crate::error::{Result, TransportError};
use crate::packet::{ClientId, TransportPacket};
use crate::transport::{ReceiveCallback, Transport};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Delivers each packet to every other receiver in its room before `send`
/// returns.
///
/// One instance may be shared by several stores; each registers under its own
/// client id. A receiver removed from the room while a send is in progress is
/// skipped for the rest of that send.
pub struct ImmediateTransport {
    room: Arc<Room>,
    registered: Mutex<HashSet<ClientId>>,
    closed: AtomicBool,
    sent: AtomicU64,
}

impl ImmediateTransport {
    pub fn new(room: Arc<Room>) -> Self {
        Self {
            room,
            registered: Mutex::new(HashSet::new()),
            closed: AtomicBool::new(false),
            sent: AtomicU64::new(0),
        }
    }

    /// Bind a new transport to the broker room `room`.
    pub fn join(broker: &Broker, room: &str) -> Arc<Self> {
        Arc::new(Self::new(broker.room(room)))
    }

    pub fn room(&self) -> &Arc<Room> {
        &self.room
    }

    /// Number of packets accepted by `send`.
    pub fn sent_count(&self) -> u64 {
        self.sent.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Transport for ImmediateTransport {
    fn kind(&self) -> &'static str {
        "InMemory"
    }

    fn send(&self, packet: TransportPacket) -> Result<()> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        self.sent.fetch_add(1, Ordering::SeqCst);

        let targets = self.room.targets(&packet.source_id);
        debug!(
            room = %self.room.name(),
            source_id = %packet.source_id,
            action = %packet.action,
            packet_id = packet.packet_id,
            receivers = targets.len(),
            "delivering packet"
        );
        for (client_id, _) in targets {
            if self.is_closed() {
                break;
            }
            if let Some(callback) = self.room.receiver(&client_id) {
                callback(packet.clone());
            }
        }
        Ok(())
    }

    fn set_receive(&self, client_id: &ClientId, callback: ReceiveCallback) -> Result<()> {
        // closing takes the same lock, so a receiver is never left behind
        let mut registered = self.registered.lock();
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        self.room.register(client_id, callback)?;
        registered.insert(client_id.clone());
        Ok(())
    }

    fn clear_receive(&self, client_id: &ClientId) {
        if self.registered.lock().remove(client_id) {
            self.room.deregister(client_id);
        }
    }

    fn close(&self) {
        let mut registered = self.registered.lock();
        self.closed.store(true, Ordering::SeqCst);
        for client_id in registered.drain() {
            self.room.deregister(&client_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn collector() -> (Arc<Mutex<Vec<TransportPacket>>>, ReceiveCallback) {
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        (received, Arc::new(move |packet: TransportPacket| sink.lock().push(packet)))
    }

    #[test]
    fn test_sender_excluded() {
        let broker = Broker::new();
        let transport = ImmediateTransport::join(&broker, "lobby");
        let (from_a, callback_a) = collector();
        let (from_b, callback_b) = collector();
        transport.set_receive(&ClientId::new("a"), callback_a).unwrap();
        transport.set_receive(&ClientId::new("b"), callback_b).unwrap();

        transport
            .send(TransportPacket::new("inc", 1, ClientId::new("a")))
            .unwrap();

        assert!(from_a.lock().is_empty());
        assert_eq!(from_b.lock().len(), 1);
        assert_eq!(transport.sent_count(), 1);
    }

    #[test]
    fn test_second_registration_fails() {
        let broker = Broker::new();
        let transport = ImmediateTransport::join(&broker, "lobby");
        let (_, first) = collector();
        let (_, second) = collector();
        transport.set_receive(&ClientId::new("a"), first).unwrap();
        assert!(matches!(
            transport.set_receive(&ClientId::new("a"), second),
            Err(TransportError::RegistrationConflict(_))
        ));
    }

    #[test]
    fn test_close_silences_receivers() {
        let broker = Broker::new();
        let sender = ImmediateTransport::join(&broker, "lobby");
        let receiver = ImmediateTransport::join(&broker, "lobby");
        let (received, callback) = collector();
        receiver.set_receive(&ClientId::new("b"), callback).unwrap();

        receiver.close();
        sender
            .send(TransportPacket::new("inc", 1, ClientId::new("a")))
            .unwrap();

        assert!(received.lock().is_empty());
        assert!(broker.room("lobby").is_empty());
        assert_eq!(
            receiver.send(TransportPacket::new("inc", 1, ClientId::new("b"))),
            Err(TransportError::Closed)
        );
    }

    #[test]
    fn test_clear_receive_only_touches_own_clients() {
        let broker = Broker::new();
        let ours = ImmediateTransport::join(&broker, "lobby");
        let theirs = ImmediateTransport::join(&broker, "lobby");
        let (_, callback) = collector();
        theirs.set_receive(&ClientId::new("b"), callback).unwrap();

        ours.clear_receive(&ClientId::new("b"));
        assert_eq!(broker.room("lobby").len(), 1);
    }
}
