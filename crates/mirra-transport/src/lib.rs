//! Mirra Transport - moving committed mutations between store replicas
//!
//! A transport carries [`TransportPacket`]s from the store that committed a
//! mutation to every other store listening on the same channel. The sender
//! never receives its own packet.
//!
//! # Architecture
//!
//! - [`transport`] - the [`Transport`] trait every channel implements
//! - [`packet`] - the wire envelope and client identities
//! - [`broker`] - explicit rooms of receivers shared by in-process transports
//! - [`immediate`] - synchronous in-process fan-out
//! - [`delayed`] - in-process fan-out after a configurable delay
//! - [`socket`] - TCP transport and the relay server it talks to
//! - [`error`] - error types
//!
//! # Example
//!
//! ```rust
//! use mirra_transport::{Broker, ClientId, ImmediateTransport, Transport, TransportPacket};
//! use std::sync::Arc;
//!
//! let broker = Broker::new();
//! let transport = ImmediateTransport::join(&broker, "lobby");
//!
//! let received = Arc::new(parking_lot::Mutex::new(Vec::new()));
//! let sink = received.clone();
//! transport
//!     .set_receive(&ClientId::new("b"), Arc::new(move |packet: TransportPacket| sink.lock().push(packet)))
//!     .unwrap();
//!
//! transport
//!     .send(TransportPacket::new("inc", 2, ClientId::new("a")))
//!     .unwrap();
//! assert_eq!(received.lock().len(), 1);
//! ```

pub mod broker;
pub mod delayed;
pub mod error;
pub mod immediate;
pub mod packet;
pub mod socket;
pub mod transport;

pub use broker::{Broker, Room};
pub use delayed::{DelayConfig, DelayConfigBuilder, DelayedTransport, DeliveryOrder};
pub use error::{Result, TransportError};
pub use immediate::ImmediateTransport;
pub use packet::{ClientId, SessionId, TransportPacket};
pub use socket::{Frame, RelayServer, SocketConfig, SocketConfigBuilder, SocketTransport};
pub use transport::{ReceiveCallback, Transport};
