//! Mirra Store - replicated mutation store
//!
//! A [`Store`] owns one replica of application state. State only changes
//! through [`Store::commit`], which applies a registered mutation, notifies
//! subscribers and broadcasts the mutation to every attached transport. Peer
//! stores receive the packet and replay the mutation locally without
//! broadcasting it again.
//!
//! # Quick Start
//!
//! ```rust
//! use mirra_store::{Broker, ImmediateTransport, Store};
//! use serde_json::json;
//!
//! #[derive(Clone, Default)]
//! struct Counter {
//!     a: i64,
//! }
//!
//! fn replica(broker: &Broker) -> Store<Counter> {
//!     let transport = ImmediateTransport::join(broker, "lobby");
//!     Store::builder()
//!         .state(Counter { a: 1 })
//!         .mutation("inc", |state: &mut Counter, n| state.a += n.as_i64().unwrap_or(0))
//!         .plugin(move |store| store.add_transport(transport))
//!         .build()
//!         .unwrap()
//! }
//!
//! let broker = Broker::new();
//! let alice = replica(&broker);
//! let bob = replica(&broker);
//!
//! alice.commit("inc", json!(2)).unwrap();
//! assert_eq!(alice.state().a, 3);
//! assert_eq!(bob.state().a, 3);
//! ```
//!
//! # Architecture
//!
//! - [`store`] - the store and its commit pipeline
//! - [`config`] - store construction options
//! - [`sequencing`] - packet numbering and duplicate detection
//! - [`devtools`] - observer hook that traces every commit
//! - [`error`] - error types

pub mod config;
pub mod devtools;
pub mod error;
pub mod sequencing;
pub mod store;

pub use config::{InitialState, Plugin, StoreBuilder};
pub use error::{Result, StoreError};
pub use sequencing::{Delivery, PacketSequencer, ReceiveTracker};
pub use store::{CommitReceipt, Store, RESET_MUTATION};

// Re-exports for convenience
pub use mirra_core::{
    CommitInput, CommitOptions, CommitRecord, CoreError, MutationOutcome, Subscription,
};
pub use mirra_transport::{
    Broker, ClientId, DelayConfig, DelayConfigBuilder, DelayedTransport, DeliveryOrder,
    ImmediateTransport, RelayServer, Room, SocketConfig, SocketConfigBuilder, SocketTransport,
    Transport, TransportError, TransportPacket,
};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::error::StoreError;
    pub use crate::store::Store;
    pub use mirra_core::{CommitOptions, CommitRecord};
    pub use mirra_transport::{Broker, ClientId, ImmediateTransport, Transport};
}
