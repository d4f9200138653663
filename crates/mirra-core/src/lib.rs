//! Mirra Core - mutation registry, commit records and the subscriber bus
//!
//! This crate holds the pieces of a Mirra store that do not know anything
//! about networking:
//!
//! - [`registry`] - named mutation handlers, registered once per store
//! - [`record`] - commit records, commit options and the commit log
//! - [`subscriber`] - ordered observer callbacks notified after each commit
//! - [`state`] - the guarded state container mutations are applied to
//! - [`error`] - error types
//!
//! The commit pipeline that ties these together lives in `mirra-store`.

pub mod error;
pub mod record;
pub mod registry;
pub mod state;
pub mod subscriber;

pub use error::{CoreError, Result};
pub use record::{CommitInput, CommitLog, CommitOptions, CommitRecord};
pub use registry::{MutationHandler, MutationOutcome, MutationRegistry};
pub use state::StateCell;
pub use subscriber::{Subscriber, SubscriberBus, SubscriberId, Subscription};
