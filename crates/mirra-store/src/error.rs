//! Error types for store operations.

use mirra_core::CoreError;
use mirra_transport::{ClientId, TransportError};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Bad packet {packet_id} from {source_id}: {reason}")]
    BadPacket {
        source_id: ClientId,
        packet_id: u64,
        reason: String,
    },

    #[error("Duplicate packet {packet_id} from {source_id}")]
    DuplicatePacket { source_id: ClientId, packet_id: u64 },

    #[error("No initial state was provided")]
    MissingState,
}

impl StoreError {
    /// True if the error means the commit named an unregistered mutation.
    pub fn is_unknown_mutation(&self) -> bool {
        matches!(self, StoreError::Core(CoreError::UnknownMutationType(_)))
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
