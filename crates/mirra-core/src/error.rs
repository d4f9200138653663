//! Error types for commit validation and state access.

use thiserror::Error;

/// Errors raised while validating or applying a commit.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("Invalid commit shape: {0}")]
    InvalidCommitShape(String),

    #[error("Unknown mutation type: {0}")]
    UnknownMutationType(String),

    #[error("Mutation rejected by its handler: {0}")]
    MutationRejected(String),

    #[error("State cannot be assigned directly, use replace_state() to explicitly replace it")]
    StateWriteViolation,
}

pub type Result<T> = std::result::Result<T, CoreError>;
