//! Error types for scanq.
//!
//! Only failures that abort the operation in progress live here. Item-level
//! submission failures are recorded on the item, and Action Gate rejections
//! are reported as [`crate::engine::Gated::Rejected`], never as errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("work item not found: {0}")]
    NotFound(String),

    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition {
        from: crate::model::State,
        to: crate::model::State,
    },

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// True when the failure came from the persistence layer.
    pub fn is_persistence(&self) -> bool {
        matches!(self, Error::Storage(_) | Error::Io(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
