use std::fmt::Display;

use crate::types::Seqno;

/// A specialized error type for write-set cache operations.
///
/// Out-of-space on allocation is deliberately not an error: `alloc`
/// returns `None` and the caller decides whether to block, retry or
/// overflow to another store.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Error from the mapping layer underneath the ring.
    #[error("mapping error: {0}")]
    Mapping(#[from] encmap::EncMapError),
    /// Configuration value was invalid.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// On-disk state failed a structural check.
    #[error("data corruption: {0}")]
    Corruption(String),
    /// A seqno was used out of order or twice.
    #[error("seqno misuse: {0} ({1})")]
    SeqnoMisuse(Seqno, String),
    /// The master key could not be obtained or created.
    #[error("master key unavailable: {0}")]
    KeyMissing(String),
    /// Invalid state transition or operation.
    #[error("invalid state: {0}")]
    InvalidState(String),
}

impl CacheError {
    /// Create an invalid configuration error from a displayable value.
    pub fn invalid_config<T>(msg: T) -> Self
    where
        T: Display,
    {
        Self::InvalidConfig(msg.to_string())
    }

    /// Create a corruption error from a displayable value.
    pub fn corruption<T>(msg: T) -> Self
    where
        T: Display,
    {
        Self::Corruption(msg.to_string())
    }

    /// Create an invalid state error from a displayable value.
    pub fn invalid_state<T>(msg: T) -> Self
    where
        T: Display,
    {
        Self::InvalidState(msg.to_string())
    }
}

/// A Result type alias for write-set cache operations.
pub type CacheResult<T> = Result<T, CacheError>;
