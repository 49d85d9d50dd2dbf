use std::fmt::Display;

/// A specialized error type for the encrypted-mapping layer.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum EncMapError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Configuration value was invalid.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// An access fell outside the mapped range.
    #[error("out of bounds: offset {offset} + len {len} exceeds mapping of {size} bytes")]
    OutOfBounds {
        offset: usize,
        len: usize,
        size: usize,
    },
    /// Supplied key has the wrong length.
    #[error("invalid key length: expected {expected}, found {found}")]
    InvalidKeyLength { expected: usize, found: usize },
    /// Invalid state transition or operation.
    #[error("invalid state: {0}")]
    InvalidState(String),
}

impl EncMapError {
    /// Create an invalid configuration error from a displayable value.
    pub fn invalid_config<T>(msg: T) -> Self
    where
        T: Display,
    {
        Self::InvalidConfig(msg.to_string())
    }

    /// Create an invalid state error from a displayable value.
    pub fn invalid_state<T>(msg: T) -> Self
    where
        T: Display,
    {
        Self::InvalidState(msg.to_string())
    }
}

/// A Result type alias for encrypted-mapping operations.
pub type EncMapResult<T> = Result<T, EncMapError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_config_helper() {
        let err = EncMapError::invalid_config("bad page size");
        assert!(matches!(err, EncMapError::InvalidConfig(msg) if msg == "bad page size"));
    }
}
