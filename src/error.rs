use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt;

pub type Result<T> = std::result::Result<T, PoolingError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Missing columns/rows in instrument tables or in the ledger.
    MalformedInput,
    /// Slot assignment produced a duplicate or out-of-range slot.
    CapacityViolation,
    InvalidParameter,
    NotFound,
    Io,
    Internal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolingError {
    pub code: ErrorCode,
    pub message: String,
}

impl PoolingError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::MalformedInput, message)
    }

    pub fn capacity(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::CapacityViolation, message)
    }

    pub fn parameter(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidParameter, message)
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Io, message)
    }
}

impl fmt::Display for PoolingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

impl Error for PoolingError {}

impl From<std::io::Error> for PoolingError {
    fn from(err: std::io::Error) -> Self {
        PoolingError::io(err.to_string())
    }
}

impl From<csv::Error> for PoolingError {
    fn from(err: csv::Error) -> Self {
        if err.is_io_error() {
            PoolingError::io(err.to_string())
        } else {
            PoolingError::malformed(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_code() {
        let err = PoolingError::malformed("ledger has no PlateID column");
        assert_eq!(err.to_string(), "MalformedInput: ledger has no PlateID column");
    }

    #[test]
    fn test_io_error_conversion() {
        let err: PoolingError = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
        assert_eq!(err.code, ErrorCode::Io);
    }
}
