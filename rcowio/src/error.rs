// SPDX-License-Identifier: MIT

use core::fmt;

/// Result type for backend I/O operations.
pub type IoBackendResult<T = ()> = Result<T, IoBackendError>;

/// Error type for backend I/O operations.
#[derive(Debug)]
pub enum IoBackendError {
    /// Underlying OS I/O error.
    Io(std::io::Error),

    /// Attempted to read or write out of bounds.
    OutOfBounds,

    /// Unsupported operation.
    Unsupported,
}

impl fmt::Display for IoBackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IoBackendError::Io(e) => write!(f, "io error: {e}"),
            IoBackendError::OutOfBounds => write!(f, "out of bounds"),
            IoBackendError::Unsupported => write!(f, "unsupported operation"),
        }
    }
}

impl std::error::Error for IoBackendError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            IoBackendError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for IoBackendError {
    #[inline]
    fn from(e: std::io::Error) -> Self {
        IoBackendError::Io(e)
    }
}
