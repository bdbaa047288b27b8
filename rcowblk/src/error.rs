// SPDX-License-Identifier: MIT

use rcowio::error::IoBackendError;
use thiserror::Error;

/// Result type for block operations.
pub type BlockResult<T = ()> = Result<T, BlockError>;

/// The closed error set of the block stack.
#[derive(Debug, Error)]
pub enum BlockError {
    #[error("incomplete parameters")]
    IncompleteParameters,

    #[error("no driver found for format {0:?}")]
    UnknownFormat(String),

    #[error("no {0} permission")]
    PermissionDenied(&'static str),

    #[error("misaligned request")]
    Misaligned,

    #[error("index is out of range")]
    OutOfRange,

    #[error("allocating L2 table failed")]
    L2AllocFailed,

    #[error("allocating refcount block failed")]
    RefcountAllocFailed,

    /// Corruption or a mis-aligned on-disk pointer (the `EIO` analogue).
    /// The image stays open for inspection.
    #[error("image is corrupt: {0}")]
    CorruptImage(&'static str),

    /// A size computation left the addressable range (`E2BIG`/`EFBIG`).
    #[error("size exceeds the supported maximum")]
    TooBig,

    /// Arithmetic overflow or an out-of-range operand (`EINVAL`).
    #[error("invalid argument")]
    InvalidArgument,

    /// The driver does not implement the operation (`ENOTSUP`).
    #[error("operation not supported")]
    NotSupported,

    /// Retryable; strictly internal to the refcount engine. Loops consume it
    /// and it never crosses the public API.
    #[error("internal retry")]
    Again,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<IoBackendError> for BlockError {
    fn from(e: IoBackendError) -> Self {
        match e {
            IoBackendError::Io(e) => BlockError::Io(e),
            IoBackendError::OutOfBounds => BlockError::CorruptImage("access out of bounds"),
            IoBackendError::Unsupported => BlockError::NotSupported,
        }
    }
}

impl BlockError {
    /// Whether this is the internal retry sentinel.
    #[inline]
    pub fn is_again(&self) -> bool {
        matches!(self, BlockError::Again)
    }

    #[inline]
    pub fn is_not_supported(&self) -> bool {
        matches!(self, BlockError::NotSupported)
    }
}
