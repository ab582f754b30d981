use crate::types::{BlockNumber, RelFileId};
use thiserror::Error;

/// Crate-wide error type.
///
/// Recoverable per-tuple outcomes (visibility verdicts, update conflicts,
/// freespace misses) are modeled as typed results on the operations that
/// produce them, never as errors. The variants here cover conditions that
/// abort the current transaction or, for the fatal group, the process.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("{0}")]
    Io(#[from] std::io::Error),

    /// Fatal on-disk corruption: magic mismatch, line pointer outside the
    /// tuple area, tuple length beyond the page, unreadable status log.
    #[error("corrupted {context}: {detail}")]
    Corrupt {
        context: &'static str,
        detail: String,
    },

    /// Startup cannot proceed; carries the process exit code
    /// (2 = lock file held, 3 = owner lookup denied, 4 = foreign holder).
    #[error("startup failed ({code}): {detail}")]
    Startup { code: i32, detail: String },

    #[error("virtual file pool exhausted")]
    VfdPoolExhausted,

    #[error("no file descriptor for handle {0}")]
    InvalidFileHandle(usize),

    #[error("relation {0} is not open")]
    RelationClosed(RelFileId),

    #[error("block {block} of relation {rel} is out of bounds")]
    BlockOutOfBounds { rel: RelFileId, block: BlockNumber },

    #[error("freespace request of {0} bytes exceeds the largest tuple a page can hold")]
    OversizedRequest(usize),

    #[error("blob chain inconsistent: {0}")]
    BlobChain(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("too many temporary files requested")]
    TempFileLimit,

    #[error("too many allocated stdio files")]
    AllocatedFileLimit,

    #[error("transaction system not initialized")]
    TransamUninitialized,

    #[error("shadow log invalid: {0}")]
    ShadowLog(String),

    #[error("{0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

impl StorageError {
    /// Fatal errors terminate the process rather than the transaction.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            StorageError::Corrupt { .. } | StorageError::Startup { .. }
        )
    }

    pub(crate) fn corrupt(context: &'static str, detail: impl Into<String>) -> Self {
        StorageError::Corrupt {
            context,
            detail: detail.into(),
        }
    }
}
