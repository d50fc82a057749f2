//! Engine error taxonomy with stable numeric codes.

use crate::{PageId, SpaceId};
use thiserror::Error;

/// Result alias used by every fallible engine operation.
pub type DbResult<T> = Result<T, DbError>;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("out of file space")]
    OutOfFileSpace,

    /// Fatal for the affected page unless the doublewrite buffer restores it.
    #[error("page {page_id} is corrupted")]
    Corruption { page_id: PageId },

    #[error("tablespace {space} has been deleted")]
    TablespaceDeleted { space: SpaceId },

    #[error("lock wait")]
    LockWait,

    #[error("lock wait timeout")]
    LockWaitTimeout,

    #[error("deadlock; transaction chosen as victim")]
    Deadlock,

    #[error("total number of locks exceeds the lock table size")]
    LockTableFull,

    #[error("duplicate key")]
    DuplicateKey,

    #[error("row is referenced")]
    RowIsReferenced,

    #[error("no referenced row")]
    NoReferencedRow,

    #[error("out of memory")]
    OutOfMemory,

    #[error("too many concurrent transactions")]
    TooManyConcurrentTrxs,

    /// MVCC cannot reconstruct the requested row version; the history was
    /// already purged. Reported to the caller, not fatal.
    #[error("missing history: the requested row version has been purged")]
    MissingHistory,

    #[error("interrupted")]
    Interrupted,

    /// The record does not fit in-page and must be stored externally.
    #[error("record of {size} bytes exceeds the in-page maximum of {max}")]
    RecordTooBig { size: usize, max: usize },

    /// Invariant violation. The engine requests shutdown.
    #[error("panic: {0}")]
    Panic(String),
}

impl DbError {
    /// Stable small-integer code for each error class.
    pub fn code(&self) -> u32 {
        match self {
            DbError::Io(_) => 1,
            DbError::OutOfFileSpace => 2,
            DbError::Corruption { .. } => 3,
            DbError::TablespaceDeleted { .. } => 4,
            DbError::LockWait => 10,
            DbError::LockWaitTimeout => 11,
            DbError::Deadlock => 12,
            DbError::LockTableFull => 13,
            DbError::DuplicateKey => 14,
            DbError::RowIsReferenced => 15,
            DbError::NoReferencedRow => 16,
            DbError::OutOfMemory => 20,
            DbError::TooManyConcurrentTrxs => 21,
            DbError::MissingHistory => 22,
            DbError::Interrupted => 23,
            DbError::RecordTooBig { .. } => 24,
            DbError::Panic(_) => 99,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, DbError::Panic(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(DbError::Deadlock.code(), 12);
        assert_eq!(DbError::DuplicateKey.code(), 14);
        assert_eq!(DbError::MissingHistory.code(), 22);
        assert_eq!(DbError::Panic("x".into()).code(), 99);
    }

    #[test]
    fn only_panic_is_fatal() {
        assert!(DbError::Panic("bad".into()).is_fatal());
        assert!(!DbError::LockWaitTimeout.is_fatal());
        assert!(!DbError::Corruption { page_id: crate::PageId::new(0, 7) }.is_fatal());
    }
}
