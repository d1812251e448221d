//! # Error Taxonomy
//!
//! Typed error values raised through `eyre` so callers can both read a rich
//! context chain and `downcast_ref` to a concrete kind when they need to make
//! a decision (retry, rollback, give up).
//!
//! ## Recovery semantics
//!
//! | Error | Severity | Expected reaction |
//! |-------|----------|-------------------|
//! | `InvalidPageSize` | fatal for `open` | fix the configuration |
//! | `CorruptHeader` | per-slot | fall back to the alternate meta slot |
//! | `NoValidMetaPage` | fatal | file is unusable, report to operator |
//! | `SizeLimitExceeded` | transaction-local | rollback, retry with more capacity |
//! | `ReadOnlyViolation` | local | caller bug, use a write transaction |
//! | `InvalidPageId` | local | caller bug |
//! | `LockUnavailable` | non-fatal | retry or abort |
//!
//! I/O errors from the underlying file or the background writer are not
//! wrapped in a dedicated variant; they surface verbatim through the eyre
//! context chain of `commit`/`checkpoint`.

use std::fmt;

use crate::region::PageId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageError {
    /// Page size is not a power of two or below the supported minimum.
    InvalidPageSize { size: u32 },
    /// Magic, version, or checksum mismatch in a meta page slot.
    CorruptHeader { reason: &'static str },
    /// Neither meta page slot passed validation; the file is unusable.
    NoValidMetaPage,
    /// Allocation would grow the file past the configured maximum size.
    SizeLimitExceeded { requested: u32, max_pages: u32 },
    /// Mutating operation attempted on a read-only transaction.
    ReadOnlyViolation,
    /// Page id is reserved, unallocated, or outside the snapshot bounds.
    InvalidPageId { id: PageId },
    /// Exclusive lock cannot be taken while shared holders remain.
    LockUnavailable,
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::InvalidPageSize { size } => {
                write!(f, "invalid page size {size}: must be a power of two >= 512")
            }
            StorageError::CorruptHeader { reason } => {
                write!(f, "corrupt meta page header: {reason}")
            }
            StorageError::NoValidMetaPage => {
                write!(f, "no valid meta page found in either slot")
            }
            StorageError::SizeLimitExceeded {
                requested,
                max_pages,
            } => {
                write!(
                    f,
                    "allocation of {requested} page(s) exceeds the configured maximum of {max_pages} pages"
                )
            }
            StorageError::ReadOnlyViolation => {
                write!(f, "operation requires a writable transaction")
            }
            StorageError::InvalidPageId { id } => {
                write!(f, "invalid page id {id}")
            }
            StorageError::LockUnavailable => {
                write!(f, "exclusive lock unavailable while shared locks are held")
            }
        }
    }
}

impl std::error::Error for StorageError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_mentions_the_offending_value() {
        let err = StorageError::InvalidPageSize { size: 1000 };
        assert!(err.to_string().contains("1000"));

        let err = StorageError::InvalidPageId { id: 7 };
        assert!(err.to_string().contains('7'));
    }

    #[test]
    fn downcast_through_eyre_report() {
        let report = eyre::Report::new(StorageError::NoValidMetaPage);
        assert_eq!(
            report.downcast_ref::<StorageError>(),
            Some(&StorageError::NoValidMetaPage)
        );
    }
}
