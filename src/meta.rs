//! # Meta Page Codec
//!
//! The meta page is the root record of the store file: geometry, area end
//! markers, the free-list and WAL chain roots, the caller-visible root page,
//! and a generation counter, all protected by a CRC64 checksum.
//!
//! ## Double buffering
//!
//! Two fixed slots exist, pages 0 and 1. A commit always writes the *inactive*
//! slot, so a crash mid-write can only damage the slot that was not the source
//! of truth. On open both slots are validated independently:
//!
//! - exactly one valid: use it
//! - both valid: the higher generation wins
//! - neither valid: `NoValidMetaPage`, the file is unusable
//!
//! Slot selection is a pure function over the two validation results
//! (`select_active`), no mutable slot index is involved.
//!
//! ## Header layout (88 bytes, little endian)
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  ---------------------------------------------
//! 0       8     magic
//! 8       4     version
//! 12      4     page_size
//! 16      8     max_size (bytes, 0 = unbounded)
//! 24      4     root          caller-visible entry page
//! 28      4     freelist_root first free-list chain page (0 = none)
//! 32      4     wal_root      first WAL mapping chain page (0 = none)
//! 36      4     data_end      one past highest data-area page
//! 40      4     meta_end      one past highest meta-area page
//! 44      4     meta_total    pages ever claimed by the meta area
//! 48      8     generation    transaction counter, selects the slot
//! 56      8     checksum      CRC64 over the header, checksum zeroed
//! 64      24    reserved
//! ```

use crc::{Crc, CRC_64_ECMA_182};
use eyre::{bail, ensure, Result};
use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::error::StorageError;
use crate::region::PageId;

pub const META_MAGIC: &[u8; 8] = b"PGSTORE\x01";
pub const META_VERSION: u32 = 1;
pub const META_HEADER_SIZE: usize = 88;

/// The two fixed meta page slots.
pub const META_SLOT_COUNT: u32 = 2;

const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

/// Which of the two meta slots a header lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaSlot {
    SlotA,
    SlotB,
}

impl MetaSlot {
    pub fn page_id(self) -> PageId {
        match self {
            MetaSlot::SlotA => 0,
            MetaSlot::SlotB => 1,
        }
    }

    pub fn other(self) -> MetaSlot {
        match self {
            MetaSlot::SlotA => MetaSlot::SlotB,
            MetaSlot::SlotB => MetaSlot::SlotA,
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct MetaPage {
    magic: [u8; 8],
    version: U32,
    page_size: U32,
    max_size: U64,
    root: U32,
    freelist_root: U32,
    wal_root: U32,
    data_end: U32,
    meta_end: U32,
    meta_total: U32,
    generation: U64,
    checksum: U64,
    reserved: [u8; 24],
}

const _: () = assert!(std::mem::size_of::<MetaPage>() == META_HEADER_SIZE);

impl MetaPage {
    /// Populates all geometry fields and zeroes the checksum. The header does
    /// not validate until `finalize` is called.
    pub fn init(root: PageId, page_size: u32, max_size: u64) -> Self {
        Self {
            magic: *META_MAGIC,
            version: U32::new(META_VERSION),
            page_size: U32::new(page_size),
            max_size: U64::new(max_size),
            root: U32::new(root),
            freelist_root: U32::new(0),
            wal_root: U32::new(0),
            data_end: U32::new(META_SLOT_COUNT),
            meta_end: U32::new(META_SLOT_COUNT),
            meta_total: U32::new(0),
            generation: U64::new(0),
            checksum: U64::new(0),
            reserved: [0u8; 24],
        }
    }

    /// Computes and stores the checksum over the full header, excluding the
    /// checksum field itself.
    pub fn finalize(&mut self) {
        self.checksum = U64::new(self.compute_checksum());
    }

    /// Fails with `CorruptHeader` if magic, version, or checksum mismatch.
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.magic == *META_MAGIC,
            StorageError::CorruptHeader {
                reason: "magic mismatch"
            }
        );
        ensure!(
            self.version.get() == META_VERSION,
            StorageError::CorruptHeader {
                reason: "unsupported version"
            }
        );
        ensure!(
            self.checksum.get() != 0 && self.checksum.get() == self.compute_checksum(),
            StorageError::CorruptHeader {
                reason: "checksum mismatch"
            }
        );
        Ok(())
    }

    fn compute_checksum(&self) -> u64 {
        let mut copy = *self;
        copy.checksum = U64::new(0);
        CRC64.checksum(copy.as_bytes())
    }

    /// Parses a header from the front of a page buffer without validating.
    pub fn read_from(bytes: &[u8]) -> Result<Self> {
        ensure!(
            bytes.len() >= META_HEADER_SIZE,
            "buffer too small for meta page header: {} < {}",
            bytes.len(),
            META_HEADER_SIZE
        );
        MetaPage::read_from_bytes(&bytes[..META_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to parse meta page header: {e:?}"))
    }

    pub fn page_size(&self) -> u32 {
        self.page_size.get()
    }

    pub fn max_size(&self) -> u64 {
        self.max_size.get()
    }

    pub fn root(&self) -> PageId {
        self.root.get()
    }

    pub fn set_root(&mut self, id: PageId) {
        self.root = U32::new(id);
    }

    pub fn freelist_root(&self) -> PageId {
        self.freelist_root.get()
    }

    pub fn set_freelist_root(&mut self, id: PageId) {
        self.freelist_root = U32::new(id);
    }

    pub fn wal_root(&self) -> PageId {
        self.wal_root.get()
    }

    pub fn set_wal_root(&mut self, id: PageId) {
        self.wal_root = U32::new(id);
    }

    pub fn data_end(&self) -> PageId {
        self.data_end.get()
    }

    pub fn set_data_end(&mut self, id: PageId) {
        self.data_end = U32::new(id);
    }

    pub fn meta_end(&self) -> PageId {
        self.meta_end.get()
    }

    pub fn set_meta_end(&mut self, id: PageId) {
        self.meta_end = U32::new(id);
    }

    pub fn meta_total(&self) -> u32 {
        self.meta_total.get()
    }

    pub fn set_meta_total(&mut self, total: u32) {
        self.meta_total = U32::new(total);
    }

    pub fn generation(&self) -> u64 {
        self.generation.get()
    }

    pub fn set_generation(&mut self, generation: u64) {
        self.generation = U64::new(generation);
    }
}

/// Picks the active slot from the two candidates read at open time. Pure
/// selection: exactly-one-valid wins outright, both-valid resolves by the
/// higher generation, neither-valid is fatal.
pub fn select_active(a: &MetaPage, b: &MetaPage) -> Result<(MetaSlot, MetaPage)> {
    let a_valid = a.validate().is_ok();
    let b_valid = b.validate().is_ok();

    match (a_valid, b_valid) {
        (true, true) => {
            if b.generation() > a.generation() {
                Ok((MetaSlot::SlotB, *b))
            } else {
                Ok((MetaSlot::SlotA, *a))
            }
        }
        (true, false) => Ok((MetaSlot::SlotA, *a)),
        (false, true) => Ok((MetaSlot::SlotB, *b)),
        (false, false) => bail!(StorageError::NoValidMetaPage),
    }
}
