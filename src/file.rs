//! # Store File
//!
//! `File` is the top of the engine: it owns the OS file, the memory mapping,
//! the background writer, the transaction lock, and the last committed
//! snapshot. Transactions are handed a clone of that snapshot and never touch
//! shared state until their commit publishes a new one.
//!
//! ## Open protocol
//!
//! ```text
//!  flock ──> read both meta slots ──> select_active ──> rebuild free lists
//!    │                                                  and WAL mapping
//!    └─ fresh file: write slot A (gen 1) + slot B (gen 0), sync
//! ```
//!
//! A fresh file is initialized with both meta slots so that recovery never
//! has to distinguish "never written" from "torn write". On an existing file
//! the newest valid slot wins; a single corrupted slot falls back to the
//! other one silently, which is exactly the crash-during-commit case.
//!
//! ## Shared state
//!
//! - `committed`: the snapshot cloned by every `begin`; replaced atomically
//!   under the exclusive lock at the end of a commit.
//! - `mmap`: read-only mapping, possibly longer than the file; replaced under
//!   a write lock when a commit grows past it. Readers copy pages out under a
//!   short read lock, so a remap never invalidates anything they hold.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use eyre::{ensure, Result, WrapErr};
use parking_lot::{Mutex, RwLock};
use zerocopy::IntoBytes;

use crate::alloc::{read_freelist, Allocator, Area};
use crate::error::StorageError;
use crate::lock::TxLock;
use crate::meta::{select_active, MetaPage, MetaSlot, META_HEADER_SIZE, META_SLOT_COUNT};
use crate::region::{PageId, PageSet};
use crate::tx::Tx;
use crate::vfs::{compute_mmap_size, MmapRegion, OsFile, VfsFile, WriteTarget};
use crate::wal::{read_wal, WalState};
use crate::writer::Writer;

pub const DEFAULT_PAGE_SIZE: u32 = 4096;
pub const MIN_PAGE_SIZE: u32 = 512;

/// Open-time settings. The zero value defers to the stored geometry.
#[derive(Debug, Clone, Copy, Default)]
pub struct Options {
    /// Page size in bytes, a power of two no smaller than [`MIN_PAGE_SIZE`].
    /// Zero uses the stored size for existing files and
    /// [`DEFAULT_PAGE_SIZE`] for fresh ones. A non-zero value must match the
    /// stored size when reopening.
    pub page_size: u32,
    /// Maximum file size in bytes, zero for unbounded. A non-zero value
    /// overrides the stored limit.
    pub max_size: u64,
}

/// Per-transaction settings for [`File::begin_with`].
#[derive(Debug, Clone, Copy, Default)]
pub struct TxOptions {
    pub readonly: bool,
}

/// Counters for introspection and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStats {
    pub generation: u64,
    pub root: PageId,
    pub page_size: u32,
    /// One past the highest page claimed by either area.
    pub file_pages: PageId,
    pub data_end: PageId,
    pub meta_end: PageId,
    pub free_data_pages: u32,
    pub free_meta_pages: u32,
    pub meta_total: u32,
    /// Pages currently redirected through the WAL mapping.
    pub wal_mapped: usize,
}

/// The last committed snapshot; cloned by every transaction.
#[derive(Debug, Clone)]
pub(crate) struct FileState {
    pub generation: u64,
    pub root: PageId,
    pub allocator: Allocator,
    pub wal: WalState,
    /// Meta-area pages holding the serialized free lists.
    pub freelist_pages: PageSet,
    pub active_slot: MetaSlot,
}

pub(crate) struct FileInner {
    pub vfs: Arc<OsFile>,
    pub page_size: u32,
    pub max_size: u64,
    pub mmap: RwLock<MmapRegion>,
    pub committed: Mutex<FileState>,
    pub lock: TxLock,
    pub writer: Writer,
}

impl Drop for FileInner {
    fn drop(&mut self) {
        self.writer.stop();
        let _ = self.vfs.unlock();
    }
}

/// A transactional page store backed by a single file.
pub struct File {
    inner: Arc<FileInner>,
}

impl std::fmt::Debug for File {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("File").finish_non_exhaustive()
    }
}

impl File {
    /// Opens or creates the store file at `path`.
    pub fn open<P: AsRef<Path>>(path: P, options: Options) -> Result<File> {
        if options.page_size != 0 {
            validate_page_size(options.page_size)?;
        }

        let vfs = Arc::new(OsFile::open(path)?);
        vfs.lock(true, false)
            .wrap_err("store file is in use by another process")?;

        if vfs.size()? == 0 {
            let page_size = if options.page_size != 0 {
                options.page_size
            } else {
                DEFAULT_PAGE_SIZE
            };
            init_store(vfs.as_ref(), page_size, options.max_size)?;
        }

        let (active_slot, meta) = load_active_meta(vfs.as_ref(), options.page_size)?;
        let page_size = meta.page_size();
        validate_page_size(page_size).wrap_err("stored page size is invalid")?;
        ensure!(
            options.page_size == 0 || options.page_size == page_size,
            StorageError::InvalidPageSize {
                size: options.page_size
            }
        );

        let max_size = if options.max_size != 0 {
            options.max_size
        } else {
            meta.max_size()
        };
        let max_pages = if max_size == 0 {
            0
        } else {
            (max_size / page_size as u64).min(u32::MAX as u64) as u32
        };
        ensure!(
            max_pages == 0 || max_pages > META_SLOT_COUNT,
            "maximum size of {} bytes leaves no allocatable pages",
            max_size
        );
        let file_end = meta.data_end().max(meta.meta_end());
        ensure!(
            max_pages == 0 || file_end <= max_pages,
            StorageError::SizeLimitExceeded {
                requested: file_end,
                max_pages,
            }
        );

        let map_len = compute_mmap_size(vfs.size()?, max_size, page_size)?;
        let mmap = vfs.mmap(map_len as usize)?;
        // the chain walks below touch pages scattered across the file
        mmap.prefetch(0, file_end, page_size);

        let (meta_free, data_free, freelist_pages) = read_freelist(
            |id| Ok(mmap.page(id, page_size)?.to_vec()),
            meta.freelist_root(),
            meta.meta_end(),
            meta.data_end(),
        )
        .wrap_err("failed to rebuild the free lists")?;
        let wal = read_wal(
            |id| Ok(mmap.page(id, page_size)?.to_vec()),
            meta.wal_root(),
            meta.data_end(),
        )
        .wrap_err("failed to rebuild the WAL mapping")?;

        let allocator = Allocator {
            data: Area::with_state(meta.data_end(), data_free),
            meta: Area::with_state(meta.meta_end(), meta_free),
            meta_total: meta.meta_total(),
            max_pages,
        };
        let state = FileState {
            generation: meta.generation(),
            root: meta.root(),
            allocator,
            wal,
            freelist_pages,
            active_slot,
        };

        let writer = Writer::spawn(Arc::clone(&vfs) as Arc<dyn WriteTarget>)?;

        Ok(File {
            inner: Arc::new(FileInner {
                vfs,
                page_size,
                max_size,
                mmap: RwLock::new(mmap),
                committed: Mutex::new(state),
                lock: TxLock::new(),
                writer,
            }),
        })
    }

    /// Starts a read-write transaction. Blocks while another writer is
    /// active; readers are unaffected.
    pub fn begin(&self) -> Tx {
        self.begin_with(TxOptions { readonly: false })
    }

    /// Starts a read-only snapshot transaction.
    pub fn begin_readonly(&self) -> Tx {
        self.begin_with(TxOptions { readonly: true })
    }

    pub fn begin_with(&self, options: TxOptions) -> Tx {
        if options.readonly {
            self.inner.lock.lock_shared();
        } else {
            self.inner.lock.lock_reserved();
        }
        // snapshot after the lock so a writer sees the newest commit
        let snapshot = self.inner.committed.lock().clone();
        Tx::new(Arc::clone(&self.inner), snapshot, options.readonly)
    }

    pub fn page_size(&self) -> u32 {
        self.inner.page_size
    }

    pub fn path(&self) -> PathBuf {
        self.inner.vfs.path().to_path_buf()
    }

    pub fn stats(&self) -> FileStats {
        let state = self.inner.committed.lock();
        FileStats {
            generation: state.generation,
            root: state.root,
            page_size: self.inner.page_size,
            file_pages: state.allocator.file_end(),
            data_end: state.allocator.data.end_marker,
            meta_end: state.allocator.meta.end_marker,
            free_data_pages: state.allocator.data.free_pages(),
            free_meta_pages: state.allocator.meta.free_pages(),
            meta_total: state.allocator.meta_total,
            wal_mapped: state.wal.len(),
        }
    }

    /// Stops the writer and syncs outstanding data. Dropping the last handle
    /// does the same, minus the error report.
    pub fn close(self) -> Result<()> {
        self.inner.writer.stop();
        self.inner.vfs.sync()
    }
}

fn validate_page_size(size: u32) -> Result<()> {
    ensure!(
        size >= MIN_PAGE_SIZE && size.is_power_of_two(),
        StorageError::InvalidPageSize { size }
    );
    Ok(())
}

/// Writes both meta slots of a brand-new store file and syncs. Slot A gets
/// generation 1 and becomes active, slot B generation 0.
fn init_store(vfs: &OsFile, page_size: u32, max_size: u64) -> Result<()> {
    validate_page_size(page_size)?;

    let mut first = MetaPage::init(0, page_size, max_size);
    first.set_generation(1);
    first.finalize();
    let mut second = MetaPage::init(0, page_size, max_size);
    second.finalize();

    let mut buf = vec![0u8; page_size as usize * META_SLOT_COUNT as usize];
    buf[..META_HEADER_SIZE].copy_from_slice(first.as_bytes());
    let off = page_size as usize;
    buf[off..off + META_HEADER_SIZE].copy_from_slice(second.as_bytes());

    vfs.truncate(page_size as u64 * META_SLOT_COUNT as u64)?;
    vfs.write_at(&buf, 0)?;
    vfs.sync()
}

/// Reads both meta slot headers and picks the active one. Slot B sits one
/// page in; when slot A is damaged its page size field cannot be trusted, so
/// the requested size or the default is used to locate B.
fn load_active_meta(vfs: &OsFile, requested_page_size: u32) -> Result<(MetaSlot, MetaPage)> {
    let mut buf = [0u8; META_HEADER_SIZE];
    vfs.read_at(&mut buf, 0).wrap_err("failed to read meta slot A")?;
    let a = MetaPage::read_from(&buf)?;

    let stored = a.page_size();
    let slot_b_offset = if requested_page_size != 0 {
        requested_page_size
    } else if stored >= MIN_PAGE_SIZE && stored.is_power_of_two() {
        stored
    } else {
        DEFAULT_PAGE_SIZE
    };

    // A short or unreadable slot B counts as corrupt, not fatal.
    let mut buf_b = [0u8; META_HEADER_SIZE];
    if vfs.read_at(&mut buf_b, slot_b_offset as u64).is_err() {
        buf_b = [0u8; META_HEADER_SIZE];
    }
    let b = MetaPage::read_from(&buf_b)?;

    select_active(&a, &b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn fresh_file_has_two_meta_pages_and_no_data() {
        let dir = tempdir().unwrap();
        let f = File::open(dir.path().join("store.dat"), Options::default()).unwrap();

        let stats = f.stats();
        assert_eq!(stats.generation, 1);
        assert_eq!(stats.root, 0);
        assert_eq!(stats.page_size, DEFAULT_PAGE_SIZE);
        assert_eq!(stats.file_pages, META_SLOT_COUNT);
        assert_eq!(stats.free_data_pages, 0);
        assert_eq!(stats.wal_mapped, 0);
        f.close().unwrap();
    }

    #[test]
    fn reopen_preserves_geometry() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.dat");

        let f = File::open(
            &path,
            Options {
                page_size: 512,
                max_size: 1 << 20,
            },
        )
        .unwrap();
        f.close().unwrap();

        let f = File::open(&path, Options::default()).unwrap();
        assert_eq!(f.page_size(), 512);
        f.close().unwrap();
    }

    #[test]
    fn invalid_page_sizes_are_rejected() {
        let dir = tempdir().unwrap();
        for size in [1u32, 256, 1000, 4095] {
            let err = File::open(
                dir.path().join("store.dat"),
                Options {
                    page_size: size,
                    max_size: 0,
                },
            )
            .unwrap_err();
            assert_eq!(
                err.downcast_ref::<StorageError>(),
                Some(&StorageError::InvalidPageSize { size })
            );
        }
    }

    #[test]
    fn reopening_with_a_different_page_size_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.dat");

        let f = File::open(
            &path,
            Options {
                page_size: 4096,
                max_size: 0,
            },
        )
        .unwrap();
        f.close().unwrap();

        let err = File::open(
            &path,
            Options {
                page_size: 8192,
                max_size: 0,
            },
        )
        .unwrap_err();
        assert!(err.downcast_ref::<StorageError>().is_some());
    }

    #[test]
    fn second_open_of_a_live_file_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.dat");

        let f = File::open(&path, Options::default()).unwrap();
        assert!(File::open(&path, Options::default()).is_err());
        f.close().unwrap();

        File::open(&path, Options::default()).unwrap();
    }

    #[test]
    fn empty_file_on_disk_is_initialized_in_place() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.dat");
        std::fs::File::create(&path).unwrap();

        let f = File::open(&path, Options::default()).unwrap();
        assert_eq!(f.stats().generation, 1);
        f.close().unwrap();
    }
}
