//! # Virtual File Abstraction
//!
//! The engine never touches the OS file API directly. Everything goes through
//! the `VfsFile` trait: sized growth, positional reads and writes, advisory
//! locking, durability syncs, and memory mapping. The split keeps the core
//! testable (the async writer is exercised against recording targets) and
//! concentrates every platform quirk in one module.
//!
//! ## Traits
//!
//! - `WriteTarget`: the minimal surface the background writer needs
//!   (`write_at` + `sync`). Tests substitute failing or recording targets.
//! - `VfsFile`: the full contract the store requires from its environment.
//!
//! ## Memory mapping
//!
//! The file is mapped read-only and possibly *longer than the file itself*:
//! `compute_mmap_size` picks a doubling schedule so growing the file rarely
//! forces a remap. All writes go through the file descriptor; on Linux and
//! macOS `MAP_SHARED` mappings are coherent with `write(2)`, so pages written
//! by the async writer become visible through the map without remapping.
//!
//! ## Advisory locking
//!
//! `flock` via `libc` on unix guards against two processes opening the same
//! store file. Non-unix builds treat lock/unlock as no-ops.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use eyre::{bail, ensure, Result, WrapErr};
use memmap2::{Mmap, MmapOptions};

use crate::error::StorageError;

/// Minimal write surface consumed by the asynchronous writer.
pub trait WriteTarget: Send + Sync {
    fn write_at(&self, buf: &[u8], offset: u64) -> Result<()>;
    fn sync(&self) -> Result<()>;
}

/// Full virtual-file contract required from the environment.
pub trait VfsFile: WriteTarget {
    fn size(&self) -> Result<u64>;
    fn truncate(&self, len: u64) -> Result<()>;
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<()>;
    /// Advisory whole-file lock. Non-blocking acquisition failure is an error.
    fn lock(&self, exclusive: bool, blocking: bool) -> Result<()>;
    fn unlock(&self) -> Result<()>;
    fn mmap(&self, len: usize) -> Result<MmapRegion>;
}

/// OS-backed implementation of [`VfsFile`].
#[derive(Debug)]
pub struct OsFile {
    file: File,
    path: PathBuf,
}

impl OsFile {
    /// Opens the file read-write, creating it if it does not exist.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .wrap_err_with(|| format!("failed to open store file '{}'", path.display()))?;

        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl WriteTarget for OsFile {
    fn write_at(&self, buf: &[u8], offset: u64) -> Result<()> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::FileExt;
            self.file.write_all_at(buf, offset).wrap_err_with(|| {
                format!(
                    "failed to write {} bytes at offset {} in '{}'",
                    buf.len(),
                    offset,
                    self.path.display()
                )
            })
        }
        #[cfg(not(unix))]
        {
            use std::io::{Seek, SeekFrom, Write};
            let mut f = &self.file;
            f.seek(SeekFrom::Start(offset))
                .and_then(|_| f.write_all(buf))
                .wrap_err_with(|| {
                    format!(
                        "failed to write {} bytes at offset {} in '{}'",
                        buf.len(),
                        offset,
                        self.path.display()
                    )
                })
        }
    }

    fn sync(&self) -> Result<()> {
        self.file
            .sync_data()
            .wrap_err_with(|| format!("failed to sync '{}'", self.path.display()))
    }
}

impl VfsFile for OsFile {
    fn size(&self) -> Result<u64> {
        let meta = self
            .file
            .metadata()
            .wrap_err_with(|| format!("failed to stat '{}'", self.path.display()))?;
        Ok(meta.len())
    }

    fn truncate(&self, len: u64) -> Result<()> {
        self.file
            .set_len(len)
            .wrap_err_with(|| format!("failed to resize '{}' to {} bytes", self.path.display(), len))
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::FileExt;
            self.file.read_exact_at(buf, offset).wrap_err_with(|| {
                format!(
                    "failed to read {} bytes at offset {} from '{}'",
                    buf.len(),
                    offset,
                    self.path.display()
                )
            })
        }
        #[cfg(not(unix))]
        {
            use std::io::{Read, Seek, SeekFrom};
            let mut f = &self.file;
            f.seek(SeekFrom::Start(offset))
                .and_then(|_| f.read_exact(buf))
                .wrap_err_with(|| {
                    format!(
                        "failed to read {} bytes at offset {} from '{}'",
                        buf.len(),
                        offset,
                        self.path.display()
                    )
                })
        }
    }

    #[cfg(unix)]
    fn lock(&self, exclusive: bool, blocking: bool) -> Result<()> {
        use std::os::unix::io::AsRawFd;

        let mut op = if exclusive {
            libc::LOCK_EX
        } else {
            libc::LOCK_SH
        };
        if !blocking {
            op |= libc::LOCK_NB;
        }

        // SAFETY: flock on a valid owned fd; the fd stays open for the
        // lifetime of self, and flock does not touch process memory.
        let rc = unsafe { libc::flock(self.file.as_raw_fd(), op) };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            bail!(
                "failed to acquire {} lock on '{}': {}",
                if exclusive { "exclusive" } else { "shared" },
                self.path.display(),
                err
            );
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn lock(&self, _exclusive: bool, _blocking: bool) -> Result<()> {
        Ok(())
    }

    #[cfg(unix)]
    fn unlock(&self) -> Result<()> {
        use std::os::unix::io::AsRawFd;

        // SAFETY: see lock(); LOCK_UN on an owned fd is always well-defined.
        let rc = unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_UN) };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            bail!("failed to release lock on '{}': {}", self.path.display(), err);
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn unlock(&self) -> Result<()> {
        Ok(())
    }

    fn mmap(&self, len: usize) -> Result<MmapRegion> {
        ensure!(len > 0, "mmap length must be non-zero");

        // SAFETY: Mmap::map is unsafe because the file could be modified
        // externally. This is safe because:
        // 1. The store file is flock-protected against other processes.
        // 2. The mapping is read-only; all mutation goes through the fd and
        //    MAP_SHARED keeps the view coherent.
        // 3. Access is bounds-checked by MmapRegion::page against both the
        //    mapped length and the caller-tracked file extent.
        let map = unsafe {
            MmapOptions::new()
                .len(len)
                .map(&self.file)
                .wrap_err_with(|| {
                    format!("failed to memory-map '{}' ({} bytes)", self.path.display(), len)
                })?
        };

        Ok(MmapRegion { map, len })
    }
}

/// Read-only view over the mapped store file.
#[derive(Debug)]
pub struct MmapRegion {
    map: Mmap,
    len: usize,
}

impl MmapRegion {
    /// Mapped length; may exceed the current file size.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Slice of one page. The caller must only request pages that lie inside
    /// the current file extent; pages inside the mapping but past end-of-file
    /// would fault on access.
    pub fn page(&self, id: crate::region::PageId, page_size: u32) -> Result<&[u8]> {
        let offset = id as usize * page_size as usize;
        ensure!(
            offset + page_size as usize <= self.len,
            StorageError::InvalidPageId { id }
        );
        Ok(&self.map[offset..offset + page_size as usize])
    }

    /// Hints the kernel that a page range is about to be read.
    #[cfg(unix)]
    pub fn prefetch(&self, id: crate::region::PageId, count: u32, page_size: u32) {
        let offset = id as usize * page_size as usize;
        let len = count as usize * page_size as usize;
        if offset + len > self.len {
            return;
        }
        // SAFETY: madvise is a hint; the range was bounds-checked against the
        // mapping above and the mapping is valid for self's lifetime.
        unsafe {
            libc::madvise(
                self.map.as_ptr().add(offset) as *mut libc::c_void,
                len,
                libc::MADV_WILLNEED,
            );
        }
    }

    #[cfg(not(unix))]
    pub fn prefetch(&self, _id: crate::region::PageId, _count: u32, _page_size: u32) {}
}

const MIN_MMAP_SIZE: u64 = 64 * 1024;
const GIB: u64 = 1 << 30;

/// Picks the mapping size for a file of `min` bytes with an optional `max`
/// limit. Below 1 GiB the size doubles (next power of two, floor 64 KiB);
/// above it grows in whole-GiB steps. When a maximum is configured the whole
/// limit is mapped up front so the file never needs a remap.
pub fn compute_mmap_size(min: u64, max: u64, page_size: u32) -> Result<u64> {
    if max > 0 {
        ensure!(
            min <= max,
            "file size {} exceeds the configured maximum of {} bytes",
            min,
            max
        );
        let pages = max.div_ceil(page_size as u64);
        return Ok((pages * page_size as u64).max(MIN_MMAP_SIZE));
    }

    let want = min.max(MIN_MMAP_SIZE);
    let sized = if want < GIB {
        want.next_power_of_two()
    } else {
        want.div_ceil(GIB) * GIB
    };
    Ok(sized)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const KB: u64 = 1 << 10;
    const MB: u64 = 1 << 20;
    const GB: u64 = 1 << 30;

    #[test]
    fn mmap_sizing_schedule() {
        let cases = [
            (64, 0, 64 * KB),
            (4 * KB, 0, 64 * KB),
            (100 * KB, 0, 128 * KB),
            (5 * MB, 0, 8 * MB),
            (300 * MB, 0, 512 * MB),
            (1200 * MB, 0, 2 * GB),
            (2100 * MB, 0, 3 * GB),
        ];
        for (min, max, expected) in cases {
            let got = compute_mmap_size(min, max, 4096).unwrap();
            assert_eq!(got, expected, "min={min} max={max}");
        }
    }

    #[test]
    fn mmap_sizing_with_configured_maximum() {
        assert_eq!(compute_mmap_size(0, 10 * MB, 4096).unwrap(), 10 * MB);
        assert_eq!(compute_mmap_size(MB, 10 * MB, 4096).unwrap(), 10 * MB);
        assert!(compute_mmap_size(11 * MB, 10 * MB, 4096).is_err());
    }

    #[test]
    fn write_then_size() {
        let dir = tempdir().unwrap();
        let f = OsFile::open(dir.path().join("test.dat")).unwrap();

        f.write_at(&[1, 2, 3, 4, 5, 6, 7, 8, 9, 10], 0).unwrap();
        assert_eq!(f.size().unwrap(), 10);
    }

    #[test]
    fn read_back_what_was_written() {
        let dir = tempdir().unwrap();
        let f = OsFile::open(dir.path().join("test.dat")).unwrap();

        f.write_at(b"pagestore", 100).unwrap();
        let mut buf = [0u8; 9];
        f.read_at(&mut buf, 100).unwrap();
        assert_eq!(&buf, b"pagestore");
    }

    #[test]
    fn lock_and_unlock_succeed() {
        let dir = tempdir().unwrap();
        let f = OsFile::open(dir.path().join("test.dat")).unwrap();

        f.lock(true, false).unwrap();
        f.unlock().unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn locking_a_locked_file_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.dat");

        let f1 = OsFile::open(&path).unwrap();
        let f2 = OsFile::open(&path).unwrap();

        f1.lock(true, false).unwrap();
        assert!(f2.lock(true, false).is_err());
        f1.unlock().unwrap();
    }

    #[test]
    fn mmap_reflects_file_contents() {
        let dir = tempdir().unwrap();
        let f = OsFile::open(dir.path().join("test.dat")).unwrap();

        f.truncate(4096).unwrap();
        f.write_at(&[1, 2, 3, 4, 5, 6, 7, 8, 9, 10], 0).unwrap();

        let region = f.mmap(4096).unwrap();
        let page = region.page(0, 4096).unwrap();
        assert_eq!(&page[..10], &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);
    }

    #[test]
    fn mmap_page_out_of_bounds() {
        let dir = tempdir().unwrap();
        let f = OsFile::open(dir.path().join("test.dat")).unwrap();
        f.truncate(8192).unwrap();

        let region = f.mmap(8192).unwrap();
        assert!(region.page(1, 4096).is_ok());
        assert!(region.page(2, 4096).is_err());
    }

    #[test]
    fn prefetch_hints_are_bounds_checked() {
        let dir = tempdir().unwrap();
        let f = OsFile::open(dir.path().join("test.dat")).unwrap();
        f.truncate(8192).unwrap();
        f.write_at(&[0x5A; 32], 0).unwrap();

        let region = f.mmap(8192).unwrap();
        region.prefetch(0, 2, 4096);
        // a range past the mapping is silently ignored
        region.prefetch(1, 4, 4096);

        let page = region.page(0, 4096).unwrap();
        assert_eq!(&page[..32], &[0x5A; 32]);
    }

    #[test]
    fn writes_through_fd_visible_in_existing_mapping() {
        let dir = tempdir().unwrap();
        let f = OsFile::open(dir.path().join("test.dat")).unwrap();
        f.truncate(4096).unwrap();

        let region = f.mmap(4096).unwrap();
        f.write_at(&[0xAB; 16], 64).unwrap();

        let page = region.page(0, 4096).unwrap();
        assert_eq!(&page[64..80], &[0xAB; 16]);
    }
}
