//! # Transactions
//!
//! Every transaction owns a private clone of the committed snapshot plus a
//! buffer cache for the pages it touched. Readers hold a Shared lock and see
//! exactly the state of their begin point; the single writer holds Reserved
//! and mutates only its own clone until commit publishes it.
//!
//! ## Page access
//!
//! `Tx::page(id)` hands out a [`PageRef`], a handle borrowing the transaction
//! mutably. The first read copies the page out of the mapping into a
//! tx-owned buffer; later reads and all writes hit that buffer. Copying
//! instead of borrowing from the mapping keeps page contents valid across a
//! remap when a concurrent commit grows the file. Read resolution order:
//! tx buffer, then WAL shadow, then the base slot.
//!
//! ## Commit pipeline
//!
//! ```text
//!  shadow assignment ─> WAL chain ─> free-list chain ─> release freed pages
//!        │
//!        v
//!  grow file / remap ─> data+chain writes ─> barrier
//!        │
//!        v
//!  meta page to inactive slot ─> barrier ─> Pending ─> Exclusive
//!        │
//!        v
//!  publish snapshot + flip slot ─> release locks
//! ```
//!
//! Every page the transaction releases (caller frees, replaced shadows,
//! checkpoint leftovers, and the previous WAL and free-list chains)
//! re-enters the allocator only after the last allocation of the commit.
//! Until the new meta page is durable the previous slot still references
//! all of them, so a commit write landing on any such page would leave a
//! crash between the two barriers unrecoverable; the data-area ones may
//! additionally still be visible to a concurrent snapshot.
//!
//! A checkpointing commit writes original slots in place, which older
//! snapshots might still read through their mapping. Those commits take
//! Pending and Exclusive *before* scheduling any write, trading reader
//! concurrency for slot reuse.

use std::sync::Arc;

use eyre::{ensure, eyre, Result, WrapErr};
use hashbrown::hash_map::Entry;
use hashbrown::HashMap;
use smallvec::SmallVec;
use zerocopy::IntoBytes;

use crate::alloc::{freelist_pages_needed, write_freelist, FIRST_PAGE};
use crate::error::StorageError;
use crate::file::{FileInner, FileState};
use crate::meta::{MetaPage, MetaSlot, META_HEADER_SIZE};
use crate::region::{PageId, PageSet};
use crate::vfs::{compute_mmap_size, VfsFile};
use crate::wal::{wal_pages_needed, write_wal};
use crate::writer::WriteBarrier;

#[derive(Debug)]
struct PageBuf {
    data: Vec<u8>,
    dirty: bool,
    /// Write to the page's own slot instead of a shadow. Set for checkpoint
    /// folds; fresh pages are implicitly direct.
    direct: bool,
}

/// A transaction over one point-in-time snapshot of the store.
pub struct Tx {
    file: Arc<FileInner>,
    state: FileState,
    readonly: bool,
    active: bool,
    root: PageId,
    pages: HashMap<PageId, PageBuf>,
    /// Pages allocated by this transaction; invisible to every snapshot.
    fresh: PageSet,
    /// Previously committed pages freed by this transaction.
    freed: PageSet,
    /// Pages released by a checkpoint. They go back to the allocator only at
    /// commit, after every allocation, because the committed meta slot still
    /// references them.
    retired_data: PageSet,
    retired_meta: PageSet,
    checkpointed: bool,
}

impl Tx {
    pub(crate) fn new(file: Arc<FileInner>, state: FileState, readonly: bool) -> Tx {
        let root = state.root;
        Tx {
            file,
            state,
            readonly,
            active: true,
            root,
            pages: HashMap::new(),
            fresh: PageSet::new(),
            freed: PageSet::new(),
            retired_data: PageSet::new(),
            retired_meta: PageSet::new(),
            checkpointed: false,
        }
    }

    pub fn readonly(&self) -> bool {
        self.readonly
    }

    pub fn writable(&self) -> bool {
        !self.readonly
    }

    /// False once the transaction committed, rolled back, or closed.
    pub fn active(&self) -> bool {
        self.active
    }

    pub fn page_size(&self) -> u32 {
        self.file.page_size
    }

    /// The caller-visible entry page, 0 if none was ever set.
    pub fn root(&self) -> PageId {
        self.root
    }

    /// Points the store at a new entry page; becomes visible to other
    /// transactions once this one commits. Zero clears the root.
    pub fn set_root(&mut self, id: PageId) -> Result<()> {
        self.ensure_writable()?;
        if id != 0 {
            self.check_readable(id)?;
        }
        self.root = id;
        Ok(())
    }

    /// Allocates one fresh data page.
    pub fn alloc(&mut self) -> Result<PageId> {
        let ids = self.alloc_n(1)?;
        ids.first()
            .copied()
            .ok_or_else(|| eyre!("allocator returned no page"))
    }

    /// Allocates `n` data pages, lowest free ids first. The ids are not
    /// necessarily contiguous.
    pub fn alloc_n(&mut self, n: u32) -> Result<Vec<PageId>> {
        self.ensure_writable()?;
        let ids = self.state.allocator.alloc_data(n)?;
        for &id in &ids {
            self.fresh.add(id);
        }
        Ok(ids)
    }

    /// Handle to one page. Fails for id 0, the meta slots, freed pages, and
    /// ids outside the snapshot.
    pub fn page(&mut self, id: PageId) -> Result<PageRef<'_>> {
        self.ensure_active()?;
        self.check_readable(id)?;
        Ok(PageRef { tx: self, id })
    }

    /// Folds every WAL shadow back into its original slot and drops the
    /// mapping; takes effect at commit. The commit performing a checkpoint
    /// runs its writes under the exclusive lock.
    pub fn checkpoint_wal(&mut self) -> Result<()> {
        self.ensure_writable()?;
        if self.state.wal.is_empty() && self.state.wal.pages.is_empty() {
            return Ok(());
        }

        let page_size = self.file.page_size;
        let mapping = std::mem::take(&mut self.state.wal.mapping);
        for (orig, shadow) in mapping {
            if self.freed.has(orig) {
                self.retired_data.add(shadow);
                continue;
            }
            match self.pages.get_mut(&orig) {
                Some(buf) => {
                    buf.dirty = true;
                    buf.direct = true;
                }
                None => {
                    let data = {
                        let mmap = self.file.mmap.read();
                        mmap.page(shadow, page_size)?.to_vec()
                    };
                    self.pages.insert(
                        orig,
                        PageBuf {
                            data,
                            dirty: true,
                            direct: true,
                        },
                    );
                }
            }
            self.retired_data.add(shadow);
        }

        for id in self.state.wal.pages.ids() {
            self.retired_meta.add(id);
        }
        self.state.wal.pages.clear();
        self.checkpointed = true;
        Ok(())
    }

    /// Publishes the transaction's changes. On a read-only transaction this
    /// is the same as `close`. Any error means nothing was published.
    pub fn commit(&mut self) -> Result<()> {
        self.ensure_active()?;
        if self.readonly {
            self.finish();
            return Ok(());
        }

        let changed = self.checkpointed
            || self.root != self.state.root
            || !self.freed.is_empty()
            || !self.fresh.is_empty()
            || self.pages.values().any(|p| p.dirty);
        let result = if changed {
            self.commit_changes()
                .wrap_err("commit failed, the transaction was discarded")
        } else {
            Ok(())
        };
        self.finish();
        result
    }

    /// Discards all changes. No disk state is affected; writes a failed
    /// commit may already have enqueued are unreferenced and harmless.
    pub fn rollback(&mut self) -> Result<()> {
        self.ensure_active()?;
        self.finish();
        Ok(())
    }

    /// Releases the transaction. Safe to call after commit or rollback.
    pub fn close(&mut self) -> Result<()> {
        if self.active {
            self.finish();
        }
        Ok(())
    }

    fn finish(&mut self) {
        self.active = false;
        if self.readonly {
            self.file.lock.unlock_shared();
        } else {
            self.file.lock.unlock_reserved();
        }
    }

    fn ensure_active(&self) -> Result<()> {
        ensure!(self.active, "transaction already finished");
        Ok(())
    }

    fn ensure_writable(&self) -> Result<()> {
        self.ensure_active()?;
        ensure!(!self.readonly, StorageError::ReadOnlyViolation);
        Ok(())
    }

    fn check_readable(&self, id: PageId) -> Result<()> {
        ensure!(id >= FIRST_PAGE, StorageError::InvalidPageId { id });
        ensure!(!self.freed.has(id), StorageError::InvalidPageId { id });
        ensure!(
            !self.retired_data.has(id) && !self.retired_meta.has(id),
            StorageError::InvalidPageId { id }
        );
        if self.fresh.has(id) {
            return Ok(());
        }
        // the engine's own chain pages are off limits, like the meta slots
        ensure!(
            !self.state.wal.pages.has(id) && !self.state.freelist_pages.has(id),
            StorageError::InvalidPageId { id }
        );
        let alloc = &self.state.allocator;
        ensure!(
            id < alloc.file_end(),
            StorageError::InvalidPageId { id }
        );
        ensure!(
            !alloc.data.freelist.contains(id) && !alloc.meta.freelist.contains(id),
            StorageError::InvalidPageId { id }
        );
        Ok(())
    }

    fn load_page(&mut self, id: PageId) -> Result<&mut PageBuf> {
        let page_size = self.file.page_size;
        match self.pages.entry(id) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let data = if self.fresh.has(id) {
                    vec![0u8; page_size as usize]
                } else {
                    let phys = self.state.wal.resolve(id);
                    let mmap = self.file.mmap.read();
                    mmap.page(phys, page_size)?.to_vec()
                };
                Ok(entry.insert(PageBuf {
                    data,
                    dirty: false,
                    direct: false,
                }))
            }
        }
    }

    fn free_page(&mut self, id: PageId) -> Result<()> {
        self.ensure_writable()?;
        self.check_readable(id)?;
        self.pages.remove(&id);
        if self.fresh.remove(id) {
            // never visible outside this transaction, reusable right away
            self.state.allocator.free_data(id)?;
        } else {
            self.freed.add(id);
        }
        Ok(())
    }

    fn commit_changes(&mut self) -> Result<()> {
        let page_size = self.file.page_size;
        let page_bytes = page_size as u64;

        // Pages released by this transaction, including the shadows of pages
        // the caller freed. None of them may re-enter the allocator before
        // the last allocation of the commit, see the module docs.
        let mut retired_data: SmallVec<[PageId; 16]> = self.retired_data.iter().collect();
        let mut retired_meta: SmallVec<[PageId; 16]> = self.retired_meta.iter().collect();
        for id in self.freed.ids() {
            if let Some(shadow) = self.state.wal.mapping.remove(&id) {
                retired_data.push(shadow);
            }
            retired_data.push(id);
        }

        // Destination for every dirty buffer: its own slot when direct or
        // fresh, a newly allocated shadow otherwise.
        let mut dirty: SmallVec<[(PageId, bool); 16]> = self
            .pages
            .iter()
            .filter(|(_, buf)| buf.dirty)
            .map(|(&id, buf)| (id, buf.direct || self.fresh.has(id)))
            .collect();
        dirty.sort_unstable_by_key(|&(id, _)| id);

        let mut destinations: SmallVec<[(PageId, PageId); 16]> =
            SmallVec::with_capacity(dirty.len());
        for (id, direct) in dirty {
            let dest = if direct {
                id
            } else {
                if let Some(old) = self.state.wal.mapping.remove(&id) {
                    retired_data.push(old);
                }
                let shadow = self
                    .state
                    .allocator
                    .alloc_data(1)?
                    .first()
                    .copied()
                    .ok_or_else(|| eyre!("allocator returned no shadow page"))?;
                self.state.wal.mapping.insert(id, shadow);
                shadow
            };
            destinations.push((id, dest));
        }

        // Rewrite the WAL chain. The new chain is allocated while the old
        // chain pages are still marked used, so the two generations never
        // overlap on disk.
        let mut chain_writes: Vec<(PageId, Vec<u8>)> = Vec::new();
        retired_meta.extend(self.state.wal.pages.iter());
        self.state.wal.pages.clear();
        let mut wal_root = 0;
        if !self.state.wal.is_empty() {
            let needed = wal_pages_needed(self.state.wal.len(), page_size);
            let chain = self.state.allocator.alloc_meta(needed)?;
            chain_writes.extend(write_wal(&self.state.wal.mapping, &chain, page_size)?);
            wal_root = chain.first().copied().unwrap_or(0);
            self.state.wal.pages = chain.iter().copied().collect();
        }

        // The free-list chain is sized for the state after the retired pages
        // come back, but allocated before they do. Every returned page adds
        // at most one region, so the bound never under-counts.
        retired_meta.extend(self.state.freelist_pages.iter());
        self.state.freelist_pages.clear();
        let mut freelist_root = 0;
        let entry_bound = self.state.allocator.meta.freelist.len()
            + self.state.allocator.data.freelist.len()
            + retired_data.len()
            + retired_meta.len();
        let freelist_chain = if entry_bound > 0 {
            self.state
                .allocator
                .alloc_meta(freelist_pages_needed(entry_bound, page_size))?
        } else {
            Vec::new()
        };

        for id in retired_data {
            self.state.allocator.free_data(id)?;
        }
        for id in retired_meta {
            self.state.allocator.free_meta(id)?;
        }

        if !freelist_chain.is_empty() {
            chain_writes.extend(write_freelist(
                &self.state.allocator.meta.freelist,
                &self.state.allocator.data.freelist,
                &freelist_chain,
                page_size,
            )?);
            freelist_root = freelist_chain.first().copied().unwrap_or(0);
            self.state.freelist_pages = freelist_chain.iter().copied().collect();
        }

        self.state.generation += 1;
        self.state.root = self.root;
        let slot = self.state.active_slot.other();

        let mut header = MetaPage::init(self.root, page_size, self.file.max_size);
        header.set_freelist_root(freelist_root);
        header.set_wal_root(wal_root);
        header.set_data_end(self.state.allocator.data.end_marker);
        header.set_meta_end(self.state.allocator.meta.end_marker);
        header.set_meta_total(self.state.allocator.meta_total);
        header.set_generation(self.state.generation);
        header.finalize();

        // Grow the file and the mapping before anything is scheduled.
        let needed_bytes = self.state.allocator.file_end() as u64 * page_bytes;
        if needed_bytes > self.file.vfs.size()? {
            self.file
                .vfs
                .truncate(needed_bytes)
                .wrap_err("failed to grow the store file")?;
        }
        let mapped = self.file.mmap.read().len() as u64;
        if mapped < needed_bytes {
            let map_len = compute_mmap_size(needed_bytes, self.file.max_size, page_size)?;
            let mut mmap = self.file.mmap.write();
            *mmap = self.file.vfs.mmap(map_len as usize)?;
        }

        let lock = &self.file.lock;
        if self.checkpointed {
            lock.lock_pending();
            lock.lock_exclusive();
        }

        if let Err(err) = self.flush(slot, &header, &destinations, chain_writes) {
            if self.checkpointed {
                lock.unlock_exclusive();
                lock.unlock_pending();
            }
            return Err(err);
        }

        if !self.checkpointed {
            lock.lock_pending();
            lock.lock_exclusive();
        }
        self.state.active_slot = slot;
        *self.file.committed.lock() = self.state.clone();
        lock.unlock_exclusive();
        lock.unlock_pending();
        Ok(())
    }

    /// Schedules all page writes, waits on the data barrier, then writes the
    /// meta page to the inactive slot and waits on the meta barrier.
    fn flush(
        &self,
        slot: MetaSlot,
        header: &MetaPage,
        destinations: &[(PageId, PageId)],
        chain_writes: Vec<(PageId, Vec<u8>)>,
    ) -> Result<()> {
        let page_bytes = self.file.page_size as u64;
        let writer = &self.file.writer;

        for &(id, dest) in destinations {
            if let Some(buf) = self.pages.get(&id) {
                writer.schedule(dest as u64 * page_bytes, buf.data.clone());
            }
        }
        for (id, data) in chain_writes {
            writer.schedule(id as u64 * page_bytes, data);
        }
        let barrier = WriteBarrier::new();
        writer.sync(Arc::clone(&barrier));
        barrier.wait()?;

        let mut page = vec![0u8; self.file.page_size as usize];
        page[..META_HEADER_SIZE].copy_from_slice(header.as_bytes());
        writer.schedule(slot.page_id() as u64 * page_bytes, page);
        let barrier = WriteBarrier::new();
        writer.sync(Arc::clone(&barrier));
        barrier.wait()
    }
}

impl Drop for Tx {
    fn drop(&mut self) {
        if self.active {
            self.finish();
        }
    }
}

/// Mutable handle to one page inside a transaction.
pub struct PageRef<'tx> {
    tx: &'tx mut Tx,
    id: PageId,
}

impl std::fmt::Debug for PageRef<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageRef")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl PageRef<'_> {
    pub fn id(&self) -> PageId {
        self.id
    }

    /// Forces the page into the transaction's buffer cache.
    pub fn load(&mut self) -> Result<()> {
        self.tx.load_page(self.id)?;
        Ok(())
    }

    /// The page contents, loading them on first access.
    pub fn bytes(&mut self) -> Result<&[u8]> {
        Ok(&self.tx.load_page(self.id)?.data)
    }

    /// Mutable view of the page contents; marks the page dirty.
    pub fn bytes_mut(&mut self) -> Result<&mut [u8]> {
        self.tx.ensure_writable()?;
        let buf = self.tx.load_page(self.id)?;
        buf.dirty = true;
        Ok(&mut buf.data)
    }

    /// Overwrites the front of the page; the rest keeps its prior contents.
    pub fn set_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.tx.ensure_writable()?;
        let page_size = self.tx.file.page_size as usize;
        ensure!(
            bytes.len() <= page_size,
            "payload of {} bytes exceeds the page size of {}",
            bytes.len(),
            page_size
        );
        let buf = self.tx.load_page(self.id)?;
        buf.data[..bytes.len()].copy_from_slice(bytes);
        buf.dirty = true;
        Ok(())
    }

    /// Marks the page dirty without changing it, forcing a rewrite at
    /// commit. Useful after out-of-band mutation through `bytes_mut`.
    pub fn mark_dirty(&mut self) -> Result<()> {
        self.tx.ensure_writable()?;
        let buf = self.tx.load_page(self.id)?;
        buf.dirty = true;
        Ok(())
    }

    /// Returns the page to the allocator; the handle is consumed and the id
    /// is unreadable for the rest of the transaction.
    pub fn free(self) -> Result<()> {
        self.tx.free_page(self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::{File, Options};
    use tempfile::tempdir;

    fn open_temp() -> (tempfile::TempDir, File) {
        let dir = tempdir().unwrap();
        let f = File::open(
            dir.path().join("store.dat"),
            Options {
                page_size: 512,
                max_size: 0,
            },
        )
        .unwrap();
        (dir, f)
    }

    fn assert_readonly(err: eyre::Report) {
        assert_eq!(
            err.downcast_ref::<StorageError>(),
            Some(&StorageError::ReadOnlyViolation)
        );
    }

    #[test]
    fn readonly_tx_rejects_mutation() {
        let (_dir, f) = open_temp();

        let mut writer = f.begin();
        let id = writer.alloc().unwrap();
        writer.commit().unwrap();

        let mut reader = f.begin_readonly();
        assert!(reader.readonly());
        assert_readonly(reader.alloc().unwrap_err());
        assert_readonly(reader.set_root(id).unwrap_err());
        assert_readonly(reader.page(id).unwrap().set_bytes(b"x").unwrap_err());
        assert_readonly(reader.page(id).unwrap().free().unwrap_err());
        assert_readonly(reader.checkpoint_wal().unwrap_err());
        reader.close().unwrap();
    }

    #[test]
    fn invalid_page_ids_are_rejected() {
        let (_dir, f) = open_temp();
        let mut tx = f.begin();
        let id = tx.alloc().unwrap();

        for bad in [0u32, 1, id + 1] {
            let err = tx.page(bad).unwrap_err();
            assert_eq!(
                err.downcast_ref::<StorageError>(),
                Some(&StorageError::InvalidPageId { id: bad })
            );
        }
        tx.rollback().unwrap();
    }

    #[test]
    fn fresh_pages_read_as_zeroes() {
        let (_dir, f) = open_temp();
        let mut tx = f.begin();
        let id = tx.alloc().unwrap();

        let mut page = tx.page(id).unwrap();
        assert!(page.bytes().unwrap().iter().all(|&b| b == 0));
        tx.rollback().unwrap();
    }

    #[test]
    fn freed_page_is_unreadable_and_unfreeable() {
        let (_dir, f) = open_temp();

        let mut tx = f.begin();
        let id = tx.alloc().unwrap();
        tx.commit().unwrap();

        let mut tx = f.begin();
        tx.page(id).unwrap().free().unwrap();
        assert!(tx.page(id).is_err());
        tx.commit().unwrap();
    }

    #[test]
    fn bookkeeping_chain_pages_are_not_readable() {
        let (_dir, f) = open_temp();

        let mut tx = f.begin();
        let ids = tx.alloc_n(2).unwrap(); // pages 2, 3
        tx.commit().unwrap();

        // update one page, free the other: the commit persists a WAL chain
        // page (5) and a free-list chain page (6) after the shadow (4)
        let mut tx = f.begin();
        tx.page(ids[0]).unwrap().set_bytes(b"x").unwrap();
        tx.page(ids[1]).unwrap().free().unwrap();
        tx.commit().unwrap();

        let mut tx = f.begin();
        for chain_page in [5u32, 6] {
            let err = tx.page(chain_page).unwrap_err();
            assert_eq!(
                err.downcast_ref::<StorageError>(),
                Some(&StorageError::InvalidPageId { id: chain_page })
            );
        }
        // regular pages stay reachable
        assert_eq!(&tx.page(ids[0]).unwrap().bytes().unwrap()[..1], b"x");
        tx.rollback().unwrap();
    }

    #[test]
    fn operations_fail_after_finish() {
        let (_dir, f) = open_temp();
        let mut tx = f.begin();
        tx.commit().unwrap();

        assert!(!tx.active());
        assert!(tx.alloc().is_err());
        assert!(tx.commit().is_err());
        assert!(tx.rollback().is_err());
        tx.close().unwrap();
    }

    #[test]
    fn rollback_discards_allocations() {
        let (_dir, f) = open_temp();

        let mut tx = f.begin();
        tx.alloc_n(4).unwrap();
        tx.rollback().unwrap();

        assert_eq!(f.stats().file_pages, 2);
    }

    #[test]
    fn empty_commit_does_not_bump_the_generation() {
        let (_dir, f) = open_temp();
        let before = f.stats().generation;

        let mut tx = f.begin();
        tx.commit().unwrap();

        assert_eq!(f.stats().generation, before);
    }

    #[test]
    fn dropping_a_tx_releases_the_writer_slot() {
        let (_dir, f) = open_temp();
        {
            let mut tx = f.begin();
            tx.alloc().unwrap();
            // dropped without commit
        }
        let mut tx = f.begin();
        tx.alloc().unwrap();
        tx.commit().unwrap();
    }
}
