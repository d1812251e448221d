//! # Write-Ahead Log
//!
//! In-place updates never clobber a page slot that an older snapshot might
//! still read. Instead the new contents go to a freshly allocated *shadow*
//! page in the data area, and the WAL mapping records `original -> shadow`.
//! Page reads consult the mapping before falling back to the original slot,
//! so every snapshot keeps seeing its own point-in-time contents while write
//! amplification for small edits stays low.
//!
//! ## Persistence
//!
//! The mapping is serialized into a chain of meta-area pages referenced from
//! the meta page (`wal_root`); the chain is rebuilt in memory on open and
//! rewritten (old chain freed, new chain allocated) by every commit that
//! touches the mapping.
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  -----------------------------------------
//! 0       4     next: page id of next chain page (0 = end)
//! 4       4     count: entries in this page
//! 8       8*N   entries: {original, shadow}
//! ```
//!
//! ## Checkpoint
//!
//! `Tx::checkpoint_wal` folds every shadow's contents back into its original
//! slot and clears the mapping. The folding writes run under exclusivity (no
//! reader may still depend on the pre-checkpoint mapping) and before the new
//! meta page, so a crash mid-checkpoint leaves the previous generation fully
//! consistent.

use eyre::{ensure, Result};
use hashbrown::HashMap;
use zerocopy::little_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::alloc::FIRST_PAGE;
use crate::region::{PageId, PageSet};

pub const WAL_PAGE_HEADER_SIZE: usize = 8;
pub const WAL_ENTRY_SIZE: usize = 8;

/// In-memory WAL state: the original-to-shadow table plus the meta-area
/// pages currently persisting it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WalState {
    pub mapping: HashMap<PageId, PageId>,
    pub pages: PageSet,
}

impl WalState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Physical location of `id` under this mapping.
    pub fn resolve(&self, id: PageId) -> PageId {
        self.mapping.get(&id).copied().unwrap_or(id)
    }

    pub fn is_empty(&self) -> bool {
        self.mapping.is_empty()
    }

    pub fn len(&self) -> usize {
        self.mapping.len()
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct WalPageHeader {
    next: U32,
    count: U32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct WalEntry {
    original: U32,
    shadow: U32,
}

const _: () = assert!(std::mem::size_of::<WalPageHeader>() == WAL_PAGE_HEADER_SIZE);
const _: () = assert!(std::mem::size_of::<WalEntry>() == WAL_ENTRY_SIZE);

fn entries_per_page(page_size: u32) -> usize {
    (page_size as usize - WAL_PAGE_HEADER_SIZE) / WAL_ENTRY_SIZE
}

/// Chain pages required to persist `entries` mapping entries.
pub fn wal_pages_needed(entries: usize, page_size: u32) -> u32 {
    entries.div_ceil(entries_per_page(page_size)) as u32
}

/// Serializes the mapping into the pre-allocated `chain` pages. Entries are
/// written in ascending original-id order so the on-disk form is stable.
pub fn write_wal(
    mapping: &HashMap<PageId, PageId>,
    chain: &[PageId],
    page_size: u32,
) -> Result<Vec<(PageId, Vec<u8>)>> {
    let per_page = entries_per_page(page_size);
    ensure!(
        chain.len() * per_page >= mapping.len(),
        "WAL chain of {} page(s) cannot hold {} mapping entries",
        chain.len(),
        mapping.len()
    );

    let mut entries: Vec<(PageId, PageId)> =
        mapping.iter().map(|(&orig, &shadow)| (orig, shadow)).collect();
    entries.sort_unstable_by_key(|&(orig, _)| orig);

    let mut pages = Vec::with_capacity(chain.len());
    let mut cursor = entries.as_slice();

    for (i, &id) in chain.iter().enumerate() {
        let take = cursor.len().min(per_page);
        let (slice, rest) = cursor.split_at(take);
        cursor = rest;

        let next = chain.get(i + 1).copied().unwrap_or(0);
        let mut buf = vec![0u8; page_size as usize];
        let header = WalPageHeader {
            next: U32::new(next),
            count: U32::new(take as u32),
        };
        buf[..WAL_PAGE_HEADER_SIZE].copy_from_slice(header.as_bytes());

        let mut off = WAL_PAGE_HEADER_SIZE;
        for &(orig, shadow) in slice {
            let entry = WalEntry {
                original: U32::new(orig),
                shadow: U32::new(shadow),
            };
            buf[off..off + WAL_ENTRY_SIZE].copy_from_slice(entry.as_bytes());
            off += WAL_ENTRY_SIZE;
        }

        pages.push((id, buf));
    }

    Ok(pages)
}

/// Walks the WAL chain starting at `root` and rebuilds the mapping. Each
/// original id may appear at most once, and both sides of every entry must
/// lie inside the data area; the chain pages carry no checksum, so a torn
/// entry has to be caught here.
pub fn read_wal<F>(mut read_page: F, root: PageId, data_end: PageId) -> Result<WalState>
where
    F: FnMut(PageId) -> Result<Vec<u8>>,
{
    let mut state = WalState::new();

    let mut next = root;
    while next != 0 {
        ensure!(
            !state.pages.has(next),
            "WAL chain contains a cycle at page {}",
            next
        );
        state.pages.add(next);

        let buf = read_page(next)?;
        ensure!(
            buf.len() > WAL_PAGE_HEADER_SIZE,
            "WAL page {} too small",
            next
        );
        let header = WalPageHeader::read_from_bytes(&buf[..WAL_PAGE_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to parse WAL page {next}: {e:?}"))?;

        let count = header.count.get() as usize;
        ensure!(
            WAL_PAGE_HEADER_SIZE + count * WAL_ENTRY_SIZE <= buf.len(),
            "WAL page {} entry count out of bounds",
            next
        );

        let mut off = WAL_PAGE_HEADER_SIZE;
        for _ in 0..count {
            let entry = WalEntry::read_from_bytes(&buf[off..off + WAL_ENTRY_SIZE])
                .map_err(|e| eyre::eyre!("failed to parse WAL entry: {e:?}"))?;
            off += WAL_ENTRY_SIZE;

            let orig = entry.original.get();
            let shadow = entry.shadow.get();
            ensure!(
                orig >= FIRST_PAGE && orig < data_end && shadow >= FIRST_PAGE && shadow < data_end,
                "WAL page {} entry {} -> {} lies outside the data area end {}",
                next,
                orig,
                shadow,
                data_end
            );
            let prev = state.mapping.insert(orig, shadow);
            ensure!(prev.is_none(), "page {} appears twice in the WAL mapping", orig);
        }

        next = header.next.get();
    }

    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_prefers_the_shadow_page() {
        let mut state = WalState::new();
        state.mapping.insert(5, 40);

        assert_eq!(state.resolve(5), 40);
        assert_eq!(state.resolve(6), 6);
        assert_eq!(state.len(), 1);
    }

    #[test]
    fn roundtrip_through_chain_pages() {
        let mut mapping = HashMap::new();
        mapping.insert(3, 20);
        mapping.insert(7, 21);
        mapping.insert(4, 22);

        let chain = vec![30];
        let pages = write_wal(&mapping, &chain, 4096).unwrap();
        assert_eq!(pages.len(), 1);

        let stored: HashMap<PageId, Vec<u8>> = pages.into_iter().collect();
        let state = read_wal(|id| Ok(stored[&id].clone()), 30, 32).unwrap();

        assert_eq!(state.mapping, mapping);
        assert_eq!(state.pages.ids(), chain);
    }

    #[test]
    fn large_mapping_spills_across_pages() {
        // page_size 512 -> (512 - 8) / 8 = 63 entries per page
        let page_size = 512;
        let mut mapping = HashMap::new();
        for i in 0..100u32 {
            mapping.insert(2 + i, 200 + i);
        }

        let needed = wal_pages_needed(mapping.len(), page_size);
        assert_eq!(needed, 2);

        let chain: Vec<PageId> = (500..500 + needed).collect();
        let pages = write_wal(&mapping, &chain, page_size).unwrap();
        let stored: HashMap<PageId, Vec<u8>> = pages.into_iter().collect();

        let state = read_wal(|id| Ok(stored[&id].clone()), chain[0], 512).unwrap();
        assert_eq!(state.mapping, mapping);
        assert_eq!(state.pages.count(), 2);
    }

    #[test]
    fn empty_root_reads_as_empty_state() {
        let state = read_wal(|_| unreachable!("no pages should be read"), 0, 2).unwrap();
        assert!(state.is_empty());
        assert!(state.pages.is_empty());
    }

    fn two_entry_page(entries: [(u32, u32); 2]) -> Vec<u8> {
        let mut buf = vec![0u8; 4096];
        let header = WalPageHeader {
            next: U32::new(0),
            count: U32::new(2),
        };
        buf[..WAL_PAGE_HEADER_SIZE].copy_from_slice(header.as_bytes());
        for (i, (orig, shadow)) in entries.into_iter().enumerate() {
            let entry = WalEntry {
                original: U32::new(orig),
                shadow: U32::new(shadow),
            };
            let off = WAL_PAGE_HEADER_SIZE + i * WAL_ENTRY_SIZE;
            buf[off..off + WAL_ENTRY_SIZE].copy_from_slice(entry.as_bytes());
        }
        buf
    }

    #[test]
    fn duplicate_original_id_is_rejected() {
        let buf = two_entry_page([(5, 9), (5, 9)]);
        let err = read_wal(|_| Ok(buf.clone()), 7, 64).unwrap_err();
        assert!(err.to_string().contains("twice"));
    }

    #[test]
    fn out_of_range_entries_are_rejected() {
        // shadow past the data end marker
        let buf = two_entry_page([(5, 99), (6, 9)]);
        let err = read_wal(|_| Ok(buf.clone()), 7, 64).unwrap_err();
        assert!(err.to_string().contains("outside the data area"));

        // reserved id on the original side
        let buf = two_entry_page([(0, 9), (6, 9)]);
        assert!(read_wal(|_| Ok(buf.clone()), 7, 64).is_err());
    }
}
