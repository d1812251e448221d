//! # Page Allocator
//!
//! Tracks free and used pages for the two allocation areas: the *meta area*
//! (free-list and WAL mapping chain pages) and the *data area* (caller
//! pages, including WAL shadow pages). Both areas are independent instances
//! of the same algorithm over one shared physical page space; a page id
//! belongs to exactly one area from the moment it is claimed.
//!
//! ## Allocation policy
//!
//! `alloc` prefers the lowest-numbered ids from the area's free list before
//! extending the file, which keeps the file compact and counteracts
//! fragmentation. Growth claims fresh pages at the current file tail, the
//! maximum of both end markers; exceeding a configured maximum file size
//! fails with `SizeLimitExceeded` and leaves the allocator unchanged.
//!
//! ## Free-list persistence
//!
//! The free regions of both areas are serialized into a chain of meta-area
//! pages referenced from the meta page, rebuilt in memory on open and
//! rewritten on every read-write commit:
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  -----------------------------------------
//! 0       4     next: page id of next chain page (0 = end)
//! 4       4     meta_count: meta-area regions in this page
//! 8       4     data_count: data-area regions in this page
//! 12      8*N   entries: {start, count}, meta regions first
//! ```

use eyre::{bail, ensure, Result};
use zerocopy::little_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::error::StorageError;
use crate::meta::META_SLOT_COUNT;
use crate::region::{PageId, PageSet, Region, RegionList};

/// Lowest allocatable page id; pages 0 and 1 are the meta slots.
pub const FIRST_PAGE: PageId = META_SLOT_COUNT;

pub const FREELIST_PAGE_HEADER_SIZE: usize = 12;
pub const FREELIST_ENTRY_SIZE: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AreaKind {
    Meta,
    Data,
}

/// End marker plus free list for one allocation area.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Area {
    /// One past the highest page id ever claimed by this area.
    pub end_marker: PageId,
    pub freelist: RegionList,
}

impl Area {
    pub fn new() -> Self {
        Self {
            end_marker: FIRST_PAGE,
            freelist: RegionList::new(),
        }
    }

    pub fn with_state(end_marker: PageId, freelist: RegionList) -> Self {
        Self {
            end_marker: end_marker.max(FIRST_PAGE),
            freelist,
        }
    }

    pub fn free_pages(&self) -> u32 {
        self.freelist.total_pages()
    }
}

/// Two-area allocator over a single physical page space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocator {
    pub data: Area,
    pub meta: Area,
    /// Pages ever claimed by the meta area; freed meta pages stay counted.
    pub meta_total: u32,
    /// File size limit in pages; 0 means unbounded.
    pub max_pages: u32,
}

impl Allocator {
    pub fn new(max_pages: u32) -> Self {
        Self {
            data: Area::new(),
            meta: Area::new(),
            meta_total: 0,
            max_pages,
        }
    }

    /// One past the highest page claimed by either area; fresh growth for
    /// both areas starts here.
    pub fn file_end(&self) -> PageId {
        self.data.end_marker.max(self.meta.end_marker)
    }

    pub fn alloc_data(&mut self, n: u32) -> Result<Vec<PageId>> {
        self.alloc_from(AreaKind::Data, n)
    }

    pub fn alloc_meta(&mut self, n: u32) -> Result<Vec<PageId>> {
        self.alloc_from(AreaKind::Meta, n)
    }

    fn alloc_from(&mut self, kind: AreaKind, n: u32) -> Result<Vec<PageId>> {
        if n == 0 {
            return Ok(Vec::new());
        }

        let max_pages = self.max_pages;
        let tail = self.file_end();

        let area = match kind {
            AreaKind::Data => &mut self.data,
            AreaKind::Meta => &mut self.meta,
        };

        let mut ids = area.freelist.take_first(n);
        let missing = n - ids.len() as u32;
        if missing > 0 {
            if max_pages != 0 && tail + missing > max_pages {
                // undo the partial free-list take
                for id in ids {
                    area.freelist.add(Region::new(id, 1));
                }
                area.freelist.optimize();
                bail!(StorageError::SizeLimitExceeded {
                    requested: n,
                    max_pages,
                });
            }
            ids.extend(tail..tail + missing);
            area.end_marker = area.end_marker.max(tail + missing);
            if kind == AreaKind::Meta {
                self.meta_total += missing;
            }
        }

        Ok(ids)
    }

    pub fn free(&mut self, kind: AreaKind, region: Region) -> Result<()> {
        ensure!(
            region.start >= FIRST_PAGE,
            StorageError::InvalidPageId { id: region.start }
        );
        let area = match kind {
            AreaKind::Data => &mut self.data,
            AreaKind::Meta => &mut self.meta,
        };
        ensure!(
            region.end() <= area.end_marker,
            StorageError::InvalidPageId {
                id: region.end() - 1
            }
        );
        area.freelist.add(region);
        area.freelist.optimize();
        Ok(())
    }

    pub fn free_data(&mut self, id: PageId) -> Result<()> {
        self.free(AreaKind::Data, Region::new(id, 1))
    }

    pub fn free_meta(&mut self, id: PageId) -> Result<()> {
        self.free(AreaKind::Meta, Region::new(id, 1))
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct FreelistPageHeader {
    next: U32,
    meta_count: U32,
    data_count: U32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct RegionEntry {
    start: U32,
    count: U32,
}

const _: () = assert!(std::mem::size_of::<FreelistPageHeader>() == FREELIST_PAGE_HEADER_SIZE);
const _: () = assert!(std::mem::size_of::<RegionEntry>() == FREELIST_ENTRY_SIZE);

fn entries_per_page(page_size: u32) -> usize {
    (page_size as usize - FREELIST_PAGE_HEADER_SIZE) / FREELIST_ENTRY_SIZE
}

/// Chain pages required to persist `entries` regions.
pub fn freelist_pages_needed(entries: usize, page_size: u32) -> u32 {
    entries.div_ceil(entries_per_page(page_size)) as u32
}

/// Serializes both free lists into the pre-allocated `chain` pages. Meta
/// regions are written before data regions; entries spill across chain pages
/// in order. Returns one full page buffer per chain page.
pub fn write_freelist(
    meta: &RegionList,
    data: &RegionList,
    chain: &[PageId],
    page_size: u32,
) -> Result<Vec<(PageId, Vec<u8>)>> {
    let per_page = entries_per_page(page_size);
    let total = meta.len() + data.len();
    ensure!(
        chain.len() * per_page >= total,
        "free-list chain of {} page(s) cannot hold {} region entries",
        chain.len(),
        total
    );

    let mut entries: Vec<(bool, Region)> = Vec::with_capacity(total);
    entries.extend(meta.iter().map(|r| (true, *r)));
    entries.extend(data.iter().map(|r| (false, *r)));

    let mut pages = Vec::with_capacity(chain.len());
    let mut cursor = entries.as_slice();

    for (i, &id) in chain.iter().enumerate() {
        let take = cursor.len().min(per_page);
        let (slice, rest) = cursor.split_at(take);
        cursor = rest;

        let next = chain.get(i + 1).copied().unwrap_or(0);
        let meta_count = slice.iter().filter(|(is_meta, _)| *is_meta).count() as u32;
        let data_count = take as u32 - meta_count;

        let mut buf = vec![0u8; page_size as usize];
        let header = FreelistPageHeader {
            next: U32::new(next),
            meta_count: U32::new(meta_count),
            data_count: U32::new(data_count),
        };
        buf[..FREELIST_PAGE_HEADER_SIZE].copy_from_slice(header.as_bytes());

        let mut off = FREELIST_PAGE_HEADER_SIZE;
        for (_, region) in slice {
            let entry = RegionEntry {
                start: U32::new(region.start),
                count: U32::new(region.count),
            };
            buf[off..off + FREELIST_ENTRY_SIZE].copy_from_slice(entry.as_bytes());
            off += FREELIST_ENTRY_SIZE;
        }

        pages.push((id, buf));
    }

    Ok(pages)
}

/// Checks a persisted region against its area end marker. The chain pages
/// carry no checksum, so a torn or stale entry must never reach the
/// allocator; the end is computed in u64 because `start + count` can wrap.
fn validate_region(region: &Region, area_end: PageId, chain_page: PageId) -> Result<()> {
    ensure!(
        region.count > 0 && region.start >= FIRST_PAGE,
        "free-list page {} holds an invalid region [{}; {}]",
        chain_page,
        region.start,
        region.count
    );
    let end = region.start as u64 + region.count as u64;
    ensure!(
        end <= area_end as u64,
        "free-list page {} region [{}; {}] reaches past the area end {}",
        chain_page,
        region.start,
        region.count,
        area_end
    );
    Ok(())
}

/// Walks the free-list chain starting at `root`, rebuilding both area free
/// lists and collecting the chain pages themselves. Every entry is validated
/// against the end marker of its area.
pub fn read_freelist<F>(
    mut read_page: F,
    root: PageId,
    meta_end: PageId,
    data_end: PageId,
) -> Result<(RegionList, RegionList, PageSet)>
where
    F: FnMut(PageId) -> Result<Vec<u8>>,
{
    let mut meta = RegionList::new();
    let mut data = RegionList::new();
    let mut chain = PageSet::new();

    let mut next = root;
    while next != 0 {
        ensure!(
            !chain.has(next),
            "free-list chain contains a cycle at page {}",
            next
        );
        chain.add(next);

        let buf = read_page(next)?;
        ensure!(
            buf.len() > FREELIST_PAGE_HEADER_SIZE,
            "free-list page {} too small",
            next
        );
        let header = FreelistPageHeader::read_from_bytes(&buf[..FREELIST_PAGE_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to parse free-list page {next}: {e:?}"))?;

        let meta_count = header.meta_count.get() as usize;
        let data_count = header.data_count.get() as usize;
        let total = meta_count + data_count;
        ensure!(
            FREELIST_PAGE_HEADER_SIZE + total * FREELIST_ENTRY_SIZE <= buf.len(),
            "free-list page {} entry count out of bounds",
            next
        );

        let mut off = FREELIST_PAGE_HEADER_SIZE;
        for i in 0..total {
            let entry = RegionEntry::read_from_bytes(&buf[off..off + FREELIST_ENTRY_SIZE])
                .map_err(|e| eyre::eyre!("failed to parse free-list entry: {e:?}"))?;
            off += FREELIST_ENTRY_SIZE;

            let region = Region::new(entry.start.get(), entry.count.get());
            if i < meta_count {
                validate_region(&region, meta_end, next)?;
                meta.add(region);
            } else {
                validate_region(&region, data_end, next)?;
                data.add(region);
            }
        }

        next = header.next.get();
    }

    meta.optimize();
    data.optimize();
    Ok((meta, data, chain))
}
