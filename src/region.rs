//! # Page Id and Region Utilities
//!
//! Pages are addressed by a plain `u32` id; id 0 is reserved and never valid.
//! Free-space bookkeeping works on *regions*, contiguous runs of ids stored in
//! a flat ordered vector. Keeping the representation flat and merged bounds
//! the memory used by free lists no matter how fragmented the file becomes.
//!
//! ## Invariants
//!
//! After `optimize()` a `RegionList` is sorted by start and holds no
//! overlapping or adjacent regions. Allocation always removes ids from the
//! front of the list, which yields the lowest-numbered free ids first.

use hashbrown::HashSet;

/// Identifier of a fixed-size page inside the store file. Id 0 is reserved.
pub type PageId = u32;

/// A contiguous run of page ids `[start, start + count)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub start: PageId,
    pub count: u32,
}

impl Region {
    pub fn new(start: PageId, count: u32) -> Self {
        Self { start, count }
    }

    /// One past the last id in the region.
    pub fn end(&self) -> PageId {
        self.start + self.count
    }

    pub fn contains(&self, id: PageId) -> bool {
        self.start <= id && id < self.end()
    }

    /// True if `other` starts inside or immediately after `self`.
    fn touches(&self, other: &Region) -> bool {
        other.start <= self.end()
    }
}

/// Flat ordered list of free regions with merge-on-optimize.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegionList {
    regions: Vec<Region>,
}

impl RegionList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// Number of regions, not pages.
    pub fn len(&self) -> usize {
        self.regions.len()
    }

    /// Total number of page ids covered by all regions.
    pub fn total_pages(&self) -> u32 {
        self.regions.iter().map(|r| r.count).sum()
    }

    pub fn as_slice(&self) -> &[Region] {
        &self.regions
    }

    pub fn iter(&self) -> impl Iterator<Item = &Region> {
        self.regions.iter()
    }

    pub fn contains(&self, id: PageId) -> bool {
        match self.regions.binary_search_by_key(&id, |r| r.start) {
            Ok(_) => true,
            Err(0) => false,
            Err(i) => self.regions[i - 1].contains(id),
        }
    }

    /// Inserts a region keeping start order. Call `optimize()` afterwards to
    /// merge; `add` alone never merges so it stays O(log n + shift).
    pub fn add(&mut self, region: Region) {
        if region.count == 0 {
            return;
        }
        let at = self
            .regions
            .partition_point(|r| r.start < region.start);
        self.regions.insert(at, region);
    }

    /// Sorts and merges adjacent or overlapping regions.
    pub fn optimize(&mut self) {
        if self.regions.len() < 2 {
            return;
        }
        self.regions.sort_by_key(|r| r.start);

        let mut merged: Vec<Region> = Vec::with_capacity(self.regions.len());
        for region in self.regions.drain(..) {
            match merged.last_mut() {
                Some(last) if last.touches(&region) => {
                    let end = last.end().max(region.end());
                    last.count = end - last.start;
                }
                _ => merged.push(region),
            }
        }
        self.regions = merged;
    }

    /// Removes up to `n` of the lowest-numbered free ids and returns them.
    /// Returns fewer than `n` ids when the list runs dry.
    pub fn take_first(&mut self, n: u32) -> Vec<PageId> {
        let mut ids = Vec::with_capacity(n as usize);
        while (ids.len() as u32) < n && !self.regions.is_empty() {
            let want = n - ids.len() as u32;
            let head = &mut self.regions[0];
            let take = head.count.min(want);
            ids.extend(head.start..head.start + take);
            if take == head.count {
                self.regions.remove(0);
            } else {
                head.start += take;
                head.count -= take;
            }
        }
        ids
    }
}

impl FromIterator<Region> for RegionList {
    fn from_iter<T: IntoIterator<Item = Region>>(iter: T) -> Self {
        let mut list = RegionList::new();
        for r in iter {
            list.add(r);
        }
        list.optimize();
        list
    }
}

/// Unordered set of page ids with conversion to sorted ids and regions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageSet {
    ids: HashSet<PageId>,
}

impl PageSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, id: PageId) {
        self.ids.insert(id);
    }

    pub fn remove(&mut self, id: PageId) -> bool {
        self.ids.remove(&id)
    }

    pub fn has(&self, id: PageId) -> bool {
        self.ids.contains(&id)
    }

    pub fn count(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn clear(&mut self) {
        self.ids.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = PageId> + '_ {
        self.ids.iter().copied()
    }

    /// Sorted list of the contained ids.
    pub fn ids(&self) -> Vec<PageId> {
        let mut ids: Vec<PageId> = self.ids.iter().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Folds the contained ids into a merged region list.
    pub fn regions(&self) -> RegionList {
        regions_from_sorted_ids(&self.ids())
    }
}

impl FromIterator<PageId> for PageSet {
    fn from_iter<T: IntoIterator<Item = PageId>>(iter: T) -> Self {
        Self {
            ids: iter.into_iter().collect(),
        }
    }
}

/// Builds a merged region list from an ascending id slice.
pub fn regions_from_sorted_ids(ids: &[PageId]) -> RegionList {
    let mut list = RegionList::new();
    let mut run: Option<Region> = None;
    for &id in ids {
        match run {
            Some(ref mut r) if id == r.end() => r.count += 1,
            Some(r) => {
                list.add(r);
                run = Some(Region::new(id, 1));
            }
            None => run = Some(Region::new(id, 1)),
        }
    }
    if let Some(r) = run {
        list.add(r);
    }
    list
}
