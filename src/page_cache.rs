//! Write-back page cache with LRU eviction and pin counts, used by the
//! block map to hold its tree pages in RAM (spec §4.1).
//!
//! Grounded in the teacher's `buffer/page_cache.rs` (`PageBuffer`/`FrameId`
//! pinning model) and `buffer/eviction.rs` (`EvictionPolicy` abstraction),
//! narrowed down to exactly what the block map needs: pin-for-read,
//! pin-for-write-then-dirty, and eviction that only ever touches pages with
//! a zero pin count.

use std::collections::{HashMap, VecDeque};

use crate::error::{Result, VdoError};

/// One cached block-map tree page: a fixed-size array of packed entries
/// plus cache bookkeeping.
pub struct CachedPage<T> {
    pub contents: T,
    pub dirty: bool,
    pin_count: u32,
}

impl<T> CachedPage<T> {
    fn new(contents: T) -> Self {
        Self { contents, dirty: false, pin_count: 0 }
    }

    pub fn is_pinned(&self) -> bool {
        self.pin_count > 0
    }
}

/// LRU page cache keyed by page number. Capacity is the maximum number of
/// resident pages; eviction never touches a pinned page (mirrors the
/// teacher's eviction policy refusing to evict in-use frames).
pub struct PageCache<T> {
    capacity: usize,
    pages: HashMap<u64, CachedPage<T>>,
    /// Recency order, most-recently-used at the back. Lazily compacted: a
    /// page number may appear more than once; only the last occurrence (from
    /// the back) is authoritative, stale entries are skipped on eviction.
    recency: VecDeque<u64>,
}

impl<T> PageCache<T> {
    pub fn new(capacity: usize) -> Self {
        Self { capacity: capacity.max(1), pages: HashMap::new(), recency: VecDeque::new() }
    }

    fn touch(&mut self, page_number: u64) {
        self.recency.push_back(page_number);
        // Bound the recency log so it doesn't grow unboundedly across a long
        // run; a factor of 4 over capacity keeps eviction's linear scan cheap.
        if self.recency.len() > self.capacity * 4 {
            self.recency.retain(|&p| self.pages.contains_key(&p));
        }
    }

    /// Insert a freshly loaded page, evicting an unpinned LRU victim first if
    /// at capacity. Returns `Err` if every resident page is pinned.
    pub fn insert(&mut self, page_number: u64, contents: T) -> Result<()> {
        if self.pages.len() >= self.capacity && !self.pages.contains_key(&page_number) {
            self.evict_one()?;
        }
        self.pages.insert(page_number, CachedPage::new(contents));
        self.touch(page_number);
        Ok(())
    }

    pub fn contains(&self, page_number: u64) -> bool {
        self.pages.contains_key(&page_number)
    }

    /// Pin a resident page for reading; caller must `unpin` when done.
    pub fn pin(&mut self, page_number: u64) -> Result<&T> {
        self.touch(page_number);
        let page = self
            .pages
            .get_mut(&page_number)
            .ok_or_else(|| VdoError::assertion(format!("pin of absent page {page_number}")))?;
        page.pin_count += 1;
        Ok(&page.contents)
    }

    /// Pin a resident page for writing. The caller mutates `contents`
    /// in-place and must call `mark_dirty` before `unpin`.
    pub fn pin_mut(&mut self, page_number: u64) -> Result<&mut CachedPage<T>> {
        self.touch(page_number);
        let page = self
            .pages
            .get_mut(&page_number)
            .ok_or_else(|| VdoError::assertion(format!("pin_mut of absent page {page_number}")))?;
        page.pin_count += 1;
        Ok(page)
    }

    pub fn unpin(&mut self, page_number: u64) -> Result<()> {
        let page = self
            .pages
            .get_mut(&page_number)
            .ok_or_else(|| VdoError::assertion(format!("unpin of absent page {page_number}")))?;
        if page.pin_count == 0 {
            return Err(VdoError::assertion(format!("unpin underflow on page {page_number}")));
        }
        page.pin_count -= 1;
        Ok(())
    }

    fn evict_one(&mut self) -> Result<()> {
        while let Some(candidate) = self.recency.pop_front() {
            if let Some(page) = self.pages.get(&candidate) {
                if page.is_pinned() {
                    continue;
                }
                if page.dirty {
                    // A dirty page cannot be dropped silently; the caller is
                    // expected to have flushed dirty pages before they age
                    // out, so treat this as "no victim available" rather
                    // than lose a pending mutation.
                    self.recency.push_back(candidate);
                    continue;
                }
                self.pages.remove(&candidate);
                return Ok(());
            }
        }
        Err(VdoError::assertion("page cache full of pinned or dirty pages"))
    }

    pub fn mark_dirty(&mut self, page_number: u64) -> Result<()> {
        let page = self
            .pages
            .get_mut(&page_number)
            .ok_or_else(|| VdoError::assertion(format!("mark_dirty of absent page {page_number}")))?;
        page.dirty = true;
        Ok(())
    }

    pub fn mark_clean(&mut self, page_number: u64) -> Result<()> {
        let page = self
            .pages
            .get_mut(&page_number)
            .ok_or_else(|| VdoError::assertion(format!("mark_clean of absent page {page_number}")))?;
        page.dirty = false;
        Ok(())
    }

    pub fn dirty_page_numbers(&self) -> Vec<u64> {
        self.pages.iter().filter(|(_, p)| p.dirty).map(|(&n, _)| n).collect()
    }

    pub fn get(&self, page_number: u64) -> Option<&T> {
        self.pages.get(&page_number).map(|p| &p.contents)
    }

    pub fn resident_count(&self) -> usize {
        self.pages.len()
    }
}
