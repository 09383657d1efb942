//! Page cache in front of the safe reader.
//!
//! Structure walks issue many small reads that land on the same few pages.
//! Caching whole 4 KiB pages for a short interval amortises the per-read
//! syscall. Entries expire after 100 ms so the cache never serves state
//! from more than a tick or two ago; reads that cross a page boundary or
//! exceed a page bypass the cache entirely.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::domain::{VmAddr, VmError};

use super::PAGE_SIZE;

const MAX_CACHED_PAGES: usize = 64;
const CACHE_TTL: Duration = Duration::from_millis(100);

#[must_use]
pub fn page_base(addr: usize) -> usize {
    addr & !(PAGE_SIZE - 1)
}

#[must_use]
pub fn page_offset(addr: usize) -> usize {
    addr & (PAGE_SIZE - 1)
}

struct CachedPage {
    data: Box<[u8; PAGE_SIZE]>,
    stamp: Instant,
}

pub struct PageCache {
    ttl: Duration,
    capacity: usize,
    pages: HashMap<usize, CachedPage>,
    // Most recently used first.
    lru: Vec<usize>,
}

impl PageCache {
    #[must_use]
    pub fn new() -> Self {
        Self::with_params(CACHE_TTL, MAX_CACHED_PAGES)
    }

    #[must_use]
    pub fn with_params(ttl: Duration, capacity: usize) -> Self {
        Self { ttl, capacity: capacity.max(1), pages: HashMap::new(), lru: Vec::new() }
    }

    /// Serve `dst` from a cached page, fetching the page through `fetch` on
    /// a miss. The caller guarantees the read fits within one page.
    ///
    /// # Errors
    /// Propagates the fetch error; nothing is cached on a failed fetch.
    pub fn read<F>(&mut self, addr: VmAddr, dst: &mut [u8], fetch: F) -> Result<(), VmError>
    where
        F: FnOnce(VmAddr, &mut [u8]) -> Result<(), VmError>,
    {
        debug_assert!(page_offset(addr.0) + dst.len() <= PAGE_SIZE);

        let base = page_base(addr.0);
        let offset = page_offset(addr.0);

        let fresh = self.pages.get(&base).is_some_and(|p| p.stamp.elapsed() < self.ttl);
        if fresh {
            let page = &self.pages[&base];
            dst.copy_from_slice(&page.data[offset..offset + dst.len()]);
            self.touch(base);
            return Ok(());
        }

        // Miss or expired entry: load the whole page.
        let mut data: Box<[u8; PAGE_SIZE]> = Box::new([0u8; PAGE_SIZE]);
        fetch(VmAddr(base), &mut data[..])?;
        dst.copy_from_slice(&data[offset..offset + dst.len()]);

        self.evict_for_insert();
        self.pages.insert(base, CachedPage { data, stamp: Instant::now() });
        self.touch(base);
        Ok(())
    }

    pub fn clear(&mut self) {
        self.pages.clear();
        self.lru.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    fn touch(&mut self, base: usize) {
        if let Some(pos) = self.lru.iter().position(|&b| b == base) {
            self.lru.remove(pos);
        }
        self.lru.insert(0, base);
    }

    fn evict_for_insert(&mut self) {
        while self.pages.len() >= self.capacity {
            let Some(base) = self.lru.pop() else { break };
            self.pages.remove(&base);
        }
    }
}

impl Default for PageCache {
    fn default() -> Self {
        Self::new()
    }
}
