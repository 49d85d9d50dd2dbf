//! Physical page pool: fixed, mlocked plaintext buffers.
//!
//! Plaintext only ever lives in these pages. The backing store is an
//! unlinked temp file mapped shared and locked into RAM, so decrypted
//! bytes are not swapped out and vanish with the process. Managers are
//! expensive to set up, so short-lived mappings check them out of a
//! [`PageManagerPool`] instead of constructing their own.

use std::fs::File;

use memmap2::{MmapMut, MmapOptions};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{EncMapError, EncMapResult};

/// Lower bound on pool capacity, in pages.
///
/// A copy that straddles a page boundary needs both pages resident at
/// once; a single-page pool would thrash forever on such a copy.
const POOL_PAGES_MIN: usize = 2;

/// Upper bound on pool capacity, in pages. Larger caches should use a
/// larger page size instead.
const POOL_PAGES_MAX: usize = 512;

/// Handle to one page inside a [`PageManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRef {
    index: usize,
}

impl PageRef {
    /// Byte offset of this page inside the pool's backing mapping.
    #[inline]
    pub fn offset(self, page_size: usize) -> usize {
        self.index * page_size
    }
}

/// Returns the OS page size in bytes.
pub fn os_page_size() -> usize {
    // SAFETY: sysconf with a valid name has no side effects.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// Fixed pool of page-sized, page-aligned plaintext buffers.
pub struct PageManager {
    create_size: usize,
    page_size: usize,
    pages_cnt: usize,
    map: MmapMut,
    // Keeps the unlinked backing file open for the lifetime of the map.
    _file: File,
    free: Vec<PageRef>,
}

impl PageManager {
    /// Creates a pool able to hold `size` bytes of plaintext in pages of
    /// `page_size` bytes. `page_size` must be a non-zero multiple of the
    /// OS page size. Capacity is clamped to [2, 512] pages.
    pub fn new(size: usize, page_size: usize) -> EncMapResult<Self> {
        let os_page = os_page_size();
        if page_size == 0 || page_size % os_page != 0 {
            return Err(EncMapError::invalid_config(format!(
                "page size {page_size} is not a multiple of the OS page size {os_page}"
            )));
        }

        let mut pages_cnt = size / page_size;
        if size % page_size != 0 {
            pages_cnt += 1;
        }
        let pages_cnt = pages_cnt.clamp(POOL_PAGES_MIN, POOL_PAGES_MAX);

        let total = pages_cnt * page_size;
        let file = tempfile::tempfile()?;
        file.set_len(total as u64)?;
        // SAFETY: the file is private (unlinked) and sized above; nobody
        // else can truncate it under us.
        let map = unsafe { MmapOptions::new().len(total).map_mut(&file)? };
        if let Err(err) = map.lock() {
            warn!(
                error = %err,
                "mlock of the plaintext page pool failed; decrypted pages may be swapped to disk"
            );
        }

        debug!(
            pages = pages_cnt,
            page_size,
            requested = size,
            allocated = total,
            "created plaintext page pool"
        );

        let free = (0..pages_cnt).rev().map(|index| PageRef { index }).collect();
        Ok(Self {
            create_size: size,
            page_size,
            pages_cnt,
            map,
            _file: file,
            free,
        })
    }

    /// Takes a page from the free list, or `None` if the pool is
    /// exhausted; eviction is the caller's responsibility.
    pub fn alloc(&mut self) -> Option<PageRef> {
        self.free.pop()
    }

    /// Returns a page to the free list.
    pub fn free(&mut self, page: PageRef) {
        debug_assert!(page.index < self.pages_cnt);
        debug_assert!(!self.free.contains(&page));
        self.free.push(page);
    }

    /// Resets the pool: every page becomes free again.
    pub fn free_all(&mut self) {
        self.free.clear();
        self.free
            .extend((0..self.pages_cnt).rev().map(|index| PageRef { index }));
    }

    /// The `(size, page_size)` this pool was constructed with. The actual
    /// capacity may differ because of the [2, 512] page clamp.
    pub fn create_params(&self) -> (usize, usize) {
        (self.create_size, self.page_size)
    }

    /// Number of pages in the pool.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.pages_cnt
    }

    /// Page size of this pool in bytes.
    #[inline]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Plaintext bytes of `page`.
    pub fn page(&self, page: PageRef) -> &[u8] {
        let off = page.offset(self.page_size);
        &self.map[off..off + self.page_size]
    }

    /// Mutable plaintext bytes of `page`.
    pub fn page_mut(&mut self, page: PageRef) -> &mut [u8] {
        let off = page.offset(self.page_size);
        &mut self.map[off..off + self.page_size]
    }
}

impl std::fmt::Debug for PageManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageManager")
            .field("pages_cnt", &self.pages_cnt)
            .field("page_size", &self.page_size)
            .field("free", &self.free.len())
            .finish()
    }
}

/// Default number of idle managers a [`PageManagerPool`] retains.
const MANAGERS_POOL_SIZE: usize = 10;

/// Idle managers older than this many allocations are garbage collected.
const AGE_THRESHOLD: u64 = 10;

/// Garbage collection runs once every this many allocations.
const ERASE_TRIGGER: u64 = 10;

struct IdleManager {
    timestamp: u64,
    size: usize,
    page_size: usize,
    manager: PageManager,
}

/// Pool of idle [`PageManager`]s, amortising pool construction across
/// many short-lived mappings.
///
/// Pass one instance (usually behind an `Arc`) to every mapping factory
/// in the engine; there is deliberately no process-wide singleton.
pub struct PageManagerPool {
    inner: Mutex<PoolInner>,
}

struct PoolInner {
    idle: Vec<IdleManager>,
    capacity: usize,
    timestamp: u64,
}

impl PageManagerPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(PoolInner {
                idle: Vec::new(),
                capacity,
                timestamp: 0,
            }),
        }
    }

    /// Checks out a manager able to serve `size` bytes in `page_size`
    /// pages, reusing an idle one when it fits. Once every
    /// [`ERASE_TRIGGER`] allocations, idle managers not touched for
    /// [`AGE_THRESHOLD`] allocations are dropped.
    pub fn allocate(&self, page_size: usize, size: usize) -> EncMapResult<PageManager> {
        let mut inner = self.inner.lock();
        inner.timestamp += 1;
        let now = inner.timestamp;

        if now % ERASE_TRIGGER == 0 {
            inner
                .idle
                .retain(|m| m.timestamp + AGE_THRESHOLD >= now && m.timestamp <= now);
        }

        if let Some(pos) = inner
            .idle
            .iter()
            .position(|m| m.size >= size && m.page_size >= page_size)
        {
            debug!("reusing pooled page manager");
            return Ok(inner.idle.swap_remove(pos).manager);
        }

        drop(inner);
        PageManager::new(size, page_size)
    }

    /// Returns a manager to the pool; dropped outright if the pool is
    /// full.
    pub fn free(&self, mut manager: PageManager) {
        manager.free_all();
        let mut inner = self.inner.lock();
        if inner.idle.len() < inner.capacity {
            let (size, page_size) = manager.create_params();
            let timestamp = inner.timestamp;
            inner.idle.push(IdleManager {
                timestamp,
                size,
                page_size,
                manager,
            });
        }
    }

    /// Number of idle managers currently held.
    pub fn idle_count(&self) -> usize {
        self.inner.lock().idle.len()
    }
}

impl Default for PageManagerPool {
    fn default() -> Self {
        Self::new(MANAGERS_POOL_SIZE)
    }
}

impl std::fmt::Debug for PageManagerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageManagerPool")
            .field("idle", &self.idle_count())
            .finish()
    }
}
