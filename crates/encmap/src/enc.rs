//! Lazily decrypted page cache over an encrypted file mapping.
//!
//! The file holds ciphertext; plaintext exists only inside the mlocked
//! page pool. A page is decrypted on first touch, re-encrypted back to
//! the file when it is evicted or synced. Contiguous dirty pages are
//! *glued* on eviction: the cipher stream offset is set once at the run's
//! start and the whole run is encrypted in one continuous keystream pass.
//!
//! The head of the file (`plaintext_prefix` bytes) is copied verbatim in
//! both directions so the preamble stays readable by external tooling.

use std::collections::BTreeMap;
use std::fs::File;
use std::sync::Arc;

use memmap2::{MmapMut, MmapOptions};
use parking_lot::Mutex;
use tracing::debug;

use crate::cipher::StreamCipher;
use crate::error::{EncMapError, EncMapResult};
use crate::mapping::{check_bounds, AccessMode, Mapping, MappingOptions};
use crate::pool::{PageManager, PageManagerPool, PageRef};

/// Upper bound on pages flushed per eviction pass.
const FLUSH_LIMIT: usize = 100;

/// Pages prefetched after a fault in [`AccessMode::Read`].
const READ_AHEAD_PAGES: usize = 100;

struct Resident {
    page: PageRef,
    dirty: bool,
}

struct EncInner {
    /// Ciphertext file mapping.
    raw: MmapMut,
    /// Plaintext page pool, checked out of the shared manager pool.
    mgr: Option<PageManager>,
    /// Faulted-in pages by virtual page number. Iteration order doubles
    /// as the eviction order.
    resident: BTreeMap<usize, Resident>,
    cipher: StreamCipher,
    mode: AccessMode,
    read_ahead: usize,
}

/// Byte-addressable view of an encrypted file.
pub struct EncMapping {
    inner: Mutex<EncInner>,
    vmem_size: usize,
    page_size: usize,
    pages_cnt: usize,
    last_page_size: usize,
    plaintext_prefix: usize,
    sync_on_destroy: bool,
    pool: Arc<PageManagerPool>,
}

impl EncMapping {
    pub fn new(
        file: &File,
        key: &[u8],
        options: &MappingOptions,
        pool: &Arc<PageManagerPool>,
    ) -> EncMapResult<Self> {
        let vmem_size = file.metadata()?.len() as usize;
        let page_size = options.cache_page_size;
        if page_size == 0 {
            return Err(EncMapError::invalid_config("cache page size must be non-zero"));
        }
        if options.plaintext_prefix > vmem_size {
            return Err(EncMapError::invalid_config(format!(
                "plaintext prefix {} exceeds file size {vmem_size}",
                options.plaintext_prefix
            )));
        }

        // SAFETY: the cache owns this file exclusively for the life of
        // the process.
        let raw = unsafe { MmapOptions::new().len(vmem_size).map_mut(file)? };

        let mut pages_cnt = vmem_size / page_size;
        let mut last_page_size = page_size;
        if vmem_size % page_size != 0 {
            last_page_size = vmem_size % page_size;
            pages_cnt += 1;
        }

        let mgr = pool.allocate(page_size, options.cache_total_size)?;
        let cipher = StreamCipher::new(key)?;

        debug!(
            vmem_size,
            page_size,
            pages_cnt,
            last_page_size,
            pool_pages = mgr.capacity(),
            "created encrypted mapping"
        );

        Ok(Self {
            inner: Mutex::new(EncInner {
                raw,
                mgr: Some(mgr),
                resident: BTreeMap::new(),
                cipher,
                mode: AccessMode::ReadWrite,
                read_ahead: 0,
            }),
            vmem_size,
            page_size,
            pages_cnt,
            last_page_size,
            plaintext_prefix: options.plaintext_prefix,
            sync_on_destroy: options.sync_on_destroy,
            pool: Arc::clone(pool),
        })
    }

    #[inline]
    fn effective_page_size(&self, page_no: usize) -> usize {
        if page_no + 1 == self.pages_cnt {
            self.last_page_size
        } else {
            self.page_size
        }
    }

    /// Bytes at the start of page `page_no` that stay plaintext.
    #[inline]
    fn plaintext_overlap(&self, page_no: usize) -> usize {
        let off = page_no * self.page_size;
        if off < self.plaintext_prefix {
            (self.plaintext_prefix - off).min(self.effective_page_size(page_no))
        } else {
            0
        }
    }

    /// Decrypts the ciphertext slice of `page_no` into `page`.
    fn decrypt_page(&self, inner: &mut EncInner, page_no: usize, page: PageRef) {
        let n = self.effective_page_size(page_no);
        let off = page_no * self.page_size;
        let unenc = self.plaintext_overlap(page_no);

        let mgr = inner.mgr.as_mut().expect("page manager present");
        let dst = &mut mgr.page_mut(page)[..n];
        dst.copy_from_slice(&inner.raw[off..off + n]);
        if n > unenc {
            inner.cipher.set_stream_offset((off + unenc) as u64);
            inner.cipher.apply(&mut dst[unenc..]);
        }
    }

    /// Re-encrypts one resident page back into the file mapping.
    fn encrypt_page(&self, inner: &mut EncInner, page_no: usize, page: PageRef) {
        let n = self.effective_page_size(page_no);
        let off = page_no * self.page_size;
        let unenc = self.plaintext_overlap(page_no);

        let mgr = inner.mgr.as_ref().expect("page manager present");
        let src = &mgr.page(page)[..n];
        let dst = &mut inner.raw[off..off + n];
        dst.copy_from_slice(src);
        if n > unenc {
            inner.cipher.set_stream_offset((off + unenc) as u64);
            inner.cipher.apply(&mut dst[unenc..]);
        }
    }

    /// Encrypts a run of consecutive dirty pages with a single stream
    /// positioning; the keystream flows continuously across the run.
    fn flush_run(&self, inner: &mut EncInner, run: &[(usize, PageRef)]) {
        let mut seeked = false;
        for &(page_no, page) in run {
            let n = self.effective_page_size(page_no);
            let off = page_no * self.page_size;
            let unenc = self.plaintext_overlap(page_no);

            let mgr = inner.mgr.as_ref().expect("page manager present");
            let src = &mgr.page(page)[..n];
            let dst = &mut inner.raw[off..off + n];
            dst.copy_from_slice(src);
            if n > unenc {
                if !seeked || unenc > 0 {
                    inner.cipher.set_stream_offset((off + unenc) as u64);
                    seeked = true;
                }
                inner.cipher.apply(&mut dst[unenc..]);
            }
        }
    }

    /// Frees up to [`FLUSH_LIMIT`] resident pages, flushing dirty ones.
    fn evict(&self, inner: &mut EncInner) {
        let victims: Vec<(usize, PageRef, bool)> = inner
            .resident
            .iter()
            .take(FLUSH_LIMIT)
            .map(|(&no, r)| (no, r.page, r.dirty))
            .collect();

        let mut run: Vec<(usize, PageRef)> = Vec::new();
        let mut flushed = 0usize;
        for &(page_no, page, dirty) in &victims {
            if !dirty {
                continue;
            }
            if let Some(&(last_no, _)) = run.last() {
                if last_no + 1 != page_no {
                    self.flush_run(inner, &run);
                    run.clear();
                }
            }
            run.push((page_no, page));
            flushed += 1;
        }
        if !run.is_empty() {
            self.flush_run(inner, &run);
        }

        for &(page_no, page, _) in &victims {
            inner.resident.remove(&page_no);
            inner.mgr.as_mut().expect("page manager present").free(page);
        }
        debug!(flushed, freed = victims.len(), "evicted cache pages");
    }

    /// Ensures `page_no` is resident, evicting if the pool is exhausted
    /// and prefetching in read mode.
    fn fault_in(&self, inner: &mut EncInner, page_no: usize) -> EncMapResult<()> {
        debug_assert!(page_no < self.pages_cnt);
        if inner.resident.contains_key(&page_no) {
            return Ok(());
        }

        let page = {
            let mgr = inner.mgr.as_mut().expect("page manager present");
            mgr.alloc()
        };
        let page = match page {
            Some(p) => p,
            None => {
                self.evict(inner);
                inner
                    .mgr
                    .as_mut()
                    .expect("page manager present")
                    .alloc()
                    .ok_or_else(|| EncMapError::invalid_state("page pool empty after eviction"))?
            }
        };
        self.decrypt_page(inner, page_no, page);
        inner.resident.insert(
            page_no,
            Resident {
                page,
                dirty: false,
            },
        );

        if inner.mode == AccessMode::Read && inner.read_ahead > 0 {
            // Prefetch is best effort: never evict for it, stop at the
            // first pool exhaustion.
            let mut next = page_no;
            for _ in 0..inner.read_ahead {
                next = if next + 1 < self.pages_cnt { next + 1 } else { 0 };
                if inner.resident.contains_key(&next) {
                    continue;
                }
                let Some(p) = inner.mgr.as_mut().expect("page manager present").alloc() else {
                    break;
                };
                self.decrypt_page(inner, next, p);
                inner.resident.insert(next, Resident { page: p, dirty: false });
            }
        }
        Ok(())
    }

    /// Runs `f` over each page slice intersecting `[offset, offset+len)`.
    fn for_each_page<F>(&self, offset: usize, len: usize, mut f: F) -> EncMapResult<()>
    where
        F: FnMut(&mut EncInner, usize, PageRef, usize, usize) -> EncMapResult<()>,
    {
        check_bounds(offset, len, self.vmem_size)?;
        let mut inner = self.inner.lock();
        let mut pos = offset;
        let end = offset + len;
        while pos < end {
            let page_no = pos / self.page_size;
            let in_page = pos % self.page_size;
            let n = (end - pos).min(self.effective_page_size(page_no) - in_page);
            self.fault_in(&mut inner, page_no)?;
            let page = inner.resident[&page_no].page;
            f(&mut inner, page_no, page, in_page, n)?;
            pos += n;
        }
        Ok(())
    }

    fn sync_pages(&self, inner: &mut EncInner, first_page: usize, last_page: usize) {
        let dirty: Vec<(usize, PageRef)> = inner
            .resident
            .range(first_page..=last_page)
            .filter(|(_, r)| r.dirty)
            .map(|(&no, r)| (no, r.page))
            .collect();
        for (page_no, page) in dirty {
            self.encrypt_page(inner, page_no, page);
            if let Some(r) = inner.resident.get_mut(&page_no) {
                r.dirty = false;
            }
        }
    }
}

impl Mapping for EncMapping {
    fn len(&self) -> usize {
        self.vmem_size
    }

    fn read(&self, offset: usize, buf: &mut [u8]) -> EncMapResult<()> {
        let len = buf.len();
        let mut done = 0usize;
        self.for_each_page(offset, len, |inner, _page_no, page, in_page, n| {
            let mgr = inner.mgr.as_ref().expect("page manager present");
            buf[done..done + n].copy_from_slice(&mgr.page(page)[in_page..in_page + n]);
            done += n;
            Ok(())
        })
    }

    fn write(&self, offset: usize, data: &[u8]) -> EncMapResult<()> {
        let mut done = 0usize;
        self.for_each_page(offset, data.len(), |inner, page_no, page, in_page, n| {
            let mgr = inner.mgr.as_mut().expect("page manager present");
            mgr.page_mut(page)[in_page..in_page + n].copy_from_slice(&data[done..done + n]);
            done += n;
            inner.resident.get_mut(&page_no).expect("resident").dirty = true;
            Ok(())
        })
    }

    fn zero(&self, offset: usize, len: usize) -> EncMapResult<()> {
        self.for_each_page(offset, len, |inner, page_no, page, in_page, n| {
            let mgr = inner.mgr.as_mut().expect("page manager present");
            mgr.page_mut(page)[in_page..in_page + n].fill(0);
            inner.resident.get_mut(&page_no).expect("resident").dirty = true;
            Ok(())
        })
    }

    fn sync_range(&self, offset: usize, len: usize) -> EncMapResult<()> {
        check_bounds(offset, len, self.vmem_size)?;
        if len == 0 {
            return Ok(());
        }
        let first_page = offset / self.page_size;
        let last_page = (offset + len - 1) / self.page_size;

        let mut inner = self.inner.lock();
        self.sync_pages(&mut inner, first_page, last_page);

        // The file range to flush spans whole cache pages.
        let start = first_page * self.page_size;
        let end = last_page * self.page_size + self.effective_page_size(last_page);
        inner.raw.flush_range(start, end - start)?;
        Ok(())
    }

    fn sync(&self) -> EncMapResult<()> {
        let mut inner = self.inner.lock();
        if self.pages_cnt > 0 {
            self.sync_pages(&mut inner, 0, self.pages_cnt - 1);
        }
        inner.raw.flush()?;
        Ok(())
    }

    fn set_key(&self, key: &[u8]) -> EncMapResult<()> {
        let mut inner = self.inner.lock();
        let cipher = StreamCipher::new(key)?;
        inner.cipher = cipher;

        // Resident pages were decrypted with the old key; flushing them
        // now would corrupt the file. Drop them all.
        inner.resident.clear();
        inner.mgr.as_mut().expect("page manager present").free_all();
        Ok(())
    }

    fn set_access_mode(&self, mode: AccessMode) {
        let mut inner = self.inner.lock();
        inner.mode = mode;
        inner.read_ahead = match mode {
            AccessMode::Read => READ_AHEAD_PAGES,
            AccessMode::ReadWrite => 0,
        };
    }
}

impl Drop for EncMapping {
    fn drop(&mut self) {
        if self.sync_on_destroy {
            let _ = self.sync();
        }
        let mgr = self.inner.lock().mgr.take();
        if let Some(mgr) = mgr {
            self.pool.free(mgr);
        }
    }
}

impl std::fmt::Debug for EncMapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncMapping")
            .field("vmem_size", &self.vmem_size)
            .field("page_size", &self.page_size)
            .field("pages_cnt", &self.pages_cnt)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::generate_file_key;
    use crate::pool::os_page_size;

    fn scratch_file(len: usize) -> File {
        let file = tempfile::tempfile().unwrap();
        file.set_len(len as u64).unwrap();
        file
    }

    fn options(page_size: usize, pool_pages: usize, prefix: usize) -> MappingOptions {
        MappingOptions {
            encrypt: true,
            cache_page_size: page_size,
            cache_total_size: page_size * pool_pages,
            sync_on_destroy: false,
            plaintext_prefix: prefix,
        }
    }

    #[test]
    fn write_read_round_trip_under_pool_pressure() {
        let page = os_page_size();
        let file = scratch_file(page * 8);
        let pool = Arc::new(PageManagerPool::default());
        let key = generate_file_key();
        let map = EncMapping::new(&file, &key, &options(page, 2, 0), &pool).unwrap();

        // One byte per page; pool holds only 2 pages, so earlier pages
        // are evicted (and re-encrypted) along the way.
        for i in 0..8u8 {
            map.write(i as usize * page, &[i]).unwrap();
        }
        map.sync().unwrap();
        for i in 0..8u8 {
            let mut b = [0u8; 1];
            map.read(i as usize * page, &mut b).unwrap();
            assert_eq!(b[0], i);
        }
    }

    #[test]
    fn file_bytes_are_ciphertext_after_sync() {
        let page = os_page_size();
        let file = scratch_file(page * 2);
        let pool = Arc::new(PageManagerPool::default());
        let key = generate_file_key();
        let map = EncMapping::new(&file, &key, &options(page, 2, 0), &pool).unwrap();

        let payload = vec![0x5au8; 64];
        map.write(0, &payload).unwrap();
        map.sync().unwrap();

        // Read the raw file: the synced bytes must not be the plaintext.
        use std::io::{Read as _, Seek as _, SeekFrom};
        let mut f = file.try_clone().unwrap();
        f.seek(SeekFrom::Start(0)).unwrap();
        let mut raw = vec![0u8; 64];
        f.read_exact(&mut raw).unwrap();
        assert_ne!(raw, payload);
    }

    #[test]
    fn plaintext_prefix_stays_plaintext() {
        let page = os_page_size();
        let file = scratch_file(page * 2);
        let pool = Arc::new(PageManagerPool::default());
        let key = generate_file_key();
        let map = EncMapping::new(&file, &key, &options(page, 2, 128), &pool).unwrap();

        map.write(0, b"Version: 2\n").unwrap();
        map.write(200, b"secret").unwrap();
        map.sync().unwrap();

        use std::io::{Read as _, Seek as _, SeekFrom};
        let mut f = file.try_clone().unwrap();
        f.seek(SeekFrom::Start(0)).unwrap();
        let mut raw = vec![0u8; 256];
        f.read_exact(&mut raw).unwrap();
        assert_eq!(&raw[..11], b"Version: 2\n");
        assert_ne!(&raw[200..206], b"secret");
    }

    #[test]
    fn reopen_with_same_key_sees_same_bytes() {
        let page = os_page_size();
        let file = scratch_file(page * 4);
        let pool = Arc::new(PageManagerPool::default());
        let key = generate_file_key();

        {
            let map = EncMapping::new(&file, &key, &options(page, 2, 0), &pool).unwrap();
            map.write(page + 17, b"durable bytes").unwrap();
            map.sync().unwrap();
        }
        {
            let map = EncMapping::new(&file, &key, &options(page, 2, 0), &pool).unwrap();
            let mut buf = [0u8; 13];
            map.read(page + 17, &mut buf).unwrap();
            assert_eq!(&buf, b"durable bytes");
        }
    }

    #[test]
    fn set_key_discards_residency() {
        let page = os_page_size();
        let file = scratch_file(page * 2);
        let pool = Arc::new(PageManagerPool::default());
        let key = generate_file_key();
        let map = EncMapping::new(&file, &key, &options(page, 2, 0), &pool).unwrap();

        map.write(0, b"before").unwrap();
        map.sync().unwrap();

        // Same key re-installed: cached pages are dropped, but the file
        // decrypts to the same bytes.
        map.set_key(&key).unwrap();
        let mut buf = [0u8; 6];
        map.read(0, &mut buf).unwrap();
        assert_eq!(&buf, b"before");

        // A different key makes the same ciphertext unreadable.
        let other = generate_file_key();
        map.set_key(&other).unwrap();
        map.read(0, &mut buf).unwrap();
        assert_ne!(&buf, b"before");
    }

    #[test]
    fn unaligned_tail_page() {
        let page = os_page_size();
        let file = scratch_file(page * 3 + 100);
        let pool = Arc::new(PageManagerPool::default());
        let key = generate_file_key();
        let map = EncMapping::new(&file, &key, &options(page, 2, 0), &pool).unwrap();

        map.write(page * 3 + 40, &[7u8; 60]).unwrap();
        map.sync().unwrap();

        let mut buf = [0u8; 60];
        map.read(page * 3 + 40, &mut buf).unwrap();
        assert_eq!(buf, [7u8; 60]);
        assert!(map.read(page * 3 + 41, &mut buf).is_err());
    }

    #[test]
    fn cross_page_write() {
        let page = os_page_size();
        let file = scratch_file(page * 4);
        let pool = Arc::new(PageManagerPool::default());
        let key = generate_file_key();
        let map = EncMapping::new(&file, &key, &options(page, 2, 0), &pool).unwrap();

        let data: Vec<u8> = (0..page + 100).map(|i| (i % 251) as u8).collect();
        map.write(page - 50, &data).unwrap();
        map.sync().unwrap();

        let mut buf = vec![0u8; data.len()];
        map.read(page - 50, &mut buf).unwrap();
        assert_eq!(buf, data);
    }

    #[test]
    fn read_mode_prefetches() {
        let page = os_page_size();
        let file = scratch_file(page * 8);
        let pool = Arc::new(PageManagerPool::default());
        let key = generate_file_key();
        let map = EncMapping::new(&file, &key, &options(page, 8, 0), &pool).unwrap();

        map.set_access_mode(AccessMode::Read);
        let mut b = [0u8; 1];
        map.read(0, &mut b).unwrap();
        // All eight pages fit the pool, so the fault prefetched the rest.
        assert_eq!(map.inner.lock().resident.len(), 8);
    }
}
