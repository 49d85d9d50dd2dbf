//! The ring-buffer store.
//!
//! Layout of the file: `[preamble | reserved i64 | payload... | sentinel
//! slot]`. Buffers are carved out of the payload region in file order;
//! `first` chases the oldest live byte, `next` marks the first free one.
//! When the tail cannot hold a request the allocator rolls over to the
//! start, leaving `size_trail` unused bytes behind the sentinel that
//! terminates the wrapped segment.
//!
//! Byte accounting. At all times
//! `size_free + size_used + size_released == size_cache`: `used` covers
//! buffers the replicator still owns, `released` covers ordered buffers
//! whose space waits for a discard, and everything else is `free` even
//! before the cursors catch up with it. `size_trail` is geometry, not
//! accounting: trail bytes stay in `free` until the cursors cycle past
//! them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use encmap::{create_mapping, AccessMode, Mapping, MappingOptions, MasterKeyProvider, PageManagerPool};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::CacheConfig;
use crate::error::{CacheError, CacheResult};
use crate::fs::open_ring_file;
use crate::header::{align_size, BufferHeader, BufferStore, ALIGNMENT, FLAG_RELEASED, HEADER_SIZE};
use crate::index::SeqnoIndex;
use crate::keyring;
use crate::preamble::{self, EncState, PREAMBLE_LEN};
use crate::types::{Offset, Seqno, SEQNO_ILL, SEQNO_NONE};

/// Reserved bytes between the preamble and the payload region.
pub const RESERVED_LEN: usize = 8;

/// Recovery progress callback: `(total_bytes, done_bytes)`.
pub type ProgressFn = Box<dyn Fn(u64, u64) + Send>;

/// Source of per-instance `ctx` handles stamped into buffer headers.
static NEXT_CTX: AtomicU64 = AtomicU64::new(1);

/// Fixed-size ring of write-set buffers over a (possibly encrypted)
/// file mapping.
///
/// The ring is the durable half of the replication cache: buffers are
/// carved out in file order, ordered by the certification pipeline,
/// released once applied and discarded when replication has moved past
/// them. Two cursors describe the live region — `first` chases the
/// oldest byte still of interest, `next` marks where the following
/// allocation goes — and the seqno index maps global ordering onto
/// those bytes.
///
/// # Concurrency
///
/// Single-writer: the replicator serializes every mutation behind its
/// own critical section, so the ring itself takes no locks. Most
/// embeddings hold it inside a mutex-guarded facade
/// ([`WriteSetCache`](crate::WriteSetCache)) shared with the donor and
/// the key-rotation observer.
///
/// # Addressing
///
/// All positions are byte [`Offset`]s from the start of the file; the
/// values handed out by [`alloc`](Self::alloc) point at buffer payloads
/// and the 32-byte header sits immediately before each one.
pub struct RingBuffer {
    mapping: Box<dyn Mapping>,
    provider: Option<Arc<MasterKeyProvider>>,
    progress: Option<ProgressFn>,

    pub(crate) gid: Uuid,
    pub(crate) enc: EncState,
    pub(crate) ctx: u64,

    pub(crate) start: usize,
    pub(crate) end: usize,
    pub(crate) first: usize,
    pub(crate) next: usize,

    pub(crate) size_cache: usize,
    pub(crate) size_free: usize,
    pub(crate) size_used: usize,
    pub(crate) size_released: usize,
    pub(crate) size_trail: usize,

    max_used: usize,
    freeze_purge_at_seqno: Seqno,
    seqno_locked: Seqno,
    debug: bool,

    pub(crate) index: SeqnoIndex,
}

impl RingBuffer {
    /// Opens the ring described by `config`, recovering or resetting the
    /// file contents as configured.
    ///
    /// The configuration is normalized first, the ring file created or
    /// resized, and the mapping layered over it (raw or encrypted). The
    /// preamble is then parsed: a clean file yields a targeted recovery
    /// from the stored cursor hint, an unclean one a blind rescan, and
    /// any structural inconsistency falls back to a full reset.
    ///
    /// # Arguments
    ///
    /// * `config` - Geometry, recovery policy and encryption settings.
    /// * `gid` - Expected history UUID; nil on a first start. The
    ///   preamble value wins when present, and a nil history skips
    ///   recovery entirely.
    /// * `provider` - Keyring access; required when encryption is
    ///   enabled, ignored otherwise.
    /// * `pool` - Shared pool of plaintext page managers for the
    ///   encrypted mapping.
    /// * `progress` - Optional callback fed `(total, done)` bytes while
    ///   the recovery scan walks the file.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors creating or mapping the file, on an invalid
    /// configuration (encryption without a provider), and on a keyring
    /// that can neither produce nor create a master key — the one
    /// startup condition that must abort rather than reset.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use std::sync::Arc;
    /// use encmap::PageManagerPool;
    /// use uuid::Uuid;
    /// use wscache::{CacheConfig, RingBuffer};
    ///
    /// let config = CacheConfig {
    ///     name: "./data/cache.ring".into(),
    ///     ..CacheConfig::default()
    /// };
    /// let pool = Arc::new(PageManagerPool::default());
    /// let ring = RingBuffer::open(&config, Uuid::new_v4(), None, &pool, None)?;
    /// assert_eq!(ring.size_used(), 0);
    /// # Ok::<(), wscache::CacheError>(())
    /// ```
    pub fn open(
        config: &CacheConfig,
        gid: Uuid,
        provider: Option<Arc<MasterKeyProvider>>,
        pool: &Arc<PageManagerPool>,
        progress: Option<ProgressFn>,
    ) -> CacheResult<Self> {
        let config = config.clone().normalized();
        let encrypt = config.enc.enabled;
        if encrypt && provider.is_none() {
            return Err(CacheError::invalid_config(
                "encryption enabled but no master key provider given",
            ));
        }

        let file = open_ring_file(&config.name, config.file_len())?;
        let options = MappingOptions {
            encrypt,
            cache_page_size: config.enc.cache_page_size,
            cache_total_size: config.enc.cache_total_size,
            sync_on_destroy: false,
            plaintext_prefix: PREAMBLE_LEN,
        };
        let mapping = create_mapping(&file, &options, pool)?;

        let end = mapping.len();
        let start = PREAMBLE_LEN + RESERVED_LEN;
        let size_cache = end - start - HEADER_SIZE;
        debug_assert_eq!(size_cache, config.size_bytes);
        debug_assert_eq!(start % ALIGNMENT, 0);

        let mut ring = Self {
            mapping,
            provider,
            progress,
            gid,
            enc: EncState {
                enabled: encrypt,
                ..EncState::default()
            },
            ctx: NEXT_CTX.fetch_add(1, Ordering::Relaxed),
            start,
            end,
            first: start,
            next: start,
            size_cache,
            size_free: size_cache,
            size_used: 0,
            size_released: 0,
            size_trail: 0,
            max_used: start + HEADER_SIZE,
            freeze_purge_at_seqno: config.freeze_purge_at_seqno,
            seqno_locked: SEQNO_ILL,
            debug: config.debug,
            index: SeqnoIndex::new(),
        };

        ring.open_preamble(config.recover_on_open)?;
        ring.clear_header(ring.next)?;
        Ok(ring)
    }

    // ---- header plumbing -------------------------------------------------

    pub(crate) fn read_header(&self, offset: usize) -> CacheResult<BufferHeader> {
        let mut buf = [0u8; HEADER_SIZE];
        self.mapping.read(offset, &mut buf)?;
        BufferHeader::decode(&buf)
            .ok_or_else(|| CacheError::corruption(format!("undecodable header at offset {offset}")))
    }

    /// Tolerant header read for the recovery scan: garbage decodes to
    /// `None` instead of an error.
    pub(crate) fn probe_header(&self, offset: usize) -> CacheResult<Option<BufferHeader>> {
        let mut buf = [0u8; HEADER_SIZE];
        self.mapping.read(offset, &mut buf)?;
        Ok(BufferHeader::decode(&buf).filter(|h| h.is_plausible(self.size_cache)))
    }

    pub(crate) fn write_header(&mut self, offset: usize, header: &BufferHeader) -> CacheResult<()> {
        debug_assert!(offset + HEADER_SIZE <= self.end);
        self.mapping.write(offset, &header.encode())?;
        Ok(())
    }

    /// Writes the rollover sentinel at `offset`.
    pub(crate) fn clear_header(&mut self, offset: usize) -> CacheResult<()> {
        self.write_header(offset, &BufferHeader::cleared())
    }

    /// Marks the buffer at `offset` discarded and returns its bytes to
    /// the free counter. The caller moves the bytes out of `used` or
    /// `released` first.
    pub(crate) fn mark_discarded(&mut self, offset: usize, header: &BufferHeader) -> CacheResult<()> {
        let mut h = *header;
        h.seqno_g = SEQNO_ILL;
        self.write_header(offset, &h)?;
        self.size_free += header.size as usize;
        debug_assert!(self.size_free <= self.size_cache);
        Ok(())
    }

    pub(crate) fn assert_sizes(&self) {
        // `size_trail` is geometry, not accounting: trail bytes stay in
        // `size_free` until the cursors cycle past them.
        debug_assert_eq!(
            self.size_free + self.size_used + self.size_released,
            self.size_cache,
            "size counters out of balance (free {} used {} released {} cache {})",
            self.size_free,
            self.size_used,
            self.size_released,
            self.size_cache
        );
    }

    // ---- allocation ------------------------------------------------------

    /// Allocates a buffer able to hold `len` payload bytes and returns
    /// the payload offset, or `None` when no space can be made.
    ///
    /// Placement prefers the tail of the ring; when the tail cannot hold
    /// the request the allocator rolls over to the start, reclaiming
    /// released buffers at `first` as it goes. Out of space is not an
    /// error: the caller decides whether to block, retry after a
    /// discard, or overflow to another store.
    ///
    /// # Arguments
    ///
    /// * `len` - Payload bytes requested; the 32-byte header and word
    ///   alignment are added internally. Zero-length requests are
    ///   refused.
    ///
    /// # Returns
    ///
    /// `Ok(Some(offset))` of the writable payload on success, `Ok(None)`
    /// when the request exceeds half the cache or no space could be
    /// reclaimed, and `Err` only for mapping I/O failures.
    ///
    /// A request above half the cache is rejected outright: the
    /// factor-of-two rule guarantees that any admissible request can
    /// eventually get a contiguous region once old buffers are released.
    pub fn alloc(&mut self, len: usize) -> CacheResult<Option<Offset>> {
        if len == 0 {
            return Ok(None);
        }
        let total = align_size(len + HEADER_SIZE);
        if total > self.size_cache / 2 || total > self.size_cache - self.size_used {
            return Ok(None);
        }

        let got = self.get_new_buffer(total)?;
        self.assert_sizes();
        Ok(got.map(|hdr_off| Offset::new((hdr_off + HEADER_SIZE) as u64)))
    }

    /// Finds room for a `total`-byte buffer (header included), discarding
    /// released buffers at `first` as needed. Returns the header offset.
    fn get_new_buffer(&mut self, total: usize) -> CacheResult<Option<usize>> {
        debug_assert_eq!(total % ALIGNMENT, 0);
        debug_assert!(self.read_header(self.next)?.is_clear());

        let size_next = total + HEADER_SIZE;
        let mut ret = self.next;

        if ret >= self.first {
            debug_assert_eq!(self.size_trail, 0);
            // Try to find space at the end.
            if self.end - ret >= size_next {
                debug_assert!(self.size_free >= total);
                return self.commit_buffer(ret, total).map(Some);
            }
            // No space at the end, go from the start.
            self.size_trail = self.end - ret;
            ret = self.start;
        }

        debug_assert!(ret <= self.first);

        while self.first - ret < size_next {
            // Try to discard the first buffer to get more space.
            let bh = self.read_header(self.first)?;

            let discardable = bh.is_released()
                && (bh.seqno_g <= 0 || self.discard_up_to(bh.seqno_g)?);
            if !discardable {
                // No more space to be made; revert a provisional trail.
                if self.next >= self.first {
                    self.size_trail = 0;
                }
                self.assert_sizes();
                return Ok(None);
            }

            debug_assert_ne!(self.first, self.next);
            // The buffer is either discarded now or was already.
            debug_assert_eq!(self.read_header(self.first)?.seqno_g, SEQNO_ILL);

            self.first += bh.size as usize;

            if self.read_header(self.first)?.is_clear() {
                // Rollover sentinel: check the tail once more, then wrap.
                debug_assert!(self.first >= self.next);
                debug_assert!(self.first >= ret);
                self.first = self.start;

                if self.end - ret >= size_next {
                    debug_assert!(self.size_free >= total);
                    self.size_trail = 0;
                    return self.commit_buffer(ret, total).map(Some);
                }
                self.size_trail = self.end - ret;
                ret = self.start;
            }

            debug_assert!(ret <= self.first);
        }

        self.commit_buffer(ret, total).map(Some)
    }

    /// Writes the header for a fresh buffer at `ret` and advances `next`.
    fn commit_buffer(&mut self, ret: usize, total: usize) -> CacheResult<usize> {
        debug_assert_eq!((ret - self.start) % ALIGNMENT, 0);
        self.size_used += total;
        debug_assert!(self.size_used <= self.size_cache);
        debug_assert!(self.size_free >= total);
        self.size_free -= total;

        let header = BufferHeader {
            size: total as u32,
            seqno_g: SEQNO_NONE,
            flags: 0,
            store: BufferStore::InRing,
            ctx: self.ctx,
        };
        self.write_header(ret, &header)?;
        self.next = ret + total;
        self.max_used = self.max_used.max(self.next + HEADER_SIZE);

        debug_assert!(self.next + HEADER_SIZE <= self.end);
        self.clear_header(self.next)?;
        self.assert_sizes();
        Ok(ret)
    }

    /// Grows (or keeps) the buffer at `offset` to hold `len` payload
    /// bytes.
    ///
    /// Two strategies, tried in order:
    ///
    /// - **Adjacent growth**: when the buffer ends exactly at `next`,
    ///   the missing bytes are allocated in place and the header simply
    ///   grows. A failed attempt is rolled back precisely, cursors and
    ///   counters included.
    /// - **Copy**: otherwise a new buffer is allocated, the payload
    ///   copied over and the old buffer discarded.
    ///
    /// # Arguments
    ///
    /// * `offset` - Payload offset of a live, unordered buffer returned
    ///   by [`alloc`](Self::alloc).
    /// * `len` - New payload size; a shrink keeps the buffer unchanged.
    ///
    /// # Returns
    ///
    /// `Ok(Some(offset))` of the (possibly relocated) payload, or
    /// `Ok(None)` when neither strategy could find room.
    pub fn realloc(&mut self, offset: Offset, len: usize) -> CacheResult<Option<Offset>> {
        let total = align_size(len + HEADER_SIZE);
        if total > self.size_cache / 2 {
            return Ok(None);
        }

        let hdr_off = offset.as_usize() - HEADER_SIZE;
        let header = self.read_header(hdr_off)?;
        let old_size = header.size as usize;
        if total <= old_size {
            return Ok(Some(offset));
        }
        let adj = total - old_size;

        // First try to grow in place by allocating the adjacent bytes.
        let adj_off = hdr_off + old_size;
        if adj_off == self.next {
            let trail_saved = self.size_trail;
            match self.get_new_buffer(adj)? {
                Some(got) if got == adj_off => {
                    let mut h = header;
                    h.size = (self.next - hdr_off) as u32;
                    self.write_header(hdr_off, &h)?;
                    self.assert_sizes();
                    return Ok(Some(offset));
                }
                Some(_) => {
                    // The allocation rolled over; give it back precisely.
                    self.next = adj_off;
                    self.clear_header(self.next)?;
                    self.size_used -= adj;
                    self.size_free += adj;
                    self.size_trail = if self.next < self.first { trail_saved } else { 0 };
                }
                None => {}
            }
            self.assert_sizes();
        }

        // Non-adjacent: allocate elsewhere and copy.
        let Some(new_off) = self.alloc(len)? else {
            return Ok(None);
        };
        let payload_len = old_size - HEADER_SIZE;
        let mut payload = vec![0u8; payload_len];
        self.mapping.read(offset.as_usize(), &mut payload)?;
        self.mapping.write(new_off.as_usize(), &payload)?;
        self.free(offset)?;
        self.assert_sizes();
        Ok(Some(new_off))
    }

    // ---- release and discard ---------------------------------------------

    /// Releases the buffer at `offset`. An unordered buffer is discarded
    /// on the spot; an ordered one keeps its bytes until
    /// [`discard_up_to`](Self::discard_up_to) reaches its seqno.
    pub fn free(&mut self, offset: Offset) -> CacheResult<()> {
        let hdr_off = offset.as_usize() - HEADER_SIZE;
        let mut header = self.read_header(hdr_off)?;
        if header.is_released() {
            return Err(CacheError::invalid_state(format!(
                "buffer at {offset} released twice"
            )));
        }
        header.flags |= FLAG_RELEASED;
        self.write_header(hdr_off, &header)?;

        debug_assert!(self.size_used >= header.size as usize);
        self.size_used -= header.size as usize;

        if header.seqno_g == SEQNO_NONE {
            self.mark_discarded(hdr_off, &header)?;
        } else {
            self.size_released += header.size as usize;
        }
        self.maybe_collapse();
        self.assert_sizes();
        Ok(())
    }

    /// Orders the buffer at `offset` under `seqno` and indexes it.
    pub fn assign_seqno(&mut self, offset: Offset, seqno: Seqno) -> CacheResult<()> {
        if seqno <= 0 {
            return Err(CacheError::SeqnoMisuse(seqno, "not a positive seqno".to_string()));
        }
        let hdr_off = offset.as_usize() - HEADER_SIZE;
        let mut header = self.read_header(hdr_off)?;
        if header.store != BufferStore::InRing || header.ctx != self.ctx {
            return Err(CacheError::corruption(format!(
                "buffer at {offset} is not owned by this ring"
            )));
        }
        if header.seqno_g != SEQNO_NONE {
            return Err(CacheError::SeqnoMisuse(
                seqno,
                format!("buffer already carries seqno {}", header.seqno_g),
            ));
        }
        self.index.insert(seqno, offset)?;
        header.seqno_g = seqno;
        self.write_header(hdr_off, &header)
    }

    /// True when the purge policy vetoes discarding `seqno`.
    fn skip_purge(&self, seqno: Seqno) -> bool {
        (self.freeze_purge_at_seqno != SEQNO_ILL && seqno >= self.freeze_purge_at_seqno)
            || (self.seqno_locked != SEQNO_ILL && seqno >= self.seqno_locked)
    }

    /// Discards every indexed buffer with seqno at most `up_to`. Stops
    /// and returns `false` at the first unreleased buffer or policy veto.
    pub fn discard_up_to(&mut self, up_to: Seqno) -> CacheResult<bool> {
        loop {
            let Some((seqno, offset)) = self.index.front() else {
                break;
            };
            if seqno > up_to {
                break;
            }
            if self.skip_purge(seqno) {
                return Ok(false);
            }

            let hdr_off = offset.as_usize() - HEADER_SIZE;
            let header = self.read_header(hdr_off)?;
            if header.store != BufferStore::InRing || header.ctx != self.ctx {
                return Err(CacheError::corruption(format!(
                    "index entry {seqno} points at a buffer this ring does not own"
                )));
            }
            if !header.is_released() {
                return Ok(false);
            }

            self.index.erase(seqno);
            debug_assert!(self.size_released >= header.size as usize);
            self.size_released -= header.size as usize;
            self.mark_discarded(hdr_off, &header)?;
            self.assert_sizes();
        }
        Ok(true)
    }

    /// Normalizes the cursors once a discard pass empties the ring, so
    /// an emptied ring is observationally a fresh one.
    pub(crate) fn maybe_collapse(&mut self) {
        if self.index.is_empty() && self.size_used == 0 && self.size_released == 0 {
            debug_assert_eq!(self.size_free, self.size_cache);
            self.first = self.next;
            self.size_trail = 0;
        }
    }

    // ---- seqno surface ---------------------------------------------------

    pub fn seqno_min(&self) -> Seqno {
        self.index.front().map_or(SEQNO_ILL, |(s, _)| s)
    }

    pub fn seqno_max(&self) -> Seqno {
        self.index.back().map_or(SEQNO_ILL, |(s, _)| s)
    }

    /// Pins the low-water mark: seqnos at or above `first_needed` stay
    /// in the ring while a donor streams them.
    pub fn seqno_lock(&mut self, first_needed: Seqno) {
        self.seqno_locked = first_needed;
    }

    pub fn seqno_unlock(&mut self) {
        self.seqno_locked = SEQNO_ILL;
    }

    /// Moves the purge freeze; [`SEQNO_ILL`] thaws it.
    pub fn freeze_purge_at(&mut self, seqno: Seqno) {
        self.freeze_purge_at_seqno = seqno;
    }

    /// Returns the payload bytes of the buffer ordered under `seqno`.
    pub fn get(&self, seqno: Seqno) -> CacheResult<Option<Vec<u8>>> {
        let Some(offset) = self.index.get(seqno) else {
            return Ok(None);
        };
        let header = self.read_header(offset.as_usize() - HEADER_SIZE)?;
        let mut payload = vec![0u8; header.size as usize - HEADER_SIZE];
        self.mapping.read(offset.as_usize(), &mut payload)?;
        Ok(Some(payload))
    }

    /// Copies `data` into the payload of the buffer at `offset`.
    pub fn write_payload(&mut self, offset: Offset, data: &[u8]) -> CacheResult<()> {
        let header = self.read_header(offset.as_usize() - HEADER_SIZE)?;
        if data.len() > header.size as usize - HEADER_SIZE {
            return Err(CacheError::invalid_state(format!(
                "payload of {} bytes exceeds buffer of {}",
                data.len(),
                header.size as usize - HEADER_SIZE
            )));
        }
        self.mapping.write(offset.as_usize(), data)?;
        Ok(())
    }

    // ---- space estimation and reset --------------------------------------

    /// Recomputes the size counters from the cursor positions, optionally
    /// zeroing the unused regions. Ordered-but-released bytes are settled
    /// afterwards by the caller's sweep.
    pub(crate) fn estimate_space(&mut self, zero_out: bool) -> CacheResult<()> {
        if self.first < self.next {
            /* start    first      next     end
             *   |        |##########|       |      */
            self.size_used = self.next - self.first;
            self.size_free = self.size_cache - self.size_used;
            self.size_trail = 0;
            if zero_out {
                self.mapping.zero(self.next, self.end - self.next)?;
                self.mapping.zero(self.start, self.first - self.start)?;
                self.mapping.sync()?;
            }
        } else {
            /* start    next       first    end
             *   |########|           |####|  |
             *                             ^ trail  */
            debug_assert!(self.size_trail > 0);
            self.size_free = self.first - self.next + self.size_trail - HEADER_SIZE;
            self.size_used = self.size_cache - self.size_free;
            if zero_out {
                self.mapping.zero(self.end - self.size_trail, self.size_trail)?;
                self.mapping.zero(self.next, self.first - self.next)?;
                self.mapping.sync()?;
            }
        }
        self.size_released = 0;
        self.assert_sizes();
        debug_assert!(self.size_free < self.size_cache);
        Ok(())
    }

    /// Invalidates every ordered buffer and rewinds the ring around the
    /// remaining unordered ones. Used when the cluster history changes:
    /// cached seqnos of the old incarnation must never be served again.
    pub fn seqno_reset(&mut self, zero_out: bool) -> CacheResult<()> {
        self.write_preamble(false)?;

        if self.size_cache == self.size_free {
            return Ok(());
        }

        // Invalidate seqnos for all ordered ring buffers so they cannot
        // be recovered on restart; remember the last one.
        let entries: Vec<(Seqno, Offset)> = self.index.iter().collect();
        let mut last: Option<usize> = None;
        for (_, offset) in entries {
            let hdr_off = offset.as_usize() - HEADER_SIZE;
            let mut header = self.read_header(hdr_off)?;
            if header.store != BufferStore::InRing {
                continue;
            }
            debug_assert!(header.is_released());
            self.size_released -= header.size as usize;
            self.size_used += header.size as usize;
            header.seqno_g = SEQNO_NONE;
            self.write_header(hdr_off, &header)?;
            last = Some(hdr_off);
        }
        self.index.clear();

        let Some(last_off) = last else {
            return Ok(()); // no ordered buffers in the ring
        };

        // Seek the first unreleased buffer. All ordered buffers are
        // released by now; anything unreleased comes from the new
        // configuration and sits between here and `next`.
        let old_free = self.size_free;
        self.first = last_off;
        loop {
            if self.first == self.next {
                break;
            }
            let header = self.read_header(self.first)?;
            if header.is_clear() {
                self.first = self.start; // rollover
                continue;
            }
            if !header.is_released() {
                break;
            }
            self.first += header.size as usize;
        }

        if self.first == self.next {
            info!("seqno reset emptied the ring, performing a full reset");
            return self.reset();
        }

        let first_header = self.read_header(self.first)?;
        debug_assert!(first_header.size > 0);
        debug_assert_eq!(first_header.seqno_g, SEQNO_NONE);
        debug_assert!(!first_header.is_released());

        self.estimate_space(zero_out)?;
        info!(
            discarded = self.size_free - old_free,
            "seqno reset discarded ordered buffers"
        );

        // Some released buffers may still be locked inside unreleased
        // aborted local actions: seek to `next`, discarding the strays.
        let mut total = 1usize;
        let mut locked = 0usize;
        let mut pos = self.first + first_header.size as usize;
        while pos != self.next {
            let header = self.read_header(pos)?;
            if header.size > 0 {
                total += 1;
                if header.seqno_g != SEQNO_NONE {
                    debug_assert!(header.is_released());
                    self.size_used -= header.size as usize;
                    self.mark_discarded(pos, &header)?;
                    locked += 1;
                }
                pos += header.size as usize;
            } else {
                debug_assert!(pos > self.next);
                pos = self.start; // rollover
            }
        }
        info!(locked, total, "seqno reset swept locked buffers");
        self.assert_sizes();

        // Avoid rescanning from `start` on recovery.
        if self.next > self.first && self.first > self.start {
            self.clear_header(self.start)?;
        }
        Ok(())
    }

    /// Full reset: empty index, rewound cursors, zeroed payload region.
    ///
    /// Used at every history change and as the fallback for any
    /// unrecoverable inconsistency.
    pub(crate) fn reset(&mut self) -> CacheResult<()> {
        self.write_preamble(false)?;
        self.index.clear();

        self.first = self.start;
        self.next = self.start;
        self.clear_header(self.next)?;

        self.size_free = self.size_cache;
        self.size_used = 0;
        self.size_released = 0;
        self.size_trail = 0;

        // A reset usually accompanies a new cluster incarnation; stale
        // seqnos of the old one must not survive in the file.
        info!("complete reset of the write-set cache");
        self.mapping.zero(self.start, self.size_cache)?;
        self.mapping.sync()?;
        Ok(())
    }

    // ---- preamble --------------------------------------------------------

    /// Composes and persists the preamble. `synced` is only written on a
    /// clean shutdown; the cursor hints it carries are trusted on the
    /// next open.
    pub fn write_preamble(&mut self, synced: bool) -> CacheResult<()> {
        let range = match (self.index.front(), self.index.back()) {
            (Some((min, _)), Some((max, _))) => Some((min, max, self.first as u64)),
            _ => None,
        };
        let block = preamble::compose(&self.gid, synced, range, &self.enc);
        self.mapping.write(0, &block)?;
        self.mapping.sync_range(0, PREAMBLE_LEN)?;
        Ok(())
    }

    /// Parses the preamble, settles encryption keys and either recovers
    /// or resets the ring contents.
    fn open_preamble(&mut self, do_recover: bool) -> CacheResult<()> {
        let mut block = vec![0u8; PREAMBLE_LEN];
        self.mapping.read(0, &mut block)?;
        let parsed = preamble::parse(&block);

        let mut version = parsed.version;
        if version > 16 {
            warn!(version, "bogus version in the ring preamble, assuming 0");
            version = 0;
        }

        let mut offset = parsed.offset;
        let offset_invalid = offset < -1
            || (offset >= 0
                && (offset as usize + HEADER_SIZE > self.end
                    || (version >= 2 && offset as usize % ALIGNMENT != 0)));
        if offset_invalid {
            warn!(offset, "bogus offset in the ring preamble, assuming unknown");
            offset = -1;
        }

        if parsed.gid != Uuid::nil() {
            self.gid = parsed.gid;
        }

        let encrypt = self.enc.enabled;
        self.enc = parsed.enc.clone();
        let mut force_reset = false;

        if self.enc.const_uuid.is_nil() {
            self.enc.const_uuid = Uuid::new_v4();
            info!(id = %self.enc.const_uuid, "generated new cache id");
        }

        if parsed.enc.enabled != encrypt {
            // Flipping encryption makes the payload unreadable either
            // way; recovery is pointless.
            info!(
                from = parsed.enc.enabled,
                to = encrypt,
                "switching cache encryption, this forces a reset"
            );
            self.enc.clear_keys();
            force_reset = true;
        }
        self.enc.enabled = encrypt;

        if encrypt {
            let stored_crc = parsed.enc_crc;
            let computed = parsed.enc.crc(parsed.enc_version);
            if stored_crc == 0 || stored_crc != computed {
                warn!(
                    expected = stored_crc,
                    calculated = computed,
                    "encryption header CRC mismatch, discarding the file key"
                );
                self.enc.wrapped_file_key.clear();
                self.enc.mk_id = 0;
            }

            let provider = self
                .provider
                .clone()
                .expect("provider presence checked in open");
            let opened = keyring::open_keys(&mut self.enc, &provider)?;
            force_reset |= opened.force_reset;
            self.mapping.set_key(&opened.file_key)?;
        }

        info!(
            version,
            gid = %self.gid,
            seqno_min = parsed.seqno_min,
            seqno_max = parsed.seqno_max,
            offset,
            synced = parsed.synced,
            encrypted = encrypt,
            mk_id = self.enc.mk_id,
            "opened ring preamble"
        );

        if force_reset {
            warn!("ring reset forced by preamble state");
            self.reset()?;
        } else if do_recover {
            if self.gid != Uuid::nil() {
                info!(gid = %self.gid, offset, "recovering ring buffer");
                if let Err(err) = self.recover(offset, version) {
                    warn!(error = %err, "ring recovery failed, resetting");
                    self.reset()?;
                }
            } else {
                info!("skipped ring recovery: history UUID unknown");
            }
        }

        self.write_preamble(false)
    }

    /// Clean shutdown: persist the synced preamble and flush everything.
    pub fn close(&mut self) -> CacheResult<()> {
        self.write_preamble(true)?;
        self.mapping.sync()?;
        Ok(())
    }

    // ---- master-key rotation ---------------------------------------------

    /// Rotates the master key and persists the preamble. Returns `true`
    /// on failure or decline (the rotation-observer convention).
    pub fn rotate_master_key(&mut self) -> bool {
        if !self.enc.enabled {
            info!("master key not rotated: cache encryption is disabled");
            return true;
        }
        let provider = self.provider.clone().expect("encrypted ring has a provider");
        match keyring::rotate(&mut self.enc, &provider) {
            Ok(true) => {
                if let Err(err) = self.write_preamble(false) {
                    warn!(error = %err, "failed to persist preamble after key rotation");
                    return true;
                }
                info!(mk_id = self.enc.mk_id, "master key rotation complete");
                false
            }
            Ok(false) => true,
            Err(err) => {
                warn!(error = %err, "master key rotation failed");
                true
            }
        }
    }

    // ---- diagnostics -----------------------------------------------------

    pub fn set_debug(&mut self, debug: bool) {
        self.debug = debug;
    }

    pub(crate) fn debug_enabled(&self) -> bool {
        self.debug
    }

    /// Highest file offset ever occupied by a buffer.
    pub fn allocated_high_water(&self) -> usize {
        self.max_used
    }

    pub(crate) fn report_progress(&self, total: u64, done: u64) {
        if let Some(cb) = &self.progress {
            cb(total, done);
        }
    }

    /// Logs the chains of buffers in physical order: runs of ordered,
    /// unordered and released buffers with their extents.
    pub fn dump_map(&self) -> CacheResult<()> {
        let mut pos = self.first;
        let mut run_start = pos;
        let mut run_kind: Option<&'static str> = None;
        let mut run_count = 0usize;

        info!(first = self.first, next = self.next, trail = self.size_trail, "ring map");
        while pos != self.next {
            let header = self.read_header(pos)?;
            if header.is_clear() {
                if let Some(kind) = run_kind.take() {
                    info!(kind, start = run_start, end = pos, count = run_count, "chain");
                }
                info!(at = pos, "rollover");
                pos = self.start;
                run_start = pos;
                run_count = 0;
                continue;
            }
            let kind = if header.seqno_g > 0 {
                "ordered"
            } else if header.seqno_g == SEQNO_ILL {
                "discarded"
            } else {
                "unordered"
            };
            match run_kind {
                Some(current) if current == kind => {}
                _ => {
                    if let Some(prev) = run_kind {
                        info!(kind = prev, start = run_start, end = pos, count = run_count, "chain");
                    }
                    run_kind = Some(kind);
                    run_start = pos;
                    run_count = 0;
                }
            }
            run_count += 1;
            pos += header.size as usize;
        }
        if let Some(kind) = run_kind {
            info!(kind, start = run_start, end = pos, count = run_count, "chain");
        }
        Ok(())
    }

    // ---- accessors used by the facade and tests --------------------------

    #[inline]
    pub fn size_cache(&self) -> usize {
        self.size_cache
    }

    #[inline]
    pub fn size_free(&self) -> usize {
        self.size_free
    }

    #[inline]
    pub fn size_used(&self) -> usize {
        self.size_used
    }

    #[inline]
    pub fn size_released(&self) -> usize {
        self.size_released
    }

    #[inline]
    pub fn size_trail(&self) -> usize {
        self.size_trail
    }

    #[inline]
    pub fn first_offset(&self) -> Offset {
        Offset::new(self.first as u64)
    }

    #[inline]
    pub fn next_offset(&self) -> Offset {
        Offset::new(self.next as u64)
    }

    #[inline]
    pub fn gid(&self) -> Uuid {
        self.gid
    }

    #[inline]
    pub fn master_key_id(&self) -> u32 {
        self.enc.mk_id
    }

    pub(crate) fn set_gid(&mut self, gid: Uuid) {
        self.gid = gid;
    }

    pub(crate) fn set_read_mode(&self, mode: AccessMode) {
        self.mapping.set_access_mode(mode);
    }

    pub(crate) fn mapping(&self) -> &dyn Mapping {
        self.mapping.as_ref()
    }
}

impl std::fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBuffer")
            .field("gid", &self.gid)
            .field("first", &self.first)
            .field("next", &self.next)
            .field("size_cache", &self.size_cache)
            .field("size_free", &self.size_free)
            .field("size_used", &self.size_used)
            .field("size_released", &self.size_released)
            .field("size_trail", &self.size_trail)
            .field("index_len", &self.index.len())
            .finish_non_exhaustive()
    }
}
