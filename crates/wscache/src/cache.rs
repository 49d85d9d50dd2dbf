//! Replicator-facing control surface.
//!
//! [`WriteSetCache`] wraps the ring behind a mutex so the commit
//! pipeline, the IST donor and the key-rotation observer can share one
//! instance. The rotation observer holds only a weak handle: a cache
//! that has been dropped silently declines rotation requests.

use std::sync::{Arc, Weak};

use encmap::{MasterKeyProvider, PageManagerPool};
use parking_lot::Mutex;
use tracing::info;
use uuid::Uuid;

use crate::config::CacheConfig;
use crate::error::CacheResult;
use crate::ring::{ProgressFn, RingBuffer};
use crate::types::{Offset, Seqno};

/// The durable write-set cache.
///
/// One instance serves three callers: the commit pipeline allocating,
/// writing and releasing buffers; the incremental-state-transfer donor
/// reading back ordered history; and the keyring notifying master-key
/// rotations. Every method locks the underlying ring for its duration,
/// so calls from different threads interleave safely.
///
/// # Buffer lifecycle
///
/// ```text
/// malloc -> write -> seqno_assign -> free -> seqno_release
/// ```
///
/// A buffer freed before it was ordered is discarded immediately;
/// ordered buffers keep their bytes until a discard pass crosses their
/// seqno, so the donor can still read them.
///
/// # Example
///
/// ```no_run
/// use uuid::Uuid;
/// use wscache::{CacheConfig, WriteSetCache};
///
/// let config = CacheConfig {
///     name: "./data/cache.ring".into(),
///     ..CacheConfig::default()
/// };
/// let cache = WriteSetCache::open(&config, Uuid::new_v4(), None, None, None)?;
///
/// let offset = cache.malloc(64)?.expect("room in a fresh ring");
/// cache.write(offset, &[7u8; 64])?;
/// cache.seqno_assign(offset, 1)?;
/// cache.free(offset)?;
///
/// assert_eq!(cache.get(1)?.unwrap(), vec![7u8; 64]);
/// cache.seqno_release(1)?;
/// cache.close()?;
/// # Ok::<(), wscache::CacheError>(())
/// ```
pub struct WriteSetCache {
    ring: Arc<Mutex<RingBuffer>>,
    provider: Option<Arc<MasterKeyProvider>>,
}

impl WriteSetCache {
    /// Opens the cache, recovering or resetting the ring file, and wires
    /// the master-key rotation observer when a provider is given.
    ///
    /// The observer holds only a weak handle to the ring: once the cache
    /// is dropped or closed, rotation requests are silently declined.
    ///
    /// # Arguments
    ///
    /// * `config` - Ring geometry, recovery policy and encryption
    ///   settings; normalized internally.
    /// * `gid` - Expected history UUID; the preamble value wins when
    ///   present.
    /// * `provider` - Keyring access, required when encryption is
    ///   enabled.
    /// * `pool` - Page-manager pool shared across caches of one engine;
    ///   a private pool is created when absent.
    /// * `progress` - Optional recovery-scan progress callback.
    ///
    /// # Errors
    ///
    /// Propagates everything [`RingBuffer::open`] can fail with: file
    /// I/O, invalid configuration, and an unusable keyring.
    pub fn open(
        config: &CacheConfig,
        gid: Uuid,
        provider: Option<Arc<MasterKeyProvider>>,
        pool: Option<Arc<PageManagerPool>>,
        progress: Option<ProgressFn>,
    ) -> CacheResult<Self> {
        let pool = pool.unwrap_or_default();
        let ring = RingBuffer::open(config, gid, provider.clone(), &pool, progress)?;
        let ring = Arc::new(Mutex::new(ring));

        if let Some(provider) = &provider {
            let weak: Weak<Mutex<RingBuffer>> = Arc::downgrade(&ring);
            provider.register_key_rotation_request_observer(Box::new(move || {
                match weak.upgrade() {
                    Some(ring) => ring.lock().rotate_master_key(),
                    None => true,
                }
            }));
        }

        Ok(Self { ring, provider })
    }

    /// Allocates a buffer for `len` payload bytes.
    ///
    /// # Returns
    ///
    /// The payload offset to write through, or `None` when the ring
    /// cannot make room — the caller chooses whether to block, retry
    /// after releasing history, or overflow to another store.
    pub fn malloc(&self, len: usize) -> CacheResult<Option<Offset>> {
        self.ring.lock().alloc(len)
    }

    /// Resizes the buffer at `offset`, relocating it if it cannot grow
    /// in place.
    ///
    /// # Returns
    ///
    /// The possibly new payload offset (previous contents preserved),
    /// or `None` when no room can be made.
    pub fn realloc(&self, offset: Offset, len: usize) -> CacheResult<Option<Offset>> {
        self.ring.lock().realloc(offset, len)
    }

    /// Releases the buffer at `offset`.
    ///
    /// Unordered buffers are discarded immediately; ordered ones keep
    /// their bytes until [`seqno_release`](Self::seqno_release) passes
    /// their seqno, so the donor can still read them in the meantime.
    pub fn free(&self, offset: Offset) -> CacheResult<()> {
        self.ring.lock().free(offset)
    }

    /// Copies `data` into the payload of the buffer at `offset`.
    pub fn write(&self, offset: Offset, data: &[u8]) -> CacheResult<()> {
        self.ring.lock().write_payload(offset, data)
    }

    /// Orders the buffer at `offset` under `seqno`.
    ///
    /// # Arguments
    ///
    /// * `offset` - A live, still-unordered buffer owned by this cache.
    /// * `seqno` - The positive global seqno assigned by certification;
    ///   each seqno may be assigned exactly once.
    pub fn seqno_assign(&self, offset: Offset, seqno: Seqno) -> CacheResult<()> {
        self.ring.lock().assign_seqno(offset, seqno)
    }

    /// Discards every released buffer with seqno at most `up_to`.
    ///
    /// Discarding is monotonic: once a seqno is gone it never
    /// reappears, and the pass always consumes the index from its front
    /// so no hole is left behind.
    ///
    /// # Returns
    ///
    /// `true` when everything up to `up_to` went; `false` when an
    /// unreleased buffer, the purge freeze or a donor lock stopped the
    /// pass early (everything before the blocker is still discarded).
    pub fn seqno_release(&self, up_to: Seqno) -> CacheResult<bool> {
        let mut ring = self.ring.lock();
        let done = ring.discard_up_to(up_to)?;
        ring.maybe_collapse();
        Ok(done)
    }

    /// Pins the low-water mark while a donor streams incremental state:
    /// seqnos at or above `first_needed` survive discards.
    ///
    /// The lock is advisory for allocation — the ring may still refuse
    /// new buffers if pinned history occupies the space they need —
    /// which is exactly the backpressure a donating node wants.
    pub fn seqno_lock(&self, first_needed: Seqno) {
        self.ring.lock().seqno_lock(first_needed);
    }

    pub fn seqno_unlock(&self) {
        self.ring.lock().seqno_unlock();
    }

    pub fn seqno_min(&self) -> Seqno {
        self.ring.lock().seqno_min()
    }

    pub fn seqno_max(&self) -> Seqno {
        self.ring.lock().seqno_max()
    }

    /// Adopts a new history: every cached seqno of the old incarnation
    /// is invalidated and the unused regions are zeroed.
    ///
    /// Seqnos are only meaningful within one cluster incarnation; after
    /// a bootstrap the same numbers name different transactions, so
    /// nothing cached under the old UUID may ever be served again.
    ///
    /// # Arguments
    ///
    /// * `gid` - UUID of the new cluster incarnation.
    /// * `seqno` - Position the new history starts from; recorded for
    ///   diagnostics only.
    pub fn seqno_reset(&self, gid: Uuid, seqno: Seqno) -> CacheResult<()> {
        info!(%gid, seqno, "adopting new history, invalidating cached write-sets");
        let mut ring = self.ring.lock();
        ring.set_gid(gid);
        ring.seqno_reset(true)
    }

    /// Fetches the payload ordered under `seqno` for donation.
    ///
    /// # Returns
    ///
    /// The payload bytes, or `None` when the seqno was never cached or
    /// has already been discarded. Donors pin their range with
    /// [`seqno_lock`](Self::seqno_lock) first so the answer stays
    /// stable for the whole transfer.
    pub fn get(&self, seqno: Seqno) -> CacheResult<Option<Vec<u8>>> {
        self.ring.lock().get(seqno)
    }

    /// Moves the purge freeze used by the skip-purge policy.
    pub fn freeze_purge_at(&self, seqno: Seqno) {
        self.ring.lock().freeze_purge_at(seqno);
    }

    /// Rotates the master key now, without going through the keyring's
    /// observer path.
    ///
    /// The file key is unwrapped under the current master key, a master
    /// key with the next id is created, and the rewrapped state is
    /// persisted atomically in the preamble. Failure leaves everything
    /// unchanged.
    ///
    /// # Returns
    ///
    /// `true` when the key actually rotated; `false` when encryption is
    /// off or the keyring declined.
    pub fn rotate_master_key(&self) -> bool {
        !self.ring.lock().rotate_master_key()
    }

    pub fn set_debug(&self, debug: bool) {
        self.ring.lock().set_debug(debug);
    }

    pub fn dump_map(&self) -> CacheResult<()> {
        self.ring.lock().dump_map()
    }

    /// Current history UUID.
    pub fn gid(&self) -> Uuid {
        self.ring.lock().gid()
    }

    /// Current master-key id (0 when encryption is off or keyless).
    pub fn master_key_id(&self) -> u32 {
        self.ring.lock().master_key_id()
    }

    /// Highest file offset ever occupied by a buffer.
    pub fn allocated_high_water(&self) -> usize {
        self.ring.lock().allocated_high_water()
    }

    /// Byte counters `(cache, free, used, released, trail)`.
    pub fn mem_stats(&self) -> (usize, usize, usize, usize, usize) {
        let ring = self.ring.lock();
        (
            ring.size_cache(),
            ring.size_free(),
            ring.size_used(),
            ring.size_released(),
            ring.size_trail(),
        )
    }

    /// Cursor offsets `(first, next)`.
    pub fn cursors(&self) -> (Offset, Offset) {
        let ring = self.ring.lock();
        (ring.first_offset(), ring.next_offset())
    }

    /// Clean shutdown: persists the synced preamble and flushes the
    /// mapping, then drops the rotation observer.
    ///
    /// Only a closed cache leaves a synced preamble behind; the next
    /// open trusts its cursor hint and recovers with a single targeted
    /// scan. Dropping the cache without closing simulates a crash — the
    /// contents are still recoverable, just more slowly.
    pub fn close(self) -> CacheResult<()> {
        if let Some(provider) = &self.provider {
            provider.register_key_rotation_request_observer(Box::new(|| true));
        }
        self.ring.lock().close()
    }
}

impl std::fmt::Debug for WriteSetCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteSetCache")
            .field("ring", &*self.ring.lock())
            .finish()
    }
}
