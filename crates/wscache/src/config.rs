use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::header::{align_size, ALIGNMENT, HEADER_SIZE};
use crate::types::{Seqno, SEQNO_ILL};

/// Default ring payload size (128 MiB).
///
/// Larger rings retain more write-set history and widen the window in
/// which a joining peer can be served incrementally instead of with a
/// full state snapshot, at the cost of disk space and recovery-scan
/// time.
const DEFAULT_SIZE_BYTES: usize = 128 * 1024 * 1024;

/// Smallest usable ring (4 KiB).
///
/// Below this there is no room for more than a couple of buffers plus
/// the trailing sentinel slot, and the factor-of-two admission rule
/// would reject almost every request.
const SIZE_BYTES_MIN: usize = 4 * 1024;

/// Largest usable ring (just under 4 GiB).
///
/// Buffer sizes are stored in a u32 header field; the margin below
/// `u32::MAX` leaves room for the preamble, the reserved header and the
/// sentinel slot without overflow anywhere in the offset arithmetic.
const SIZE_BYTES_MAX: usize = u32::MAX as usize - (1 << 20);

/// Default encryption cache page size (32 KiB).
///
/// Bigger pages amortise the per-page cipher setup over more bytes and
/// shrink the residency map; smaller pages waste less plaintext memory
/// on sparse access patterns.
const DEFAULT_CACHE_PAGE_SIZE: usize = 32 * 1024;

/// Default total plaintext cache size (16 MiB).
///
/// This bounds how much decrypted data exists in memory at any moment.
/// The working set of the commit pipeline is the tail of the ring, so a
/// cache much smaller than the ring still avoids thrashing.
const DEFAULT_CACHE_TOTAL_SIZE: usize = 16 * 1024 * 1024;

/// Encryption-at-rest settings.
///
/// When enabled, the ring file holds AES-CTR ciphertext and plaintext
/// exists only inside a bounded, mlocked page cache. The two size knobs
/// trade memory for cipher work; both are normalized by
/// [`CacheConfig::normalized`] before use.
///
/// # Example
///
/// ```rust
/// use wscache::EncryptionConfig;
///
/// let enc = EncryptionConfig {
///     enabled: true,
///     cache_page_size: 64 * 1024,
///     cache_total_size: 8 * 1024 * 1024,
/// };
/// assert!(enc.enabled);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncryptionConfig {
    /// Encrypt the ring file.
    ///
    /// Flipping this between runs forces a full reset on the next open:
    /// the on-disk bytes are unreadable under the other mode either way.
    pub enabled: bool,

    /// Plaintext cache page size in bytes.
    ///
    /// Must be a multiple of the OS page; rounded up by
    /// [`CacheConfig::normalized`]. This is also the granularity of
    /// decrypt-on-fault and re-encrypt-on-evict.
    pub cache_page_size: usize,

    /// Total plaintext cache size in bytes.
    ///
    /// Holds at least two pages after normalization, so a copy that
    /// straddles a page boundary always finds both pages resident.
    pub cache_total_size: usize,
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            cache_page_size: DEFAULT_CACHE_PAGE_SIZE,
            cache_total_size: DEFAULT_CACHE_TOTAL_SIZE,
        }
    }
}

/// Configuration surface of a cache instance.
///
/// Defines the ring file location and size, the open-time recovery
/// policy, the purge freeze and the encryption block. Values arriving
/// from external sources (option files, SET statements) are not trusted
/// as-is: call [`normalized`](Self::normalized) to clamp and align them
/// before opening the cache.
///
/// # Configuration Philosophy
///
/// - **Word alignment everywhere**: the ring size is aligned so that
///   buffer offsets and the rollover arithmetic never need byte-level
///   fixups.
/// - **Validated bounds**: out-of-range sizes are clamped to safe
///   limits rather than rejected, matching how the surrounding server
///   treats tuning knobs.
/// - **Encryption is orthogonal**: the ring logic never sees the
///   encryption settings; they only select the mapping layered under
///   it.
///
/// # Example
///
/// ```rust
/// use wscache::{CacheConfig, EncryptionConfig};
///
/// let config = CacheConfig {
///     name: "./data/cache.ring".into(),
///     size_bytes: 64 * 1024 * 1024,
///     enc: EncryptionConfig {
///         enabled: true,
///         ..EncryptionConfig::default()
///     },
///     ..CacheConfig::default()
/// }
/// .normalized();
/// assert_eq!(config.size_bytes, 64 * 1024 * 1024);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Path of the ring file.
    ///
    /// Created on first open; an existing file is resized to match the
    /// configured geometry before the mapping is established.
    pub name: PathBuf,

    /// Size of the payload region in bytes.
    ///
    /// This is the space available to buffers, excluding the preamble,
    /// the reserved header and the trailing sentinel slot. Clamped to
    /// [4 KiB, ~4 GiB) and word-aligned by
    /// [`normalized`](Self::normalized).
    pub size_bytes: usize,

    /// Attempt recovery on open instead of resetting.
    ///
    /// With recovery off the ring starts empty every time, which is
    /// only useful for throwaway instances and tests.
    pub recover_on_open: bool,

    /// Hold discards at and above this seqno; [`SEQNO_ILL`] disables
    /// the freeze.
    ///
    /// The freeze is the skip-purge policy's anchor: a discard pass
    /// stops as soon as it reaches a frozen seqno, exactly as if the
    /// buffer were still unreleased.
    pub freeze_purge_at_seqno: Seqno,

    /// Emit the buffer-chain dump and extra scan diagnostics.
    pub debug: bool,

    /// Encryption-at-rest settings.
    pub enc: EncryptionConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            name: PathBuf::from("./wscache.ring"),
            size_bytes: DEFAULT_SIZE_BYTES,
            recover_on_open: true,
            freeze_purge_at_seqno: SEQNO_ILL,
            debug: false,
            enc: EncryptionConfig::default(),
        }
    }
}

impl CacheConfig {
    /// Returns a copy with every size clamped and aligned.
    ///
    /// Opening the cache normalizes its configuration implicitly; call
    /// this yourself when the effective values matter beforehand, e.g.
    /// to report them or to size an external page-manager pool.
    ///
    /// # Normalization Rules
    ///
    /// - **Ring size**: clamped to [4 KiB, ~4 GiB), then word-aligned.
    /// - **Cache page size**: rounded up to a non-zero multiple of the
    ///   OS page; a zero falls back to the 32 KiB default.
    /// - **Cache total size**: raised to hold at least two pages.
    ///
    /// # Returns
    ///
    /// A new configuration with all parameters inside their valid
    /// ranges; the original is consumed.
    ///
    /// # Example
    ///
    /// ```rust
    /// use wscache::CacheConfig;
    ///
    /// let config = CacheConfig {
    ///     size_bytes: 100_001, // unaligned
    ///     ..CacheConfig::default()
    /// }
    /// .normalized();
    /// assert_eq!(config.size_bytes % 8, 0);
    /// ```
    pub fn normalized(mut self) -> Self {
        self.size_bytes = align_size(self.size_bytes.clamp(SIZE_BYTES_MIN, SIZE_BYTES_MAX));

        let os_page = encmap::os_page_size();
        let page = self.cache_page_size_or_default();
        let page = page.div_ceil(os_page) * os_page;
        self.enc.cache_page_size = page;

        if self.enc.cache_total_size < 2 * page {
            self.enc.cache_total_size = 2 * page;
        }
        self
    }

    fn cache_page_size_or_default(&self) -> usize {
        if self.enc.cache_page_size == 0 {
            DEFAULT_CACHE_PAGE_SIZE
        } else {
            self.enc.cache_page_size
        }
    }

    /// Total file size for this configuration: preamble, reserved header,
    /// payload region and the trailing sentinel slot.
    pub fn file_len(&self) -> u64 {
        (crate::preamble::PREAMBLE_LEN + crate::ring::RESERVED_LEN + self.size_bytes + HEADER_SIZE)
            as u64
    }
}

const _: () = assert!(ALIGNMENT.is_power_of_two());

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_reasonable() {
        let cfg = CacheConfig::default();
        assert!(cfg.size_bytes >= SIZE_BYTES_MIN);
        assert!(cfg.size_bytes % ALIGNMENT == 0);
        assert!(cfg.recover_on_open);
        assert_eq!(cfg.freeze_purge_at_seqno, SEQNO_ILL);
        assert!(!cfg.enc.enabled);
    }

    #[test]
    fn normalized_aligns_sizes() {
        let cfg = CacheConfig {
            size_bytes: 100_001,
            enc: EncryptionConfig {
                enabled: true,
                cache_page_size: 5000,
                cache_total_size: 0,
            },
            ..CacheConfig::default()
        }
        .normalized();

        assert_eq!(cfg.size_bytes % ALIGNMENT, 0);
        assert_eq!(cfg.enc.cache_page_size % encmap::os_page_size(), 0);
        assert!(cfg.enc.cache_total_size >= 2 * cfg.enc.cache_page_size);
    }

    #[test]
    fn normalized_clamps_tiny_and_huge_rings() {
        let tiny = CacheConfig {
            size_bytes: 16,
            ..CacheConfig::default()
        }
        .normalized();
        assert_eq!(tiny.size_bytes, SIZE_BYTES_MIN);

        let huge = CacheConfig {
            size_bytes: usize::MAX,
            ..CacheConfig::default()
        }
        .normalized();
        assert!(huge.size_bytes <= align_size(SIZE_BYTES_MAX));
    }

    #[test]
    fn serde_round_trip() {
        let cfg = CacheConfig::default();
        let json = serde_json::to_string(&cfg).expect("serialize");
        let decoded: CacheConfig = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(cfg, decoded);
    }
}
