//! Durable write-set cache for a synchronous multi-master replication
//! engine.
//!
//! The cache is a fixed-size, memory-mapped ring buffer that retains
//! recently certified transactions (write-sets) keyed by their global
//! seqno. The local commit pipeline allocates, writes and releases
//! buffers as replication progresses; the incremental-state-transfer
//! donor reads back ranges of historical write-sets for joining peers.
//!
//! The cache survives restarts: a clean shutdown checkpoints a
//! human-readable preamble, a crash is handled by rescanning the file
//! and rebuilding the seqno index from the buffer headers, resolving
//! seqno collisions between cluster incarnations along the way.
//!
//! Encryption at rest is layered underneath as a lazily decrypted page
//! cache (see the `encmap` crate); the ring itself is oblivious to it.
//!
//! ## Buffer lifecycle
//!
//! ```text
//! malloc -> (write payload) -> seqno_assign -> free -> seqno_release
//! ```
//!
//! A buffer freed before it was ordered is discarded on the spot;
//! ordered buffers keep their bytes until a discard pass crosses their
//! seqno, so the donor can still read them.
//!
//! ## Example
//!
//! ```no_run
//! use uuid::Uuid;
//! use wscache::{CacheConfig, WriteSetCache};
//!
//! let config = CacheConfig {
//!     name: "./data/cache.ring".into(),
//!     size_bytes: 64 * 1024 * 1024,
//!     ..CacheConfig::default()
//! };
//! let cache = WriteSetCache::open(&config, Uuid::new_v4(), None, None, None)?;
//!
//! let offset = cache.malloc(128)?.expect("room in a fresh ring");
//! cache.write(offset, b"certified write-set")?;
//! cache.seqno_assign(offset, 1)?;
//! cache.free(offset)?;
//! cache.seqno_release(1)?;
//! # Ok::<(), wscache::CacheError>(())
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod fs;
pub mod header;
pub mod index;
pub mod keyring;
pub mod preamble;
pub mod recover;
pub mod ring;
pub mod types;

pub use cache::WriteSetCache;
pub use config::{CacheConfig, EncryptionConfig};
pub use error::{CacheError, CacheResult};
pub use header::{BufferHeader, BufferStore, ALIGNMENT, FLAG_RELEASED, HEADER_SIZE};
pub use index::SeqnoIndex;
pub use preamble::{EncState, Preamble, PREAMBLE_LEN};
pub use ring::{ProgressFn, RingBuffer, RESERVED_LEN};
pub use types::{Offset, Seqno, SEQNO_ILL, SEQNO_NONE};
