//! Transparent encryption-at-rest layer for memory-mapped stores.
//!
//! The crate presents a fixed-size file as a byte-addressable [`Mapping`]:
//! reads and writes at arbitrary offsets behave as if the file were a
//! plain memory map, while the bytes on disk stay AES-CTR ciphertext.
//! Plaintext lives only in a bounded, mlocked page cache; pages are
//! decrypted on first touch and re-encrypted when they are evicted or
//! synced.
//!
//! ## Components
//!
//! - [`StreamCipher`]: AES-256-CTR with a settable stream offset, so any
//!   aligned slice of the file can be processed independently.
//! - [`PageManager`] / [`PageManagerPool`]: the fixed pool of plaintext
//!   pages (backed by an unlinked, mlocked temp file) and a checkout pool
//!   amortising its construction.
//! - [`EncMapping`]: the lazily decrypted page cache with glued eviction,
//!   read-ahead for sequential scans and a plaintext file prefix.
//! - [`RawMapping`]: the same [`Mapping`] surface over a plain map, used
//!   when encryption is off.
//! - [`MasterKeyProvider`]: callback interface to the external keyring,
//!   plus file-key wrapping helpers.
//!
//! ## Keys
//!
//! Each mapping is driven by a 32-byte *file key*. File keys are wrapped
//! under a named *master key* held by the keyring; rotation swaps the
//! master key without touching the bulk ciphertext. [`Mapping::set_key`]
//! is destructive on cached state by design: callers sync first if they
//! care about pending writes.

pub mod cipher;
pub mod enc;
pub mod error;
pub mod keys;
pub mod mapping;
pub mod pool;

pub use cipher::{StreamCipher, AES_BLOCK_SIZE, FILE_KEY_LEN};
pub use enc::EncMapping;
pub use error::{EncMapError, EncMapResult};
pub use keys::{
    generate_file_key, master_key_name, unwrap_key, wrap_key, MasterKeyProvider,
};
pub use mapping::{create_mapping, AccessMode, Mapping, MappingOptions, RawMapping};
pub use pool::{os_page_size, PageManager, PageManagerPool, PageRef};
