//! On-disk buffer header and its structural checks.
//!
//! Every buffer in the ring is a fixed 32-byte header followed by the
//! payload. A header whose `size` is zero is the rollover sentinel that
//! terminates the used region of a segment.

use crate::types::{Seqno, SEQNO_ILL, SEQNO_NONE};

/// Alignment of buffer sizes and addresses: one machine word.
pub const ALIGNMENT: usize = 8;

/// Encoded size of a [`BufferHeader`].
///
/// Layout, little endian: `u32 size; u32 _pad0; i64 seqno_g; u32 flags;
/// u8 store; u8 _pad1[3]; u64 ctx`.
pub const HEADER_SIZE: usize = 32;

/// Buffer has been released by its last user and may be discarded.
pub const FLAG_RELEASED: u32 = 0x01;

const FLAGS_MASK: u32 = FLAG_RELEASED;

/// Rounds `n` up to the next multiple of [`ALIGNMENT`].
#[inline]
pub const fn align_size(n: usize) -> usize {
    (n + ALIGNMENT - 1) & !(ALIGNMENT - 1)
}

/// Which store owns a buffer.
///
/// Only ring-resident buffers are managed by this crate; the in-memory
/// and page overflow stores are external collaborators whose buffers can
/// still appear in a shared seqno index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BufferStore {
    InRing = 0,
    InMem = 1,
    InPage = 2,
}

impl BufferStore {
    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::InRing),
            1 => Some(Self::InMem),
            2 => Some(Self::InPage),
            _ => None,
        }
    }
}

/// Decoded form of the 32-byte record header prefixing each buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferHeader {
    /// Total buffer size in bytes, header included. Zero marks the
    /// rollover sentinel.
    pub size: u32,
    /// Global seqno; [`SEQNO_NONE`] while unordered, [`SEQNO_ILL`] once
    /// discarded.
    pub seqno_g: Seqno,
    /// Flag bits, see [`FLAG_RELEASED`].
    pub flags: u32,
    /// Owning store.
    pub store: BufferStore,
    /// Opaque handle identifying the owning store instance.
    pub ctx: u64,
}

impl BufferHeader {
    /// A cleared (sentinel) header.
    pub const fn cleared() -> Self {
        Self {
            size: 0,
            seqno_g: SEQNO_NONE,
            flags: 0,
            store: BufferStore::InRing,
            ctx: 0,
        }
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.size.to_le_bytes());
        buf[8..16].copy_from_slice(&self.seqno_g.to_le_bytes());
        buf[16..20].copy_from_slice(&self.flags.to_le_bytes());
        buf[20] = self.store as u8;
        buf[24..32].copy_from_slice(&self.ctx.to_le_bytes());
        buf
    }

    /// Decodes a header; `None` if the store tag is out of range.
    pub fn decode(buf: &[u8; HEADER_SIZE]) -> Option<Self> {
        let size = u32::from_le_bytes(buf[0..4].try_into().expect("4 bytes"));
        let seqno_g = i64::from_le_bytes(buf[8..16].try_into().expect("8 bytes"));
        let flags = u32::from_le_bytes(buf[16..20].try_into().expect("4 bytes"));
        let store = BufferStore::from_tag(buf[20])?;
        let ctx = u64::from_le_bytes(buf[24..32].try_into().expect("8 bytes"));
        Some(Self {
            size,
            seqno_g,
            flags,
            store,
            ctx,
        })
    }

    /// True for the rollover sentinel.
    #[inline]
    pub fn is_clear(&self) -> bool {
        self.size == 0
    }

    #[inline]
    pub fn is_released(&self) -> bool {
        self.flags & FLAG_RELEASED != 0
    }

    /// True once the buffer has been discarded.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.seqno_g == SEQNO_ILL
    }

    /// Structural sanity of a header read from disk: aligned size within
    /// `max_size`, known flags, seqno not below [`SEQNO_ILL`]. The
    /// sentinel (size 0) passes.
    pub fn is_plausible(&self, max_size: usize) -> bool {
        if self.size != 0 && (self.size as usize) < HEADER_SIZE + 1 {
            return false;
        }
        self.size as usize % ALIGNMENT == 0
            && self.size as usize <= max_size
            && self.flags & !FLAGS_MASK == 0
            && self.seqno_g >= SEQNO_ILL
    }
}
