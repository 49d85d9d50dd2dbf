//! Core identifier types of the cache.

use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};

/// Global sequence number of a certified write-set.
///
/// Seqnos are assigned by the certification pipeline in a gapless,
/// monotonically increasing order per cluster incarnation.
pub type Seqno = i64;

/// Seqno of a discarded or never-usable buffer.
pub const SEQNO_ILL: Seqno = -1;

/// Seqno of an allocated buffer that has not been ordered yet.
pub const SEQNO_NONE: Seqno = 0;

/// Byte position inside the ring file, measured from the start of the
/// file (the preamble begins at offset 0).
///
/// Buffer addresses handed out by the ring are payload offsets; the
/// 32-byte header sits immediately before the payload.
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Offset(pub u64);

impl Offset {
    /// Creates an offset from a raw u64 value.
    #[inline]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the offset as a u64.
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the offset as a usize.
    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl From<u64> for Offset {
    #[inline]
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<Offset> for u64 {
    #[inline]
    fn from(value: Offset) -> Self {
        value.0
    }
}

impl Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offset_conversions() {
        let off = Offset::new(1032);
        assert_eq!(off.as_u64(), 1032);
        assert_eq!(off.as_usize(), 1032);
        assert_eq!(u64::from(off), 1032);
        assert_eq!(Offset::from(7u64), Offset(7));
    }
}
