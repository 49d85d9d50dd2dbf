//! Sparse seqno-to-offset index.
//!
//! Backed by a contiguous slot array indexed by `seqno - begin`, so
//! lookup is O(1) and iteration is ordered. Holes are legal (overflow
//! stores may own the missing seqnos); the array only grows as far as a
//! sanity bound, beyond which an insert is treated as corruption.

use std::collections::VecDeque;

use crate::error::{CacheError, CacheResult};
use crate::types::{Offset, Seqno};

/// Hard bound on index growth. A gap this large between two recovered
/// seqnos cannot come from a healthy ring.
const MAX_SLOTS: usize = 1 << 26;

/// Ordered map from seqno to the buffer payload offset in the ring.
#[derive(Debug, Default, Clone)]
pub struct SeqnoIndex {
    /// Seqno of slot 0; meaningless while `slots` is empty.
    begin: Seqno,
    slots: VecDeque<Option<Offset>>,
    present: usize,
}

impl SeqnoIndex {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.present == 0
    }

    /// Number of present entries (holes excluded).
    #[inline]
    pub fn len(&self) -> usize {
        self.present
    }

    /// Smallest seqno with an entry.
    pub fn front(&self) -> Option<(Seqno, Offset)> {
        self.slots
            .iter()
            .enumerate()
            .find_map(|(i, slot)| slot.map(|off| (self.begin + i as Seqno, off)))
    }

    /// Largest seqno with an entry.
    pub fn back(&self) -> Option<(Seqno, Offset)> {
        self.slots
            .iter()
            .enumerate()
            .rev()
            .find_map(|(i, slot)| slot.map(|off| (self.begin + i as Seqno, off)))
    }

    pub fn get(&self, seqno: Seqno) -> Option<Offset> {
        if self.slots.is_empty() || seqno < self.begin {
            return None;
        }
        let idx = (seqno - self.begin) as usize;
        self.slots.get(idx).copied().flatten()
    }

    /// Inserts `seqno -> offset`. Fails on duplicates and on gaps large
    /// enough to blow the sanity bound.
    pub fn insert(&mut self, seqno: Seqno, offset: Offset) -> CacheResult<()> {
        if self.slots.is_empty() {
            self.begin = seqno;
            self.slots.push_back(Some(offset));
            self.present = 1;
            return Ok(());
        }

        if seqno >= self.begin {
            let idx = (seqno - self.begin) as usize;
            if idx >= MAX_SLOTS {
                return Err(CacheError::corruption(format!(
                    "seqno {seqno} is too far above index begin {}",
                    self.begin
                )));
            }
            while self.slots.len() <= idx {
                self.slots.push_back(None);
            }
            let slot = &mut self.slots[idx];
            if slot.is_some() {
                return Err(CacheError::SeqnoMisuse(
                    seqno,
                    "already present in the index".to_string(),
                ));
            }
            *slot = Some(offset);
        } else {
            let grow = (self.begin - seqno) as usize;
            if self.slots.len() + grow > MAX_SLOTS {
                return Err(CacheError::corruption(format!(
                    "seqno {seqno} is too far below index begin {}",
                    self.begin
                )));
            }
            for _ in 1..grow {
                self.slots.push_front(None);
            }
            self.slots.push_front(Some(offset));
            self.begin = seqno;
        }
        self.present += 1;
        Ok(())
    }

    /// Removes the entry for `seqno`, if present.
    pub fn erase(&mut self, seqno: Seqno) -> Option<Offset> {
        if self.slots.is_empty() || seqno < self.begin {
            return None;
        }
        let idx = (seqno - self.begin) as usize;
        let off = self.slots.get_mut(idx)?.take()?;
        self.present -= 1;
        self.trim();
        Some(off)
    }

    /// Removes every entry with a seqno strictly below `seqno`.
    pub fn erase_below(&mut self, seqno: Seqno) {
        while let Some((front, _)) = self.front() {
            if front >= seqno {
                break;
            }
            self.erase(front);
        }
    }

    pub fn clear(&mut self) {
        self.slots.clear();
        self.present = 0;
        self.begin = 0;
    }

    /// Present entries in seqno order.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = (Seqno, Offset)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.map(|off| (self.begin + i as Seqno, off)))
    }

    /// Drops leading and trailing holes left by erasures.
    fn trim(&mut self) {
        if self.present == 0 {
            self.clear();
            return;
        }
        while let Some(None) = self.slots.front() {
            self.slots.pop_front();
            self.begin += 1;
        }
        while let Some(None) = self.slots.back() {
            self.slots.pop_back();
        }
    }
}
