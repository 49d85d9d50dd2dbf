//! Crash-recovery scanner.
//!
//! After an unclean shutdown the seqno index exists only as header bytes
//! scattered through the ring. The scanner walks up to two segments,
//! starting at the preamble's offset hint when it is trustworthy and
//! probing for the second segment otherwise, validates headers
//! structurally before believing them, resolves seqno collisions between
//! incarnations by hashing payloads, and finally trims the result to the
//! longest gapless suffix — a cache that cannot serve a contiguous range
//! serves nothing.

use encmap::AccessMode;
use tracing::{info, warn};
use xxhash_rust::xxh3::xxh3_128;

use crate::error::CacheResult;
use crate::header::{align_size, BufferHeader, ALIGNMENT, FLAG_RELEASED, HEADER_SIZE};
use crate::ring::RingBuffer;
use crate::types::{Offset, Seqno, SEQNO_ILL};

impl RingBuffer {
    /// Reconstructs cursors and the seqno index from on-disk bytes.
    ///
    /// `file_offset` is the preamble's hint for the oldest buffer
    /// (negative when unknown); `version` selects the scan step for
    /// files written before alignment was enforced.
    pub(crate) fn recover(&mut self, file_offset: i64, version: u32) -> CacheResult<()> {
        let rel_offset = file_offset - self.start as i64;
        let scan_step = if version > 0 { ALIGNMENT } else { 1 };

        // Lowest seqno still usable after collision resolution.
        let lowest = self.scan(rel_offset, scan_step)? + 1;

        if self.index.is_empty() {
            return self.recovery_reset("no write-sets recovered");
        }

        debug_assert!(self.next <= self.first || self.size_trail == 0);
        debug_assert!(self.next > self.first || self.size_trail > 0);

        let (seqno_max, back_off) = self.index.back().expect("index not empty");
        if lowest == seqno_max {
            self.index.clear();
            return self.recovery_reset("collisions reach the newest write-set");
        }

        // Find the longest gapless suffix of the index, validating each
        // entry against its header on the way down.
        let mut seqno_min = seqno_max;
        if !self.entry_matches(back_off, seqno_min)? {
            return self.recovery_reset("index entry does not match its header");
        }
        while seqno_min > lowest {
            let Some(off) = self.index.get(seqno_min - 1) else {
                break;
            };
            if !self.entry_matches(off, seqno_min - 1)? {
                return self.recovery_reset("index entry does not match its header");
            }
            seqno_min -= 1;
        }
        info!(seqno_min, seqno_max, "found gapless write-set sequence");

        if let Some((front, _)) = self.index.front() {
            if front < seqno_min {
                info!(
                    from = front,
                    to = seqno_min - 1,
                    "discarding write-sets below the gapless suffix"
                );
                let below: Vec<(Seqno, Offset)> =
                    self.index.iter().take_while(|(s, _)| *s < seqno_min).collect();
                for (_, off) in below {
                    let hdr_off = off.as_usize() - HEADER_SIZE;
                    let mut header = self.read_header(hdr_off)?;
                    header.seqno_g = SEQNO_ILL;
                    self.write_header(hdr_off, &header)?;
                }
                self.index.erase_below(seqno_min);
            }
        }
        debug_assert!(!self.index.is_empty());

        // Trim `first`: skip the leading run of discarded buffers.
        loop {
            let header = self.read_header(self.first)?;
            if header.is_clear() {
                self.first = self.start; // rollover
                continue;
            }
            if header.seqno_g != SEQNO_ILL {
                break;
            }
            debug_assert!(header.size as usize >= HEADER_SIZE);
            self.first += header.size as usize;
        }

        // Trim `next`: walk from the last ordered buffer and re-derive
        // the end of the used region.
        let (_, back_off) = self.index.back().expect("index not empty");
        let mut pos = back_off.as_usize() - HEADER_SIZE;
        let mut last_off = pos;
        while pos != self.next {
            let header = self.read_header(pos)?;
            if header.size > 0 {
                if pos + header.size as usize > self.end - HEADER_SIZE || header.ctx != self.ctx {
                    return self.recovery_reset("corrupt buffer chain after the last write-set");
                }
                if header.seqno_g > 0 {
                    last_off = pos;
                }
                pos += header.size as usize;
            } else {
                pos = self.start; // rollover
            }
        }

        let mut last_header = self.read_header(last_off)?;
        let mut new_next = last_off + last_header.size as usize;
        if new_next % ALIGNMENT != 0 {
            // Older files may carry unaligned buffers; absorb the slack
            // into the last one so everything downstream stays aligned.
            let aligned = align_size(new_next);
            last_header.size += (aligned - new_next) as u32;
            self.write_header(last_off, &last_header)?;
            new_next = aligned;
        }
        self.next = new_next;
        self.clear_header(self.next)?;

        if self.first == self.next {
            return self.recovery_reset("cursors collapsed during trim");
        }
        if self.first < self.next {
            self.size_trail = 0;
        } else {
            debug_assert!(self.size_trail >= HEADER_SIZE);
        }

        self.estimate_space(false)?;

        // Settle the byte accounting: ordered buffers wait for their
        // discard, everything else is useless after a restart.
        let mut total = 0usize;
        let mut dropped = 0usize;
        let mut pos = self.first;
        while pos != self.next {
            let header = self.read_header(pos)?;
            if header.size > 0 {
                if pos + header.size as usize > self.end - HEADER_SIZE || header.ctx != self.ctx {
                    return self.recovery_reset("corrupt buffer chain in the recovered region");
                }
                total += 1;
                debug_assert!(self.size_used >= header.size as usize);
                self.size_used -= header.size as usize;
                if header.seqno_g > 0 {
                    debug_assert!(header.is_released());
                    self.size_released += header.size as usize;
                } else {
                    dropped += 1;
                    self.mark_discarded(pos, &header)?;
                }
                pos += header.size as usize;
            } else {
                pos = self.start; // rollover
            }
        }
        // No buffer may remain in use after recovery.
        debug_assert_eq!(self.size_used, 0);
        self.assert_sizes();

        info!(
            seqno_min = self.seqno_min(),
            seqno_max = self.seqno_max(),
            recovered = total - dropped,
            discarded = dropped,
            free = self.size_free,
            cache = self.size_cache,
            "ring buffer recovered"
        );
        if self.debug_enabled() {
            self.dump_map()?;
        }
        Ok(())
    }

    fn recovery_reset(&mut self, reason: &str) -> CacheResult<()> {
        warn!(reason, "ring recovery fell back to a full reset");
        self.index.clear();
        self.reset()
    }

    /// True when the header behind an index entry still carries the
    /// entry's seqno (collision losers do not).
    fn entry_matches(&self, offset: Offset, seqno: Seqno) -> CacheResult<bool> {
        let header = self.read_header(offset.as_usize() - HEADER_SIZE)?;
        Ok(header.seqno_g == seqno)
    }

    /// Walks the file and populates the seqno index. Returns the highest
    /// seqno poisoned by a collision (`-1` when none).
    fn scan(&mut self, rel_offset: i64, scan_step: usize) -> CacheResult<Seqno> {
        self.set_read_mode(AccessMode::Read);
        let result = self.scan_segments(rel_offset, scan_step);
        self.set_read_mode(AccessMode::ReadWrite);
        result
    }

    fn scan_segments(&mut self, rel_offset: i64, scan_step: usize) -> CacheResult<Seqno> {
        let mut segment_scans = 0u32;
        let mut seqno_max: Seqno = SEQNO_ILL;
        let mut collisions = 0usize;
        let mut erase_up_to: Seqno = -1;
        let mut segment_start = self.start;
        let mut segment_end = self.end - HEADER_SIZE;

        let total = (self.end - self.start) as u64;
        let mut done = 0u64;

        if rel_offset >= 0 {
            debug_assert_eq!(rel_offset as usize % scan_step, 0);
            let abs = self.start + rel_offset as usize;
            if abs + HEADER_SIZE < segment_end {
                // We know exactly where the younger segment starts.
                segment_start = abs;
            } else {
                // The younger segment is completely missing.
                segment_scans = 1;
            }
        }

        'segments: while segment_scans < 2 {
            segment_scans += 1;
            let mut ptr = segment_start;

            while let Some(mut header) = self.scan_probe(ptr, segment_end)? {
                debug_assert_eq!(ptr % scan_step, 0);
                header.flags |= FLAG_RELEASED;
                header.ctx = self.ctx;
                self.write_header(ptr, &header)?;

                let seqno = header.seqno_g;
                if seqno > 0 {
                    if let Some(old_off) = self.index.get(seqno) {
                        collisions += 1;
                        erase_up_to =
                            self.resolve_collision(ptr, &header, old_off, erase_up_to)?;
                    } else {
                        let payload = Offset::new((ptr + HEADER_SIZE) as u64);
                        if let Err(err) = self.index.insert(seqno, payload) {
                            // The most recent write-sets are the ones we
                            // failed on; anything recovered before them
                            // is useless.
                            warn!(
                                seqno,
                                error = %err,
                                "failed to index recovered write-set, aborting the scan"
                            );
                            self.index.clear();
                            self.clear_header(ptr)?;
                            self.next = ptr;
                            break 'segments;
                        }
                        seqno_max = seqno_max.max(seqno);
                    }
                }

                done = (done + header.size as u64).min(total);
                self.report_progress(total, done);
                ptr += header.size as usize;
            }

            // Close the segment: whatever stopped the walk becomes the
            // terminating sentinel.
            let tail_clear = ptr + HEADER_SIZE <= self.end
                && self
                    .probe_header(ptr)?
                    .map_or(false, |h| h.is_clear());
            if !tail_clear {
                let tail_size = self.read_raw_size(ptr)? as usize;
                if segment_start == self.start
                    && ptr != self.first
                    && ptr + tail_size != self.first
                {
                    warn!(
                        gid = %self.gid,
                        last_recovered = seqno_max,
                        "failed to scan the last segment to its end, recent write-sets may be missing"
                    );
                }
                self.clear_header(ptr)?;
            }

            if rel_offset > 0 && segment_start == self.start + rel_offset as usize {
                // Scanned the segment at the hint; continue with the
                // wrapped tail at the start of the ring.
                debug_assert_eq!(segment_scans, 1);
                self.first = segment_start;
                self.size_trail = self.end - ptr;
                // At least one header's worth separates the segments.
                segment_end = segment_start - HEADER_SIZE;
                segment_start = self.start;
            } else if rel_offset < 0 && segment_start == self.start {
                // Scanned blind from the start; probe beyond the end of
                // that segment for a wrapped remainder.
                debug_assert_eq!(segment_scans, 1);
                self.next = ptr;
                ptr += HEADER_SIZE;
                let mut found = false;
                while ptr + HEADER_SIZE < self.end {
                    if self.scan_probe(ptr, segment_end)?.is_some() {
                        found = true;
                        break;
                    }
                    ptr += scan_step;
                }
                if found {
                    segment_start = ptr;
                    self.first = segment_start;
                } else {
                    // A single segment starting at `start`.
                    self.first = self.start;
                    break 'segments;
                }
            } else if rel_offset == 0 && segment_start == self.start {
                // Single-segment file in its home position.
                debug_assert_eq!(segment_scans, 1);
                self.first = segment_start;
                self.next = ptr;
                break 'segments;
            } else {
                debug_assert_eq!(segment_scans, 2);
                debug_assert_ne!(rel_offset, 0);
                if rel_offset >= 0 {
                    self.next = ptr; // end of the older segment
                }
                debug_assert!(self.first >= self.start && self.first < self.end);
                debug_assert!(self.next >= self.start && self.next < self.end);
                if rel_offset < 0 && segment_start > self.start {
                    // The tail segment was scanned last; derive the trail.
                    self.size_trail = self.end - ptr;
                } else if rel_offset > 0 && self.next > self.first {
                    self.size_trail = 0;
                }
            }
        }

        debug_assert!(self.read_header(self.next)?.is_clear());
        if collisions > 0 {
            warn!(collisions, erase_up_to, "seqno collisions during scan");
        }
        if self.debug_enabled() {
            info!(
                index_front = self.seqno_min(),
                index_back = self.seqno_max(),
                seqno_max,
                "scan finished"
            );
            self.dump_map()?;
        }
        Ok(erase_up_to)
    }

    /// Two buffers claim one seqno: keep the incumbent when the payloads
    /// hash equal, poison both otherwise. Returns the updated
    /// `erase_up_to` watermark.
    fn resolve_collision(
        &mut self,
        new_hdr_off: usize,
        new_header: &BufferHeader,
        old_off: Offset,
        erase_up_to: Seqno,
    ) -> CacheResult<Seqno> {
        let seqno = new_header.seqno_g;
        let old_hdr_off = old_off.as_usize() - HEADER_SIZE;
        let old_header = self.read_header(old_hdr_off)?;

        let same_meta = old_header.seqno_g == new_header.seqno_g
            && old_header.size == new_header.size
            && old_header.flags == new_header.flags;
        let same_data = same_meta && {
            let old_hash =
                self.payload_hash(old_off.as_usize(), old_header.size as usize - HEADER_SIZE)?;
            let new_hash = self.payload_hash(
                new_hdr_off + HEADER_SIZE,
                new_header.size as usize - HEADER_SIZE,
            )?;
            old_hash == new_hash
        };

        // The newcomer is unusable either way.
        let mut poisoned = *new_header;
        poisoned.seqno_g = SEQNO_ILL;
        self.write_header(new_hdr_off, &poisoned)?;

        if same_data {
            info!(
                seqno,
                offset = new_hdr_off,
                "duplicate write-set with identical payload, discarding the newcomer"
            );
            Ok(erase_up_to)
        } else {
            warn!(
                seqno,
                offset = new_hdr_off,
                previous = old_hdr_off,
                "write-sets with the same seqno but different payloads, discarding both"
            );
            let mut old_poisoned = old_header;
            old_poisoned.seqno_g = SEQNO_ILL;
            self.write_header(old_hdr_off, &old_poisoned)?;
            Ok(erase_up_to.max(seqno))
        }
    }

    /// Probes the buffer at `ptr`: returns its header only when the
    /// header is plausible, non-sentinel, fits the segment and is
    /// followed by another plausible header.
    fn scan_probe(&self, ptr: usize, segment_end: usize) -> CacheResult<Option<BufferHeader>> {
        if ptr + HEADER_SIZE > self.end {
            return Ok(None);
        }
        let Some(header) = self.probe_header(ptr)? else {
            return Ok(None);
        };
        if header.size == 0 {
            return Ok(None);
        }
        let next_pos = ptr + header.size as usize;
        if next_pos > segment_end {
            return Ok(None);
        }
        if self.probe_header(next_pos)?.is_none() {
            return Ok(None);
        }
        Ok(Some(header))
    }

    fn payload_hash(&self, offset: usize, len: usize) -> CacheResult<u128> {
        let mut payload = vec![0u8; len];
        self.mapping().read(offset, &mut payload)?;
        Ok(xxh3_128(&payload))
    }

    /// Lenient little-endian read of a header's size field, for
    /// diagnostics over possibly-garbage bytes.
    fn read_raw_size(&self, offset: usize) -> CacheResult<u32> {
        if offset + 4 > self.end {
            return Ok(0);
        }
        let mut buf = [0u8; 4];
        self.mapping().read(offset, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }
}
