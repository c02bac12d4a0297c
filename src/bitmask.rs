//! Per-fragment presence bitmap (§4.2).
//!
//! Fragments are grouped into 128-fragment segments; a segment's 16-byte
//! window lives at `bitmask_length - seg_id * 16`. Within a segment, bit
//! addressing runs backward from the end of the buffer so the wire
//! representation of a `FRAGMENTS_REQUEST` bitmask matches the tail of the
//! tracker's own buffer verbatim. Both addressing schemes are private to
//! this module; callers only ever see fragment ids and segment ids.

use alloc::vec;
use alloc::vec::Vec;

/// Fragments per recovery segment (16-byte bitmask * 8 bits).
pub const SEGMENT_SIZE: u16 = 128;
/// Byte width of one segment's bitmask window.
pub const SEGMENT_BYTES: usize = 16;

/// `ceil(fragment_count / SEGMENT_SIZE)`.
pub fn segment_count_for(fragment_count: u16) -> u16 {
    if fragment_count == 0 {
        return 0;
    }
    let q = fragment_count / SEGMENT_SIZE;
    if fragment_count % SEGMENT_SIZE != 0 {
        q + 1
    } else {
        q
    }
}

/// `ceil(f / SEGMENT_SIZE)`, the segment a given 1-indexed fragment id
/// belongs to.
pub fn segment_of(frag_id: u16) -> u16 {
    segment_count_for(frag_id)
}

/// Per-fragment reception tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitmask {
    bytes: Vec<u8>,
    fragment_count: u16,
}

impl Bitmask {
    /// Allocates a tracker for `fragment_count` fragments, all unreceived.
    /// Bits past `fragment_count` (padding, in the final segment) are
    /// forced to 1 so they never count toward "missing".
    pub fn new(fragment_count: u16) -> Self {
        let segments = segment_count_for(fragment_count) as usize;
        let bytes = vec![0xFFu8; segments * SEGMENT_BYTES];
        let mut b = Bitmask {
            bytes,
            fragment_count,
        };
        b.clear_valid_range();
        b
    }

    /// Rebuilds a tracker from a persisted byte array and fragment count.
    /// Used by `load_session`; does not re-derive padding bits, since a
    /// persisted bitmask is assumed to already have them forced to 1.
    pub fn from_persisted(bytes: Vec<u8>, fragment_count: u16) -> Self {
        Bitmask {
            bytes,
            fragment_count,
        }
    }

    pub fn fragment_count(&self) -> u16 {
        self.fragment_count
    }

    pub fn segment_count(&self) -> u16 {
        (self.bytes.len() / SEGMENT_BYTES) as u16
    }

    /// The raw, wire/persisted-format bytes (reversed addressing intact).
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    fn clear_valid_range(&mut self) {
        for f in 1..=self.fragment_count {
            self.clear_bit(f);
        }
    }

    fn addr(len: usize, frag_id: u16) -> (usize, u8) {
        let idx = (len - 1) - ((frag_id - 1) as usize / 8);
        let bit = (frag_id - 1) % 8;
        (idx, bit)
    }

    fn clear_bit(&mut self, frag_id: u16) {
        let (idx, bit) = Self::addr(self.bytes.len(), frag_id);
        self.bytes[idx] &= !(1 << bit);
    }

    /// Marks `frag_id` received. Out-of-range ids (0 or > fragment_count)
    /// are a no-op; callers are expected to have already rejected those
    /// per §4.1.
    pub fn mark_received(&mut self, frag_id: u16) {
        if frag_id == 0 || frag_id > self.fragment_count {
            return;
        }
        let (idx, bit) = Self::addr(self.bytes.len(), frag_id);
        self.bytes[idx] |= 1 << bit;
    }

    /// Out-of-range ids report as received (they never contribute to
    /// "missing").
    pub fn is_received(&self, frag_id: u16) -> bool {
        if frag_id == 0 || frag_id > self.fragment_count {
            return true;
        }
        let (idx, bit) = Self::addr(self.bytes.len(), frag_id);
        self.bytes[idx] & (1 << bit) != 0
    }

    /// Count of unreceived fragments in `1..=fragment_count`.
    pub fn missing_total(&self) -> u16 {
        (1..=self.fragment_count)
            .filter(|&f| !self.is_received(f))
            .count() as u16
    }

    fn segment_window(&self, seg: u16) -> &[u8] {
        let len = self.bytes.len();
        let start = len - (seg as usize * SEGMENT_BYTES);
        &self.bytes[start..start + SEGMENT_BYTES]
    }

    /// Lowest 1-indexed segment id with at least one missing fragment, or
    /// 0 if none. When `out_seg_bitmask` is supplied, it is overwritten
    /// with the scanned segment's 16-byte window on every iteration (so on
    /// a positive return it holds exactly that segment's window; on a
    /// zero return it holds whatever the last segment scanned happened to
    /// be, which callers ignore).
    pub fn first_missing_segment(&self, mut out_seg_bitmask: Option<&mut [u8; SEGMENT_BYTES]>) -> u16 {
        for seg in 1..=self.segment_count() {
            let window = self.segment_window(seg);
            if let Some(out) = out_seg_bitmask.as_deref_mut() {
                out.copy_from_slice(window);
            }
            if window.iter().any(|b| *b != 0xFF) {
                return seg;
            }
        }
        0
    }
}

/// A requester's per-segment bitmask, as carried in a `FRAGMENTS_REQUEST`
/// and used by a serving peer to find fragments the requester still lacks.
/// Same bit convention as [`Bitmask`] (1 = requester already has it),
/// scoped to one segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentRequestMask {
    pub segment_id: u16,
    mask: [u8; SEGMENT_BYTES],
}

impl SegmentRequestMask {
    pub fn new(segment_id: u16, mask: [u8; SEGMENT_BYTES]) -> Self {
        SegmentRequestMask { segment_id, mask }
    }

    pub fn mask(&self) -> &[u8; SEGMENT_BYTES] {
        &self.mask
    }

    fn base_fragment_id(&self) -> u16 {
        (self.segment_id - 1) * SEGMENT_SIZE + 1
    }

    /// Marks a specific fragment id served in the local scratch copy,
    /// regardless of current bit state. Used when a serving node snoops
    /// another peer's `FRAGMENT` broadcast for a fragment it was about to
    /// serve itself, so it never redundantly retransmits it. A no-op if
    /// `frag_id` falls outside this segment.
    pub fn mark_served(&mut self, frag_id: u16) {
        let base = self.base_fragment_id();
        if frag_id < base || frag_id >= base + SEGMENT_SIZE {
            return;
        }
        let local_idx = (frag_id - base) as usize;
        let byte_idx = SEGMENT_BYTES - 1 - local_idx / 8;
        let bit = local_idx % 8;
        self.mask[byte_idx] |= 1 << bit;
    }

    /// Finds the lowest fragment id within this segment the requester
    /// still lacks (bit 0), subject to `fragment_count` — ids beyond it
    /// are treated as already satisfied. When `mark_served` is set, the
    /// found bit is set to 1 in the local scratch copy so a single serve
    /// loop never resends the same fragment twice.
    pub fn next_missing(&mut self, fragment_count: u16, mark_served: bool) -> Option<u16> {
        let base = self.base_fragment_id();
        for byte_idx in (0..SEGMENT_BYTES).rev() {
            for bit in 0..8u8 {
                let local_idx = (SEGMENT_BYTES - 1 - byte_idx) * 8 + bit as usize;
                let frag_id = base + local_idx as u16;
                if frag_id > fragment_count {
                    // Nothing meaningful lives at or past this id; treat the
                    // remainder of this byte as served so the scan moves on.
                    self.mask[byte_idx] |= 1 << bit;
                    continue;
                }
                if self.mask[byte_idx] & (1 << bit) == 0 {
                    if mark_served {
                        self.mask[byte_idx] |= 1 << bit;
                    }
                    return Some(frag_id);
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn new_bitmask_pads_beyond_fragment_count() {
        // 2 fragments -> 1 segment (16 bytes). Fragment 1 at (len-1, bit0),
        // fragment 2 at (len-1, bit1); everything else forced to 1.
        let b = Bitmask::new(2);
        assert_eq!(b.as_bytes().len(), 16);
        assert_eq!(b.as_bytes()[15], 0xFC); // bits 0,1 clear, rest set
        assert_eq!(&b.as_bytes()[0..15], &[0xFFu8; 15][..]);
        assert_eq!(b.missing_total(), 2);
    }

    #[test]
    fn mark_received_completes_to_all_ones() {
        let mut b = Bitmask::new(2);
        // Before marking: padding bits (3-128) already forced to 1, valid
        // bits (1,2) still clear, so the last byte reads 0xFC.
        assert_eq!(b.as_bytes()[15], 0xFC);
        b.mark_received(1);
        b.mark_received(2);
        assert!(b.is_received(1));
        assert!(b.is_received(2));
        assert_eq!(b.missing_total(), 0);
        // Fully received + padding forced to 1 everywhere else -> an
        // all-ones 16-byte window.
        assert_eq!(b.as_bytes(), &[0xFFu8; 16][..]);
    }

    #[test]
    fn missing_count_over_full_segment() {
        let mut b = Bitmask::new(128);
        for f in 1..=128u16 {
            if f != 42 {
                b.mark_received(f);
            }
        }
        assert_eq!(b.missing_total(), 1);
        assert!(!b.is_received(42));
    }

    #[test]
    fn first_missing_segment_reports_window() {
        let mut b = Bitmask::new(128);
        for f in 1..=128u16 {
            if f != 42 {
                b.mark_received(f);
            }
        }
        let mut out = [0u8; SEGMENT_BYTES];
        let seg = b.first_missing_segment(Some(&mut out));
        assert_eq!(seg, 1);
        // fragment 42 -> local index 41 -> byte (15 - 41/8)=15-5=10, bit 1
        assert_eq!(out[10] & (1 << 1), 0);
    }

    #[test]
    fn first_missing_segment_zero_when_complete() {
        let b = Bitmask::new(4);
        let mut full = Bitmask::new(4);
        for f in 1..=4u16 {
            full.mark_received(f);
        }
        assert_eq!(full.first_missing_segment(None), 0);
        let _ = b; // unreceived tracker used only to contrast in reading
    }

    #[test]
    fn segment_request_mask_walks_backward_then_forward() {
        // requester has everything except fragment 42 in segment 1
        let mut mask = [0xFFu8; SEGMENT_BYTES];
        mask[10] &= !(1 << 1); // clear fragment 42's bit
        let mut req = SegmentRequestMask::new(1, mask);
        let next = req.next_missing(128, true);
        assert_eq!(next, Some(42));
        // served now, nothing left missing
        assert_eq!(req.next_missing(128, true), None);
    }

    #[test]
    fn mark_served_sets_specific_fragment() {
        let mut req = SegmentRequestMask::new(1, [0x00u8; SEGMENT_BYTES]);
        assert_eq!(req.next_missing(128, false), Some(1));
        req.mark_served(1);
        assert_eq!(req.next_missing(128, false), Some(2));
        // out of segment range: no-op
        req.mark_served(200);
        assert_eq!(req.next_missing(128, false), Some(2));
    }

    #[test]
    fn segment_count_for_rounds_up() {
        assert_eq!(segment_count_for(0), 0);
        assert_eq!(segment_count_for(1), 1);
        assert_eq!(segment_count_for(128), 1);
        assert_eq!(segment_count_for(129), 2);
        assert_eq!(segment_count_for(256), 2);
        assert_eq!(segment_count_for(257), 3);
    }
}
