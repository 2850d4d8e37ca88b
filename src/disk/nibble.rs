//! L2: in-memory representation of a nibblized disk.
//!
//! Struct layout grounded directly on `original_source/clem_disk.h`'s
//! `ClemensNibbleDisk`: quarter-track indexed arrays describing offset/length/
//! initialization state into one shared `bits_data` buffer, plus a meta-track map
//! that aliases intermediate quarter-tracks onto their nearest real track.

use super::{DiskType, LIMIT_QTR_TRACKS, UNINITIALIZED_TRACK};

/// WOZ-spec default bit length for a blank 5.25" track.
pub const DEFAULT_TRACK_BIT_LENGTH_525: usize = 51200;
/// `dsk2woz2`-derived bit length for a blank 5.25" track.
pub const BLANK_TRACK_BIT_LENGTH_525: usize = 50624;

/// The five descending sectors-per-track zones of a 3.5" double-sided disk, and the
/// track ranges (in real 80-track-per-side units, `0..159`) they cover.
pub const ZONE_SECTORS: [usize; 5] = [12, 11, 10, 9, 8];
pub const ZONE_TRACK_RANGES: [(usize, usize); 5] =
    [(0, 32), (32, 64), (64, 96), (96, 128), (128, 160)];

/// Resolve which of the five 3.5" zones a real track index (`0..159`) falls in.
pub fn zone_for_track(track: usize) -> usize {
    for (zone, (lo, hi)) in ZONE_TRACK_RANGES.iter().enumerate() {
        if track >= *lo && track < *hi {
            return zone;
        }
    }
    ZONE_SECTORS.len() - 1
}

/// A nibblized disk: the bit stream for every initialized track, as the IWM would
/// read it under the head, plus the bookkeeping needed to find a track by
/// quarter-track index.
#[derive(Debug, Clone)]
pub struct NibbleDisk {
    pub disk_type: DiskType,
    pub bit_timing_ns: u32,
    pub track_count: u32,
    pub is_write_protected: bool,
    pub is_double_sided: bool,
    pub meta_track_map: [u8; LIMIT_QTR_TRACKS],
    pub track_byte_offset: [u32; LIMIT_QTR_TRACKS],
    pub track_byte_count: [u32; LIMIT_QTR_TRACKS],
    pub track_bits_count: [u32; LIMIT_QTR_TRACKS],
    pub track_initialized: [u8; LIMIT_QTR_TRACKS],
    pub bits_data: Vec<u8>,
}

impl NibbleDisk {
    /// An empty disk with no tracks installed yet; a container loader (L3/L4)
    /// populates it track by track during nibblization or WOZ TRKS parsing.
    pub fn empty(disk_type: DiskType) -> Self {
        let bit_timing_ns = match disk_type {
            DiskType::D525 => 4000,
            DiskType::D35 => 2000,
            _ => 0,
        };
        Self {
            disk_type,
            bit_timing_ns,
            track_count: 0,
            is_write_protected: false,
            is_double_sided: false,
            meta_track_map: [UNINITIALIZED_TRACK; LIMIT_QTR_TRACKS],
            track_byte_offset: [0; LIMIT_QTR_TRACKS],
            track_byte_count: [0; LIMIT_QTR_TRACKS],
            track_bits_count: [0; LIMIT_QTR_TRACKS],
            track_initialized: [0; LIMIT_QTR_TRACKS],
            bits_data: Vec::new(),
        }
    }

    /// Installs a freshly nibblized track at quarter-track `qtr_track`: appends
    /// `bytes` to the shared `bits_data` buffer, records its offset/length/bit-count,
    /// marks it initialized, and self-maps `meta_track_map[qtr_track] = qtr_track`.
    /// Any intermediate quarter-tracks in `(qtr_track, qtr_track + increment)` are
    /// left (or reset) uninitialized, per §4.3.2 step 3f.
    pub fn install_track(&mut self, qtr_track: usize, bytes: Vec<u8>, bit_count: usize, increment: usize) {
        assert!(qtr_track < LIMIT_QTR_TRACKS);
        let offset = self.bits_data.len();
        let byte_count = bytes.len();
        self.bits_data.extend_from_slice(&bytes);
        self.track_byte_offset[qtr_track] = offset as u32;
        self.track_byte_count[qtr_track] = byte_count as u32;
        self.track_bits_count[qtr_track] = bit_count as u32;
        self.track_initialized[qtr_track] = 1;
        self.meta_track_map[qtr_track] = qtr_track as u8;
        self.track_count += 1;
        for i in qtr_track + 1..(qtr_track + increment).min(LIMIT_QTR_TRACKS) {
            self.meta_track_map[i] = UNINITIALIZED_TRACK;
            self.track_initialized[i] = 0;
        }
    }

    /// Resolves `meta_track_map[qtr_track]`; `None` if the entry is `0xFF` or the
    /// resolved physical track was never initialized.
    pub fn get_track_bits(&self, qtr_track: usize) -> Option<(&[u8], u32)> {
        if qtr_track >= LIMIT_QTR_TRACKS {
            return None;
        }
        let phys = self.meta_track_map[qtr_track];
        if phys == UNINITIALIZED_TRACK {
            return None;
        }
        let phys = phys as usize;
        if self.track_initialized[phys] == 0 {
            return None;
        }
        let off = self.track_byte_offset[phys] as usize;
        let len = self.track_byte_count[phys] as usize;
        Some((&self.bits_data[off..off + len], self.track_bits_count[phys]))
    }

    /// Quarter-track indices for the real tracks of a 5.25" disk: `0, 4, 8, …, 136`.
    pub fn real_quarter_tracks_525() -> impl Iterator<Item = usize> {
        (0..35).map(|t| t * 4)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_disk_has_no_tracks() {
        let d = NibbleDisk::empty(DiskType::D525);
        assert_eq!(d.bit_timing_ns, 4000);
        for q in 0..LIMIT_QTR_TRACKS {
            assert!(d.get_track_bits(q).is_none());
        }
    }

    #[test]
    fn install_track_aliases_intermediate_quarter_tracks() {
        let mut d = NibbleDisk::empty(DiskType::D525);
        d.install_track(0, vec![0xaa; 100], 800, 4);
        assert!(d.get_track_bits(0).is_some());
        assert!(d.get_track_bits(1).is_none());
        assert!(d.get_track_bits(2).is_none());
        assert!(d.get_track_bits(3).is_none());
        d.install_track(4, vec![0xbb; 50], 400, 4);
        let (bits, count) = d.get_track_bits(4).unwrap();
        assert_eq!(count, 400);
        assert_eq!(bits.len(), 50);
    }

    #[test]
    fn zone_for_track_matches_spec_ranges() {
        assert_eq!(zone_for_track(0), 0);
        assert_eq!(zone_for_track(31), 0);
        assert_eq!(zone_for_track(32), 1);
        assert_eq!(zone_for_track(159), 4);
    }
}
