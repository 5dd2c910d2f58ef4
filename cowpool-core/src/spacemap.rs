// vim: tw=80
//! Space maps: per-vdev allocation bitmaps
//!
//! Each top-level vdev has one bitmap with one bit per LBA of its address
//! space.  A set bit means allocated.  Two copies live at the start of the
//! vdev's address space; txg `t` writes slot `t % 2`, so the copy belonging to
//! the last published uberblock is never overwritten in place.

use byteorder::{BigEndian, ByteOrder};
use fixedbitset::FixedBitSet;
use metrohash::MetroHash64;
use serde_derive::{Deserialize, Serialize};
use std::hash::Hasher;
use tracing::trace;

use crate::{
    types::*,
    util::*
};

/*
 * On-disk Space Map Format:
 *
 * Checksum:    8 bytes     MetroHash64 of Length and Contents
 * Length:      8 bytes     Length of Contents in bytes
 * Contents:    variable    bincode-encoded SpacemapPhys
 * Pad:         variable    0-padding to an LBA boundary
 */
const HEADER_LEN: usize = 16;

#[derive(Deserialize, Serialize)]
struct SpacemapPhys {
    txg: TxgT,
    lbas: LbaT,
    blocks: Vec<u32>,
}

/// In-memory allocation state of one top-level vdev
#[derive(Clone, Debug)]
pub struct SpaceMap {
    bits: FixedBitSet,
    /// Where to start looking for free space
    cursor: usize,
}

impl SpaceMap {
    /// Allocate `lbas` contiguous LBAs.  Returns the first LBA, or `None` if
    /// no free run is large enough.
    pub fn alloc(&mut self, lbas: LbaT) -> Option<LbaT> {
        let want = lbas as usize;
        if want == 0 {
            return None;
        }
        let len = self.bits.len();
        let begin = self.find_run(self.cursor, len, want)
            .or_else(|| self.find_run(0, len, want))?;
        self.bits.set_range(begin..begin + want, true);
        self.cursor = begin + want;
        trace!(lba = begin, lbas, "alloc");
        Some(begin as LbaT)
    }

    /// Number of LBAs currently allocated
    pub fn allocated(&self) -> LbaT {
        self.bits.count_ones(..) as LbaT
    }

    /// Parse a space map from disk.
    ///
    /// It must have been written for exactly `txg`.
    pub fn deserialize(buf: &[u8], txg: TxgT) -> Result<Self> {
        if !SpaceMap::verify(buf) {
            return Err(Error::Integrity("space map checksum".to_string()));
        }
        let len = BigEndian::read_u64(&buf[8..16]) as usize;
        let phys: SpacemapPhys = bincode::deserialize(
            &buf[HEADER_LEN..HEADER_LEN + len])?;
        if phys.txg != txg {
            return Err(Error::Integrity(format!(
                "space map is from txg {}, expected {}", phys.txg, txg)));
        }
        let bits = FixedBitSet::with_capacity_and_blocks(phys.lbas as usize,
                                                         phys.blocks);
        Ok(SpaceMap{bits, cursor: 0})
    }

    /// Find the first run of `want` clear bits in `[begin, end)`
    fn find_run(&self, begin: usize, end: usize, want: usize) -> Option<usize>
    {
        let mut run = 0;
        for i in begin..end {
            if self.bits[i] {
                run = 0;
            } else {
                run += 1;
                if run == want {
                    return Some(i + 1 - want);
                }
            }
        }
        None
    }

    /// Return `lbas` LBAs starting at `lba` to the free pool.
    pub fn free(&mut self, lba: LbaT, lbas: LbaT) {
        let begin = lba as usize;
        debug_assert!((begin..begin + lbas as usize).all(|i| self.bits[i]),
            "double free at {lba}");
        self.bits.set_range(begin..begin + lbas as usize, false);
        trace!(lba, lbas, "free");
    }

    /// Number of unallocated LBAs
    pub fn free_lbas(&self) -> LbaT {
        self.size() - self.allocated()
    }

    /// Create a space map for a fresh vdev.  The first `reserved` LBAs are
    /// permanently allocated.
    pub fn new(size: LbaT, reserved: LbaT) -> Self {
        let mut bits = FixedBitSet::with_capacity(size as usize);
        bits.set_range(..reserved as usize, true);
        SpaceMap{bits, cursor: reserved as usize}
    }

    /// Serialize for writing to disk, as of the end of `txg`.
    ///
    /// `frees` have been freed during `txg` but not yet returned to this map.
    /// They're recorded as free on disk, because they will be once `txg` is
    /// published.
    pub fn serialize(&self, txg: TxgT, frees: &[(LbaT, LbaT)]) -> Vec<u8> {
        let mut bits = self.bits.clone();
        for (lba, lbas) in frees.iter() {
            bits.set_range(*lba as usize..(*lba + *lbas) as usize, false);
        }
        let phys = SpacemapPhys {
            txg,
            lbas: self.size(),
            blocks: bits.as_slice().to_vec()
        };
        let contents = bincode::serialize(&phys)
            .expect("serializing a Vec<u32> cannot fail");
        let mut buf = vec![0u8; HEADER_LEN];
        BigEndian::write_u64(&mut buf[8..16], contents.len() as u64);
        buf.extend_from_slice(&contents);
        let mut hasher = MetroHash64::new();
        hasher.write(&buf[8..]);
        BigEndian::write_u64(&mut buf[0..8], hasher.finish());
        pad_to_lba(buf)
    }

    /// Size of the address space in LBAs
    pub fn size(&self) -> LbaT {
        self.bits.len() as LbaT
    }

    /// How many LBAs does one serialized copy need, for a vdev of `size` LBAs?
    pub fn slot_lbas(size: LbaT) -> LbaT {
        let blocks = div_roundup(size as usize, 32);
        // bincode adds a u64 length prefix to the Vec
        let contents = 8 + 8 + 8 + blocks * 4;
        lbas_for(HEADER_LEN + contents)
    }

    /// Is this buffer an intact serialized space map?
    pub fn verify(buf: &[u8]) -> bool {
        if buf.len() < HEADER_LEN {
            return false;
        }
        let len = BigEndian::read_u64(&buf[8..16]) as usize;
        if HEADER_LEN.checked_add(len).map(|e| e > buf.len()).unwrap_or(true) {
            return false;
        }
        let mut hasher = MetroHash64::new();
        hasher.write(&buf[8..HEADER_LEN + len]);
        hasher.finish() == BigEndian::read_u64(&buf[0..8])
    }
}

// LCOV_EXCL_START
#[cfg(test)]
mod t {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn alloc_first_fit() {
        let mut sm = SpaceMap::new(100, 10);
        assert_eq!(sm.free_lbas(), 90);
        assert_eq!(sm.alloc(5), Some(10));
        assert_eq!(sm.alloc(5), Some(15));
        sm.free(10, 5);
        // The cursor moves forward before wrapping around
        assert_eq!(sm.alloc(5), Some(20));
        assert_eq!(sm.alloc(80), None);
        assert_eq!(sm.alloc(70), Some(25));
        assert_eq!(sm.alloc(5), Some(95));
        assert_eq!(sm.free_lbas(), 5);
        assert_eq!(sm.alloc(5), Some(10));
        assert_eq!(sm.free_lbas(), 0);
        assert_eq!(sm.alloc(1), None);
    }

    #[test]
    fn alloc_zero() {
        let mut sm = SpaceMap::new(100, 10);
        assert_eq!(sm.alloc(0), None);
    }

    #[test]
    fn roundtrip_with_frees() {
        let mut sm = SpaceMap::new(1000, 4);
        let a = sm.alloc(10).unwrap();
        let b = sm.alloc(20).unwrap();
        let buf = sm.serialize(TxgT(7), &[(a, 10)]);
        assert_eq!(buf.len() % BYTES_PER_LBA, 0);
        assert!(buf.len() as LbaT <= SpaceMap::slot_lbas(1000) *
                BYTES_PER_LBA as LbaT);
        let sm2 = SpaceMap::deserialize(&buf, TxgT(7)).unwrap();
        assert_eq!(sm2.size(), 1000);
        assert_eq!(sm2.allocated(), 4 + 20);
        assert!(sm2.bits[b as usize]);
        assert!(!sm2.bits[a as usize]);
    }

    #[test]
    fn wrong_txg() {
        let sm = SpaceMap::new(1000, 4);
        let buf = sm.serialize(TxgT(7), &[]);
        assert!(matches!(SpaceMap::deserialize(&buf, TxgT(8)),
                         Err(Error::Integrity(_))));
    }

    #[test]
    fn corrupt() {
        let sm = SpaceMap::new(1000, 4);
        let mut buf = sm.serialize(TxgT(7), &[]);
        buf[HEADER_LEN + 3] ^= 1;
        assert!(!SpaceMap::verify(&buf));
        assert!(matches!(SpaceMap::deserialize(&buf, TxgT(7)),
                         Err(Error::Integrity(_))));
    }

    #[test]
    fn slot_lbas() {
        assert_eq!(SpaceMap::slot_lbas(1000), 1);
        // 1 bit per LBA: a 1 GiB vdev needs 32 KiB of bitmap
        assert_eq!(SpaceMap::slot_lbas(262_144), 9);
    }
}
// LCOV_EXCL_STOP
