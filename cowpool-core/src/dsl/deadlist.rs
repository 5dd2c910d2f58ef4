// vim: tw=80
//! Deadlists: blocks killed by a dataset that an earlier snapshot still uses

use crate::{types::*, zio::BlockPtr};
use serde_derive::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct Deadlist {
    entries: Vec<BlockPtr>,
    used: u64,
    compressed: u64,
    uncompressed: u64,
}

impl Deadlist {
    pub fn compressed(&self) -> u64 {
        self.compressed
    }

    pub fn entries(&self) -> &[BlockPtr] {
        &self.entries[..]
    }

    pub fn into_entries(self) -> Vec<BlockPtr> {
        self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn push(&mut self, bp: BlockPtr) {
        self.used += bp.asize();
        self.compressed += u64::from(bp.psize);
        self.uncompressed += u64::from(bp.lsize);
        self.entries.push(bp);
    }

    /// Allocated space of the entries born in `(min, max]`
    pub fn space_range(&self, min: TxgT, max: TxgT) -> u64 {
        self.entries.iter()
            .filter(|bp| bp.birth > min && bp.birth <= max)
            .map(BlockPtr::asize)
            .sum()
    }

    /// Remove and return every entry
    pub fn take(&mut self) -> Deadlist {
        std::mem::take(self)
    }

    pub fn uncompressed(&self) -> u64 {
        self.uncompressed
    }

    pub fn used(&self) -> u64 {
        self.used
    }
}

// LCOV_EXCL_START
#[cfg(test)]
mod t {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn accounting() {
        let mut dl = Deadlist::default();
        assert!(dl.is_empty());
        dl.push(BlockPtr::fake(10, 1, TxgT(3)));
        dl.push(BlockPtr::fake(20, 2, TxgT(5)));
        assert_eq!(dl.len(), 2);
        assert_eq!(dl.used(), 3 * 4096);
        assert_eq!(dl.compressed(), 3 * 4096);
        assert_eq!(dl.uncompressed(), 3 * 4096);
    }

    #[test]
    fn space_range() {
        let mut dl = Deadlist::default();
        for (lba, birth) in [(1, 2), (2, 4), (3, 6), (4, 8)] {
            dl.push(BlockPtr::fake(lba, 1, TxgT(birth)));
        }
        // Exclusive below, inclusive above
        assert_eq!(dl.space_range(TxgT(2), TxgT(6)), 2 * 4096);
        assert_eq!(dl.space_range(TxgT(0), TxgT(u64::MAX)), 4 * 4096);
        assert_eq!(dl.space_range(TxgT(8), TxgT(u64::MAX)), 0);
    }

    #[test]
    fn take() {
        let mut dl = Deadlist::default();
        dl.push(BlockPtr::fake(1, 1, TxgT(2)));
        let taken = dl.take();
        assert!(dl.is_empty());
        assert_eq!(dl.used(), 0);
        assert_eq!(taken.len(), 1);
        assert_eq!(taken.into_entries()[0].birth, TxgT(2));
    }
}
// LCOV_EXCL_STOP
