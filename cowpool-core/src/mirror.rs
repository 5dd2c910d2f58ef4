// vim: tw=80
//! Mirror vdevs
//!
//! Every child of a mirror stores a full copy of every block.  Reads go to one
//! child at a time, round-robin, and fall back to the others on error.  A copy
//! that fails verification is rewritten from a good one.

use std::{
    collections::BTreeMap,
    io,
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering}
    }
};

use futures::{StreamExt, stream::FuturesUnordered};
use tracing::{debug, warn};

use crate::{
    label::LEAF_RESERVED_LBAS,
    types::*,
    util::*,
    vdev::*,
};

/// `Mirror`: Device mirroring, both permanent and temporary
///
/// Addresses within the mirror are relative to the end of each leaf's label
/// region.
pub struct Mirror {
    /// Underlying leaf devices.
    children: Box<[Child]>,

    /// Round-robin index for reads
    next_read_idx: AtomicU32,

    /// Usable size, fixed at creation time
    size: LbaT,

    uuid: Uuid,
}

impl Mirror {
    /// Create a new Mirror from blank leaves
    pub fn create(leaves: Vec<Arc<dyn Leaf>>) -> Result<Self> {
        if leaves.is_empty() {
            return Err(Error::ConfigInvalid(
                "a mirror needs at least one leaf".to_string()));
        }
        let size = leaves.iter()
            .map(|l| l.size().saturating_sub(LEAF_RESERVED_LBAS))
            .min()
            .unwrap_or(0);
        let children = leaves.into_iter()
            .map(Child::present)
            .collect::<Vec<_>>();
        Ok(Mirror::new(Uuid::new_v4(), children.into_boxed_slice(), size))
    }

    fn new(uuid: Uuid, children: Box<[Child]>, size: LbaT) -> Self {
        Mirror {
            children,
            next_read_idx: AtomicU32::new(0),
            size,
            uuid
        }
    }

    /// Rewrite bad copies with good data
    async fn heal(&self, bad: &[usize], buf: &IoVec, lba: LbaT) {
        for idx in bad.iter() {
            let child = &self.children[*idx];
            if let Some(leaf) = child.usable() {
                warn!(leaf = %leaf.uuid(), lba, "self-healing mirror child");
                if leaf.write_at(buf.clone(), lba).await.is_err() {
                    child.fault();
                }
            }
        }
    }

    pub fn label(&self) -> VdevLabel {
        VdevLabel {
            uuid: self.uuid,
            kind: VdevKind::Mirror,
            size: self.size,
            children: self.children.iter().map(Child::uuid).collect()
        }
    }

    pub fn leaves(&self) -> Vec<Arc<dyn Leaf>> {
        self.children.iter()
            .filter_map(Child::usable)
            .cloned()
            .collect()
    }

    /// Open an existing `Mirror` from whichever of its leaves are present.
    pub fn open(label: &VdevLabel, leaves: &mut BTreeMap<Uuid, Arc<dyn Leaf>>)
        -> Result<Self>
    {
        let children = label.children.iter()
            .map(|uuid| match leaves.remove(uuid) {
                Some(leaf) => Child::present(leaf),
                None => Child::missing(*uuid)
            }).collect::<Vec<_>>();
        if children.iter().all(|c| matches!(c, Child::Missing(_))) {
            return Err(Error::PoolNotFound(
                format!("all children of mirror {} are missing", label.uuid)));
        }
        Ok(Mirror::new(label.uuid, children.into_boxed_slice(), label.size))
    }

    /// Read one copy of a block, falling back to other children on error.
    pub async fn read(&self, dva: &Dva, verify: Verify<'_>) -> Result<IoVec> {
        let nchildren = self.children.len();
        let initial_idx = self.read_idx();
        let lba = dva.lba + LEAF_RESERVED_LBAS;
        let mut bad = Vec::new();
        let mut err = Error::DeviceIo(io::ErrorKind::NotFound);
        for i in 0..nchildren {
            let idx = (initial_idx + i) % nchildren;
            let Some(leaf) = self.children[idx].usable() else {
                continue;
            };
            let (dbs, buf) = zeroed(dva.asize as usize * BYTES_PER_LBA);
            match leaf.read_at(buf, lba).await {
                Ok(()) => {
                    let db = frozen(&dbs);
                    if verify(&db[..]) {
                        self.heal(&bad, &db, lba).await;
                        return Ok(db);
                    }
                    warn!(leaf = %leaf.uuid(), %dva, "checksum mismatch");
                    bad.push(idx);
                    err = Error::ChecksumMismatch(*dva);
                },
                Err(e) => {
                    debug!(leaf = %leaf.uuid(), %dva, "read error {:?}", e);
                    err = e;
                }
            }
        }
        Err(err)
    }

    /// Return the index of the next child to read from
    fn read_idx(&self) -> usize {
        self.next_read_idx.fetch_add(1, Ordering::Relaxed) as usize %
            self.children.len()
    }

    pub fn size(&self) -> LbaT {
        self.size
    }

    pub fn status(&self) -> VdevStatus {
        let leaves = self.children.iter()
            .map(Child::status)
            .collect::<Vec<_>>();
        let health = summarize_health(&leaves, leaves.len() - 1);
        VdevStatus {
            uuid: self.uuid,
            kind: VdevKind::Mirror,
            health,
            leaves
        }
    }

    /// Sync every healthy child.  Succeeds if at least one child does.
    pub async fn sync_all(&self) -> Result<()> {
        let results = self.children.iter()
            .enumerate()
            .filter_map(|(i, c)| c.usable().map(|l| (i, l.sync_all())))
            .map(|(i, fut)| async move { (i, fut.await) })
            .collect::<FuturesUnordered<_>>()
            .collect::<Vec<_>>()
            .await;
        self.tally(results)
    }

    /// Fault every child that failed.  Succeed if any child succeeded.
    fn tally(&self, results: Vec<(usize, Result<()>)>) -> Result<()> {
        let mut r = Err(Error::DeviceIo(io::ErrorKind::NotFound));
        for (idx, result) in results.into_iter() {
            match result {
                Ok(()) => r = Ok(()),
                Err(e) => {
                    self.children[idx].fault();
                    if r.is_err() {
                        r = Err(e);
                    }
                }
            }
        }
        r
    }

    /// Write a block to every healthy child
    pub async fn write(&self, dva: &Dva, buf: IoVec) -> Result<()> {
        debug_assert_eq!(buf.len(), dva.asize as usize * BYTES_PER_LBA);
        let lba = dva.lba + LEAF_RESERVED_LBAS;
        let results = self.children.iter()
            .enumerate()
            .filter_map(|(i, c)| {
                c.usable().map(|l| (i, l.write_at(buf.clone(), lba)))
            }).map(|(i, fut)| async move { (i, fut.await) })
            .collect::<FuturesUnordered<_>>()
            .collect::<Vec<_>>()
            .await;
        self.tally(results)
    }
}

// LCOV_EXCL_STOP
