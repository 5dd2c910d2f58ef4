// vim: tw=80
//! Single-parity RAID vdevs with variable-width stripes
//!
//! The raidz address space interleaves its children one LBA at a time: raidz
//! LBA `a` lives on child `a % n` at child LBA `a / n`.  A block of `D` data
//! LBAs occupies `asize(D)` consecutive raidz LBAs, grouped into rows of `n`.
//! The first LBA of every row holds the XOR parity of the rest of the row, so
//! the final row of a block may be narrower than the others.
//!
//! Reconstruction doesn't need to know which child is bad: if the data fails
//! verification, every child is tried in turn as the missing one.

use std::{
    collections::BTreeMap,
    io,
    sync::Arc
};

use futures::{StreamExt, stream::FuturesUnordered};
use tracing::{debug, warn};

use crate::{
    label::LEAF_RESERVED_LBAS,
    types::*,
    util::*,
    vdev::*,
};

/// The portion of one block that lives on a single child.
struct Column {
    /// First raidz-relative sector of the block stored on this child
    first: usize,
    /// Number of sectors stored on this child
    count: usize,
    /// Child LBA of the first sector, excluding the label region
    lba: LbaT,
    data: Option<Vec<u8>>,
}

/// The geometry of one block within a raidz vdev
struct Stripe {
    columns: Vec<Column>,
    n: usize,
    start: LbaT,
    asize: usize,
}

impl Stripe {
    fn new(n: usize, start: LbaT, asize: LbaT) -> Self {
        let asize = asize as usize;
        let columns = (0..n).map(|c| {
            let first = (c + n - (start % n as LbaT) as usize) % n;
            let count = if first < asize {
                (asize - first).div_ceil(n)
            } else {
                0
            };
            let lba = (start + first as LbaT) / n as LbaT;
            Column { first, count, lba, data: None }
        }).collect::<Vec<_>>();
        Stripe { columns, n, start, asize }
    }

    /// Which child, and where within its column, is sector `k`?
    fn locate(&self, k: usize) -> (usize, usize) {
        let c = ((self.start + k as LbaT) % self.n as LbaT) as usize;
        (c, (k - self.columns[c].first) / self.n)
    }

    fn sector(&self, k: usize) -> &[u8] {
        let (c, i) = self.locate(k);
        let data = self.columns[c].data.as_ref()
            .expect("sector of a column that was never filled");
        &data[i * BYTES_PER_LBA..(i + 1) * BYTES_PER_LBA]
    }

    fn sector_mut(&mut self, k: usize) -> &mut [u8] {
        let (c, i) = self.locate(k);
        let data = self.columns[c].data.as_mut()
            .expect("sector of a column that was never filled");
        &mut data[i * BYTES_PER_LBA..(i + 1) * BYTES_PER_LBA]
    }

    /// Sectors `[begin, end)` of row `r`
    fn row(&self, r: usize) -> (usize, usize) {
        (r * self.n, (r * self.n + self.n).min(self.asize))
    }

    fn rows(&self) -> usize {
        self.asize.div_ceil(self.n)
    }

    /// Concatenate the data sectors, skipping parity
    fn assemble(&self) -> Vec<u8> {
        let mut v = Vec::with_capacity(self.asize * BYTES_PER_LBA);
        for k in (0..self.asize).filter(|k| k % self.n != 0) {
            v.extend_from_slice(self.sector(k));
        }
        v
    }

    /// Rebuild every sector stored on child `c` from the rest of its rows.
    fn reconstruct(&mut self, c: usize) {
        if self.columns[c].count == 0 {
            return;
        }
        self.columns[c].data = Some(
            vec![0u8; self.columns[c].count * BYTES_PER_LBA]);
        for r in 0..self.rows() {
            let (begin, end) = self.row(r);
            let Some(target) = (begin..end).find(|k| self.locate(*k).0 == c)
            else {
                continue;
            };
            let mut acc = vec![0u8; BYTES_PER_LBA];
            for k in (begin..end).filter(|k| *k != target) {
                xor_into(&mut acc, self.sector(k));
            }
            self.sector_mut(target).copy_from_slice(&acc);
        }
    }
}

fn xor_into(acc: &mut [u8], src: &[u8]) {
    for (a, s) in acc.iter_mut().zip(src.iter()) {
        *a ^= *s;
    }
}

/// `Raidz`: single-parity RAID
pub struct Raidz {
    children: Box<[Child]>,

    /// Usable size, fixed at creation time
    size: LbaT,

    uuid: Uuid,
}

impl Raidz {
    /// How many LBAs must be allocated to store `lbas` LBAs of data?
    pub fn asize(&self, lbas: LbaT) -> LbaT {
        let n = self.children.len() as LbaT;
        lbas + lbas.div_ceil(n - 1)
    }

    /// Create a new Raidz from blank leaves
    pub fn create(leaves: Vec<Arc<dyn Leaf>>) -> Result<Self> {
        if leaves.len() < 2 || leaves.len() > u8::MAX as usize {
            return Err(Error::ConfigInvalid(
                format!("raidz needs 2 to 255 leaves, not {}", leaves.len())));
        }
        let child_size = leaves.iter()
            .map(|l| l.size().saturating_sub(LEAF_RESERVED_LBAS))
            .min()
            .unwrap_or(0);
        let size = child_size * leaves.len() as LbaT;
        let children = leaves.into_iter()
            .map(Child::present)
            .collect::<Vec<_>>();
        Ok(Raidz {
            children: children.into_boxed_slice(),
            size,
            uuid: Uuid::new_v4()
        })
    }

    pub fn label(&self) -> VdevLabel {
        VdevLabel {
            uuid: self.uuid,
            kind: VdevKind::Raidz,
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

    /// Open an existing `Raidz`.  At most one child may be missing.
    pub fn open(label: &VdevLabel, leaves: &mut BTreeMap<Uuid, Arc<dyn Leaf>>)
        -> Result<Self>
    {
        let children = label.children.iter()
            .map(|uuid| match leaves.remove(uuid) {
                Some(leaf) => Child::present(leaf),
                None => Child::missing(*uuid)
            }).collect::<Vec<_>>();
        let missing = children.iter()
            .filter(|c| matches!(c, Child::Missing(_)))
            .count();
        if missing > 1 {
            return Err(Error::PoolNotFound(
                format!("{missing} children of raidz {} are missing",
                        label.uuid)));
        }
        Ok(Raidz {
            children: children.into_boxed_slice(),
            size: label.size,
            uuid: label.uuid
        })
    }

    /// Read a block, reconstructing it from parity if necessary.
    pub async fn read(&self, dva: &Dva, verify: Verify<'_>) -> Result<IoVec> {
        let mut stripe = Stripe::new(self.children.len(), dva.lba, dva.asize);
        let results = stripe.columns.iter()
            .enumerate()
            .filter(|(_, col)| col.count > 0)
            .map(|(c, col)| {
                let fut = self.children[c].usable().map(|leaf| {
                    let (dbs, buf) = zeroed(col.count * BYTES_PER_LBA);
                    (dbs, leaf.read_at(buf, col.lba + LEAF_RESERVED_LBAS))
                });
                async move {
                    match fut {
                        Some((dbs, fut)) => {
                            let r = fut.await;
                            (c, r.map(|_| frozen(&dbs)[..].to_vec()))
                        },
                        None => (c, Err(Error::DeviceIo(
                                    io::ErrorKind::NotConnected)))
                    }
                }
            }).collect::<FuturesUnordered<_>>()
            .collect::<Vec<_>>()
            .await;
        let mut failed = Vec::new();
        for (c, r) in results.into_iter() {
            match r {
                Ok(data) => stripe.columns[c].data = Some(data),
                Err(e) => {
                    debug!(vdev = %self.uuid, child = c, %dva,
                        "read error {:?}", e);
                    failed.push(c);
                }
            }
        }

        match failed.len() {
            0 => {
                let data = stripe.assemble();
                if verify(&data[..]) {
                    return Ok(into_iovec(data));
                }
                for c in 0..self.children.len() {
                    if stripe.columns[c].count == 0 {
                        continue;
                    }
                    let saved = stripe.columns[c].data.take();
                    stripe.reconstruct(c);
                    let data = stripe.assemble();
                    if verify(&data[..]) {
                        self.heal(&stripe, c, dva).await;
                        return Ok(into_iovec(data));
                    }
                    stripe.columns[c].data = saved;
                }
                Err(Error::ChecksumMismatch(*dva))
            },
            1 => {
                stripe.reconstruct(failed[0]);
                let data = stripe.assemble();
                if verify(&data[..]) {
                    Ok(into_iovec(data))
                } else {
                    Err(Error::ChecksumMismatch(*dva))
                }
            },
            _ => Err(Error::UnrecoverableIo(*dva))
        }
    }

    /// Rewrite a reconstructed column
    async fn heal(&self, stripe: &Stripe, c: usize, dva: &Dva) {
        let col = &stripe.columns[c];
        let (Some(leaf), Some(data)) = (self.children[c].usable(), &col.data)
        else {
            return;
        };
        warn!(leaf = %leaf.uuid(), %dva, "self-healing raidz column");
        let dbs = divbuf::DivBufShared::from(data.clone());
        let r = leaf.write_at(frozen(&dbs), col.lba + LEAF_RESERVED_LBAS).await;
        if r.is_err() {
            self.children[c].fault();
        }
    }

    pub fn size(&self) -> LbaT {
        self.size
    }

    pub fn status(&self) -> VdevStatus {
        let leaves = self.children.iter()
            .map(Child::status)
            .collect::<Vec<_>>();
        let health = summarize_health(&leaves, 1);
        VdevStatus {
            uuid: self.uuid,
            kind: VdevKind::Raidz,
            health,
            leaves
        }
    }

    /// Sync every healthy child.  At most one may fail.
    pub async fn sync_all(&self) -> Result<()> {
        let results = self.children.iter()
            .enumerate()
            .map(|(i, c)| {
                let fut = c.usable().map(|l| l.sync_all());
                async move {
                    match fut {
                        Some(fut) => (i, fut.await),
                        None => (i, Err(Error::DeviceIo(
                                    io::ErrorKind::NotConnected)))
                    }
                }
            }).collect::<FuturesUnordered<_>>()
            .collect::<Vec<_>>()
            .await;
        self.tally(results)
    }

    /// Fault every child that failed.  Succeed if no more than one did.
    fn tally(&self, results: Vec<(usize, Result<()>)>) -> Result<()> {
        let mut failures = 0;
        let mut err = None;
        for (idx, result) in results.into_iter() {
            if let Err(e) = result {
                self.children[idx].fault();
                failures += 1;
                err = Some(e);
            }
        }
        match err {
            Some(e) if failures > 1 => Err(e),
            _ => Ok(())
        }
    }

    /// Write a block, computing parity.
    ///
    /// `buf` holds the data only.  `dva.asize` must equal
    /// `self.asize(buf.len() / BYTES_PER_LBA)`.
    pub async fn write(&self, dva: &Dva, buf: IoVec) -> Result<()> {
        let n = self.children.len();
        debug_assert_eq!(self.asize((buf.len() / BYTES_PER_LBA) as LbaT),
                         dva.asize);
        let mut stripe = Stripe::new(n, dva.lba, dva.asize);
        for col in stripe.columns.iter_mut() {
            col.data = Some(vec![0u8; col.count * BYTES_PER_LBA]);
        }
        let mut data = buf.chunks(BYTES_PER_LBA);
        for r in 0..stripe.rows() {
            let (begin, end) = stripe.row(r);
            let mut parity = vec![0u8; BYTES_PER_LBA];
            for k in begin + 1..end {
                let src = data.next().expect("buffer shorter than stripe");
                xor_into(&mut parity, src);
                stripe.sector_mut(k).copy_from_slice(src);
            }
            stripe.sector_mut(begin).copy_from_slice(&parity);
        }

        let results = stripe.columns.into_iter()
            .enumerate()
            .filter(|(_, col)| col.count > 0)
            .map(|(c, col)| {
                let dbs = divbuf::DivBufShared::from(
                    col.data.unwrap_or_default());
                let fut = self.children[c].usable().map(|leaf| {
                    leaf.write_at(frozen(&dbs), col.lba + LEAF_RESERVED_LBAS)
                });
                async move {
                    match fut {
                        Some(fut) => (c, fut.await),
                        None => (c, Err(Error::DeviceIo(
                                    io::ErrorKind::NotConnected)))
                    }
                }
            }).collect::<FuturesUnordered<_>>()
            .collect::<Vec<_>>()
            .await;
        self.tally(results)
    }
}

fn into_iovec(v: Vec<u8>) -> IoVec {
    frozen(&divbuf::DivBufShared::from(v))
}

// LCOV_EXCL_STOP
