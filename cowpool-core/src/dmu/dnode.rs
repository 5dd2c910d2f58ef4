// vim: tw=80
//! One object: its dnode and its table of buffers

use crate::{
    dbuf::{BlockData, Dbuf, DbufHold, HoldMode},
    types::*,
    util::*,
    zio::{BlockPtr, BlockType, WriteProps, Zio},
};
use futures::{FutureExt, future::BoxFuture};
use serde_derive::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::{Arc, Mutex}
};
use tracing::trace;

use super::INDIRECT_FANOUT;

/// On-disk description of one object
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct DnodePhys {
    /// Size of every data block, in bytes
    pub block_size: u32,
    /// Height of the block tree.  With one level, `root` is the only data
    /// block.
    pub nlevels: u8,
    /// Logical size in bytes
    pub size: u64,
    pub root: Option<BlockPtr>,
}

impl DnodePhys {
    pub fn new(block_size: u32) -> Self {
        DnodePhys {
            block_size,
            nlevels: 1,
            size: 0,
            root: None
        }
    }
}

/// How many levels are needed to address `nblocks` data blocks?
pub(crate) fn levels_for(nblocks: u64) -> u8 {
    let mut levels = 1;
    let mut span = 1u64;
    while span < nblocks {
        span = span.saturating_mul(INDIRECT_FANOUT as u64);
        levels += 1;
    }
    levels
}

/// Changes made to a dnode in one txg
#[derive(Clone, Debug)]
struct DnodeDirty {
    size: u64,
    nlevels: u8,
    /// Dirty level-0 blocks
    blocks: BTreeSet<u64>,
}

/// The result of syncing one dnode, to be installed once its txg is durable
#[derive(Debug)]
pub struct DnodeSync {
    pub phys: DnodePhys,
    /// Blocks written by this sync
    pub born: Vec<BlockPtr>,
    /// Blocks superseded by this sync
    pub killed: Vec<BlockPtr>,
    installs: Vec<(u8, u64, Option<BlockPtr>, BlockData)>,
}

struct DnodeInner {
    /// As of the last synced txg
    committed: DnodePhys,
    dirty: BTreeMap<TxgT, DnodeDirty>,
    dbufs: HashMap<(u8, u64), Arc<Dbuf>>,
}

impl DnodeInner {
    /// Size and height including unsynced changes
    fn current(&self) -> (u64, u8) {
        match self.dirty.values().next_back() {
            Some(d) => (d.size, d.nlevels),
            None => (self.committed.size, self.committed.nlevels)
        }
    }

    fn record(&mut self, txg: TxgT) -> &mut DnodeDirty {
        let (size, nlevels) = self.current();
        self.dirty.entry(txg).or_insert_with(|| DnodeDirty {
            size,
            nlevels,
            blocks: BTreeSet::new()
        })
    }
}

pub struct Dnode {
    object: ObjectId,
    zio: Zio,
    inner: Mutex<DnodeInner>,
}

impl Dnode {
    pub fn block_size(&self) -> u32 {
        self.inner.lock().unwrap().committed.block_size
    }

    /// Forget `dbuf`, which just lost its last hold, unless somebody picked
    /// it up again in the meantime.
    pub(crate) fn evict(&self, dbuf: &Arc<Dbuf>) {
        let mut g = self.inner.lock().unwrap();
        let key = (dbuf.level(), dbuf.blkid());
        if g.dbufs.get(&key).is_some_and(|d| Arc::ptr_eq(d, dbuf)) &&
            dbuf.is_evictable()
        {
            g.dbufs.remove(&key);
        }
    }

    /// Drop every buffer that nobody needs
    pub fn evict_idle(&self) {
        let mut g = self.inner.lock().unwrap();
        let before = g.dbufs.len();
        g.dbufs.retain(|_, dbuf| !dbuf.is_evictable());
        trace!(object = self.object, evicted = before - g.dbufs.len(),
               "evict_idle");
    }

    /// Hold the buffer for block `blkid` at `level`, reading it if needed.
    pub fn hold(self: &Arc<Self>, level: u8, blkid: u64, mode: HoldMode)
        -> BoxFuture<'static, Result<DbufHold>>
    {
        let dnode = self.clone();
        async move {
            loop {
                let existing = dnode.inner.lock().unwrap()
                    .dbufs.get(&(level, blkid))
                    .cloned();
                let dbuf = match existing {
                    Some(dbuf) => dbuf,
                    None => {
                        let bp = dnode.resolve(level, blkid).await?;
                        dnode.insert_dbuf(level, blkid, bp)
                    }
                };
                let mut hold = dbuf.hold(&dnode.zio, mode).await?;
                hold.set_owner(&dnode);
                // Eviction may have raced with us.  Once held, it can't.
                let current = dnode.inner.lock().unwrap()
                    .dbufs.get(&(level, blkid))
                    .is_some_and(|d| Arc::ptr_eq(d, &dbuf));
                if current {
                    return Ok(hold);
                }
            }
        }.boxed()
    }

    /// Get the buffer for a block, creating it if it isn't in the table
    fn insert_dbuf(&self, level: u8, blkid: u64, bp: Option<BlockPtr>)
        -> Arc<Dbuf>
    {
        let mut g = self.inner.lock().unwrap();
        let bs = g.committed.block_size as usize;
        g.dbufs.entry((level, blkid))
            .or_insert_with(|| Arc::new(Dbuf::new(level, blkid, bs, bp)))
            .clone()
    }

    pub fn info(&self) -> super::ObjectInfo {
        let g = self.inner.lock().unwrap();
        let (size, nlevels) = g.current();
        super::ObjectInfo {
            size,
            block_size: g.committed.block_size,
            nlevels
        }
    }

    /// Retire the dirty state of `txg`, which is now durable
    pub fn install(&self, txg: TxgT, s: DnodeSync) {
        {
            let mut g = self.inner.lock().unwrap();
            g.committed = s.phys;
            g.dirty.remove(&txg);
        }
        for (level, blkid, bp, data) in s.installs.into_iter() {
            if let (Some(bp), BlockData::Data(dbs)) = (bp, &data) {
                self.zio.cache_insert(&bp, dbs.clone());
            }
            self.insert_dbuf(level, blkid, bp).install(txg, bp, data);
        }
    }

    pub fn is_dirty(&self, txg: TxgT) -> bool {
        self.inner.lock().unwrap().dirty.contains_key(&txg)
    }

    pub fn new(object: ObjectId, zio: Zio, phys: DnodePhys) -> Self {
        let inner = DnodeInner {
            committed: phys,
            dirty: BTreeMap::new(),
            dbufs: HashMap::new()
        };
        Dnode{object, zio, inner: Mutex::new(inner)}
    }

    /// Record that `txg` dirtied `blocks` and extended the object to at least
    /// `end` bytes.
    pub fn note_dirty<I>(&self, txg: TxgT, blocks: I, end: u64)
        where I: IntoIterator<Item=u64>
    {
        let mut g = self.inner.lock().unwrap();
        let rec = g.record(txg);
        for blkid in blocks {
            rec.blocks.insert(blkid);
            rec.nlevels = rec.nlevels.max(levels_for(blkid + 1));
        }
        rec.size = rec.size.max(end);
        let (size, nlevels) = (rec.size, rec.nlevels);
        // Later txgs may already have copied this txg's size
        for later in g.dirty.range_mut(txg + 1..).map(|(_, d)| d) {
            later.size = later.size.max(size);
            later.nlevels = later.nlevels.max(nlevels);
        }
    }

    pub fn object(&self) -> ObjectId {
        self.object
    }

    /// Find the committed block pointer of a block that isn't in memory
    async fn resolve(self: &Arc<Self>, level: u8, blkid: u64)
        -> Result<Option<BlockPtr>>
    {
        let (nlevels, root) = {
            let g = self.inner.lock().unwrap();
            (g.committed.nlevels, g.committed.root)
        };
        if level + 1 >= nlevels {
            // At or above the top of the committed tree
            if level + 1 == nlevels && blkid == 0 {
                return Ok(root);
            }
            return Ok(None);
        }
        let fanout = INDIRECT_FANOUT as u64;
        let parent = self.hold(level + 1, blkid / fanout, HoldMode::Read)
            .await?;
        Ok(parent.indirect()[(blkid % fanout) as usize])
    }

    /// Set the logical size in `txg`, as for a truncate
    pub fn set_size(&self, txg: TxgT, size: u64) {
        let mut g = self.inner.lock().unwrap();
        g.record(txg).size = size;
    }

    /// Write out everything that `txg` dirtied.
    ///
    /// Data blocks are written first, then each level of indirect blocks from
    /// the bottom up.  Nothing in memory changes until [`install`].  On
    /// error, every block written so far is released.
    ///
    /// [`install`]: Dnode::install
    pub async fn sync(self: &Arc<Self>, txg: TxgT, props: &WriteProps)
        -> Result<Option<DnodeSync>>
    {
        let (dirty, committed, dbufs) = {
            let g = self.inner.lock().unwrap();
            let Some(dirty) = g.dirty.get(&txg).cloned() else {
                return Ok(None);
            };
            let dbufs = dirty.blocks.iter()
                .map(|blkid| g.dbufs.get(&(0, *blkid)).cloned()
                    .ok_or_else(|| Error::Integrity(format!(
                        "object {} block {} is dirty but not in memory",
                        self.object, blkid))))
                .collect::<Result<Vec<_>>>()?;
            (dirty, g.committed.clone(), dbufs)
        };
        let mut out = DnodeSync {
            phys: committed.clone(),
            born: Vec::new(),
            killed: Vec::new(),
            installs: Vec::new()
        };
        match self.sync_blocks(txg, props, &dirty, &committed, dbufs, &mut out)
            .await
        {
            Ok(()) => Ok(Some(out)),
            Err(e) => {
                for bp in out.born.iter() {
                    for dva in bp.dvas() {
                        self.zio.pool().release(dva);
                    }
                }
                Err(e)
            }
        }
    }

    async fn sync_blocks(self: &Arc<Self>, txg: TxgT, props: &WriteProps,
                         dirty: &DnodeDirty, committed: &DnodePhys,
                         dbufs: Vec<Arc<Dbuf>>, out: &mut DnodeSync)
        -> Result<()>
    {
        let nlevels = committed.nlevels.max(dirty.nlevels);
        let mut changed = BTreeMap::new();
        for dbuf in dbufs.into_iter() {
            let data = dbuf.dirty_record(txg)
                .ok_or_else(|| Error::Integrity(format!(
                    "object {} block {} lost its dirty record", self.object,
                    dbuf.blkid())))?;
            let bp = match &data {
                BlockData::Data(dbs) => self.zio.write_block(&frozen(dbs)[..],
                    props, BlockType::Data, txg).await?,
                _ => None
            };
            if let Some(old) = dbuf.bp() {
                out.killed.push(old);
            }
            out.born.extend(bp);
            // An all-zero block is stored as a hole
            let data = if bp.is_some() { data } else { BlockData::Hole };
            out.installs.push((0, dbuf.blkid(), bp, data));
            changed.insert(dbuf.blkid(), bp);
        }

        let fanout = INDIRECT_FANOUT as u64;
        for level in 1..nlevels {
            if level == committed.nlevels {
                // The tree grew.  The old root becomes the first child of the
                // first new level, unless it was just rewritten.
                changed.entry(0).or_insert(committed.root);
            }
            if changed.is_empty() {
                break;
            }
            let mut parents = BTreeMap::<u64, Vec<(usize, Option<BlockPtr>)>>
                ::new();
            for (blkid, bp) in changed.iter() {
                parents.entry(blkid / fanout)
                    .or_default()
                    .push(((blkid % fanout) as usize, *bp));
            }
            let mut next = BTreeMap::new();
            for (pblkid, kids) in parents.into_iter() {
                let (mut children, old) = if level < committed.nlevels {
                    let h = self.hold(level, pblkid, HoldMode::Read).await?;
                    ((*h.indirect()).clone(), h.dbuf().bp())
                } else {
                    (vec![None; INDIRECT_FANOUT], None)
                };
                for (i, bp) in kids.into_iter() {
                    children[i] = bp;
                }
                let bp = if children.iter().all(Option::is_none) {
                    None
                } else {
                    let buf = bincode::serialize(&children)?;
                    self.zio.write_block(&buf, props, BlockType::Indirect, txg)
                        .await?
                };
                out.killed.extend(old);
                out.born.extend(bp);
                out.installs.push((level, pblkid, bp,
                                   BlockData::Indirect(Arc::new(children))));
                next.insert(pblkid, bp);
            }
            changed = next;
        }
        if let Some(bp) = changed.get(&0) {
            out.phys.root = *bp;
        }
        out.phys.nlevels = nlevels;
        out.phys.size = dirty.size;
        Ok(())
    }
}

// LCOV_EXCL_STOP
