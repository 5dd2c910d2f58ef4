// vim: tw=80
//! The buffer layer
//!
//! A `Dbuf` is the in-memory shadow of one block of one object.  It tracks the
//! block's committed payload and block pointer, plus one dirty record for
//! every txg that has modified the block but not yet synced.  Payloads are
//! reference-counted and never modified once another reference exists, so a
//! reader that captured one keeps seeing it no matter what happens later.

use crate::{
    dmu::Dnode,
    types::*,
    util::*,
    zio::{BlockPtr, Zio},
};
use divbuf::DivBufShared;
use std::{
    collections::BTreeMap,
    fmt,
    pin::pin,
    sync::{Arc, Mutex, Weak}
};
use tokio::sync::Notify;
use tracing::trace;
use tracing_futures::Instrument;

/// The contents of one block, as seen by the buffer layer
#[derive(Clone)]
pub enum BlockData {
    /// All zeros.  Never allocated on disk.
    Hole,
    /// A data block, exactly one record long
    Data(Arc<DivBufShared>),
    /// An indirect block's child pointers
    Indirect(Arc<Vec<Option<BlockPtr>>>),
}

impl BlockData {
    /// Copy `len` bytes starting at `offset` into `dst`.  Holes read as zero.
    pub fn copy_to(&self, offset: usize, dst: &mut [u8]) {
        match self {
            BlockData::Data(dbs) => {
                let buf = frozen(dbs);
                let end = (offset + dst.len()).min(buf.len());
                let n = end.saturating_sub(offset);
                dst[..n].copy_from_slice(&buf[offset..end]);
                dst[n..].fill(0);
            },
            _ => dst.fill(0)
        }
    }

    pub fn is_hole(&self) -> bool {
        matches!(self, BlockData::Hole)
    }
}

impl fmt::Debug for BlockData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockData::Hole => write!(f, "Hole"),
            BlockData::Data(dbs) => write!(f, "Data({} bytes)", dbs.len()),
            BlockData::Indirect(v) =>
                write!(f, "Indirect({} children)", v.iter().flatten().count()),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DbufState {
    /// No payload in memory
    Uncached,
    /// A physical read is in progress
    Read,
    /// One holder is about to overwrite the entire block
    Fill,
    /// The newest payload is in memory
    Cached,
    /// Unheld and clean.  Will be dropped unless somebody holds it first.
    Evicting,
}

/// How the caller intends to use a held buffer
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HoldMode {
    /// The caller needs the current contents
    Read,
    /// The caller will overwrite the whole block, so don't bother reading it
    Fill,
}

struct DbufInner {
    state: DbufState,
    /// Block pointer as of the last synced txg.  `None` is a hole.
    bp: Option<BlockPtr>,
    /// Payload matching `bp`, if it has been read.
    committed: Option<BlockData>,
    dirty: BTreeMap<TxgT, BlockData>,
    holds: u32,
    /// Bumped by every read attempt and every install, so a stale read can
    /// tell that it's stale.
    gen: u64,
    /// The error of the read attempt with the given generation
    error: Option<(u64, Error)>,
}

impl DbufInner {
    /// The newest payload: the last dirty record, or else the committed one
    fn newest(&self) -> Option<&BlockData> {
        self.dirty.values().next_back().or(self.committed.as_ref())
    }
}

/// One block of one object
pub struct Dbuf {
    level: u8,
    blkid: u64,
    /// Record size of the owning object.  Only meaningful at level 0.
    block_size: usize,
    inner: Mutex<DbufInner>,
    notify: Notify,
}

impl Dbuf {
    pub fn blkid(&self) -> u64 {
        self.blkid
    }

    /// Committed block pointer
    pub fn bp(&self) -> Option<BlockPtr> {
        self.inner.lock().unwrap().bp
    }

    /// The payload that `txg` dirtied, if any
    pub fn dirty_record(&self, txg: TxgT) -> Option<BlockData> {
        self.inner.lock().unwrap().dirty.get(&txg).cloned()
    }

    /// Acquire a hold, reading the block from disk if necessary.
    ///
    /// The physical read runs in its own task, so it completes and wakes the
    /// other waiters even if this future gets dropped.
    pub async fn hold(self: &Arc<Self>, zio: &Zio, mode: HoldMode)
        -> Result<DbufHold>
    {
        let mut waited = None;
        loop {
            let mut notified = pin!(self.notify.notified());
            notified.as_mut().enable();
            {
                let mut g = self.inner.lock().unwrap();
                match g.state {
                    DbufState::Cached => {
                        g.holds += 1;
                        return Ok(self.new_hold());
                    },
                    DbufState::Evicting => {
                        trace!(level = self.level, blkid = self.blkid,
                               "hold cancels eviction");
                        g.state = DbufState::Cached;
                        g.holds += 1;
                        return Ok(self.new_hold());
                    },
                    DbufState::Uncached => {
                        if let Some((egen, e)) = &g.error {
                            if waited == Some(*egen) {
                                return Err(e.clone());
                            }
                        }
                        g.error = None;
                        if mode == HoldMode::Fill {
                            g.state = DbufState::Fill;
                            g.holds += 1;
                            return Ok(self.new_hold());
                        }
                        let Some(bp) = g.bp else {
                            g.committed = Some(BlockData::Hole);
                            g.state = DbufState::Cached;
                            g.holds += 1;
                            return Ok(self.new_hold());
                        };
                        g.gen += 1;
                        g.state = DbufState::Read;
                        waited = Some(g.gen);
                        self.spawn_read(zio, bp, g.gen);
                    },
                    DbufState::Read | DbufState::Fill => {
                        waited = Some(g.gen);
                    }
                }
            }
            notified.await;
        }
    }

    pub fn holds(&self) -> u32 {
        self.inner.lock().unwrap().holds
    }

    /// Replace the committed state after `txg` is durable.
    ///
    /// `data` is the payload that was written as `bp`.  The dirty record for
    /// `txg`, if any, is retired.
    pub fn install(&self, txg: TxgT, bp: Option<BlockPtr>, data: BlockData) {
        let mut g = self.inner.lock().unwrap();
        g.dirty.remove(&txg);
        g.bp = bp;
        g.committed = Some(data);
        g.gen += 1;
        g.error = None;
        let wake = matches!(g.state, DbufState::Read | DbufState::Uncached);
        if g.state != DbufState::Fill {
            g.state = if g.holds == 0 && g.dirty.is_empty() {
                DbufState::Evicting
            } else {
                DbufState::Cached
            };
        }
        drop(g);
        if wake {
            self.notify.notify_waiters();
        }
    }

    /// Can this buffer be dropped right now?
    pub fn is_evictable(&self) -> bool {
        let g = self.inner.lock().unwrap();
        g.state == DbufState::Evicting && g.holds == 0 && g.dirty.is_empty()
    }

    pub fn is_dirty(&self) -> bool {
        !self.inner.lock().unwrap().dirty.is_empty()
    }

    pub fn level(&self) -> u8 {
        self.level
    }

    pub fn new(level: u8, blkid: u64, block_size: usize, bp: Option<BlockPtr>)
        -> Self
    {
        let inner = DbufInner {
            state: DbufState::Uncached,
            bp,
            committed: None,
            dirty: BTreeMap::new(),
            holds: 0,
            gen: 0,
            error: None
        };
        Dbuf {
            level,
            blkid,
            block_size,
            inner: Mutex::new(inner),
            notify: Notify::new()
        }
    }

    fn new_hold(self: &Arc<Self>) -> DbufHold {
        DbufHold{dbuf: self.clone(), owner: Weak::new()}
    }

    /// Drop one hold.  Returns true if the buffer became evictable.
    fn release(&self) -> bool {
        let mut g = self.inner.lock().unwrap();
        debug_assert!(g.holds > 0);
        g.holds -= 1;
        if g.holds > 0 {
            return false;
        }
        match g.state {
            DbufState::Fill => {
                // The filler gave up without filling
                g.state = DbufState::Uncached;
                drop(g);
                self.notify.notify_waiters();
                false
            },
            DbufState::Cached if g.dirty.is_empty() => {
                g.state = DbufState::Evicting;
                true
            },
            _ => false
        }
    }

    fn spawn_read(self: &Arc<Self>, zio: &Zio, bp: BlockPtr, gen: u64) {
        let dbuf = self.clone();
        let zio = zio.clone();
        let span = tracing::debug_span!("dbuf_read", level = self.level,
                                        blkid = self.blkid);
        tokio::spawn(async move {
            let r = zio.read_block(&bp).await.and_then(|dbs| {
                if dbuf.level == 0 {
                    Ok(BlockData::Data(dbs))
                } else {
                    let children: Vec<Option<BlockPtr>> =
                        bincode::deserialize(&frozen(&dbs)[..])?;
                    Ok(BlockData::Indirect(Arc::new(children)))
                }
            });
            let mut g = dbuf.inner.lock().unwrap();
            if g.gen == gen && g.state == DbufState::Read {
                match r {
                    Ok(data) => {
                        g.committed = Some(data);
                        g.state = DbufState::Cached;
                    },
                    Err(e) => {
                        g.state = DbufState::Uncached;
                        g.error = Some((gen, e));
                    }
                }
            }
            drop(g);
            dbuf.notify.notify_waiters();
        }.instrument(span));
    }

    pub fn state(&self) -> DbufState {
        self.inner.lock().unwrap().state
    }
}

impl fmt::Debug for Dbuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let g = self.inner.lock().unwrap();
        f.debug_struct("Dbuf")
            .field("level", &self.level)
            .field("blkid", &self.blkid)
            .field("state", &g.state)
            .field("holds", &g.holds)
            .field("dirty", &g.dirty.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// A hold on a [`Dbuf`].  Released on drop.
pub struct DbufHold {
    dbuf: Arc<Dbuf>,
    /// The dnode whose table holds `dbuf`, told when the buffer goes idle
    owner: Weak<Dnode>,
}

impl DbufHold {
    pub(crate) fn set_owner(&mut self, owner: &Arc<Dnode>) {
        self.owner = Arc::downgrade(owner);
    }

    pub fn dbuf(&self) -> &Arc<Dbuf> {
        &self.dbuf
    }

    /// Child pointers of a held indirect block.  A hole has no children.
    pub fn indirect(&self) -> Arc<Vec<Option<BlockPtr>>> {
        let g = self.dbuf.inner.lock().unwrap();
        match g.newest() {
            Some(BlockData::Indirect(v)) => v.clone(),
            _ => Arc::new(vec![None; crate::dmu::INDIRECT_FANOUT])
        }
    }

    /// The newest payload.  A buffer held for filling that hasn't been
    /// filled yet reads as a hole.
    pub fn payload(&self) -> BlockData {
        let g = self.dbuf.inner.lock().unwrap();
        g.newest().cloned().unwrap_or(BlockData::Hole)
    }

    /// Replace the block with a hole in `txg`
    pub fn punch(&self, txg: TxgT) {
        let mut g = self.dbuf.inner.lock().unwrap();
        g.dirty.insert(txg, BlockData::Hole);
        self.filled(g);
    }

    /// Patch `bytes` into the block at `offset`, in `txg`.
    ///
    /// The first change in a txg copies the newest payload.  Later changes in
    /// the same txg patch the txg's record in place, unless a reader has
    /// captured it.  The committed block pointer is never touched.
    pub fn write(&self, txg: TxgT, offset: usize, bytes: &[u8]) {
        let bs = self.dbuf.block_size;
        assert!(offset + bytes.len() <= bs, "write past end of block");
        let mut g = self.dbuf.inner.lock().unwrap();
        if let Some(BlockData::Data(arc)) = g.dirty.get_mut(&txg) {
            if let Some(dbs) = Arc::get_mut(arc) {
                if let Ok(mut dbm) = dbs.try_mut() {
                    dbm[offset..offset + bytes.len()].copy_from_slice(bytes);
                    return;
                }
            }
        }
        let mut v = match g.newest() {
            Some(BlockData::Data(dbs)) => frozen(dbs)[..].to_vec(),
            _ => Vec::new()
        };
        v.resize(bs, 0);
        v[offset..offset + bytes.len()].copy_from_slice(bytes);
        g.dirty.insert(txg, BlockData::Data(Arc::new(DivBufShared::from(v))));
        self.filled(g);
    }

    fn filled(&self, mut g: std::sync::MutexGuard<'_, DbufInner>) {
        if g.state == DbufState::Fill {
            g.state = DbufState::Cached;
            drop(g);
            self.dbuf.notify.notify_waiters();
        }
    }
}

impl Drop for DbufHold {
    fn drop(&mut self) {
        if self.dbuf.release() {
            if let Some(dnode) = self.owner.upgrade() {
                dnode.evict(&self.dbuf);
            }
        }
    }
}

// LCOV_EXCL_STOP
