// vim: tw=80
//! The storage pool: a set of top-level vdevs with their space maps
//!
//! The first two space map slots of every top-level vdev are reserved.  Each
//! slot is large enough to hold a serialized copy of the vdev's space map.

use crate::{
    cache::CacheStats,
    label::*,
    spacemap::SpaceMap,
    types::*,
    util::*,
    vdev::*,
    vdev_file,
    zio::BlockPtr,
};
use futures::{
    Future,
    StreamExt,
    TryStreamExt,
    stream::FuturesUnordered,
    task::{Context, Poll}
};
use pin_project::pin_project;
use serde_derive::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashMap},
    pin::Pin,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
        Mutex
    }
};
use tracing::{debug, warn};

/// The pool's section of every label
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
pub struct Label {
    /// Human-readable name
    pub name:               String,

    /// Pool UUID, fixed at format time
    pub uuid:               Uuid,

    /// `UUID`s of all top-level vdevs, in order
    pub children:           Vec<Uuid>,
}

/// The root of all on-disk state, as of the end of one txg
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq, Serialize)]
pub struct Uberblock {
    pub txg: TxgT,
    /// The meta object set, which stores the dataset graph
    pub mos: Option<BlockPtr>,
    /// Seconds since the epoch
    pub timestamp: u64,
}

/// Return value of [`Pool::status`]
#[derive(Clone, Debug)]
pub struct PoolStatus {
    pub name: String,
    pub uuid: Uuid,
    /// The sickest of the vdevs' health
    pub health: Health,
    /// Total allocatable space, in bytes
    pub size: u64,
    /// Allocated space, in bytes, including space maps
    pub allocated: u64,
    /// Most recently synced txg
    pub txg: TxgT,
    pub vdevs: Vec<VdevStatus>,
    pub cache: CacheStats,
}

/// Everything needed to reassemble a pool, as read from one leaf
struct Tasted {
    leaf: Arc<dyn Leaf>,
    vdev: VdevLabel,
    pool: Label,
    uberblock: Uberblock,
}

/// Read the newest intact label from one leaf
async fn taste(leaf: Arc<dyn Leaf>) -> Result<Tasted> {
    let mut best: Result<Tasted> = Err(Error::Integrity(
            format!("no label on leaf {}", leaf.uuid())));
    for slot in 0..LABEL_COUNT as u32 {
        let (dbs, buf) = zeroed(LABEL_SIZE);
        if let Err(e) = leaf.read_at(buf, LabelReader::lba(slot)).await {
            debug!(leaf = %leaf.uuid(), slot, "label read error {:?}", e);
            continue;
        }
        let parsed = LabelReader::new(frozen(&dbs)[..].to_vec())
            .and_then(|mut lr| {
                let ll: vdev_file::Label = lr.deserialize()?;
                let vdev: VdevLabel = lr.deserialize()?;
                let pool: Label = lr.deserialize()?;
                let uberblock: Uberblock = lr.deserialize()?;
                Ok((ll, vdev, pool, uberblock))
            });
        match parsed {
            Ok((ll, vdev, pool, uberblock)) => {
                if ll.uuid != leaf.uuid() {
                    warn!(leaf = %leaf.uuid(), "label belongs to another leaf");
                    continue;
                }
                let newer = match &best {
                    Ok(t) => uberblock.txg > t.uberblock.txg,
                    Err(_) => true
                };
                if newer {
                    best = Ok(Tasted{leaf: leaf.clone(), vdev, pool,
                                     uberblock});
                }
            },
            Err(e) => {
                debug!(leaf = %leaf.uuid(), slot, "bad label: {}", e);
            }
        }
    }
    best
}

/// A cowpool storage pool
pub struct Pool {
    /// Human-readable pool name.  Must be unique on any one system.
    name: String,

    /// In-flight writes for each top-level vdev
    queue_depth: Vec<AtomicU32>,

    spacemaps: Vec<Mutex<SpaceMap>>,

    uuid: Uuid,

    vdevs: Vec<TopVdev>,
}

impl Pool {
    /// Allocate space for `lbas` LBAs of data.
    ///
    /// The vdev with the most free space is preferred, except that vdevs in
    /// `avoid` are used only when nothing else has room.
    pub fn alloc(&self, lbas: LbaT, avoid: &[VdevT]) -> Result<Dva> {
        let mut order = (0..self.vdevs.len())
            .map(|i| {
                let free = self.spacemaps[i].lock().unwrap().free_lbas();
                let qd = self.queue_depth[i].load(Ordering::Relaxed);
                (avoid.contains(&(i as VdevT)), std::cmp::Reverse(free), qd, i)
            }).collect::<Vec<_>>();
        order.sort();
        for (_, _, _, i) in order.into_iter() {
            let asize = self.vdevs[i].asize(lbas);
            if let Some(lba) = self.spacemaps[i].lock().unwrap().alloc(asize) {
                return Ok(Dva::new(i as VdevT, lba, asize));
            }
        }
        Err(Error::OutOfSpace)
    }

    /// Allocated space, in LBAs, including space map slots
    pub fn allocated(&self) -> LbaT {
        self.spacemaps.iter()
            .map(|sm| sm.lock().unwrap().allocated())
            .sum()
    }

    /// Return deferred frees to the allocator, once the txg that freed them
    /// is durable.
    pub fn apply_frees(&self, frees: &[Dva]) {
        for dva in frees.iter() {
            self.release(dva);
        }
    }

    /// Create a brand new pool from freshly created vdevs
    pub fn create(name: String, vdevs: Vec<TopVdev>) -> Result<Self> {
        if vdevs.is_empty() {
            return Err(Error::ConfigInvalid(
                "a pool needs at least one vdev".to_string()));
        }
        if vdevs.len() > VdevT::MAX as usize {
            return Err(Error::ConfigInvalid("too many vdevs".to_string()));
        }
        let mut spacemaps = Vec::with_capacity(vdevs.len());
        for vdev in vdevs.iter() {
            let reserved = 2 * Pool::slot_asize(vdev);
            if reserved >= vdev.size() {
                return Err(Error::ConfigInvalid(
                    format!("vdev {} is too small", vdev.uuid())));
            }
            spacemaps.push(Mutex::new(SpaceMap::new(vdev.size(), reserved)));
        }
        Ok(Pool::new(name, Uuid::new_v4(), vdevs, spacemaps))
    }

    /// Erase the labels of every leaf, so the pool can't be imported again.
    pub async fn destroy(&self) -> Result<()> {
        let leaves = self.vdevs.iter()
            .flat_map(TopVdev::leaves)
            .collect::<Vec<_>>();
        let dbs = divbuf::DivBufShared::from(vec![0u8; LABEL_SIZE]);
        let blank = frozen(&dbs);
        leaves.iter()
            .flat_map(|leaf| (0..LABEL_COUNT as u32)
                .map(move |slot| (leaf.clone(), slot)))
            .map(|(leaf, slot)| {
                leaf.write_at(blank.clone(), LabelReader::lba(slot))
            }).collect::<FuturesUnordered<_>>()
            .try_collect::<Vec<_>>()
            .await?;
        leaves.iter()
            .map(|leaf| leaf.sync_all())
            .collect::<FuturesUnordered<_>>()
            .try_collect::<Vec<_>>()
            .await
            .map(drop)
    }

    /// Free space, in LBAs
    pub fn free_lbas(&self) -> LbaT {
        self.spacemaps.iter()
            .map(|sm| sm.lock().unwrap().free_lbas())
            .sum()
    }

    pub fn label(&self) -> Label {
        Label {
            name: self.name.clone(),
            uuid: self.uuid,
            children: self.vdevs.iter().map(TopVdev::uuid).collect()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn new(name: String, uuid: Uuid, vdevs: Vec<TopVdev>,
           spacemaps: Vec<Mutex<SpaceMap>>) -> Self
    {
        let queue_depth = vdevs.iter().map(|_| AtomicU32::new(0)).collect();
        Pool{name, queue_depth, spacemaps, uuid, vdevs}
    }

    /// Import an existing pool from its leaves.
    ///
    /// Leaves that don't belong to the pool named `name` are ignored.  The
    /// newest uberblock found on any leaf wins.  Returns the pool, plus that
    /// uberblock.
    pub async fn open(name: &str, leaves: Vec<Arc<dyn Leaf>>)
        -> Result<(Self, Uberblock)>
    {
        let tasted = leaves.into_iter()
            .map(taste)
            .collect::<FuturesUnordered<_>>()
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .filter_map(Result::ok)
            .filter(|t| t.pool.name == name)
            .collect::<Vec<_>>();
        let newest = tasted.iter()
            .max_by_key(|t| t.uberblock.txg)
            .ok_or_else(|| Error::PoolNotFound(name.to_string()))?;
        let uberblock = newest.uberblock;
        let plabel = newest.pool.clone();
        let mut vlabels = HashMap::new();
        let mut byuuid = BTreeMap::new();
        for t in tasted.into_iter() {
            if t.pool.uuid != plabel.uuid {
                warn!(pool = %name, "ignoring leaf from a different pool");
                continue;
            }
            vlabels.insert(t.vdev.uuid, t.vdev);
            byuuid.insert(t.leaf.uuid(), t.leaf);
        }
        let mut vdevs = Vec::with_capacity(plabel.children.len());
        for uuid in plabel.children.iter() {
            let vl = vlabels.get(uuid)
                .ok_or_else(|| Error::PoolNotFound(
                    format!("{name}: vdev {uuid} is missing")))?;
            vdevs.push(TopVdev::open(vl, &mut byuuid)?);
        }
        let slot = uberblock.txg.label_slot() as LbaT;
        let mut spacemaps = Vec::with_capacity(vdevs.len());
        for (i, vdev) in vdevs.iter().enumerate() {
            let asize = Pool::slot_asize(vdev);
            let dva = Dva::new(i as VdevT, slot * asize, asize);
            let buf = vdev.read(&dva, &SpaceMap::verify).await?;
            let sm = SpaceMap::deserialize(&buf[..], uberblock.txg)?;
            spacemaps.push(Mutex::new(sm));
        }
        debug!(pool = %name, txg = %uberblock.txg, "imported");
        let pool = Pool::new(plabel.name, plabel.uuid, vdevs, spacemaps);
        Ok((pool, uberblock))
    }

    /// Read one copy of a block
    pub async fn read(&self, dva: &Dva, verify: Verify<'_>) -> Result<IoVec> {
        let vdev = self.vdevs.get(dva.vdev as usize)
            .ok_or(Error::UnrecoverableIo(*dva))?;
        vdev.read(dva, verify).await
    }

    /// Immediately return space to the allocator.
    ///
    /// Only for space that was never referenced by a published txg.
    pub fn release(&self, dva: &Dva) {
        if let Some(sm) = self.spacemaps.get(dva.vdev as usize) {
            sm.lock().unwrap().free(dva.lba, dva.asize);
        }
    }

    /// Total allocatable space, in LBAs
    pub fn size(&self) -> LbaT {
        self.vdevs.iter().map(TopVdev::size).sum()
    }

    /// LBAs occupied by one space map slot on `vdev`
    fn slot_asize(vdev: &TopVdev) -> LbaT {
        vdev.asize(SpaceMap::slot_lbas(vdev.size()))
    }

    pub fn status(&self, txg: TxgT, cache: CacheStats) -> PoolStatus {
        let vdevs = self.vdevs.iter()
            .map(TopVdev::status)
            .collect::<Vec<_>>();
        let health = vdevs.iter()
            .map(|v| v.health)
            .max()
            .unwrap_or(Health::Online);
        PoolStatus {
            name: self.name.clone(),
            uuid: self.uuid,
            health,
            size: self.size() * BYTES_PER_LBA as u64,
            allocated: self.allocated() * BYTES_PER_LBA as u64,
            txg,
            vdevs,
            cache
        }
    }

    /// Sync the `Pool`, ensuring that all data written so far reaches stable
    /// storage.
    pub async fn sync_all(&self) -> Result<()> {
        self.vdevs.iter()
            .map(TopVdev::sync_all)
            .collect::<FuturesUnordered<_>>()
            .try_collect::<Vec<()>>()
            .await
            .map(drop)
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Write a buffer, which must be a whole number of LBAs, to `dva`
    pub fn write(&self, dva: &Dva, buf: IoVec)
        -> impl Future<Output=Result<()>> + Send + '_
    {
        let idx = dva.vdev as usize;
        let dva = *dva;
        self.queue_depth[idx].fetch_add(1, Ordering::Relaxed);
        Write {
            fut: Box::pin(async move {
                self.vdevs[idx].write(&dva, buf).await
            }),
            qd: &self.queue_depth[idx]
        }
    }

    /// Publish `uberblock` by writing it into the `txg % 2` label slot of
    /// every leaf.
    ///
    /// Succeeds if at least one leaf durably holds the new label.
    #[tracing::instrument(skip(self, uberblock))]
    pub async fn write_labels(&self, uberblock: &Uberblock) -> Result<()> {
        let slot = uberblock.txg.label_slot();
        let plabel = self.label();
        let mut futs = FuturesUnordered::new();
        for vdev in self.vdevs.iter() {
            let vlabel = vdev.label();
            for leaf in vdev.leaves().into_iter() {
                let mut lw = LabelWriter::new(slot);
                lw.serialize(uberblock)?;
                lw.serialize(&plabel)?;
                lw.serialize(&vlabel)?;
                lw.serialize(&vdev_file::Label {
                    uuid: leaf.uuid(),
                    lbas: leaf.size()
                })?;
                let lba = lw.lba();
                let buf = lw.into_buffer()?;
                futs.push(async move {
                    leaf.write_at(buf, lba).await?;
                    leaf.sync_all().await
                });
            }
        }
        let mut r = Err(Error::DeviceIo(std::io::ErrorKind::NotFound));
        while let Some(result) = futs.next().await {
            match result {
                Ok(()) => r = Ok(()),
                Err(e) => {
                    warn!(txg = %uberblock.txg, "label write failed: {}", e);
                    if r.is_err() {
                        r = Err(e);
                    }
                }
            }
        }
        r
    }

    /// Write every vdev's space map into slot `txg % 2`.
    ///
    /// `frees` are blocks freed during `txg`.  They are recorded as free on
    /// disk, though they remain allocated in memory until `txg` is durable.
    pub async fn write_spacemaps(&self, txg: TxgT, frees: &[Dva])
        -> Result<()>
    {
        let slot = txg.label_slot() as LbaT;
        let mut futs = FuturesUnordered::new();
        for (i, vdev) in self.vdevs.iter().enumerate() {
            let vfrees = frees.iter()
                .filter(|dva| dva.vdev as usize == i)
                .map(|dva| (dva.lba, dva.asize))
                .collect::<Vec<_>>();
            let mut buf = self.spacemaps[i].lock().unwrap()
                .serialize(txg, &vfrees);
            let slot_lbas = SpaceMap::slot_lbas(vdev.size());
            buf.resize(slot_lbas as usize * BYTES_PER_LBA, 0);
            let asize = Pool::slot_asize(vdev);
            let dva = Dva::new(i as VdevT, slot * asize, asize);
            let dbs = divbuf::DivBufShared::from(buf);
            futs.push(async move {
                vdev.write(&dva, frozen(&dbs)).await
            });
        }
        futs.try_collect::<Vec<_>>().await.map(drop)
    }
}

/// Return value of [`Pool::write`]
#[pin_project]
struct Write<'a> {
    #[pin]
    fut: Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>,
    qd: &'a AtomicU32,
}

impl Future for Write<'_> {
    type Output = Result<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        let this = self.project();
        let r = futures::ready!(this.fut.poll(cx));
        this.qd.fetch_sub(1, Ordering::Relaxed);
        Poll::Ready(r)
    }
}

// LCOV_EXCL_STOP
