// vim: tw=80

use crate::{
    cache::Cache,
    config::{TopologySpec, Tunables, VdevSpec},
    dmu::{
        ObjectInfo,
        Objset,
        ObjsetKind,
        ObjsetSync,
        RangeView,
        range_end,
        traverse
    },
    dsl::{DatasetStats, Graph, QuotaCheck},
    pool::{Pool, PoolStatus, Uberblock},
    property::{EffectiveProps, Property, PropertyName, PropertySource},
    txg::TxgEngine,
    types::*,
    util::*,
    vdev::{Leaf, TopVdev, VdevKind},
    vdev_file::VdevFile,
    volume::{Volume, check_geometry},
    zio::{BlockPtr, BlockType, WriteProps, Zio},
};
use futures::{
    FutureExt,
    SinkExt,
    StreamExt,
    channel::{mpsc, oneshot},
    select,
};
use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    path::Path,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
        Mutex,
        Weak
    },
};
use tokio::{
    task::JoinHandle,
    time::{Instant, sleep_until},
};
use tracing::{debug, error, info, warn};
use tracing_futures::Instrument;

use super::{AtomicPoolState, PoolState, SyncTask};

#[derive(Debug)]
enum SyncerMsg {
    /// Tell the Syncer that we manually synced, and it can reset its timer
    Kick,
    /// Tell the Syncer to shut down, and wait for it to do so
    Shutdown,
}

struct Syncer {
    jh: JoinHandle<()>,
    tx: mpsc::Sender<SyncerMsg>
}

impl Syncer {
    fn kick(&self) {
        // If the channel is full, the pending message resets the timer anyway
        let _ = self.tx.clone().try_send(SyncerMsg::Kick);
    }

    fn new(inner: Arc<Inner>) -> Self {
        let (tx, rx) = mpsc::channel(1);
        let jh = Syncer::run(inner, rx);
        Syncer{jh, tx}
    }

    // Start a task that will sync the database at a fixed interval, but will
    // reset the timer if it gets a message on a channel.
    fn run(inner: Arc<Inner>, mut rx: mpsc::Receiver<SyncerMsg>)
        -> JoinHandle<()>
    {
        let interval = inner.tunables.sync_interval();
        let span = tracing::debug_span!("syncer", pool = %inner.name);
        let taskfut = async move {
            loop {
                let wakeup_time = Instant::now() + interval;
                let mut delay_fut = Box::pin(sleep_until(wakeup_time).fuse());
                select! {
                    _ = delay_fut => {
                        if inner.has_work() {
                            let txg = inner.txg.open_txg();
                            if let Err(e) = inner.sync_through(txg).await {
                                // The dirty state is kept for the next try
                                error!(%txg, "periodic sync failed: {}", e);
                            }
                        }
                    },
                    sm = rx.select_next_some() => {
                        match sm {
                            SyncerMsg::Kick => {
                                // We got kicked.  Restart the wait
                            },
                            SyncerMsg::Shutdown => {
                                break;
                            }
                        }
                    },
                    complete => break,
                };
            }
        }.instrument(span);
        tokio::spawn(taskfut)
    }

    async fn shutdown(mut self) {
        if self.tx.send(SyncerMsg::Shutdown).await.is_ok() {
            if let Err(e) = self.jh.await {
                warn!("syncer task failed: {}", e);
            }
        }
    }
}

/// Open handles on one dataset
#[derive(Debug, Default)]
struct OpenState {
    handles: u32,
    /// A destroy, rollback, or rename is pending
    exclusive: bool,
}

struct QueuedTask {
    id: u64,
    task: SyncTask,
    tx: oneshot::Sender<Result<Option<DatasetId>>>,
}

/// State owned by whoever is syncing
struct SyncState {
    /// The most recently published MOS block
    mos: Option<BlockPtr>,
}

/// Everything produced by syncing one txg, to be installed once it's durable
#[derive(Default)]
struct SyncPass {
    installs: Vec<(Arc<Objset>, ObjsetSync)>,
    frees: Vec<BlockPtr>,
    stale: BTreeSet<DatasetId>,
    results: Vec<Result<Option<DatasetId>>>,
    mos: Option<BlockPtr>,
}

struct Inner {
    name: String,
    zio: Zio,
    tunables: Tunables,
    txg: TxgEngine,
    state: AtomicPoolState,
    next_task: AtomicU64,
    /// Serializes syncs.  Scrub holds it too, so nothing gets freed beneath
    /// it.
    sync: futures_locks::Mutex<SyncState>,
    /// The dataset graph as of the last synced txg
    graph: Mutex<Graph>,
    /// Every objset in memory.  When taking both, lock this before `graph`.
    objsets: Mutex<HashMap<DatasetId, Weak<Objset>>>,
    /// Objsets modified in each unsynced txg
    dirty: Mutex<BTreeMap<TxgT, BTreeMap<DatasetId, Arc<Objset>>>>,
    tasks: Mutex<BTreeMap<TxgT, Vec<QueuedTask>>>,
    open: Mutex<HashMap<DatasetId, OpenState>>,
}

/// Clears the exclusive flag of some datasets on drop
struct ExclusiveGuard {
    inner: Arc<Inner>,
    ids: Vec<DatasetId>,
}

impl Drop for ExclusiveGuard {
    fn drop(&mut self) {
        let mut open = self.inner.open.lock().unwrap();
        for id in self.ids.iter() {
            if let Some(st) = open.get_mut(id) {
                st.exclusive = false;
                if st.handles == 0 {
                    open.remove(id);
                }
            }
        }
    }
}

impl Inner {
    fn check_active(&self) -> Result<()> {
        if self.state.load(Ordering::Acquire) == PoolState::Active {
            Ok(())
        } else {
            Err(Error::Shutdown)
        }
    }

    /// Can a transaction of `estimate` bytes go ahead?
    ///
    /// Returns `Restart` if not, but a sync might change that.  On the
    /// `last_try`, fails instead.
    fn check_space(&self, dir: DirId, estimate: u64, last_try: bool)
        -> Result<QuotaCheck>
    {
        let graph = self.graph.lock().unwrap();
        match graph.check_quota(dir, estimate, self.txg.inflight_dir(dir))? {
            QuotaCheck::Ok => (),
            QuotaCheck::Restart if last_try => {
                return Err(Error::QuotaExceeded(graph.dir(dir)?.name.clone()));
            },
            QuotaCheck::Restart => return Ok(QuotaCheck::Restart)
        }
        let pool = self.zio.pool();
        let bpl = BYTES_PER_LBA as u64;
        let slop = pool.size() * bpl / 64;
        let inflight = self.txg.inflight();
        let avail = (pool.free_lbas() * bpl)
            .saturating_sub(slop)
            .saturating_sub(inflight)
            .saturating_sub(graph.reservation_shortfall(Some(dir)));
        if estimate <= avail {
            Ok(QuotaCheck::Ok)
        } else if !last_try && (inflight > 0 || self.has_work()) {
            Ok(QuotaCheck::Restart)
        } else {
            Err(Error::OutOfSpace)
        }
    }

    fn close_handle(&self, id: DatasetId) {
        let mut open = self.open.lock().unwrap();
        if let Some(st) = open.get_mut(&id) {
            st.handles = st.handles.saturating_sub(1);
            if st.handles == 0 && !st.exclusive {
                open.remove(&id);
            }
        }
    }

    /// Claim exclusive access to `ids` until the guard drops
    fn exclusive(self: &Arc<Self>, ids: Vec<DatasetId>)
        -> Result<ExclusiveGuard>
    {
        let mut open = self.open.lock().unwrap();
        for id in ids.iter() {
            if let Some(st) = open.get(id) {
                if st.handles > 0 || st.exclusive {
                    drop(open);
                    let name = self.graph.lock().unwrap().name(*id)?;
                    return Err(Error::Busy(name));
                }
            }
        }
        for id in ids.iter() {
            open.entry(*id).or_default().exclusive = true;
        }
        Ok(ExclusiveGuard{inner: self.clone(), ids})
    }

    fn has_work(&self) -> bool {
        !self.dirty.lock().unwrap().is_empty() ||
            self.tasks.lock().unwrap().values().any(|v| !v.is_empty())
    }

    /// Get the objset of a dataset, opening it if necessary
    async fn objset(&self, id: DatasetId) -> Result<Arc<Objset>> {
        loop {
            let existing = self.objsets.lock().unwrap()
                .get(&id)
                .and_then(Weak::upgrade);
            if let Some(os) = existing {
                return Ok(os);
            }
            let (root, readonly) = {
                let g = self.graph.lock().unwrap();
                let ds = g.ds(id)?;
                (ds.root, ds.is_snapshot())
            };
            let os = Objset::open(self.zio.clone(), id, root, readonly).await?;
            let mut objsets = self.objsets.lock().unwrap();
            if let Some(os) = objsets.get(&id).and_then(Weak::upgrade) {
                return Ok(os);
            }
            // A sync may have moved the root while we were reading it
            if self.graph.lock().unwrap().ds(id)?.root == root {
                objsets.retain(|_, w| w.strong_count() > 0);
                objsets.insert(id, Arc::downgrade(&os));
                return Ok(os);
            }
        }
    }

    /// Queue a graph change into the open txg and wait until it's durable
    #[tracing::instrument(skip(self), fields(pool = %self.name))]
    async fn run_task(self: &Arc<Self>, task: SyncTask)
        -> Result<Option<DatasetId>>
    {
        self.check_active()?;
        let ids = {
            let graph = self.graph.lock().unwrap();
            task.check(&graph, self.txg.open_txg())?;
            task.exclusive(&graph)?
        };
        let _guard = self.exclusive(ids)?;
        let (tx, rx) = oneshot::channel();
        let id = self.next_task.fetch_add(1, Ordering::Relaxed);
        let txg = self.txg.hold();
        self.tasks.lock().unwrap()
            .entry(txg)
            .or_default()
            .push(QueuedTask{id, task, tx});
        self.txg.release(txg);
        if let Err(e) = self.sync_through(txg).await {
            // An earlier txg failed before ours got a chance
            if let Some(queued) = self.tasks.lock().unwrap().get_mut(&txg) {
                queued.retain(|t| t.id != id);
            }
            return Err(e);
        }
        rx.await.map_err(|_| Error::Shutdown)?
    }

    /// Sync one txg: everything up to publishing its uberblock.
    async fn sync_pass(&self, txg: TxgT, old_mos: Option<BlockPtr>,
                       dirty: &BTreeMap<DatasetId, Arc<Objset>>,
                       tasks: &[SyncTask], graph: &mut Graph,
                       born: &mut Vec<BlockPtr>) -> Result<SyncPass>
    {
        let mut pass = SyncPass::default();
        let time = now_secs();
        for (ds, os) in dirty.iter() {
            let props = graph.effective_props(*ds)?.write_props();
            let Some(s) = os.sync(txg, &props).await? else {
                continue;
            };
            born.extend_from_slice(&s.born);
            for bp in s.born.iter() {
                graph.born(*ds, bp)?;
            }
            for bp in s.killed.iter() {
                if graph.kill(*ds, bp)? {
                    pass.frees.push(*bp);
                }
            }
            graph.set_root(*ds, s.bp)?;
            pass.installs.push((os.clone(), s));
        }

        for task in tasks.iter() {
            // A failed task must leave no trace
            let mut scratch = graph.clone();
            match task.run(&self.zio, &mut scratch, txg, time).await {
                Ok(outcome) => {
                    *graph = scratch;
                    born.extend_from_slice(&outcome.born);
                    pass.frees.extend(outcome.frees);
                    pass.stale.extend(outcome.stale);
                    pass.results.push(Ok(outcome.created));
                },
                Err(e) => {
                    debug!(?task, "sync task failed: {}", e);
                    pass.results.push(Err(e));
                }
            }
        }

        let buf = bincode::serialize(&*graph)?;
        pass.mos = self.zio.write_block(&buf, &WriteProps::default(),
                                        BlockType::Mos, txg).await?;
        born.extend(pass.mos);
        pass.frees.extend(old_mos);

        let free_dvas = pass.frees.iter()
            .flat_map(|bp| bp.dvas().iter().cloned())
            .collect::<Vec<_>>();
        let pool = self.zio.pool();
        pool.sync_all().await?;
        pool.write_spacemaps(txg, &free_dvas).await?;
        pool.sync_all().await?;
        pool.write_labels(&Uberblock{txg, mos: pass.mos, timestamp: time})
            .await?;
        Ok(pass)
    }

    /// Sync the oldest unsynced txg, closing it first if it's still open.
    #[tracing::instrument(skip(self, state), fields(pool = %self.name))]
    async fn sync_once(&self, state: &mut SyncState) -> Result<()> {
        let txg = self.txg.synced_txg() + 1;
        self.txg.close(txg);
        self.txg.quiesce(txg).await;
        let dirty = self.dirty.lock().unwrap()
            .get(&txg)
            .cloned()
            .unwrap_or_default();
        let (tasks, txs): (Vec<_>, Vec<_>) = self.tasks.lock().unwrap()
            .remove(&txg)
            .unwrap_or_default()
            .into_iter()
            .map(|qt| (qt.task, qt.tx))
            .unzip();
        let mut syncing = self.graph.lock().unwrap().clone();
        let mut born = Vec::new();
        let r = self.sync_pass(txg, state.mos, &dirty, &tasks, &mut syncing,
                               &mut born).await;
        match r {
            Ok(pass) => {
                {
                    let mut objsets = self.objsets.lock().unwrap();
                    *self.graph.lock().unwrap() = syncing;
                    for ds in pass.stale.iter() {
                        objsets.remove(ds);
                    }
                }
                for (os, s) in pass.installs.into_iter() {
                    os.install(txg, s);
                }
                for bp in pass.frees.iter() {
                    self.zio.evict(bp);
                }
                let free_dvas = pass.frees.iter()
                    .flat_map(|bp| bp.dvas().iter().cloned())
                    .collect::<Vec<_>>();
                self.zio.pool().apply_frees(&free_dvas);
                state.mos = pass.mos;
                self.dirty.lock().unwrap().remove(&txg);
                for os in dirty.values() {
                    os.evict_idle();
                }
                self.zio.cache().lock().unwrap().shrink();
                self.txg.mark_synced(txg);
                for (tx, r) in txs.into_iter().zip(pass.results) {
                    // The caller may have given up
                    let _ = tx.send(r);
                }
                debug!(%txg, born = born.len(), freed = pass.frees.len(),
                       "txg synced");
                Ok(())
            },
            Err(e) => {
                error!(%txg, "sync failed: {}", e);
                for bp in born.iter() {
                    for dva in bp.dvas() {
                        self.zio.pool().release(dva);
                    }
                }
                for tx in txs.into_iter() {
                    let _ = tx.send(Err(e.clone()));
                }
                Err(e)
            }
        }
    }

    /// Sync every txg up to and including `target`
    async fn sync_through(&self, target: TxgT) -> Result<()> {
        let mut state = self.sync.lock().await;
        while self.txg.synced_txg() < target {
            self.sync_once(&mut state).await?;
        }
        Ok(())
    }
}

/// Return value of [`Database::scrub`]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ScrubStats {
    /// Distinct blocks examined
    pub blocks: u64,
    /// Copies that failed verification
    pub errors: u64,
    /// Copies rewritten from good data
    pub repaired: u64,
    /// Blocks with no good copy at all
    pub unrecoverable: u64,
}

/// An imported pool, with its datasets
pub struct Database {
    inner: Arc<Inner>,
    syncer: Option<Syncer>,
}

impl Database {
    fn check_pool_name(name: &str) -> Result<()> {
        if name.is_empty() || name.contains(['/', '@']) ||
            name.contains(char::is_control)
        {
            Err(Error::ConfigInvalid(format!("bad pool name {name:?}")))
        } else {
            Ok(())
        }
    }

    /// Clone a dataset from one of its snapshots
    pub async fn clone(&self, origin: &str, name: &str, props: &[Property])
        -> Result<()>
    {
        self.inner.run_task(SyncTask::Clone {
            origin: origin.to_string(),
            name: name.to_string(),
            props: props.to_vec()
        }).await.map(drop)
    }

    /// Format a new pool and publish its first txg
    pub async fn create(name: &str, vdevs: Vec<TopVdev>, tunables: Tunables)
        -> Result<Self>
    {
        Database::check_pool_name(name)?;
        tunables.validate()?;
        let pool = Pool::create(name.to_string(), vdevs)?;
        let zio = Database::zio(pool, &tunables);
        let graph = Graph::new(name, TxgT(1), now_secs());
        let db = Database::new(zio, graph, TxgT(0), None, tunables);
        db.inner.sync_through(TxgT(1)).await?;
        info!(pool = name, "created");
        Ok(db)
    }

    /// Create a pool on files or device nodes
    pub async fn create_files(name: &str, topology: &TopologySpec,
                              tunables: Tunables) -> Result<Self>
    {
        topology.validate()?;
        let mut vdevs = Vec::with_capacity(topology.vdevs.len());
        for spec in topology.vdevs.iter() {
            let leaves = spec.paths().iter()
                .map(|p| VdevFile::create(p)
                     .map(|f| Arc::new(f) as Arc<dyn Leaf>))
                .collect::<Result<Vec<_>>>()?;
            let kind = match spec {
                VdevSpec::Mirror(_) => VdevKind::Mirror,
                VdevSpec::Raidz(_) => VdevKind::Raidz
            };
            vdevs.push(TopVdev::create(kind, leaves)?);
        }
        Database::create(name, vdevs, tunables).await
    }

    pub async fn create_dataset(&self, name: &str, props: &[Property])
        -> Result<()>
    {
        self.inner.run_task(SyncTask::CreateDataset {
            name: name.to_string(),
            props: props.to_vec()
        }).await.map(drop)
    }

    /// Create a sparse volume of `size` bytes, stored in `block_size` blocks.
    /// `size` must be a multiple of `block_size`.
    pub async fn create_volume(&self, name: &str, size: u64, block_size: u32,
                               props: &[Property]) -> Result<()>
    {
        check_geometry(size, block_size)?;
        self.inner.run_task(SyncTask::CreateVolume {
            name: name.to_string(),
            props: props.to_vec(),
            size,
            block_size
        }).await.map(drop)
    }

    pub fn dataset_stats(&self, name: &str) -> Result<DatasetStats> {
        let graph = self.inner.graph.lock().unwrap();
        graph.stats(graph.lookup(name)?)
    }

    /// Destroy the pool, erasing its labels
    pub async fn destroy(mut self) -> Result<()> {
        self.inner.check_active()?;
        self.check_idle()?;
        if let Some(syncer) = self.syncer.take() {
            syncer.shutdown().await;
        }
        self.inner.state.store(PoolState::Exported, Ordering::Release);
        self.inner.zio.pool().destroy().await?;
        info!(pool = %self.inner.name, "destroyed");
        Ok(())
    }

    /// Destroy a dataset or snapshot.  With `recursive`, a dataset's
    /// snapshots go too.
    pub async fn destroy_dataset(&self, name: &str, recursive: bool)
        -> Result<()>
    {
        self.inner.run_task(SyncTask::Destroy {
            name: name.to_string(),
            recursive
        }).await.map(drop)
    }

    fn check_idle(&self) -> Result<()> {
        if self.inner.open.lock().unwrap().values().any(|st| st.handles > 0) {
            Err(Error::Busy(self.inner.name.clone()))
        } else {
            Ok(())
        }
    }

    /// Cleanly shut down the pool, syncing everything first
    pub async fn export(mut self) -> Result<()> {
        self.inner.check_active()?;
        self.check_idle()?;
        if let Some(syncer) = self.syncer.take() {
            syncer.shutdown().await;
        }
        let txg = self.inner.txg.open_txg();
        self.inner.sync_through(txg).await?;
        self.inner.state.store(PoolState::Exported, Ordering::Release);
        info!(pool = %self.inner.name, %txg, "exported");
        Ok(())
    }

    pub fn get_prop(&self, name: &str, prop: PropertyName)
        -> Result<(Property, PropertySource)>
    {
        if prop == PropertyName::Invalid {
            return Err(Error::InvalidArgument(format!("{prop:?}")));
        }
        let graph = self.inner.graph.lock().unwrap();
        let dir = graph.ds(graph.lookup(name)?)?.dir;
        graph.get_prop(dir, prop)
    }

    /// A dataset's graph record, as of the last sync
    pub(crate) fn graph(&self) -> Graph {
        self.inner.graph.lock().unwrap().clone()
    }

    /// Revert a locally set property to its inherited or default value
    pub async fn inherit_prop(&self, name: &str, prop: PropertyName)
        -> Result<()>
    {
        if prop == PropertyName::Invalid {
            return Err(Error::InvalidArgument(format!("{prop:?}")));
        }
        self.inner.run_task(SyncTask::InheritProp {
            name: name.to_string(),
            prop
        }).await.map(drop)
    }

    /// Every dataset and snapshot, by name
    pub fn list_datasets(&self) -> Vec<String> {
        self.inner.graph.lock().unwrap().list()
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    fn new(zio: Zio, graph: Graph, synced: TxgT, mos: Option<BlockPtr>,
           tunables: Tunables) -> Self
    {
        let inner = Arc::new(Inner {
            name: zio.pool().name().to_string(),
            zio,
            tunables,
            txg: TxgEngine::new(synced),
            state: AtomicPoolState::new(PoolState::Active),
            next_task: AtomicU64::new(0),
            sync: futures_locks::Mutex::new(SyncState{mos}),
            graph: Mutex::new(graph),
            objsets: Mutex::new(HashMap::new()),
            dirty: Mutex::new(BTreeMap::new()),
            tasks: Mutex::new(BTreeMap::new()),
            open: Mutex::new(HashMap::new()),
        });
        let syncer = Some(Syncer::new(inner.clone()));
        Database{inner, syncer}
    }

    /// Import a pool from its leaves
    pub async fn open(name: &str, leaves: Vec<Arc<dyn Leaf>>,
                      tunables: Tunables) -> Result<Self>
    {
        tunables.validate()?;
        let (pool, uberblock) = Pool::open(name, leaves).await?;
        let zio = Database::zio(pool, &tunables);
        let mos = uberblock.mos.ok_or_else(|| Error::Integrity(
                format!("pool {name} has no MOS")))?;
        let dbs = zio.read_block(&mos).await?;
        let graph: Graph = bincode::deserialize(&frozen(&dbs)[..])?;
        info!(pool = name, txg = %uberblock.txg, "opened");
        Ok(Database::new(zio, graph, uberblock.txg, Some(mos), tunables))
    }

    /// Open a dataset or snapshot
    pub async fn open_dataset(&self, name: &str) -> Result<DatasetHandle> {
        self.inner.check_active()?;
        let (id, snapshot) = {
            let graph = self.inner.graph.lock().unwrap();
            let id = graph.lookup(name)?;
            (id, graph.ds(id)?.is_snapshot())
        };
        {
            let mut open = self.inner.open.lock().unwrap();
            let st = open.entry(id).or_default();
            if st.exclusive {
                return Err(Error::Busy(name.to_string()));
            }
            st.handles += 1;
        }
        match self.inner.objset(id).await {
            Ok(objset) => Ok(DatasetHandle {
                inner: self.inner.clone(),
                id,
                name: name.to_string(),
                snapshot,
                objset
            }),
            Err(e) => {
                self.inner.close_handle(id);
                Err(e)
            }
        }
    }

    /// Import a pool from files or device nodes.  Paths that can't be opened
    /// are skipped, so a redundant pool can be imported degraded.
    pub async fn open_files<P>(name: &str, paths: &[P], tunables: Tunables)
        -> Result<Self>
        where P: AsRef<Path>
    {
        let mut leaves = Vec::with_capacity(paths.len());
        for path in paths.iter() {
            match VdevFile::open(path).await {
                Ok(f) => leaves.push(Arc::new(f) as Arc<dyn Leaf>),
                Err(e) => warn!(path = %path.as_ref().display(),
                                "can't open leaf: {}", e)
            }
        }
        Database::open(name, leaves, tunables).await
    }

    /// Open a volume or a snapshot of one
    pub async fn open_volume(&self, name: &str) -> Result<Volume> {
        Volume::new(self.open_dataset(name).await?)
    }

    pub fn pool_status(&self) -> PoolStatus {
        let cache = self.inner.zio.cache().lock().unwrap().stats();
        self.inner.zio.pool().status(self.inner.txg.synced_txg(), cache)
    }

    /// Turn a clone into an ordinary dataset, making its origin the clone
    pub async fn promote(&self, name: &str) -> Result<()> {
        self.inner.run_task(SyncTask::Promote{name: name.to_string()})
            .await
            .map(drop)
    }

    /// Rename a dataset, with its children and snapshots, or a snapshot
    pub async fn rename(&self, old: &str, new: &str) -> Result<()> {
        self.inner.run_task(SyncTask::Rename {
            old: old.to_string(),
            new: new.to_string()
        }).await.map(drop)
    }

    /// Discard every change since the dataset's latest snapshot
    pub async fn rollback(&self, name: &str, force: bool) -> Result<()> {
        self.inner.run_task(SyncTask::Rollback {
            name: name.to_string(),
            target: None,
            force
        }).await.map(drop)
    }

    /// Discard every change since `snapshot`.  With `force`, destroy any
    /// later snapshots.
    pub async fn rollback_to(&self, name: &str, snapshot: &str, force: bool)
        -> Result<()>
    {
        self.inner.run_task(SyncTask::Rollback {
            name: name.to_string(),
            target: Some(snapshot.to_string()),
            force
        }).await.map(drop)
    }

    /// Read every block of every dataset, verifying and repairing each copy
    #[tracing::instrument(skip(self), fields(pool = %self.inner.name))]
    pub async fn scrub(&self) -> Result<ScrubStats> {
        self.inner.check_active()?;
        let state = self.inner.sync.lock().await;
        let roots = self.inner.graph.lock().unwrap()
            .datasets()
            .filter_map(|ds| ds.root)
            .collect::<Vec<_>>();
        let mut seen = BTreeSet::new();
        let mut bps = Vec::new();
        for root in roots.into_iter() {
            let mut visitor = |bp: &BlockPtr| {
                if seen.insert((bp.dvas()[0], bp.birth)) {
                    bps.push(*bp);
                }
                Ok(())
            };
            traverse(&self.inner.zio, root, TxgT(0), &mut visitor).await?;
        }
        bps.extend(state.mos);
        let mut stats = ScrubStats::default();
        for bp in bps.iter() {
            stats.blocks += 1;
            match self.inner.zio.scrub_block(bp).await {
                Ok(outcome) => {
                    stats.errors += outcome.errors;
                    stats.repaired += outcome.repaired;
                },
                Err(e) => {
                    error!(%bp, "unrecoverable: {}", e);
                    stats.errors += bp.dvas().len() as u64;
                    stats.unrecoverable += 1;
                }
            }
        }
        info!(?stats, "scrub complete");
        Ok(stats)
    }

    /// Set a property on a dataset's directory
    pub async fn set_prop(&self, name: &str, prop: Property) -> Result<()> {
        let valid = match prop {
            Property::Copies(c) => (1..=3).contains(&c),
            Property::RecordSize(rs) => (12..=20).contains(&rs),
            _ => true
        };
        if !valid {
            return Err(Error::InvalidArgument(format!("{prop:?}")));
        }
        self.inner.run_task(SyncTask::SetProp {
            name: name.to_string(),
            prop
        }).await.map(drop)
    }

    /// Snapshot a dataset.  `name` is `dataset@snapshot`.
    pub async fn snapshot(&self, name: &str) -> Result<()> {
        self.snapshot_with_guid(name, None).await
    }

    /// Like [`snapshot`](Self::snapshot), but with a predetermined GUID
    pub(crate) async fn snapshot_with_guid(&self, name: &str,
                                           guid: Option<u64>) -> Result<()>
    {
        let (dsname, snapname) = name.split_once('@')
            .ok_or_else(|| Error::InvalidArgument(format!(
                "{name} is not a snapshot name")))?;
        self.inner.run_task(SyncTask::Snapshot {
            name: dsname.to_string(),
            snapname: snapname.to_string(),
            guid
        }).await.map(drop)
    }

    /// Finish the current transaction group and wait until it's durable.
    pub async fn sync_transaction(&self) -> Result<()> {
        self.inner.check_active()?;
        if let Some(syncer) = self.syncer.as_ref() {
            syncer.kick();
        }
        let txg = self.inner.txg.open_txg();
        self.inner.sync_through(txg).await
    }

    /// Most recently published txg
    pub fn synced_txg(&self) -> TxgT {
        self.inner.txg.synced_txg()
    }

    /// Wait for the periodic sync to make `txg` durable, without forcing
    /// one.  A txg that dirtied nothing isn't synced until something else
    /// does.
    pub async fn wait_synced(&self, txg: TxgT) -> Result<()> {
        self.inner.check_active()?;
        self.inner.txg.wait_synced(txg).await
    }

    fn zio(pool: Pool, tunables: &Tunables) -> Zio {
        let cache = Arc::new(Mutex::new(
                Cache::with_capacity(tunables.cache_size)));
        Zio::new(Arc::new(pool), cache, tunables.write_retries,
                 tunables.ditto_metadata)
    }

    pub(crate) fn zio_ref(&self) -> &Zio {
        &self.inner.zio
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if let Some(syncer) = self.syncer.take() {
            // Dropped without an export.  Unsynced changes are lost, just as
            // in a crash.
            syncer.jh.abort();
        }
        self.inner.state.store(PoolState::Exported, Ordering::Release);
    }
}

/// An open dataset or snapshot.
///
/// While any handle is open, the dataset can't be destroyed, rolled back, or
/// renamed.
pub struct DatasetHandle {
    inner: Arc<Inner>,
    id: DatasetId,
    name: String,
    snapshot: bool,
    objset: Arc<Objset>,
}

impl DatasetHandle {
    /// Join the open txg, reserving `estimate` bytes of space.
    ///
    /// Don't call this while holding another `Transaction`: a throttled or
    /// out-of-space caller waits for a sync, and the sync waits for every
    /// transaction in its txg.
    pub async fn begin_transaction(&self, estimate: u64)
        -> Result<Transaction<'_>>
    {
        let inner = &self.inner;
        inner.check_active()?;
        let (dir, props) = self.props()?;
        if self.snapshot || props.readonly {
            return Err(Error::ReadOnly(self.name.clone()));
        }
        loop {
            let open = inner.txg.open_txg();
            if inner.txg.dirty(open) < inner.tunables.dirty_max {
                break;
            }
            debug!(txg = %open, "throttled");
            inner.sync_through(open).await?;
        }
        let mut last_try = false;
        while inner.check_space(dir, estimate, last_try)? ==
            QuotaCheck::Restart
        {
            debug!(ds = %self.name, estimate, "syncing to reclaim space");
            inner.sync_through(inner.txg.open_txg()).await?;
            last_try = true;
        }
        let txg = inner.txg.hold();
        inner.txg.reserve(txg, dir, estimate);
        Ok(Transaction {
            handle: self,
            txg,
            dir,
            copies: u64::from(props.copies),
            charge: Mutex::new(Charge{reserved: estimate, used: 0})
        })
    }

    /// Capture part of an object, as of now
    pub async fn hold_range(&self, object: ObjectId, offset: u64, len: u64)
        -> Result<RangeView>
    {
        self.objset.hold_range(object, offset, len).await
    }

    pub fn id(&self) -> DatasetId {
        self.id
    }

    pub fn is_snapshot(&self) -> bool {
        self.snapshot
    }

    pub fn kind(&self) -> ObjsetKind {
        self.objset.kind()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn object_info(&self, object: ObjectId) -> Result<ObjectInfo> {
        self.objset.object_info(object)
    }

    pub fn objects(&self) -> Vec<ObjectId> {
        self.objset.objects()
    }

    pub(crate) fn objset(&self) -> &Arc<Objset> {
        &self.objset
    }

    fn props(&self) -> Result<(DirId, EffectiveProps)> {
        let graph = self.inner.graph.lock().unwrap();
        let dir = graph.ds(self.id)?.dir;
        Ok((dir, graph.effective_props(self.id)?))
    }

    /// Read part of an object.  Reads past the end are truncated.
    pub async fn read(&self, object: ObjectId, offset: u64, len: u64)
        -> Result<Vec<u8>>
    {
        self.objset.read(object, offset, len).await
    }

    /// Block size for new objects, from the `RecordSize` property
    pub fn record_size(&self) -> Result<u32> {
        Ok(1u32 << self.props()?.1.record_size)
    }
}

impl Drop for DatasetHandle {
    fn drop(&mut self) {
        self.inner.close_handle(self.id);
    }
}

/// Space reserved by one transaction, and how much of it its writes may use
#[derive(Debug)]
struct Charge {
    reserved: u64,
    used: u64,
}

/// A group of changes to one dataset that become durable together.
///
/// Committing or dropping the transaction releases its txg hold.
pub struct Transaction<'a> {
    handle: &'a DatasetHandle,
    txg: TxgT,
    dir: DirId,
    copies: u64,
    charge: Mutex<Charge>,
}

impl Transaction<'_> {
    /// Account for a write that may allocate `bytes` of space.
    ///
    /// Whatever exceeds the transaction's reservation is checked against the
    /// quota and the free space right away, and reserved if it fits.  Since
    /// the transaction holds its txg, there is no waiting for a sync here.
    fn charge(&self, bytes: u64) -> Result<()> {
        let inner = &self.handle.inner;
        let mut c = self.charge.lock().unwrap();
        let used = c.used.saturating_add(bytes);
        if used > c.reserved {
            let extra = used - c.reserved;
            inner.check_space(self.dir, extra, true)?;
            inner.txg.reserve(self.txg, self.dir, extra);
            debug!(ds = %self.handle.name, extra, "reservation grew");
            c.reserved = used;
        }
        c.used = used;
        Ok(())
    }

    /// Create an object with a specific id
    pub fn claim_object(&self, object: ObjectId, block_size: u32)
        -> Result<()>
    {
        self.handle.objset.claim_object(self.txg, object, block_size)?;
        self.dirtied(0);
        Ok(())
    }

    /// Finish the transaction.  Doesn't wait for the sync: use
    /// [`Database::sync_transaction`] for that.  Returns the transaction's
    /// txg.
    pub fn commit(self) -> TxgT {
        self.txg
    }

    /// Create an object with the lowest free id
    pub fn create_object(&self, block_size: u32) -> Result<ObjectId> {
        let object = self.handle.objset.create_object(self.txg, block_size)?;
        self.dirtied(0);
        Ok(object)
    }

    /// Register the objset as dirty in this txg
    fn dirtied(&self, bytes: u64) {
        let inner = &self.handle.inner;
        inner.dirty.lock().unwrap()
            .entry(self.txg)
            .or_default()
            .entry(self.handle.id)
            .or_insert_with(|| self.handle.objset.clone());
        inner.txg.add_dirty(self.txg, bytes);
    }

    pub fn free_object(&self, object: ObjectId) -> Result<()> {
        self.handle.objset.free_object(self.txg, object)?;
        self.dirtied(0);
        Ok(())
    }

    /// Punch a hole in an object
    pub async fn free_range(&self, object: ObjectId, offset: u64, len: u64)
        -> Result<()>
    {
        self.handle.objset.free_range(self.txg, object, offset, len).await?;
        self.dirtied(0);
        Ok(())
    }

    /// Pre-read the partially covered ends of a range that is about to be
    /// written
    pub async fn hold_object_for_write(&self, object: ObjectId, offset: u64,
                                       len: u64) -> Result<()>
    {
        self.handle.objset.hold_for_write(object, offset, len).await
    }

    pub async fn read(&self, object: ObjectId, offset: u64, len: u64)
        -> Result<Vec<u8>>
    {
        self.handle.read(object, offset, len).await
    }

    pub async fn truncate(&self, object: ObjectId, size: u64) -> Result<()> {
        self.handle.objset.truncate(self.txg, object, size).await?;
        self.dirtied(0);
        Ok(())
    }

    pub fn txg(&self) -> TxgT {
        self.txg
    }

    /// Write `data` at `offset`.
    ///
    /// Every block the write touches is charged in full, times the number
    /// of copies, against the transaction's reservation.  Fails with
    /// `QuotaExceeded` or `OutOfSpace` if the excess doesn't fit.
    pub async fn write(&self, object: ObjectId, offset: u64, data: &[u8])
        -> Result<()>
    {
        let bs = u64::from(self.handle.objset.object_info(object)?.block_size);
        if !data.is_empty() {
            let end = range_end(offset, data.len() as u64)?;
            let span = (div_roundup(end, bs) - offset / bs) * bs;
            self.charge(span.saturating_mul(self.copies))?;
        }
        self.handle.objset.write(self.txg, object, offset, data).await?;
        self.dirtied(data.len() as u64);
        Ok(())
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        self.handle.inner.txg.release(self.txg);
    }
}

// LCOV_EXCL_STOP
