// vim: tw=80
//! Dataset graph changes that run in syncing context

use crate::{
    dmu::{ObjsetPhys, traverse},
    dsl::Graph,
    property::{Property, PropertyName},
    types::*,
    zio::{BlockPtr, Zio},
};

/// A change to the dataset graph.
///
/// Tasks are queued into the open txg and applied to the syncing copy of the
/// graph after every dirty objset of that txg has been written.  They name
/// datasets rather than number them, because an earlier task in the same txg
/// may have renamed them.
#[derive(Clone, Debug)]
pub(crate) enum SyncTask {
    CreateDataset { name: String, props: Vec<Property> },
    /// Like `CreateDataset`, but the new head starts out as a sparse volume
    CreateVolume {
        name: String,
        props: Vec<Property>,
        size: u64,
        block_size: u32
    },
    Snapshot { name: String, snapname: String, guid: Option<u64> },
    Clone { origin: String, name: String, props: Vec<Property> },
    Destroy { name: String, recursive: bool },
    Promote { name: String },
    /// Roll back to `target`, or to the latest snapshot if `None`
    Rollback { name: String, target: Option<String>, force: bool },
    Rename { old: String, new: String },
    SetProp { name: String, prop: Property },
    InheritProp { name: String, prop: PropertyName },
}

/// What a task did to the graph
#[derive(Debug, Default)]
pub(crate) struct TaskOutcome {
    /// The dataset that the task created, if any
    pub created: Option<DatasetId>,
    /// Blocks that the task wrote
    pub born: Vec<BlockPtr>,
    /// Blocks that are now free
    pub frees: Vec<BlockPtr>,
    /// Datasets whose in-memory objsets no longer match the graph
    pub stale: Vec<DatasetId>,
}

/// Every block pointer under `root` born after `min_txg`
async fn born_after(zio: &Zio, root: Option<BlockPtr>, min_txg: TxgT)
    -> Result<Vec<BlockPtr>>
{
    let mut bps = Vec::new();
    if let Some(root) = root {
        let mut visitor = |bp: &BlockPtr| {
            bps.push(*bp);
            Ok(())
        };
        traverse(zio, root, min_txg, &mut visitor).await?;
    }
    Ok(bps)
}

impl SyncTask {
    /// Apply the task to `graph`.
    ///
    /// `doomed` must be whatever [`doomed`](Self::doomed) returned for the
    /// same graph.
    fn apply(&self, graph: &mut Graph, txg: TxgT, time: u64,
             doomed: Vec<BlockPtr>) -> Result<TaskOutcome>
    {
        let mut outcome = TaskOutcome::default();
        match self {
            SyncTask::CreateDataset{name, props} => {
                outcome.created =
                    Some(graph.create_dataset(name, props, txg, time)?);
            },
            SyncTask::CreateVolume{name, props, size, block_size} => {
                crate::volume::check_geometry(*size, *block_size)?;
                outcome.created =
                    Some(graph.create_dataset(name, props, txg, time)?);
            },
            SyncTask::Snapshot{name, snapname, guid} => {
                let head = graph.lookup(name)?;
                outcome.created =
                    Some(graph.snapshot(head, snapname, txg, time, *guid)?);
            },
            SyncTask::Clone{origin, name, props} => {
                let origin = graph.lookup(origin)?;
                outcome.created = Some(graph.clone_snapshot(origin, name,
                    props, txg, time)?);
            },
            SyncTask::Destroy{name, recursive} => {
                let id = graph.lookup(name)?;
                outcome.stale = self.exclusive(graph)?;
                outcome.frees = graph.destroy(id, *recursive, doomed)?;
            },
            SyncTask::Promote{name} => {
                graph.promote(graph.lookup(name)?)?;
            },
            SyncTask::Rollback{name, target, force} => {
                let head = graph.lookup(name)?;
                let target = Self::rollback_target(graph, name, target)?;
                outcome.frees = graph.rollback(head, target, *force, doomed)?;
                outcome.stale.push(head);
            },
            SyncTask::Rename{old, new} => {
                graph.rename(old, new)?;
            },
            SyncTask::SetProp{name, prop} => {
                let dir = Self::prop_dir(graph, name)?;
                graph.set_prop(dir, *prop)?;
            },
            SyncTask::InheritProp{name, prop} => {
                let dir = Self::prop_dir(graph, name)?;
                graph.inherit_prop(dir, *prop)?;
            }
        }
        Ok(outcome)
    }

    /// Validate the task against `graph` without changing it
    pub fn check(&self, graph: &Graph, txg: TxgT) -> Result<()> {
        let mut scratch = graph.clone();
        self.apply(&mut scratch, txg, 0, Vec::new()).map(drop)
    }

    /// Blocks that the task will free but that the graph can't enumerate by
    /// itself: the part of a head's tree born since its branch point.
    async fn doomed(&self, zio: &Zio, graph: &Graph) -> Result<Vec<BlockPtr>>
    {
        match self {
            SyncTask::Destroy{name, ..} => {
                let ds = graph.ds(graph.lookup(name)?)?;
                if ds.is_snapshot() {
                    return Ok(Vec::new());
                }
                // Once its snapshots are gone, a head shares only what it
                // inherited from its origin.
                let min_txg = match graph.dir(ds.dir)?.origin {
                    Some(o) => graph.ds(o)?.creation_txg,
                    None => TxgT(0)
                };
                born_after(zio, ds.root, min_txg).await
            },
            SyncTask::Rollback{name, target, ..} => {
                let head = graph.ds(graph.lookup(name)?)?;
                let target = Self::rollback_target(graph, name, target)?;
                let min_txg = graph.ds(target)?.creation_txg;
                born_after(zio, head.root, min_txg).await
            },
            _ => Ok(Vec::new())
        }
    }

    /// Datasets that must have no open handles while the task is pending
    pub fn exclusive(&self, graph: &Graph) -> Result<Vec<DatasetId>> {
        match self {
            SyncTask::Destroy{name, recursive} => {
                let id = graph.lookup(name)?;
                let mut ids = vec![id];
                let ds = graph.ds(id)?;
                if *recursive && !ds.is_snapshot() {
                    ids.extend(graph.snapshots(ds.dir)?);
                }
                Ok(ids)
            },
            SyncTask::Rollback{name, ..} => {
                let id = graph.lookup(name)?;
                let mut ids = vec![id];
                ids.extend(graph.snapshots(graph.ds(id)?.dir)?);
                Ok(ids)
            },
            SyncTask::Rename{old, ..} => Ok(vec![graph.lookup(old)?]),
            _ => Ok(Vec::new())
        }
    }

    fn prop_dir(graph: &Graph, name: &str) -> Result<DirId> {
        let ds = graph.ds(graph.lookup(name)?)?;
        if ds.is_snapshot() {
            return Err(Error::InvalidArgument(format!(
                "{name}: snapshots have no properties of their own")));
        }
        Ok(ds.dir)
    }

    fn rollback_target(graph: &Graph, name: &str, target: &Option<String>)
        -> Result<DatasetId>
    {
        match target {
            Some(t) => graph.lookup(t),
            None => {
                let dir = graph.ds(graph.lookup(name)?)?.dir;
                graph.snapshots(dir)?
                    .last()
                    .cloned()
                    .ok_or_else(|| Error::InvalidArgument(format!(
                        "{name} has no snapshots")))
            }
        }
    }

    /// Apply the task to the syncing copy of the graph
    pub async fn run(&self, zio: &Zio, graph: &mut Graph, txg: TxgT,
                     time: u64) -> Result<TaskOutcome>
    {
        let doomed = self.doomed(zio, graph).await?;
        let mut outcome = self.apply(graph, txg, time, doomed)?;
        if let SyncTask::CreateVolume{size, block_size, ..} = self {
            let id = outcome.created.ok_or_else(|| Error::Integrity(
                "volume creation created nothing".to_string()))?;
            let props = graph.effective_props(id)?.write_props();
            let bp = ObjsetPhys::volume(*size, *block_size)
                .write(zio, &props, txg)
                .await?;
            if let Some(bp) = bp {
                graph.born(id, &bp)?;
                outcome.born.push(bp);
            }
            graph.set_root(id, bp)?;
        }
        Ok(outcome)
    }
}

// LCOV_EXCL_STOP
