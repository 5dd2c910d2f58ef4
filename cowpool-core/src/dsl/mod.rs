// vim: tw=80
//! The dataset and snapshot graph
//!
//! Datasets are grouped into directories.  A directory holds one head
//! dataset plus its snapshots, and carries the properties and the space
//! accounting shared by all of them.  Directories form a tree by name, and a
//! clone's directory additionally points to its origin snapshot.
//!
//! Blocks are shared between a head and its snapshots without reference
//! counts.  Instead, every block records its birth txg, and every dataset
//! records the blocks it killed that its previous snapshot still uses.

use crate::{
    property::{EffectiveProps, Property, PropertyName, PropertySource},
    types::*,
    zio::BlockPtr,
};
use itertools::Itertools;
use serde_derive::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

mod deadlist;

pub use self::deadlist::Deadlist;

/// On-disk state of one dataset: a head or a snapshot
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct DatasetPhys {
    pub id: DatasetId,
    pub dir: DirId,
    /// Set only for snapshots
    pub snapname: Option<String>,
    pub creation_txg: TxgT,
    /// Seconds since the epoch
    pub creation_time: u64,
    pub guid: u64,
    /// The dataset's objset block
    pub root: Option<BlockPtr>,
    /// Space referenced by this dataset, counting every copy
    pub used: u64,
    pub compressed: u64,
    pub uncompressed: u64,
    /// Space referenced by this dataset and nothing else
    pub unique: u64,
    pub prev_snap: Option<DatasetId>,
    pub prev_snap_txg: TxgT,
    pub next_snap: Option<DatasetId>,
    pub deadlist: Deadlist,
    /// For a snapshot, its successor plus its clones
    pub num_children: u64,
    /// Heads of the clones of this snapshot
    pub clones: BTreeSet<DatasetId>,
}

impl DatasetPhys {
    pub fn is_snapshot(&self) -> bool {
        self.snapname.is_some()
    }
}

/// On-disk state of one directory
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct DirPhys {
    pub id: DirId,
    /// Full path, starting with the pool name
    pub name: String,
    pub parent: Option<DirId>,
    pub head: DatasetId,
    /// Set for clones
    pub origin: Option<DatasetId>,
    /// Space consumed by the head and snapshots of this directory.  Child
    /// directories are not included.
    pub used: u64,
    pub compressed: u64,
    pub uncompressed: u64,
    /// Locally set properties
    pub props: BTreeMap<PropertyName, Property>,
    pub snapshots: BTreeMap<String, DatasetId>,
    pub children: BTreeSet<DirId>,
}

/// Outcome of [`Graph::check_quota`]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum QuotaCheck {
    Ok,
    /// Over quota, but a sync might free enough space.  Retry after one.
    Restart,
}

/// Return value of [`Graph::stats`]
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DatasetStats {
    pub name: String,
    pub id: DatasetId,
    pub guid: u64,
    pub creation_txg: TxgT,
    pub creation_time: u64,
    pub used: u64,
    pub compressed: u64,
    pub uncompressed: u64,
    pub unique: u64,
    /// Space charged to the dataset's directory
    pub dir_used: u64,
    pub is_snapshot: bool,
    pub origin: Option<String>,
    pub prev_snap: Option<String>,
    pub clones: Vec<String>,
}

/// The whole graph.  Stored in the MOS.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Graph {
    datasets: BTreeMap<DatasetId, DatasetPhys>,
    dirs: BTreeMap<DirId, DirPhys>,
    next_id: u64,
    root: DirId,
}

fn check_component(s: &str) -> Result<()> {
    if s.is_empty() || s.contains(['/', '@']) || s.contains(char::is_control)
    {
        Err(Error::InvalidArgument(format!("bad name component {s:?}")))
    } else {
        Ok(())
    }
}

impl Graph {
    /// Account for a block written by `ds`
    pub fn born(&mut self, ds: DatasetId, bp: &BlockPtr) -> Result<()> {
        let asize = bp.asize();
        let d = self.ds_mut(ds)?;
        d.used += asize;
        d.compressed += u64::from(bp.psize);
        d.uncompressed += u64::from(bp.lsize);
        d.unique += asize;
        let dir = d.dir;
        let dir = self.dir_mut(dir)?;
        dir.used += asize;
        dir.compressed += u64::from(bp.psize);
        dir.uncompressed += u64::from(bp.lsize);
        Ok(())
    }

    /// Is an over-quota write worth retrying?
    pub fn check_quota(&self, dir: DirId, estimate: u64, inflight: u64)
        -> Result<QuotaCheck>
    {
        let d = self.dir(dir)?;
        let quota = self.get_prop(dir, PropertyName::Quota)?.0.as_u64();
        if quota == 0 || d.used + inflight + estimate <= quota {
            Ok(QuotaCheck::Ok)
        } else if inflight > 0 || d.used < quota {
            Ok(QuotaCheck::Restart)
        } else {
            Err(Error::QuotaExceeded(d.name.clone()))
        }
    }

    /// Create a writable head that starts out identical to `origin`
    #[tracing::instrument(skip(self, props))]
    pub fn clone_snapshot(&mut self, origin: DatasetId, name: &str,
                          props: &[Property], txg: TxgT, time: u64)
        -> Result<DatasetId>
    {
        let o = self.ds(origin)?.clone();
        if !o.is_snapshot() {
            return Err(Error::NotASnapshot(self.name(origin)?));
        }
        let (dir, id) = self.new_head(name, props, txg, time, None)?;
        {
            let head = self.ds_mut(id)?;
            head.root = o.root;
            head.used = o.used;
            head.compressed = o.compressed;
            head.uncompressed = o.uncompressed;
            head.prev_snap = Some(origin);
            head.prev_snap_txg = o.creation_txg;
        }
        self.dir_mut(dir)?.origin = Some(origin);
        let o = self.ds_mut(origin)?;
        o.num_children += 1;
        o.clones.insert(id);
        Ok(id)
    }

    /// Create an empty head dataset in a new directory
    #[tracing::instrument(skip(self, props))]
    pub fn create_dataset(&mut self, name: &str, props: &[Property],
                          txg: TxgT, time: u64) -> Result<DatasetId>
    {
        self.new_head(name, props, txg, time, None).map(|(_, id)| id)
    }

    /// All datasets, heads and snapshots
    pub fn datasets(&self) -> impl Iterator<Item=&DatasetPhys> {
        self.datasets.values()
    }

    /// Destroy a snapshot, or a head with `recursive` destroying its
    /// snapshots first.
    ///
    /// For a head, `head_frees` must be every block of its tree born after
    /// its origin.  Returns every block that is now free.
    #[tracing::instrument(skip(self, head_frees))]
    pub fn destroy(&mut self, id: DatasetId, recursive: bool,
                   head_frees: Vec<BlockPtr>) -> Result<Vec<BlockPtr>>
    {
        let ds = self.ds(id)?;
        if ds.is_snapshot() {
            return self.destroy_snapshot(id);
        }
        let dir = self.dir(ds.dir)?;
        if dir.parent.is_none() {
            return Err(Error::InvalidArgument(format!(
                "{} is the pool's root dataset", dir.name)));
        }
        if !dir.children.is_empty() {
            return Err(Error::HasChildren(dir.name.clone()));
        }
        if !dir.snapshots.is_empty() && !recursive {
            return Err(Error::HasSnapshots(dir.name.clone()));
        }
        let snaps = self.snapshots(ds.dir)?;
        let mut frees = Vec::new();
        for snap in snaps {
            frees.extend(self.destroy_snapshot(snap)?);
        }
        frees.extend(self.destroy_head(id, head_frees)?);
        Ok(frees)
    }

    fn destroy_head(&mut self, id: DatasetId, frees: Vec<BlockPtr>)
        -> Result<Vec<BlockPtr>>
    {
        let ds = self.ds(id)?.clone();
        let dir = self.dir(ds.dir)?.clone();
        debug_assert!(dir.snapshots.is_empty());
        if let Some(origin) = dir.origin {
            let o = self.ds_mut(origin)?;
            o.num_children = o.num_children.saturating_sub(1);
            o.clones.remove(&id);
        }
        if let Some(parent) = dir.parent {
            self.dir_mut(parent)?.children.remove(&dir.id);
        }
        self.dirs.remove(&dir.id);
        self.datasets.remove(&id);
        debug!(name = dir.name, freed = frees.len(), "destroyed head");
        Ok(frees)
    }

    fn destroy_snapshot(&mut self, id: DatasetId) -> Result<Vec<BlockPtr>> {
        let ds = self.ds(id)?.clone();
        let name = self.name(id)?;
        let Some(snapname) = ds.snapname.clone() else {
            return Err(Error::NotASnapshot(name));
        };
        if ds.num_children > 1 {
            return Err(Error::HasDependentClones(name));
        }
        let next_id = ds.next_snap.ok_or_else(|| Error::Integrity(
                format!("{name} has no successor")))?;
        let mut next = self.ds(next_id)?.clone();
        let mut prev = match ds.prev_snap {
            Some(p) => Some(self.ds(p)?.clone()),
            None => None
        };
        let after_space = match (next.is_snapshot(), next.next_snap) {
            (true, Some(after)) => self.ds(after)?.deadlist
                .space_range(ds.prev_snap_txg, ds.creation_txg),
            _ => 0
        };

        let mut deadlist = ds.deadlist.clone();
        let mut freed = Vec::new();
        for bp in next.deadlist.take().into_entries() {
            if bp.birth <= ds.prev_snap_txg {
                if let Some(p) = prev.as_mut()
                    .filter(|p| p.next_snap == Some(id))
                {
                    if bp.birth > p.prev_snap_txg {
                        p.unique += bp.asize();
                    }
                }
                deadlist.push(bp);
            } else {
                freed.push(bp);
            }
        }
        next.deadlist = deadlist;
        next.prev_snap = ds.prev_snap;
        next.prev_snap_txg = ds.prev_snap_txg;
        if next.is_snapshot() {
            next.unique += after_space;
        } else {
            let shared = prev.as_ref()
                .map(|p| p.used.saturating_sub(next.deadlist.used()))
                .unwrap_or(0);
            next.unique = next.used.saturating_sub(shared);
        }
        if let Some(p) = prev.as_mut().filter(|p| p.next_snap == Some(id)) {
            p.next_snap = Some(next_id);
        }

        self.datasets.insert(next_id, next);
        if let Some(p) = prev {
            self.datasets.insert(p.id, p);
        }
        self.datasets.remove(&id);
        let dir = self.dir_mut(ds.dir)?;
        dir.snapshots.remove(&snapname);
        Self::charge_frees(dir, &freed);
        debug!(name, freed = freed.len(), "destroyed snapshot");
        Ok(freed)
    }

    fn charge_frees(dir: &mut DirPhys, freed: &[BlockPtr]) {
        for bp in freed {
            dir.used = dir.used.saturating_sub(bp.asize());
            dir.compressed = dir.compressed.saturating_sub(u64::from(bp.psize));
            dir.uncompressed =
                dir.uncompressed.saturating_sub(u64::from(bp.lsize));
        }
    }

    pub fn dir(&self, id: DirId) -> Result<&DirPhys> {
        self.dirs.get(&id)
            .ok_or_else(|| Error::Integrity(format!("missing dir {id:?}")))
    }

    fn dir_by_name(&self, name: &str) -> Option<DirId> {
        self.dirs.values().find(|d| d.name == name).map(|d| d.id)
    }

    fn dir_mut(&mut self, id: DirId) -> Result<&mut DirPhys> {
        self.dirs.get_mut(&id)
            .ok_or_else(|| Error::Integrity(format!("missing dir {id:?}")))
    }

    pub fn ds(&self, id: DatasetId) -> Result<&DatasetPhys> {
        self.datasets.get(&id)
            .ok_or_else(|| Error::Integrity(format!("missing dataset {id}")))
    }

    fn ds_mut(&mut self, id: DatasetId) -> Result<&mut DatasetPhys> {
        self.datasets.get_mut(&id)
            .ok_or_else(|| Error::Integrity(format!("missing dataset {id}")))
    }

    /// Every property of a dataset, resolved
    pub fn effective_props(&self, ds: DatasetId) -> Result<EffectiveProps> {
        let dir = self.ds(ds)?.dir;
        self.dir(dir)?;
        Ok(EffectiveProps::resolve(|name| {
            self.get_prop(dir, name).unwrap_or(
                (Property::default_value(name), PropertySource::DEFAULT))
        }))
    }

    /// Look up a property, walking up the tree for inheritable ones
    pub fn get_prop(&self, dir: DirId, name: PropertyName)
        -> Result<(Property, PropertySource)>
    {
        let mut cur = Some(dir);
        let mut level = 0u8;
        while let Some(id) = cur {
            let d = self.dir(id)?;
            if let Some(p) = d.props.get(&name) {
                return Ok((*p, PropertySource(Some(level))));
            }
            if !name.inheritable() {
                break;
            }
            cur = d.parent;
            level = level.saturating_add(1);
        }
        Ok((Property::default_value(name), PropertySource::DEFAULT))
    }

    /// Remove a locally set property
    pub fn inherit_prop(&mut self, dir: DirId, name: PropertyName)
        -> Result<()>
    {
        self.dir_mut(dir)?.props.remove(&name);
        Ok(())
    }

    /// Account for a block that `ds` no longer references.  Returns true if
    /// the block is now free.
    pub fn kill(&mut self, id: DatasetId, bp: &BlockPtr) -> Result<bool> {
        let asize = bp.asize();
        let ds = self.ds_mut(id)?;
        ds.used = ds.used.saturating_sub(asize);
        ds.compressed = ds.compressed.saturating_sub(u64::from(bp.psize));
        ds.uncompressed = ds.uncompressed.saturating_sub(u64::from(bp.lsize));
        if bp.birth > ds.prev_snap_txg {
            ds.unique = ds.unique.saturating_sub(asize);
            let dir = ds.dir;
            Self::charge_frees(self.dir_mut(dir)?, std::slice::from_ref(bp));
            Ok(true)
        } else {
            ds.deadlist.push(*bp);
            if let Some(prev) = ds.prev_snap {
                let p = self.ds_mut(prev)?;
                if p.next_snap == Some(id) && bp.birth > p.prev_snap_txg {
                    p.unique += asize;
                }
            }
            Ok(false)
        }
    }

    /// Every dataset name, heads and snapshots, sorted
    pub fn list(&self) -> Vec<String> {
        self.datasets.keys()
            .filter_map(|id| self.name(*id).ok())
            .sorted()
            .collect()
    }

    /// Find a dataset by name.  Snapshots are named `dataset@snapshot`.
    pub fn lookup(&self, name: &str) -> Result<DatasetId> {
        let notfound = || Error::DatasetNotFound(name.to_string());
        let (dirname, snap) = match name.split_once('@') {
            Some((d, s)) => (d, Some(s)),
            None => (name, None)
        };
        let dir = self.dir_by_name(dirname)
            .and_then(|id| self.dirs.get(&id))
            .ok_or_else(notfound)?;
        match snap {
            Some(s) => dir.snapshots.get(s).cloned().ok_or_else(notfound),
            None => Ok(dir.head)
        }
    }

    pub fn name(&self, id: DatasetId) -> Result<String> {
        let ds = self.ds(id)?;
        let dir = self.dir(ds.dir)?;
        Ok(match &ds.snapname {
            Some(s) => format!("{}@{}", dir.name, s),
            None => dir.name.clone()
        })
    }

    /// A new, empty graph with only the root dataset
    pub fn new(pool_name: &str, txg: TxgT, time: u64) -> Self {
        let dir = DirId(1);
        let head = DatasetId(2);
        let mut g = Graph {
            datasets: BTreeMap::new(),
            dirs: BTreeMap::new(),
            next_id: 3,
            root: dir
        };
        g.dirs.insert(dir, DirPhys {
            id: dir,
            name: pool_name.to_string(),
            parent: None,
            head,
            origin: None,
            used: 0,
            compressed: 0,
            uncompressed: 0,
            props: BTreeMap::new(),
            snapshots: BTreeMap::new(),
            children: BTreeSet::new()
        });
        g.datasets.insert(head, Self::empty_head(head, dir, txg, time, None));
        g
    }

    fn empty_head(id: DatasetId, dir: DirId, txg: TxgT, time: u64,
                  guid: Option<u64>) -> DatasetPhys
    {
        DatasetPhys {
            id,
            dir,
            snapname: None,
            creation_txg: txg,
            creation_time: time,
            guid: guid.unwrap_or_else(|| Uuid::new_v4().as_u64()),
            root: None,
            used: 0,
            compressed: 0,
            uncompressed: 0,
            unique: 0,
            prev_snap: None,
            prev_snap_txg: TxgT(0),
            next_snap: None,
            deadlist: Deadlist::default(),
            num_children: 0,
            clones: BTreeSet::new()
        }
    }

    fn new_head(&mut self, name: &str, props: &[Property], txg: TxgT,
                time: u64, guid: Option<u64>) -> Result<(DirId, DatasetId)>
    {
        let parent = self.parent_for(name)?;
        let dir = DirId(self.next_id);
        let id = DatasetId(self.next_id + 1);
        self.next_id += 2;
        let mut dp = DirPhys {
            id: dir,
            name: name.to_string(),
            parent: Some(parent),
            head: id,
            origin: None,
            used: 0,
            compressed: 0,
            uncompressed: 0,
            props: BTreeMap::new(),
            snapshots: BTreeMap::new(),
            children: BTreeSet::new()
        };
        for p in props {
            dp.props.insert(p.name(), *p);
        }
        self.dirs.insert(dir, dp);
        self.dir_mut(parent)?.children.insert(dir);
        self.datasets.insert(id, Self::empty_head(id, dir, txg, time, guid));
        Ok((dir, id))
    }

    /// Validate a new directory name and find its parent
    fn parent_for(&self, name: &str) -> Result<DirId> {
        if self.lookup(name).is_ok() {
            return Err(Error::Exists(name.to_string()));
        }
        let Some((parent, last)) = name.rsplit_once('/') else {
            return Err(Error::InvalidArgument(format!(
                "{name} is outside of the pool")));
        };
        check_component(last)?;
        if parent.contains('@') {
            return Err(Error::InvalidArgument(name.to_string()));
        }
        self.dir_by_name(parent)
            .ok_or_else(|| Error::DatasetNotFound(parent.to_string()))
    }

    /// Move a clone's origin chain into the clone's own directory, so that
    /// the old origin's head becomes a clone instead.
    #[tracing::instrument(skip(self))]
    pub fn promote(&mut self, clone: DatasetId) -> Result<()> {
        let name = self.name(clone)?;
        let c = self.ds(clone)?;
        if c.is_snapshot() {
            return Err(Error::NotAClone(name));
        }
        let dc = self.dir(c.dir)?.clone();
        let origin = dc.origin.ok_or_else(|| Error::NotAClone(name.clone()))?;
        let o = self.ds(origin)?.clone();
        let d_o = self.dir(o.dir)?.clone();

        // The origin's snapshots, newest first, back to its own branch point
        let mut chain = Vec::new();
        let mut cur = Some(origin);
        while let Some(id) = cur {
            let s = self.ds(id)?;
            if s.dir != o.dir {
                break;
            }
            chain.push(id);
            cur = s.prev_snap;
        }
        for id in chain.iter() {
            let snapname = self.ds(*id)?.snapname.clone().unwrap_or_default();
            if dc.snapshots.contains_key(&snapname) {
                return Err(Error::Exists(format!("{}@{}", dc.name, snapname)));
            }
        }

        // The clone's earliest snapshot, or the clone itself, is the
        // origin's new successor.
        let newnext = dc.snapshots.values()
            .map(|id| self.ds(*id))
            .collect::<Result<Vec<_>>>()?
            .into_iter()
            .min_by_key(|s| s.creation_txg)
            .map(|s| s.id)
            .unwrap_or(clone);
        let unique = self.ds(newnext)?.deadlist
            .space_range(o.prev_snap_txg, TxgT(u64::MAX));

        // Space born in the chain: the origin's referenced space, plus
        // everything the chain killed, minus what was inherited from the
        // origin's own origin.
        let (mut used, mut comp, mut uncomp) =
            (o.used, o.compressed, o.uncompressed);
        for id in chain.iter() {
            let s = self.ds(*id)?;
            if s.prev_snap.is_some() {
                used += s.deadlist.used();
                comp += s.deadlist.compressed();
                uncomp += s.deadlist.uncompressed();
            }
        }
        if let Some(oo) = d_o.origin {
            let oo = self.ds(oo)?;
            used = used.saturating_sub(oo.used);
            comp = comp.saturating_sub(oo.compressed);
            uncomp = uncomp.saturating_sub(oo.uncompressed);
        }
        let quota = self.get_prop(dc.id, PropertyName::Quota)?.0.as_u64();
        if quota > 0 && dc.used + used > quota {
            return Err(Error::QuotaExceeded(dc.name.clone()));
        }

        for id in chain.iter() {
            let s = self.ds_mut(*id)?;
            s.dir = dc.id;
            let snapname = s.snapname.clone().unwrap_or_default();
            self.dir_mut(d_o.id)?.snapshots.remove(&snapname);
            self.dir_mut(dc.id)?.snapshots.insert(snapname, *id);
        }
        {
            let o = self.ds_mut(origin)?;
            o.next_snap = Some(newnext);
            o.unique = unique;
            o.clones.remove(&clone);
            o.clones.insert(d_o.head);
        }
        if let Some(oo) = d_o.origin {
            let oo = self.ds_mut(oo)?;
            oo.clones.remove(&d_o.head);
            oo.clones.insert(clone);
        }
        {
            let dir = self.dir_mut(dc.id)?;
            dir.origin = d_o.origin;
            dir.used += used;
            dir.compressed += comp;
            dir.uncompressed += uncomp;
        }
        {
            let dir = self.dir_mut(d_o.id)?;
            dir.origin = Some(origin);
            dir.used = dir.used.saturating_sub(used);
            dir.compressed = dir.compressed.saturating_sub(comp);
            dir.uncompressed = dir.uncompressed.saturating_sub(uncomp);
        }
        debug!(name, moved = chain.len(), used, "promoted");
        Ok(())
    }

    /// Rename a directory, with its descendants and snapshots, or rename a
    /// single snapshot.
    #[tracing::instrument(skip(self))]
    pub fn rename(&mut self, old: &str, new: &str) -> Result<()> {
        if let Some((dsname, snap)) = old.split_once('@') {
            let Some((newds, newsnap)) = new.split_once('@') else {
                return Err(Error::InvalidArgument(new.to_string()));
            };
            if newds != dsname {
                return Err(Error::InvalidArgument(format!(
                    "can't move snapshot {old} to another dataset")));
            }
            check_component(newsnap)?;
            let id = self.lookup(old)?;
            if self.lookup(new).is_ok() {
                return Err(Error::Exists(new.to_string()));
            }
            let dir = self.ds(id)?.dir;
            let dir = self.dir_mut(dir)?;
            dir.snapshots.remove(snap);
            dir.snapshots.insert(newsnap.to_string(), id);
            self.ds_mut(id)?.snapname = Some(newsnap.to_string());
            return Ok(());
        }
        let id = self.lookup(old)?;
        let dir = self.ds(id)?.dir;
        let old_parent = self.dir(dir)?.parent.ok_or_else(|| {
            Error::InvalidArgument(format!("can't rename {old}"))
        })?;
        if new.starts_with(&format!("{old}/")) {
            return Err(Error::InvalidArgument(format!(
                "can't move {old} beneath itself")));
        }
        let new_parent = self.parent_for(new)?;
        let prefix = format!("{old}/");
        for d in self.dirs.values_mut() {
            if d.name == old || d.name.starts_with(&prefix) {
                d.name = format!("{}{}", new, &d.name[old.len()..]);
            }
        }
        if new_parent != old_parent {
            self.dir_mut(old_parent)?.children.remove(&dir);
            self.dir_mut(new_parent)?.children.insert(dir);
            self.dir_mut(dir)?.parent = Some(new_parent);
        }
        Ok(())
    }

    /// Space promised by reservations but not yet used, over every directory
    /// except `except`.
    pub fn reservation_shortfall(&self, except: Option<DirId>) -> u64 {
        self.dirs.values()
            .filter(|d| Some(d.id) != except)
            .map(|d| {
                let r = d.props.get(&PropertyName::Reservation)
                    .map(Property::as_u64)
                    .unwrap_or(0);
                r.saturating_sub(d.used)
            }).sum()
    }

    /// Make the head identical to `target`, its most recent snapshot.  With
    /// `force`, later snapshots are destroyed first.
    ///
    /// `frees` must be every block of the head's tree born after `target`.
    /// Returns every block that is now free.
    #[tracing::instrument(skip(self, frees))]
    pub fn rollback(&mut self, head: DatasetId, target: DatasetId,
                    force: bool, frees: Vec<BlockPtr>)
        -> Result<Vec<BlockPtr>>
    {
        let h = self.ds(head)?;
        if h.is_snapshot() {
            return Err(Error::InvalidArgument(format!(
                "{} is a snapshot", self.name(head)?)));
        }
        let t = self.ds(target)?.clone();
        if !t.is_snapshot() {
            return Err(Error::NotASnapshot(self.name(target)?));
        }
        if t.dir != h.dir {
            return Err(Error::InvalidArgument(format!(
                "{} is not a snapshot of {}", self.name(target)?,
                self.name(head)?)));
        }
        let mut later = self.snapshots(t.dir)?
            .into_iter()
            .map(|id| self.ds(id).map(|s| (s.creation_txg, id)))
            .collect::<Result<Vec<_>>>()?
            .into_iter()
            .filter(|(txg, _)| *txg > t.creation_txg)
            .collect::<Vec<_>>();
        if !later.is_empty() && !force {
            return Err(Error::HasLaterSnapshots(self.name(target)?));
        }
        let mut freed = Vec::new();
        later.sort();
        for (_, id) in later.into_iter().rev() {
            freed.extend(self.destroy_snapshot(id)?);
        }
        {
            let h = self.ds_mut(head)?;
            h.root = t.root;
            h.used = t.used;
            h.compressed = t.compressed;
            h.uncompressed = t.uncompressed;
            h.unique = 0;
            h.deadlist = Deadlist::default();
        }
        self.ds_mut(target)?.unique = 0;
        Self::charge_frees(self.dir_mut(t.dir)?, &frees);
        freed.extend(frees);
        Ok(freed)
    }

    pub fn root_dir(&self) -> DirId {
        self.root
    }

    pub fn set_prop(&mut self, dir: DirId, prop: Property) -> Result<()> {
        self.dir_mut(dir)?.props.insert(prop.name(), prop);
        Ok(())
    }

    pub fn set_root(&mut self, ds: DatasetId, root: Option<BlockPtr>)
        -> Result<()>
    {
        self.ds_mut(ds)?.root = root;
        Ok(())
    }

    /// Freeze the head's current state as a new snapshot.  The head's objset
    /// must already be synced for `txg`.
    #[tracing::instrument(skip(self))]
    pub fn snapshot(&mut self, head: DatasetId, snapname: &str, txg: TxgT,
                    time: u64, guid: Option<u64>) -> Result<DatasetId>
    {
        check_component(snapname)?;
        let h = self.ds(head)?.clone();
        if h.is_snapshot() {
            return Err(Error::InvalidArgument(format!(
                "{} is a snapshot", self.name(head)?)));
        }
        let dirname = self.dir(h.dir)?.name.clone();
        if self.dir(h.dir)?.snapshots.contains_key(snapname) {
            return Err(Error::Exists(format!("{dirname}@{snapname}")));
        }
        let id = DatasetId(self.next_id);
        self.next_id += 1;
        let snap = DatasetPhys {
            id,
            dir: h.dir,
            snapname: Some(snapname.to_string()),
            creation_txg: txg,
            creation_time: time,
            guid: guid.unwrap_or_else(|| Uuid::new_v4().as_u64()),
            root: h.root,
            used: h.used,
            compressed: h.compressed,
            uncompressed: h.uncompressed,
            // Everything is still shared with the head
            unique: 0,
            prev_snap: h.prev_snap,
            prev_snap_txg: h.prev_snap_txg,
            next_snap: Some(head),
            deadlist: h.deadlist.clone(),
            num_children: 1,
            clones: BTreeSet::new()
        };
        if let Some(prev) = h.prev_snap {
            let p = self.ds_mut(prev)?;
            if p.next_snap == Some(head) {
                p.next_snap = Some(id);
            }
        }
        {
            let h = self.ds_mut(head)?;
            h.prev_snap = Some(id);
            h.prev_snap_txg = txg;
            h.unique = 0;
            h.deadlist = Deadlist::default();
        }
        self.datasets.insert(id, snap);
        self.dir_mut(h.dir)?.snapshots.insert(snapname.to_string(), id);
        Ok(id)
    }

    /// Snapshots of a directory, oldest first
    pub fn snapshots(&self, dir: DirId) -> Result<Vec<DatasetId>> {
        let d = self.dir(dir)?;
        let mut snaps = d.snapshots.values()
            .map(|id| self.ds(*id).map(|s| (s.creation_txg, *id)))
            .collect::<Result<Vec<_>>>()?;
        snaps.sort();
        Ok(snaps.into_iter().map(|(_, id)| id).collect())
    }

    pub fn stats(&self, id: DatasetId) -> Result<DatasetStats> {
        let ds = self.ds(id)?;
        let dir = self.dir(ds.dir)?;
        Ok(DatasetStats {
            name: self.name(id)?,
            id,
            guid: ds.guid,
            creation_txg: ds.creation_txg,
            creation_time: ds.creation_time,
            used: ds.used,
            compressed: ds.compressed,
            uncompressed: ds.uncompressed,
            unique: ds.unique,
            dir_used: dir.used,
            is_snapshot: ds.is_snapshot(),
            origin: dir.origin.map(|o| self.name(o)).transpose()?,
            prev_snap: ds.prev_snap.map(|p| self.name(p)).transpose()?,
            clones: ds.clones.iter()
                .map(|c| self.name(*c))
                .collect::<Result<Vec<_>>>()?,
        })
    }
}

// LCOV_EXCL_STOP
