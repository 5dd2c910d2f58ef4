// vim: tw=80
//! The object store
//!
//! An `Objset` is one dataset's table of objects.  Each object is a sparse
//! byte array stored as a tree of indirect blocks over fixed-size data blocks.
//! All modifications are tagged with a txg and become durable only when that
//! txg syncs.

use crate::{
    dbuf::{BlockData, HoldMode},
    types::*,
    util::*,
    zio::{BlockPtr, BlockType, WriteProps, Zio},
};
use futures::{
    FutureExt,
    future::{BoxFuture, try_join_all}
};
use serde_derive::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{Arc, Mutex}
};
use tracing::{debug, trace};

mod dnode;

pub use self::dnode::{Dnode, DnodePhys, DnodeSync};

/// Child pointers per indirect block
pub const INDIRECT_FANOUT: usize = 128;

/// Smallest allowed object block size
pub const MIN_BLOCK_SIZE: u32 = 4096;
/// Largest allowed object block size
pub const MAX_BLOCK_SIZE: u32 = 1 << 20;

/// No object may extend past this many bytes
pub const MAX_OBJECT_SIZE: u64 = 1 << 62;

/// End of the range `offset..offset + len`, if it lies within the largest
/// possible object.
pub fn range_end(offset: u64, len: u64) -> Result<u64> {
    offset.checked_add(len)
        .filter(|end| *end <= MAX_OBJECT_SIZE)
        .ok_or_else(|| Error::InvalidArgument(
            format!("range {offset}+{len} exceeds the largest object size")))
}

/// The one object of a volume
pub const VOLUME_OBJECT: ObjectId = 1;

/// What an objset is for.  Snapshots and clones keep their origin's kind.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub enum ObjsetKind {
    /// Any number of objects, for a filesystem layered on top
    #[default]
    Filesystem,
    /// A block device, stored as [`VOLUME_OBJECT`].  The object's size is
    /// the device's size.
    Volume,
}

/// On-disk contents of an objset block
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ObjsetPhys {
    pub kind: ObjsetKind,
    pub dnodes: BTreeMap<ObjectId, DnodePhys>,
    /// Lowest id that `create_object` will consider
    pub next_object: ObjectId,
}

impl ObjsetPhys {
    /// A new, entirely sparse volume
    pub fn volume(size: u64, block_size: u32) -> Self {
        let mut dnode = DnodePhys::new(block_size);
        dnode.size = size;
        ObjsetPhys {
            kind: ObjsetKind::Volume,
            dnodes: BTreeMap::from([(VOLUME_OBJECT, dnode)]),
            next_object: VOLUME_OBJECT + 1
        }
    }

    /// Write out as an objset block
    pub async fn write(&self, zio: &Zio, props: &WriteProps, txg: TxgT)
        -> Result<Option<BlockPtr>>
    {
        let buf = bincode::serialize(self)?;
        zio.write_block(&buf, props, BlockType::Objset, txg).await
    }
}

impl Default for ObjsetPhys {
    fn default() -> Self {
        ObjsetPhys {
            kind: ObjsetKind::Filesystem,
            dnodes: BTreeMap::new(),
            next_object: 1
        }
    }
}

/// Return value of [`Objset::object_info`]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ObjectInfo {
    pub size: u64,
    pub block_size: u32,
    pub nlevels: u8,
}

/// An immutable capture of part of an object
#[derive(Clone, Debug)]
pub struct RangeView {
    offset: u64,
    len: usize,
    block_size: u64,
    blocks: Vec<BlockData>,
}

impl RangeView {
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Copy the captured range out
    pub fn read(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.len];
        if self.len == 0 {
            return out;
        }
        let bs = self.block_size;
        let first = self.offset / bs;
        let end = self.offset + self.len as u64;
        for (i, block) in self.blocks.iter().enumerate() {
            let bstart = (first + i as u64) * bs;
            let s = self.offset.max(bstart);
            let e = end.min(bstart + bs);
            let dst = &mut out[(s - self.offset) as usize..
                               (e - self.offset) as usize];
            block.copy_to((s - bstart) as usize, dst);
        }
        out
    }
}

/// Changes made to an objset in one txg
#[derive(Clone, Default)]
struct ObjsetDirty {
    dnodes: BTreeMap<ObjectId, Arc<Dnode>>,
    freed: BTreeSet<ObjectId>,
    next_object: ObjectId,
}

/// The result of syncing one objset, to be installed once its txg is durable
pub struct ObjsetSync {
    pub bp: Option<BlockPtr>,
    /// Every block written, including the objset block itself
    pub born: Vec<BlockPtr>,
    /// Every block superseded or freed
    pub killed: Vec<BlockPtr>,
    pub phys: ObjsetPhys,
    dnodes: Vec<(Arc<Dnode>, DnodeSync)>,
}

struct ObjsetInner {
    committed: ObjsetPhys,
    bp: Option<BlockPtr>,
    /// Every live object, including ones not yet synced
    dnodes: BTreeMap<ObjectId, Arc<Dnode>>,
    next_object: ObjectId,
    dirty: BTreeMap<TxgT, ObjsetDirty>,
}

impl ObjsetInner {
    fn dirty(&mut self, txg: TxgT) -> &mut ObjsetDirty {
        self.dirty.entry(txg).or_default()
    }
}

pub struct Objset {
    ds: DatasetId,
    zio: Zio,
    readonly: bool,
    inner: Mutex<ObjsetInner>,
    /// Taken exclusively to change a volume's size, and shared to write it
    geometry: futures_locks::RwLock<()>,
}

impl Objset {
    /// Hold the first and last blocks of a range that will be partially
    /// overwritten, so that a later `write` needn't wait for them.
    pub async fn hold_for_write(&self, object: ObjectId, offset: u64,
                                len: u64) -> Result<()>
    {
        let dnode = self.dnode(object)?;
        if len == 0 {
            return Ok(());
        }
        let end = range_end(offset, len)?;
        let bs = dnode.block_size() as u64;
        let mut partial = BTreeSet::new();
        if offset % bs != 0 {
            partial.insert(offset / bs);
        }
        if end % bs != 0 {
            partial.insert(end / bs);
        }
        let holds = partial.into_iter()
            .map(|blkid| dnode.hold(0, blkid, HoldMode::Read))
            .collect::<Vec<_>>();
        try_join_all(holds).await?;
        Ok(())
    }

    pub(crate) fn check_block_size(block_size: u32) -> Result<()> {
        if block_size.is_power_of_two() &&
            (MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&block_size)
        {
            Ok(())
        } else {
            Err(Error::InvalidArgument(
                format!("block size {block_size}")))
        }
    }

    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            Err(Error::ReadOnly(format!("dataset {}", self.ds)))
        } else {
            Ok(())
        }
    }

    /// Create an object with a specific id
    pub fn claim_object(&self, txg: TxgT, object: ObjectId, block_size: u32)
        -> Result<()>
    {
        self.check_writable()?;
        Self::check_block_size(block_size)?;
        if object == 0 {
            return Err(Error::InvalidArgument("object 0".to_string()));
        }
        let mut g = self.inner.lock().unwrap();
        if g.dnodes.contains_key(&object) {
            return Err(Error::Exists(format!("object {object}")));
        }
        self.insert_dnode(&mut g, txg, object, block_size);
        if object >= g.next_object {
            g.next_object = object + 1;
        }
        let next = g.next_object;
        let d = g.dirty(txg);
        d.next_object = d.next_object.max(next);
        Ok(())
    }

    /// Committed contents of the objset block
    pub fn committed(&self) -> ObjsetPhys {
        self.inner.lock().unwrap().committed.clone()
    }

    /// Create an object with the lowest free id
    pub fn create_object(&self, txg: TxgT, block_size: u32)
        -> Result<ObjectId>
    {
        self.check_writable()?;
        Self::check_block_size(block_size)?;
        let mut g = self.inner.lock().unwrap();
        let mut object = g.next_object;
        while g.dnodes.contains_key(&object) {
            object += 1;
        }
        self.insert_dnode(&mut g, txg, object, block_size);
        g.next_object = object + 1;
        let next = g.next_object;
        let d = g.dirty(txg);
        d.next_object = d.next_object.max(next);
        Ok(object)
    }

    pub fn ds(&self) -> DatasetId {
        self.ds
    }

    fn dnode(&self, object: ObjectId) -> Result<Arc<Dnode>> {
        self.inner.lock().unwrap()
            .dnodes.get(&object)
            .cloned()
            .ok_or(Error::ObjectNotFound(object))
    }

    /// Drop every clean buffer of every object
    pub fn evict_idle(&self) {
        let dnodes = self.inner.lock().unwrap()
            .dnodes.values()
            .cloned()
            .collect::<Vec<_>>();
        for dnode in dnodes {
            dnode.evict_idle();
        }
    }

    /// Remove an object.  Its blocks die when `txg` syncs.
    pub fn free_object(&self, txg: TxgT, object: ObjectId) -> Result<()> {
        self.check_writable()?;
        let mut g = self.inner.lock().unwrap();
        if g.dnodes.remove(&object).is_none() {
            return Err(Error::ObjectNotFound(object));
        }
        let d = g.dirty(txg);
        d.dnodes.remove(&object);
        d.freed.insert(object);
        Ok(())
    }

    /// Punch a hole.
    ///
    /// Blocks entirely within the range become holes.  Partially covered
    /// blocks get zeros.  A range that reaches the end of the object frees
    /// the whole last block.  The size does not change.
    pub async fn free_range(&self, txg: TxgT, object: ObjectId, offset: u64,
                            len: u64) -> Result<()>
    {
        self.check_writable()?;
        let dnode = self.dnode(object)?;
        let size = dnode.info().size;
        if len == 0 || offset >= size {
            return Ok(());
        }
        let bs = dnode.block_size() as u64;
        let end = if offset.saturating_add(len) >= size {
            div_roundup(size, bs) * bs
        } else {
            offset + len
        };
        let first = offset / bs;
        let last = (end - 1) / bs;
        let mut holds = Vec::new();
        for blkid in first..=last {
            let bstart = blkid * bs;
            let full = offset <= bstart && end >= bstart + bs;
            let mode = if full { HoldMode::Fill } else { HoldMode::Read };
            holds.push((full, dnode.hold(0, blkid, mode).await?));
        }
        for (i, (full, h)) in holds.iter().enumerate() {
            let bstart = (first + i as u64) * bs;
            if *full {
                h.punch(txg);
            } else {
                let s = offset.max(bstart);
                let e = end.min(bstart + bs);
                h.write(txg, (s - bstart) as usize,
                        &vec![0u8; (e - s) as usize]);
            }
        }
        drop(holds);
        dnode.note_dirty(txg, first..=last, 0);
        self.mark_dirty(txg, &dnode);
        Ok(())
    }

    /// Capture the current contents of a range.
    ///
    /// The range is clipped to the object's size.  Later writes, even after
    /// they sync, do not change what the view returns.
    pub async fn hold_range(&self, object: ObjectId, offset: u64, len: u64)
        -> Result<RangeView>
    {
        let dnode = self.dnode(object)?;
        let info = dnode.info();
        let bs = info.block_size as u64;
        let len = len.min(info.size.saturating_sub(offset));
        if len == 0 {
            return Ok(RangeView{offset, len: 0, block_size: bs,
                                blocks: Vec::new()});
        }
        let first = offset / bs;
        let last = (offset + len - 1) / bs;
        let holds = (first..=last)
            .map(|blkid| dnode.hold(0, blkid, HoldMode::Read))
            .collect::<Vec<_>>();
        let blocks = try_join_all(holds).await?
            .iter()
            .map(|h| h.payload())
            .collect::<Vec<_>>();
        Ok(RangeView {
            offset,
            len: len as usize,
            block_size: bs,
            blocks
        })
    }

    fn insert_dnode(&self, g: &mut ObjsetInner, txg: TxgT, object: ObjectId,
                    block_size: u32)
    {
        let dnode = Arc::new(Dnode::new(object, self.zio.clone(),
                                        DnodePhys::new(block_size)));
        dnode.note_dirty(txg, [], 0);
        g.dnodes.insert(object, dnode.clone());
        g.dirty(txg).dnodes.insert(object, dnode);
    }

    /// Retire the dirty state of `txg`, which is now durable
    pub fn install(&self, txg: TxgT, s: ObjsetSync) {
        for (dnode, ds) in s.dnodes.into_iter() {
            dnode.install(txg, ds);
        }
        let mut g = self.inner.lock().unwrap();
        g.committed = s.phys;
        g.bp = s.bp;
        g.dirty.remove(&txg);
    }

    pub fn is_dirty(&self, txg: TxgT) -> bool {
        self.inner.lock().unwrap().dirty.contains_key(&txg)
    }

    pub fn geometry(&self) -> &futures_locks::RwLock<()> {
        &self.geometry
    }

    pub fn kind(&self) -> ObjsetKind {
        self.inner.lock().unwrap().committed.kind
    }

    fn mark_dirty(&self, txg: TxgT, dnode: &Arc<Dnode>) {
        let mut g = self.inner.lock().unwrap();
        g.dirty(txg).dnodes.insert(dnode.object(), dnode.clone());
    }

    pub fn object_info(&self, object: ObjectId) -> Result<ObjectInfo> {
        Ok(self.dnode(object)?.info())
    }

    /// Ids of every live object
    pub fn objects(&self) -> Vec<ObjectId> {
        self.inner.lock().unwrap().dnodes.keys().cloned().collect()
    }

    /// Open the objset rooted at `root`.  `None` is an empty objset.
    pub async fn open(zio: Zio, ds: DatasetId, root: Option<BlockPtr>,
                      readonly: bool) -> Result<Arc<Self>>
    {
        let committed = match root {
            Some(bp) => {
                let dbs = zio.read_block(&bp).await?;
                bincode::deserialize::<ObjsetPhys>(&frozen(&dbs)[..])?
            },
            None => ObjsetPhys::default()
        };
        let dnodes = committed.dnodes.iter()
            .map(|(id, phys)| {
                (*id, Arc::new(Dnode::new(*id, zio.clone(), phys.clone())))
            }).collect();
        let inner = ObjsetInner {
            next_object: committed.next_object,
            committed,
            bp: root,
            dnodes,
            dirty: BTreeMap::new()
        };
        trace!(%ds, ?root, "open objset");
        Ok(Arc::new(Objset {
            ds,
            zio,
            readonly,
            inner: Mutex::new(inner),
            geometry: futures_locks::RwLock::new(())
        }))
    }

    /// Read part of an object.  Reads past the end are truncated.
    pub async fn read(&self, object: ObjectId, offset: u64, len: u64)
        -> Result<Vec<u8>>
    {
        Ok(self.hold_range(object, offset, len).await?.read())
    }

    pub fn root_bp(&self) -> Option<BlockPtr> {
        self.inner.lock().unwrap().bp
    }

    /// Write out everything that `txg` dirtied, ending with a new objset
    /// block.  Returns `None` if `txg` didn't touch this objset.
    #[tracing::instrument(skip(self, props), fields(ds = %self.ds))]
    pub async fn sync(&self, txg: TxgT, props: &WriteProps)
        -> Result<Option<ObjsetSync>>
    {
        let (dirty, committed, old_bp) = {
            let g = self.inner.lock().unwrap();
            let Some(dirty) = g.dirty.get(&txg).cloned() else {
                return Ok(None);
            };
            (dirty, g.committed.clone(), g.bp)
        };
        let mut out = ObjsetSync {
            bp: None,
            born: Vec::new(),
            killed: Vec::new(),
            phys: committed.clone(),
            dnodes: Vec::new()
        };
        let r = self.sync_blocks(txg, props, dirty, &committed, &mut out)
            .await;
        if let Err(e) = r {
            for bp in out.born.iter() {
                for dva in bp.dvas() {
                    self.zio.pool().release(dva);
                }
            }
            return Err(e);
        }
        out.killed.extend(old_bp);
        debug!(born = out.born.len(), killed = out.killed.len(),
               "objset synced");
        Ok(Some(out))
    }

    async fn sync_blocks(&self, txg: TxgT, props: &WriteProps,
                         dirty: ObjsetDirty, committed: &ObjsetPhys,
                         out: &mut ObjsetSync) -> Result<()>
    {
        for object in dirty.freed.iter() {
            if let Some(root) = committed.dnodes.get(object)
                .and_then(|p| p.root)
            {
                let killed = &mut out.killed;
                let mut visitor = |bp: &BlockPtr| {
                    killed.push(*bp);
                    Ok(())
                };
                traverse(&self.zio, root, TxgT(0), &mut visitor).await?;
            }
            out.phys.dnodes.remove(object);
        }
        for (object, dnode) in dirty.dnodes.into_iter() {
            if let Some(s) = dnode.sync(txg, props).await? {
                out.born.extend_from_slice(&s.born);
                out.killed.extend_from_slice(&s.killed);
                out.phys.dnodes.insert(object, s.phys.clone());
                out.dnodes.push((dnode, s));
            }
        }
        out.phys.next_object = committed.next_object.max(dirty.next_object);
        out.bp = out.phys.write(&self.zio, props, txg).await?;
        out.born.extend(out.bp);
        Ok(())
    }

    /// Shrink or grow an object to exactly `size` bytes
    pub async fn truncate(&self, txg: TxgT, object: ObjectId, size: u64)
        -> Result<()>
    {
        self.check_writable()?;
        let dnode = self.dnode(object)?;
        range_end(size, 0)?;
        let old = dnode.info().size;
        if size < old {
            self.free_range(txg, object, size, old - size).await?;
        }
        dnode.set_size(txg, size);
        self.mark_dirty(txg, &dnode);
        Ok(())
    }

    /// Write `data` at `offset`.
    ///
    /// Every affected buffer is held before any of them is dirtied, so an
    /// error leaves the object unchanged.
    pub async fn write(&self, txg: TxgT, object: ObjectId, offset: u64,
                       data: &[u8]) -> Result<()>
    {
        self.check_writable()?;
        let dnode = self.dnode(object)?;
        if data.is_empty() {
            return Ok(());
        }
        let end = range_end(offset, data.len() as u64)?;
        let bs = dnode.block_size() as u64;
        let first = offset / bs;
        let last = (end - 1) / bs;
        let holds = (first..=last).map(|blkid| {
            let bstart = blkid * bs;
            let mode = if offset <= bstart && end >= bstart + bs {
                HoldMode::Fill
            } else {
                HoldMode::Read
            };
            dnode.hold(0, blkid, mode)
        }).collect::<Vec<_>>();
        let holds = try_join_all(holds).await?;
        for (i, h) in holds.iter().enumerate() {
            let bstart = (first + i as u64) * bs;
            let s = offset.max(bstart);
            let e = end.min(bstart + bs);
            h.write(txg, (s - bstart) as usize,
                    &data[(s - offset) as usize..(e - offset) as usize]);
        }
        drop(holds);
        dnode.note_dirty(txg, first..=last, end);
        self.mark_dirty(txg, &dnode);
        Ok(())
    }
}

/// Visit every block pointer under `bp` born after `min_txg`, children before
/// parents.  `bp` itself is visited last.
pub fn traverse<'a, F>(zio: &'a Zio, bp: BlockPtr, min_txg: TxgT,
                       visitor: &'a mut F) -> BoxFuture<'a, Result<()>>
    where F: FnMut(&BlockPtr) -> Result<()> + Send
{
    async move {
        if bp.birth <= min_txg {
            return Ok(());
        }
        match bp.btype {
            BlockType::Indirect => {
                let dbs = zio.read_block(&bp).await?;
                let children: Vec<Option<BlockPtr>> =
                    bincode::deserialize(&frozen(&dbs)[..])?;
                for child in children.into_iter().flatten() {
                    traverse(zio, child, min_txg, &mut *visitor).await?;
                }
            },
            BlockType::Objset => {
                let dbs = zio.read_block(&bp).await?;
                let phys: ObjsetPhys = bincode::deserialize(&frozen(&dbs)[..])?;
                for root in phys.dnodes.values().filter_map(|p| p.root) {
                    traverse(zio, root, min_txg, &mut *visitor).await?;
                }
            },
            BlockType::Data | BlockType::Mos => ()
        }
        visitor(&bp)
    }.boxed()
}

// LCOV_EXCL_START
#[cfg(test)]
mod t {
    use super::*;
    use crate::zio::t::harness;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    /// Sync and install one txg, returning what was born and killed
    async fn sync(os: &Objset, txg: TxgT) -> (Vec<BlockPtr>, Vec<BlockPtr>) {
        let s = os.sync(txg, &WriteProps::default()).await.unwrap().unwrap();
        let r = (s.born.clone(), s.killed.clone());
        os.install(txg, s);
        r
    }

    async fn empty(zio: &Zio) -> Arc<Objset> {
        Objset::open(zio.clone(), DatasetId(1), None, false).await.unwrap()
    }

    #[tokio::test]
    async fn create_and_claim() {
        let (zio, _) = harness(1, false);
        let os = empty(&zio).await;
        assert_eq!(os.create_object(TxgT(2), 4096).unwrap(), 1);
        os.claim_object(TxgT(2), 2, 8192).unwrap();
        assert_eq!(os.create_object(TxgT(2), 4096).unwrap(), 3);
        assert!(matches!(os.claim_object(TxgT(2), 2, 4096),
                         Err(Error::Exists(_))));
        assert!(matches!(os.claim_object(TxgT(2), 0, 4096),
                         Err(Error::InvalidArgument(_))));
        assert_eq!(os.objects(), vec![1, 2, 3]);
        assert_eq!(os.object_info(2).unwrap(),
            ObjectInfo{size: 0, block_size: 8192, nlevels: 1});
    }

    #[rstest]
    #[case(0)]
    #[case(2048)]
    #[case(12288)]
    #[case(2 << 20)]
    fn bad_block_size(#[case] bs: u32) {
        assert!(matches!(Objset::check_block_size(bs),
                         Err(Error::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn missing_object() {
        let (zio, _) = harness(1, false);
        let os = empty(&zio).await;
        assert_eq!(os.read(7, 0, 10).await.unwrap_err(),
                   Error::ObjectNotFound(7));
        assert_eq!(os.free_object(TxgT(2), 7).unwrap_err(),
                   Error::ObjectNotFound(7));
    }

    #[tokio::test]
    async fn readonly() {
        let (zio, _) = harness(1, false);
        let os = Objset::open(zio, DatasetId(1), None, true).await.unwrap();
        assert!(matches!(os.create_object(TxgT(2), 4096),
                         Err(Error::ReadOnly(_))));
    }

    /// A volume's objset starts out with one sparse object, and stays a
    /// volume across syncs
    #[tokio::test]
    async fn volume() {
        let (zio, _) = harness(1, false);
        let phys = ObjsetPhys::volume(1 << 20, 8192);
        let bp = phys.write(&zio, &WriteProps::default(), TxgT(2)).await
            .unwrap();
        let os = Objset::open(zio.clone(), DatasetId(1), bp, false).await
            .unwrap();
        assert_eq!(os.kind(), ObjsetKind::Volume);
        assert_eq!(os.objects(), vec![VOLUME_OBJECT]);
        assert_eq!(os.object_info(VOLUME_OBJECT).unwrap(),
            ObjectInfo{size: 1 << 20, block_size: 8192, nlevels: 1});
        assert_eq!(os.read(VOLUME_OBJECT, 40960, 8).await.unwrap(),
                   vec![0; 8]);
        os.write(TxgT(3), VOLUME_OBJECT, 40960, &[5; 8]).await.unwrap();
        sync(&os, TxgT(3)).await;
        let os = Objset::open(zio, DatasetId(1), os.root_bp(), false).await
            .unwrap();
        assert_eq!(os.kind(), ObjsetKind::Volume);
        assert_eq!(os.object_info(VOLUME_OBJECT).unwrap().size, 1 << 20);
        assert_eq!(os.read(VOLUME_OBJECT, 40960, 8).await.unwrap(),
                   vec![5; 8]);
    }

    #[tokio::test]
    async fn default_kind() {
        let (zio, _) = harness(1, false);
        assert_eq!(empty(&zio).await.kind(), ObjsetKind::Filesystem);
    }

    /// Ranges past the largest object size are refused, not wrapped
    #[tokio::test]
    async fn write_past_max_size() {
        let (zio, _) = harness(1, false);
        let os = empty(&zio).await;
        let obj = os.create_object(TxgT(2), 4096).unwrap();
        for offset in [u64::MAX - 10, MAX_OBJECT_SIZE - 99] {
            assert!(matches!(os.write(TxgT(2), obj, offset, &[1; 100]).await,
                             Err(Error::InvalidArgument(_))));
            assert!(matches!(os.hold_for_write(obj, offset, 100).await,
                             Err(Error::InvalidArgument(_))));
        }
        assert!(matches!(os.truncate(TxgT(2), obj, u64::MAX).await,
                         Err(Error::InvalidArgument(_))));
        assert_eq!(os.object_info(obj).unwrap().size, 0);
        // The very last byte is still writable
        os.write(TxgT(2), obj, MAX_OBJECT_SIZE - 1, &[7]).await.unwrap();
        assert_eq!(os.object_info(obj).unwrap().size, MAX_OBJECT_SIZE);
        assert_eq!(os.read(obj, MAX_OBJECT_SIZE - 1, 10).await.unwrap(),
                   vec![7]);
    }

    /// Unaligned writes spanning several blocks, read before and after sync
    #[tokio::test]
    async fn write_read_unaligned() {
        let (zio, _) = harness(1, false);
        let os = empty(&zio).await;
        let obj = os.create_object(TxgT(2), 4096).unwrap();
        let data = (0..10000u32).map(|i| (i % 251) as u8).collect::<Vec<_>>();
        os.write(TxgT(2), obj, 1000, &data).await.unwrap();
        assert_eq!(os.object_info(obj).unwrap().size, 11000);
        let r = os.read(obj, 0, 20000).await.unwrap();
        assert_eq!(r.len(), 11000);
        assert!(r[..1000].iter().all(|b| *b == 0));
        assert_eq!(&r[1000..], &data[..]);

        sync(&os, TxgT(2)).await;
        os.evict_idle();
        assert_eq!(os.read(obj, 1000, 10000).await.unwrap(), data);
        assert!(os.read(obj, 11000, 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reopen() {
        let (zio, _) = harness(1, false);
        let os = empty(&zio).await;
        let obj = os.create_object(TxgT(2), 4096).unwrap();
        os.write(TxgT(2), obj, 0, &[0xAA; 9000]).await.unwrap();
        sync(&os, TxgT(2)).await;
        let root = os.root_bp();
        assert!(root.is_some());

        let os2 = Objset::open(zio, DatasetId(1), root, false).await.unwrap();
        assert_eq!(os2.objects(), vec![obj]);
        assert_eq!(os2.object_info(obj).unwrap().size, 9000);
        assert_eq!(os2.read(obj, 0, 9000).await.unwrap(), vec![0xAA; 9000]);
        assert_eq!(os2.create_object(TxgT(3), 4096).unwrap(), obj + 1);
    }

    /// A captured range keeps its content across later writes and syncs
    #[tokio::test]
    async fn hold_range_isolation() {
        let (zio, _) = harness(1, false);
        let os = empty(&zio).await;
        let obj = os.create_object(TxgT(2), 4096).unwrap();
        os.write(TxgT(2), obj, 0, &[1; 8192]).await.unwrap();
        sync(&os, TxgT(2)).await;
        let view = os.hold_range(obj, 0, 8192).await.unwrap();
        os.write(TxgT(3), obj, 100, &[2; 5000]).await.unwrap();
        sync(&os, TxgT(3)).await;
        assert_eq!(view.read(), vec![1; 8192]);
        let now = os.read(obj, 0, 8192).await.unwrap();
        assert_eq!(now[100], 2);
    }

    #[tokio::test]
    async fn free_range() {
        let (zio, _) = harness(1, false);
        let os = empty(&zio).await;
        let obj = os.create_object(TxgT(2), 4096).unwrap();
        os.write(TxgT(2), obj, 0, &[7; 16384]).await.unwrap();
        sync(&os, TxgT(2)).await;
        // Block 1 entirely, and half of block 2
        os.free_range(TxgT(3), obj, 4096, 6144).await.unwrap();
        let r = os.read(obj, 0, 16384).await.unwrap();
        assert!(r[..4096].iter().all(|b| *b == 7));
        assert!(r[4096..10240].iter().all(|b| *b == 0));
        assert!(r[10240..].iter().all(|b| *b == 7));
        assert_eq!(os.object_info(obj).unwrap().size, 16384);
        let (born, killed) = sync(&os, TxgT(3)).await;
        // Blocks 1 and 2, the indirect block, and the objset block
        assert_eq!(killed.len(), 4);
        // Block 2, the indirect block, and the objset block
        assert_eq!(born.len(), 3);
    }

    #[tokio::test]
    async fn truncate() {
        let (zio, _) = harness(1, false);
        let os = empty(&zio).await;
        let obj = os.create_object(TxgT(2), 4096).unwrap();
        os.write(TxgT(2), obj, 0, &[3; 10000]).await.unwrap();
        os.truncate(TxgT(2), obj, 5000).await.unwrap();
        assert_eq!(os.object_info(obj).unwrap().size, 5000);
        // Growing again must expose zeros, not the old contents
        os.truncate(TxgT(2), obj, 10000).await.unwrap();
        let r = os.read(obj, 0, 10000).await.unwrap();
        assert!(r[..5000].iter().all(|b| *b == 3));
        assert!(r[5000..].iter().all(|b| *b == 0));
        sync(&os, TxgT(2)).await;
        assert_eq!(os.committed().dnodes[&obj].size, 10000);
    }

    #[tokio::test]
    async fn free_object_kills_tree() {
        let (zio, _) = harness(1, false);
        let os = empty(&zio).await;
        let obj = os.create_object(TxgT(2), 4096).unwrap();
        os.write(TxgT(2), obj, 0, &[5; 8192]).await.unwrap();
        let (born, _) = sync(&os, TxgT(2)).await;
        os.free_object(TxgT(3), obj).unwrap();
        assert!(os.objects().is_empty());
        let (_, killed) = sync(&os, TxgT(3)).await;
        // Everything born in txg 2 is dead now
        let mut born = born;
        let mut killed = killed;
        born.sort_by_key(|bp| bp.dvas()[0]);
        killed.sort_by_key(|bp| bp.dvas()[0]);
        assert_eq!(born, killed);
        assert!(os.committed().dnodes.is_empty());
    }

    #[tokio::test]
    async fn traverse_prunes_by_birth() {
        let (zio, _) = harness(1, false);
        let os = empty(&zio).await;
        let obj = os.create_object(TxgT(2), 4096).unwrap();
        os.write(TxgT(2), obj, 0, &[1; 4096 * 4]).await.unwrap();
        sync(&os, TxgT(2)).await;
        os.write(TxgT(3), obj, 4096, &[2; 4096]).await.unwrap();
        sync(&os, TxgT(3)).await;
        let root = os.root_bp().unwrap();

        let mut all = Vec::new();
        let mut v = |bp: &BlockPtr| { all.push(*bp); Ok(()) };
        traverse(&zio, root, TxgT(0), &mut v).await.unwrap();
        // 4 data, 1 indirect, 1 objset
        assert_eq!(all.len(), 6);
        assert_eq!(all.last(), Some(&root));

        let mut new = Vec::new();
        let mut v = |bp: &BlockPtr| { new.push(*bp); Ok(()) };
        traverse(&zio, root, TxgT(2), &mut v).await.unwrap();
        // 1 data, 1 indirect, 1 objset
        assert_eq!(new.len(), 3);
        assert!(new.iter().all(|bp| bp.birth == TxgT(3)));
    }
}
// LCOV_EXCL_STOP
