// vim: tw=80
//! Replication streams
//!
//! A stream describes one snapshot, either in full or relative to an earlier
//! snapshot of the same dataset.  Only blocks born after the base snapshot are
//! visited, so an incremental stream costs time proportional to the change.

use crate::{
    database::Database,
    dmu::{DnodePhys, INDIRECT_FANOUT, ObjsetKind, ObjsetPhys, VOLUME_OBJECT},
    types::*,
    util::*,
    zio::{BlockPtr, Zio},
};
use futures::{FutureExt, future::BoxFuture};
use itertools::Itertools;
use metrohash::MetroHash64;
use serde_derive::{Deserialize, Serialize};
use std::hash::Hasher;
use tracing::{debug, info};

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum Record {
    Begin {
        /// GUID of the snapshot being sent
        to_guid: u64,
        /// GUID of the base snapshot, for an incremental stream
        from_guid: Option<u64>,
        snapname: String,
        kind: ObjsetKind,
    },
    /// Create or reshape an object
    Object {
        object: ObjectId,
        block_size: u32,
        nlevels: u8,
        size: u64,
    },
    /// Remove a run of objects
    FreeObjects {
        first: ObjectId,
        count: u64,
    },
    /// Punch a hole
    Free {
        object: ObjectId,
        offset: u64,
        len: u64,
    },
    Write {
        object: ObjectId,
        offset: u64,
        data: Vec<u8>,
    },
    End {
        /// Hash of every preceding record
        checksum: u64,
    },
}

fn checksum(records: &[Record]) -> Result<u64> {
    let mut hasher = MetroHash64::new();
    for r in records.iter() {
        hasher.write(&bincode::serialize(r)?);
    }
    Ok(hasher.finish())
}

/// Serialize a stream for storage or transport
pub fn encode(records: &[Record]) -> Result<Vec<u8>> {
    Ok(bincode::serialize(records)?)
}

pub fn decode(buf: &[u8]) -> Result<Vec<Record>> {
    Ok(bincode::deserialize(buf)?)
}

async fn objset_phys(zio: &Zio, root: Option<BlockPtr>)
    -> Result<ObjsetPhys>
{
    match root {
        Some(bp) => {
            let dbs = zio.read_block(&bp).await?;
            Ok(bincode::deserialize(&frozen(&dbs)[..])?)
        },
        None => Ok(ObjsetPhys::default())
    }
}

/// Walks the block trees of one snapshot
struct Walker<'a> {
    zio: &'a Zio,
    min_txg: TxgT,
    records: Vec<Record>,
}

impl<'a> Walker<'a> {
    /// Emit every change to one object's contents since `min_txg`
    async fn object(&mut self, object: ObjectId, dn: &DnodePhys)
        -> Result<()>
    {
        match dn.root {
            Some(bp) => {
                let level = dn.nlevels.saturating_sub(1);
                self.walk(object, dn, bp, level, 0).await
            },
            None => {
                if dn.size > 0 {
                    self.records.push(Record::Free {
                        object,
                        offset: 0,
                        len: dn.size
                    });
                }
                Ok(())
            }
        }
    }

    fn walk<'b>(&'b mut self, object: ObjectId, dn: &'b DnodePhys,
                bp: BlockPtr, level: u8, blkid: u64)
        -> BoxFuture<'b, Result<()>>
    {
        async move {
            if bp.birth <= self.min_txg {
                return Ok(());
            }
            let bs = u64::from(dn.block_size);
            let children: Vec<Option<BlockPtr>> = {
                let dbs = self.zio.read_block(&bp).await?;
                let buf = frozen(&dbs);
                if level == 0 {
                    let offset = blkid * bs;
                    if offset < dn.size {
                        let len = (dn.size - offset).min(bs) as usize;
                        self.records.push(Record::Write {
                            object,
                            offset,
                            data: buf[..len.min(buf.len())].to_vec()
                        });
                    }
                    return Ok(());
                }
                bincode::deserialize(&buf[..])?
            };
            let fanout = INDIRECT_FANOUT as u64;
            // Bytes covered by each child
            let span = fanout.pow(u32::from(level) - 1) * bs;
            for (i, child) in children.into_iter().enumerate() {
                let cblk = blkid * fanout + i as u64;
                match child {
                    Some(c) => {
                        self.walk(object, dn, c, level - 1, cblk).await?;
                    },
                    None => {
                        let offset = cblk * span;
                        if offset < dn.size {
                            self.records.push(Record::Free {
                                object,
                                offset,
                                len: (dn.size - offset).min(span)
                            });
                        }
                    }
                }
            }
            Ok(())
        }.boxed()
    }
}

/// Build a stream for `snapshot`, optionally relative to the older snapshot
/// `from` of the same dataset.
#[tracing::instrument(skip(db))]
pub async fn send(db: &Database, snapshot: &str, from: Option<&str>)
    -> Result<Vec<Record>>
{
    // Open handles, so neither snapshot can be destroyed beneath us
    let to_h = db.open_dataset(snapshot).await?;
    let from_h = match from {
        Some(f) => Some(db.open_dataset(f).await?),
        None => None
    };
    let graph = db.graph();
    let to = graph.ds(to_h.id())?.clone();
    if !to.is_snapshot() {
        return Err(Error::NotASnapshot(snapshot.to_string()));
    }
    let base = match from_h.as_ref() {
        Some(h) => {
            let b = graph.ds(h.id())?.clone();
            if !b.is_snapshot() {
                return Err(Error::NotASnapshot(h.name().to_string()));
            }
            if b.dir != to.dir || b.creation_txg >= to.creation_txg {
                return Err(Error::InvalidArgument(format!(
                    "{} is not an earlier snapshot of {}", h.name(),
                    snapshot)));
            }
            Some(b)
        },
        None => None
    };
    let zio = db.zio_ref();
    let to_phys = objset_phys(zio, to.root).await?;
    let base_phys = match base.as_ref() {
        Some(b) => objset_phys(zio, b.root).await?,
        None => ObjsetPhys::default()
    };
    let min_txg = base.as_ref().map(|b| b.creation_txg).unwrap_or(TxgT(0));

    let mut walker = Walker{zio, min_txg, records: Vec::new()};
    walker.records.push(Record::Begin {
        to_guid: to.guid,
        from_guid: base.as_ref().map(|b| b.guid),
        snapname: to.snapname.clone().unwrap_or_default(),
        kind: to_phys.kind
    });
    let gone = base_phys.dnodes.keys()
        .filter(|o| !to_phys.dnodes.contains_key(o))
        .map(|o| Record::FreeObjects{first: *o, count: 1})
        .coalesce(|a, b| match (a, b) {
            (Record::FreeObjects{first, count},
             Record::FreeObjects{first: f2, count: c2})
                if first + count == f2 =>
            {
                Ok(Record::FreeObjects{first, count: count + c2})
            },
            (a, b) => Err((a, b))
        });
    walker.records.extend(gone);
    for (object, dn) in to_phys.dnodes.iter() {
        if base_phys.dnodes.get(object) == Some(dn) {
            continue;
        }
        walker.records.push(Record::Object {
            object: *object,
            block_size: dn.block_size,
            nlevels: dn.nlevels,
            size: dn.size
        });
        walker.object(*object, dn).await?;
    }
    let checksum = checksum(&walker.records)?;
    walker.records.push(Record::End{checksum});
    debug!(records = walker.records.len(), "stream built");
    Ok(walker.records)
}

/// Apply a stream.  A full stream creates the dataset `name`; an incremental
/// one rolls `name` back to its latest snapshot, which must be the stream's
/// base, and applies the changes.  Either way, finishes by taking the
/// stream's snapshot.
#[tracing::instrument(skip(db, records))]
pub async fn receive(db: &Database, name: &str, records: &[Record])
    -> Result<()>
{
    let (to_guid, from_guid, snapname, kind) = match records.first() {
        Some(Record::Begin{to_guid, from_guid, snapname, kind}) =>
            (*to_guid, *from_guid, snapname.clone(), *kind),
        _ => return Err(Error::Integrity("stream has no Begin".to_string()))
    };
    let body = match records.split_last() {
        Some((Record::End{checksum: cs}, body)) => {
            if checksum(body)? != *cs {
                return Err(Error::Integrity(
                    "stream checksum mismatch".to_string()));
            }
            &body[1..]
        },
        _ => return Err(Error::Integrity("stream has no End".to_string()))
    };

    match (from_guid, kind) {
        (None, ObjsetKind::Filesystem) => db.create_dataset(name, &[]).await?,
        (None, ObjsetKind::Volume) => {
            let (size, block_size) = body.iter()
                .find_map(|r| match r {
                    Record::Object{object, block_size, size, ..}
                        if *object == VOLUME_OBJECT =>
                    {
                        Some((*size, *block_size))
                    },
                    _ => None
                }).ok_or_else(|| Error::Integrity(
                    "volume stream has no volume object".to_string()))?;
            db.create_volume(name, size, block_size, &[]).await?
        },
        (Some(guid), _) => {
            if db.open_dataset(name).await?.kind() != kind {
                return Err(Error::InvalidArgument(format!(
                    "{name}: stream is for a different kind of dataset")));
            }
            let graph = db.graph();
            let dir = graph.ds(graph.lookup(name)?)?.dir;
            let latest = graph.snapshots(dir)?
                .last()
                .map(|id| graph.ds(*id).map(|ds| ds.guid))
                .transpose()?;
            if latest != Some(guid) {
                return Err(Error::InvalidArgument(format!(
                    "{name}: latest snapshot does not match the stream's \
                    base")));
            }
            db.rollback(name, false).await?;
        }
    }

    let estimate = body.iter()
        .map(|r| match r {
            Record::Write{data, ..} => data.len() as u64,
            _ => 0
        }).sum();
    {
        let h = db.open_dataset(name).await?;
        let tx = h.begin_transaction(estimate).await?;
        for r in body.iter() {
            match r {
                Record::Object{object, block_size, size, ..} => {
                    match h.object_info(*object) {
                        Ok(info) if info.block_size == *block_size => (),
                        Ok(_) => {
                            tx.free_object(*object)?;
                            tx.claim_object(*object, *block_size)?;
                        },
                        Err(Error::ObjectNotFound(_)) => {
                            tx.claim_object(*object, *block_size)?;
                        },
                        Err(e) => return Err(e)
                    }
                    tx.truncate(*object, *size).await?;
                },
                Record::FreeObjects{first, count} => {
                    for object in *first..*first + *count {
                        if h.object_info(object).is_ok() {
                            tx.free_object(object)?;
                        }
                    }
                },
                Record::Free{object, offset, len} => {
                    tx.free_range(*object, *offset, *len).await?;
                },
                Record::Write{object, offset, data} => {
                    tx.write(*object, *offset, data).await?;
                },
                Record::Begin{..} | Record::End{..} => {
                    return Err(Error::Integrity(
                        "misplaced stream delimiter".to_string()));
                }
            }
        }
        tx.commit();
    }
    db.snapshot_with_guid(&format!("{name}@{snapname}"), Some(to_guid))
        .await?;
    info!(records = records.len(), "stream received");
    Ok(())
}

// LCOV_EXCL_STOP
