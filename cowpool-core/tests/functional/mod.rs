// vim: tw=80
#![allow(clippy::module_inception)]

use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc
    }
};

use tempfile::{Builder, TempDir};

use cowpool_core::{
    config::{TopologySpec, Tunables, VdevSpec},
    database::{Database, DatasetHandle},
    vdev::{BoxVdevFut, Leaf},
    vdev_file::VdevFile,
    *
};

macro_rules! t {
    ($e:expr) => (match $e {
        Ok(e) => e,
        Err(e) => panic!("{} failed with {:?}", stringify!($e), e),
    })
}

/// Helper to create a fresh pool on sparse files
#[derive(Debug)]
struct PoolBuilder {
    /// Number of files
    n: usize,
    /// Make one RAID-Z vdev instead of one mirror
    raidz: bool,
    /// Size of each file in bytes
    fsize: u64,
    name: &'static str,
    tunables: Tunables,
}

impl PoolBuilder {
    fn files(&self) -> (TempDir, Vec<PathBuf>) {
        let tempdir = Builder::new()
            .prefix("cowpool_functional_test")
            .tempdir()
            .unwrap();
        let paths = (0..self.n).map(|i| {
            let fname = tempdir.path().join(format!("vdev.{i}"));
            let file = std::fs::File::create(&fname).unwrap();
            file.set_len(self.fsize).unwrap();
            fname
        }).collect::<Vec<_>>();
        (tempdir, paths)
    }

    async fn build(&self) -> (TempDir, Vec<PathBuf>, Database) {
        let (tempdir, paths) = self.files();
        let spec = if self.raidz {
            VdevSpec::Raidz(paths.clone())
        } else {
            VdevSpec::Mirror(paths.clone())
        };
        let topology = TopologySpec{vdevs: vec![spec]};
        let db = t!(Database::create_files(self.name, &topology,
                                           self.tunables.clone()).await);
        (tempdir, paths, db)
    }

    fn disks(&mut self, n: usize) -> &mut Self {
        self.n = n;
        self
    }

    fn fsize(&mut self, fsize: u64) -> &mut Self {
        self.fsize = fsize;
        self
    }

    fn new() -> Self {
        Self {
            n: 1,
            raidz: false,
            fsize: 1 << 25,  // 32 MB
            name: "functional_test_pool",
            tunables: Tunables::default()
        }
    }

    fn raidz(&mut self) -> &mut Self {
        self.raidz = true;
        self
    }
}

/// A leaf that fails every write once its budget runs out, like a disk that
/// lost power.
struct FlakyLeaf {
    inner: VdevFile,
    budget: AtomicI64,
}

impl FlakyLeaf {
    fn new(inner: VdevFile) -> Arc<Self> {
        Arc::new(FlakyLeaf{inner, budget: AtomicI64::new(i64::MAX)})
    }

    /// Allow only `writes` more writes
    fn power_fail_after(&self, writes: i64) {
        self.budget.store(writes, Ordering::Relaxed);
    }
}

impl Leaf for FlakyLeaf {
    fn read_at(&self, buf: IoVecMut, lba: LbaT) -> BoxVdevFut {
        self.inner.read_at(buf, lba)
    }

    fn write_at(&self, buf: IoVec, lba: LbaT) -> BoxVdevFut {
        if self.budget.fetch_sub(1, Ordering::Relaxed) <= 0 {
            return Box::pin(futures::future::err(
                Error::DeviceIo(std::io::ErrorKind::BrokenPipe)));
        }
        self.inner.write_at(buf, lba)
    }

    fn sync_all(&self) -> BoxVdevFut {
        if self.budget.load(Ordering::Relaxed) <= 0 {
            return Box::pin(futures::future::err(
                Error::DeviceIo(std::io::ErrorKind::BrokenPipe)));
        }
        self.inner.sync_all()
    }

    fn size(&self) -> LbaT {
        self.inner.size()
    }

    fn uuid(&self) -> Uuid {
        self.inner.uuid()
    }
}

/// Create an object in `h` holding `data`, and sync it
async fn write_object(db: &Database, h: &DatasetHandle, data: &[u8])
    -> ObjectId
{
    let object = {
        let tx = t!(h.begin_transaction(data.len() as u64).await);
        let object = t!(tx.create_object(4096));
        t!(tx.write(object, 0, data).await);
        tx.commit();
        object
    };
    t!(db.sync_transaction().await);
    object
}

/// Overwrite part of an object, and sync it
async fn overwrite(db: &Database, h: &DatasetHandle, object: ObjectId,
                   offset: u64, data: &[u8])
{
    {
        let tx = t!(h.begin_transaction(data.len() as u64).await);
        t!(tx.write(object, offset, data).await);
        tx.commit();
    }
    t!(db.sync_transaction().await);
}

mod data;
mod durability;
mod redundancy;
mod send;
mod snapshots;
