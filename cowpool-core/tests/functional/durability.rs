// vim: tw=80
//! Crash consistency and persistence across imports
use pretty_assertions::assert_eq;
use cowpool_core::vdev::{TopVdev, VdevKind};

use super::*;

const POOLNAME: &str = "functional_test_pool";
const FS: &str = "functional_test_pool/fs";

#[tokio::test]
async fn export_and_import() {
    let (_tempdir, paths, db) = PoolBuilder::new().disks(2).build().await;
    t!(db.create_dataset(FS, &[]).await);
    let object = {
        let h = t!(db.open_dataset(FS).await);
        write_object(&db, &h, b"persistent").await
    };
    t!(db.export().await);

    let db = t!(Database::open_files(POOLNAME, &paths, Tunables::default())
                .await);
    assert_eq!(db.list_datasets(), vec![POOLNAME, FS]);
    let h = t!(db.open_dataset(FS).await);
    assert_eq!(t!(h.read(object, 0, 10).await), b"persistent");
}

#[tokio::test]
async fn import_wrong_name() {
    let (_tempdir, paths, db) = PoolBuilder::new().build().await;
    t!(db.export().await);
    let r = Database::open_files("other_pool", &paths, Tunables::default())
        .await;
    assert!(matches!(r, Err(Error::PoolNotFound(_))));
}

/// After the pool is destroyed, its leaves no longer import
#[tokio::test]
async fn destroy_pool() {
    let (_tempdir, paths, db) = PoolBuilder::new().build().await;
    t!(db.destroy().await);
    let r = Database::open_files(POOLNAME, &paths, Tunables::default())
        .await;
    assert!(matches!(r, Err(Error::PoolNotFound(_))));
}

/// Pool configuration can come from YAML
#[tokio::test]
async fn yaml_config() {
    let (_tempdir, paths) = PoolBuilder::new().disks(3).files();
    let yaml = format!("vdevs:\n  - !Raidz [{}, {}, {}]\n",
                       paths[0].display(), paths[1].display(),
                       paths[2].display());
    let topology = t!(TopologySpec::from_yaml(&yaml));
    let tunables = t!(Tunables::from_yaml("sync_interval_ms: 100\n"));
    let db = t!(Database::create_files(POOLNAME, &topology, tunables).await);
    let status = db.pool_status();
    assert_eq!(status.vdevs.len(), 1);
    assert_eq!(status.vdevs[0].kind, VdevKind::Raidz);
    assert_eq!(status.vdevs[0].leaves.len(), 3);
}

/// The periodic syncer commits transactions without being asked
#[tokio::test]
async fn periodic_sync() {
    let mut builder = PoolBuilder::new();
    builder.tunables.sync_interval_ms = 50;
    let (_tempdir, _paths, db) = builder.build().await;
    t!(db.create_dataset(FS, &[]).await);
    let h = t!(db.open_dataset(FS).await);
    let txg = {
        let tx = t!(h.begin_transaction(4).await);
        let object = t!(tx.create_object(4096));
        t!(tx.write(object, 0, b"tick").await);
        tx.commit()
    };
    let deadline = std::time::Instant::now() +
        std::time::Duration::from_secs(10);
    while db.synced_txg() < txg {
        assert!(std::time::Instant::now() < deadline, "syncer never ran");
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
}

/// Build a pool on flaky leaves.  Returns the leaves too.
async fn flaky_pool(paths: &[PathBuf])
    -> (Database, Vec<Arc<FlakyLeaf>>)
{
    let leaves = paths.iter()
        .map(|p| FlakyLeaf::new(t!(VdevFile::create(p))))
        .collect::<Vec<_>>();
    let children = leaves.iter()
        .map(|l| l.clone() as Arc<dyn Leaf>)
        .collect::<Vec<_>>();
    let vdev = t!(TopVdev::create(VdevKind::Mirror, children));
    let db = t!(Database::create(POOLNAME, vec![vdev], Tunables::default())
                .await);
    t!(db.create_dataset(FS, &[]).await);
    (db, leaves)
}

/// Lose power at every point during a sync.  After import, the object must
/// hold either its old contents or its new contents, never a mixture.
#[test_log::test(tokio::test)]
async fn power_failure() {
    for budget in [0, 1, 2, 3, 5, 8, 13, 21, 34] {
        let (_tempdir, paths) = PoolBuilder::new().disks(2).files();
        let (db, leaves) = flaky_pool(&paths).await;
        let object = {
            let h = t!(db.open_dataset(FS).await);
            let object = write_object(&db, &h, &[b'A'; 16384]).await;
            {
                let tx = t!(h.begin_transaction(16384).await);
                t!(tx.write(object, 0, &[b'B'; 16384]).await);
                tx.commit();
            }
            object
        };
        for leaf in leaves.iter() {
            leaf.power_fail_after(budget);
        }
        let synced = db.sync_transaction().await.is_ok();
        drop(db);

        let db = t!(Database::open_files(POOLNAME, &paths,
                                         Tunables::default()).await);
        let h = t!(db.open_dataset(FS).await);
        let data = t!(h.read(object, 0, 16384).await);
        if synced {
            assert_eq!(data, vec![b'B'; 16384], "budget {budget}");
        } else {
            assert!(data == vec![b'A'; 16384] || data == vec![b'B'; 16384],
                    "torn write with budget {budget}");
        }
    }
}

/// A sync that fails on every device is retried by the next one
#[test_log::test(tokio::test)]
async fn retry_after_failure() {
    let (_tempdir, paths) = PoolBuilder::new().disks(2).files();
    let (db, leaves) = flaky_pool(&paths).await;
    let h = t!(db.open_dataset(FS).await);
    let object = {
        let tx = t!(h.begin_transaction(4096).await);
        let object = t!(tx.create_object(4096));
        t!(tx.write(object, 0, &[b'C'; 4096]).await);
        tx.commit();
        object
    };
    for leaf in leaves.iter() {
        leaf.power_fail_after(0);
    }
    let before = db.synced_txg();
    assert!(db.sync_transaction().await.is_err());
    assert_eq!(db.synced_txg(), before);
    for leaf in leaves.iter() {
        leaf.power_fail_after(i64::MAX);
    }
    t!(db.sync_transaction().await);
    drop(h);
    t!(db.export().await);

    let db = t!(Database::open_files(POOLNAME, &paths, Tunables::default())
                .await);
    let h = t!(db.open_dataset(FS).await);
    assert_eq!(t!(h.read(object, 0, 4096).await), vec![b'C'; 4096]);
}
