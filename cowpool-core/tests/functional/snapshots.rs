// vim: tw=80
//! Snapshots, clones, and the operations that reshape the dataset graph
use pretty_assertions::assert_eq;
use cowpool_core::property::{Property, PropertyName, PropertySource};

use super::*;

const FS: &str = "functional_test_pool/fs";

async fn harness() -> (TempDir, Database) {
    let (tempdir, _paths, db) = PoolBuilder::new().build().await;
    t!(db.create_dataset(FS, &[]).await);
    (tempdir, db)
}

#[tokio::test]
async fn snapshot_preserves_data() {
    let (_tempdir, db) = harness().await;
    let h = t!(db.open_dataset(FS).await);
    let object = write_object(&db, &h, &[b'A'; 8192]).await;
    t!(db.snapshot("functional_test_pool/fs@s1").await);
    overwrite(&db, &h, object, 4096, &[b'B'; 4096]).await;

    let snap = t!(db.open_dataset("functional_test_pool/fs@s1").await);
    assert!(snap.is_snapshot());
    assert_eq!(t!(snap.read(object, 0, 8192).await), vec![b'A'; 8192]);
    let head = t!(h.read(object, 0, 8192).await);
    assert_eq!(&head[..4096], &[b'A'; 4096][..]);
    assert_eq!(&head[4096..], &[b'B'; 4096][..]);

    // The snapshot uniquely owns the overwritten block, plus the metadata
    // above it
    let stats = t!(db.dataset_stats("functional_test_pool/fs@s1"));
    assert!(stats.is_snapshot);
    assert!(stats.unique >= 4096);
    assert!(stats.unique < stats.used);
    assert_eq!(t!(db.dataset_stats(FS)).prev_snap.as_deref(),
               Some("functional_test_pool/fs@s1"));
}

#[tokio::test]
async fn destroy_snapshot_frees_space() {
    let (_tempdir, db) = harness().await;
    let h = t!(db.open_dataset(FS).await);
    let object = write_object(&db, &h, &[1u8; 65536]).await;
    t!(db.snapshot("functional_test_pool/fs@s1").await);
    overwrite(&db, &h, object, 0, &[2u8; 65536]).await;
    let allocated = db.pool_status().allocated;
    t!(db.destroy_dataset("functional_test_pool/fs@s1", false).await);
    assert!(db.pool_status().allocated + 65536 <= allocated);
    assert_eq!(t!(h.read(object, 0, 1).await), vec![2u8]);
}

#[tokio::test]
async fn destroy_with_snapshots() {
    let (_tempdir, db) = harness().await;
    t!(db.snapshot("functional_test_pool/fs@s1").await);
    assert!(matches!(db.destroy_dataset(FS, false).await,
                     Err(Error::HasSnapshots(_))));
    t!(db.destroy_dataset(FS, true).await);
    assert_eq!(db.list_datasets(), vec!["functional_test_pool"]);
}

#[tokio::test]
async fn clone_and_destroy() {
    let (_tempdir, db) = harness().await;
    let object = {
        let h = t!(db.open_dataset(FS).await);
        write_object(&db, &h, b"origin").await
    };
    t!(db.snapshot("functional_test_pool/fs@s1").await);
    t!(db.clone("functional_test_pool/fs@s1", "functional_test_pool/c",
                &[]).await);
    {
        let c = t!(db.open_dataset("functional_test_pool/c").await);
        assert_eq!(t!(c.read(object, 0, 6).await), b"origin");
        overwrite(&db, &c, object, 0, b"cloned").await;
        let h = t!(db.open_dataset(FS).await);
        assert_eq!(t!(h.read(object, 0, 6).await), b"origin");
    }
    assert!(matches!(
        db.destroy_dataset("functional_test_pool/fs@s1", false).await,
        Err(Error::HasDependentClones(_))));
    assert!(matches!(
        db.clone("functional_test_pool/fs", "functional_test_pool/d", &[])
            .await,
        Err(Error::NotASnapshot(_))));
    t!(db.destroy_dataset("functional_test_pool/c", false).await);
    t!(db.destroy_dataset("functional_test_pool/fs@s1", false).await);
}

#[tokio::test]
async fn promote() {
    let (_tempdir, db) = harness().await;
    t!(db.snapshot("functional_test_pool/fs@s1").await);
    t!(db.clone("functional_test_pool/fs@s1", "functional_test_pool/c",
                &[]).await);
    t!(db.promote("functional_test_pool/c").await);
    let names = db.list_datasets();
    assert!(names.contains(&"functional_test_pool/c@s1".to_string()));
    assert!(!names.contains(&"functional_test_pool/fs@s1".to_string()));
    assert_eq!(t!(db.dataset_stats(FS)).origin.as_deref(),
               Some("functional_test_pool/c@s1"));
    assert_eq!(t!(db.dataset_stats("functional_test_pool/c")).origin, None);
    // Now the old head is the clone, so it can go
    t!(db.destroy_dataset(FS, false).await);
    assert!(matches!(db.promote("functional_test_pool/c").await,
                     Err(Error::NotAClone(_))));
}

#[tokio::test]
async fn rollback() {
    let (_tempdir, db) = harness().await;
    let object = {
        let h = t!(db.open_dataset(FS).await);
        let object = write_object(&db, &h, b"first").await;
        t!(db.snapshot("functional_test_pool/fs@s1").await);
        overwrite(&db, &h, object, 0, b"again").await;
        t!(db.snapshot("functional_test_pool/fs@s2").await);
        overwrite(&db, &h, object, 0, b"third").await;
        object
    };
    t!(db.rollback(FS, false).await);
    {
        let h = t!(db.open_dataset(FS).await);
        assert_eq!(t!(h.read(object, 0, 5).await), b"again");
    }
    assert!(matches!(
        db.rollback_to(FS, "functional_test_pool/fs@s1", false).await,
        Err(Error::HasLaterSnapshots(_))));
    t!(db.rollback_to(FS, "functional_test_pool/fs@s1", true).await);
    assert!(!db.list_datasets()
            .contains(&"functional_test_pool/fs@s2".to_string()));
    let h = t!(db.open_dataset(FS).await);
    assert_eq!(t!(h.read(object, 0, 5).await), b"first");
}

#[tokio::test]
async fn rename() {
    let (_tempdir, db) = harness().await;
    t!(db.create_dataset("functional_test_pool/fs/child", &[]).await);
    t!(db.snapshot("functional_test_pool/fs@s1").await);
    t!(db.rename(FS, "functional_test_pool/gs").await);
    assert_eq!(db.list_datasets(), vec![
        "functional_test_pool",
        "functional_test_pool/gs",
        "functional_test_pool/gs/child",
        "functional_test_pool/gs@s1"
    ]);
    assert!(matches!(db.open_dataset(FS).await,
                     Err(Error::DatasetNotFound(_))));
}

/// Properties inherit down the tree, but quota doesn't
#[tokio::test]
async fn property_inheritance() {
    let (_tempdir, db) = harness().await;
    let child = "functional_test_pool/fs/child";
    t!(db.create_dataset(child, &[Property::Atime(false)]).await);
    t!(db.set_prop(FS, Property::Copies(2)).await);
    t!(db.set_prop(FS, Property::Quota(1 << 20)).await);
    assert_eq!(t!(db.get_prop(child, PropertyName::Copies)),
               (Property::Copies(2), PropertySource::FROM_PARENT));
    assert_eq!(t!(db.get_prop(child, PropertyName::Atime)),
               (Property::Atime(false), PropertySource::LOCAL));
    assert_eq!(t!(db.get_prop(child, PropertyName::Quota)).0,
               Property::Quota(0));
}

/// The quota covers a dataset's own blocks
#[tokio::test]
async fn quota() {
    let (_tempdir, db) = harness().await;
    t!(db.set_prop(FS, Property::Quota(1 << 17)).await);
    let h = t!(db.open_dataset(FS).await);
    write_object(&db, &h, &[1u8; 1 << 16]).await;
    assert!(matches!(h.begin_transaction(1 << 17).await,
                     Err(Error::QuotaExceeded(_))));
    drop(t!(h.begin_transaction(4096).await));
}

/// Writes past a transaction's estimate still count against the quota
#[tokio::test]
async fn quota_beyond_estimate() {
    let (_tempdir, db) = harness().await;
    t!(db.set_prop(FS, Property::Quota(1 << 17)).await);
    let h = t!(db.open_dataset(FS).await);
    let object = write_object(&db, &h, &[1u8; 1 << 16]).await;
    {
        let tx = t!(h.begin_transaction(4096).await);
        t!(tx.write(object, 0, &[2u8; 4096]).await);
        assert!(matches!(tx.write(object, 4096, &[3u8; 1 << 17]).await,
                         Err(Error::QuotaExceeded(_))));
        tx.commit();
    }
    t!(db.sync_transaction().await);
    let data = t!(h.read(object, 0, 1 << 17).await);
    assert_eq!(data.len(), 1 << 16);
    assert_eq!(&data[..4096], &[2u8; 4096][..]);
    assert!(data[4096..].iter().all(|b| *b == 1));
    let stats = t!(db.dataset_stats(FS));
    assert!(stats.dir_used <= 1 << 17);
}
