// vim: tw=80
//! Replication streams, sent and received within one pool
use pretty_assertions::assert_eq;
use cowpool_core::send::{Record, decode, encode, receive, send};

use super::*;

const FS: &str = "functional_test_pool/fs";
const COPY: &str = "functional_test_pool/copy";

async fn harness() -> (TempDir, Database) {
    let (tempdir, _paths, db) = PoolBuilder::new().build().await;
    t!(db.create_dataset(FS, &[]).await);
    (tempdir, db)
}

/// Assert that two datasets hold the same objects with the same contents
async fn assert_same(db: &Database, a: &str, b: &str) {
    let ha = t!(db.open_dataset(a).await);
    let hb = t!(db.open_dataset(b).await);
    assert_eq!(ha.objects(), hb.objects());
    for object in ha.objects() {
        let ia = t!(ha.object_info(object));
        let ib = t!(hb.object_info(object));
        assert_eq!(ia.size, ib.size);
        assert_eq!(ia.block_size, ib.block_size);
        assert_eq!(t!(ha.read(object, 0, ia.size).await),
                   t!(hb.read(object, 0, ib.size).await));
    }
}

#[tokio::test]
async fn full() {
    let (_tempdir, db) = harness().await;
    {
        let h = t!(db.open_dataset(FS).await);
        write_object(&db, &h, b"small").await;
        let big = (0..300_000u32).map(|i| (i % 251) as u8).collect::<Vec<_>>();
        write_object(&db, &h, &big).await;
        // A sparse object
        let sparse = write_object(&db, &h, b"x").await;
        overwrite(&db, &h, sparse, 1 << 20, b"y").await;
    }
    t!(db.snapshot("functional_test_pool/fs@s1").await);

    let stream = t!(send(&db, "functional_test_pool/fs@s1", None).await);
    assert!(matches!(stream.first(),
                     Some(Record::Begin{from_guid: None, ..})));
    let stream = t!(decode(&t!(encode(&stream))));
    t!(receive(&db, COPY, &stream).await);

    assert_same(&db, "functional_test_pool/fs@s1",
                "functional_test_pool/copy@s1").await;
    let sent = t!(db.dataset_stats("functional_test_pool/fs@s1"));
    let received = t!(db.dataset_stats("functional_test_pool/copy@s1"));
    assert_eq!(sent.guid, received.guid);
}

#[tokio::test]
async fn incremental() {
    let (_tempdir, db) = harness().await;
    let (keep, doomed, holey) = {
        let h = t!(db.open_dataset(FS).await);
        let keep = write_object(&db, &h, &[1u8; 16384]).await;
        let doomed = write_object(&db, &h, &[2u8; 4096]).await;
        let holey = write_object(&db, &h, &[3u8; 4096 * 4]).await;
        (keep, doomed, holey)
    };
    t!(db.snapshot("functional_test_pool/fs@s1").await);
    let full = t!(send(&db, "functional_test_pool/fs@s1", None).await);
    t!(receive(&db, COPY, &full).await);

    let fresh = {
        let h = t!(db.open_dataset(FS).await);
        let fresh = write_object(&db, &h, b"new object").await;
        overwrite(&db, &h, keep, 4096, &[9u8; 4096]).await;
        let tx = t!(h.begin_transaction(0).await);
        t!(tx.free_object(doomed));
        t!(tx.free_range(holey, 4096, 4096).await);
        t!(tx.truncate(holey, 4096 * 3).await);
        tx.commit();
        fresh
    };
    t!(db.sync_transaction().await);
    t!(db.snapshot("functional_test_pool/fs@s2").await);

    let incr = t!(send(&db, "functional_test_pool/fs@s2",
                       Some("functional_test_pool/fs@s1")).await);
    // Only what changed
    let written = incr.iter()
        .filter_map(|r| match r {
            Record::Write{object, ..} => Some(*object),
            _ => None
        }).collect::<Vec<_>>();
    assert!(written.contains(&keep));
    assert!(written.contains(&fresh));
    assert_eq!(written.iter().filter(|o| **o == keep).count(), 1);
    assert!(incr.iter().any(|r| matches!(r,
        Record::FreeObjects{first, count: 1} if *first == doomed)));

    t!(receive(&db, COPY, &incr).await);
    assert_same(&db, "functional_test_pool/fs@s2",
                "functional_test_pool/copy@s2").await;
    assert_same(&db, FS, COPY).await;
}

/// An incremental stream applies only on top of its base
#[tokio::test]
async fn wrong_base() {
    let (_tempdir, db) = harness().await;
    t!(db.snapshot("functional_test_pool/fs@s1").await);
    t!(db.snapshot("functional_test_pool/fs@s2").await);
    t!(db.snapshot("functional_test_pool/fs@s3").await);
    let full = t!(send(&db, "functional_test_pool/fs@s1", None).await);
    t!(receive(&db, COPY, &full).await);
    let incr = t!(send(&db, "functional_test_pool/fs@s3",
                       Some("functional_test_pool/fs@s2")).await);
    assert!(matches!(receive(&db, COPY, &incr).await,
                     Err(Error::InvalidArgument(_))));
    // Snapshots must be sent in order
    assert!(matches!(send(&db, "functional_test_pool/fs@s1",
                          Some("functional_test_pool/fs@s2")).await,
                     Err(Error::InvalidArgument(_))));
}

#[tokio::test]
async fn corrupt_stream() {
    let (_tempdir, db) = harness().await;
    {
        let h = t!(db.open_dataset(FS).await);
        write_object(&db, &h, b"payload").await;
    }
    t!(db.snapshot("functional_test_pool/fs@s1").await);
    let mut stream = t!(send(&db, "functional_test_pool/fs@s1", None).await);
    for r in stream.iter_mut() {
        if let Record::Write{data, ..} = r {
            data[0] ^= 1;
        }
    }
    assert!(matches!(receive(&db, COPY, &stream).await,
                     Err(Error::Integrity(_))));
    assert!(matches!(receive(&db, COPY, &stream[..1]).await,
                     Err(Error::Integrity(_))));
    assert!(!db.list_datasets().contains(&COPY.to_string()));
}

/// Only snapshots can be sent
#[tokio::test]
async fn send_not_a_snapshot() {
    let (_tempdir, db) = harness().await;
    assert!(matches!(send(&db, FS, None).await,
                     Err(Error::NotASnapshot(_))));
}

/// A volume's stream recreates a volume of the same geometry
#[tokio::test]
async fn volume() {
    let (_tempdir, db) = harness().await;
    let vol = "functional_test_pool/vol";
    t!(db.create_volume(vol, 4 << 20, 16384, &[]).await);
    {
        let v = t!(db.open_volume(vol).await);
        t!(v.write(16384 * 3, &[0xEE; 16384]).await);
    }
    t!(db.snapshot("functional_test_pool/vol@s1").await);

    let stream = t!(send(&db, "functional_test_pool/vol@s1", None).await);
    t!(receive(&db, COPY, &stream).await);
    let copy = t!(db.open_volume("functional_test_pool/copy@s1").await);
    assert_eq!(t!(copy.size()), 4 << 20);
    assert_eq!(t!(copy.block_size()), 16384);
    assert_eq!(t!(copy.read(16384 * 3, 16384).await), vec![0xEE; 16384]);
    assert_eq!(t!(copy.read(0, 16384).await), vec![0; 16384]);
    assert!(matches!(db.open_volume(FS).await,
                     Err(Error::InvalidArgument(_))));
}
