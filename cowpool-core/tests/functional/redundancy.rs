// vim: tw=80
//! Degraded operation and scrub, on mirrors and RAID-Z
use pretty_assertions::assert_eq;
use std::{
    fs::OpenOptions,
    io::{Seek, SeekFrom, Write},
    path::Path,
};
use cowpool_core::{
    label::LEAF_RESERVED_LBAS,
    property::Property,
    vdev::{Health, TopVdev, VdevKind},
};
use rstest::rstest;

use super::*;

const POOLNAME: &str = "functional_test_pool";
const FS: &str = "functional_test_pool/fs";

/// Overwrite everything past the labels with garbage
fn scribble(path: &Path, len: u64) {
    let mut f = OpenOptions::new().write(true).open(path).unwrap();
    let start = LEAF_RESERVED_LBAS * BYTES_PER_LBA as u64;
    f.seek(SeekFrom::Start(start)).unwrap();
    let garbage = vec![0xa5u8; (len - start) as usize];
    f.write_all(&garbage).unwrap();
    f.sync_all().unwrap();
}

/// Write some data, export, and reimport without the first leaf.
#[rstest]
#[case::mirror(false, 2)]
#[case::raidz(true, 3)]
#[test_log::test(tokio::test)]
async fn degraded(#[case] raidz: bool, #[case] disks: usize) {
    let mut builder = PoolBuilder::new();
    builder.disks(disks).fsize(1 << 24);
    if raidz {
        builder.raidz();
    }
    let (_tempdir, paths, db) = builder.build().await;
    t!(db.create_dataset(FS, &[]).await);
    let data = (0..100_000u32).map(|i| (i % 253) as u8).collect::<Vec<_>>();
    let object = {
        let h = t!(db.open_dataset(FS).await);
        write_object(&db, &h, &data).await
    };
    t!(db.export().await);

    let db = t!(Database::open_files(POOLNAME, &paths[1..],
                                     Tunables::default()).await);
    let status = db.pool_status();
    assert!(matches!(status.health, Health::Degraded(_)));
    let h = t!(db.open_dataset(FS).await);
    assert_eq!(t!(h.read(object, 0, data.len() as u64).await), data);
    // Still writable
    overwrite(&db, &h, object, 0, b"degraded").await;
    assert_eq!(t!(h.read(object, 0, 8).await), b"degraded");
}

/// With too many leaves missing, the pool can't be imported
#[tokio::test]
async fn faulted() {
    let (_tempdir, paths, db) = PoolBuilder::new().disks(3).raidz().build()
        .await;
    t!(db.export().await);
    let r = Database::open_files(POOLNAME, &paths[2..], Tunables::default())
        .await;
    assert!(r.is_err());
}

#[tokio::test]
async fn scrub_clean() {
    let (_tempdir, _paths, db) = PoolBuilder::new().disks(2).build().await;
    t!(db.create_dataset(FS, &[]).await);
    {
        let h = t!(db.open_dataset(FS).await);
        write_object(&db, &h, &[4u8; 32768]).await;
    }
    let stats = t!(db.scrub().await);
    assert!(stats.blocks > 0);
    assert_eq!(stats.errors, 0);
    assert_eq!(stats.unrecoverable, 0);
}

/// Two single-disk vdevs with copies=2.  Destroy one disk's contents, and the
/// scrub rewrites every copy that lived there.
#[tokio::test]
async fn scrub_repairs_ditto_copies() {
    let fsize = 1 << 24;
    let (_tempdir, paths) = PoolBuilder::new().disks(2).fsize(fsize).files();
    let vdevs = paths.iter().map(|p| {
        let leaf = Arc::new(t!(VdevFile::create(p))) as Arc<dyn Leaf>;
        t!(TopVdev::create(VdevKind::Mirror, vec![leaf]))
    }).collect::<Vec<_>>();
    let db = t!(Database::create(POOLNAME, vdevs, Tunables::default()).await);
    t!(db.create_dataset(FS, &[Property::Copies(2)]).await);
    let object = {
        let h = t!(db.open_dataset(FS).await);
        write_object(&db, &h, &[5u8; 65536]).await
    };
    scribble(&paths[1], fsize);

    let stats = t!(db.scrub().await);
    assert!(stats.errors > 0);
    assert_eq!(stats.repaired, stats.errors);
    assert_eq!(stats.unrecoverable, 0);
    let again = t!(db.scrub().await);
    assert_eq!(again.errors, 0);
    let h = t!(db.open_dataset(FS).await);
    assert_eq!(t!(h.read(object, 0, 65536).await), vec![5u8; 65536]);
}
