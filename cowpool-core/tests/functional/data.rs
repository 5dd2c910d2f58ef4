// vim: tw=80
//! Object data path, through a real pool on files
use pretty_assertions::assert_eq;
use cowpool_core::property::{Property, PropertyName};
use cowpool_core::zio::Compression;
use rand::{Rng, RngCore, SeedableRng};
use rand_xorshift::XorShiftRng;

use super::*;

async fn harness() -> (TempDir, Database) {
    let (tempdir, _paths, db) = PoolBuilder::new().build().await;
    t!(db.create_dataset("functional_test_pool/fs", &[]).await);
    (tempdir, db)
}

/// All-zero blocks are stored as holes
#[tokio::test]
async fn zero_block() {
    let (_tempdir, db) = harness().await;
    let h = t!(db.open_dataset("functional_test_pool/fs").await);
    let before = db.pool_status().allocated;
    let object = write_object(&db, &h, &[0u8; 1 << 18]).await;
    let after = db.pool_status().allocated;
    // Only metadata got written
    assert!(after - before < 1 << 18);
    assert_eq!(t!(h.object_info(object)).size, 1 << 18);
    assert_eq!(t!(h.read(object, 4096, 8192).await), vec![0u8; 8192]);
}

/// A held range doesn't see later writes
#[tokio::test]
async fn hold_range_isolation() {
    let (_tempdir, db) = harness().await;
    let h = t!(db.open_dataset("functional_test_pool/fs").await);
    let object = write_object(&db, &h, &[0xaa; 16384]).await;
    let view = t!(h.hold_range(object, 2048, 8192).await);
    overwrite(&db, &h, object, 0, &[0xbb; 16384]).await;
    assert_eq!(view.read(), vec![0xaa; 8192]);
    assert_eq!(t!(h.read(object, 2048, 8192).await), vec![0xbb; 8192]);
}

/// Unaligned writes preserve the rest of each block
#[tokio::test]
async fn partial_block_write() {
    let (_tempdir, db) = harness().await;
    let h = t!(db.open_dataset("functional_test_pool/fs").await);
    let object = write_object(&db, &h, &[b'A'; 8192]).await;
    {
        let tx = t!(h.begin_transaction(4).await);
        t!(tx.hold_object_for_write(object, 4094, 4).await);
        t!(tx.write(object, 4094, b"BBBB").await);
        // Visible within the transaction's txg before it syncs
        assert_eq!(t!(tx.read(object, 4092, 8).await), b"AABBBBAA");
        tx.commit();
    }
    t!(db.sync_transaction().await);
    let mut expected = vec![b'A'; 8192];
    expected[4094..4098].copy_from_slice(b"BBBB");
    assert_eq!(t!(h.read(object, 0, 8192).await), expected);
}

#[tokio::test]
async fn truncate_and_free_range() {
    let (_tempdir, db) = harness().await;
    let h = t!(db.open_dataset("functional_test_pool/fs").await);
    let object = write_object(&db, &h, &[1u8; 4096 * 8]).await;
    {
        let tx = t!(h.begin_transaction(0).await);
        t!(tx.free_range(object, 4096, 8192).await);
        t!(tx.truncate(object, 4096 * 6).await);
        tx.commit();
    }
    t!(db.sync_transaction().await);
    assert_eq!(t!(h.object_info(object)).size, 4096 * 6);
    let data = t!(h.read(object, 0, 4096 * 8).await);
    assert_eq!(data.len(), 4096 * 6);
    assert_eq!(&data[..4096], &[1u8; 4096][..]);
    assert_eq!(&data[4096..4096 * 3], &[0u8; 8192][..]);
    assert_eq!(&data[4096 * 3..], &[1u8; 4096 * 3][..]);
}

/// Objects too big for one indirect block grow more levels
#[tokio::test]
async fn deep_object() {
    let (_tempdir, db) = harness().await;
    let h = t!(db.open_dataset("functional_test_pool/fs").await);
    let object = write_object(&db, &h, b"head").await;
    let far = 4096 * 128 * 3;
    overwrite(&db, &h, object, far, b"tail").await;
    let info = t!(h.object_info(object));
    assert_eq!(info.size, far + 4);
    assert!(info.nlevels >= 3);
    assert_eq!(t!(h.read(object, 0, 4).await), b"head");
    assert_eq!(t!(h.read(object, far, 4).await), b"tail");
    assert_eq!(t!(h.read(object, 4096, 4).await), vec![0u8; 4]);
}

#[tokio::test]
async fn free_object() {
    let (_tempdir, db) = harness().await;
    let h = t!(db.open_dataset("functional_test_pool/fs").await);
    let object = write_object(&db, &h, &[7u8; 4096]).await;
    let allocated = db.pool_status().allocated;
    {
        let tx = t!(h.begin_transaction(0).await);
        t!(tx.free_object(object));
        tx.commit();
    }
    t!(db.sync_transaction().await);
    assert!(matches!(h.object_info(object), Err(Error::ObjectNotFound(_))));
    assert!(!h.objects().contains(&object));
    assert!(db.pool_status().allocated < allocated);
}

#[tokio::test]
async fn compression() {
    let (_tempdir, db) = harness().await;
    let name = "functional_test_pool/fs";
    t!(db.set_prop(name, Property::Compression(Compression::Lz4)).await);
    let h = t!(db.open_dataset(name).await);
    let data = (0..1 << 16).map(|i| (i / 512) as u8).collect::<Vec<_>>();
    let object = write_object(&db, &h, &data).await;
    let stats = t!(db.dataset_stats(name));
    assert!(stats.compressed < stats.uncompressed);
    assert_eq!(t!(h.read(object, 0, 1 << 16).await), data);
    assert_eq!(t!(db.get_prop(name, PropertyName::Compression)).0,
               Property::Compression(Compression::Lz4));
}

#[tokio::test]
async fn record_size() {
    let (_tempdir, db) = harness().await;
    let name = "functional_test_pool/fs";
    t!(db.set_prop(name, Property::RecordSize(14)).await);
    let h = t!(db.open_dataset(name).await);
    let bs = t!(h.record_size());
    assert_eq!(bs, 16384);
    let tx = t!(h.begin_transaction(0).await);
    let object = t!(tx.create_object(bs));
    tx.commit();
    assert_eq!(t!(h.object_info(object)).block_size, 16384);
}

/// Scattered writes of random data at random offsets, checked against a
/// shadow copy after every sync
#[test_log::test(tokio::test)]
async fn random_writes() {
    let (_tempdir, db) = harness().await;
    let h = t!(db.open_dataset("functional_test_pool/fs").await);
    let len = 1usize << 19;
    let mut shadow = vec![0u8; len];
    let object = write_object(&db, &h, &shadow).await;
    let mut rng = XorShiftRng::seed_from_u64(12345);
    for _ in 0..8 {
        {
            let tx = t!(h.begin_transaction(1 << 16).await);
            for _ in 0..4 {
                let wlen = rng.gen_range(1..8192usize);
                let offset = rng.gen_range(0..len - wlen);
                let mut buf = vec![0u8; wlen];
                rng.fill_bytes(&mut buf);
                t!(tx.write(object, offset as u64, &buf).await);
                shadow[offset..offset + wlen].copy_from_slice(&buf);
            }
            tx.commit();
        }
        t!(db.sync_transaction().await);
        assert_eq!(t!(h.read(object, 0, len as u64).await), shadow);
    }
}
