// vim: tw=80
//! The I/O pipeline
//!
//! Turns logical blocks into physical ones and back again.  The write path
//! elides zero blocks, compresses, checksums, allocates, and writes each copy.
//! The read path goes through the cache, verifies, self-heals, and
//! decompresses.

use crate::{
    cache::{Cache, Key, ReadResult},
    pool::Pool,
    types::*,
    util::*,
};
use divbuf::DivBufShared;
use futures::channel::oneshot;
use serde_derive::{Deserialize, Serialize};
use std::{
    fmt,
    sync::{Arc, Mutex}
};
use tracing::{debug, warn};
use tracing_futures::Instrument;

mod checksum;
mod compress;

pub use self::checksum::{Checksum, ChecksumAlg};
pub use self::compress::Compression;

/// What kind of data a block holds
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub enum BlockType {
    /// File data
    Data,
    /// A block of child block pointers
    Indirect,
    /// A dataset's dnode table
    Objset,
    /// The meta object set: the dataset graph
    Mos,
}

impl BlockType {
    pub fn is_metadata(self) -> bool {
        self != BlockType::Data
    }
}

/// Most copies that a single block pointer can record
pub const MAX_COPIES: usize = 3;

/// Locates and describes one immutable on-disk block
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct BlockPtr {
    dvas: [Dva; MAX_COPIES],
    ndvas: u8,
    /// Logical size in bytes, before compression
    pub lsize: u32,
    /// Physical size in bytes, after compression but before padding
    pub psize: u32,
    pub checksum_alg: ChecksumAlg,
    pub checksum: Checksum,
    pub compression: Compression,
    pub btype: BlockType,
    /// The txg in which this block was written
    pub birth: TxgT,
}

impl BlockPtr {
    /// Total space allocated for all copies, in bytes
    pub fn asize(&self) -> u64 {
        self.dvas().iter()
            .map(|dva| dva.asize * BYTES_PER_LBA as u64)
            .sum()
    }

    pub fn dvas(&self) -> &[Dva] {
        &self.dvas[..self.ndvas as usize]
    }

    /// A single-copy block pointer that points nowhere in particular
    #[cfg(test)]
    pub(crate) fn fake(lba: LbaT, lbas: LbaT, birth: TxgT) -> Self {
        let mut dvas = [Dva::default(); MAX_COPIES];
        dvas[0] = Dva::new(0, lba, lbas);
        let size = (lbas as usize * BYTES_PER_LBA) as u32;
        BlockPtr {
            dvas,
            ndvas: 1,
            lsize: size,
            psize: size,
            checksum_alg: ChecksumAlg::default(),
            checksum: Checksum([0; 4]),
            compression: Compression::None,
            btype: BlockType::Data,
            birth
        }
    }

    /// Does `buf` hold this block's on-disk contents?
    pub fn verify(&self, buf: &[u8]) -> bool {
        let psize = self.psize as usize;
        buf.len() >= psize &&
            self.checksum_alg.checksum(&buf[..psize]) == self.checksum
    }
}

impl fmt::Display for BlockPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}@{}", self.btype, self.birth)?;
        for dva in self.dvas() {
            write!(f, " {dva}")?;
        }
        Ok(())
    }
}

/// Per-dataset settings that control how blocks are written
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct WriteProps {
    pub compression: Compression,
    pub checksum: ChecksumAlg,
    /// Requested number of copies of each data block
    pub copies: u8,
}

impl Default for WriteProps {
    fn default() -> Self {
        WriteProps {
            compression: Compression::default(),
            checksum: ChecksumAlg::default(),
            copies: 1
        }
    }
}

/// Outcome of scrubbing one block
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ScrubOutcome {
    /// Copies that failed verification
    pub errors: u64,
    /// Copies that were rewritten from good data
    pub repaired: u64,
}

/// The I/O pipeline.  Cheap to clone.
#[derive(Clone)]
pub struct Zio {
    cache: Arc<Mutex<Cache>>,
    /// Give metadata one more copy than the dataset asks for
    ditto_metadata: bool,
    pool: Arc<Pool>,
    /// How many times to reallocate a copy whose write failed
    write_retries: u32,
}

impl Zio {
    pub fn cache(&self) -> &Arc<Mutex<Cache>> {
        &self.cache
    }

    /// Cache the logical contents of a block that was just written
    pub fn cache_insert(&self, bp: &BlockPtr, dbs: Arc<DivBufShared>) {
        let key = Key::new(bp.dvas()[0], bp.birth);
        self.cache.lock().unwrap().insert(key, dbs);
    }

    /// Drop a freed block from the cache
    pub fn evict(&self, bp: &BlockPtr) {
        let key = Key::new(bp.dvas()[0], bp.birth);
        self.cache.lock().unwrap().remove(&key);
    }

    /// Finish a physical read: cache the result and wake the waiters
    fn finish_read(&self, key: Key, r: ReadResult) {
        let mut cache = self.cache.lock().unwrap();
        if let Ok(dbs) = &r {
            cache.insert(key, dbs.clone());
        }
        if let Some(waiters) = cache.pending_insertions.remove(&key) {
            for tx in waiters.into_iter() {
                // The waiter may have been dropped
                let _ = tx.send(r.clone());
            }
        }
    }

    pub fn new(pool: Arc<Pool>, cache: Arc<Mutex<Cache>>, write_retries: u32,
               ditto_metadata: bool) -> Self
    {
        Zio{cache, ditto_metadata, pool, write_retries}
    }

    pub fn pool(&self) -> &Arc<Pool> {
        &self.pool
    }

    /// Read a block, through the cache.
    ///
    /// Concurrent misses for the same block share a single physical read.
    /// That read runs in its own task, so it completes even if every caller
    /// loses interest.
    pub async fn read_block(&self, bp: &BlockPtr) -> ReadResult {
        let key = Key::new(bp.dvas()[0], bp.birth);
        let rx = {
            let mut cache = self.cache.lock().unwrap();
            if let Some(dbs) = cache.get(&key) {
                return Ok(dbs);
            }
            let (tx, rx) = oneshot::channel();
            if let Some(v) = cache.pending_insertions.get_mut(&key) {
                v.push(tx);
            } else {
                cache.pending_insertions.insert(key, vec![tx]);
                let zio = self.clone();
                let bp = *bp;
                let span = tracing::debug_span!("read_block", %bp);
                tokio::spawn(async move {
                    let r = zio.read_uncached(&bp).await;
                    zio.finish_read(key, r);
                }.instrument(span));
            }
            rx
        };
        rx.await.map_err(|_| Error::Shutdown)?
    }

    /// Read and verify a block from disk, trying every copy.
    async fn read_uncached(&self, bp: &BlockPtr) -> ReadResult {
        let verify = |buf: &[u8]| bp.verify(buf);
        let mut bad = Vec::new();
        let mut good = None;
        for dva in bp.dvas() {
            match self.pool.read(dva, &verify).await {
                Ok(buf) => {
                    good = Some(buf);
                    break;
                },
                Err(e) => {
                    warn!(%dva, birth = %bp.birth, "failed to read copy: {}", e);
                    bad.push(*dva);
                }
            }
        }
        let Some(buf) = good else {
            return Err(Error::UnrecoverableIo(bp.dvas()[0]));
        };
        for dva in bad.iter() {
            warn!(%dva, "self-healing ditto copy");
            if let Err(e) = self.pool.write(dva, buf.clone()).await {
                warn!(%dva, "self-heal failed: {}", e);
            }
        }
        let data = bp.compression.decompress(&buf[..bp.psize as usize],
                                             bp.lsize as usize)?;
        Ok(Arc::new(DivBufShared::from(data)))
    }

    /// Read every copy of a block, repairing any that are bad.
    ///
    /// Redundant vdevs repair their own children along the way.  Fails with
    /// `UnrecoverableIo` if no copy is good.
    pub async fn scrub_block(&self, bp: &BlockPtr) -> Result<ScrubOutcome> {
        let verify = |buf: &[u8]| bp.verify(buf);
        let mut outcome = ScrubOutcome::default();
        let mut bad = Vec::new();
        let mut good = None;
        for dva in bp.dvas() {
            match self.pool.read(dva, &verify).await {
                Ok(buf) => good = Some(buf),
                Err(e) => {
                    warn!(%dva, birth = %bp.birth, "scrub error: {}", e);
                    outcome.errors += 1;
                    bad.push(*dva);
                }
            }
        }
        let Some(buf) = good else {
            return Err(Error::UnrecoverableIo(bp.dvas()[0]));
        };
        for dva in bad.iter() {
            if self.pool.write(dva, buf.clone()).await.is_ok() {
                outcome.repaired += 1;
            }
        }
        Ok(outcome)
    }

    /// Write one copy, reallocating elsewhere if the write fails.
    async fn write_copy(&self, dbs: &DivBufShared, lbas: LbaT,
                        avoid: &[VdevT]) -> Result<Dva>
    {
        let mut avoid = avoid.to_vec();
        let mut err = Error::OutOfSpace;
        for _ in 0..=self.write_retries {
            let dva = self.pool.alloc(lbas, &avoid)?;
            match self.pool.write(&dva, frozen(dbs)).await {
                Ok(()) => return Ok(dva),
                Err(e) => {
                    warn!(%dva, "write failed, reallocating: {}", e);
                    self.pool.release(&dva);
                    avoid.push(dva.vdev);
                    err = e;
                }
            }
        }
        Err(err)
    }

    /// Write a logical block.
    ///
    /// Returns `None`, without allocating anything, for an all-zero data
    /// block.  The caller owns the returned block's space: it must either
    /// publish it or [`release`](Pool::release) its DVAs.
    pub async fn write_block(&self, data: &[u8], props: &WriteProps,
                             btype: BlockType, txg: TxgT)
        -> Result<Option<BlockPtr>>
    {
        if btype == BlockType::Data && is_zero(data) {
            return Ok(None);
        }
        let lsize = data.len();
        let (payload, compression) = match props.compression.compress(data) {
            Some(c) => (c, props.compression),
            None => (data.to_vec(), Compression::None)
        };
        let psize = payload.len();
        let checksum = props.checksum.checksum(&payload);
        let padded = pad_to_lba(payload);
        let lbas = (padded.len() / BYTES_PER_LBA) as LbaT;
        let mut ncopies = props.copies.max(1) as usize;
        if btype.is_metadata() && self.ditto_metadata {
            ncopies += 1;
        }
        let ncopies = ncopies.min(MAX_COPIES);
        let dbs = DivBufShared::from(padded);

        let mut dvas = [Dva::default(); MAX_COPIES];
        for i in 0..ncopies {
            let avoid = dvas[..i].iter().map(|d| d.vdev).collect::<Vec<_>>();
            match self.write_copy(&dbs, lbas, &avoid).await {
                Ok(dva) => dvas[i] = dva,
                Err(e) => {
                    for dva in dvas[..i].iter() {
                        self.pool.release(dva);
                    }
                    return Err(e);
                }
            }
        }
        let bp = BlockPtr {
            dvas,
            ndvas: ncopies as u8,
            lsize: lsize as u32,
            psize: psize as u32,
            checksum_alg: props.checksum,
            checksum,
            compression,
            btype,
            birth: txg
        };
        debug!(%bp, lsize, psize, "wrote block");
        Ok(Some(bp))
    }
}

// LCOV_EXCL_START
#[cfg(test)]
pub(crate) mod t {
    use super::*;
    use crate::vdev::{BoxVdevFut, Leaf, TopVdev, VdevKind};
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// A leaf backed by memory that can be made to fail or to corrupt data
    pub(crate) struct MemLeaf {
        data: Mutex<Vec<u8>>,
        pub fail_writes: AtomicBool,
        pub reads: AtomicUsize,
        uuid: Uuid,
    }

    impl MemLeaf {
        pub(crate) fn new(lbas: usize) -> Arc<Self> {
            Arc::new(MemLeaf {
                data: Mutex::new(vec![0u8; lbas * BYTES_PER_LBA]),
                fail_writes: AtomicBool::new(false),
                reads: AtomicUsize::new(0),
                uuid: Uuid::new_v4()
            })
        }

        /// Flip a bit in the first byte of `lba`, counted from the start of
        /// the leaf.
        pub(crate) fn corrupt(&self, lba: LbaT) {
            let off = lba as usize * BYTES_PER_LBA;
            self.data.lock().unwrap()[off] ^= 1;
        }
    }

    impl Leaf for MemLeaf {
        fn read_at(&self, mut buf: IoVecMut, lba: LbaT) -> BoxVdevFut {
            self.reads.fetch_add(1, Ordering::Relaxed);
            let off = lba as usize * BYTES_PER_LBA;
            let data = self.data.lock().unwrap();
            let len = buf.len();
            buf[..].copy_from_slice(&data[off..off + len]);
            Box::pin(futures::future::ok(()))
        }

        fn write_at(&self, buf: IoVec, lba: LbaT) -> BoxVdevFut {
            if self.fail_writes.load(Ordering::Relaxed) {
                return Box::pin(futures::future::err(
                    Error::DeviceIo(std::io::ErrorKind::Other)));
            }
            let off = lba as usize * BYTES_PER_LBA;
            let mut data = self.data.lock().unwrap();
            data[off..off + buf.len()].copy_from_slice(&buf[..]);
            Box::pin(futures::future::ok(()))
        }

        fn sync_all(&self) -> BoxVdevFut {
            Box::pin(futures::future::ok(()))
        }

        fn size(&self) -> LbaT {
            (self.data.lock().unwrap().len() / BYTES_PER_LBA) as LbaT
        }

        fn uuid(&self) -> Uuid {
            self.uuid
        }
    }

    /// Build a Zio over `nvdevs` single-disk vdevs
    pub(crate) fn harness(nvdevs: usize, ditto: bool)
        -> (Zio, Vec<Arc<MemLeaf>>)
    {
        let leaves = (0..nvdevs).map(|_| MemLeaf::new(1024))
            .collect::<Vec<_>>();
        let vdevs = leaves.iter().map(|l| {
            let leaf: Arc<dyn Leaf> = l.clone();
            TopVdev::create(VdevKind::Mirror, vec![leaf]).unwrap()
        }).collect::<Vec<_>>();
        let pool = Arc::new(Pool::create("tank".to_string(), vdevs).unwrap());
        let cache = Arc::new(Mutex::new(Cache::with_capacity(1 << 20)));
        (Zio::new(pool, cache, 2, ditto), leaves)
    }

    fn compressible(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i / 100) as u8).collect()
    }

    #[tokio::test]
    async fn zero_block() {
        let (zio, _) = harness(1, true);
        let before = zio.pool().free_lbas();
        let bp = zio.write_block(&[0u8; 8192], &WriteProps::default(),
                                 BlockType::Data, TxgT(1)).await.unwrap();
        assert!(bp.is_none());
        assert_eq!(zio.pool().free_lbas(), before);
    }

    /// Zero elision is only for data
    #[tokio::test]
    async fn zero_metadata() {
        let (zio, _) = harness(1, false);
        let bp = zio.write_block(&[0u8; 8192], &WriteProps::default(),
                                 BlockType::Indirect, TxgT(1)).await.unwrap();
        assert!(bp.is_some());
    }

    #[tokio::test]
    async fn roundtrip_compressed() {
        let (zio, _) = harness(1, false);
        let data = compressible(65536);
        let bp = zio.write_block(&data, &WriteProps::default(),
                                 BlockType::Data, TxgT(3))
            .await.unwrap().unwrap();
        assert_eq!(bp.compression, Compression::Lz4);
        assert!(bp.psize < bp.lsize);
        assert_eq!(bp.birth, TxgT(3));
        zio.cache().lock().unwrap().drop_cache();
        let dbs = zio.read_block(&bp).await.unwrap();
        assert_eq!(&frozen(&dbs)[..], &data[..]);
    }

    #[tokio::test]
    async fn copies_on_distinct_vdevs() {
        let (zio, _) = harness(3, false);
        let props = WriteProps{copies: 3, ..Default::default()};
        let bp = zio.write_block(&[1u8; 4096], &props, BlockType::Data,
                                 TxgT(1)).await.unwrap().unwrap();
        let mut vdevs = bp.dvas().iter().map(|d| d.vdev).collect::<Vec<_>>();
        vdevs.sort();
        assert_eq!(vdevs, vec![0, 1, 2]);
        assert_eq!(bp.asize(), 3 * 4096);
    }

    #[tokio::test]
    async fn ditto_metadata() {
        let (zio, _) = harness(2, true);
        let bp = zio.write_block(&[1u8; 4096], &WriteProps::default(),
                                 BlockType::Objset, TxgT(1))
            .await.unwrap().unwrap();
        assert_eq!(bp.dvas().len(), 2);
        let bp = zio.write_block(&[1u8; 4096], &WriteProps::default(),
                                 BlockType::Data, TxgT(1))
            .await.unwrap().unwrap();
        assert_eq!(bp.dvas().len(), 1);
    }

    /// A write that fails is retried on another vdev
    #[tokio::test]
    async fn write_retry() {
        let (zio, leaves) = harness(2, false);
        leaves[0].fail_writes.store(true, Ordering::Relaxed);
        let free0 = zio.pool().free_lbas();
        for _ in 0..4 {
            let bp = zio.write_block(&[1u8; 4096], &WriteProps::default(),
                                     BlockType::Data, TxgT(1))
                .await.unwrap().unwrap();
            assert_eq!(bp.dvas()[0].vdev, 1);
        }
        // Failed allocations were released
        assert_eq!(zio.pool().free_lbas(), free0 - 4);
    }

    #[tokio::test]
    async fn write_all_fail() {
        let (zio, leaves) = harness(1, false);
        leaves[0].fail_writes.store(true, Ordering::Relaxed);
        let free0 = zio.pool().free_lbas();
        let r = zio.write_block(&[1u8; 4096], &WriteProps::default(),
                                BlockType::Data, TxgT(1)).await;
        assert!(matches!(r, Err(Error::DeviceIo(_))));
        assert_eq!(zio.pool().free_lbas(), free0);
    }

    /// A cached block is not read again
    #[tokio::test]
    async fn cache_hit() {
        let (zio, leaves) = harness(1, false);
        let bp = zio.write_block(&[7u8; 4096], &WriteProps::default(),
                                 BlockType::Data, TxgT(1))
            .await.unwrap().unwrap();
        zio.read_block(&bp).await.unwrap();
        zio.read_block(&bp).await.unwrap();
        assert_eq!(leaves[0].reads.load(Ordering::Relaxed), 1);
        let stats = zio.cache().lock().unwrap().stats();
        assert_eq!(stats.hits, 1);
    }

    /// Concurrent misses share one physical read
    #[tokio::test]
    async fn single_flight() {
        let (zio, leaves) = harness(1, false);
        let bp = zio.write_block(&[7u8; 4096], &WriteProps::default(),
                                 BlockType::Data, TxgT(1))
            .await.unwrap().unwrap();
        let (a, b) = futures::join!(zio.read_block(&bp), zio.read_block(&bp));
        assert_eq!(&frozen(&a.unwrap())[..], &frozen(&b.unwrap())[..]);
        assert_eq!(leaves[0].reads.load(Ordering::Relaxed), 1);
    }

    /// A corrupt ditto copy is detected and rewritten from the good one
    #[tokio::test]
    async fn ditto_self_heal() {
        let (zio, leaves) = harness(2, false);
        let props = WriteProps{copies: 2, ..Default::default()};
        let bp = zio.write_block(&[7u8; 4096], &props, BlockType::Data,
                                 TxgT(1)).await.unwrap().unwrap();
        let dva0 = bp.dvas()[0];
        leaves[dva0.vdev as usize].corrupt(
            dva0.lba + crate::label::LEAF_RESERVED_LBAS);
        let dbs = zio.read_block(&bp).await.unwrap();
        assert_eq!(&frozen(&dbs)[..], &[7u8; 4096][..]);

        // After healing, a scrub finds nothing wrong
        let outcome = zio.scrub_block(&bp).await.unwrap();
        assert_eq!(outcome, ScrubOutcome::default());
    }

    #[tokio::test]
    async fn scrub_repairs() {
        let (zio, leaves) = harness(2, false);
        let props = WriteProps{copies: 2, ..Default::default()};
        let bp = zio.write_block(&[7u8; 4096], &props, BlockType::Data,
                                 TxgT(1)).await.unwrap().unwrap();
        let dva1 = bp.dvas()[1];
        leaves[dva1.vdev as usize].corrupt(
            dva1.lba + crate::label::LEAF_RESERVED_LBAS);
        let outcome = zio.scrub_block(&bp).await.unwrap();
        assert_eq!(outcome, ScrubOutcome{errors: 1, repaired: 1});
        let outcome = zio.scrub_block(&bp).await.unwrap();
        assert_eq!(outcome, ScrubOutcome::default());
    }

    /// When every copy is bad, nothing is cached
    #[tokio::test]
    async fn unrecoverable() {
        let (zio, leaves) = harness(1, false);
        let bp = zio.write_block(&[7u8; 4096], &WriteProps::default(),
                                 BlockType::Data, TxgT(1))
            .await.unwrap().unwrap();
        let dva0 = bp.dvas()[0];
        leaves[0].corrupt(dva0.lba + crate::label::LEAF_RESERVED_LBAS);
        let r = zio.read_block(&bp).await;
        assert_eq!(r.unwrap_err(), Error::UnrecoverableIo(dva0));
        assert_eq!(zio.cache().lock().unwrap().size(), 0);
    }

    #[tokio::test]
    async fn evict() {
        let (zio, _) = harness(1, false);
        let bp = zio.write_block(&[7u8; 4096], &WriteProps::default(),
                                 BlockType::Data, TxgT(1))
            .await.unwrap().unwrap();
        zio.read_block(&bp).await.unwrap();
        assert_eq!(zio.cache().lock().unwrap().size(), 4096);
        zio.evict(&bp);
        assert_eq!(zio.cache().lock().unwrap().size(), 0);
    }
}
// LCOV_EXCL_STOP
