// vim: tw=80
//! Common type definitions used throughout cowpool
use divbuf::{DivBuf, DivBufMut};
use serde_derive::{Deserialize, Serialize};
use serde::{
    ser::{Serialize, Serializer},
    de::{Deserialize, Deserializer},
    ser::SerializeTuple
};
use thiserror::Error;
use std::{
    fmt::{self, Display, Formatter},
    io,
    ops::{Add, AddAssign, Sub},
    str::FromStr,
};

/// Our `IoVec`.  Unlike the standard library's, ours is reference-counted so it
/// can have more than one owner.
pub type IoVec = DivBuf;

/// Mutable version of `IoVec`.  Uniquely owned.
pub type IoVecMut = DivBufMut;

/// Our scatter-gather list.  A slice of reference-counted `IoVec`s.
pub type SGList = Vec<IoVec>;

/// Indexes an LBA.  LBAs are always 4096 bytes
pub type LbaT = u64;

/// Indexes a top-level vdev within the `Pool`.
pub type VdevT = u16;

/// Identifies an object within one dataset
pub type ObjectId = u64;

/// cowpool's error type.
///
/// Every variant that can be attributed to a dataset, object, or block carries
/// its identity so callers can report a precise diagnostic.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum Error {
    /// A device returned an error.  Usually retried against redundancy before
    /// it gets this far.
    #[error("Device I/O error: {0:?}")]
    DeviceIo(io::ErrorKind),
    #[error("Checksum mismatch reading {0}")]
    ChecksumMismatch(Dva),
    /// Every copy and every reconstruction of a block failed.
    #[error("Unrecoverable I/O error reading {0}")]
    UnrecoverableIo(Dva),
    #[error("No space left in pool")]
    OutOfSpace,
    #[error("Quota exceeded for {0}")]
    QuotaExceeded(String),
    #[error("{0} has dependent clones")]
    HasDependentClones(String),
    #[error("{0} has later snapshots")]
    HasLaterSnapshots(String),
    #[error("{0} has snapshots")]
    HasSnapshots(String),
    #[error("{0} has child datasets")]
    HasChildren(String),
    #[error("{0} is not a snapshot")]
    NotASnapshot(String),
    #[error("{0} is not a clone")]
    NotAClone(String),
    /// Malformed pool or dataset configuration.  Rejected before any mutation.
    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),
    #[error("Dataset {0} does not exist")]
    DatasetNotFound(String),
    #[error("Object {0} does not exist")]
    ObjectNotFound(ObjectId),
    #[error("{0} already exists")]
    Exists(String),
    #[error("{0} is busy")]
    Busy(String),
    #[error("{0} is read-only")]
    ReadOnly(String),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Pool {0} not found")]
    PoolNotFound(String),
    /// On-disk metadata failed verification
    #[error("Integrity check failed: {0}")]
    Integrity(String),
    #[error("Pool is shutting down")]
    Shutdown,
}

impl Error {
    /// Should the I/O pipeline retry this error against redundant copies?
    pub fn is_retriable(&self) -> bool {
        matches!(self, Error::DeviceIo(_) | Error::ChecksumMismatch(_))
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::DeviceIo(e.kind())
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Integrity(e.to_string())
    }
}

impl From<serde_yaml_ng::Error> for Error {
    fn from(e: serde_yaml_ng::Error) -> Self {
        Error::ConfigInvalid(e.to_string())
    }
}

pub type Result<T> = ::std::result::Result<T, Error>;

/// Transaction group numbers.
///
/// Txg 0 is never synced.  It marks things that predate the pool, like the
/// birth of a hole or the `prev_snap_txg` of a dataset with no snapshots.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq,
         PartialOrd, Serialize)]
pub struct TxgT(pub u64);

impl TxgT {
    /// Which of the two label slots does this txg's uberblock use?
    pub fn label_slot(self) -> u32 {
        (self.0 % 2) as u32
    }
}

impl Add<u64> for TxgT {
    type Output = Self;

    fn add(self, rhs: u64) -> Self::Output {
        TxgT(self.0 + rhs)
    }
}

impl AddAssign<u64> for TxgT {
    fn add_assign(&mut self, rhs: u64) {
        *self = TxgT(self.0 + rhs)
    }
}

impl Sub<u64> for TxgT {
    type Output = Self;

    fn sub(self, rhs: u64) -> Self::Output {
        TxgT(self.0 - rhs)
    }
}

impl From<u64> for TxgT {
    fn from(t: u64) -> Self {
        TxgT(t)
    }
}

impl From<TxgT> for u64 {
    fn from(t: TxgT) -> Self {
        t.0
    }
}

impl Display for TxgT {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Data Virtual Address.
///
/// Locates one copy of a block within a pool: the top-level vdev, the first
/// LBA within that vdev's address space, and the number of LBAs allocated,
/// including any parity.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, Eq, Hash, Ord,
         PartialEq, PartialOrd)]
pub struct Dva {
    pub vdev: VdevT,
    pub lba: LbaT,
    pub asize: LbaT,
}

impl Dva {
    pub fn new(vdev: VdevT, lba: LbaT, asize: LbaT) -> Self {
        Dva {vdev, lba, asize}
    }
}

impl Display for Dva {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "<{}:{:#x}:{}>", self.vdev, self.lba, self.asize)
    }
}

/// Identifies a dataset (head, snapshot, or clone) in the pool's graph.
///
/// Ids are never reused.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq,
         PartialOrd, Ord, Serialize)]
pub struct DatasetId(pub u64);

impl Display for DatasetId {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "ds{}", self.0)
    }
}

/// Identifies a dataset directory: a head dataset together with its snapshots
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq,
         PartialOrd, Ord, Serialize)]
pub struct DirId(pub u64);

/// cowpool UUID type
///
/// This is just like the `Uuid` from the `uuid` crate, except that it
/// serializes as a fixed-size array instead of a slice
// The Uuid crate serializes to a slice, and its maintainers have ruled out ever
// serializing to a fixed-size array instead.
// See Also [Uuid #557](https://github.com/uuid-rs/uuid/issues/557)
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub struct Uuid(uuid::Uuid);

impl Uuid {
    pub fn new_v4() -> Self {
        Uuid(uuid::Uuid::new_v4())
    }

    pub fn parse_str(input: &str) -> std::result::Result<Uuid, uuid::Error> {
        uuid::Uuid::parse_str(input).map(Uuid)
    }

    /// A 64-bit identifier derived from the Uuid, used for dataset GUIDs
    pub fn as_u64(&self) -> u64 {
        self.0.as_u64_pair().0
    }
}

impl FromStr for Uuid {
    type Err = <uuid::Uuid as FromStr>::Err;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        uuid::Uuid::from_str(s).map(Self)
    }
}

impl<'de> Deserialize<'de> for Uuid {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
        where D: Deserializer<'de>
    {
        <[u8; 16]>::deserialize(deserializer)
        .map(|v| Uuid(uuid::Uuid::from_bytes(v)))
    }
}

impl Display for Uuid {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl Serialize for Uuid {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
        where S: Serializer
    {
        let bytes = self.0.as_bytes();
        debug_assert_eq!(bytes.len(), 16);
        let mut tup = serializer.serialize_tuple(16)?;
        for b in bytes.iter() {
            tup.serialize_element(&b)?;
        }
        tup.end()
    }
}

// LCOV_EXCL_STOP
