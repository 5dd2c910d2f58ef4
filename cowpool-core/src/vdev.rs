// vim: tw=80
//! Virtual devices
//!
//! A pool is built from top-level vdevs, each of which is either a mirror or a
//! raidz group of leaf devices.  Leaves are anything that implements [`Leaf`],
//! usually a [`VdevFile`](crate::vdev_file::VdevFile).

use std::{
    collections::BTreeMap,
    fmt,
    num::NonZeroU8,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering}
    }
};
#[cfg(test)] use mockall::automock;
use serde_derive::{Deserialize, Serialize};
use tracing::warn;
use crate::{
    mirror::Mirror,
    raidz::Raidz,
    types::*,
};

/// Represents the health of a vdev or pool
///
/// The ordering reflects which Health is "sicker".  That is, a degraded vdev is
/// sicker than an online one, a doubly-degraded vdev is sicker than a
/// singly-degraded one, etc.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, PartialOrd, Ord,
         Serialize)]
pub enum Health {
    /// Perfectly healthy
    Online,
    /// Operating with reduced redundancy
    Degraded(NonZeroU8),
    /// Faulted.  No I/O is possible
    Faulted,
}

impl Health {
    /// If this vdev is degraded, how many levels of redundancy is it missing?
    pub fn as_degraded(self) -> Option<NonZeroU8> {
        if let Health::Degraded(d) = self {
            Some(d)
        } else {
            None
        }
    }
}

impl fmt::Display for Health {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::Online => "Online".fmt(f),
            Self::Degraded(n) => write!(f, "Degraded({})", n),
            Self::Faulted => "Faulted".fmt(f),
        }
    }
}

/// Boxed future representing an operation on a vdev.
pub type BoxVdevFut = Pin<Box<dyn futures::Future<Output = Result<()>> + Send
    + Sync>>;

/// Block verification callback.
///
/// Redundant vdevs use it to decide whether a copy or a reconstruction is
/// good.  The buffer is always a whole number of LBAs.
pub type Verify<'a> = &'a (dyn Fn(&[u8]) -> bool + Send + Sync);

/// A leaf device: the physical storage that vdevs are built from.
///
/// LBAs are absolute, counted from the start of the device.  The first
/// [`LEAF_RESERVED_LBAS`](crate::label::LEAF_RESERVED_LBAS) hold labels.
#[cfg_attr(test, automock)]
pub trait Leaf: Send + Sync {
    /// Read exactly `buf.len()` bytes starting at `lba`
    fn read_at(&self, buf: IoVecMut, lba: LbaT) -> BoxVdevFut;

    /// Write all of `buf` starting at `lba`
    fn write_at(&self, buf: IoVec, lba: LbaT) -> BoxVdevFut;

    /// Ensure that all writes so far have reached stable storage
    fn sync_all(&self) -> BoxVdevFut;

    /// Total size of the device, in LBAs
    fn size(&self) -> LbaT;

    fn uuid(&self) -> Uuid;
}

/// What kind of redundancy a top-level vdev provides
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum VdevKind {
    Mirror,
    Raidz,
}

/// Describes one top-level vdev.  Stored in every label of every leaf.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
pub struct VdevLabel {
    pub uuid: Uuid,
    pub kind: VdevKind,
    /// Usable size of the vdev's address space in LBAs, fixed at creation
    pub size: LbaT,
    pub children: Vec<Uuid>,
}

/// Status of one leaf
#[derive(Clone, Debug)]
pub struct LeafStatus {
    pub uuid: Uuid,
    pub health: Health,
}

/// Return value of [`TopVdev::status`]
#[derive(Clone, Debug)]
pub struct VdevStatus {
    pub uuid: Uuid,
    pub kind: VdevKind,
    pub health: Health,
    pub leaves: Vec<LeafStatus>,
}

/// Compute a vdev's health from its leaves' health
pub(crate) fn summarize_health(leaves: &[LeafStatus], tolerance: usize)
    -> Health
{
    let sick = leaves.iter()
        .filter(|l| l.health != Health::Online)
        .count();
    if sick > tolerance {
        Health::Faulted
    } else {
        NonZeroU8::new(sick as u8)
            .map(Health::Degraded)
            .unwrap_or(Health::Online)
    }
}

/// A child of a redundant vdev.  Either a leaf or a missing disk
pub(crate) enum Child {
    Present {
        leaf: Arc<dyn Leaf>,
        /// Set after a failed write.  Faulted children get no further I/O.
        faulted: AtomicBool,
    },
    Missing(Uuid)
}

impl Child {
    pub(crate) fn present(leaf: Arc<dyn Leaf>) -> Self {
        Child::Present{leaf, faulted: AtomicBool::new(false)}
    }

    pub(crate) fn missing(uuid: Uuid) -> Self {
        Child::Missing(uuid)
    }

    /// Return the leaf, if it's present and healthy
    pub(crate) fn usable(&self) -> Option<&Arc<dyn Leaf>> {
        match self {
            Child::Present{leaf, faulted}
                if !faulted.load(Ordering::Relaxed) => Some(leaf),
            _ => None
        }
    }

    pub(crate) fn fault(&self) {
        if let Child::Present{leaf, faulted} = self {
            if !faulted.swap(true, Ordering::Relaxed) {
                warn!(leaf = %leaf.uuid(), "faulting leaf");
            }
        }
    }

    pub(crate) fn status(&self) -> LeafStatus {
        let (uuid, health) = match self {
            Child::Present{leaf, faulted} => {
                let health = if faulted.load(Ordering::Relaxed) {
                    Health::Faulted
                } else {
                    Health::Online
                };
                (leaf.uuid(), health)
            },
            Child::Missing(uuid) => (*uuid, Health::Faulted)
        };
        LeafStatus{uuid, health}
    }

    pub(crate) fn uuid(&self) -> Uuid {
        match self {
            Child::Present{leaf, ..} => leaf.uuid(),
            Child::Missing(uuid) => *uuid
        }
    }
}

/// A top-level vdev.  Data blocks are allocated from these.
pub enum TopVdev {
    Mirror(Mirror),
    Raidz(Raidz),
}

impl TopVdev {
    /// Create a brand new top-level vdev from blank leaves
    pub fn create(kind: VdevKind, leaves: Vec<Arc<dyn Leaf>>) -> Result<Self> {
        match kind {
            VdevKind::Mirror => Mirror::create(leaves).map(TopVdev::Mirror),
            VdevKind::Raidz => Raidz::create(leaves).map(TopVdev::Raidz),
        }
    }

    /// Open an existing top-level vdev.
    ///
    /// Leaves that belong to it are removed from `leaves`.  Missing leaves are
    /// tolerated as long as enough remain to read all data.
    pub fn open(label: &VdevLabel,
                leaves: &mut BTreeMap<Uuid, Arc<dyn Leaf>>) -> Result<Self>
    {
        match label.kind {
            VdevKind::Mirror => Mirror::open(label, leaves)
                .map(TopVdev::Mirror),
            VdevKind::Raidz => Raidz::open(label, leaves).map(TopVdev::Raidz),
        }
    }

    /// How many LBAs must be allocated to store `lbas` LBAs of data?
    pub fn asize(&self, lbas: LbaT) -> LbaT {
        match self {
            TopVdev::Mirror(_) => lbas,
            TopVdev::Raidz(r) => r.asize(lbas),
        }
    }

    pub fn label(&self) -> VdevLabel {
        match self {
            TopVdev::Mirror(m) => m.label(),
            TopVdev::Raidz(r) => r.label(),
        }
    }

    /// All leaves that are present and not faulted
    pub fn leaves(&self) -> Vec<Arc<dyn Leaf>> {
        match self {
            TopVdev::Mirror(m) => m.leaves(),
            TopVdev::Raidz(r) => r.leaves(),
        }
    }

    /// Read the data stored at `dva`, returning `dva.asize` LBAs worth of
    /// data, minus any parity.
    pub async fn read(&self, dva: &Dva, verify: Verify<'_>) -> Result<IoVec> {
        match self {
            TopVdev::Mirror(m) => m.read(dva, verify).await,
            TopVdev::Raidz(r) => r.read(dva, verify).await,
        }
    }

    /// Usable size of the vdev's address space in LBAs
    pub fn size(&self) -> LbaT {
        match self {
            TopVdev::Mirror(m) => m.size(),
            TopVdev::Raidz(r) => r.size(),
        }
    }

    pub fn status(&self) -> VdevStatus {
        match self {
            TopVdev::Mirror(m) => m.status(),
            TopVdev::Raidz(r) => r.status(),
        }
    }

    pub async fn sync_all(&self) -> Result<()> {
        match self {
            TopVdev::Mirror(m) => m.sync_all().await,
            TopVdev::Raidz(r) => r.sync_all().await,
        }
    }

    pub fn uuid(&self) -> Uuid {
        self.label().uuid
    }

    /// Write `buf`, which must be a whole number of LBAs, to `dva`
    pub async fn write(&self, dva: &Dva, buf: IoVec) -> Result<()> {
        match self {
            TopVdev::Mirror(m) => m.write(dva, buf).await,
            TopVdev::Raidz(r) => r.write(dva, buf).await,
        }
    }
}

// LCOV_EXCL_STOP
