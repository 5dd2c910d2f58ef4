// vim: tw=80
//! Pool configuration: engine tunables and vdev topology

use crate::types::*;
use serde_derive::{Deserialize, Serialize};
use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    time::Duration
};

/// Engine tunables.  Every field has a default, so a YAML document need only
/// mention the ones it changes.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Tunables {
    /// Sync a dirty txg at least this often, in milliseconds
    pub sync_interval_ms: u64,
    /// Close the open txg once it holds this many dirty bytes.  Writers are
    /// throttled until it does.
    pub dirty_max: u64,
    /// Capacity of the block cache in bytes
    pub cache_size: usize,
    /// How many times to reallocate a block copy whose write failed
    pub write_retries: u32,
    /// Give metadata blocks one more copy than data, up to 3
    pub ditto_metadata: bool,
}

impl Default for Tunables {
    fn default() -> Self {
        Tunables {
            sync_interval_ms: 5000,
            dirty_max: 64 << 20,
            cache_size: 64 << 20,
            write_retries: 3,
            ditto_metadata: true,
        }
    }
}

impl Tunables {
    pub fn from_yaml(s: &str) -> Result<Self> {
        let t: Tunables = serde_yaml_ng::from_str(s)?;
        t.validate()?;
        Ok(t)
    }

    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let s = std::fs::read_to_string(path)?;
        Tunables::from_yaml(&s)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.sync_interval_ms == 0 {
            return Err(Error::ConfigInvalid(
                "sync_interval_ms must be positive".to_string()));
        }
        if self.dirty_max == 0 {
            return Err(Error::ConfigInvalid(
                "dirty_max must be positive".to_string()));
        }
        Ok(())
    }
}

/// One top-level vdev of a pool being created
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum VdevSpec {
    /// A mirror of one or more leaves.  One leaf is a plain disk.
    Mirror(Vec<PathBuf>),
    /// Single-parity RAID over two or more leaves
    Raidz(Vec<PathBuf>),
}

impl VdevSpec {
    pub fn paths(&self) -> &[PathBuf] {
        match self {
            VdevSpec::Mirror(p) | VdevSpec::Raidz(p) => &p[..]
        }
    }
}

/// The layout of a pool being created
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct TopologySpec {
    pub vdevs: Vec<VdevSpec>,
}

impl TopologySpec {
    pub fn from_yaml(s: &str) -> Result<Self> {
        let t: TopologySpec = serde_yaml_ng::from_str(s)?;
        t.validate()?;
        Ok(t)
    }

    /// Reject impossible layouts before anything touches a disk
    pub fn validate(&self) -> Result<()> {
        if self.vdevs.is_empty() {
            return Err(Error::ConfigInvalid("no vdevs".to_string()));
        }
        let mut seen = HashSet::new();
        for vdev in self.vdevs.iter() {
            match vdev {
                VdevSpec::Mirror(p) if p.is_empty() =>
                    return Err(Error::ConfigInvalid(
                        "a mirror needs at least one leaf".to_string())),
                VdevSpec::Raidz(p) if p.len() < 2 =>
                    return Err(Error::ConfigInvalid(
                        "raidz needs at least two leaves".to_string())),
                VdevSpec::Raidz(p) if p.len() > u8::MAX as usize =>
                    return Err(Error::ConfigInvalid(
                        "raidz is limited to 255 leaves".to_string())),
                _ => ()
            }
            for path in vdev.paths() {
                if !seen.insert(path) {
                    return Err(Error::ConfigInvalid(
                        format!("{} is used twice", path.display())));
                }
            }
        }
        Ok(())
    }
}

// LCOV_EXCL_STOP
