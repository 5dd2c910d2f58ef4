// vim: tw=80
//! Block checksums

use byteorder::{ByteOrder, LittleEndian};
use crate::types::*;
use metrohash::MetroHash64;
use serde_derive::{Deserialize, Serialize};
use std::{fmt, hash::Hasher};

/// A block checksum.  Algorithms that produce fewer than 256 bits leave the
/// remaining words zero.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq,
         Serialize)]
pub struct Checksum(pub [u64; 4]);

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}:{:016x}:{:016x}:{:016x}",
               self.0[0], self.0[1], self.0[2], self.0[3])
    }
}

/// Checksum algorithm, chosen per dataset and recorded in every block pointer
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq,
         PartialOrd, Serialize)]
pub enum ChecksumAlg {
    /// Fast, non-cryptographic, 64 bits
    #[default]
    MetroHash64,
    /// Four running sums over 32-bit little-endian words
    Fletcher4,
}

impl ChecksumAlg {
    pub fn checksum(self, buf: &[u8]) -> Checksum {
        match self {
            ChecksumAlg::MetroHash64 => {
                let mut hasher = MetroHash64::new();
                hasher.write(buf);
                Checksum([hasher.finish(), 0, 0, 0])
            },
            ChecksumAlg::Fletcher4 => fletcher4(buf)
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ChecksumAlg::MetroHash64 => "metrohash64",
            ChecksumAlg::Fletcher4 => "fletcher4",
        }
    }
}

impl fmt::Display for ChecksumAlg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.name().fmt(f)
    }
}

impl TryFrom<&str> for ChecksumAlg {
    type Error = Error;

    fn try_from(s: &str) -> Result<Self> {
        match s {
            "on" | "metrohash64" => Ok(ChecksumAlg::MetroHash64),
            "fletcher4" => Ok(ChecksumAlg::Fletcher4),
            _ => Err(Error::InvalidArgument(format!("checksum={s}")))
        }
    }
}

/// A trailing partial word is treated as if zero-padded.
fn fletcher4(buf: &[u8]) -> Checksum {
    let (mut a, mut b, mut c, mut d) = (0u64, 0u64, 0u64, 0u64);
    let mut step = |word: u32| {
        a = a.wrapping_add(u64::from(word));
        b = b.wrapping_add(a);
        c = c.wrapping_add(b);
        d = d.wrapping_add(c);
    };
    let mut chunks = buf.chunks_exact(4);
    for chunk in &mut chunks {
        step(LittleEndian::read_u32(chunk));
    }
    let rem = chunks.remainder();
    if !rem.is_empty() {
        let mut last = [0u8; 4];
        last[..rem.len()].copy_from_slice(rem);
        step(LittleEndian::read_u32(&last));
    }
    Checksum([a, b, c, d])
}

// LCOV_EXCL_STOP
