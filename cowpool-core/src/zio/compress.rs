// vim: tw=80
//! Block compression

use crate::{
    types::*,
    util::*
};
use serde_derive::{Deserialize, Serialize};
use std::fmt;

/// Compression mode in use
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq,
         PartialOrd, Serialize)]
pub enum Compression {
    None,
    /// LZ4 is very fast with decent compression.  It's the best algorithm for
    /// metadata.
    #[default]
    Lz4,
    /// ZStandard usually gives a very good compression ratio with moderate
    /// speed.
    Zstd,
}

impl Compression {
    /// Compress a logical block, if that's worthwhile.
    ///
    /// Returns `None` if compression is disabled, if the block fits within a
    /// single LBA, or if compression would not save at least one eighth of the
    /// block rounded down to whole LBAs.
    pub fn compress(self, input: &[u8]) -> Option<Vec<u8>> {
        let lsize = input.len();
        if self == Compression::None || lsize <= BYTES_PER_LBA {
            return None;
        }
        let buffer = match self {
            Compression::None => unreachable!(),  // LCOV_EXCL_LINE
            Compression::Lz4 => lz4_flex::block::compress(input),
            Compression::Zstd => zstd::bulk::compress(input, 0).ok()?
        };
        let limit = (lsize - lsize / 8) / BYTES_PER_LBA * BYTES_PER_LBA;
        if buffer.len() <= limit {
            Some(buffer)
        } else {
            None
        }
    }

    /// Restore a block of `lsize` bytes from its compressed form.
    pub fn decompress(self, input: &[u8], lsize: usize) -> Result<Vec<u8>> {
        let v = match self {
            Compression::None => input[..lsize.min(input.len())].to_vec(),
            Compression::Lz4 => lz4_flex::block::decompress(input, lsize)
                .map_err(|e| Error::Integrity(e.to_string()))?,
            Compression::Zstd => zstd::bulk::decompress(input, lsize)
                .map_err(|e| Error::Integrity(e.to_string()))?
        };
        if v.len() != lsize {
            return Err(Error::Integrity(
                format!("decompressed {} bytes, expected {}", v.len(), lsize)));
        }
        Ok(v)
    }

    /// Does this compression algorithm compress the data at all?
    pub fn is_compressed(self) -> bool {
        self != Compression::None
    }

    pub fn name(self) -> &'static str {
        match self {
            Compression::None => "off",
            Compression::Lz4 => "lz4",
            Compression::Zstd => "zstd",
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.name().fmt(f)
    }
}

impl TryFrom<&str> for Compression {
    type Error = Error;

    fn try_from(s: &str) -> Result<Self> {
        match s {
            "off" | "none" => Ok(Compression::None),
            "on" | "lz4" => Ok(Compression::Lz4),
            "zstd" => Ok(Compression::Zstd),
            _ => Err(Error::InvalidArgument(format!("compression={s}")))
        }
    }
}

// LCOV_EXCL_STOP
