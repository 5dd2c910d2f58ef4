// vim: tw=80
//! On-disk labels
//!
//! Every leaf device begins with two label slots.  Each one holds the leaf's
//! own identity, the layout of the top-level vdev it belongs to, the pool
//! configuration, and an uberblock.  Uberblocks for even txgs go in slot 0 and
//! odd txgs go in slot 1, so a torn label write can never destroy the last
//! published checkpoint.

use byteorder::{BigEndian, ByteOrder};
use crate::{
    types::*,
    util::*
};
use divbuf::{DivBuf, DivBufShared};
use metrohash::MetroHash64;
use serde::{de::DeserializeOwned, Serialize};
use std::{hash::{Hash, Hasher}, io::{self, Seek, SeekFrom}};

/*
 * On-disk Label Format:
 *
 * Magic:       16 bytes
 * Checksum:    8 bytes     MetroHash64.  Covers all of Length and Contents.
 * Length:      8 bytes     Length of Contents in bytes
 * Leaf:        variable    bincode-encoded vdev_file::Label
 * Vdev:        variable    bincode-encoded pool::VdevLabel
 * Pool:        variable    bincode-encoded pool::Label
 * Uberblock:   variable    bincode-encoded pool::Uberblock
 * Pad:         variable    0-padding fills the remainder, up to 4 LBAs
 *
 * On-disk Reserved Region Format (per leaf):
 *
 * Label 0      4 LBAs
 * Label 1      4 LBAs
 */
/// The file magic is "cowpool leaf\0\0\0\0"
const MAGIC: &[u8; MAGIC_LEN] = b"cowpool leaf\0\0\0\0";
const MAGIC_LEN: usize = 16;
const CHECKSUM_LEN: usize = 8;
const LENGTH_LEN: usize = 8;
pub const LABEL_COUNT: LbaT = 2;
pub const LABEL_LBAS: LbaT = 4;
pub const LABEL_SIZE: usize = LABEL_LBAS as usize * BYTES_PER_LBA;
/// LBAs at the start of every leaf that are not part of its vdev's address
/// space.
pub const LEAF_RESERVED_LBAS: LbaT = LABEL_COUNT * LABEL_LBAS;

/// Used to read successive structs out of the label
pub struct LabelReader {
    cursor: io::Cursor<Vec<u8>>
}

impl LabelReader {
    /// Attempt to read a `T` out of the label
    pub fn deserialize<T>(&mut self) -> Result<T>
        where T: DeserializeOwned
    {
        bincode::deserialize_from(&mut self.cursor)
            .map_err(Error::from)
    }

    /// Construct a `LabelReader` using the raw buffer read from disk
    pub fn new(buffer: Vec<u8>) -> Result<Self> {
        let header_len = MAGIC_LEN + CHECKSUM_LEN + LENGTH_LEN;
        if buffer.len() < header_len {
            return Err(Error::Integrity("label too short".to_string()));
        }
        if MAGIC[..] != buffer[0..MAGIC_LEN] {
            return Err(Error::Integrity("bad label magic".to_string()));
        }

        let checksum = BigEndian::read_u64(
            &buffer[MAGIC_LEN..MAGIC_LEN + CHECKSUM_LEN]);
        let length_start = MAGIC_LEN + CHECKSUM_LEN;
        let contents_start = length_start + LENGTH_LEN;
        let contents_len = BigEndian::read_u64(
            &buffer[length_start .. contents_start]);
        if contents_start + contents_len as usize > buffer.len() {
            return Err(Error::Integrity("label length overflow".to_string()));
        }
        let mut hasher = MetroHash64::new();
        {
            let contents = &buffer[contents_start ..
                               contents_start + contents_len as usize];
            contents_len.to_be().hash(&mut hasher);
            hasher.write(contents);
        }
        if checksum != hasher.finish() {
            return Err(Error::Integrity("label checksum".to_string()));
        }

        let mut cursor = io::Cursor::new(buffer);
        // Seek past header
        cursor.seek(SeekFrom::Start(contents_start as u64))?;
        Ok(LabelReader { cursor })
    }

    /// Get the offset of the `label`th label.
    pub fn lba(label: u32) -> LbaT {
        assert!(LbaT::from(label) < LABEL_COUNT);
        LbaT::from(label) * LABEL_LBAS
    }
}

/// Successively writes serialized structs into the label
#[derive(Clone, Debug)]
pub struct LabelWriter {
    buffers: SGList,
    label: u32,
}

impl LabelWriter {
    /// Return the LBA at which to write this label
    pub fn lba(&self) -> LbaT {
        LbaT::from(self.label) * LABEL_LBAS
    }

    /// Create a new label in the `label`th position.
    pub fn new(label: u32) -> Self {
        assert!(LbaT::from(label) < LABEL_COUNT);
        LabelWriter{buffers: SGList::default(), label}
    }

    /// Write a `T` into the label.
    ///
    /// Multiple calls to `serialize` take effect in LIFO order.  That is, the
    /// last `serialize` call's data will be encoded into the lowest position in
    /// the label.
    pub fn serialize<T: Serialize>(&mut self, t: &T) -> Result<()> {
        let v = bincode::serialize(t)?;
        let dbs = DivBufShared::from(v);
        self.buffers.push(frozen(&dbs));
        Ok(())
    }

    /// Consume the `LabelWriter` and return one LBA-padded buffer suitable
    /// for writing at [`LabelWriter::lba`].
    pub fn into_buffer(self) -> Result<IoVec> {
        let contents = self.buffers.into_iter().rev().collect::<Vec<_>>();
        let contents_len: usize = contents.iter().map(DivBuf::len).sum();
        let header_len = MAGIC_LEN + CHECKSUM_LEN + LENGTH_LEN;
        if header_len + contents_len > LABEL_SIZE {
            return Err(Error::ConfigInvalid(
                    format!("label too large: {contents_len} bytes")));
        }
        let mut hasher = MetroHash64::new();
        (contents_len as u64).to_be().hash(&mut hasher);
        checksum_sglist(&contents, &mut hasher);

        let mut buf = Vec::with_capacity(LABEL_SIZE);
        buf.extend(&MAGIC[..]);
        buf.resize(header_len, 0);
        BigEndian::write_u64(&mut buf[MAGIC_LEN..], hasher.finish());
        let length_start = MAGIC_LEN + CHECKSUM_LEN;
        BigEndian::write_u64(&mut buf[length_start..], contents_len as u64);
        for c in contents.iter() {
            buf.extend_from_slice(&c[..]);
        }
        buf.resize(LABEL_SIZE, 0);
        let dbs = DivBufShared::from(buf);
        Ok(frozen(&dbs))
    }
}

// LCOV_EXCL_STOP
