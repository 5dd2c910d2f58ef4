// vim: tw=80
//! Common utility functions used throughout cowpool

use crate::types::*;
use divbuf::DivBufShared;
use std::{
    hash::Hasher,
    ops::{Add, Div, Sub},
};

/// LBAs always use 4K LBAs, even if the underlying device supports smaller.
pub const BYTES_PER_LBA: usize = 4096;

/// Checksum an `SGList`.
///
/// Unfortunately, hashing a slice is not the same thing as hashing that slice's
/// contents.  The former includes the length of the hash.  For our purposes,
/// we *want* `([0, 1], [2, 3])` and `([0], [1, 2, 3])` to hash the same so
/// that a label will have the same checksum however it's split up.
pub fn checksum_sglist<T, H>(sglist: &[T], hasher: &mut H)
    where T: AsRef<[u8]>, H: Hasher {

    for buf in sglist {
        let s: &[u8] = buf.as_ref();
        hasher.write(s);
    }
}

/// Divide two unsigned numbers (usually integers), rounding up.
pub fn div_roundup<T>(dividend: T, divisor: T) -> T
    where T: Add<Output=T> + Copy + Div<Output=T> + From<u8> + Sub<Output=T>
{
    (dividend + divisor - T::from(1u8)) / divisor
}

/// How many LBAs are needed to store `bytes` bytes?
pub fn lbas_for(bytes: usize) -> LbaT {
    div_roundup(bytes, BYTES_PER_LBA) as LbaT
}

/// Is every byte of the buffer zero?
pub fn is_zero(buf: &[u8]) -> bool {
    let mut chunks = buf.chunks_exact(8);
    chunks.all(|c| c == [0u8; 8]) && chunks.remainder().iter().all(|b| *b == 0)
}

/// Zero-pad a buffer to a whole number of LBAs.
pub fn pad_to_lba(mut v: Vec<u8>) -> Vec<u8> {
    let padded = lbas_for(v.len()) as usize * BYTES_PER_LBA;
    v.resize(padded, 0);
    v
}

/// Get a read-only reference to a buffer that nobody is mutating.
///
/// Every `DivBufShared` that cowpool stores is frozen as soon as it's filled,
/// so this never fails for them.
pub fn frozen(dbs: &DivBufShared) -> IoVec {
    dbs.try_const().expect("frozen buffers have no writers")
}

/// Allocate a zero-filled buffer and a mutable handle to it, for reading into.
pub fn zeroed(len: usize) -> (DivBufShared, IoVecMut) {
    let dbs = DivBufShared::from(vec![0u8; len]);
    let dbm = dbs.try_mut().expect("a new buffer has no other references");
    (dbs, dbm)
}

/// Returns the current time, in seconds since the epoch
pub(crate) fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

// LCOV_EXCL_STOP
