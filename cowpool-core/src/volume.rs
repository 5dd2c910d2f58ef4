// vim: tw=80
//! Block devices backed by datasets
//!
//! A volume is a dataset whose objset holds a single object,
//! [`VOLUME_OBJECT`].  The object's size is the size of the device, so a
//! snapshot of a volume keeps the size that the volume had when it was taken.

use crate::{
    database::DatasetHandle,
    dmu::{MAX_OBJECT_SIZE, Objset, ObjsetKind, VOLUME_OBJECT, range_end},
    types::*,
};
use tracing::debug;

/// Can a volume have this size and block size?
pub fn check_geometry(size: u64, block_size: u32) -> Result<()> {
    Objset::check_block_size(block_size)?;
    if size == 0 || size % u64::from(block_size) != 0 ||
        size > MAX_OBJECT_SIZE
    {
        return Err(Error::InvalidArgument(format!(
            "volume size {size} with block size {block_size}")));
    }
    Ok(())
}

/// An open volume, or a snapshot of one.
///
/// Every access must lie entirely within the volume.  Writes and discards
/// return the txg that will make them durable.
pub struct Volume {
    ds: DatasetHandle,
}

impl Volume {
    pub fn block_size(&self) -> Result<u32> {
        Ok(self.ds.object_info(VOLUME_OBJECT)?.block_size)
    }

    fn check_range(&self, offset: u64, len: u64) -> Result<()> {
        let size = self.size()?;
        if range_end(offset, len)? > size {
            Err(Error::InvalidArgument(format!(
                "{}: range {offset}+{len} ends past {size}", self.ds.name())))
        } else {
            Ok(())
        }
    }

    /// The dataset underneath
    pub fn dataset(&self) -> &DatasetHandle {
        &self.ds
    }

    /// Deallocate a range.  It reads as zeros afterwards.
    pub async fn discard(&self, offset: u64, len: u64) -> Result<TxgT> {
        let _geometry = self.ds.objset().geometry().read().await;
        self.check_range(offset, len)?;
        let tx = self.ds.begin_transaction(0).await?;
        tx.free_range(VOLUME_OBJECT, offset, len).await?;
        Ok(tx.commit())
    }

    pub(crate) fn new(ds: DatasetHandle) -> Result<Self> {
        if ds.kind() != ObjsetKind::Volume {
            return Err(Error::InvalidArgument(format!(
                "{} is not a volume", ds.name())));
        }
        Ok(Volume{ds})
    }

    pub async fn read(&self, offset: u64, len: u64) -> Result<Vec<u8>> {
        self.check_range(offset, len)?;
        self.ds.read(VOLUME_OBJECT, offset, len).await
    }

    /// Change the size.  Shrinking discards everything past the new end, so
    /// growing again exposes zeros.
    pub async fn resize(&self, size: u64) -> Result<TxgT> {
        check_geometry(size, self.block_size()?)?;
        let _geometry = self.ds.objset().geometry().write().await;
        let tx = self.ds.begin_transaction(0).await?;
        tx.truncate(VOLUME_OBJECT, size).await?;
        debug!(volume = self.ds.name(), size, "resized");
        Ok(tx.commit())
    }

    pub fn size(&self) -> Result<u64> {
        Ok(self.ds.object_info(VOLUME_OBJECT)?.size)
    }

    pub async fn write(&self, offset: u64, data: &[u8]) -> Result<TxgT> {
        let _geometry = self.ds.objset().geometry().read().await;
        self.check_range(offset, data.len() as u64)?;
        let tx = self.ds.begin_transaction(data.len() as u64).await?;
        tx.write(VOLUME_OBJECT, offset, data).await?;
        Ok(tx.commit())
    }
}

// LCOV_EXCL_STOP
