// vim: tw=80
//! File-backed leaf devices

use crate::{
    label::*,
    types::*,
    util::*,
    vdev::*
};
use serde_derive::{Deserialize, Serialize};
use std::{
    fs::{File, OpenOptions},
    io,
    os::unix::fs::FileExt,
    path::{Path, PathBuf},
    sync::Arc
};
use tokio::task;

/// The leaf's own section of every label
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Label {
    /// Leaf UUID, fixed at format time
    pub uuid:           Uuid,
    /// Number of LBAs that were present at format time
    pub lbas:           LbaT,
}

/// `VdevFile`: File-backed implementation of [`Leaf`]
///
/// It works with both regular files and device files.  All I/O is synchronous
/// positional I/O, dispatched to tokio's blocking thread pool.
#[derive(Debug)]
pub struct VdevFile {
    file:           Arc<File>,
    /// The name used to open this leaf.  It may change if the pool is exported
    /// and reimported.
    path:           PathBuf,
    size:           LbaT,
    uuid:           Uuid,
}

impl Leaf for VdevFile {
    fn read_at(&self, mut buf: IoVecMut, lba: LbaT) -> BoxVdevFut {
        debug_assert_eq!(buf.len() % BYTES_PER_LBA, 0);
        let file = self.file.clone();
        let off = lba * BYTES_PER_LBA as u64;
        Box::pin(async move {
            task::spawn_blocking(move || file.read_exact_at(&mut buf[..], off))
                .await
                .map_err(|_| Error::DeviceIo(io::ErrorKind::Interrupted))?
                .map_err(Error::from)
        })
    }

    fn write_at(&self, buf: IoVec, lba: LbaT) -> BoxVdevFut {
        debug_assert_eq!(buf.len() % BYTES_PER_LBA, 0);
        let file = self.file.clone();
        let off = lba * BYTES_PER_LBA as u64;
        Box::pin(async move {
            task::spawn_blocking(move || file.write_all_at(&buf[..], off))
                .await
                .map_err(|_| Error::DeviceIo(io::ErrorKind::Interrupted))?
                .map_err(Error::from)
        })
    }

    fn sync_all(&self) -> BoxVdevFut {
        let file = self.file.clone();
        Box::pin(async move {
            task::spawn_blocking(move || file.sync_all())
                .await
                .map_err(|_| Error::DeviceIo(io::ErrorKind::Interrupted))?
                .map_err(Error::from)
        })
    }

    fn size(&self) -> LbaT {
        self.size
    }

    fn uuid(&self) -> Uuid {
        self.uuid
    }
}

impl VdevFile {
    /// Smallest usable leaf: room for the labels plus a little data
    pub const MIN_LBAS: LbaT = LEAF_RESERVED_LBAS + 64;

    fn open_file(path: &Path) -> Result<(File, LbaT)> {
        let f = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)?;
        let size = f.metadata()?.len() / BYTES_PER_LBA as u64;
        Ok((f, size))
    }

    /// Prepare a new leaf, backed by a file
    ///
    /// * `path`:           Pathname for the file.  It may be a device node.
    ///                     It must already exist, with its final size.
    pub fn create<P>(path: P) -> Result<Self>
        where P: AsRef<Path>
    {
        let pb = path.as_ref().to_path_buf();
        let (f, size) = VdevFile::open_file(&pb)?;
        if size < VdevFile::MIN_LBAS {
            return Err(Error::ConfigInvalid(
                format!("{} is too small", pb.display())));
        }
        Ok(VdevFile {
            file: Arc::new(f),
            path: pb,
            size,
            uuid: Uuid::new_v4()
        })
    }

    /// The leaf's label section, as written at format time
    pub fn label(&self) -> Label {
        Label { uuid: self.uuid, lbas: self.size }
    }

    /// Open an existing `VdevFile`, identifying it by its label.
    ///
    /// * `path`    Pathname for the file.  It may be a device node.
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let pb = path.as_ref().to_path_buf();
        let (f, size) = VdevFile::open_file(&pb)?;
        let file = Arc::new(f);
        let label = VdevFile::read_label(file.clone()).await?;
        if size < label.lbas {
            return Err(Error::Integrity(
                format!("{} has shrunk since creation", pb.display())));
        }
        Ok(VdevFile {
            file,
            path: pb,
            size: label.lbas,
            uuid: label.uuid
        })
    }

    /// The pathname most recently used to open this device.
    pub fn path(&self) -> &Path {
        self.path.as_path()
    }

    /// Read the leaf section from whichever label is intact
    async fn read_label(f: Arc<File>) -> Result<Label> {
        task::spawn_blocking(move || {
            let mut r = Err(Error::Integrity("no label".to_string()));
            for label in 0..LABEL_COUNT as u32 {
                let offset = LabelReader::lba(label) * BYTES_PER_LBA as u64;
                let mut rbuf = vec![0; LABEL_SIZE];
                if let Err(e) = f.read_exact_at(&mut rbuf[..], offset) {
                    r = Err(Error::from(e));
                    continue;
                }
                match LabelReader::new(rbuf)
                    .and_then(|mut lr| lr.deserialize::<Label>())
                {
                    Ok(l) => return Ok(l),
                    // If this is the first label, try the second.
                    Err(e) => r = Err(e)
                }
            }
            r
        }).await
        .map_err(|_| Error::DeviceIo(io::ErrorKind::Interrupted))?
    }
}

// LCOV_EXCL_STOP
