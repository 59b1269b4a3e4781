//! Directory-backed object store
//!
//! The `posix` profile backend keeps every bucket as a directory under the
//! profile's `base_path` and every object as a file inside it.
//!
//! ```text
//! base_path/
//!   backup-bucket/
//!     volumes/
//!       Full-0001
//! ```

use super::object_store::{ObjectStoreClient, ObjectStoreConnector};
use super::profile::ObjectStoreProfile;
use super::status::ObjectStoreStatus;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Connector for profiles with `backend = posix`
pub struct PosixConnector;

impl ObjectStoreConnector for PosixConnector {
    fn connect(
        &self,
        profile: &ObjectStoreProfile,
    ) -> Result<Box<dyn ObjectStoreClient>, ObjectStoreStatus> {
        let root = profile.base_path.as_ref().ok_or_else(|| {
            log::error!("profile {} has no base_path", profile.path.display());
            ObjectStoreStatus::Inval
        })?;
        Ok(Box::new(PosixObjectStore::new(root)?))
    }
}

pub struct PosixObjectStore {
    root: PathBuf,
}

impl PosixObjectStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self, ObjectStoreStatus> {
        let root = root.as_ref().to_path_buf();
        if !root.is_dir() {
            return Err(ObjectStoreStatus::NoEnt);
        }
        Ok(Self { root })
    }

    /// Map a bucket and `/`-separated object path below the root
    fn path_for(&self, bucket: &str, path: &str) -> Result<PathBuf, ObjectStoreStatus> {
        let mut full = self.root.join(bucket);
        for component in path.split('/').filter(|c| !c.is_empty()) {
            if component == "." || component == ".." {
                return Err(ObjectStoreStatus::Inval);
            }
            full.push(component);
        }
        Ok(full)
    }

    fn bucket_exists(&self, bucket: &str) -> Result<(), ObjectStoreStatus> {
        if self.root.join(bucket).is_dir() {
            Ok(())
        } else {
            Err(ObjectStoreStatus::NoEnt)
        }
    }
}

fn status(err: std::io::Error) -> ObjectStoreStatus {
    ObjectStoreStatus::from_io(&err)
}

impl ObjectStoreClient for PosixObjectStore {
    fn stat(&self, bucket: &str, path: &str) -> Result<u64, ObjectStoreStatus> {
        let metadata = fs::metadata(self.path_for(bucket, path)?).map_err(status)?;
        if metadata.is_dir() {
            return Err(ObjectStoreStatus::Inval);
        }
        Ok(metadata.len())
    }

    fn mkdir(&self, bucket: &str, path: &str) -> Result<(), ObjectStoreStatus> {
        self.bucket_exists(bucket)?;
        match fs::create_dir(self.path_for(bucket, path)?) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Err(ObjectStoreStatus::Exist),
            Err(e) => Err(status(e)),
        }
    }

    fn create(&self, bucket: &str, path: &str) -> Result<(), ObjectStoreStatus> {
        self.bucket_exists(bucket)?;
        File::create(self.path_for(bucket, path)?).map_err(status)?;
        Ok(())
    }

    fn read_at(
        &self,
        bucket: &str,
        path: &str,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<usize, ObjectStoreStatus> {
        let mut file = File::open(self.path_for(bucket, path)?).map_err(status)?;
        file.seek(SeekFrom::Start(offset)).map_err(status)?;
        file.read(buf).map_err(status)
    }

    fn write_at(
        &self,
        bucket: &str,
        path: &str,
        offset: u64,
        data: &[u8],
    ) -> Result<usize, ObjectStoreStatus> {
        let mut file = OpenOptions::new()
            .write(true)
            .open(self.path_for(bucket, path)?)
            .map_err(status)?;
        file.seek(SeekFrom::Start(offset)).map_err(status)?;
        file.write_all(data).map_err(status)?;
        Ok(data.len())
    }

    fn unlink(&self, bucket: &str, path: &str) -> Result<(), ObjectStoreStatus> {
        fs::remove_file(self.path_for(bucket, path)?).map_err(status)
    }
}
