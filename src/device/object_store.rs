//! Object-store device
//!
//! Volumes are objects in a bucket, reached through an object-store client
//! library described by a profile file. The client library keeps
//! process-global state, so one library context is shared by every device
//! and torn down when the last one closes.

use super::options::{self, DeviceOptions, OptionSpec};
use super::profile::{ObjectStoreProfile, ProfileError};
use super::shared::{ProcessShared, SharedLease};
use super::status::ObjectStoreStatus;
use super::{
    parent_dirs, remote_path, BlockSizes, Capabilities, Device, DeviceError, DeviceResult,
    DeviceSettings, OpenMode, VirtualOffset, Whence,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

pub const DEFAULT_PROFILE: &str = "/etc/stordev/object-store/default.profile";

const OPTIONS: &[OptionSpec] = &[
    options::value("profile"),
    options::value("bucket"),
    options::value("basedir"),
    options::value("location"),
    options::value("acl"),
    options::value("storageclass"),
];

/// Offset-explicit operations of an object-store client
pub trait ObjectStoreClient: Send {
    /// Size of an object
    fn stat(&self, bucket: &str, path: &str) -> Result<u64, ObjectStoreStatus>;

    /// Create one directory level; `Exist` if it is already there
    fn mkdir(&self, bucket: &str, path: &str) -> Result<(), ObjectStoreStatus>;

    /// Create an empty object, replacing any existing one
    fn create(&self, bucket: &str, path: &str) -> Result<(), ObjectStoreStatus>;

    fn read_at(
        &self,
        bucket: &str,
        path: &str,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<usize, ObjectStoreStatus>;

    fn write_at(
        &self,
        bucket: &str,
        path: &str,
        offset: u64,
        data: &[u8],
    ) -> Result<usize, ObjectStoreStatus>;

    fn unlink(&self, bucket: &str, path: &str) -> Result<(), ObjectStoreStatus>;
}

/// Builds clients for one profile backend
pub trait ObjectStoreConnector: Send + Sync {
    fn connect(
        &self,
        profile: &ObjectStoreProfile,
    ) -> Result<Box<dyn ObjectStoreClient>, ObjectStoreStatus>;
}

/// Process-global client library context
pub struct ObjectStoreLibrary {
    profiles: Mutex<HashMap<PathBuf, Arc<ObjectStoreProfile>>>,
}

static LIBRARY: ProcessShared<ObjectStoreLibrary> = ProcessShared::new();

impl ObjectStoreLibrary {
    fn init() -> Result<Self, DeviceError> {
        log::info!("object store client library initialized");
        Ok(Self {
            profiles: Mutex::new(HashMap::new()),
        })
    }

    /// Load a profile, once per library lifetime
    fn profile(&self, path: &Path) -> Result<Arc<ObjectStoreProfile>, ProfileError> {
        let mut profiles = self.profiles.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(profile) = profiles.get(path) {
            return Ok(Arc::clone(profile));
        }
        let profile = Arc::new(ObjectStoreProfile::load(path)?);
        log::debug!("loaded object store profile {}", path.display());
        profiles.insert(path.to_path_buf(), Arc::clone(&profile));
        Ok(profile)
    }
}

impl Drop for ObjectStoreLibrary {
    fn drop(&mut self) {
        log::info!("object store client library released");
    }
}

/// Number of devices currently holding the client library
pub fn library_users() -> usize {
    LIBRARY.owners()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectStoreOptions {
    pub profile: PathBuf,
    pub bucket: String,
    pub basedir: Option<String>,
    pub location: Option<String>,
    pub acl: Option<String>,
    pub storage_class: Option<String>,
}

impl ObjectStoreOptions {
    pub fn parse(input: &str) -> Result<Self, super::OptionError> {
        let options = DeviceOptions::parse(input, OPTIONS)?;
        Ok(Self {
            profile: PathBuf::from(options.get("profile").unwrap_or(DEFAULT_PROFILE)),
            bucket: options.require("bucket")?.to_string(),
            basedir: options.get("basedir").map(str::to_string),
            location: options.get("location").map(str::to_string),
            acl: options.get("acl").map(str::to_string),
            storage_class: options.get("storageclass").map(str::to_string),
        })
    }
}

pub struct ObjectStoreDevice {
    settings: DeviceSettings,
    connectors: HashMap<String, Arc<dyn ObjectStoreConnector>>,
    options: Option<ObjectStoreOptions>,
    library: Option<SharedLease<ObjectStoreLibrary>>,
    client: Option<Box<dyn ObjectStoreClient>>,
    volume: Option<String>,
    object: String,
    mode: OpenMode,
    offset: VirtualOffset,
}

impl ObjectStoreDevice {
    pub fn new(
        settings: DeviceSettings,
        connectors: HashMap<String, Arc<dyn ObjectStoreConnector>>,
    ) -> Self {
        Self {
            settings,
            connectors,
            options: None,
            library: None,
            client: None,
            volume: None,
            object: String::new(),
            mode: OpenMode::ReadOnly,
            offset: VirtualOffset::new(),
        }
    }

    /// Object path of the open volume inside the bucket
    pub fn object_path(&self) -> &str {
        &self.object
    }

    fn parse_options(&mut self) -> DeviceResult<ObjectStoreOptions> {
        if let Some(options) = &self.options {
            return Ok(options.clone());
        }
        let options = ObjectStoreOptions::parse(&self.settings.device_options)
            .map_err(|e| DeviceError::invalid_option(&self.settings.name, e))?;
        self.options = Some(options.clone());
        Ok(options)
    }

    fn current_volume(&self) -> &str {
        self.volume.as_deref().unwrap_or(&self.settings.name)
    }

    fn bucket(&self) -> &str {
        self.options.as_ref().map(|o| o.bucket.as_str()).unwrap_or("")
    }

    fn client(&self) -> DeviceResult<&dyn ObjectStoreClient> {
        self.client
            .as_deref()
            .ok_or_else(|| DeviceError::not_open(&self.settings.name))
    }

    fn connect(
        &self,
        volume: &str,
        options: &ObjectStoreOptions,
        library: &ObjectStoreLibrary,
    ) -> DeviceResult<Box<dyn ObjectStoreClient>> {
        let profile = library
            .profile(&options.profile)
            .map_err(|e| DeviceError::InvalidConfiguration {
                device: self.settings.name.clone(),
                token: format!("profile={}", options.profile.display()),
                reason: e.to_string(),
            })?;

        let connector = self.connectors.get(&profile.backend).ok_or_else(|| {
            DeviceError::unsupported(
                volume,
                &format!("object store backend \"{}\"", profile.backend),
            )
        })?;

        if options.location.is_some() || options.acl.is_some() || options.storage_class.is_some() {
            log::debug!(
                "bucket {} placement: location={:?} acl={:?} storageclass={:?}",
                options.bucket,
                options.location,
                options.acl,
                options.storage_class
            );
        }

        connector
            .connect(&profile)
            .map_err(|s| DeviceError::from_status(volume, "connect to object store", s))
    }

    /// Create every missing directory above `object`
    fn ensure_parents(
        client: &dyn ObjectStoreClient,
        bucket: &str,
        object: &str,
        volume: &str,
    ) -> DeviceResult<()> {
        for dir in parent_dirs(object) {
            match client.mkdir(bucket, &dir) {
                Ok(()) => log::debug!("created directory {}{}", bucket, dir),
                Err(ObjectStoreStatus::Exist) => {}
                Err(s) => {
                    return Err(DeviceError::from_status(
                        volume,
                        &format!("mkdir {}", dir),
                        s,
                    ))
                }
            }
        }
        Ok(())
    }
}

impl Device for ObjectStoreDevice {
    fn name(&self) -> &str {
        &self.settings.name
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::REMOTE
    }

    fn block_sizes(&self) -> BlockSizes {
        self.settings.block_sizes
    }

    fn volume_name(&self) -> Option<&str> {
        self.volume.as_deref()
    }

    fn offset(&self) -> u64 {
        self.offset.get()
    }

    fn is_open(&self) -> bool {
        self.client.is_some()
    }

    fn open(&mut self, volume: &str, mode: OpenMode, _permissions: u32) -> DeviceResult<()> {
        let options = self.parse_options()?;
        self.close()?;

        let library = LIBRARY.acquire(ObjectStoreLibrary::init)?;
        let client = self.connect(volume, &options, &library)?;
        let object = remote_path(options.basedir.as_deref(), volume);

        if mode.creates() {
            Self::ensure_parents(client.as_ref(), &options.bucket, &object, volume)?;
        }
        match client.stat(&options.bucket, &object) {
            Ok(size) => log::debug!("open {}{} ({} bytes)", options.bucket, object, size),
            Err(ObjectStoreStatus::NoEnt) if mode.creates() => {
                client
                    .create(&options.bucket, &object)
                    .map_err(|s| DeviceError::from_status(volume, "create", s))?;
                log::debug!("created {}{}", options.bucket, object);
            }
            Err(s) => return Err(DeviceError::from_status(volume, "open", s)),
        }

        self.library = Some(library);
        self.client = Some(client);
        self.volume = Some(volume.to_string());
        self.object = object;
        self.mode = mode;
        self.offset.reset();
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> DeviceResult<usize> {
        let volume = self.current_volume();
        if !self.mode.readable() {
            return Err(DeviceError::from_errno(volume, "read", libc::EBADF));
        }
        let n = self
            .client()?
            .read_at(self.bucket(), &self.object, self.offset.get(), buf)
            .map_err(|s| DeviceError::from_status(volume, "read", s))?;
        self.offset.advance(n);
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> DeviceResult<usize> {
        let volume = self.current_volume();
        if !self.mode.writable() {
            return Err(DeviceError::from_errno(volume, "write", libc::EBADF));
        }
        let n = self
            .client()?
            .write_at(self.bucket(), &self.object, self.offset.get(), buf)
            .map_err(|s| DeviceError::from_status(volume, "write", s))?;
        self.offset.advance(n);
        Ok(n)
    }

    fn seek(&mut self, offset: i64, whence: Whence) -> DeviceResult<u64> {
        let volume = self.current_volume().to_string();
        let end = match whence {
            Whence::End => Some(
                self.client()?
                    .stat(self.bucket(), &self.object)
                    .map_err(|s| DeviceError::from_status(&volume, "stat", s))?,
            ),
            _ => None,
        };
        self.offset
            .seek(offset, whence, end)
            .map_err(|e| DeviceError::seek(&volume, e))
    }

    fn truncate(&mut self) -> DeviceResult<()> {
        let volume = self.current_volume().to_string();
        if !self.mode.writable() {
            return Err(DeviceError::from_errno(&volume, "truncate", libc::EBADF));
        }
        let client = self.client()?;
        let bucket = self.bucket();

        match client.unlink(bucket, &self.object) {
            Ok(()) | Err(ObjectStoreStatus::NoEnt) => {}
            Err(s) => return Err(DeviceError::from_status(&volume, "unlink for truncate", s)),
        }
        client
            .create(bucket, &self.object)
            .map_err(|s| DeviceError::from_status(&volume, "recreate after truncate", s))?;

        self.offset.reset();
        Ok(())
    }

    fn close(&mut self) -> DeviceResult<()> {
        if self.client.take().is_some() {
            log::debug!("close {}{}", self.bucket(), self.object);
        }
        self.library = None;
        self.offset.reset();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::posix::PosixConnector;
    use crate::device::ErrorKind;
    use std::fs;
    use tempfile::TempDir;

    struct Fixture {
        _temp: TempDir,
        root: PathBuf,
        options: String,
    }

    fn fixture(extra: &str) -> Fixture {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("objects");
        fs::create_dir_all(root.join("backup")).unwrap();
        let profile = temp.path().join("posix.profile");
        fs::write(
            &profile,
            format!("backend = posix\nbase_path = {}\n", root.display()),
        )
        .unwrap();
        let options = format!("profile={},bucket=backup{}", profile.display(), extra);
        Fixture {
            _temp: temp,
            root,
            options,
        }
    }

    fn device(options: &str) -> ObjectStoreDevice {
        let mut connectors: HashMap<String, Arc<dyn ObjectStoreConnector>> = HashMap::new();
        connectors.insert("posix".to_string(), Arc::new(PosixConnector));
        ObjectStoreDevice::new(
            DeviceSettings::new("ObjectStorage", "").with_options(options),
            connectors,
        )
    }

    #[test]
    fn test_object_store_roundtrip() {
        let fx = fixture(",basedir=volumes/daily");
        let mut dev = device(&fx.options);
        dev.open("Full-0001", OpenMode::CreateReadWrite, 0o640).unwrap();
        assert_eq!(dev.object_path(), "/volumes/daily/Full-0001");
        assert!(fx.root.join("backup/volumes/daily").is_dir());

        let data: Vec<u8> = (0..=255u8).cycle().take(4000).collect();
        assert_eq!(dev.write(&data).unwrap(), data.len());
        assert_eq!(dev.offset(), 4000);

        dev.seek(0, Whence::Start).unwrap();
        let mut buf = vec![0u8; 4000];
        assert_eq!(dev.read(&mut buf).unwrap(), 4000);
        assert_eq!(buf, data);

        assert_eq!(dev.seek(-100, Whence::End).unwrap(), 3900);
        dev.close().unwrap();
    }

    #[test]
    fn test_rewrite_in_place() {
        let fx = fixture("");
        let mut dev = device(&fx.options);
        dev.open("Vol", OpenMode::CreateReadWrite, 0o640).unwrap();
        dev.write(b"aaaaaaaa").unwrap();
        dev.seek(2, Whence::Start).unwrap();
        dev.write(b"bb").unwrap();
        assert_eq!(dev.offset(), 4);
        dev.seek(0, Whence::Start).unwrap();
        let mut buf = [0u8; 8];
        dev.read(&mut buf).unwrap();
        assert_eq!(&buf, b"aabbaaaa");
    }

    #[test]
    fn test_truncate_emulated() {
        let fx = fixture("");
        let mut dev = device(&fx.options);
        dev.open("Vol", OpenMode::CreateReadWrite, 0o640).unwrap();
        dev.write(&[9u8; 2048]).unwrap();
        dev.truncate().unwrap();
        assert_eq!(dev.offset(), 0);
        assert_eq!(dev.seek(0, Whence::End).unwrap(), 0);
        assert_eq!(fs::metadata(fx.root.join("backup/Vol")).unwrap().len(), 0);

        // still writable after truncate
        dev.write(b"x").unwrap();
    }

    #[test]
    fn test_read_only_missing_volume() {
        let fx = fixture("");
        let mut dev = device(&fx.options);
        let err = dev.open("Missing", OpenMode::ReadOnly, 0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(!dev.is_open());
    }

    #[test]
    fn test_write_on_read_only_volume() {
        let fx = fixture("");
        let mut dev = device(&fx.options);
        dev.open("Vol", OpenMode::CreateReadWrite, 0o640).unwrap();
        dev.close().unwrap();
        dev.open("Vol", OpenMode::ReadOnly, 0).unwrap();
        assert!(dev.write(b"x").is_err());
    }

    #[test]
    fn test_truncate_keeps_mode() {
        let fx = fixture("");
        let mut dev = device(&fx.options);
        dev.open("Vol", OpenMode::CreateReadWrite, 0o640).unwrap();
        dev.write(b"keep").unwrap();
        dev.close().unwrap();

        dev.open("Vol", OpenMode::ReadOnly, 0).unwrap();
        assert!(dev.truncate().is_err());
        assert_eq!(fs::read(fx.root.join("backup/Vol")).unwrap(), b"keep".to_vec());
        dev.close().unwrap();

        dev.open("Vol", OpenMode::ReadWrite, 0).unwrap();
        dev.truncate().unwrap();
        dev.write(b"fresh").unwrap();
        dev.seek(0, Whence::Start).unwrap();
        let mut buf = [0u8; 5];
        assert_eq!(dev.read(&mut buf).unwrap(), 5);
        assert_eq!(&buf, b"fresh");
    }

    #[test]
    fn test_unknown_option_rejected_before_connect() {
        let fx = fixture(",poolname=rbd");
        let mut dev = device(&fx.options);
        let err = dev.open("Vol", OpenMode::CreateReadWrite, 0o640).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidConfiguration);
        assert!(err.to_string().contains("poolname=rbd"));
        assert!(!fx.root.join("backup/Vol").exists());
    }

    #[test]
    fn test_bucket_required() {
        let mut dev = device("profile=/nonexistent.profile");
        let err = dev.open("Vol", OpenMode::CreateReadWrite, 0o640).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidConfiguration);
        assert!(err.to_string().contains("bucket="));
    }

    #[test]
    fn test_unregistered_backend() {
        let temp = TempDir::new().unwrap();
        let profile = temp.path().join("s3.profile");
        fs::write(&profile, "backend = s3\nhost = s3.local\n").unwrap();
        let mut dev = device(&format!("profile={},bucket=b", profile.display()));
        let err = dev.open("Vol", OpenMode::CreateReadWrite, 0o640).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unsupported);
    }

    #[test]
    fn test_library_held_while_open() {
        let fx = fixture("");
        let mut dev = device(&fx.options);
        dev.open("Vol", OpenMode::CreateReadWrite, 0o640).unwrap();
        assert!(library_users() >= 1);
        assert!(dev.library.is_some());
        dev.close().unwrap();
        assert!(dev.library.is_none());
    }
}
