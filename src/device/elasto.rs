//! Elasto device
//!
//! Volumes are files on an Azure file share, driven through the Elasto
//! cloud client. Credentials come either from a profile or from an Azure
//! publish-settings file.

use super::options::{self, DeviceOptions, OptionSpec};
use super::status::ElastoStatus;
use super::{
    parent_dirs, remote_path, BlockSizes, Capabilities, Device, DeviceError, DeviceResult,
    DeviceSettings, OpenMode, OptionError, VirtualOffset, Whence,
};
use std::path::PathBuf;
use std::sync::Arc;

const OPTIONS: &[OptionSpec] = &[
    options::value("profile"),
    options::value("publish_file"),
    options::value("basedir"),
    options::flag("insecure_http"),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElastoCredentials {
    /// Elasto client profile
    Profile(PathBuf),
    /// Azure publish-settings file
    PublishSettings(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElastoOptions {
    pub credentials: ElastoCredentials,
    pub basedir: Option<String>,
    /// Plain HTTP instead of HTTPS
    pub insecure_http: bool,
}

impl ElastoOptions {
    pub fn parse(input: &str) -> Result<Self, OptionError> {
        let options = DeviceOptions::parse(input, OPTIONS)?;
        let credentials = match (options.get("profile"), options.get("publish_file")) {
            (Some(profile), None) => ElastoCredentials::Profile(PathBuf::from(profile)),
            (None, Some(publish)) => ElastoCredentials::PublishSettings(PathBuf::from(publish)),
            (Some(_), Some(publish)) => {
                return Err(OptionError::Duplicate(format!("publish_file={}", publish)))
            }
            (None, None) => return Err(OptionError::Required("profile=".to_string())),
        };
        Ok(Self {
            credentials,
            basedir: options.get("basedir").map(str::to_string),
            insecure_http: options.flag("insecure_http"),
        })
    }
}

/// An open file on the share
pub trait ElastoFile: Send {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize, ElastoStatus>;

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<usize, ElastoStatus>;

    fn size(&mut self) -> Result<u64, ElastoStatus>;
}

/// Session on one share
pub trait ElastoClient: Send {
    /// Open a file, creating it when `create` is set
    fn open(&self, path: &str, create: bool) -> Result<Box<dyn ElastoFile>, ElastoStatus>;

    fn mkdir(&self, path: &str) -> Result<(), ElastoStatus>;

    fn unlink(&self, path: &str) -> Result<(), ElastoStatus>;
}

pub trait ElastoConnector: Send + Sync {
    fn connect(&self, options: &ElastoOptions) -> Result<Box<dyn ElastoClient>, ElastoStatus>;
}

pub struct ElastoDevice {
    settings: DeviceSettings,
    connector: Arc<dyn ElastoConnector>,
    options: Option<ElastoOptions>,
    client: Option<Box<dyn ElastoClient>>,
    file: Option<Box<dyn ElastoFile>>,
    volume: Option<String>,
    path: String,
    mode: OpenMode,
    offset: VirtualOffset,
}

impl ElastoDevice {
    pub fn new(settings: DeviceSettings, connector: Arc<dyn ElastoConnector>) -> Self {
        Self {
            settings,
            connector,
            options: None,
            client: None,
            file: None,
            volume: None,
            path: String::new(),
            mode: OpenMode::ReadOnly,
            offset: VirtualOffset::new(),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    fn parse_options(&mut self) -> DeviceResult<ElastoOptions> {
        if let Some(options) = &self.options {
            return Ok(options.clone());
        }
        let options = ElastoOptions::parse(&self.settings.device_options)
            .map_err(|e| DeviceError::invalid_option(&self.settings.name, e))?;
        self.options = Some(options.clone());
        Ok(options)
    }

    fn current_volume(&self) -> &str {
        self.volume.as_deref().unwrap_or(&self.settings.name)
    }

    fn file_mut(&mut self) -> DeviceResult<&mut Box<dyn ElastoFile>> {
        match self.file.as_mut() {
            Some(file) => Ok(file),
            None => Err(DeviceError::not_open(&self.settings.name)),
        }
    }
}

impl Device for ElastoDevice {
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
        self.file.is_some()
    }

    fn open(&mut self, volume: &str, mode: OpenMode, _permissions: u32) -> DeviceResult<()> {
        let options = self.parse_options()?;
        self.close()?;

        if self.client.is_none() {
            log::info!(
                "connecting to Azure share ({}, {})",
                match &options.credentials {
                    ElastoCredentials::Profile(path) => format!("profile {}", path.display()),
                    ElastoCredentials::PublishSettings(path) =>
                        format!("publish settings {}", path.display()),
                },
                if options.insecure_http { "http" } else { "https" }
            );
            let client = self
                .connector
                .connect(&options)
                .map_err(|s| DeviceError::from_status(volume, "connect to share", s))?;
            self.client = Some(client);
        }
        let client = match self.client.as_deref() {
            Some(client) => client,
            None => return Err(DeviceError::not_open(&self.settings.name)),
        };

        let path = remote_path(options.basedir.as_deref(), volume);
        if mode.creates() {
            for dir in parent_dirs(&path) {
                match client.mkdir(&dir) {
                    Ok(()) => log::debug!("created directory {}", dir),
                    Err(status) if status.0 == -libc::EEXIST => {}
                    Err(status) => {
                        return Err(DeviceError::from_status(
                            volume,
                            &format!("mkdir {}", dir),
                            status,
                        ))
                    }
                }
            }
        }

        let file = client
            .open(&path, mode.creates())
            .map_err(|s| DeviceError::from_status(volume, "open", s))?;

        self.file = Some(file);
        self.volume = Some(volume.to_string());
        self.path = path;
        self.mode = mode;
        self.offset.reset();
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> DeviceResult<usize> {
        let offset = self.offset.get();
        let result = self.file_mut()?.read_at(offset, buf);
        let n = result.map_err(|s| DeviceError::from_status(self.current_volume(), "read", s))?;
        self.offset.advance(n);
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> DeviceResult<usize> {
        if !self.mode.writable() {
            return Err(DeviceError::from_errno(self.current_volume(), "write", libc::EBADF));
        }
        let offset = self.offset.get();
        let result = self.file_mut()?.write_at(offset, buf);
        let n = result.map_err(|s| DeviceError::from_status(self.current_volume(), "write", s))?;
        self.offset.advance(n);
        Ok(n)
    }

    fn seek(&mut self, offset: i64, whence: Whence) -> DeviceResult<u64> {
        let end = match whence {
            Whence::End => {
                let result = self.file_mut()?.size();
                Some(result.map_err(|s| DeviceError::from_status(self.current_volume(), "stat", s))?)
            }
            _ => None,
        };
        let volume = self.current_volume().to_string();
        self.offset
            .seek(offset, whence, end)
            .map_err(|e| DeviceError::seek(&volume, e))
    }

    fn truncate(&mut self) -> DeviceResult<()> {
        let volume = self.current_volume().to_string();
        if !self.mode.writable() {
            return Err(DeviceError::from_errno(&volume, "truncate", libc::EBADF));
        }
        if self.file.take().is_none() {
            return Err(DeviceError::not_open(&self.settings.name));
        }
        let client = match self.client.as_deref() {
            Some(client) => client,
            None => return Err(DeviceError::not_open(&self.settings.name)),
        };

        match client.unlink(&self.path) {
            Ok(()) => {}
            Err(status) if status.0 == -libc::ENOENT => {}
            Err(status) => {
                return Err(DeviceError::from_status(&volume, "unlink for truncate", status))
            }
        }
        let file = client
            .open(&self.path, true)
            .map_err(|s| DeviceError::from_status(&volume, "recreate after truncate", s))?;

        self.file = Some(file);
        self.offset.reset();
        Ok(())
    }

    fn close(&mut self) -> DeviceResult<()> {
        if self.file.take().is_some() {
            log::debug!("close {}", self.path);
        }
        self.offset.reset();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::testing::MemoryFs;
    use crate::device::ErrorKind;

    fn status(errno: i32) -> ElastoStatus {
        ElastoStatus(-errno)
    }

    struct ShareFile {
        fs: MemoryFs,
        path: String,
    }

    impl ElastoFile for ShareFile {
        fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize, ElastoStatus> {
            self.fs.read_at(&self.path, offset, buf).map_err(status)
        }

        fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<usize, ElastoStatus> {
            self.fs
                .write_at(&self.path, offset, data, false)
                .map_err(status)
        }

        fn size(&mut self) -> Result<u64, ElastoStatus> {
            self.fs.stat(&self.path).map_err(status)
        }
    }

    struct Share(MemoryFs);

    impl ElastoClient for Share {
        fn open(&self, path: &str, create: bool) -> Result<Box<dyn ElastoFile>, ElastoStatus> {
            match self.0.stat(path) {
                Ok(_) => {}
                Err(libc::ENOENT) if create => self.0.create(path).map_err(status)?,
                Err(errno) => return Err(status(errno)),
            }
            Ok(Box::new(ShareFile {
                fs: self.0.clone(),
                path: path.to_string(),
            }))
        }

        fn mkdir(&self, path: &str) -> Result<(), ElastoStatus> {
            self.0.mkdir(path).map_err(status)
        }

        fn unlink(&self, path: &str) -> Result<(), ElastoStatus> {
            self.0.remove(path).map_err(status)
        }
    }

    struct Connector(MemoryFs);

    impl ElastoConnector for Connector {
        fn connect(&self, _options: &ElastoOptions) -> Result<Box<dyn ElastoClient>, ElastoStatus> {
            self.0.connect().map_err(status)?;
            Ok(Box::new(Share(self.0.clone())))
        }
    }

    fn device(fs: &MemoryFs, options: &str) -> ElastoDevice {
        ElastoDevice::new(
            DeviceSettings::new("Azure", "").with_options(options),
            Arc::new(Connector(fs.clone())),
        )
    }

    #[test]
    fn test_parse_options() {
        let options = ElastoOptions::parse("publish_file=/etc/azure.publishsettings,insecure_http")
            .unwrap();
        assert_eq!(
            options.credentials,
            ElastoCredentials::PublishSettings(PathBuf::from("/etc/azure.publishsettings"))
        );
        assert!(options.insecure_http);

        assert_eq!(
            ElastoOptions::parse("basedir=x"),
            Err(OptionError::Required("profile=".to_string()))
        );
        assert!(ElastoOptions::parse("profile=a,publish_file=b").is_err());
        assert_eq!(
            ElastoOptions::parse("profile=a,insecure_http=yes"),
            Err(OptionError::UnexpectedValue("insecure_http=yes".to_string()))
        );
    }

    #[test]
    fn test_elasto_roundtrip() {
        let fs = MemoryFs::new();
        let mut dev = device(&fs, "profile=/etc/elasto.profile,basedir=share/bareos");
        dev.open("Vol-0007", OpenMode::CreateReadWrite, 0o640).unwrap();
        assert_eq!(dev.path(), "/share/bareos/Vol-0007");
        assert!(fs.is_dir("/share/bareos"));

        dev.write(b"abcdef").unwrap();
        dev.seek(2, Whence::Start).unwrap();
        let mut buf = [0u8; 3];
        dev.read(&mut buf).unwrap();
        assert_eq!(&buf, b"cde");
        assert_eq!(dev.offset(), 5);
    }

    #[test]
    fn test_truncate_emulated() {
        let fs = MemoryFs::new();
        let mut dev = device(&fs, "profile=/etc/elasto.profile");
        dev.open("Vol", OpenMode::CreateReadWrite, 0o640).unwrap();
        dev.write(&[3u8; 300]).unwrap();
        dev.truncate().unwrap();
        assert_eq!(dev.offset(), 0);
        assert_eq!(fs.contents("/Vol").unwrap().len(), 0);
        dev.write(b"z").unwrap();
        assert_eq!(fs.contents("/Vol").unwrap(), b"z".to_vec());
    }

    #[test]
    fn test_truncate_keeps_mode() {
        let fs = MemoryFs::new();
        fs.create("/Vol").unwrap();
        fs.write_at("/Vol", 0, b"keep", false).unwrap();
        let mut dev = device(&fs, "profile=/etc/elasto.profile");
        dev.open("Vol", OpenMode::ReadOnly, 0).unwrap();
        assert!(dev.truncate().is_err());
        assert_eq!(fs.contents("/Vol").unwrap(), b"keep".to_vec());
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
    fn test_read_only_rejects_write() {
        let fs = MemoryFs::new();
        fs.create("/Vol").unwrap();
        let mut dev = device(&fs, "profile=/etc/elasto.profile");
        dev.open("Vol", OpenMode::ReadOnly, 0).unwrap();
        assert!(dev.write(b"x").is_err());
        assert_eq!(fs.contents("/Vol").unwrap().len(), 0);
    }

    #[test]
    fn test_missing_volume() {
        let fs = MemoryFs::new();
        let mut dev = device(&fs, "profile=/etc/elasto.profile");
        let err = dev.open("Vol", OpenMode::ReadWrite, 0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
