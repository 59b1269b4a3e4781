//! RADOS device
//!
//! Each volume is one object in a Ceph pool, named after the volume. The
//! pool namespace is flat, so there are no directories to create.

use super::options::{self, DeviceOptions, OptionSpec};
use super::status::RadosStatus;
use super::{
    BlockSizes, Capabilities, Device, DeviceError, DeviceResult, DeviceSettings, OpenMode,
    OptionError, VirtualOffset, Whence,
};
use std::path::PathBuf;
use std::sync::Arc;

pub const DEFAULT_CONFFILE: &str = "/etc/ceph/ceph.conf";
pub const DEFAULT_CLUSTERNAME: &str = "ceph";
pub const DEFAULT_USERNAME: &str = "client.admin";

/// Striping defaults, matching the RADOS striper's own
pub const DEFAULT_STRIPE_UNIT: u64 = 4 * 1024 * 1024;
pub const DEFAULT_STRIPE_COUNT: u64 = 1;
pub const DEFAULT_OBJECT_SIZE: u64 = 4 * 1024 * 1024;

const OPTIONS: &[OptionSpec] = &[
    options::value("conffile"),
    options::value("poolname"),
    options::value("clustername"),
    options::value("username"),
    options::flag("striped"),
    options::value("stripe_unit"),
    options::value("stripe_count"),
    options::value("object_size"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StripeLayout {
    pub stripe_unit: u64,
    pub stripe_count: u64,
    pub object_size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RadosOptions {
    pub conffile: PathBuf,
    pub poolname: String,
    pub clustername: String,
    pub username: String,
    /// Set when objects go through the striper
    pub striping: Option<StripeLayout>,
}

impl RadosOptions {
    pub fn parse(input: &str) -> Result<Self, OptionError> {
        let options = DeviceOptions::parse(input, OPTIONS)?;

        let stripe_unit = options.get_u64("stripe_unit")?;
        let stripe_count = options.get_u64("stripe_count")?;
        let object_size = options.get_u64("object_size")?;

        let striping = if options.flag("striped") {
            Some(StripeLayout {
                stripe_unit: stripe_unit.unwrap_or(DEFAULT_STRIPE_UNIT),
                stripe_count: stripe_count.unwrap_or(DEFAULT_STRIPE_COUNT),
                object_size: object_size.unwrap_or(DEFAULT_OBJECT_SIZE),
            })
        } else {
            if stripe_unit.is_some() || stripe_count.is_some() || object_size.is_some() {
                log::warn!("stripe settings given without \"striped\", ignoring them");
            }
            None
        };

        Ok(Self {
            conffile: PathBuf::from(options.get("conffile").unwrap_or(DEFAULT_CONFFILE)),
            poolname: options.require("poolname")?.to_string(),
            clustername: options
                .get("clustername")
                .unwrap_or(DEFAULT_CLUSTERNAME)
                .to_string(),
            username: options
                .get("username")
                .unwrap_or(DEFAULT_USERNAME)
                .to_string(),
            striping,
        })
    }
}

/// I/O context on one pool
pub trait RadosIoContext: Send {
    fn stat(&self, oid: &str) -> Result<u64, RadosStatus>;

    fn read(&self, oid: &str, buf: &mut [u8], offset: u64) -> Result<usize, RadosStatus>;

    /// Write all of `data` at `offset`
    fn write(&self, oid: &str, data: &[u8], offset: u64) -> Result<(), RadosStatus>;

    /// Replace the whole object
    fn write_full(&self, oid: &str, data: &[u8]) -> Result<(), RadosStatus>;

    fn remove(&self, oid: &str) -> Result<(), RadosStatus>;

    fn trunc(&self, oid: &str, size: u64) -> Result<(), RadosStatus>;
}

/// Connects to a cluster and opens an I/O context on the configured pool
pub trait RadosConnector: Send + Sync {
    fn connect(&self, options: &RadosOptions) -> Result<Box<dyn RadosIoContext>, RadosStatus>;
}

pub struct RadosDevice {
    settings: DeviceSettings,
    connector: Arc<dyn RadosConnector>,
    options: Option<RadosOptions>,
    ctx: Option<Box<dyn RadosIoContext>>,
    volume: Option<String>,
    offset: VirtualOffset,
}

impl RadosDevice {
    pub fn new(settings: DeviceSettings, connector: Arc<dyn RadosConnector>) -> Self {
        Self {
            settings,
            connector,
            options: None,
            ctx: None,
            volume: None,
            offset: VirtualOffset::new(),
        }
    }

    fn parse_options(&mut self) -> DeviceResult<RadosOptions> {
        if let Some(options) = &self.options {
            return Ok(options.clone());
        }
        let options = RadosOptions::parse(&self.settings.device_options)
            .map_err(|e| DeviceError::invalid_option(&self.settings.name, e))?;
        self.options = Some(options.clone());
        Ok(options)
    }

    fn oid(&self) -> &str {
        self.volume.as_deref().unwrap_or(&self.settings.name)
    }

    fn ctx(&self) -> DeviceResult<&dyn RadosIoContext> {
        self.ctx
            .as_deref()
            .ok_or_else(|| DeviceError::not_open(&self.settings.name))
    }
}

impl Device for RadosDevice {
    fn name(&self) -> &str {
        &self.settings.name
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::REMOTE | Capabilities::NATIVE_TRUNCATE
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
        self.ctx.is_some()
    }

    fn open(&mut self, volume: &str, mode: OpenMode, _permissions: u32) -> DeviceResult<()> {
        let options = self.parse_options()?;
        self.close()?;

        log::debug!(
            "connecting to cluster {} as {} (conf {}), pool {}",
            options.clustername,
            options.username,
            options.conffile.display(),
            options.poolname
        );
        let ctx = self
            .connector
            .connect(&options)
            .map_err(|s| DeviceError::from_status(volume, "connect to RADOS cluster", s))?;

        match ctx.stat(volume) {
            Ok(size) => log::debug!("open object {} ({} bytes)", volume, size),
            Err(status) if status.0 == -libc::ENOENT && mode.creates() => {
                ctx.write_full(volume, &[])
                    .map_err(|s| DeviceError::from_status(volume, "create object", s))?;
                log::debug!("created object {} in pool {}", volume, options.poolname);
            }
            Err(status) => return Err(DeviceError::from_status(volume, "stat object", status)),
        }

        self.ctx = Some(ctx);
        self.volume = Some(volume.to_string());
        self.offset.reset();
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> DeviceResult<usize> {
        let n = self
            .ctx()?
            .read(self.oid(), buf, self.offset.get())
            .map_err(|s| DeviceError::from_status(self.oid(), "read", s))?;
        self.offset.advance(n);
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> DeviceResult<usize> {
        self.ctx()?
            .write(self.oid(), buf, self.offset.get())
            .map_err(|s| DeviceError::from_status(self.oid(), "write", s))?;
        self.offset.advance(buf.len());
        Ok(buf.len())
    }

    fn seek(&mut self, offset: i64, whence: Whence) -> DeviceResult<u64> {
        let end = match whence {
            Whence::End => Some(
                self.ctx()?
                    .stat(self.oid())
                    .map_err(|s| DeviceError::from_status(self.oid(), "stat", s))?,
            ),
            _ => None,
        };
        let volume = self.oid().to_string();
        self.offset
            .seek(offset, whence, end)
            .map_err(|e| DeviceError::seek(&volume, e))
    }

    fn truncate(&mut self) -> DeviceResult<()> {
        self.ctx()?
            .trunc(self.oid(), 0)
            .map_err(|s| DeviceError::from_status(self.oid(), "truncate", s))?;
        self.offset.reset();
        Ok(())
    }

    fn close(&mut self) -> DeviceResult<()> {
        if self.ctx.take().is_some() {
            log::debug!("closed RADOS context for {}", self.oid());
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

    struct MemoryPool(MemoryFs);

    fn status(errno: i32) -> RadosStatus {
        RadosStatus(-errno)
    }

    fn key(oid: &str) -> String {
        format!("/{}", oid)
    }

    impl RadosIoContext for MemoryPool {
        fn stat(&self, oid: &str) -> Result<u64, RadosStatus> {
            self.0.stat(&key(oid)).map_err(status)
        }

        fn read(&self, oid: &str, buf: &mut [u8], offset: u64) -> Result<usize, RadosStatus> {
            self.0.read_at(&key(oid), offset, buf).map_err(status)
        }

        fn write(&self, oid: &str, data: &[u8], offset: u64) -> Result<(), RadosStatus> {
            self.0
                .write_at(&key(oid), offset, data, true)
                .map(|_| ())
                .map_err(status)
        }

        fn write_full(&self, oid: &str, data: &[u8]) -> Result<(), RadosStatus> {
            self.0.create(&key(oid)).map_err(status)?;
            self.write(oid, data, 0)
        }

        fn remove(&self, oid: &str) -> Result<(), RadosStatus> {
            self.0.remove(&key(oid)).map_err(status)
        }

        fn trunc(&self, oid: &str, size: u64) -> Result<(), RadosStatus> {
            self.0.truncate(&key(oid), size).map_err(status)
        }
    }

    struct MemoryCluster {
        fs: MemoryFs,
        pool: &'static str,
    }

    impl RadosConnector for MemoryCluster {
        fn connect(&self, options: &RadosOptions) -> Result<Box<dyn RadosIoContext>, RadosStatus> {
            self.fs.connect().map_err(status)?;
            if options.poolname != self.pool {
                return Err(status(libc::ENOENT));
            }
            Ok(Box::new(MemoryPool(self.fs.clone())))
        }
    }

    fn device(fs: &MemoryFs, options: &str) -> RadosDevice {
        RadosDevice::new(
            DeviceSettings::new("Rados", "").with_options(options),
            Arc::new(MemoryCluster {
                fs: fs.clone(),
                pool: "backup",
            }),
        )
    }

    #[test]
    fn test_parse_options() {
        let options = RadosOptions::parse(
            "conffile=/etc/ceph/test.conf,poolname=backup,username=client.bareos",
        )
        .unwrap();
        assert_eq!(options.conffile, PathBuf::from("/etc/ceph/test.conf"));
        assert_eq!(options.clustername, "ceph");
        assert_eq!(options.username, "client.bareos");
        assert_eq!(options.striping, None);

        let options = RadosOptions::parse("poolname=p,striped,stripe_count=4").unwrap();
        assert_eq!(
            options.striping,
            Some(StripeLayout {
                stripe_unit: DEFAULT_STRIPE_UNIT,
                stripe_count: 4,
                object_size: DEFAULT_OBJECT_SIZE,
            })
        );
    }

    #[test]
    fn test_option_errors() {
        assert_eq!(
            RadosOptions::parse("poolname=p,stripe_unit=big"),
            Err(OptionError::NotNumeric {
                token: "stripe_unit=big".to_string()
            })
        );
        assert_eq!(
            RadosOptions::parse("conffile=/etc/ceph/ceph.conf"),
            Err(OptionError::Required("poolname=".to_string()))
        );
        assert!(matches!(
            RadosOptions::parse("poolname=p,bucket=b"),
            Err(OptionError::Unknown(_))
        ));
    }

    #[test]
    fn test_rados_roundtrip() {
        let fs = MemoryFs::new();
        let mut dev = device(&fs, "poolname=backup");
        dev.open("Full-0001", OpenMode::CreateReadWrite, 0o640).unwrap();
        assert!(fs.exists("/Full-0001"));

        assert_eq!(dev.write(b"first block").unwrap(), 11);
        assert_eq!(dev.write(b"|second").unwrap(), 7);
        assert_eq!(dev.offset(), 18);

        dev.seek(6, Whence::Start).unwrap();
        let mut buf = [0u8; 5];
        assert_eq!(dev.read(&mut buf).unwrap(), 5);
        assert_eq!(&buf, b"block");
        assert_eq!(dev.offset(), 11);

        assert_eq!(dev.seek(0, Whence::End).unwrap(), 18);
        assert_eq!(dev.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_native_truncate() {
        let fs = MemoryFs::new();
        let mut dev = device(&fs, "poolname=backup");
        dev.open("Vol", OpenMode::CreateReadWrite, 0o640).unwrap();
        dev.write(&[5u8; 100]).unwrap();
        dev.truncate().unwrap();
        assert_eq!(dev.offset(), 0);
        assert_eq!(fs.contents("/Vol").unwrap().len(), 0);
    }

    #[test]
    fn test_missing_object_read_only() {
        let fs = MemoryFs::new();
        let mut dev = device(&fs, "poolname=backup");
        let err = dev.open("Vol", OpenMode::ReadOnly, 0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(!fs.exists("/Vol"));
    }

    #[test]
    fn test_connect_failure() {
        let fs = MemoryFs::new();
        fs.fail_connect(libc::EACCES);
        let mut dev = device(&fs, "poolname=backup");
        let err = dev.open("Vol", OpenMode::CreateReadWrite, 0o640).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);
        assert!(!dev.is_open());
    }

    #[test]
    fn test_bad_option_never_connects() {
        let fs = MemoryFs::new();
        let mut dev = device(&fs, "poolname=backup,stripe_unit=x");
        let err = dev.open("Vol", OpenMode::CreateReadWrite, 0o640).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidConfiguration);
        assert!(err.to_string().contains("stripe_unit=x"));
        assert_eq!(fs.connects(), 0);
    }

    #[test]
    fn test_out_of_space() {
        let fs = MemoryFs::new();
        let mut dev = device(&fs, "poolname=backup");
        dev.open("Vol", OpenMode::CreateReadWrite, 0o640).unwrap();
        fs.fail_writes(libc::ENOSPC);
        let err = dev.write(b"data").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::EndOfMedium);
        assert_eq!(dev.offset(), 0);
    }
}
