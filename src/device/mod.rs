//! Storage devices
//!
//! This module defines the `Device` trait every backend implements, the
//! shared error vocabulary, and the backend drivers themselves.

pub mod elasto;
pub mod file;
pub mod gfapi;
pub mod mounted;
pub mod object_store;
pub mod offset;
pub mod options;
pub mod posix;
pub mod profile;
pub mod rados;
pub mod registry;
pub mod s3;
pub mod shared;
pub mod status;
#[cfg(target_os = "linux")]
pub mod tape;
pub mod vtape;

#[cfg(test)]
pub(crate) mod testing;

use bitflags::bitflags;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

pub use offset::{SeekError, VirtualOffset};
pub use options::{DeviceOptions, OptionError};
pub use registry::DeviceRegistry;
pub use status::NativeStatus;

/// Device errors
///
/// Every variant names the volume (or the device, before a volume is known)
/// so messages are meaningful without further context.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("volume \"{volume}\": not found: {detail}")]
    NotFound { volume: String, detail: String },

    #[error("volume \"{volume}\": already exists: {detail}")]
    AlreadyExists { volume: String, detail: String },

    #[error("volume \"{volume}\": permission denied: {detail}")]
    PermissionDenied { volume: String, detail: String },

    #[error("volume \"{volume}\": invalid name: {detail}")]
    InvalidName { volume: String, detail: String },

    #[error("device \"{device}\": invalid device option \"{token}\": {reason}")]
    InvalidConfiguration {
        device: String,
        token: String,
        reason: String,
    },

    #[error("volume \"{volume}\": {context}: {source}")]
    Io {
        volume: String,
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("volume \"{volume}\": end of medium: {detail}")]
    EndOfMedium { volume: String, detail: String },

    #[error("volume \"{volume}\": label error: {detail}")]
    Label { volume: String, detail: String },

    #[error("wrong volume mounted: requested \"{requested}\", found \"{found}\"")]
    LabelNameMismatch { requested: String, found: String },

    #[error("volume \"{volume}\": {operation} is not supported by this device")]
    Unsupported { volume: String, operation: String },

    #[error("device \"{device}\": mount failure: {detail}")]
    MountFailure { device: String, detail: String },
}

/// Result type for device operations
pub type DeviceResult<T> = Result<T, DeviceError>;

/// Coarse classification of a `DeviceError`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    PermissionDenied,
    InvalidName,
    InvalidConfiguration,
    Io,
    EndOfMedium,
    Label,
    LabelNameMismatch,
    Unsupported,
    MountFailure,
}

impl DeviceError {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            DeviceError::NotFound { .. } => ErrorKind::NotFound,
            DeviceError::AlreadyExists { .. } => ErrorKind::AlreadyExists,
            DeviceError::PermissionDenied { .. } => ErrorKind::PermissionDenied,
            DeviceError::InvalidName { .. } => ErrorKind::InvalidName,
            DeviceError::InvalidConfiguration { .. } => ErrorKind::InvalidConfiguration,
            DeviceError::Io { .. } => ErrorKind::Io,
            DeviceError::EndOfMedium { .. } => ErrorKind::EndOfMedium,
            DeviceError::Label { .. } => ErrorKind::Label,
            DeviceError::LabelNameMismatch { .. } => ErrorKind::LabelNameMismatch,
            DeviceError::Unsupported { .. } => ErrorKind::Unsupported,
            DeviceError::MountFailure { .. } => ErrorKind::MountFailure,
        }
    }

    /// POSIX error number equivalent, for callers that report errno values
    pub fn errno(&self) -> i32 {
        match self {
            DeviceError::NotFound { .. } => libc::ENOENT,
            DeviceError::AlreadyExists { .. } => libc::EEXIST,
            DeviceError::PermissionDenied { .. } => libc::EPERM,
            DeviceError::InvalidName { .. } => libc::ENAMETOOLONG,
            DeviceError::InvalidConfiguration { .. } => libc::EINVAL,
            DeviceError::Io { source, .. } => source.raw_os_error().unwrap_or(libc::EIO),
            DeviceError::EndOfMedium { .. } => libc::ENOSPC,
            DeviceError::Label { .. } | DeviceError::LabelNameMismatch { .. } => libc::EIO,
            DeviceError::Unsupported { .. } => libc::ENOTSUP,
            DeviceError::MountFailure { .. } => libc::EIO,
        }
    }

    /// Build an error from a POSIX error number.
    pub fn from_errno(volume: &str, context: &str, errno: i32) -> Self {
        let volume = volume.to_string();
        let detail = || format!("{}: {}", context, io::Error::from_raw_os_error(errno));
        match errno {
            libc::ENOENT => DeviceError::NotFound {
                volume,
                detail: detail(),
            },
            libc::EEXIST => DeviceError::AlreadyExists {
                volume,
                detail: detail(),
            },
            libc::EPERM | libc::EACCES => DeviceError::PermissionDenied {
                volume,
                detail: detail(),
            },
            libc::ENAMETOOLONG => DeviceError::InvalidName {
                volume,
                detail: detail(),
            },
            libc::ENOSPC => DeviceError::EndOfMedium {
                volume,
                detail: detail(),
            },
            _ => DeviceError::Io {
                volume,
                context: context.to_string(),
                source: io::Error::from_raw_os_error(errno),
            },
        }
    }

    /// Build an error from a backend's native status code.
    pub fn from_status<S: NativeStatus>(volume: &str, context: &str, status: S) -> Self {
        DeviceError::from_errno(volume, context, status.errno())
    }

    /// Build an error from a host I/O error.
    pub fn io(volume: &str, context: &str, err: io::Error) -> Self {
        if let Some(errno) = err.raw_os_error() {
            return DeviceError::from_errno(volume, context, errno);
        }
        match err.kind() {
            io::ErrorKind::NotFound => DeviceError::from_errno(volume, context, libc::ENOENT),
            io::ErrorKind::AlreadyExists => DeviceError::from_errno(volume, context, libc::EEXIST),
            io::ErrorKind::PermissionDenied => {
                DeviceError::from_errno(volume, context, libc::EACCES)
            }
            _ => DeviceError::Io {
                volume: volume.to_string(),
                context: context.to_string(),
                source: err,
            },
        }
    }

    pub fn invalid_option(device: &str, err: OptionError) -> Self {
        DeviceError::InvalidConfiguration {
            device: device.to_string(),
            token: err.token().to_string(),
            reason: err.to_string(),
        }
    }

    pub fn seek(volume: &str, err: SeekError) -> Self {
        match err {
            SeekError::UnknownEnd => DeviceError::Unsupported {
                volume: volume.to_string(),
                operation: "seek relative to end".to_string(),
            },
            other => DeviceError::Io {
                volume: volume.to_string(),
                context: "seek".to_string(),
                source: io::Error::new(io::ErrorKind::InvalidInput, other),
            },
        }
    }

    pub fn not_open(device: &str) -> Self {
        DeviceError::Io {
            volume: device.to_string(),
            context: "device is not open".to_string(),
            source: io::Error::from_raw_os_error(libc::EBADF),
        }
    }

    pub fn unsupported(volume: &str, operation: &str) -> Self {
        DeviceError::Unsupported {
            volume: volume.to_string(),
            operation: operation.to_string(),
        }
    }
}

bitflags! {
    /// What a device can do
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Capabilities: u32 {
        const TAPE = 1 << 0;
        const REQUIRES_MOUNT = 1 << 1;
        const CONCURRENT_READ = 1 << 2;
        const BLOCK_ADDRESSED = 1 << 3;
        const NATIVE_SEEK = 1 << 4;
        const NATIVE_TRUNCATE = 1 << 5;
        const REMOTE = 1 << 6;
    }
}

/// How positions on the medium are addressed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekMode {
    /// Arbitrary byte offsets
    Bytes,
    /// Whole blocks and file marks only (tapes)
    Blocks,
}

/// Open mode for a volume
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    CreateReadWrite,
    ReadWrite,
    ReadOnly,
    WriteOnly,
}

impl OpenMode {
    pub fn creates(self) -> bool {
        self == OpenMode::CreateReadWrite
    }

    pub fn readable(self) -> bool {
        self != OpenMode::WriteOnly
    }

    pub fn writable(self) -> bool {
        self != OpenMode::ReadOnly
    }
}

/// Reference point for `Device::seek`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    Start,
    Current,
    End,
}

/// Tape positioning operations accepted by `Device::ioctl`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TapeOp {
    WriteEof(u32),
    Rewind,
    ForwardSpaceFile(u32),
    BackSpaceFile(u32),
    Offline,
}

/// Minimum and maximum block size; 0 means unconstrained
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockSizes {
    pub minimum: u32,
    pub maximum: u32,
}

/// Per-device settings resolved from configuration
#[derive(Debug, Clone, Default)]
pub struct DeviceSettings {
    /// Device resource name
    pub name: String,
    /// Archive device path (directory, tape node or emulated tape file)
    pub archive_device: PathBuf,
    /// Backend-specific `device_options` string
    pub device_options: String,
    pub block_sizes: BlockSizes,
    /// External command used instead of unlink when recreating volumes
    pub secure_erase_command: Option<String>,
}

impl DeviceSettings {
    pub fn new(name: impl Into<String>, archive_device: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            archive_device: archive_device.into(),
            ..Self::default()
        }
    }

    pub fn with_options(mut self, device_options: impl Into<String>) -> Self {
        self.device_options = device_options.into();
        self
    }
}

/// Device trait - the contract every storage backend implements.
///
/// Operations on one handle are strictly sequential. The virtual offset
/// reported by `offset()` is authoritative for every backend, whether or not
/// the backend also keeps a native cursor.
pub trait Device: Send {
    /// Device resource name
    fn name(&self) -> &str;

    fn capabilities(&self) -> Capabilities;

    fn block_sizes(&self) -> BlockSizes;

    /// Name of the currently open volume
    fn volume_name(&self) -> Option<&str>;

    /// Current virtual offset
    fn offset(&self) -> u64;

    fn is_open(&self) -> bool;

    /// Open a volume. Resets the virtual offset to 0 on success.
    fn open(&mut self, volume: &str, mode: OpenMode, permissions: u32) -> DeviceResult<()>;

    /// Read up to `buf.len()` bytes. 0 means no more data.
    fn read(&mut self, buf: &mut [u8]) -> DeviceResult<usize>;

    /// Write up to `buf.len()` bytes, returning how many were written.
    fn write(&mut self, buf: &[u8]) -> DeviceResult<usize>;

    fn seek(&mut self, offset: i64, whence: Whence) -> DeviceResult<u64>;

    /// Discard all data on the open volume.
    fn truncate(&mut self) -> DeviceResult<()>;

    /// Release the backend connection. Closing a closed device is a no-op.
    fn close(&mut self) -> DeviceResult<()>;

    fn ioctl(&mut self, op: TapeOp) -> DeviceResult<()> {
        Err(DeviceError::unsupported(
            self.volume_name().unwrap_or(self.name()),
            &format!("ioctl {:?}", op),
        ))
    }

    /// Write end-of-file marks. A no-op on media without file marks.
    fn weof(&mut self, count: u32) -> DeviceResult<()> {
        if self.is_tape() {
            self.ioctl(TapeOp::WriteEof(count))
        } else {
            Ok(())
        }
    }

    /// Make the medium available. Devices without a mount step succeed.
    fn mount(&mut self, _timeout: bool) -> DeviceResult<()> {
        Ok(())
    }

    fn unmount(&mut self, _timeout: bool) -> DeviceResult<()> {
        Ok(())
    }

    fn is_tape(&self) -> bool {
        self.capabilities().contains(Capabilities::TAPE)
    }

    fn requires_mount(&self) -> bool {
        self.capabilities().contains(Capabilities::REQUIRES_MOUNT)
    }

    fn can_read_concurrently(&self) -> bool {
        self.capabilities().contains(Capabilities::CONCURRENT_READ)
    }

    fn seek_mode(&self) -> SeekMode {
        if self.capabilities().contains(Capabilities::BLOCK_ADDRESSED) {
            SeekMode::Blocks
        } else {
            SeekMode::Bytes
        }
    }
}

/// Join a volume name onto an optional base directory, `/`-separated.
pub(crate) fn remote_path(basedir: Option<&str>, volume: &str) -> String {
    match basedir.map(|b| b.trim_matches('/')).filter(|b| !b.is_empty()) {
        Some(base) => format!("/{}/{}", base, volume),
        None => format!("/{}", volume),
    }
}

/// Every proper ancestor directory of a `/`-separated path, outermost first.
pub(crate) fn parent_dirs(path: &str) -> Vec<String> {
    let components: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
    let mut dirs = Vec::new();
    let mut current = String::new();
    for component in components.iter().take(components.len().saturating_sub(1)) {
        current.push('/');
        current.push_str(component);
        dirs.push(current.clone());
    }
    dirs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_classification() {
        let err = DeviceError::from_errno("Vol1", "open", libc::ENOENT);
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(err.errno(), libc::ENOENT);

        let err = DeviceError::from_errno("Vol1", "write", libc::ENOSPC);
        assert_eq!(err.kind(), ErrorKind::EndOfMedium);

        let err = DeviceError::from_errno("Vol1", "read", libc::EBUSY);
        assert_eq!(err.kind(), ErrorKind::Io);
        assert_eq!(err.errno(), libc::EBUSY);
    }

    #[test]
    fn test_error_message_names_volume() {
        let err = DeviceError::from_errno("Full-0001", "open", libc::EACCES);
        let message = err.to_string();
        assert!(message.contains("Full-0001"));
        assert!(message.contains("permission denied"));
    }

    #[test]
    fn test_io_error_without_errno() {
        let err = DeviceError::io(
            "Vol1",
            "read",
            io::Error::new(io::ErrorKind::NotFound, "gone"),
        );
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_remote_path() {
        assert_eq!(remote_path(None, "Vol1"), "/Vol1");
        assert_eq!(remote_path(Some("/backups/"), "Vol1"), "/backups/Vol1");
        assert_eq!(remote_path(Some(""), "Vol1"), "/Vol1");
    }

    #[test]
    fn test_parent_dirs() {
        assert_eq!(parent_dirs("/a/b/Vol1"), vec!["/a", "/a/b"]);
        assert!(parent_dirs("/Vol1").is_empty());
    }

    #[test]
    fn test_open_mode_directions() {
        assert!(OpenMode::CreateReadWrite.creates());
        assert!(!OpenMode::ReadWrite.creates());
        assert!(!OpenMode::ReadOnly.writable());
        assert!(!OpenMode::WriteOnly.readable());
    }
}
