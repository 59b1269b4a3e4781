//! GlusterFS device
//!
//! Volumes are files on a Gluster volume reached through the native client
//! API, addressed by a `uri=` device option:
//!
//! ```text
//! gluster[+transport]://[server[:port]]/volume[/dir][?socket=path]
//! ```

use super::options::{self, DeviceOptions, OptionSpec};
use super::status::GlusterStatus;
use super::{
    parent_dirs, remote_path, BlockSizes, Capabilities, Device, DeviceError, DeviceResult,
    DeviceSettings, OpenMode, OptionError, VirtualOffset, Whence,
};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

pub const DEFAULT_PORT: u16 = 24007;

const OPTIONS: &[OptionSpec] = &[options::value("uri"), options::value("timeout")];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Tcp,
    Rdma,
    Unix,
}

impl Transport {
    pub fn as_str(self) -> &'static str {
        match self {
            Transport::Tcp => "tcp",
            Transport::Rdma => "rdma",
            Transport::Unix => "unix",
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum UriError {
    #[error("scheme must be gluster or gluster+<transport>")]
    Scheme,

    #[error("unknown transport \"{0}\"")]
    Transport(String),

    #[error("invalid port \"{0}\"")]
    Port(String),

    #[error("missing volume name")]
    MissingVolume,

    #[error("unix transport needs ?socket=<path>")]
    SocketRequired,

    #[error("unix transport takes no server")]
    ServerWithUnix,

    #[error("unsupported uri parameter \"{0}\"")]
    Parameter(String),
}

/// Parsed `uri=` value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlusterUri {
    pub transport: Transport,
    pub server: Option<String>,
    pub port: Option<u16>,
    pub volume: String,
    /// Directory inside the volume holding the volumes, without slashes
    pub dir: Option<String>,
    pub socket: Option<PathBuf>,
}

impl GlusterUri {
    pub fn parse(uri: &str) -> Result<Self, UriError> {
        let (scheme, rest) = uri.split_once("://").ok_or(UriError::Scheme)?;
        let transport = match scheme.split_once('+') {
            None if scheme == "gluster" => Transport::Tcp,
            Some(("gluster", "tcp")) => Transport::Tcp,
            Some(("gluster", "rdma")) => Transport::Rdma,
            Some(("gluster", "unix")) => Transport::Unix,
            Some(("gluster", other)) => return Err(UriError::Transport(other.to_string())),
            _ => return Err(UriError::Scheme),
        };

        let (rest, query) = match rest.split_once('?') {
            Some((rest, query)) => (rest, Some(query)),
            None => (rest, None),
        };

        let mut socket = None;
        if let Some(query) = query {
            for param in query.split('&').filter(|p| !p.is_empty()) {
                match param.split_once('=') {
                    Some(("socket", path)) if !path.is_empty() => {
                        socket = Some(PathBuf::from(path))
                    }
                    _ => return Err(UriError::Parameter(param.to_string())),
                }
            }
        }

        let (authority, path) = match rest.find('/') {
            Some(index) => (&rest[..index], &rest[index + 1..]),
            None => (rest, ""),
        };
        let (server, port) = parse_authority(authority)?;

        let mut components = path.split('/').filter(|c| !c.is_empty());
        let volume = components.next().ok_or(UriError::MissingVolume)?.to_string();
        let dir: Vec<&str> = components.collect();
        let dir = if dir.is_empty() {
            None
        } else {
            Some(dir.join("/"))
        };

        match transport {
            Transport::Unix => {
                if server.is_some() {
                    return Err(UriError::ServerWithUnix);
                }
                if socket.is_none() {
                    return Err(UriError::SocketRequired);
                }
            }
            _ => {
                if let Some(path) = socket {
                    return Err(UriError::Parameter(format!("socket={}", path.display())));
                }
            }
        }

        Ok(Self {
            transport,
            server,
            port,
            volume,
            dir,
            socket,
        })
    }
}

fn parse_authority(authority: &str) -> Result<(Option<String>, Option<u16>), UriError> {
    if authority.is_empty() {
        return Ok((None, None));
    }
    // [v6addr]:port
    let (host, port) = if let Some(rest) = authority.strip_prefix('[') {
        match rest.split_once(']') {
            Some((host, tail)) => (host, tail.strip_prefix(':')),
            None => return Err(UriError::Port(authority.to_string())),
        }
    } else {
        match authority.rsplit_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (authority, None),
        }
    };
    let port = match port {
        Some(port) => Some(
            port.parse::<u16>()
                .map_err(|_| UriError::Port(port.to_string()))?,
        ),
        None => None,
    };
    Ok((Some(host.to_string()), port))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GfapiOptions {
    pub uri: GlusterUri,
    /// Client timeout in seconds, handed to the connector as is
    pub timeout: Option<u64>,
}

impl GfapiOptions {
    pub fn parse(input: &str) -> Result<Self, GfapiOptionError> {
        let options = DeviceOptions::parse(input, OPTIONS)?;
        let raw = options.require("uri")?;
        let uri = GlusterUri::parse(raw).map_err(|source| GfapiOptionError::Uri {
            token: format!("uri={}", raw),
            source,
        })?;
        Ok(Self {
            uri,
            timeout: options.get_u64("timeout")?,
        })
    }
}

#[derive(Debug, Error)]
pub enum GfapiOptionError {
    #[error(transparent)]
    Invalid(#[from] OptionError),

    #[error("{source}")]
    Uri {
        token: String,
        #[source]
        source: UriError,
    },
}

/// An open file on a Gluster volume
pub trait GlusterFile: Send {
    fn pread(&mut self, buf: &mut [u8], offset: u64) -> Result<usize, GlusterStatus>;

    fn pwrite(&mut self, data: &[u8], offset: u64) -> Result<usize, GlusterStatus>;

    fn ftruncate(&mut self, size: u64) -> Result<(), GlusterStatus>;

    fn fstat(&mut self) -> Result<u64, GlusterStatus>;
}

/// A mounted Gluster volume
pub trait GlusterFs: Send {
    fn stat(&self, path: &str) -> Result<u64, GlusterStatus>;

    fn mkdir(&self, path: &str, mode: u32) -> Result<(), GlusterStatus>;

    fn unlink(&self, path: &str) -> Result<(), GlusterStatus>;

    /// Create (or truncate) a file and open it read/write
    fn creat(&self, path: &str, mode: u32) -> Result<Box<dyn GlusterFile>, GlusterStatus>;

    fn open(&self, path: &str, mode: OpenMode) -> Result<Box<dyn GlusterFile>, GlusterStatus>;
}

pub trait GlusterConnector: Send + Sync {
    fn connect(
        &self,
        uri: &GlusterUri,
        timeout: Option<u64>,
    ) -> Result<Box<dyn GlusterFs>, GlusterStatus>;
}

const DIR_MODE: u32 = 0o750;
const DEFAULT_FILE_MODE: u32 = 0o640;

pub struct GfapiDevice {
    settings: DeviceSettings,
    connector: Arc<dyn GlusterConnector>,
    options: Option<GfapiOptions>,
    fs: Option<Box<dyn GlusterFs>>,
    file: Option<Box<dyn GlusterFile>>,
    volume: Option<String>,
    path: String,
    permissions: u32,
    offset: VirtualOffset,
}

impl GfapiDevice {
    pub fn new(settings: DeviceSettings, connector: Arc<dyn GlusterConnector>) -> Self {
        Self {
            settings,
            connector,
            options: None,
            fs: None,
            file: None,
            volume: None,
            path: String::new(),
            permissions: DEFAULT_FILE_MODE,
            offset: VirtualOffset::new(),
        }
    }

    /// Path of the open volume inside the Gluster volume
    pub fn path(&self) -> &str {
        &self.path
    }

    fn parse_options(&mut self) -> DeviceResult<GfapiOptions> {
        if let Some(options) = &self.options {
            return Ok(options.clone());
        }
        let options = GfapiOptions::parse(&self.settings.device_options).map_err(|e| match e {
            GfapiOptionError::Invalid(e) => DeviceError::invalid_option(&self.settings.name, e),
            GfapiOptionError::Uri { token, source } => DeviceError::InvalidConfiguration {
                device: self.settings.name.clone(),
                token,
                reason: source.to_string(),
            },
        })?;
        self.options = Some(options.clone());
        Ok(options)
    }

    fn current_volume(&self) -> &str {
        self.volume.as_deref().unwrap_or(&self.settings.name)
    }

    fn file_mut(&mut self) -> DeviceResult<&mut Box<dyn GlusterFile>> {
        match self.file.as_mut() {
            Some(file) => Ok(file),
            None => Err(DeviceError::not_open(&self.settings.name)),
        }
    }

    /// mkdir -p of every directory above `path`
    fn ensure_parents(fs: &dyn GlusterFs, path: &str, volume: &str) -> DeviceResult<()> {
        for dir in parent_dirs(path) {
            match fs.mkdir(&dir, DIR_MODE) {
                Ok(()) => log::debug!("created directory {}", dir),
                Err(status) if status.0 == libc::EEXIST => {}
                Err(status) => {
                    return Err(DeviceError::from_status(
                        volume,
                        &format!("mkdir {}", dir),
                        status,
                    ))
                }
            }
        }
        Ok(())
    }
}

impl Device for GfapiDevice {
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
        self.file.is_some()
    }

    fn open(&mut self, volume: &str, mode: OpenMode, permissions: u32) -> DeviceResult<()> {
        let options = self.parse_options()?;
        self.close()?;

        if self.fs.is_none() {
            let uri = &options.uri;
            log::info!(
                "connecting to gluster volume {} on {} via {}",
                uri.volume,
                uri.server.as_deref().unwrap_or("localhost"),
                uri.transport.as_str()
            );
            let fs = self
                .connector
                .connect(uri, options.timeout)
                .map_err(|s| DeviceError::from_status(volume, "connect to gluster volume", s))?;
            self.fs = Some(fs);
        }
        let fs = match self.fs.as_deref() {
            Some(fs) => fs,
            None => return Err(DeviceError::not_open(&self.settings.name)),
        };

        let path = remote_path(options.uri.dir.as_deref(), volume);
        let permissions = if permissions == 0 {
            DEFAULT_FILE_MODE
        } else {
            permissions
        };

        if mode.creates() {
            Self::ensure_parents(fs, &path, volume)?;
        }
        let file = match fs.open(&path, mode) {
            Ok(file) => file,
            Err(status) if status.0 == libc::ENOENT && mode.creates() => {
                log::debug!("creating {}", path);
                fs.creat(&path, permissions)
                    .map_err(|s| DeviceError::from_status(volume, "create", s))?
            }
            Err(status) => return Err(DeviceError::from_status(volume, "open", status)),
        };

        self.file = Some(file);
        self.volume = Some(volume.to_string());
        self.path = path;
        self.permissions = permissions;
        self.offset.reset();
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> DeviceResult<usize> {
        let offset = self.offset.get();
        let result = self.file_mut()?.pread(buf, offset);
        let n = result.map_err(|s| DeviceError::from_status(self.current_volume(), "read", s))?;
        self.offset.advance(n);
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> DeviceResult<usize> {
        let offset = self.offset.get();
        let result = self.file_mut()?.pwrite(buf, offset);
        let n = result.map_err(|s| DeviceError::from_status(self.current_volume(), "write", s))?;
        self.offset.advance(n);
        Ok(n)
    }

    fn seek(&mut self, offset: i64, whence: Whence) -> DeviceResult<u64> {
        let end = match whence {
            Whence::End => {
                let result = self.file_mut()?.fstat();
                Some(result.map_err(|s| DeviceError::from_status(self.current_volume(), "fstat", s))?)
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
        let file = self.file_mut()?;
        match file.ftruncate(0).and_then(|_| file.fstat()) {
            Ok(0) => {
                self.offset.reset();
                return Ok(());
            }
            Ok(size) => log::warn!(
                "volume \"{}\": size still {} after ftruncate, recreating",
                volume,
                size
            ),
            Err(status) => log::warn!(
                "volume \"{}\": ftruncate failed ({:?}), recreating",
                volume,
                status
            ),
        }

        self.file = None;
        let fs = match self.fs.as_deref() {
            Some(fs) => fs,
            None => return Err(DeviceError::not_open(&self.settings.name)),
        };
        match fs.unlink(&self.path) {
            Ok(()) => {}
            Err(status) if status.0 == libc::ENOENT => {}
            Err(status) => {
                return Err(DeviceError::from_status(&volume, "unlink for truncate", status))
            }
        }
        let file = fs
            .creat(&self.path, self.permissions)
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
