//! Local file device
//!
//! Volumes are plain files in a directory on the host filesystem.

use super::options::{self, DeviceOptions, OptionSpec};
use super::{
    BlockSizes, Capabilities, Device, DeviceError, DeviceResult, DeviceSettings, OpenMode,
    VirtualOffset, Whence,
};
use crate::command::{expand_template, run_command};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::fs::{MetadataExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

const OPTIONS: &[OptionSpec] = &[options::value("basedir")];

/// File-based device
pub struct LocalFileDevice {
    settings: DeviceSettings,
    capabilities: Capabilities,
    basedir: Option<PathBuf>,
    options_parsed: bool,
    file: Option<File>,
    path: PathBuf,
    volume: Option<String>,
    offset: VirtualOffset,
}

impl LocalFileDevice {
    pub fn new(settings: DeviceSettings) -> Self {
        Self::with_capabilities(
            settings,
            Capabilities::CONCURRENT_READ | Capabilities::NATIVE_SEEK | Capabilities::NATIVE_TRUNCATE,
        )
    }

    pub(crate) fn with_capabilities(settings: DeviceSettings, capabilities: Capabilities) -> Self {
        Self {
            settings,
            capabilities,
            basedir: None,
            options_parsed: false,
            file: None,
            path: PathBuf::new(),
            volume: None,
            offset: VirtualOffset::new(),
        }
    }

    /// Path of the open volume, or of the last one opened
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Directory holding the volumes
    pub fn volume_dir(&self) -> &Path {
        self.basedir.as_deref().unwrap_or(&self.settings.archive_device)
    }

    fn parse_options(&mut self) -> DeviceResult<()> {
        if self.options_parsed {
            return Ok(());
        }
        let options = DeviceOptions::parse(&self.settings.device_options, OPTIONS)
            .map_err(|e| DeviceError::invalid_option(&self.settings.name, e))?;
        self.basedir = options.get("basedir").map(PathBuf::from);
        self.options_parsed = true;
        Ok(())
    }

    fn current_volume(&self) -> &str {
        self.volume.as_deref().unwrap_or(&self.settings.name)
    }

    fn file_mut(&mut self) -> DeviceResult<&mut File> {
        match self.file.as_mut() {
            Some(file) => Ok(file),
            None => Err(DeviceError::not_open(&self.settings.name)),
        }
    }

    fn open_options(mode: OpenMode, permissions: u32) -> OpenOptions {
        let mut opts = OpenOptions::new();
        opts.read(mode.readable())
            .write(mode.writable())
            .create(mode.creates())
            .mode(permissions);
        opts
    }

    /// Recreate the volume file empty, keeping its mode and ownership.
    fn recreate(&mut self) -> DeviceResult<()> {
        let volume = self.current_volume().to_string();
        let path = self.path.clone();

        let metadata =
            fs::metadata(&path).map_err(|e| DeviceError::io(&volume, "stat before truncate", e))?;
        let mode = metadata.permissions().mode() & 0o7777;
        let (uid, gid) = (metadata.uid(), metadata.gid());

        self.file = None;

        match &self.settings.secure_erase_command {
            Some(template) => secure_erase(template, &path, &volume)?,
            None => fs::remove_file(&path)
                .map_err(|e| DeviceError::io(&volume, "unlink for truncate", e))?,
        }

        let created = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(mode)
            .open(&path)
            .map_err(|e| DeviceError::io(&volume, "recreate after truncate", e))?;
        // the umask may have narrowed the mode given to open
        created
            .set_permissions(fs::Permissions::from_mode(mode))
            .map_err(|e| DeviceError::io(&volume, "restore mode after truncate", e))?;
        drop(created);

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| DeviceError::io(&volume, "reopen after truncate", e))?;

        if let Err(e) = std::os::unix::fs::chown(&path, Some(uid), Some(gid)) {
            log::warn!(
                "volume \"{}\": cannot restore owner {}:{} on {}: {}",
                volume,
                uid,
                gid,
                path.display(),
                e
            );
        }

        self.file = Some(file);
        self.offset.reset();
        Ok(())
    }
}

impl Device for LocalFileDevice {
    fn name(&self) -> &str {
        &self.settings.name
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
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
        self.parse_options()?;
        self.close()?;

        let path = self.volume_dir().join(volume);
        log::debug!("open {} mode {:?}", path.display(), mode);

        let file = Self::open_options(mode, permissions)
            .open(&path)
            .map_err(|e| DeviceError::io(volume, &format!("open {}", path.display()), e))?;

        self.file = Some(file);
        self.path = path;
        self.volume = Some(volume.to_string());
        self.offset.reset();
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> DeviceResult<usize> {
        let file = self.file_mut()?;
        let result = file.read(buf);
        let n = result.map_err(|e| DeviceError::io(self.current_volume(), "read", e))?;
        self.offset.advance(n);
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> DeviceResult<usize> {
        let file = self.file_mut()?;
        let result = file.write(buf);
        let n = result.map_err(|e| DeviceError::io(self.current_volume(), "write", e))?;
        self.offset.advance(n);
        Ok(n)
    }

    fn seek(&mut self, offset: i64, whence: Whence) -> DeviceResult<u64> {
        let volume = self.current_volume().to_string();
        let file = self.file_mut()?;
        let end = match whence {
            Whence::End => Some(
                file.metadata()
                    .map_err(|e| DeviceError::io(&volume, "stat", e))?
                    .len(),
            ),
            _ => None,
        };
        let target = self
            .offset
            .resolve(offset, whence, end)
            .map_err(|e| DeviceError::seek(&volume, e))?;

        let file = self.file_mut()?;
        file.seek(SeekFrom::Start(target))
            .map_err(|e| DeviceError::io(&volume, "seek", e))?;
        self.offset.set(target);
        Ok(target)
    }

    fn truncate(&mut self) -> DeviceResult<()> {
        let volume = self.current_volume().to_string();

        if self.settings.secure_erase_command.is_none() {
            let file = self.file_mut()?;
            match file.set_len(0).and_then(|_| file.metadata()) {
                Ok(metadata) if metadata.len() == 0 => {
                    file.seek(SeekFrom::Start(0))
                        .map_err(|e| DeviceError::io(&volume, "seek after truncate", e))?;
                    self.offset.reset();
                    return Ok(());
                }
                Ok(metadata) => log::warn!(
                    "volume \"{}\": size still {} after truncate, recreating",
                    volume,
                    metadata.len()
                ),
                Err(e) => log::warn!("volume \"{}\": truncate failed ({}), recreating", volume, e),
            }
        } else if self.file.is_none() {
            return Err(DeviceError::not_open(&self.settings.name));
        }

        self.recreate()
    }

    fn close(&mut self) -> DeviceResult<()> {
        if let Some(file) = self.file.take() {
            log::debug!("close {}", self.path.display());
            drop(file);
        }
        self.offset.reset();
        Ok(())
    }
}

/// Run the secure-erase command on `path` (`%f` in the template).
pub(crate) fn secure_erase(template: &str, path: &Path, volume: &str) -> DeviceResult<()> {
    let path_str = path.to_string_lossy();
    let command = expand_template(template, &[('f', &path_str)]);
    log::info!("volume \"{}\": secure erase: {}", volume, command);

    let out = run_command(&command, None)
        .map_err(|e| DeviceError::io(volume, "run secure erase command", e))?;
    if !out.success() {
        return Err(DeviceError::Io {
            volume: volume.to_string(),
            context: format!("secure erase command \"{}\"", command),
            source: std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("exit status {:?}: {}", out.status, out.output.trim()),
            ),
        });
    }
    if path.exists() {
        fs::remove_file(path).map_err(|e| DeviceError::io(volume, "unlink after secure erase", e))?;
    }
    Ok(())
}
