//! Emulated tape drive
//!
//! A regular file standing in for a tape, so label handling and other
//! tape-only paths can run without hardware. The archive device is the
//! image file; the volume name passed to `open` is only used in messages.
//!
//! Image layout: every record is a little-endian `u32` length followed by
//! that many bytes. A zero length is a file mark.
//!
//! ```text
//! [len=80][VOL1...][len=80][HDR1...][len=80][HDR2...][len=0][len=64512][data...]
//! ```

use super::{
    BlockSizes, Capabilities, Device, DeviceError, DeviceResult, DeviceSettings, OpenMode,
    TapeOp, VirtualOffset, Whence,
};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

const HEADER_LEN: u64 = 4;

/// What sits at a position of the image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Entry {
    Record(u32),
    FileMark,
    EndOfData,
}

pub struct VirtualTapeDevice {
    settings: DeviceSettings,
    file: Option<File>,
    volume: Option<String>,
    mode: OpenMode,
    /// Byte position in the image, always on a record boundary
    position: VirtualOffset,
    file_number: u32,
}

impl VirtualTapeDevice {
    pub fn new(settings: DeviceSettings) -> Self {
        Self {
            settings,
            file: None,
            volume: None,
            mode: OpenMode::ReadOnly,
            position: VirtualOffset::new(),
            file_number: 0,
        }
    }

    pub fn image(&self) -> &Path {
        &self.settings.archive_device
    }

    /// Number of file marks passed since the beginning of tape
    pub fn file_number(&self) -> u32 {
        self.file_number
    }

    fn current_volume(&self) -> &str {
        self.volume.as_deref().unwrap_or(&self.settings.name)
    }

    fn io_error(&self, context: &str, err: io::Error) -> DeviceError {
        DeviceError::io(self.current_volume(), context, err)
    }

    fn file_mut(&mut self) -> DeviceResult<&mut File> {
        match self.file.as_mut() {
            Some(file) => Ok(file),
            None => Err(DeviceError::not_open(&self.settings.name)),
        }
    }

    fn entry_at(file: &mut File, position: u64) -> io::Result<Entry> {
        let len = file.metadata()?.len();
        if position >= len {
            return Ok(Entry::EndOfData);
        }
        if position + HEADER_LEN > len {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("truncated record header at {}", position),
            ));
        }
        file.seek(SeekFrom::Start(position))?;
        match file.read_u32::<LittleEndian>()? {
            0 => Ok(Entry::FileMark),
            n => Ok(Entry::Record(n)),
        }
    }

    /// Discard everything from the current position onwards
    fn cut(&mut self) -> DeviceResult<()> {
        let position = self.position.get();
        let result = self.file_mut()?.set_len(position);
        result.map_err(|e| self.io_error("truncate image", e))
    }

    fn append(&mut self, length: u32, payload: &[u8]) -> io::Result<()> {
        let position = self.position.get();
        let file = match self.file.as_mut() {
            Some(file) => file,
            None => return Err(io::Error::from_raw_os_error(libc::EBADF)),
        };
        file.seek(SeekFrom::Start(position))?;
        file.write_u32::<LittleEndian>(length)?;
        file.write_all(payload)?;
        self.position.advance(HEADER_LEN as usize + payload.len());
        Ok(())
    }

    fn forward_space_file(&mut self) -> DeviceResult<()> {
        loop {
            let position = self.position.get();
            let entry = Self::entry_at(self.file_mut()?, position);
            match entry.map_err(|e| self.io_error("forward space file", e))? {
                Entry::Record(n) => self.position.advance(HEADER_LEN as usize + n as usize),
                Entry::FileMark => {
                    self.position.advance(HEADER_LEN as usize);
                    self.file_number += 1;
                    return Ok(());
                }
                Entry::EndOfData => {
                    return Err(DeviceError::from_errno(
                        self.current_volume(),
                        "forward space file: end of data",
                        libc::EIO,
                    ))
                }
            }
        }
    }

    /// Positions of every file mark before the current position
    fn marks_before(&mut self) -> DeviceResult<Vec<u64>> {
        let end = self.position.get();
        let mut marks = Vec::new();
        let mut position = 0;
        while position < end {
            let entry = Self::entry_at(self.file_mut()?, position);
            match entry.map_err(|e| self.io_error("back space file", e))? {
                Entry::Record(n) => position += HEADER_LEN + n as u64,
                Entry::FileMark => {
                    marks.push(position);
                    position += HEADER_LEN;
                }
                Entry::EndOfData => break,
            }
        }
        Ok(marks)
    }

    /// Leaves the position in front of the `count`th mark back
    fn back_space_file(&mut self, count: u32) -> DeviceResult<()> {
        let marks = self.marks_before()?;
        let count = count as usize;
        if count == 0 {
            return Ok(());
        }
        if count > marks.len() {
            self.position.reset();
            self.file_number = 0;
            return Err(DeviceError::from_errno(
                self.current_volume(),
                "back space file: beginning of tape",
                libc::EIO,
            ));
        }
        let target = marks[marks.len() - count];
        self.position.set(target);
        self.file_number = (marks.len() - count) as u32;
        Ok(())
    }

    fn rewind(&mut self) {
        self.position.reset();
        self.file_number = 0;
    }
}

impl Device for VirtualTapeDevice {
    fn name(&self) -> &str {
        &self.settings.name
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::TAPE | Capabilities::BLOCK_ADDRESSED
    }

    fn block_sizes(&self) -> BlockSizes {
        self.settings.block_sizes
    }

    fn volume_name(&self) -> Option<&str> {
        self.volume.as_deref()
    }

    fn offset(&self) -> u64 {
        self.position.get()
    }

    fn is_open(&self) -> bool {
        self.file.is_some()
    }

    fn open(&mut self, volume: &str, mode: OpenMode, permissions: u32) -> DeviceResult<()> {
        self.close()?;
        let mut opts = OpenOptions::new();
        opts.read(true)
            .write(mode.writable())
            .create(mode.creates())
            .mode(if permissions == 0 { 0o640 } else { permissions });
        let file = opts.open(&self.settings.archive_device).map_err(|e| {
            DeviceError::io(
                volume,
                &format!("open tape image {}", self.settings.archive_device.display()),
                e,
            )
        })?;
        log::debug!(
            "tape image {} loaded as {}",
            self.settings.archive_device.display(),
            volume
        );

        self.file = Some(file);
        self.volume = Some(volume.to_string());
        self.mode = mode;
        self.rewind();
        Ok(())
    }

    /// One record per call; a file mark reads as 0 and is stepped over.
    fn read(&mut self, buf: &mut [u8]) -> DeviceResult<usize> {
        let position = self.position.get();
        let entry = Self::entry_at(self.file_mut()?, position);
        match entry.map_err(|e| self.io_error("read", e))? {
            Entry::EndOfData => Ok(0),
            Entry::FileMark => {
                self.position.advance(HEADER_LEN as usize);
                self.file_number += 1;
                Ok(0)
            }
            Entry::Record(length) => {
                let n = buf.len().min(length as usize);
                let result = self.file_mut()?.read_exact(&mut buf[..n]);
                result.map_err(|e| self.io_error("read", e))?;
                if n < length as usize {
                    log::debug!("record of {} bytes read into {} byte buffer", length, n);
                }
                self.position
                    .advance(HEADER_LEN as usize + length as usize);
                Ok(n)
            }
        }
    }

    /// Writes one record. Anything after the current position is lost.
    fn write(&mut self, buf: &[u8]) -> DeviceResult<usize> {
        if !self.mode.writable() {
            return Err(DeviceError::from_errno(self.current_volume(), "write", libc::EBADF));
        }
        if buf.is_empty() {
            return Ok(0);
        }
        let length = u32::try_from(buf.len()).map_err(|_| {
            DeviceError::from_errno(self.current_volume(), "write oversized record", libc::EINVAL)
        })?;
        self.cut()?;
        self.append(length, buf)
            .map_err(|e| self.io_error("write", e))?;
        Ok(buf.len())
    }

    fn seek(&mut self, offset: i64, whence: Whence) -> DeviceResult<u64> {
        self.file_mut()?;
        match (offset, whence) {
            (0, Whence::Start) => {
                self.rewind();
                Ok(0)
            }
            _ => Err(DeviceError::unsupported(
                self.current_volume(),
                "byte seek on tape",
            )),
        }
    }

    fn truncate(&mut self) -> DeviceResult<()> {
        self.rewind();
        self.cut()
    }

    fn close(&mut self) -> DeviceResult<()> {
        if let Some(file) = self.file.take() {
            file.sync_all()
                .map_err(|e| self.io_error("sync tape image", e))?;
        }
        Ok(())
    }

    fn ioctl(&mut self, op: TapeOp) -> DeviceResult<()> {
        self.file_mut()?;
        log::debug!("{}: {:?}", self.settings.name, op);
        match op {
            TapeOp::WriteEof(count) => {
                if !self.mode.writable() {
                    return Err(DeviceError::from_errno(
                        self.current_volume(),
                        "write file mark",
                        libc::EBADF,
                    ));
                }
                self.cut()?;
                for _ in 0..count {
                    self.append(0, &[])
                        .map_err(|e| self.io_error("write file mark", e))?;
                    self.file_number += 1;
                }
                Ok(())
            }
            TapeOp::Rewind => {
                self.rewind();
                Ok(())
            }
            TapeOp::ForwardSpaceFile(count) => {
                for _ in 0..count {
                    self.forward_space_file()?;
                }
                Ok(())
            }
            TapeOp::BackSpaceFile(count) => self.back_space_file(count),
            TapeOp::Offline => {
                self.rewind();
                self.close()
            }
        }
    }
}
