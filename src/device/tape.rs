//! SCSI tape device
//!
//! Drives a tape through the Linux `st` driver: reads and writes go straight
//! to the character device, positioning goes through `MTIOCTOP`.

use super::{
    BlockSizes, Capabilities, Device, DeviceError, DeviceResult, DeviceSettings, OpenMode,
    TapeOp, VirtualOffset, Whence,
};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;

/// `struct mtop` from `<sys/mtio.h>`
#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct MtOp {
    mt_op: libc::c_short,
    mt_count: libc::c_int,
}

/// `_IOW('m', 1, struct mtop)`
const MTIOCTOP: libc::c_ulong = 0x4008_6d01;

const MTFSF: libc::c_short = 1;
const MTBSF: libc::c_short = 2;
const MTWEOF: libc::c_short = 5;
const MTREW: libc::c_short = 6;
const MTOFFL: libc::c_short = 7;

impl MtOp {
    fn from_op(op: TapeOp) -> Self {
        let (mt_op, count) = match op {
            TapeOp::WriteEof(n) => (MTWEOF, n),
            TapeOp::Rewind => (MTREW, 1),
            TapeOp::ForwardSpaceFile(n) => (MTFSF, n),
            TapeOp::BackSpaceFile(n) => (MTBSF, n),
            TapeOp::Offline => (MTOFFL, 1),
        };
        Self {
            mt_op,
            mt_count: count.min(libc::c_int::MAX as u32) as libc::c_int,
        }
    }
}

pub struct TapeDevice {
    settings: DeviceSettings,
    file: Option<File>,
    volume: Option<String>,
    /// Bytes transferred since the last positioning operation
    offset: VirtualOffset,
}

impl TapeDevice {
    pub fn new(settings: DeviceSettings) -> Self {
        Self {
            settings,
            file: None,
            volume: None,
            offset: VirtualOffset::new(),
        }
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

    fn mtioctop(&mut self, op: TapeOp) -> DeviceResult<()> {
        let fd = self.file_mut()?.as_raw_fd();
        let request = MtOp::from_op(op);
        // SAFETY: fd is an open descriptor owned by self.file and request is a
        // properly initialised struct mtop that outlives the call.
        let rc = unsafe { libc::ioctl(fd, MTIOCTOP as _, &request as *const MtOp) };
        if rc < 0 {
            return Err(DeviceError::io(
                self.current_volume(),
                &format!("tape ioctl {:?}", op),
                std::io::Error::last_os_error(),
            ));
        }
        Ok(())
    }
}

impl Device for TapeDevice {
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
        self.offset.get()
    }

    fn is_open(&self) -> bool {
        self.file.is_some()
    }

    fn open(&mut self, volume: &str, mode: OpenMode, _permissions: u32) -> DeviceResult<()> {
        self.close()?;
        let path = &self.settings.archive_device;
        let file = OpenOptions::new()
            .read(mode.readable())
            .write(mode.writable())
            .custom_flags(libc::O_NONBLOCK)
            .open(path)
            .map_err(|e| DeviceError::io(volume, &format!("open {}", path.display()), e))?;

        // O_NONBLOCK only so the open does not wait for a loaded medium
        let fd = file.as_raw_fd();
        // SAFETY: fd is valid for the lifetime of `file`
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        if flags >= 0 {
            // SAFETY: as above
            unsafe { libc::fcntl(fd, libc::F_SETFL, flags & !libc::O_NONBLOCK) };
        }

        log::info!("opened tape {} for {}", path.display(), volume);
        self.file = Some(file);
        self.volume = Some(volume.to_string());
        self.offset.reset();
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> DeviceResult<usize> {
        let result = self.file_mut()?.read(buf);
        let n = result.map_err(|e| DeviceError::io(self.current_volume(), "read", e))?;
        self.offset.advance(n);
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> DeviceResult<usize> {
        let result = self.file_mut()?.write(buf);
        let n = result.map_err(|e| DeviceError::io(self.current_volume(), "write", e))?;
        self.offset.advance(n);
        Ok(n)
    }

    fn seek(&mut self, offset: i64, whence: Whence) -> DeviceResult<u64> {
        match (offset, whence) {
            (0, Whence::Start) => {
                self.ioctl(TapeOp::Rewind)?;
                Ok(0)
            }
            _ => Err(DeviceError::unsupported(
                self.current_volume(),
                "byte seek on tape",
            )),
        }
    }

    fn truncate(&mut self) -> DeviceResult<()> {
        // rewinding and writing a mark leaves nothing readable behind
        self.ioctl(TapeOp::Rewind)?;
        self.ioctl(TapeOp::WriteEof(1))?;
        self.ioctl(TapeOp::Rewind)
    }

    fn close(&mut self) -> DeviceResult<()> {
        if self.file.take().is_some() {
            log::debug!("closed tape {}", self.settings.archive_device.display());
        }
        self.offset.reset();
        Ok(())
    }

    fn ioctl(&mut self, op: TapeOp) -> DeviceResult<()> {
        log::debug!("{}: {:?}", self.settings.name, op);
        self.mtioctop(op)?;
        self.offset.reset();
        if op == TapeOp::Offline {
            self.close()?;
        }
        Ok(())
    }
}
