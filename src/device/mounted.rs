//! File device on a mount point
//!
//! Removable media (USB disks, RDX cartridges) and network shares hold their
//! volumes as files under a mount point that must be mounted before use.

use super::file::LocalFileDevice;
use super::{
    BlockSizes, Capabilities, Device, DeviceResult, DeviceSettings, OpenMode, TapeOp, Whence,
};
use crate::mount::{MountConfig, MountOrchestrator, MountState};

pub struct MountedFileDevice {
    inner: LocalFileDevice,
    mounter: MountOrchestrator,
}

impl MountedFileDevice {
    /// `settings.archive_device` is the device node given to the mount
    /// command; volumes live under `mount.mount_point`.
    pub fn new(settings: DeviceSettings, mount: MountConfig) -> Self {
        Self::with_orchestrator(settings, MountOrchestrator::new(mount))
    }

    pub fn with_orchestrator(mut settings: DeviceSettings, mounter: MountOrchestrator) -> Self {
        settings.archive_device = mounter.config().mount_point.clone();
        Self {
            inner: LocalFileDevice::with_capabilities(
                settings,
                Capabilities::REQUIRES_MOUNT
                    | Capabilities::CONCURRENT_READ
                    | Capabilities::NATIVE_SEEK
                    | Capabilities::NATIVE_TRUNCATE,
            ),
            mounter,
        }
    }

    pub fn mount_state(&self) -> MountState {
        self.mounter.state()
    }
}

impl Device for MountedFileDevice {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn capabilities(&self) -> Capabilities {
        self.inner.capabilities()
    }

    fn block_sizes(&self) -> BlockSizes {
        self.inner.block_sizes()
    }

    fn volume_name(&self) -> Option<&str> {
        self.inner.volume_name()
    }

    fn offset(&self) -> u64 {
        self.inner.offset()
    }

    fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    fn open(&mut self, volume: &str, mode: OpenMode, permissions: u32) -> DeviceResult<()> {
        if self.mounter.state() != MountState::Mounted {
            self.mounter.mount(Some(volume), true)?;
        }
        self.inner.open(volume, mode, permissions)
    }

    fn read(&mut self, buf: &mut [u8]) -> DeviceResult<usize> {
        self.inner.read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> DeviceResult<usize> {
        self.inner.write(buf)
    }

    fn seek(&mut self, offset: i64, whence: Whence) -> DeviceResult<u64> {
        self.inner.seek(offset, whence)
    }

    fn truncate(&mut self) -> DeviceResult<()> {
        self.inner.truncate()
    }

    fn close(&mut self) -> DeviceResult<()> {
        self.inner.close()
    }

    fn ioctl(&mut self, op: TapeOp) -> DeviceResult<()> {
        self.inner.ioctl(op)
    }

    fn mount(&mut self, timeout: bool) -> DeviceResult<()> {
        let volume = self.inner.volume_name().map(str::to_string);
        self.mounter.mount(volume.as_deref(), timeout)
    }

    fn unmount(&mut self, timeout: bool) -> DeviceResult<()> {
        self.inner.close()?;
        let volume = self.inner.volume_name().map(str::to_string);
        self.mounter.unmount(volume.as_deref(), timeout)
    }
}
