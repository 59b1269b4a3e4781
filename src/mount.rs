//! Mount and unmount of removable or network-mounted volumes
//!
//! The configured commands are run with a time limit and retried. Tools that
//! exit non-zero because the medium is already in the requested state are
//! recognised by their output.

use crate::command::{expand_template, run_command, CommandOutput};
use crate::device::{DeviceError, DeviceResult};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

/// Attempts made when a timeout is requested
pub const TIMEOUT_ATTEMPTS: u32 = 10;

/// Entry in a mount point that does not count as content
pub const MOUNT_MARKER: &str = ".keep";

const RETRY_INTERVAL: Duration = Duration::from_secs(1);

const MIN_ATTEMPT_LIMIT: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountState {
    Unmounted,
    Mounted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountOp {
    Mount,
    Unmount,
}

impl MountOp {
    fn verb(self) -> &'static str {
        match self {
            MountOp::Mount => "mount",
            MountOp::Unmount => "unmount",
        }
    }
}

/// Mount settings of one device
#[derive(Debug, Clone)]
pub struct MountConfig {
    pub device_name: String,
    pub archive_device: PathBuf,
    pub mount_point: PathBuf,
    pub mount_command: String,
    pub unmount_command: String,
    /// Each command attempt may run for half of this
    pub max_open_wait: Duration,
}

/// Runs the mount/unmount commands of one mount point and tracks its state.
pub struct MountOrchestrator {
    config: MountConfig,
    state: MountState,
    retry_interval: Duration,
}

impl MountOrchestrator {
    pub fn new(config: MountConfig) -> Self {
        Self {
            config,
            state: MountState::Unmounted,
            retry_interval: RETRY_INTERVAL,
        }
    }

    /// Override the pause between attempts
    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    pub fn state(&self) -> MountState {
        self.state
    }

    pub fn config(&self) -> &MountConfig {
        &self.config
    }

    pub fn mount(&mut self, volume: Option<&str>, timeout: bool) -> DeviceResult<()> {
        self.run(MountOp::Mount, volume, timeout)
    }

    pub fn unmount(&mut self, volume: Option<&str>, timeout: bool) -> DeviceResult<()> {
        self.run(MountOp::Unmount, volume, timeout)
    }

    /// Build the command line for `op`.
    pub fn command_line(&self, op: MountOp, volume: Option<&str>) -> String {
        let template = match op {
            MountOp::Mount => &self.config.mount_command,
            MountOp::Unmount => &self.config.unmount_command,
        };
        let archive_device = self.config.archive_device.to_string_lossy();
        let mount_point = self.config.mount_point.to_string_lossy();
        expand_template(
            template,
            &[
                ('a', &archive_device),
                ('m', &mount_point),
                ('v', volume.unwrap_or("")),
            ],
        )
    }

    fn attempt_limit(&self) -> Duration {
        (self.config.max_open_wait / 2).max(MIN_ATTEMPT_LIMIT)
    }

    fn run(&mut self, op: MountOp, volume: Option<&str>, timeout: bool) -> DeviceResult<()> {
        let command = self.command_line(op, volume);
        let attempts = if timeout { TIMEOUT_ATTEMPTS } else { 1 };
        let mut last = None;

        for attempt in 1..=attempts {
            log::debug!(
                "{} {} attempt {}/{}: {}",
                op.verb(),
                self.config.mount_point.display(),
                attempt,
                attempts,
                command
            );

            let out = run_command(&command, Some(self.attempt_limit())).map_err(|e| {
                DeviceError::MountFailure {
                    device: self.config.device_name.clone(),
                    detail: format!("cannot run \"{}\": {}", command, e),
                }
            })?;

            if out.success() || is_benign_failure(op, &out.output) {
                self.state = match op {
                    MountOp::Mount => MountState::Mounted,
                    MountOp::Unmount => MountState::Unmounted,
                };
                log::info!(
                    "device \"{}\": {}ed {}",
                    self.config.device_name,
                    op.verb(),
                    self.config.mount_point.display()
                );
                return Ok(());
            }

            log::debug!("{} failed: {}", op.verb(), out.output.trim_end());
            last = Some(out);

            if attempt < attempts {
                if op == MountOp::Mount {
                    // clear a possibly stale mount before trying again
                    let unmount = self.command_line(MountOp::Unmount, volume);
                    if let Err(e) = run_command(&unmount, Some(self.attempt_limit())) {
                        log::debug!("stale unmount could not run: {}", e);
                    }
                }
                thread::sleep(self.retry_interval);
            }
        }

        if op == MountOp::Mount {
            match mount_point_has_entries(&self.config.mount_point) {
                Ok(true) => {
                    log::warn!(
                        "device \"{}\": mount command failed but {} has content, assuming mounted",
                        self.config.device_name,
                        self.config.mount_point.display()
                    );
                    self.state = MountState::Mounted;
                    return Ok(());
                }
                Ok(false) => {}
                Err(e) => log::debug!(
                    "cannot inspect {}: {}",
                    self.config.mount_point.display(),
                    e
                ),
            }
        }

        Err(DeviceError::MountFailure {
            device: self.config.device_name.clone(),
            detail: failure_detail(op, &command, last.as_ref()),
        })
    }
}

/// Whether a failed command's output shows the medium is already in the
/// requested state.
pub fn is_benign_failure(op: MountOp, output: &str) -> bool {
    let output = output.to_ascii_lowercase();
    match op {
        MountOp::Mount => output.contains("already mounted"),
        MountOp::Unmount => output.contains("not mounted"),
    }
}

/// Whether the mount point holds anything besides `.`, `..` and the marker.
pub fn mount_point_has_entries(path: &Path) -> io::Result<bool> {
    for entry in fs::read_dir(path)? {
        let entry = entry?;
        if entry.file_name() != MOUNT_MARKER {
            return Ok(true);
        }
    }
    Ok(false)
}

fn failure_detail(op: MountOp, command: &str, out: Option<&CommandOutput>) -> String {
    match out {
        Some(out) if out.timed_out => format!("{} command \"{}\" timed out", op.verb(), command),
        Some(out) => format!(
            "{} command \"{}\" failed with status {:?}: {}",
            op.verb(),
            command,
            out.status,
            out.output.trim()
        ),
        None => format!("{} command \"{}\" did not run", op.verb(), command),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::ErrorKind;
    use tempfile::TempDir;

    fn orchestrator(dir: &Path, mount: &str, unmount: &str) -> MountOrchestrator {
        MountOrchestrator::new(MountConfig {
            device_name: "Usb".to_string(),
            archive_device: PathBuf::from("/dev/sdz1"),
            mount_point: dir.to_path_buf(),
            mount_command: mount.to_string(),
            unmount_command: unmount.to_string(),
            max_open_wait: Duration::from_secs(10),
        })
        .with_retry_interval(Duration::from_millis(10))
    }

    #[test]
    fn test_benign_failure_detection() {
        assert!(is_benign_failure(
            MountOp::Mount,
            "mount: /mnt/usb: /dev/sdb1 already mounted on /mnt/usb."
        ));
        assert!(is_benign_failure(MountOp::Unmount, "umount: /mnt/usb: not mounted."));
        assert!(!is_benign_failure(MountOp::Mount, "umount: /mnt/usb: not mounted."));
        assert!(!is_benign_failure(MountOp::Unmount, "device is busy"));
    }

    #[test]
    fn test_command_line_substitution() {
        let dir = TempDir::new().unwrap();
        let orch = orchestrator(dir.path(), "mount %a %m # %v", "umount %m");
        let line = orch.command_line(MountOp::Mount, Some("Vol7"));
        assert_eq!(
            line,
            format!("mount /dev/sdz1 {} # Vol7", dir.path().display())
        );
    }

    #[test]
    fn test_mount_success() {
        let dir = TempDir::new().unwrap();
        let mut orch = orchestrator(dir.path(), "true", "true");
        orch.mount(None, true).unwrap();
        assert_eq!(orch.state(), MountState::Mounted);
        orch.unmount(None, false).unwrap();
        assert_eq!(orch.state(), MountState::Unmounted);
    }

    #[test]
    fn test_already_mounted_is_success() {
        let dir = TempDir::new().unwrap();
        let mut orch = orchestrator(dir.path(), "echo 'already mounted'; exit 1", "true");
        orch.mount(None, false).unwrap();
        assert_eq!(orch.state(), MountState::Mounted);
    }

    #[test]
    fn test_not_mounted_is_success_on_unmount() {
        let dir = TempDir::new().unwrap();
        let mut orch = orchestrator(dir.path(), "true", "echo 'umount: not mounted' >&2; exit 32");
        orch.unmount(None, false).unwrap();
        assert_eq!(orch.state(), MountState::Unmounted);
    }

    #[test]
    fn test_mount_retries_then_fails() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("attempts.log");
        let mount = format!("echo m >> {}; exit 1", log.display());
        let unmount = format!("echo u >> {}; exit 0", log.display());
        // keep the log file out of the mount point check
        let mount_point = TempDir::new().unwrap();
        let mut orch = orchestrator(mount_point.path(), &mount, &unmount);

        let err = orch.mount(None, true).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MountFailure);
        assert_eq!(orch.state(), MountState::Unmounted);

        let attempts = fs::read_to_string(&log).unwrap();
        let mounts = attempts.lines().filter(|l| *l == "m").count();
        let unmounts = attempts.lines().filter(|l| *l == "u").count();
        assert_eq!(mounts, TIMEOUT_ATTEMPTS as usize);
        assert_eq!(unmounts, TIMEOUT_ATTEMPTS as usize - 1);
    }

    #[test]
    fn test_hung_stale_unmount_is_killed() {
        let mount_point = TempDir::new().unwrap();
        let mut orch = MountOrchestrator::new(MountConfig {
            device_name: "Usb".to_string(),
            archive_device: PathBuf::from("/dev/sdz1"),
            mount_point: mount_point.path().to_path_buf(),
            mount_command: "exit 1".to_string(),
            unmount_command: "sleep 30".to_string(),
            max_open_wait: Duration::from_millis(400),
        })
        .with_retry_interval(Duration::from_millis(10));

        let started = std::time::Instant::now();
        let err = orch.mount(None, true).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MountFailure);
        // nine stale unmounts at 200 ms each
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn test_single_attempt_without_timeout() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("attempts.log");
        let mount_point = TempDir::new().unwrap();
        let mount = format!("echo m >> {}; exit 1", log.display());
        let mut orch = orchestrator(mount_point.path(), &mount, "true");

        assert!(orch.mount(None, false).is_err());
        assert_eq!(fs::read_to_string(&log).unwrap().lines().count(), 1);
    }

    #[test]
    fn test_failed_mount_with_content_counts_as_mounted() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("Full-0001"), b"data").unwrap();
        let mut orch = orchestrator(dir.path(), "exit 1", "true");
        orch.mount(None, false).unwrap();
        assert_eq!(orch.state(), MountState::Mounted);
    }

    #[test]
    fn test_marker_file_is_not_content() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(MOUNT_MARKER), b"").unwrap();
        assert!(!mount_point_has_entries(dir.path()).unwrap());

        let mut orch = orchestrator(dir.path(), "echo 'special device missing'; exit 32", "true");
        let err = orch.mount(None, false).unwrap_err();
        assert!(err.to_string().contains("special device missing"));
    }
}
