//! Configuration file parsing
//!
//! Parses the TOML configuration describing the daemon settings and the
//! storage devices it drives.

use crate::device::{BlockSizes, DeviceSettings};
use crate::label::LabelType;
use crate::mount::MountConfig;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Daemon configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Daemon-wide settings
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// Device resources
    #[serde(default)]
    pub device: Vec<DeviceResource>,
}

/// Daemon-wide settings
#[derive(Debug, Clone, Deserialize)]
pub struct DaemonConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Accept labels written under the legacy data-stream name
    #[serde(default)]
    pub compatible: bool,

    /// Command run on a volume file before it is recreated; `%f` is the path
    #[serde(default)]
    pub secure_erase_command: Option<String>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            compatible: false,
            secure_erase_command: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_open_wait() -> u64 {
    300
}

/// Device backend type
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    File,
    Tape,
    Vtape,
    ObjectStore,
    Rados,
    Gfapi,
    Elasto,
}

impl DeviceType {
    pub fn as_str(self) -> &'static str {
        match self {
            DeviceType::File => "file",
            DeviceType::Tape => "tape",
            DeviceType::Vtape => "vtape",
            DeviceType::ObjectStore => "object_store",
            DeviceType::Rados => "rados",
            DeviceType::Gfapi => "gfapi",
            DeviceType::Elasto => "elasto",
        }
    }
}

/// One `[[device]]` entry
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceResource {
    pub name: String,

    pub device_type: DeviceType,

    /// Directory, tape node, tape image or device node to mount
    pub archive_device: PathBuf,

    /// Backend-specific option string
    #[serde(default)]
    pub device_options: String,

    /// Label type forced for this device, overriding the caller's choice
    #[serde(default)]
    pub label_type: Option<LabelType>,

    #[serde(default)]
    pub minimum_block_size: u32,

    /// 0 means no limit
    #[serde(default)]
    pub maximum_block_size: u32,

    #[serde(default)]
    pub requires_mount: bool,

    #[serde(default)]
    pub mount_point: Option<PathBuf>,

    /// Template with `%a` archive device, `%m` mount point, `%v` volume
    #[serde(default)]
    pub mount_command: Option<String>,

    #[serde(default)]
    pub unmount_command: Option<String>,

    /// Seconds to wait for removable media
    #[serde(default = "default_max_open_wait")]
    pub max_open_wait: u64,
}

impl DeviceResource {
    /// Settings handed to the device driver
    pub fn settings(&self, daemon: &DaemonConfig) -> DeviceSettings {
        DeviceSettings {
            name: self.name.clone(),
            archive_device: self.archive_device.clone(),
            device_options: self.device_options.clone(),
            block_sizes: BlockSizes {
                minimum: self.minimum_block_size,
                maximum: self.maximum_block_size,
            },
            secure_erase_command: daemon.secure_erase_command.clone(),
        }
    }

    /// Mount settings, present when the device requires mounting
    pub fn mount_config(&self) -> Option<MountConfig> {
        if !self.requires_mount {
            return None;
        }
        Some(MountConfig {
            device_name: self.name.clone(),
            archive_device: self.archive_device.clone(),
            mount_point: self.mount_point.clone()?,
            mount_command: self.mount_command.clone()?,
            unmount_command: self.unmount_command.clone()?,
            max_open_wait: Duration::from_secs(self.max_open_wait),
        })
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse configuration from a string
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Look up a device by name
    pub fn device(&self, name: &str) -> Option<&DeviceResource> {
        self.device.iter().find(|d| d.name == name)
    }

    /// Validate the configuration
    fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for device in &self.device {
            if device.name.is_empty() {
                return Err(ConfigError::Invalid("device with empty name".to_string()));
            }
            if !seen.insert(device.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate device: {}",
                    device.name
                )));
            }

            if device.requires_mount {
                if device.device_type != DeviceType::File {
                    return Err(ConfigError::Invalid(format!(
                        "device {}: requires_mount is only supported for file devices",
                        device.name
                    )));
                }
                for (key, missing) in [
                    ("mount_point", device.mount_point.is_none()),
                    ("mount_command", device.mount_command.is_none()),
                    ("unmount_command", device.unmount_command.is_none()),
                ] {
                    if missing {
                        return Err(ConfigError::Invalid(format!(
                            "device {}: requires_mount needs {}",
                            device.name, key
                        )));
                    }
                }
            }

            if device.maximum_block_size != 0
                && device.minimum_block_size > device.maximum_block_size
            {
                return Err(ConfigError::Invalid(format!(
                    "device {}: minimum_block_size {} exceeds maximum_block_size {}",
                    device.name, device.minimum_block_size, device.maximum_block_size
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_parse_minimal_config() {
        let config_str = r#"
[[device]]
name = "FileStorage"
device_type = "file"
archive_device = "/var/lib/stordev/storage"
"#;

        let config = Config::parse(config_str).unwrap();
        assert_eq!(config.daemon.log_level, "info");
        assert!(!config.daemon.compatible);
        assert_eq!(config.device.len(), 1);
        let device = &config.device[0];
        assert_eq!(device.device_type, DeviceType::File);
        assert_eq!(device.max_open_wait, 300);
        assert_eq!(device.label_type, None);
        assert!(device.mount_config().is_none());
    }

    #[test]
    fn test_parse_full_config() {
        let config_str = r#"
[daemon]
log_level = "debug"
compatible = true
secure_erase_command = "/usr/bin/shred -u %f"

[[device]]
name = "Usb"
device_type = "file"
archive_device = "/dev/sdb1"
label_type = "ansi"
maximum_block_size = 1048576
requires_mount = true
mount_point = "/mnt/usb"
mount_command = "/bin/mount %a %m"
unmount_command = "/bin/umount %m"
max_open_wait = 60

[[device]]
name = "S3"
device_type = "object_store"
archive_device = "S3"
device_options = "profile=/etc/stordev/s3.profile,bucket=backup"
"#;

        let config = Config::parse(config_str).unwrap();
        assert!(config.daemon.compatible);

        let usb = config.device("Usb").unwrap();
        assert_eq!(usb.label_type, Some(LabelType::Ansi));
        let mount = usb.mount_config().unwrap();
        assert_eq!(mount.mount_point, PathBuf::from("/mnt/usb"));
        assert_eq!(mount.max_open_wait, Duration::from_secs(60));

        let settings = usb.settings(&config.daemon);
        assert_eq!(settings.block_sizes.maximum, 1048576);
        assert_eq!(
            settings.secure_erase_command.as_deref(),
            Some("/usr/bin/shred -u %f")
        );

        assert_eq!(
            config.device("S3").unwrap().device_type,
            DeviceType::ObjectStore
        );
        assert!(config.device("Missing").is_none());
    }

    #[test]
    fn test_duplicate_device_error() {
        let config_str = r#"
[[device]]
name = "A"
device_type = "file"
archive_device = "/a"

[[device]]
name = "A"
device_type = "vtape"
archive_device = "/b"
"#;

        let result = Config::parse(config_str);
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_requires_mount_needs_commands() {
        let config_str = r#"
[[device]]
name = "Usb"
device_type = "file"
archive_device = "/dev/sdb1"
requires_mount = true
mount_point = "/mnt/usb"
mount_command = "/bin/mount %a %m"
"#;

        let err = Config::parse(config_str).unwrap_err();
        assert!(err.to_string().contains("unmount_command"));
    }

    #[test]
    fn test_requires_mount_only_for_files() {
        let config_str = r#"
[[device]]
name = "Tape"
device_type = "tape"
archive_device = "/dev/nst0"
requires_mount = true
mount_point = "/mnt"
mount_command = "true"
unmount_command = "true"
"#;

        assert!(matches!(
            Config::parse(config_str),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_block_size_order() {
        let config_str = r#"
[[device]]
name = "Tape"
device_type = "tape"
archive_device = "/dev/nst0"
minimum_block_size = 65536
maximum_block_size = 1024
"#;

        assert!(matches!(
            Config::parse(config_str),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_unknown_device_type() {
        let config_str = r#"
[[device]]
name = "X"
device_type = "floppy"
archive_device = "/dev/fd0"
"#;

        assert!(matches!(Config::parse(config_str), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_label_type_names() {
        for (name, expected) in [
            ("bareos", LabelType::Bareos),
            ("native", LabelType::Bareos),
            ("ibm", LabelType::Ibm),
        ] {
            let config_str = format!(
                "[[device]]\nname = \"T\"\ndevice_type = \"vtape\"\narchive_device = \"/tmp/t.img\"\nlabel_type = \"{}\"\n",
                name
            );
            let config = Config::parse(&config_str).unwrap();
            assert_eq!(config.device[0].label_type, Some(expected));
        }
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[daemon]\nlog_level = \"warn\"\n\n[[device]]\nname = \"T\"\ndevice_type = \"vtape\"\narchive_device = \"/tmp/t.img\""
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.daemon.log_level, "warn");
        assert_eq!(config.device[0].device_type, DeviceType::Vtape);
    }
}
