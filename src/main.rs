//! Storage device tool
//!
//! Commands:
//! - list: Show configured devices
//! - label: Write standard labels for a volume
//! - read-label: Read and verify the labels of a volume
//! - mount / unmount: Run a device's mount commands
//! - truncate: Discard all data on a volume

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use env_logger::Env;
use std::path::PathBuf;

use stordev::config::{Config, DeviceResource};
use stordev::device::{Device, DeviceRegistry, OpenMode, TapeOp};
use stordev::label::{LabelCodec, LabelPurpose, LabelReadOutcome, LabelType};

#[derive(Parser)]
#[command(name = "stordev")]
#[command(about = "Storage daemon device tool", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/stordev/stordev.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LabelArg {
    #[value(alias = "native")]
    Bareos,
    Ansi,
    Ibm,
}

impl From<LabelArg> for LabelType {
    fn from(arg: LabelArg) -> Self {
        match arg {
            LabelArg::Bareos => LabelType::Bareos,
            LabelArg::Ansi => LabelType::Ansi,
            LabelArg::Ibm => LabelType::Ibm,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Show configured devices
    List,

    /// Write standard labels at the start of a volume
    Label {
        /// Device name
        device: String,

        /// Volume name
        volume: String,

        /// Label type (the device's configured type wins)
        #[arg(short = 't', long = "type", value_enum, default_value = "ansi")]
        label_type: LabelArg,
    },

    /// Read and verify the labels of the loaded volume
    ReadLabel {
        /// Device name
        device: String,

        /// Expected volume name (default: any)
        volume: Option<String>,

        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Mount the device's medium
    Mount {
        /// Device name
        device: String,
    },

    /// Unmount the device's medium
    Unmount {
        /// Device name
        device: String,
    },

    /// Discard all data on a volume
    Truncate {
        /// Device name
        device: String,

        /// Volume name
        volume: String,
    },
}

fn main() {
    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        log::error!("{:#}", e);
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let config = Config::load(&cli.config)
        .with_context(|| format!("failed to load config from {}", cli.config.display()))?;

    env_logger::Builder::from_env(Env::default().default_filter_or(config.daemon.log_level.as_str()))
        .init();

    let registry = DeviceRegistry::new();

    match cli.command {
        Commands::List => {
            for device in &config.device {
                println!(
                    "{:<20} {:<13} {}{}",
                    device.name,
                    device.device_type.as_str(),
                    device.archive_device.display(),
                    if registry.supports(device.device_type) {
                        ""
                    } else {
                        " (unavailable)"
                    }
                );
            }
        }

        Commands::Label {
            device,
            volume,
            label_type,
        } => {
            let resource = lookup(&config, &device)?;
            let mut dev = registry
                .open_volume(resource, &config.daemon, &volume, OpenMode::CreateReadWrite)
                .with_context(|| format!("failed to open {} on {}", volume, device))?;
            rewind(dev.as_mut())?;
            codec(&config, resource)
                .write_labels(dev.as_mut(), label_type.into(), LabelPurpose::Volume, &volume)
                .with_context(|| format!("failed to label {}", volume))?;
            dev.close()?;
            println!("Labelled volume {} on {}", volume, device);
        }

        Commands::ReadLabel {
            device,
            volume,
            json,
        } => {
            let resource = lookup(&config, &device)?;
            let requested = volume.unwrap_or_default();
            let outcome = if registry.create(resource, &config.daemon)?.is_tape() {
                // a tape ignores the volume name on open
                let mut dev = registry
                    .open_volume(resource, &config.daemon, &requested, OpenMode::ReadOnly)
                    .with_context(|| format!("failed to open {}", device))?;
                rewind(dev.as_mut())?;
                let outcome = codec(&config, resource).read_label(dev.as_mut(), &requested)?;
                dev.close()?;
                outcome
            } else {
                LabelReadOutcome::NotTape
            };

            if json {
                println!("{}", serde_json::to_string_pretty(&outcome)?);
            } else {
                match outcome {
                    LabelReadOutcome::NotTape => println!("{}: not a tape", device),
                    LabelReadOutcome::NoLabel => println!("{}: no standard label", device),
                    LabelReadOutcome::Verified(label) => println!(
                        "{}: {:?} label, volume {}",
                        device, label.label_type, label.volume_name
                    ),
                }
            }
        }

        Commands::Mount { device } => {
            let resource = lookup(&config, &device)?;
            let mut dev = registry.create(resource, &config.daemon)?;
            if !dev.requires_mount() {
                anyhow::bail!("device {} does not require mounting", device);
            }
            dev.mount(true)?;
            println!("Mounted {}", device);
        }

        Commands::Unmount { device } => {
            let resource = lookup(&config, &device)?;
            let mut dev = registry.create(resource, &config.daemon)?;
            if !dev.requires_mount() {
                anyhow::bail!("device {} does not require mounting", device);
            }
            dev.unmount(true)?;
            println!("Unmounted {}", device);
        }

        Commands::Truncate { device, volume } => {
            let resource = lookup(&config, &device)?;
            let mut dev = registry
                .open_volume(resource, &config.daemon, &volume, OpenMode::ReadWrite)
                .with_context(|| format!("failed to open {} on {}", volume, device))?;
            dev.truncate()
                .with_context(|| format!("failed to truncate {}", volume))?;
            dev.close()?;
            println!("Truncated volume {} on {}", volume, device);
        }
    }

    Ok(())
}

fn lookup<'a>(config: &'a Config, name: &str) -> Result<&'a DeviceResource> {
    config
        .device(name)
        .ok_or_else(|| anyhow::anyhow!("Device not found: {}", name))
}

fn codec(config: &Config, resource: &DeviceResource) -> LabelCodec {
    LabelCodec::new(config.daemon.compatible).with_forced_type(resource.label_type)
}

/// Labels live at the start of the medium.
fn rewind(dev: &mut dyn Device) -> Result<()> {
    if dev.is_tape() {
        dev.ioctl(TapeOp::Rewind)?;
    }
    Ok(())
}
