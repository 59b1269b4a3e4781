//! Storage daemon device layer
//!
//! This crate implements the device abstraction a backup storage daemon
//! writes volumes through: local files, removable media that must be
//! mounted, SCSI and emulated tapes, and remote object stores. Tapes may
//! carry ANSI or IBM standard labels in front of the volume data.

pub mod command;
pub mod config;
pub mod device;
pub mod label;
pub mod mount;

pub use config::Config;
pub use device::{Device, DeviceError, DeviceRegistry};
pub use label::{LabelCodec, LabelType};
