//! Device registry
//!
//! Turns a configured device resource into a driver. The native client
//! connectors for remote backends are registered here once at startup;
//! a device whose backend has no connector cannot be created.

use super::elasto::{ElastoConnector, ElastoDevice};
use super::file::LocalFileDevice;
use super::gfapi::{GfapiDevice, GlusterConnector};
use super::mounted::MountedFileDevice;
use super::object_store::{ObjectStoreConnector, ObjectStoreDevice};
use super::posix::PosixConnector;
use super::rados::{RadosConnector, RadosDevice};
use super::s3::S3Connector;
#[cfg(target_os = "linux")]
use super::tape::TapeDevice;
use super::vtape::VirtualTapeDevice;
use super::{Device, DeviceError, DeviceResult, OpenMode};
use crate::config::{DaemonConfig, DeviceResource, DeviceType};
use std::collections::HashMap;
use std::sync::Arc;

/// Connectors for the native client libraries
#[derive(Clone)]
pub struct DeviceRegistry {
    object_stores: HashMap<String, Arc<dyn ObjectStoreConnector>>,
    rados: Option<Arc<dyn RadosConnector>>,
    gluster: Option<Arc<dyn GlusterConnector>>,
    elasto: Option<Arc<dyn ElastoConnector>>,
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceRegistry {
    /// Registry with the built-in `posix` and `s3` object-store backends
    pub fn new() -> Self {
        let mut registry = Self {
            object_stores: HashMap::new(),
            rados: None,
            gluster: None,
            elasto: None,
        };
        registry.register_object_store("posix", Arc::new(PosixConnector));
        registry.register_object_store("s3", Arc::new(S3Connector));
        registry
    }

    /// Register a connector for object-store profiles with `backend = <backend>`
    pub fn register_object_store(&mut self, backend: &str, connector: Arc<dyn ObjectStoreConnector>) {
        log::debug!("registered object store backend {}", backend);
        self.object_stores.insert(backend.to_string(), connector);
    }

    pub fn register_rados(&mut self, connector: Arc<dyn RadosConnector>) {
        self.rados = Some(connector);
    }

    pub fn register_gluster(&mut self, connector: Arc<dyn GlusterConnector>) {
        self.gluster = Some(connector);
    }

    pub fn register_elasto(&mut self, connector: Arc<dyn ElastoConnector>) {
        self.elasto = Some(connector);
    }

    /// Whether a device of this type can be created
    pub fn supports(&self, device_type: DeviceType) -> bool {
        match device_type {
            DeviceType::File | DeviceType::Vtape | DeviceType::ObjectStore => true,
            DeviceType::Tape => cfg!(target_os = "linux"),
            DeviceType::Rados => self.rados.is_some(),
            DeviceType::Gfapi => self.gluster.is_some(),
            DeviceType::Elasto => self.elasto.is_some(),
        }
    }

    /// Build the driver for a configured device.
    pub fn create(
        &self,
        resource: &DeviceResource,
        daemon: &DaemonConfig,
    ) -> DeviceResult<Box<dyn Device>> {
        let settings = resource.settings(daemon);
        let missing = |library: &str| {
            DeviceError::unsupported(
                &resource.name,
                &format!(
                    "{} device (no {} client registered)",
                    resource.device_type.as_str(),
                    library
                ),
            )
        };

        let device: Box<dyn Device> = match resource.device_type {
            DeviceType::File => match resource.mount_config() {
                Some(mount) => Box::new(MountedFileDevice::new(settings, mount)),
                None if resource.requires_mount => {
                    return Err(DeviceError::InvalidConfiguration {
                        device: resource.name.clone(),
                        token: "requires_mount".to_string(),
                        reason: "mount point and commands are required".to_string(),
                    })
                }
                None => Box::new(LocalFileDevice::new(settings)),
            },
            #[cfg(target_os = "linux")]
            DeviceType::Tape => Box::new(TapeDevice::new(settings)),
            #[cfg(not(target_os = "linux"))]
            DeviceType::Tape => return Err(missing("st driver")),
            DeviceType::Vtape => Box::new(VirtualTapeDevice::new(settings)),
            DeviceType::ObjectStore => Box::new(ObjectStoreDevice::new(
                settings,
                self.object_stores.clone(),
            )),
            DeviceType::Rados => match &self.rados {
                Some(connector) => Box::new(RadosDevice::new(settings, Arc::clone(connector))),
                None => return Err(missing("librados")),
            },
            DeviceType::Gfapi => match &self.gluster {
                Some(connector) => Box::new(GfapiDevice::new(settings, Arc::clone(connector))),
                None => return Err(missing("gfapi")),
            },
            DeviceType::Elasto => match &self.elasto {
                Some(connector) => Box::new(ElastoDevice::new(settings, Arc::clone(connector))),
                None => return Err(missing("elasto")),
            },
        };

        log::debug!(
            "created {} device {}",
            resource.device_type.as_str(),
            resource.name
        );
        Ok(device)
    }

    /// Create the driver and open a volume on it, mounting first if needed.
    pub fn open_volume(
        &self,
        resource: &DeviceResource,
        daemon: &DaemonConfig,
        volume: &str,
        mode: OpenMode,
    ) -> DeviceResult<Box<dyn Device>> {
        let mut device = self.create(resource, daemon)?;
        if device.requires_mount() {
            device.mount(true)?;
        }
        device.open(volume, mode, 0o640)?;
        Ok(device)
    }
}
