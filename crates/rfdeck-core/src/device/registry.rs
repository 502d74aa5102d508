use std::collections::BTreeSet;

use rfdeck_ipc::Device;

use crate::error::{CoreError, Result};

/// The closed set of devices a resource manager arbitrates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRegistry {
    devices: BTreeSet<Device>,
}

impl DeviceRegistry {
    pub fn new(devices: impl IntoIterator<Item = Device>) -> Self {
        Self {
            devices: devices.into_iter().collect(),
        }
    }

    pub fn contains(&self, device: Device) -> bool {
        self.devices.contains(&device)
    }

    pub fn iter(&self) -> impl Iterator<Item = Device> + '_ {
        self.devices.iter().copied()
    }

    /// Parses a device name and checks it belongs to this registry.
    pub fn resolve(&self, name: &str) -> Result<Device> {
        let device: Device = name.parse()?;
        self.check(device)?;
        Ok(device)
    }

    pub fn check(&self, device: Device) -> Result<()> {
        if self.contains(device) {
            Ok(())
        } else {
            Err(CoreError::UnknownDevice(device.to_string()))
        }
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new(Device::ALL)
    }
}
