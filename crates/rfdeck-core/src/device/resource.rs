use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use rfdeck_ipc::{Device, DeviceStatus, HardwareStatus, Lease};
use tokio::sync::broadcast;
use tracing::{info, warn};

use super::DeviceRegistry;
use crate::error::{CoreError, Result};

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub enum ResourceEvent {
    Acquired(Lease),
    Released(Lease),
    ForceReleased(Lease),
}

impl ResourceEvent {
    pub fn lease(&self) -> &Lease {
        match self {
            ResourceEvent::Acquired(lease)
            | ResourceEvent::Released(lease)
            | ResourceEvent::ForceReleased(lease) => lease,
        }
    }
}

/// Exclusive leases over the registry's devices.
///
/// Each device has its own slot so a status read never waits on an
/// unrelated device, and every operation on one device is linearizable.
pub struct ResourceManager {
    registry: DeviceRegistry,
    slots: HashMap<Device, Mutex<Option<Lease>>>,
    events: broadcast::Sender<ResourceEvent>,
}

impl ResourceManager {
    pub fn new(registry: DeviceRegistry) -> Self {
        let slots = registry.iter().map(|d| (d, Mutex::new(None))).collect();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            registry,
            slots,
            events,
        }
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ResourceEvent> {
        self.events.subscribe()
    }

    /// Grants `device` to `owner`. Re-acquiring an already held lease is
    /// idempotent and refreshes its timestamp.
    pub fn acquire(&self, device: Device, owner: &str) -> Result<Lease> {
        if owner.trim().is_empty() {
            return Err(CoreError::InvalidConfig("owner must not be empty".to_string()));
        }
        let mut slot = self.slot(device)?;
        if let Some(lease) = slot.as_mut() {
            if lease.owner == owner {
                lease.acquired_at = Utc::now();
                return Ok(lease.clone());
            }
            info!(
                target: "rfdeck::resource",
                device = %device,
                holder = %lease.owner,
                requested_by = %owner,
                "acquire_denied"
            );
            return Err(CoreError::DeviceBusy {
                device,
                owner: lease.owner.clone(),
            });
        }

        let lease = Lease {
            device,
            owner: owner.to_string(),
            acquired_at: Utc::now(),
            process_id: None,
        };
        *slot = Some(lease.clone());
        drop(slot);
        info!(target: "rfdeck::resource", device = %device, owner = %owner, "acquired");
        let _ = self.events.send(ResourceEvent::Acquired(lease.clone()));
        Ok(lease)
    }

    /// Returns `Ok(true)` when a lease was dropped and `Ok(false)` when the
    /// device was already free.
    pub fn release(&self, device: Device, owner: &str) -> Result<bool> {
        let mut slot = self.slot(device)?;
        let holder = match slot.as_ref() {
            None => return Ok(false),
            Some(lease) => lease.owner.clone(),
        };
        if holder != owner {
            warn!(
                target: "rfdeck::resource",
                device = %device,
                holder = %holder,
                requested_by = %owner,
                "release_denied"
            );
            return Err(CoreError::NotOwner {
                device,
                owner: Some(holder),
                requested_by: owner.to_string(),
            });
        }

        let lease = slot.take();
        drop(slot);
        if let Some(lease) = lease {
            info!(target: "rfdeck::resource", device = %device, owner = %owner, "released");
            let _ = self.events.send(ResourceEvent::Released(lease));
        }
        Ok(true)
    }

    /// Drops any lease on `device` regardless of owner.
    pub fn force_release(&self, device: Device) -> Result<Option<Lease>> {
        let previous = self.slot(device)?.take();
        if let Some(lease) = &previous {
            warn!(
                target: "rfdeck::resource",
                device = %device,
                owner = %lease.owner,
                "force_released"
            );
            let _ = self.events.send(ResourceEvent::ForceReleased(lease.clone()));
        }
        Ok(previous)
    }

    /// Records the pid backing `owner`'s lease on `device`.
    pub fn attach_process(&self, device: Device, owner: &str, pid: u32) -> Result<()> {
        let mut slot = self.slot(device)?;
        match slot.as_mut() {
            Some(lease) if lease.owner == owner => {
                lease.process_id = Some(pid);
                Ok(())
            }
            other => Err(CoreError::NotOwner {
                device,
                owner: other.map(|lease| lease.owner.clone()),
                requested_by: owner.to_string(),
            }),
        }
    }

    pub fn lease(&self, device: Device) -> Option<Lease> {
        self.slot(device).ok().and_then(|slot| slot.clone())
    }

    pub fn owner(&self, device: Device) -> Option<String> {
        self.lease(device).map(|lease| lease.owner)
    }

    pub fn is_available(&self, device: Device) -> bool {
        self.slot(device).map(|slot| slot.is_none()).unwrap_or(false)
    }

    pub fn device_status(&self, device: Device) -> Result<DeviceStatus> {
        let slot = self.slot(device)?;
        Ok(DeviceStatus::from_lease(device, slot.as_ref()))
    }

    pub fn status(&self) -> HardwareStatus {
        self.registry
            .iter()
            .map(|device| {
                let status = self
                    .device_status(device)
                    .unwrap_or_else(|_| DeviceStatus::free(device));
                (device, status)
            })
            .collect()
    }

    fn slot(&self, device: Device) -> Result<MutexGuard<'_, Option<Lease>>> {
        let slot = self
            .slots
            .get(&device)
            .ok_or_else(|| CoreError::UnknownDevice(device.to_string()))?;
        Ok(slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner()))
    }
}

impl Default for ResourceManager {
    fn default() -> Self {
        Self::new(DeviceRegistry::default())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn acquire_then_busy_for_other_owner() {
        let rm = ResourceManager::default();
        let lease = rm.acquire(Device::Hackrf, "hackrf-sweep").unwrap();
        assert_eq!(lease.owner, "hackrf-sweep");
        assert!(!rm.is_available(Device::Hackrf));

        match rm.acquire(Device::Hackrf, "kismet") {
            Err(CoreError::DeviceBusy { owner, .. }) => assert_eq!(owner, "hackrf-sweep"),
            other => panic!("expected DeviceBusy, got {:?}", other),
        }
        assert_eq!(rm.owner(Device::Hackrf).as_deref(), Some("hackrf-sweep"));
    }

    #[test]
    fn reacquire_by_owner_is_idempotent() {
        let rm = ResourceManager::default();
        let first = rm.acquire(Device::Alfa, "kismet").unwrap();
        let second = rm.acquire(Device::Alfa, "kismet").unwrap();
        assert_eq!(second.owner, first.owner);
        assert!(second.acquired_at >= first.acquired_at);
    }

    #[test]
    fn release_semantics() {
        let rm = ResourceManager::default();
        assert!(!rm.release(Device::Hackrf, "anyone").unwrap());

        rm.acquire(Device::Hackrf, "A").unwrap();
        match rm.release(Device::Hackrf, "B") {
            Err(CoreError::NotOwner {
                owner,
                requested_by,
                ..
            }) => {
                assert_eq!(owner.as_deref(), Some("A"));
                assert_eq!(requested_by, "B");
            }
            other => panic!("expected NotOwner, got {:?}", other),
        }
        assert_eq!(rm.owner(Device::Hackrf).as_deref(), Some("A"));
        assert!(rm.release(Device::Hackrf, "A").unwrap());
        assert!(rm.is_available(Device::Hackrf));
    }

    #[test]
    fn force_release_always_frees() {
        let rm = ResourceManager::default();
        assert!(rm.force_release(Device::Bluetooth).unwrap().is_none());
        rm.acquire(Device::Bluetooth, "btle-scan").unwrap();
        let dropped = rm.force_release(Device::Bluetooth).unwrap().unwrap();
        assert_eq!(dropped.owner, "btle-scan");
        assert!(rm.is_available(Device::Bluetooth));
    }

    #[test]
    fn unregistered_device_is_unknown() {
        let rm = ResourceManager::new(DeviceRegistry::new([Device::Hackrf]));
        assert!(matches!(
            rm.acquire(Device::Alfa, "x"),
            Err(CoreError::UnknownDevice(_))
        ));
        assert!(matches!(
            rm.force_release(Device::Alfa),
            Err(CoreError::UnknownDevice(_))
        ));
        assert_eq!(rm.status().len(), 1);
    }

    #[test]
    fn empty_owner_is_rejected() {
        let rm = ResourceManager::default();
        assert!(matches!(
            rm.acquire(Device::Hackrf, "  "),
            Err(CoreError::InvalidConfig(_))
        ));
    }

    #[test]
    fn status_reports_owner_and_pid() {
        let rm = ResourceManager::default();
        rm.acquire(Device::Hackrf, "hackrf-sweep").unwrap();
        rm.attach_process(Device::Hackrf, "hackrf-sweep", 4242)
            .unwrap();
        assert!(rm.attach_process(Device::Hackrf, "other", 1).is_err());

        let status = rm.status();
        let hackrf = &status[&Device::Hackrf];
        assert_eq!(hackrf.owner.as_deref(), Some("hackrf-sweep"));
        assert!(!hackrf.available);
        assert_eq!(hackrf.process_id, Some(4242));
        assert!(status[&Device::Alfa].available);
    }

    #[tokio::test]
    async fn events_follow_lease_changes() {
        let rm = ResourceManager::default();
        let mut rx = rm.subscribe();
        rm.acquire(Device::Hackrf, "A").unwrap();
        rm.acquire(Device::Hackrf, "A").unwrap();
        rm.force_release(Device::Hackrf).unwrap();

        assert!(matches!(rx.recv().await.unwrap(), ResourceEvent::Acquired(_)));
        match rx.recv().await.unwrap() {
            ResourceEvent::ForceReleased(lease) => assert_eq!(lease.owner, "A"),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn concurrent_acquire_has_single_winner() {
        let rm = Arc::new(ResourceManager::default());
        let handles: Vec<_> = (0..16)
            .map(|i| {
                let rm = Arc::clone(&rm);
                std::thread::spawn(move || rm.acquire(Device::Hackrf, &format!("owner-{i}")).is_ok())
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }
}
