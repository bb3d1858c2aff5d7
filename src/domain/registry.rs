//! Device Registry
//!
//! In-memory table of every accessory the application currently knows about.
//! The driver writes status and timestamps, the session manager writes
//! locations. Everyone else only reads.

use crate::domain::errors::DriverError;
use crate::domain::models::{Device, DeviceId, DeviceStatus, Direction, ElevationEstimate, Location};
use std::collections::BTreeMap;

#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: BTreeMap<DeviceId, Device>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a device. Returns true when the identity was new.
    pub fn upsert(&mut self, device: Device) -> bool {
        self.devices.insert(device.id, device).is_none()
    }

    pub fn remove(&mut self, id: DeviceId) -> Option<Device> {
        self.devices.remove(&id)
    }

    pub fn get(&self, id: DeviceId) -> Option<&Device> {
        self.devices.get(&id)
    }

    pub fn contains(&self, id: DeviceId) -> bool {
        self.devices.contains_key(&id)
    }

    /// Live view over all devices, ordered by identity.
    pub fn all(&self) -> impl Iterator<Item = &Device> + '_ {
        self.devices.values()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn ids_with_status(&self, status: DeviceStatus) -> Vec<DeviceId> {
        self.devices
            .values()
            .filter(|device| device.status == status)
            .map(|device| device.id)
            .collect()
    }

    pub fn status(&self, id: DeviceId) -> Option<DeviceStatus> {
        self.devices.get(&id).map(|device| device.status)
    }

    pub fn set_status(&mut self, id: DeviceId, status: DeviceStatus) -> Result<(), DriverError> {
        let device = self.get_mut(id)?;
        device.status = status;
        Ok(())
    }

    /// Refresh the last-seen timestamp.
    pub fn touch(&mut self, id: DeviceId, now_ms: u64) -> Result<(), DriverError> {
        let device = self.get_mut(id)?;
        device.last_seen_ms = now_ms;
        Ok(())
    }

    /// Record a fresh measurement.
    pub fn set_location(
        &mut self,
        id: DeviceId,
        distance: f32,
        direction: Option<Direction>,
        elevation: ElevationEstimate,
        now_ms: u64,
    ) -> Result<(), DriverError> {
        let device = self.get_mut(id)?;
        device.location = Some(Location {
            distance: distance.max(0.0),
            direction,
            elevation,
            stale: false,
            updated_ms: now_ms,
        });
        Ok(())
    }

    /// Flag the current reading as stale. No-op when there is no reading.
    pub fn mark_stale(&mut self, id: DeviceId) -> Result<(), DriverError> {
        let device = self.get_mut(id)?;
        if let Some(location) = device.location.as_mut() {
            location.stale = true;
        }
        Ok(())
    }

    fn get_mut(&mut self, id: DeviceId) -> Result<&mut Device, DriverError> {
        self.devices
            .get_mut(&id)
            .ok_or(DriverError::NoSuchDevice(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upsert_never_duplicates() {
        let mut registry = DeviceRegistry::new();
        assert!(registry.upsert(Device::new(DeviceId(1), "a", 0)));
        assert!(!registry.upsert(Device::new(DeviceId(1), "a", 50)));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(DeviceId(1)).map(|d| d.last_seen_ms), Some(50));
    }

    #[test]
    fn test_unknown_device_is_domain_error() {
        let mut registry = DeviceRegistry::new();
        assert_eq!(
            registry.set_status(DeviceId(9), DeviceStatus::Connected),
            Err(DriverError::NoSuchDevice(DeviceId(9)))
        );
        assert!(registry.remove(DeviceId(9)).is_none());
    }

    #[test]
    fn test_set_location_clears_stale_and_clamps() {
        let mut registry = DeviceRegistry::new();
        registry.upsert(Device::new(DeviceId(1), "a", 0));
        registry
            .set_location(DeviceId(1), -0.2, None, ElevationEstimate::Same, 40)
            .unwrap();
        registry.mark_stale(DeviceId(1)).unwrap();
        assert!(registry.get(DeviceId(1)).unwrap().location.as_ref().unwrap().stale);

        registry
            .set_location(DeviceId(1), 2.0, Some([0.0, 0.0, 1.0]), ElevationEstimate::Above, 90)
            .unwrap();
        let location = registry.get(DeviceId(1)).unwrap().location.clone().unwrap();
        assert!(!location.stale);
        assert_eq!(location.distance, 2.0);
        assert_eq!(location.updated_ms, 90);
    }

    #[test]
    fn test_all_reflects_live_state() {
        let mut registry = DeviceRegistry::new();
        registry.upsert(Device::new(DeviceId(2), "b", 0));
        registry.upsert(Device::new(DeviceId(1), "a", 0));
        let ids: Vec<_> = registry.all().map(|d| d.id).collect();
        assert_eq!(ids, vec![DeviceId(1), DeviceId(2)]);

        registry.remove(DeviceId(1));
        assert_eq!(registry.all().count(), 1);
        assert_eq!(registry.ids_with_status(DeviceStatus::Discovered), vec![DeviceId(2)]);
    }
}
