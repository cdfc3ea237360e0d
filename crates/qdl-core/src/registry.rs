//! Device registry: enumeration, serial resolution, and exclusive leases.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, info, instrument};

use crate::transport::{Channel, NusbBackend, TransportError};

/// Backend-specific locator for a device found by a scan.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceHandle(String);

impl DeviceHandle {
    pub fn new(locator: impl Into<String>) -> Self {
        Self(locator.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A device seen by the last scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub serial: String,
    pub product: String,
    pub handle: DeviceHandle,
}

/// Source of devices and channels for one physical transport.
pub trait DeviceBackend: Send + Sync {
    /// Point-in-time scan. Must not leave any channel open.
    fn scan(&self) -> Result<Vec<Device>, TransportError>;

    /// Open a channel to a device returned by `scan`.
    fn open(&self, device: &Device) -> Result<Box<dyn Channel>, TransportError>;
}

/// Enumerates devices and hands out exclusively owned channels.
#[derive(Clone)]
pub struct DeviceRegistry {
    backend: Arc<dyn DeviceBackend>,
    leased: Arc<Mutex<HashSet<DeviceHandle>>>,
}

impl fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceRegistry")
            .field("leased", &self.leased)
            .finish_non_exhaustive()
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::usb()
    }
}

impl DeviceRegistry {
    pub fn new(backend: Arc<dyn DeviceBackend>) -> Self {
        Self {
            backend,
            leased: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Registry over USB devices in EDL mode.
    pub fn usb() -> Self {
        Self::new(Arc::new(NusbBackend))
    }

    /// Scan and return at most `capacity` devices, in scan order.
    #[instrument(level = "debug", skip(self))]
    pub fn list_devices(&self, capacity: usize) -> Result<Vec<Device>, TransportError> {
        let mut devices = self.backend.scan()?;
        devices.truncate(capacity);
        Ok(devices)
    }

    /// Find a device by serial. `None` or an empty serial picks the first one found.
    #[instrument(level = "debug", skip(self))]
    pub fn resolve(&self, serial: Option<&str>) -> Result<Device, TransportError> {
        let wanted = serial.map(str::trim).filter(|s| !s.is_empty());
        let devices = self.backend.scan()?;
        let found = match wanted {
            Some(s) => devices.into_iter().find(|d| d.serial == s),
            None => devices.into_iter().next(),
        };
        found.ok_or_else(|| TransportError::DeviceNotFound(wanted.unwrap_or("<any>").to_string()))
    }

    /// Open `device` for exclusive use until the returned channel is dropped.
    #[instrument(level = "info", skip(self, device), fields(serial = %device.serial))]
    pub fn open(&self, device: &Device) -> Result<LeasedChannel, TransportError> {
        {
            let mut leased = self.leased.lock().unwrap_or_else(|e| e.into_inner());
            if !leased.insert(device.handle.clone()) {
                return Err(TransportError::Busy(device.serial.clone()));
            }
        }

        match self.backend.open(device) {
            Ok(inner) => {
                info!(handle = %device.handle, "Channel leased");
                Ok(LeasedChannel {
                    inner,
                    handle: device.handle.clone(),
                    leased: self.leased.clone(),
                })
            }
            Err(e) => {
                self.release(&device.handle);
                Err(e)
            }
        }
    }

    /// Whether a session currently holds `device`.
    pub fn is_leased(&self, device: &Device) -> bool {
        self.leased
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&device.handle)
    }

    fn release(&self, handle: &DeviceHandle) {
        self.leased
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(handle);
    }
}

/// Channel bound to a registry lease; closing or dropping releases the device.
pub struct LeasedChannel {
    inner: Box<dyn Channel>,
    handle: DeviceHandle,
    leased: Arc<Mutex<HashSet<DeviceHandle>>>,
}

impl Channel for LeasedChannel {
    fn read(&mut self, max_len: usize, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        self.inner.read(max_len, timeout)
    }

    fn write(&mut self, data: &[u8], timeout: Duration) -> Result<usize, TransportError> {
        self.inner.write(data, timeout)
    }

    fn flush(&mut self) -> Result<(), TransportError> {
        self.inner.flush()
    }

    fn close(&mut self) -> Result<(), TransportError> {
        self.inner.close()
    }
}

impl Drop for LeasedChannel {
    fn drop(&mut self) {
        if let Err(e) = self.inner.close() {
            debug!(error = %e, "Close on drop failed");
        }
        self.leased
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.handle);
        debug!(handle = %self.handle, "Channel lease released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockBackend;

    fn registry_with(serials: &[&str]) -> (Arc<MockBackend>, DeviceRegistry) {
        let backend = Arc::new(MockBackend::new());
        for s in serials {
            backend.add_device(s, "QUSB__BULK");
        }
        let registry = DeviceRegistry::new(backend.clone());
        (backend, registry)
    }

    #[test]
    fn test_list_truncates_at_capacity() {
        let (backend, registry) = registry_with(&["a", "b", "c"]);
        assert_eq!(registry.list_devices(2).unwrap().len(), 2);
        assert_eq!(registry.list_devices(16).unwrap().len(), 3);
        assert!(registry.list_devices(0).unwrap().is_empty());
        // Listing never opens a channel.
        assert_eq!(backend.open_count(), 0);
    }

    #[test]
    fn test_resolve_by_serial_and_default() {
        let (_, registry) = registry_with(&["first", "second"]);
        assert_eq!(registry.resolve(Some("second")).unwrap().serial, "second");
        assert_eq!(registry.resolve(None).unwrap().serial, "first");
        assert_eq!(registry.resolve(Some("")).unwrap().serial, "first");
        assert!(matches!(
            registry.resolve(Some("does-not-exist")),
            Err(TransportError::DeviceNotFound(_))
        ));
    }

    #[test]
    fn test_resolve_with_no_devices() {
        let (_, registry) = registry_with(&[]);
        assert!(matches!(
            registry.resolve(None),
            Err(TransportError::DeviceNotFound(_))
        ));
    }

    #[test]
    fn test_open_is_exclusive_until_drop() {
        let (_, registry) = registry_with(&["a"]);
        let device = registry.resolve(Some("a")).unwrap();

        let lease = registry.open(&device).unwrap();
        assert!(registry.is_leased(&device));
        assert!(matches!(
            registry.open(&device),
            Err(TransportError::Busy(_))
        ));

        drop(lease);
        assert!(!registry.is_leased(&device));
        assert!(registry.open(&device).is_ok());
    }

    #[test]
    fn test_failed_open_releases_lease() {
        let (backend, registry) = registry_with(&["gone"]);
        let device = registry.resolve(Some("gone")).unwrap();
        backend.remove_device("gone");

        assert!(matches!(
            registry.open(&device),
            Err(TransportError::DeviceNotFound(_))
        ));
        assert!(!registry.is_leased(&device));
    }

    #[test]
    fn test_list_from_other_thread_during_lease() {
        let (_, registry) = registry_with(&["a", "b"]);
        let device = registry.resolve(Some("a")).unwrap();
        let _lease = registry.open(&device).unwrap();

        let other = registry.clone();
        let listed = std::thread::spawn(move || other.list_devices(8).unwrap().len())
            .join()
            .unwrap();
        assert_eq!(listed, 2);
    }
}
