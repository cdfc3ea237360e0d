//! Mock transport for testing.
//!
//! `MockChannel` plays back queued device responses and records every host
//! write. Clones share state, so a test can keep a handle while the session
//! owns the boxed channel.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::traits::{Channel, TransportError};
use crate::registry::{Device, DeviceBackend, DeviceHandle};

#[derive(Debug, Default)]
struct MockState {
    /// Queued responses to return on read.
    responses: VecDeque<Vec<u8>>,
    /// Captured writes.
    writes: Vec<Vec<u8>>,
    /// Number of read/write calls attempted.
    io_calls: usize,
    /// Fail writes once this many bytes have been accepted.
    write_budget: Option<usize>,
    disconnected: bool,
    closed: bool,
}

/// Mock channel for unit testing protocol logic.
#[derive(Debug, Clone, Default)]
pub struct MockChannel {
    state: Arc<Mutex<MockState>>,
}

impl MockChannel {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        // A panicking test thread must not hide the recorded traffic.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue a response to be returned on a later read.
    pub fn queue(&self, bytes: impl Into<Vec<u8>>) {
        self.state().responses.push_back(bytes.into());
    }

    /// Queue an XML response document.
    pub fn queue_str(&self, xml: &str) {
        self.queue(xml.as_bytes().to_vec());
    }

    /// All captured writes, in order.
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.state().writes.clone()
    }

    /// Captured writes that decode as UTF-8 XML documents.
    pub fn written_xml(&self) -> Vec<String> {
        self.writes()
            .into_iter()
            .filter(|w| w.starts_with(b"<?xml"))
            .map(|w| String::from_utf8_lossy(&w).into_owned())
            .collect()
    }

    /// Clear captured writes.
    pub fn clear_writes(&self) {
        self.state().writes.clear();
    }

    /// Responses not consumed yet.
    pub fn pending_responses(&self) -> usize {
        self.state().responses.len()
    }

    /// Read and write calls made against this channel.
    pub fn io_calls(&self) -> usize {
        self.state().io_calls
    }

    /// Accept at most `bytes` more bytes, then report a disconnect.
    pub fn disconnect_after(&self, bytes: usize) {
        self.state().write_budget = Some(bytes);
    }

    /// Simulate device disconnect.
    pub fn disconnect(&self) {
        self.state().disconnected = true;
    }

    /// Simulate device reconnect.
    pub fn reconnect(&self) {
        let mut state = self.state();
        state.disconnected = false;
        state.closed = false;
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }
}

impl Channel for MockChannel {
    fn read(&mut self, max_len: usize, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let mut state = self.state();
        state.io_calls += 1;
        if state.disconnected || state.closed {
            return Err(TransportError::Disconnected);
        }
        let mut next = state
            .responses
            .pop_front()
            .ok_or_else(|| TransportError::timeout(timeout))?;
        if next.len() > max_len {
            let rest = next.split_off(max_len);
            state.responses.push_front(rest);
        }
        Ok(next)
    }

    fn write(&mut self, data: &[u8], _timeout: Duration) -> Result<usize, TransportError> {
        let mut state = self.state();
        state.io_calls += 1;
        if state.disconnected || state.closed {
            return Err(TransportError::Disconnected);
        }
        if let Some(budget) = state.write_budget {
            if data.len() > budget {
                state.disconnected = true;
                return Err(TransportError::Disconnected);
            }
            state.write_budget = Some(budget - data.len());
        }
        state.writes.push(data.to_vec());
        Ok(data.len())
    }

    fn close(&mut self) -> Result<(), TransportError> {
        self.state().closed = true;
        Ok(())
    }
}

/// In-memory device backend handing out `MockChannel`s.
#[derive(Debug, Default)]
pub struct MockBackend {
    devices: Mutex<Vec<(Device, MockChannel)>>,
    opens: AtomicUsize,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a device and return the channel a session will talk to.
    pub fn add_device(&self, serial: &str, product: &str) -> MockChannel {
        let channel = MockChannel::new();
        let device = Device {
            serial: serial.to_string(),
            product: product.to_string(),
            handle: DeviceHandle::new(format!("mock:{serial}")),
        };
        self.devices
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((device, channel.clone()));
        channel
    }

    /// Detach every device with this serial.
    pub fn remove_device(&self, serial: &str) {
        self.devices
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|(d, _)| d.serial != serial);
    }

    /// Number of successful `open` calls.
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

impl DeviceBackend for MockBackend {
    fn scan(&self) -> Result<Vec<Device>, TransportError> {
        Ok(self
            .devices
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(d, _)| d.clone())
            .collect())
    }

    fn open(&self, device: &Device) -> Result<Box<dyn Channel>, TransportError> {
        let devices = self.devices.lock().unwrap_or_else(|e| e.into_inner());
        let (_, channel) = devices
            .iter()
            .find(|(d, _)| d.handle == device.handle)
            .ok_or_else(|| TransportError::DeviceNotFound(device.serial.clone()))?;
        let mut channel = channel.clone();
        channel.reconnect();
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(channel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T: Duration = Duration::from_millis(10);

    #[test]
    fn test_mock_response_queue() {
        let mut mock = MockChannel::new();
        mock.queue(b"first".to_vec());
        mock.queue_str("second");

        assert_eq!(mock.read(64, T).unwrap(), b"first");
        assert_eq!(mock.read(64, T).unwrap(), b"second");

        // Queue is empty now
        assert!(matches!(
            mock.read(64, T),
            Err(TransportError::Timeout { timeout_ms: 10 })
        ));
    }

    #[test]
    fn test_mock_read_splits_long_response() {
        let mut mock = MockChannel::new();
        mock.queue(vec![7u8; 10]);
        assert_eq!(mock.read(4, T).unwrap().len(), 4);
        assert_eq!(mock.read(64, T).unwrap().len(), 6);
    }

    #[test]
    fn test_mock_write_capture() {
        let mut mock = MockChannel::new();
        let observer = mock.clone();
        mock.write_all(b"Hello", T).unwrap();
        mock.write_all(b"World", T).unwrap();

        let writes = observer.writes();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0], b"Hello");
        assert_eq!(writes[1], b"World");
        assert_eq!(observer.io_calls(), 2);
    }

    #[test]
    fn test_mock_disconnect() {
        let mut mock = MockChannel::new();
        mock.disconnect();
        assert!(matches!(
            mock.write(b"test", T),
            Err(TransportError::Disconnected)
        ));
    }

    #[test]
    fn test_mock_disconnect_after_budget() {
        let mut mock = MockChannel::new();
        mock.disconnect_after(6);
        mock.write_all(b"1234", T).unwrap();
        assert!(mock.write_all(b"5678", T).is_err());
        assert!(mock.write_all(b"9", T).is_err());
    }

    #[test]
    fn test_backend_open_counts() {
        let backend = MockBackend::new();
        backend.add_device("abc", "QUSB__BULK");
        let devices = backend.scan().unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(backend.open_count(), 0);
        backend.open(&devices[0]).unwrap();
        assert_eq!(backend.open_count(), 1);
    }
}
