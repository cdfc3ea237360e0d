//! Transport channel abstraction.
//!
//! Defines the `Channel` trait for talking to one EDL device,
//! allowing different implementations (nusb, mock, etc.).

use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Device {0} is already in use by another session")]
    Busy(String),

    #[error("Failed to open device: {0}")]
    OpenFailed(String),

    #[error("Failed to claim interface {interface}: {message}")]
    ClaimInterfaceFailed { interface: u8, message: String },

    #[error("Endpoint not found: type={ep_type}, direction={direction}")]
    EndpointNotFound { ep_type: String, direction: String },

    #[error("Device disconnected")]
    Disconnected,

    #[error("Timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Short transfer: expected {expected} bytes, moved {actual}")]
    ShortTransfer { expected: usize, actual: usize },

    #[error("Transfer failed: {0}")]
    TransferFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    pub(crate) fn timeout(timeout: Duration) -> Self {
        TransportError::Timeout {
            timeout_ms: timeout.as_millis() as u64,
        }
    }
}

/// Duplex byte channel to a single device.
///
/// A channel is owned by exactly one session at a time; the registry
/// enforces that, not the channel.
pub trait Channel: Send {
    /// Read at most `max_len` bytes, waiting up to `timeout`.
    fn read(&mut self, max_len: usize, timeout: Duration) -> Result<Vec<u8>, TransportError>;

    /// Write `data`, waiting up to `timeout`. Returns the bytes accepted.
    fn write(&mut self, data: &[u8], timeout: Duration) -> Result<usize, TransportError>;

    /// Push out anything the channel buffers internally.
    fn flush(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    /// Release the underlying device. Further I/O fails with `Disconnected`.
    fn close(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    /// Write the whole buffer or fail with `ShortTransfer`.
    fn write_all(&mut self, data: &[u8], timeout: Duration) -> Result<(), TransportError> {
        let written = self.write(data, timeout)?;
        if written != data.len() {
            return Err(TransportError::ShortTransfer {
                expected: data.len(),
                actual: written,
            });
        }
        Ok(())
    }
}

impl<C: Channel + ?Sized> Channel for Box<C> {
    fn read(&mut self, max_len: usize, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        (**self).read(max_len, timeout)
    }

    fn write(&mut self, data: &[u8], timeout: Duration) -> Result<usize, TransportError> {
        (**self).write(data, timeout)
    }

    fn flush(&mut self) -> Result<(), TransportError> {
        (**self).flush()
    }

    fn close(&mut self) -> Result<(), TransportError> {
        (**self).close()
    }
}
