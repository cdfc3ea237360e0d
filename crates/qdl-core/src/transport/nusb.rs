//! nusb-based USB transport for devices in Emergency Download (EDL) mode.

use std::time::Duration;

use nusb::transfer::{Buffer, Bulk, In, Out, TransferError};
use nusb::{Endpoint, Interface, MaybeFuture, list_devices};
use tracing::{debug, info, instrument, trace};

use super::traits::{Channel, TransportError};
use crate::protocol::constants::{QUALCOMM_VENDOR_ID, SUPPORTED_PIDS};
use crate::registry::{Device, DeviceBackend, DeviceHandle};

/// Marker preceding the chip serial inside the EDL product string,
/// e.g. `QUSB__BULK_CID:0402_SN:7D3D1F1F`.
const SERIAL_MARKER: &str = "_SN:";

/// Extract the device serial, preferring the one embedded in the product string.
pub(crate) fn serial_from_descriptors(product: Option<&str>, serial: Option<&str>) -> String {
    if let Some(product) = product
        && let Some(pos) = product.find(SERIAL_MARKER)
    {
        let tail = &product[pos + SERIAL_MARKER.len()..];
        let end = tail.find(|c: char| c == '_' || c.is_whitespace()).unwrap_or(tail.len());
        if end > 0 {
            return tail[..end].to_string();
        }
    }
    serial.unwrap_or_default().trim().to_string()
}

fn handle_for(vid: u16, pid: u16, serial: &str) -> DeviceHandle {
    DeviceHandle::new(format!("usb:{vid:04x}:{pid:04x}:{serial}"))
}

/// Enumerates EDL devices with nusb.
#[derive(Debug, Default, Clone, Copy)]
pub struct NusbBackend;

impl DeviceBackend for NusbBackend {
    #[instrument(level = "debug", skip(self))]
    fn scan(&self) -> Result<Vec<Device>, TransportError> {
        let devices = list_devices()
            .wait()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?;

        let found: Vec<Device> = devices
            .filter(|d| {
                d.vendor_id() == QUALCOMM_VENDOR_ID && SUPPORTED_PIDS.contains(&d.product_id())
            })
            .map(|d| {
                let serial = serial_from_descriptors(d.product_string(), d.serial_number());
                Device {
                    handle: handle_for(d.vendor_id(), d.product_id(), &serial),
                    product: d.product_string().unwrap_or_default().to_string(),
                    serial,
                }
            })
            .collect();

        debug!(count = found.len(), "EDL scan complete");
        Ok(found)
    }

    #[instrument(level = "info", skip(self), fields(serial = %device.serial))]
    fn open(&self, device: &Device) -> Result<Box<dyn Channel>, TransportError> {
        let device_info = list_devices()
            .wait()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?
            .find(|d| {
                let serial = serial_from_descriptors(d.product_string(), d.serial_number());
                handle_for(d.vendor_id(), d.product_id(), &serial) == device.handle
            })
            .ok_or_else(|| TransportError::DeviceNotFound(device.serial.clone()))?;

        Ok(Box::new(NusbChannel::open_device_info(device_info)?))
    }
}

/// Bytes a packet-rounded IN transfer returned beyond what the caller asked for.
#[derive(Debug, Default)]
struct Overflow(Vec<u8>);

impl Overflow {
    /// Serve a read from leftovers, if there are any.
    fn take(&mut self, max_len: usize) -> Option<Vec<u8>> {
        if self.0.is_empty() {
            return None;
        }
        let n = self.0.len().min(max_len);
        Some(self.0.drain(..n).collect())
    }

    /// Keep everything past `max_len` for the next read.
    fn split(&mut self, mut data: Vec<u8>, max_len: usize) -> Vec<u8> {
        if data.len() > max_len {
            self.0.extend(data.split_off(max_len));
        }
        data
    }
}

/// nusb bulk channel.
pub struct NusbChannel {
    _interface: Interface,
    in_ep: Endpoint<Bulk, In>,
    out_ep: Endpoint<Bulk, Out>,
    overflow: Overflow,
    closed: bool,
}

impl NusbChannel {
    fn open_device_info(device_info: nusb::DeviceInfo) -> Result<Self, TransportError> {
        info!(
            vendor_id = %format!("{:04X}", device_info.vendor_id()),
            product_id = %format!("{:04X}", device_info.product_id()),
            product = device_info.product_string().unwrap_or_default(),
            "Found EDL device"
        );

        let device = device_info
            .open()
            .wait()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?;

        let interface =
            device
                .claim_interface(0)
                .wait()
                .map_err(|e| TransportError::ClaimInterfaceFailed {
                    interface: 0,
                    message: e.to_string(),
                })?;

        // Find BULK endpoints
        let mut in_endpoint: u8 = 0;
        let mut out_endpoint: u8 = 0;

        for config in device.configurations() {
            for iface in config.interfaces() {
                if iface.interface_number() != 0 {
                    continue;
                }
                for alt in iface.alt_settings() {
                    for ep in alt.endpoints() {
                        if ep.transfer_type() != nusb::descriptors::TransferType::Bulk {
                            continue;
                        }
                        if ep.direction() == nusb::transfer::Direction::In {
                            in_endpoint = ep.address();
                        } else {
                            out_endpoint = ep.address();
                        }
                    }
                }
            }
        }

        if in_endpoint == 0 {
            return Err(TransportError::EndpointNotFound {
                ep_type: "Bulk".into(),
                direction: "In".into(),
            });
        }
        if out_endpoint == 0 {
            return Err(TransportError::EndpointNotFound {
                ep_type: "Bulk".into(),
                direction: "Out".into(),
            });
        }

        let in_ep = interface
            .endpoint::<Bulk, In>(in_endpoint)
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?;
        let out_ep = interface
            .endpoint::<Bulk, Out>(out_endpoint)
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?;

        info!(
            in_ep = %format!("0x{:02X}", in_endpoint),
            out_ep = %format!("0x{:02X}", out_endpoint),
            "Device opened successfully"
        );

        Ok(Self {
            _interface: interface,
            in_ep,
            out_ep,
            overflow: Overflow::default(),
            closed: false,
        })
    }

    fn map_transfer_error(e: TransferError) -> TransportError {
        match e {
            TransferError::Disconnected => TransportError::Disconnected,
            other => TransportError::TransferFailed(other.to_string()),
        }
    }

    fn submit_out(&mut self, data: Vec<u8>, timeout: Duration) -> Result<usize, TransportError> {
        self.out_ep.submit(Buffer::from(data));
        let Some(completion) = self.out_ep.wait_next_complete(timeout) else {
            self.out_ep.cancel_all();
            // Reap the cancelled transfer so the next submit starts clean.
            let _ = self.out_ep.wait_next_complete(Duration::from_millis(100));
            return Err(TransportError::timeout(timeout));
        };
        completion.status.map_err(Self::map_transfer_error)?;
        Ok(completion.actual_len)
    }
}

impl Channel for NusbChannel {
    #[instrument(level = "trace", skip(self), fields(max_len))]
    fn read(&mut self, max_len: usize, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        if self.closed {
            return Err(TransportError::Disconnected);
        }
        if let Some(leftover) = self.overflow.take(max_len) {
            trace!(bytes_read = leftover.len(), "Read served from overflow");
            return Ok(leftover);
        }
        // IN requests must be a whole number of packets.
        let mps = self.in_ep.max_packet_size().max(1);
        let request = max_len.max(1).div_ceil(mps) * mps;

        self.in_ep.submit(Buffer::new(request));
        let Some(completion) = self.in_ep.wait_next_complete(timeout) else {
            self.in_ep.cancel_all();
            let _ = self.in_ep.wait_next_complete(Duration::from_millis(100));
            return Err(TransportError::timeout(timeout));
        };
        completion.status.map_err(Self::map_transfer_error)?;

        let n = completion.actual_len.min(completion.buffer.len());
        let data = self.overflow.split(completion.buffer[..n].to_vec(), max_len);
        trace!(bytes_read = data.len(), "Read complete");
        Ok(data)
    }

    #[instrument(level = "trace", skip(self, data), fields(len = data.len()))]
    fn write(&mut self, data: &[u8], timeout: Duration) -> Result<usize, TransportError> {
        if self.closed {
            return Err(TransportError::Disconnected);
        }
        let written = self.submit_out(data.to_vec(), timeout)?;

        // Terminate transfers that end on a packet boundary with a ZLP.
        let mps = self.out_ep.max_packet_size().max(1);
        if !data.is_empty() && data.len() % mps == 0 {
            self.submit_out(Vec::new(), timeout)?;
        }

        trace!(bytes_written = written, "Write complete");
        Ok(written)
    }

    fn close(&mut self) -> Result<(), TransportError> {
        self.in_ep.cancel_all();
        self.out_ep.cancel_all();
        self.closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serial_from_product_string() {
        assert_eq!(
            serial_from_descriptors(Some("QUSB__BULK_CID:0402_SN:7D3D1F1F"), None),
            "7D3D1F1F"
        );
        assert_eq!(
            serial_from_descriptors(Some("QUSB__BULK_SN:ABCD_CID:01"), Some("xyz")),
            "ABCD"
        );
    }

    #[test]
    fn test_overflow_kept_for_next_read() {
        let mut overflow = Overflow::default();
        assert_eq!(overflow.take(16), None);

        let data = overflow.split((0u8..10).collect(), 4);
        assert_eq!(data, vec![0, 1, 2, 3]);
        assert_eq!(overflow.take(4), Some(vec![4, 5, 6, 7]));
        assert_eq!(overflow.take(16), Some(vec![8, 9]));
        assert_eq!(overflow.take(16), None);

        assert_eq!(overflow.split(vec![1, 2], 4), vec![1, 2]);
        assert_eq!(overflow.take(4), None);
    }

    #[test]
    fn test_serial_falls_back_to_descriptor() {
        assert_eq!(serial_from_descriptors(Some("QUSB__BULK"), Some(" 1234 ")), "1234");
        assert_eq!(serial_from_descriptors(None, None), "");
    }
}
