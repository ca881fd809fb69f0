//! USB control/bulk primitives.

use std::collections::VecDeque;
use std::time::Duration;

use log::{debug, trace};
use rusb::UsbContext;

use crate::error::TransportError;

/// Upper bound on any single USB operation.
pub const USB_TIMEOUT: Duration = Duration::from_millis(3000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsbDeviceInfo {
    pub vid: u16,
    pub pid: u16,
    pub bus: u8,
    pub address: u8,
}

/// Vendor-request and bulk-transfer access to one opened USB device.
///
/// IN streaming uses a submit/poll pair: engines keep a number of transfers
/// submitted and collect completions one at a time, which keeps every wait
/// bounded and the session loop in control.
pub trait UsbIo {
    /// Vendor OUT request on the control pipe.
    fn control_out(
        &mut self,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        timeout: Duration,
    ) -> Result<(), TransportError>;

    /// Vendor IN request on the control pipe; returns the payload.
    fn control_in(
        &mut self,
        request: u8,
        value: u16,
        index: u16,
        len: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError>;

    /// Bulk write; returns bytes actually transferred.
    fn bulk_out(
        &mut self,
        endpoint: u8,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, TransportError>;

    /// Queue one IN transfer of `len` bytes on `endpoint`.
    fn submit_bulk_in(&mut self, endpoint: u8, len: usize) -> Result<(), TransportError>;

    /// Collect one completed IN transfer, waiting at most `timeout`.
    /// Ok(None) means nothing completed in time (the transfer stays
    /// queued). An empty Vec is a valid completion.
    fn poll_bulk_in(
        &mut self,
        endpoint: u8,
        timeout: Duration,
    ) -> Result<Option<Vec<u8>>, TransportError>;

    /// Number of IN transfers currently queued on `endpoint`.
    fn pending_in(&self, endpoint: u8) -> usize;
}

/// Enumerates attachable USB devices. Split from [`UsbIo`] so scan can run
/// against a mock device list in tests.
pub trait UsbEnumerator {
    fn list(&self) -> Result<Vec<UsbDeviceInfo>, TransportError>;
    fn open(&self, info: &UsbDeviceInfo) -> Result<Box<dyn UsbIo>, TransportError>;
}

/// [`UsbEnumerator`] over the host USB stack via `rusb`.
pub struct RusbEnumerator {
    context: rusb::Context,
}

impl RusbEnumerator {
    pub fn new() -> Result<RusbEnumerator, TransportError> {
        Ok(RusbEnumerator {
            context: rusb::Context::new()?,
        })
    }
}

impl UsbEnumerator for RusbEnumerator {
    fn list(&self) -> Result<Vec<UsbDeviceInfo>, TransportError> {
        let mut out = Vec::new();
        for device in self.context.devices()?.iter() {
            let desc = match device.device_descriptor() {
                Ok(d) => d,
                Err(e) => {
                    trace!("skipping device without descriptor: {}", e);
                    continue;
                }
            };
            out.push(UsbDeviceInfo {
                vid: desc.vendor_id(),
                pid: desc.product_id(),
                bus: device.bus_number(),
                address: device.address(),
            });
        }
        Ok(out)
    }

    fn open(&self, info: &UsbDeviceInfo) -> Result<Box<dyn UsbIo>, TransportError> {
        for device in self.context.devices()?.iter() {
            if device.bus_number() != info.bus || device.address() != info.address {
                continue;
            }
            let handle = device.open()?;
            handle.claim_interface(0)?;
            debug!(
                "opened usb device {:04x}:{:04x} at {}.{}",
                info.vid, info.pid, info.bus, info.address
            );
            return Ok(Box::new(RusbTransport {
                handle,
                pending: VecDeque::new(),
            }));
        }
        Err(TransportError::Usb(format!(
            "usb device at {}.{} is gone",
            info.bus, info.address
        )))
    }
}

/// [`UsbIo`] over an opened `rusb` device handle.
///
/// libusb transfers are synchronous here; submitted IN lengths are queued
/// and serviced one per `poll_bulk_in` call, which preserves the bounded
/// submit/poll contract the engines rely on.
pub struct RusbTransport {
    handle: rusb::DeviceHandle<rusb::Context>,
    pending: VecDeque<(u8, usize)>,
}

impl UsbIo for RusbTransport {
    fn control_out(
        &mut self,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        timeout: Duration,
    ) -> Result<(), TransportError> {
        let request_type = rusb::request_type(
            rusb::Direction::Out,
            rusb::RequestType::Vendor,
            rusb::Recipient::Device,
        );
        let n = self
            .handle
            .write_control(request_type, request, value, index, data, timeout)?;
        if n != data.len() {
            return Err(TransportError::ShortTransfer {
                expected: data.len(),
                actual: n,
            });
        }
        Ok(())
    }

    fn control_in(
        &mut self,
        request: u8,
        value: u16,
        index: u16,
        len: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let request_type = rusb::request_type(
            rusb::Direction::In,
            rusb::RequestType::Vendor,
            rusb::Recipient::Device,
        );
        let mut buf = vec![0u8; len];
        let n = self
            .handle
            .read_control(request_type, request, value, index, &mut buf, timeout)?;
        buf.truncate(n);
        Ok(buf)
    }

    fn bulk_out(
        &mut self,
        endpoint: u8,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, TransportError> {
        Ok(self.handle.write_bulk(endpoint, data, timeout)?)
    }

    fn submit_bulk_in(&mut self, endpoint: u8, len: usize) -> Result<(), TransportError> {
        self.pending.push_back((endpoint, len));
        Ok(())
    }

    fn poll_bulk_in(
        &mut self,
        endpoint: u8,
        timeout: Duration,
    ) -> Result<Option<Vec<u8>>, TransportError> {
        let slot = self.pending.iter().position(|&(ep, _)| ep == endpoint);
        let Some(slot) = slot else {
            return Ok(None);
        };
        let (_, len) = self.pending[slot];
        let mut buf = vec![0u8; len];
        match self.handle.read_bulk(endpoint, &mut buf, timeout) {
            Ok(n) => {
                self.pending.remove(slot);
                buf.truncate(n);
                Ok(Some(buf))
            }
            Err(rusb::Error::Timeout) => Ok(None),
            Err(e) => {
                self.pending.remove(slot);
                Err(e.into())
            }
        }
    }

    fn pending_in(&self, endpoint: u8) -> usize {
        self.pending.iter().filter(|&&(ep, _)| ep == endpoint).count()
    }
}
