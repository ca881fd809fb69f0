//! Scripted transports for hardware-free engine tests.
//!
//! Both mocks are cheap clones over shared state, so a test can hand one
//! clone to an engine and keep another to script input and inspect what
//! the engine wrote.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Duration;

use crate::error::TransportError;
use crate::serial::SerialIo;
use crate::usb::{UsbDeviceInfo, UsbEnumerator, UsbIo};

#[derive(Default)]
struct MockSerialState {
    written: Vec<u8>,
    rx: VecDeque<u8>,
    /// One-shot (pattern, reply) triggers: when the write log ends with
    /// `pattern`, `reply` is queued as input.
    triggers: Vec<(Vec<u8>, Vec<u8>)>,
}

/// A scripted [`SerialIo`].
#[derive(Clone, Default)]
pub struct MockSerial {
    state: Rc<RefCell<MockSerialState>>,
}

impl MockSerial {
    pub fn new() -> MockSerial {
        MockSerial::default()
    }

    /// Queue `reply` as input the next time the engine's write log ends
    /// with `pattern`. Triggers fire once, in arming order.
    pub fn on_write(&self, pattern: &[u8], reply: &[u8]) {
        self.state
            .borrow_mut()
            .triggers
            .push((pattern.to_vec(), reply.to_vec()));
    }

    /// Queue input unconditionally.
    pub fn push_input(&self, data: &[u8]) {
        self.state.borrow_mut().rx.extend(data);
    }

    /// Everything the engine wrote so far.
    pub fn written(&self) -> Vec<u8> {
        self.state.borrow().written.clone()
    }

    pub fn clear_written(&self) {
        self.state.borrow_mut().written.clear();
    }
}

impl SerialIo for MockSerial {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let mut state = self.state.borrow_mut();
        let mut n = 0;
        while n < buf.len() {
            match state.rx.pop_front() {
                Some(b) => {
                    buf[n] = b;
                    n += 1;
                }
                None => break,
            }
        }
        Ok(n)
    }

    fn write_all(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let mut state = self.state.borrow_mut();
        state.written.extend_from_slice(data);
        let mut fired = None;
        for (i, (pattern, _)) in state.triggers.iter().enumerate() {
            if state.written.ends_with(pattern) {
                fired = Some(i);
                break;
            }
        }
        if let Some(i) = fired {
            let (_, reply) = state.triggers.remove(i);
            state.rx.extend(reply);
        }
        Ok(())
    }

    fn bytes_available(&mut self) -> Result<usize, TransportError> {
        Ok(self.state.borrow().rx.len())
    }

    fn read_timeout(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<usize, TransportError> {
        // No wall clock in the mock: whatever is scripted is "already
        // arrived"; an empty queue reads as an elapsed timeout.
        self.read(buf)
    }

    fn drain_input(&mut self) -> Result<(), TransportError> {
        self.state.borrow_mut().rx.clear();
        Ok(())
    }
}

#[derive(Default)]
struct MockUsbState {
    control_log: Vec<ControlRecord>,
    bulk_out_log: Vec<(u8, Vec<u8>)>,
    control_in_replies: VecDeque<Vec<u8>>,
    in_payloads: VecDeque<Vec<u8>>,
    submitted: Vec<(u8, usize)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlRecord {
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub data: Vec<u8>,
}

/// A scripted [`UsbIo`].
#[derive(Clone, Default)]
pub struct MockUsb {
    state: Rc<RefCell<MockUsbState>>,
}

impl MockUsb {
    pub fn new() -> MockUsb {
        MockUsb::default()
    }

    /// Queue a canned bulk IN completion.
    pub fn queue_bulk_in(&self, data: Vec<u8>) {
        self.state.borrow_mut().in_payloads.push_back(data);
    }

    /// Queue a reply for the next control IN request. With the queue
    /// empty, control IN reads time out, the way a device without
    /// firmware behaves.
    pub fn queue_control_in(&self, data: Vec<u8>) {
        self.state.borrow_mut().control_in_replies.push_back(data);
    }

    pub fn control_log(&self) -> Vec<ControlRecord> {
        self.state.borrow().control_log.clone()
    }

    pub fn bulk_out_log(&self) -> Vec<(u8, Vec<u8>)> {
        self.state.borrow().bulk_out_log.clone()
    }
}

impl UsbIo for MockUsb {
    fn control_out(
        &mut self,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        _timeout: Duration,
    ) -> Result<(), TransportError> {
        self.state.borrow_mut().control_log.push(ControlRecord {
            request,
            value,
            index,
            data: data.to_vec(),
        });
        Ok(())
    }

    fn control_in(
        &mut self,
        _request: u8,
        _value: u16,
        _index: u16,
        len: usize,
        _timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        match self.state.borrow_mut().control_in_replies.pop_front() {
            Some(mut reply) => {
                reply.truncate(len);
                Ok(reply)
            }
            None => Err(TransportError::Timeout),
        }
    }

    fn bulk_out(
        &mut self,
        endpoint: u8,
        data: &[u8],
        _timeout: Duration,
    ) -> Result<usize, TransportError> {
        self.state
            .borrow_mut()
            .bulk_out_log
            .push((endpoint, data.to_vec()));
        Ok(data.len())
    }

    fn submit_bulk_in(&mut self, endpoint: u8, len: usize) -> Result<(), TransportError> {
        self.state.borrow_mut().submitted.push((endpoint, len));
        Ok(())
    }

    fn poll_bulk_in(
        &mut self,
        endpoint: u8,
        _timeout: Duration,
    ) -> Result<Option<Vec<u8>>, TransportError> {
        let mut state = self.state.borrow_mut();
        let slot = state.submitted.iter().position(|&(ep, _)| ep == endpoint);
        let Some(slot) = slot else {
            return Ok(None);
        };
        match state.in_payloads.pop_front() {
            Some(payload) => {
                let (_, len) = state.submitted.remove(slot);
                let mut payload = payload;
                payload.truncate(len);
                Ok(Some(payload))
            }
            // Nothing scripted: reads as a completion timeout.
            None => Ok(None),
        }
    }

    fn pending_in(&self, endpoint: u8) -> usize {
        self.state
            .borrow()
            .submitted
            .iter()
            .filter(|&&(ep, _)| ep == endpoint)
            .count()
    }
}

/// A fixed device list standing in for the host USB stack.
pub struct MockUsbEnumerator {
    devices: Vec<(UsbDeviceInfo, MockUsb)>,
}

impl MockUsbEnumerator {
    pub fn new(devices: Vec<(UsbDeviceInfo, MockUsb)>) -> MockUsbEnumerator {
        MockUsbEnumerator { devices }
    }
}

impl UsbEnumerator for MockUsbEnumerator {
    fn list(&self) -> Result<Vec<UsbDeviceInfo>, TransportError> {
        Ok(self.devices.iter().map(|(info, _)| *info).collect())
    }

    fn open(&self, info: &UsbDeviceInfo) -> Result<Box<dyn UsbIo>, TransportError> {
        for (candidate, io) in &self.devices {
            if candidate == info {
                return Ok(Box::new(io.clone()));
            }
        }
        Err(TransportError::Usb(format!(
            "no mock device at {}.{}",
            info.bus, info.address
        )))
    }
}
