//! Datafeed fan-out to subscribers.

use std::cell::RefCell;
use std::rc::Rc;

use log::{trace, warn};

use meas_types::{DeviceId, Error, Packet, Result};

use crate::Session;

/// A datafeed subscriber callback. Payload slices inside the packet are
/// only valid for the duration of the call; copy what must be retained.
pub type DatafeedCallback = Box<dyn FnMut(DeviceId, &Packet<'_>)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriberToken(u64);

pub(crate) struct Subscriber {
    pub(crate) token: SubscriberToken,
    pub(crate) callback: Rc<RefCell<DatafeedCallback>>,
}

impl Session {
    /// Register a subscriber; it will see every packet sent after this
    /// call, in emission order.
    pub fn datafeed_subscribe(&self, callback: DatafeedCallback) -> SubscriberToken {
        let mut inner = self.inner.borrow_mut();
        let token = SubscriberToken(inner.next_token);
        inner.next_token += 1;
        inner.subscribers.push(Subscriber {
            token,
            callback: Rc::new(RefCell::new(callback)),
        });
        token
    }

    pub fn datafeed_unsubscribe(&self, token: SubscriberToken) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        let before = inner.subscribers.len();
        inner.subscribers.retain(|s| s.token != token);
        if inner.subscribers.len() == before {
            return Err(Error::Arg(format!("unknown subscriber {:?}", token)));
        }
        Ok(())
    }

    /// Deliver one packet from `device` to every subscriber, synchronously
    /// and in subscription order. A subscriber that re-enters `send` from
    /// its own callback is skipped with a warning rather than re-entered.
    pub fn send(&self, device: DeviceId, packet: &Packet<'_>) {
        trace!("{}: {} packet", device, packet.kind());
        self.track_stream(device, packet);
        let subscribers: Vec<(SubscriberToken, Rc<RefCell<DatafeedCallback>>)> = self
            .inner
            .borrow()
            .subscribers
            .iter()
            .map(|s| (s.token, s.callback.clone()))
            .collect();
        for (token, callback) in subscribers {
            match callback.try_borrow_mut() {
                Ok(mut cb) => cb(device, packet),
                Err(_) => warn!("subscriber {:?} re-entered send; skipped", token),
            }
        }
    }

    /// Emit the session header for `device`. Every acquisition starts with
    /// exactly one of these.
    pub fn send_header(&self, device: DeviceId) {
        self.send(device, &Packet::Header(meas_types::Header::new()));
    }

    /// Emit the end-of-stream marker for `device`. No packet may follow.
    pub fn send_end(&self, device: DeviceId) {
        self.send(device, &Packet::End);
    }

    /// Emit the trigger boundary marker for `device`.
    pub fn send_trigger(&self, device: DeviceId) {
        self.send(device, &Packet::Trigger);
    }
}
