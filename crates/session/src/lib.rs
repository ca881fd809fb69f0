//! The session event loop.
//!
//! A session owns a set of registered I/O sources and drives them with a
//! single-threaded cooperative wait: each loop iteration polls every
//! source for readiness, sleeps a bounded quantum when nothing is due, and
//! dispatches due sources exactly once per wake-up in registration order.
//! Datafeed packets fan out synchronously to subscribers in subscription
//! order.
//!
//! Everything runs on the thread that called [`Session::run`]; engines and
//! subscribers must not block, and suspension happens only inside the wait.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::{Duration, Instant};

use log::{debug, trace, warn};

use meas_types::{DeviceId, Error, Packet, Result};

mod feed;
mod source;

pub use feed::{DatafeedCallback, SubscriberToken};
pub use source::{EventSource, SourceKey, Timeout, Wakeup};

/// Upper bound on one idle wait. Readiness can change at any moment (bytes
/// arriving on a port), so the loop never sleeps longer than this even
/// when the nearest source deadline is far away.
const WAIT_QUANTUM: Duration = Duration::from_millis(1);

struct Slot {
    key: SourceKey,
    timeout: Timeout,
    deadline: Option<Instant>,
    /// Taken out while the source is being dispatched.
    source: Option<Box<dyn EventSource>>,
}

impl Slot {
    fn rearm(&mut self, now: Instant) {
        self.deadline = match self.timeout {
            Timeout::After(t) => Some(now + t),
            _ => None,
        };
    }
}

#[derive(Default)]
struct StreamState {
    started: bool,
    ended: bool,
}

pub(crate) struct Inner {
    slots: Vec<Slot>,
    pub(crate) subscribers: Vec<feed::Subscriber>,
    pub(crate) next_token: u64,
    streams: HashMap<DeviceId, StreamState>,
    running: bool,
    stop_requested: bool,
}

/// Cheap-clone handle to one session. All clones refer to the same loop
/// state; the session is single-threaded by construction.
#[derive(Clone)]
pub struct Session {
    pub(crate) inner: Rc<RefCell<Inner>>,
}

impl Default for Session {
    fn default() -> Session {
        Session::new()
    }
}

impl Session {
    pub fn new() -> Session {
        Session {
            inner: Rc::new(RefCell::new(Inner {
                slots: Vec::new(),
                subscribers: Vec::new(),
                next_token: 0,
                streams: HashMap::new(),
                running: false,
                stop_requested: false,
            })),
        }
    }

    /// Register a source. A duplicate key replaces the existing
    /// registration (its old source is dropped).
    pub fn source_add(&self, key: SourceKey, timeout: Timeout, source: Box<dyn EventSource>) {
        let mut inner = self.inner.borrow_mut();
        let now = Instant::now();
        if let Some(slot) = inner.slots.iter_mut().find(|s| s.key == key) {
            debug!("replacing source {:?}", key);
            slot.timeout = timeout;
            slot.source = Some(source);
            slot.rearm(now);
            return;
        }
        let mut slot = Slot {
            key,
            timeout,
            deadline: None,
            source: Some(source),
        };
        slot.rearm(now);
        inner.slots.push(slot);
    }

    /// Remove a registered source. Errors if the key is unknown.
    pub fn source_remove(&self, key: SourceKey) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        let before = inner.slots.len();
        inner.slots.retain(|s| s.key != key);
        if inner.slots.len() == before {
            return Err(Error::Arg(format!("source {:?} is not registered", key)));
        }
        Ok(())
    }

    /// Change the timeout of a registered source and restart its deadline.
    /// Usable from within the source's own dispatch.
    pub fn source_set_timeout(&self, key: SourceKey, timeout: Timeout) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        let slot = inner
            .slots
            .iter_mut()
            .find(|s| s.key == key)
            .ok_or_else(|| Error::Arg(format!("source {:?} is not registered", key)))?;
        slot.timeout = timeout;
        slot.rearm(Instant::now());
        Ok(())
    }

    /// Ask a running loop to return after finishing the current iteration's
    /// dispatches. Idempotent; a no-op when the loop is not running.
    pub fn stop(&self) {
        self.inner.borrow_mut().stop_requested = true;
    }

    /// Drive the loop until no sources remain or [`Session::stop`] is
    /// called.
    pub fn run(&self) -> Result<()> {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.running {
                return Err(Error::Bug("session loop is already running".into()));
            }
            inner.running = true;
            inner.stop_requested = false;
            let now = Instant::now();
            for slot in inner.slots.iter_mut() {
                slot.rearm(now);
            }
        }
        let result = self.run_loop();
        self.inner.borrow_mut().running = false;
        result
    }

    fn run_loop(&self) -> Result<()> {
        loop {
            let mut due: Vec<(SourceKey, Wakeup)> = Vec::new();
            let mut idle_wait: Option<Duration> = None;
            {
                let mut inner = self.inner.borrow_mut();
                if inner.stop_requested || inner.slots.is_empty() {
                    return Ok(());
                }
                let now = Instant::now();
                let mut nearest: Option<Duration> = None;
                for slot in inner.slots.iter_mut() {
                    let Some(src) = slot.source.as_mut() else {
                        continue;
                    };
                    let ready = match src.readiness() {
                        Ok(r) => r,
                        Err(e) => {
                            // Let the dispatch see the failure and decide.
                            warn!("readiness poll failed for {:?}: {}", slot.key, e);
                            true
                        }
                    };
                    if ready {
                        due.push((slot.key, Wakeup::Ready));
                        continue;
                    }
                    match slot.timeout {
                        Timeout::Poll => due.push((slot.key, Wakeup::Timeout)),
                        Timeout::After(t) => {
                            let deadline = *slot.deadline.get_or_insert(now + t);
                            if deadline <= now {
                                due.push((slot.key, Wakeup::Timeout));
                            } else {
                                let left = deadline - now;
                                nearest = Some(nearest.map_or(left, |n: Duration| n.min(left)));
                            }
                        }
                        Timeout::Infinite => {}
                    }
                }
                if due.is_empty() {
                    idle_wait = Some(nearest.map_or(WAIT_QUANTUM, |n| n.min(WAIT_QUANTUM)));
                }
            }
            if let Some(wait) = idle_wait {
                std::thread::sleep(wait);
                continue;
            }
            for (key, wakeup) in due {
                let taken = {
                    let mut inner = self.inner.borrow_mut();
                    inner
                        .slots
                        .iter_mut()
                        .find(|s| s.key == key)
                        .and_then(|s| s.source.take())
                };
                // Gone or replaced by an earlier dispatch this iteration.
                let Some(mut src) = taken else {
                    continue;
                };
                trace!("dispatching {:?} ({:?})", key, wakeup);
                let keep = src.dispatch(self, wakeup);
                let mut inner = self.inner.borrow_mut();
                let Some(idx) = inner.slots.iter().position(|s| s.key == key) else {
                    // The source removed itself during dispatch.
                    continue;
                };
                if inner.slots[idx].source.is_some() {
                    // Replaced itself with a fresh registration.
                    continue;
                }
                if keep {
                    let now = Instant::now();
                    let slot = &mut inner.slots[idx];
                    slot.source = Some(src);
                    slot.rearm(now);
                } else {
                    debug!("source {:?} requested removal", key);
                    inner.slots.remove(idx);
                }
            }
        }
    }

    pub(crate) fn track_stream(&self, device: DeviceId, packet: &Packet<'_>) {
        let mut inner = self.inner.borrow_mut();
        let state = inner.streams.entry(device).or_default();
        match packet {
            Packet::Header(_) => {
                if state.started && !state.ended {
                    warn!("{}: duplicate header packet", device);
                }
                *state = StreamState {
                    started: true,
                    ended: false,
                };
            }
            Packet::End => {
                if !state.started {
                    warn!("{}: end packet without header", device);
                }
                if state.ended {
                    warn!("{}: duplicate end packet", device);
                }
                state.ended = true;
            }
            _ => {
                if !state.started {
                    warn!("{}: {} packet before header", device, packet.kind());
                }
                if state.ended {
                    warn!("{}: {} packet after end", device, packet.kind());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests;
