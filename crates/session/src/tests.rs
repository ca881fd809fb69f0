use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use meas_types::{DeviceId, Logic, Packet};

use crate::{EventSource, Session, SourceKey, Timeout, Wakeup};

const DEV: DeviceId = DeviceId {
    driver: "test",
    index: 0,
};

/// Records its dispatches and removes itself once the budget is spent.
struct CountedSource {
    name: &'static str,
    log: Rc<RefCell<Vec<(&'static str, Wakeup)>>>,
    ready: Rc<Cell<bool>>,
    dispatches_left: usize,
}

impl EventSource for CountedSource {
    fn readiness(&mut self) -> std::io::Result<bool> {
        Ok(self.ready.get())
    }

    fn dispatch(&mut self, _session: &Session, wakeup: Wakeup) -> bool {
        self.log.borrow_mut().push((self.name, wakeup));
        self.dispatches_left -= 1;
        self.dispatches_left > 0
    }
}

#[test]
fn poll_source_runs_until_removal() {
    let session = Session::new();
    let log = Rc::new(RefCell::new(Vec::new()));
    session.source_add(
        SourceKey(1),
        Timeout::Poll,
        Box::new(CountedSource {
            name: "a",
            log: log.clone(),
            ready: Rc::new(Cell::new(false)),
            dispatches_left: 3,
        }),
    );
    session.run().unwrap();
    // Not ready, poll timeout: dispatched every iteration until it asked
    // to be removed, then run() returned because no sources were left.
    assert_eq!(
        &*log.borrow(),
        &[
            ("a", Wakeup::Timeout),
            ("a", Wakeup::Timeout),
            ("a", Wakeup::Timeout)
        ]
    );
}

#[test]
fn dispatch_follows_registration_order() {
    let session = Session::new();
    let log = Rc::new(RefCell::new(Vec::new()));
    let ready = Rc::new(Cell::new(true));
    for (i, name) in ["first", "second", "third"].into_iter().enumerate() {
        session.source_add(
            SourceKey(i as u64),
            Timeout::Infinite,
            Box::new(CountedSource {
                name,
                log: log.clone(),
                ready: ready.clone(),
                dispatches_left: 1,
            }),
        );
    }
    session.run().unwrap();
    let names: Vec<&str> = log.borrow().iter().map(|(n, _)| *n).collect();
    assert_eq!(names, ["first", "second", "third"]);
    assert!(log.borrow().iter().all(|&(_, w)| w == Wakeup::Ready));
}

#[test]
fn duplicate_key_replaces_registration() {
    let session = Session::new();
    let log = Rc::new(RefCell::new(Vec::new()));
    let ready = Rc::new(Cell::new(true));
    session.source_add(
        SourceKey(7),
        Timeout::Infinite,
        Box::new(CountedSource {
            name: "old",
            log: log.clone(),
            ready: ready.clone(),
            dispatches_left: 5,
        }),
    );
    session.source_add(
        SourceKey(7),
        Timeout::Infinite,
        Box::new(CountedSource {
            name: "new",
            log: log.clone(),
            ready,
            dispatches_left: 1,
        }),
    );
    session.run().unwrap();
    let names: Vec<&str> = log.borrow().iter().map(|(n, _)| *n).collect();
    assert_eq!(names, ["new"]);
}

#[test]
fn remove_unknown_source_errors() {
    let session = Session::new();
    assert!(session.source_remove(SourceKey(99)).is_err());
}

#[test]
fn timeout_fires_without_readiness() {
    let session = Session::new();
    let log = Rc::new(RefCell::new(Vec::new()));
    session.source_add(
        SourceKey(1),
        Timeout::After(Duration::from_millis(5)),
        Box::new(CountedSource {
            name: "t",
            log: log.clone(),
            ready: Rc::new(Cell::new(false)),
            dispatches_left: 1,
        }),
    );
    session.run().unwrap();
    assert_eq!(&*log.borrow(), &[("t", Wakeup::Timeout)]);
}

#[test]
fn timeout_encoding() {
    assert_eq!(Timeout::from_ms(-1), Timeout::Infinite);
    assert_eq!(Timeout::from_ms(0), Timeout::Poll);
    assert_eq!(
        Timeout::from_ms(30),
        Timeout::After(Duration::from_millis(30))
    );
}

/// Stops the loop from inside a dispatch.
struct StoppingSource;

impl EventSource for StoppingSource {
    fn readiness(&mut self) -> std::io::Result<bool> {
        Ok(true)
    }

    fn dispatch(&mut self, session: &Session, _wakeup: Wakeup) -> bool {
        session.stop();
        true
    }
}

#[test]
fn stop_from_dispatch_returns() {
    let session = Session::new();
    session.source_add(SourceKey(1), Timeout::Infinite, Box::new(StoppingSource));
    session.run().unwrap();
    // The source is still registered; a second run resumes it.
    session.run().unwrap();
}

/// Registers a second source the first time it is dispatched.
struct SpawningSource {
    log: Rc<RefCell<Vec<(&'static str, Wakeup)>>>,
    spawned: bool,
}

impl EventSource for SpawningSource {
    fn readiness(&mut self) -> std::io::Result<bool> {
        Ok(true)
    }

    fn dispatch(&mut self, session: &Session, _wakeup: Wakeup) -> bool {
        if !self.spawned {
            self.spawned = true;
            session.source_add(
                SourceKey(2),
                Timeout::Infinite,
                Box::new(CountedSource {
                    name: "child",
                    log: self.log.clone(),
                    ready: Rc::new(Cell::new(true)),
                    dispatches_left: 1,
                }),
            );
            true
        } else {
            false
        }
    }
}

#[test]
fn source_can_add_sources_during_dispatch() {
    let session = Session::new();
    let log = Rc::new(RefCell::new(Vec::new()));
    session.source_add(
        SourceKey(1),
        Timeout::Infinite,
        Box::new(SpawningSource {
            log: log.clone(),
            spawned: false,
        }),
    );
    session.run().unwrap();
    let names: Vec<&str> = log.borrow().iter().map(|(n, _)| *n).collect();
    assert_eq!(names, ["child"]);
}

#[test]
fn subscribers_see_packets_in_order() {
    let session = Session::new();
    let seen_a = Rc::new(RefCell::new(Vec::new()));
    let seen_b = Rc::new(RefCell::new(Vec::new()));
    let a = seen_a.clone();
    let token = session.datafeed_subscribe(Box::new(move |dev, packet| {
        assert_eq!(dev, DEV);
        a.borrow_mut().push(packet.kind());
    }));
    let b = seen_b.clone();
    session.datafeed_subscribe(Box::new(move |_, packet| {
        b.borrow_mut().push(packet.kind());
    }));

    let samples = [0u8; 8];
    session.send_header(DEV);
    session.send(
        DEV,
        &Packet::MetaLogic(meas_types::MetaLogic {
            num_probes: 8,
            samplerate: 1_000_000,
        }),
    );
    session.send(DEV, &Packet::Logic(Logic::new(4, &samples).unwrap()));
    session.send_end(DEV);

    let expected = ["header", "meta-logic", "logic", "end"];
    assert_eq!(&*seen_a.borrow(), &expected);
    assert_eq!(&*seen_b.borrow(), &expected);

    session.datafeed_unsubscribe(token).unwrap();
    session.send_header(DEV);
    assert_eq!(seen_a.borrow().len(), 4);
    assert_eq!(seen_b.borrow().len(), 5);
    assert!(session.datafeed_unsubscribe(token).is_err());
}

#[test]
fn reentrant_subscriber_is_skipped() {
    let session = Session::new();
    let inner_session = session.clone();
    let reentered = Rc::new(Cell::new(false));
    let flag = reentered.clone();
    let count = Rc::new(Cell::new(0u32));
    let c = count.clone();
    session.datafeed_subscribe(Box::new(move |_, packet| {
        c.set(c.get() + 1);
        if matches!(packet, Packet::Trigger) && !flag.get() {
            flag.set(true);
            // Re-entering send from a subscriber must not call this
            // subscriber again.
            inner_session.send(DEV, &Packet::FrameBegin);
        }
    }));
    session.send(DEV, &Packet::Trigger);
    // Called once for Trigger; the nested FrameBegin send found the
    // subscriber busy and skipped it.
    assert_eq!(count.get(), 1);
}
