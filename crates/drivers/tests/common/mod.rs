//! Shared helpers for the engine scenario tests.

use std::cell::RefCell;
use std::rc::Rc;

use meas_types::{Mq, MqFlags, Packet, Unit};
use session::Session;
use transport::mock::MockSerial;
use transport::SerialIo;

/// Owned copy of a datafeed packet, recorded by a test subscriber.
#[derive(Debug, Clone, PartialEq)]
pub enum Rec {
    Header,
    MetaLogic { num_probes: u16, samplerate: u64 },
    MetaAnalog { num_probes: u16 },
    Logic { unitsize: usize, data: Vec<u8> },
    Analog { mq: Mq, unit: Unit, mqflags: MqFlags, data: Vec<f32> },
    Trigger,
    FrameBegin,
    FrameEnd,
    End,
}

/// Subscribe a recorder to the session and return its log.
pub fn record(session: &Session) -> Rc<RefCell<Vec<Rec>>> {
    let log = Rc::new(RefCell::new(Vec::new()));
    let sink = log.clone();
    session.datafeed_subscribe(Box::new(move |_, packet| {
        let rec = match packet {
            Packet::Header(_) => Rec::Header,
            Packet::MetaLogic(m) => Rec::MetaLogic {
                num_probes: m.num_probes,
                samplerate: m.samplerate,
            },
            Packet::MetaAnalog(m) => Rec::MetaAnalog {
                num_probes: m.num_probes,
            },
            Packet::Logic(l) => Rec::Logic {
                unitsize: l.unitsize(),
                data: l.data().to_vec(),
            },
            Packet::Analog(a) => Rec::Analog {
                mq: a.mq,
                unit: a.unit,
                mqflags: a.mqflags,
                data: a.data.to_vec(),
            },
            Packet::Trigger => Rec::Trigger,
            Packet::FrameBegin => Rec::FrameBegin,
            Packet::FrameEnd => Rec::FrameEnd,
            Packet::End => Rec::End,
        };
        sink.borrow_mut().push(rec);
    }));
    log
}

/// An opener that always hands out clones of one scripted port.
pub fn mock_opener(mock: MockSerial) -> drivers::SerialOpener {
    Box::new(move |_path, _params| Ok(Box::new(mock.clone()) as Box<dyn SerialIo>))
}
