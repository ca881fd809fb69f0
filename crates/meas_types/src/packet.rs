//! The datafeed packet model.
//!
//! Packets flow from an acquisition engine to session subscribers. Payload
//! slices borrow the engine's internal buffer and are only valid for the
//! duration of the subscriber callback; a subscriber that needs to retain
//! sample data must copy it.

use std::time::SystemTime;

use crate::error::{Error, Result};
use crate::quantity::{Mq, MqFlags, Unit};

/// Version of the datafeed packet protocol carried in every [`Header`].
pub const FEED_VERSION: u32 = 1;

/// First packet of every session stream.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Header {
    pub feed_version: u32,
    pub start_time: SystemTime,
}

impl Header {
    pub fn new() -> Header {
        Header {
            feed_version: FEED_VERSION,
            start_time: SystemTime::now(),
        }
    }
}

impl Default for Header {
    fn default() -> Header {
        Header::new()
    }
}

/// Describes the logic stream that follows, sent once per change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetaLogic {
    pub num_probes: u16,
    pub samplerate: u64,
}

/// Describes the analog stream that follows, sent once per change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetaAnalog {
    pub num_probes: u16,
}

/// A block of packed parallel logic samples.
///
/// Each sample is `unitsize` bytes wide; bit `i` of a sample is the state of
/// the probe with index `i`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Logic<'a> {
    unitsize: usize,
    data: &'a [u8],
}

impl<'a> Logic<'a> {
    /// Wrap a packed sample buffer. `unitsize` must be 1, 2, 4 or 8 and
    /// must divide the buffer length.
    pub fn new(unitsize: usize, data: &'a [u8]) -> Result<Logic<'a>> {
        if !matches!(unitsize, 1 | 2 | 4 | 8) {
            return Err(Error::Arg(format!("invalid logic unitsize {}", unitsize)));
        }
        if data.len() % unitsize != 0 {
            return Err(Error::Arg(format!(
                "logic payload length {} not a multiple of unitsize {}",
                data.len(),
                unitsize
            )));
        }
        Ok(Logic { unitsize, data })
    }

    pub fn unitsize(&self) -> usize {
        self.unitsize
    }

    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    pub fn sample_count(&self) -> usize {
        self.data.len() / self.unitsize
    }
}

/// A block of analog samples for one measured quantity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Analog<'a> {
    pub mq: Mq,
    pub unit: Unit,
    pub mqflags: MqFlags,
    pub data: &'a [f32],
}

/// The datafeed packet stream.
///
/// Per device, a session emits exactly one `Header` first and exactly one
/// `End` last; `Logic`/`Analog` blocks are preceded by the matching meta
/// packet whenever the stream parameters change.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Packet<'a> {
    Header(Header),
    MetaLogic(MetaLogic),
    MetaAnalog(MetaAnalog),
    Logic(Logic<'a>),
    Analog(Analog<'a>),
    /// Marks the trigger sample boundary in the surrounding logic stream.
    Trigger,
    FrameBegin,
    FrameEnd,
    /// Session terminator; no packet follows.
    End,
}

impl Packet<'_> {
    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Packet::Header(_) => "header",
            Packet::MetaLogic(_) => "meta-logic",
            Packet::MetaAnalog(_) => "meta-analog",
            Packet::Logic(_) => "logic",
            Packet::Analog(_) => "analog",
            Packet::Trigger => "trigger",
            Packet::FrameBegin => "frame-begin",
            Packet::FrameEnd => "frame-end",
            Packet::End => "end",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logic_unitsize_must_divide_length() {
        let buf = [0u8; 12];
        assert!(Logic::new(4, &buf).is_ok());
        assert_eq!(Logic::new(4, &buf).unwrap().sample_count(), 3);
        assert!(matches!(Logic::new(8, &buf), Err(Error::Arg(_))));
    }

    #[test]
    fn logic_unitsize_is_restricted() {
        let buf = [0u8; 6];
        assert!(matches!(Logic::new(3, &buf), Err(Error::Arg(_))));
        assert!(Logic::new(2, &buf).is_ok());
        assert!(Logic::new(1, &buf).is_ok());
    }
}
