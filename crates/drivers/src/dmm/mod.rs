//! Packet-parser framework for serial multimeters.
//!
//! A [`DmmParser`] knows the fixed frame size of one meter family, how to
//! validate a candidate frame and how to decode it into a [`Reading`].
//! The [`FrameScanner`] slides over the raw byte stream, discarding bytes
//! until a valid frame lines up, so a parser never sees misaligned input.

use std::collections::VecDeque;

use log::debug;

use meas_types::{Mq, MqFlags, Unit};

mod driver;
pub mod rs9lcd;

pub use driver::{rs9lcd_driver, rs9lcd_driver_with_opener, SerialDmmDriver};
pub use rs9lcd::Rs9lcdParser;

/// One decoded measurement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    pub value: f32,
    pub mq: Mq,
    pub unit: Unit,
    pub mqflags: MqFlags,
}

pub trait DmmParser {
    /// Short name, doubling as the driver name.
    fn name(&self) -> &'static str;

    /// Fixed frame length in bytes.
    fn packet_size(&self) -> usize;

    /// Cheap validation of a candidate frame (length, checksum,
    /// indicator consistency). Rejections are debug-logged, never errors.
    fn valid(&self, frame: &[u8]) -> bool;

    /// Decode a frame that passed [`DmmParser::valid`]. `None` means the
    /// frame turned out undecodable after all; the scanner moves on.
    fn parse(&self, frame: &[u8]) -> Option<Reading>;
}

/// Byte-stream scanner delivering aligned, validated readings.
pub struct FrameScanner<P: DmmParser> {
    parser: P,
    buf: VecDeque<u8>,
}

impl<P: DmmParser> FrameScanner<P> {
    pub fn new(parser: P) -> FrameScanner<P> {
        FrameScanner {
            parser,
            buf: VecDeque::new(),
        }
    }

    pub fn parser(&self) -> &P {
        &self.parser
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend(data);
    }

    /// Pull the next decodable reading out of the buffered stream.
    pub fn poll(&mut self) -> Option<Reading> {
        let size = self.parser.packet_size();
        while self.buf.len() >= size {
            let frame: Vec<u8> = self.buf.iter().take(size).copied().collect();
            if self.parser.valid(&frame) {
                self.buf.drain(..size);
                match self.parser.parse(&frame) {
                    Some(reading) => return Some(reading),
                    None => continue,
                }
            }
            // Not a frame boundary; slide one byte and keep looking.
            debug!("{}: discarding byte 0x{:02x}", self.parser.name(), frame[0]);
            self.buf.pop_front();
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::rs9lcd::test_support::dc_volts_frame;
    use super::*;

    #[test]
    fn scanner_skips_garbage_to_frame_boundary() {
        let mut scanner = FrameScanner::new(Rs9lcdParser);
        let frame = dc_volts_frame();
        // Garbage prefix, then a valid frame split across two pushes.
        scanner.push(&[0xde, 0xad]);
        scanner.push(&frame[..5]);
        assert!(scanner.poll().is_none());
        scanner.push(&frame[5..]);
        let reading = scanner.poll().unwrap();
        assert_eq!(reading.mq, Mq::Voltage);
        assert_eq!(reading.value, 0.0);
        assert!(scanner.poll().is_none());
    }

    #[test]
    fn scanner_recovers_after_corrupt_frame() {
        let mut scanner = FrameScanner::new(Rs9lcdParser);
        let mut bad = dc_volts_frame();
        bad[8] ^= 0xff; // break the checksum
        scanner.push(&bad);
        scanner.push(&dc_volts_frame());
        let reading = scanner.poll().unwrap();
        assert_eq!(reading.mq, Mq::Voltage);
    }
}
