//! SUMP/OLS wire protocol: command opcodes, flag-register bits, parameter
//! encoding and the metadata frame parser.

use std::time::Duration;

use byteorder::{BigEndian, ByteOrder};
use log::{debug, info, warn};

use transport::{SerialIo, TransportError};

/// Short (single-byte) commands.
pub const CMD_RESET: u8 = 0x00;
pub const CMD_RUN: u8 = 0x01;
pub const CMD_ID: u8 = 0x02;
pub const CMD_METADATA: u8 = 0x04;

/// Long commands: opcode plus four data bytes.
pub const CMD_SET_DIVIDER: u8 = 0x80;
pub const CMD_CAPTURE_SIZE: u8 = 0x81;
pub const CMD_SET_FLAGS: u8 = 0x82;

const CMD_SET_TRIGGER_MASK: u8 = 0xc0;
const CMD_SET_TRIGGER_VALUE: u8 = 0xc1;
const CMD_SET_TRIGGER_CONFIG: u8 = 0xc2;

/// Flag-register bits.
pub const FLAG_DEMUX: u16 = 1 << 0;
pub const FLAG_FILTER: u16 = 1 << 1;
/// Channel-group disable bits occupy positions 2..=5; a set bit turns the
/// group off.
pub const FLAG_CLOCK_EXTERNAL: u16 = 1 << 6;
pub const FLAG_RLE: u16 = 1 << 8;
pub const FLAG_EXTERNAL_TEST: u16 = 1 << 10;
pub const FLAG_INTERNAL_TEST: u16 = 1 << 11;

/// The identity strings an OLS-family device answers with.
pub const ID_SUMP: &[u8; 4] = b"1SLO";
pub const ID_OLS: &[u8; 4] = b"1ALS";

/// Fixed input clock of the capture engine.
pub const CLOCK_RATE: u64 = 100_000_000;

/// Hardware trigger stages.
pub const NUM_TRIGGER_STAGES: usize = 4;

/// Smallest accepted sample limit.
pub const MIN_NUM_SAMPLES: u64 = 4;

/// How long the device gets to answer an identity or metadata request.
pub const PROBE_TIMEOUT: Duration = Duration::from_millis(10);

pub fn trigger_mask_cmd(stage: usize) -> u8 {
    CMD_SET_TRIGGER_MASK + (stage as u8) * 4
}

pub fn trigger_value_cmd(stage: usize) -> u8 {
    CMD_SET_TRIGGER_VALUE + (stage as u8) * 4
}

pub fn trigger_config_cmd(stage: usize) -> u8 {
    CMD_SET_TRIGGER_CONFIG + (stage as u8) * 4
}

/// Marks the final trigger stage ("start capture here").
pub const TRIGGER_START: u32 = 0x08;

/// The device consumes its 32-bit parameters big-endian but expects them
/// on the wire byte-reversed from host order, so a word is sent low byte
/// first.
pub fn reversed_word(value: u32) -> [u8; 4] {
    let mut buf = [0u8; 4];
    byteorder::LittleEndian::write_u32(&mut buf, value);
    buf
}

/// The capture-size word travels half-word swapped: the 16-bit readcount
/// field first, then the 16-bit delaycount field, each low byte first.
pub fn capture_size_word(readcount: u32, delaycount: u32) -> [u8; 4] {
    let rc = (readcount.saturating_sub(1) & 0xffff) as u16;
    let dc = (delaycount.saturating_sub(1) & 0xffff) as u16;
    [rc as u8, (rc >> 8) as u8, dc as u8, (dc >> 8) as u8]
}

pub fn send_shortcommand(
    serial: &mut dyn SerialIo,
    command: u8,
) -> Result<(), TransportError> {
    serial.write_all(&[command])
}

pub fn send_longcommand(
    serial: &mut dyn SerialIo,
    command: u8,
    data: [u8; 4],
) -> Result<(), TransportError> {
    let frame = [command, data[0], data[1], data[2], data[3]];
    serial.write_all(&frame)
}

/// Everything a metadata frame can report.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Metadata {
    pub device_name: Option<String>,
    pub fpga_version: Option<String>,
    pub ancillary_version: Option<String>,
    pub probe_count: Option<u16>,
    /// Sample memory, in bytes.
    pub sample_memory: Option<u32>,
    pub max_samplerate: Option<u64>,
    pub protocol_version: Option<u8>,
}

fn read_exact_timeout(
    serial: &mut dyn SerialIo,
    buf: &mut [u8],
) -> Result<bool, TransportError> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = serial.read_timeout(&mut buf[filled..], PROBE_TIMEOUT)?;
        if n == 0 {
            return Ok(false);
        }
        filled += n;
    }
    Ok(true)
}

fn read_string(serial: &mut dyn SerialIo) -> Result<Option<String>, TransportError> {
    // NUL-terminated UTF-8; cap the length so a stuck device cannot make
    // us read forever.
    const MAX_LEN: usize = 256;
    let mut out = Vec::new();
    loop {
        let mut byte = [0u8; 1];
        if !read_exact_timeout(serial, &mut byte)? {
            return Ok(None);
        }
        if byte[0] == 0 {
            break;
        }
        if out.len() >= MAX_LEN {
            warn!("metadata string exceeds {} bytes, truncating", MAX_LEN);
            break;
        }
        out.push(byte[0]);
    }
    Ok(Some(String::from_utf8_lossy(&out).into_owned()))
}

/// Read and parse a metadata frame. Returns Ok(None) when the device sends
/// nothing at all within the probe timeout, meaning it predates the
/// metadata command.
pub fn read_metadata(serial: &mut dyn SerialIo) -> Result<Option<Metadata>, TransportError> {
    let mut meta = Metadata::default();
    let mut first = true;
    loop {
        let mut key = [0u8; 1];
        if !read_exact_timeout(serial, &mut key)? {
            if first {
                return Ok(None);
            }
            warn!("metadata frame ended without terminator");
            return Ok(Some(meta));
        }
        first = false;
        let key = key[0];
        if key == 0x00 {
            debug!("metadata key 0x00, end of frame");
            return Ok(Some(meta));
        }
        let token = key & 0x1f;
        match key >> 5 {
            0 => {
                let Some(value) = read_string(serial)? else {
                    warn!("metadata string for key 0x{:02x} timed out", key);
                    return Ok(Some(meta));
                };
                debug!("metadata key 0x{:02x}: {:?}", key, value);
                match token {
                    0x01 => meta.device_name = Some(value),
                    0x02 => meta.fpga_version = Some(value),
                    0x03 => meta.ancillary_version = Some(value),
                    _ => info!("unknown metadata string token 0x{:02x}: {:?}", token, value),
                }
            }
            1 => {
                let mut buf = [0u8; 4];
                if !read_exact_timeout(serial, &mut buf)? {
                    warn!("metadata integer for key 0x{:02x} timed out", key);
                    return Ok(Some(meta));
                }
                let value = BigEndian::read_u32(&buf);
                debug!("metadata key 0x{:02x}: {}", key, value);
                match token {
                    0x00 => meta.probe_count = Some(value.min(u16::MAX as u32) as u16),
                    0x01 => meta.sample_memory = Some(value),
                    0x02 => debug!("device reports {} bytes of dynamic memory", value),
                    0x03 => meta.max_samplerate = Some(value as u64),
                    0x04 => meta.protocol_version = Some(value as u8),
                    _ => info!("unknown metadata integer token 0x{:02x}: {}", token, value),
                }
            }
            2 => {
                let mut buf = [0u8; 1];
                if !read_exact_timeout(serial, &mut buf)? {
                    warn!("metadata byte for key 0x{:02x} timed out", key);
                    return Ok(Some(meta));
                }
                debug!("metadata key 0x{:02x}: {}", key, buf[0]);
                match token {
                    0x00 => meta.probe_count = Some(buf[0] as u16),
                    0x01 => meta.protocol_version = Some(buf[0]),
                    _ => info!("unknown metadata byte token 0x{:02x}: {}", token, buf[0]),
                }
            }
            t => {
                // Unknown key types have an unknown payload length; there
                // is no way to resynchronize, so stop here.
                warn!("unknown metadata key type {} (key 0x{:02x}), giving up", t, key);
                return Ok(Some(meta));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use transport::mock::MockSerial;

    #[test]
    fn word_encoding_is_byte_reversed() {
        assert_eq!(reversed_word(0x1234_5678), [0x78, 0x56, 0x34, 0x12]);
    }

    #[test]
    fn capture_size_is_half_word_swapped() {
        // readcount 0x0102, delaycount 0x0304, both sent minus one.
        assert_eq!(capture_size_word(0x0103, 0x0305), [0x02, 0x01, 0x04, 0x03]);
    }

    #[test]
    fn trigger_command_stride() {
        assert_eq!(trigger_mask_cmd(0), 0xc0);
        assert_eq!(trigger_value_cmd(1), 0xc5);
        assert_eq!(trigger_config_cmd(3), 0xce);
    }

    #[test]
    fn metadata_parse_name_and_memory() {
        let mock = MockSerial::new();
        // String token 1 "DEV", then type-1 token-1 (sample memory) = 32,
        // then the terminator.
        mock.push_input(&[0x01, b'D', b'E', b'V', 0x00, 0x21, 0x00, 0x00, 0x00, 0x20, 0x00]);
        let mut io: Box<dyn SerialIo> = Box::new(mock);
        let meta = read_metadata(io.as_mut()).unwrap().unwrap();
        assert_eq!(meta.device_name.as_deref(), Some("DEV"));
        assert_eq!(meta.sample_memory, Some(32));
        assert_eq!(meta.probe_count, None);
    }

    #[test]
    fn metadata_short_tokens() {
        let mock = MockSerial::new();
        // Type-2 token-0: probe count 8; type-2 token-1: protocol version 2.
        mock.push_input(&[0x40, 0x08, 0x41, 0x02, 0x00]);
        let mut io: Box<dyn SerialIo> = Box::new(mock);
        let meta = read_metadata(io.as_mut()).unwrap().unwrap();
        assert_eq!(meta.probe_count, Some(8));
        assert_eq!(meta.protocol_version, Some(2));
    }

    #[test]
    fn metadata_silence_means_no_metadata() {
        let mock = MockSerial::new();
        let mut io: Box<dyn SerialIo> = Box::new(mock);
        assert_eq!(read_metadata(io.as_mut()).unwrap(), None);
    }

    #[test]
    fn metadata_unknown_tokens_are_skipped() {
        let mock = MockSerial::new();
        // Unknown string token 0x04, then a known byte token.
        mock.push_input(&[0x04, b'x', 0x00, 0x40, 0x10, 0x00]);
        let mut io: Box<dyn SerialIo> = Box::new(mock);
        let meta = read_metadata(io.as_mut()).unwrap().unwrap();
        assert_eq!(meta.probe_count, Some(16));
    }
}
