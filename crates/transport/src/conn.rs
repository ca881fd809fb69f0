//! Connection spec parsing.
//!
//! A connection spec names where to look for a device: an OS device path
//! (`/dev/ttyACM0`), a USB bus/address pair in decimal (`3.12`), or a USB
//! VID/PID pair as four hex digits each (`2a0e.0001`).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::TransportError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionSpec {
    Path(String),
    UsbBusAddr { bus: u8, address: u8 },
    UsbVidPid { vid: u16, pid: u16 },
}

impl FromStr for ConnectionSpec {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<ConnectionSpec, TransportError> {
        if s.starts_with('/') {
            return Ok(ConnectionSpec::Path(s.to_string()));
        }
        if let Some((a, b)) = s.split_once('.') {
            // Four hex digits on each side is unambiguously a VID.PID.
            if a.len() == 4 && b.len() == 4 {
                if let (Ok(vid), Ok(pid)) =
                    (u16::from_str_radix(a, 16), u16::from_str_radix(b, 16))
                {
                    return Ok(ConnectionSpec::UsbVidPid { vid, pid });
                }
            }
            if let (Ok(bus), Ok(address)) = (a.parse::<u8>(), b.parse::<u8>()) {
                return Ok(ConnectionSpec::UsbBusAddr { bus, address });
            }
        }
        Err(TransportError::Spec(format!("unparseable connection spec {:?}", s)))
    }
}

impl fmt::Display for ConnectionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionSpec::Path(p) => write!(f, "{}", p),
            ConnectionSpec::UsbBusAddr { bus, address } => write!(f, "{}.{}", bus, address),
            ConnectionSpec::UsbVidPid { vid, pid } => write!(f, "{:04x}.{:04x}", vid, pid),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_path() {
        assert_eq!(
            "/dev/ttyUSB0".parse::<ConnectionSpec>().unwrap(),
            ConnectionSpec::Path("/dev/ttyUSB0".into())
        );
    }

    #[test]
    fn parses_vid_pid() {
        assert_eq!(
            "2a0e.0001".parse::<ConnectionSpec>().unwrap(),
            ConnectionSpec::UsbVidPid { vid: 0x2a0e, pid: 0x0001 }
        );
    }

    #[test]
    fn parses_bus_addr() {
        assert_eq!(
            "3.12".parse::<ConnectionSpec>().unwrap(),
            ConnectionSpec::UsbBusAddr { bus: 3, address: 12 }
        );
    }

    #[test]
    fn rejects_garbage() {
        assert!("not-a-spec".parse::<ConnectionSpec>().is_err());
    }
}
