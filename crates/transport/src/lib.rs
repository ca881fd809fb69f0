//! Transport primitives the acquisition engines are written against.
//!
//! Engines never talk to an OS serial port or USB stack directly; they hold
//! a boxed [`SerialIo`] or [`UsbIo`] trait object. The concrete adapters
//! (`serialport`-backed, `rusb`-backed) live here too, as does a scripted
//! mock implementation of each trait so every engine can be exercised
//! without hardware.

pub mod conn;
pub mod error;
pub mod mock;
pub mod serial;
pub mod usb;

pub use conn::ConnectionSpec;
pub use error::TransportError;
pub use serial::{SerialIo, SerialParams, SystemSerial};
pub use usb::{RusbEnumerator, UsbDeviceInfo, UsbEnumerator, UsbIo, USB_TIMEOUT};
