//! Leaf types shared by the whole acquisition stack: the datafeed packet
//! model, measured quantities and units, probes and device identity, and
//! the library-wide error type.

pub mod config;
pub mod device;
pub mod error;
pub mod packet;
pub mod quantity;
pub mod rational;

pub use config::{ConfigKey, ConfigValue, InfoId, InfoValue, Samplerates, ScanOption, ScanOptionKey};
pub use device::{DeviceId, DeviceStatus, Probe, ProbeKind, MAX_PROBES, MAX_PROBE_NAME_LEN};
pub use error::{Error, Result};
pub use packet::{Analog, Header, Logic, MetaAnalog, MetaLogic, Packet, FEED_VERSION};
pub use quantity::{Mq, MqFlags, Unit};
pub use rational::Rational;
