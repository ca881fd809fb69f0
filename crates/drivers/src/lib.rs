//! Hardware backends.
//!
//! Every backend implements the [`Driver`] trait and registers with a
//! [`DriverRegistry`]. Two logic-analyzer engines live here (the serial
//! SUMP/OLS family and the USB DSLogic family) together with the DMM
//! packet-parser framework and its serial engine.

pub mod dmm;
pub mod dslogic;
pub mod ols;
pub mod registry;
pub mod types;

pub use registry::DriverRegistry;
pub use types::{DeviceInfo, Driver, SerialOpener};
