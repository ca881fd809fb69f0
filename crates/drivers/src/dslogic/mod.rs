//! DreamSourceLab DSLogic-family USB logic analyzers.
//!
//! A freshly attached device runs only its FX2 boot code; the driver
//! uploads the application firmware, waits out renumeration, then loads
//! the model-specific FPGA bitstream on open. Acquisition programs the
//! FPGA through a framed configuration structure, streams samples over a
//! bulk IN endpoint with several transfers in flight, and applies the
//! software trigger on width-expanded samples.

mod acquisition;
mod driver;
pub mod profile;
pub mod protocol;

pub use driver::{DslogicDriver, FirmwareSource};
