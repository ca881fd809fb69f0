//! Serial logic analyzers speaking the SUMP/OLS protocol.
//!
//! Discovery sends a burst of resets followed by an identity request; a
//! device answering `1SLO`/`1ALS` is then asked for its metadata. Capture
//! programming covers the samplerate divider, up to four parallel trigger
//! stages, the capture/delay sizing word and the flag register. Received
//! samples arrive youngest-first, optionally run-length encoded, and are
//! expanded to full 32-bit units before they reach the datafeed.

mod acquisition;
mod driver;
pub mod protocol;

pub use driver::OlsDriver;
