//! Device identity, lifecycle status, and the probe model.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Error, Result};

/// Probe indices live in `[0, MAX_PROBES)` so a probe set fits a u64 bitset.
pub const MAX_PROBES: usize = 64;

/// Longest accepted probe name, in bytes.
pub const MAX_PROBE_NAME_LEN: usize = 32;

/// Characters allowed in a trigger expression: level, edge, change.
pub const TRIGGER_ALPHABET: &str = "01rfc";

/// Stable identity of a device instance: the owning driver's name plus the
/// driver-local instance index. Identities stay valid for the lifetime of
/// the registry that produced them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceId {
    pub driver: &'static str,
    pub index: usize,
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.driver, self.index)
    }
}

/// Lifecycle of a device instance.
///
/// Inactive → Active on a successful open; Active → Stopping on a stop
/// request; Stopping → Inactive once the end-of-stream has drained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceStatus {
    NotFound,
    Initializing,
    Inactive,
    Active,
    Stopping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProbeKind {
    Logic,
    Analog,
}

/// A single logic or analog input on an instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Probe {
    pub index: usize,
    pub kind: ProbeKind,
    pub enabled: bool,
    pub name: String,
    /// Trigger expression over [`TRIGGER_ALPHABET`]; position = stage.
    pub trigger: Option<String>,
}

impl Probe {
    pub fn new(index: usize, kind: ProbeKind, name: impl Into<String>) -> Result<Probe> {
        let name = name.into();
        if index >= MAX_PROBES {
            return Err(Error::Arg(format!(
                "probe index {} out of range (max {})",
                index,
                MAX_PROBES - 1
            )));
        }
        if name.len() > MAX_PROBE_NAME_LEN {
            return Err(Error::Arg(format!(
                "probe name {:?} longer than {} bytes",
                name, MAX_PROBE_NAME_LEN
            )));
        }
        Ok(Probe {
            index,
            kind,
            enabled: true,
            name,
            trigger: None,
        })
    }

    pub fn logic(index: usize, name: impl Into<String>) -> Result<Probe> {
        Probe::new(index, ProbeKind::Logic, name)
    }

    pub fn analog(index: usize, name: impl Into<String>) -> Result<Probe> {
        Probe::new(index, ProbeKind::Analog, name)
    }
}

/// Validate a trigger expression: every character must be in the trigger
/// alphabet and the stage count (string length) must not exceed the
/// driver's limit.
pub fn validate_trigger(expr: &str, max_stages: usize) -> Result<()> {
    if expr.len() > max_stages {
        return Err(Error::Arg(format!(
            "trigger expression {:?} uses {} stages, driver supports {}",
            expr,
            expr.len(),
            max_stages
        )));
    }
    for ch in expr.chars() {
        if !TRIGGER_ALPHABET.contains(ch) {
            return Err(Error::Arg(format!(
                "invalid trigger character {:?} (allowed: {})",
                ch, TRIGGER_ALPHABET
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_bounds() {
        assert!(Probe::logic(0, "0").is_ok());
        assert!(Probe::logic(63, "63").is_ok());
        assert!(Probe::logic(64, "64").is_err());
        assert!(Probe::logic(0, "x".repeat(33)).is_err());
    }

    #[test]
    fn trigger_validation() {
        assert!(validate_trigger("01rfc", 5).is_ok());
        assert!(validate_trigger("", 4).is_ok());
        assert!(validate_trigger("01x", 4).is_err());
        assert!(validate_trigger("00000", 4).is_err());
    }
}
