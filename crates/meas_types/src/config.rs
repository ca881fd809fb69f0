//! Configuration keys, values, scan options and info queries: the
//! capability surface every driver speaks.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::rational::Rational;

/// A capability a driver may support through `config_set`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConfigKey {
    Samplerate,
    /// Fraction of captured samples preceding the trigger, 0..=100.
    CaptureRatio,
    LimitSamples,
    LimitMsec,
    LimitFrames,
    Continuous,
    Rle,
    /// Sample on an external clock input instead of the internal clock.
    ExternalClock,
    TriggerSlope,
    TriggerSource,
    HorizTriggerPos,
    BufferSize,
    TimeBase,
    Filter,
    Vdiv,
    Coupling,
    PatternMode,
    /// Logic input threshold voltage, for dual-range frontends.
    VoltageThreshold,
    SessionFile,
    CaptureFile,
    CaptureUnitSize,
    CaptureNumProbes,
}

/// A value handed to `config_set`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ConfigValue {
    U64(u64),
    Bool(bool),
    Float(f64),
    Str(String),
    Rational(Rational),
}

impl ConfigValue {
    pub fn as_u64(&self) -> Result<u64> {
        match self {
            ConfigValue::U64(v) => Ok(*v),
            other => Err(Error::Arg(format!("expected integer value, got {:?}", other))),
        }
    }

    pub fn as_bool(&self) -> Result<bool> {
        match self {
            ConfigValue::Bool(v) => Ok(*v),
            other => Err(Error::Arg(format!("expected bool value, got {:?}", other))),
        }
    }

    pub fn as_str(&self) -> Result<&str> {
        match self {
            ConfigValue::Str(v) => Ok(v),
            other => Err(Error::Arg(format!("expected string value, got {:?}", other))),
        }
    }

    pub fn as_f64(&self) -> Result<f64> {
        match self {
            ConfigValue::Float(v) => Ok(*v),
            other => Err(Error::Arg(format!("expected float value, got {:?}", other))),
        }
    }
}

/// Options accepted by `Driver::scan`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ScanOption {
    /// Where to look: an OS device path, `<bus>.<addr>` or `<vid>.<pid>`.
    Connection(String),
    /// Serial line parameters, e.g. `9600/8n1`.
    SerialComm(String),
    ModelHint(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanOptionKey {
    Connection,
    SerialComm,
    ModelHint,
}

impl ScanOption {
    pub fn key(&self) -> ScanOptionKey {
        match self {
            ScanOption::Connection(_) => ScanOptionKey::Connection,
            ScanOption::SerialComm(_) => ScanOptionKey::SerialComm,
            ScanOption::ModelHint(_) => ScanOptionKey::ModelHint,
        }
    }
}

/// Identifies an `info_get` query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InfoId {
    SupportedOptions,
    SupportedCaps,
    ProbeCount,
    ProbeNames,
    Samplerates,
    TriggerAlphabet,
    CurrentSamplerate,
    Patterns,
    BufferSizes,
    TimeBases,
    TriggerSources,
    Filters,
    Vdivs,
    Coupling,
}

/// Samplerate discovery answer: either a stepped range or an enumerated
/// list, never both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Samplerates {
    /// All of `low`, `high` and `step` are nonzero.
    Range { low: u64, high: u64, step: u64 },
    List(Vec<u64>),
}

/// Answer to an `info_get` query.
#[derive(Debug, Clone, PartialEq)]
pub enum InfoValue {
    ScanKeys(Vec<ScanOptionKey>),
    Caps(Vec<ConfigKey>),
    U64(u64),
    Str(String),
    Strings(Vec<String>),
    U64List(Vec<u64>),
    Samplerates(Samplerates),
    Rationals(Vec<Rational>),
}

impl InfoValue {
    pub fn as_u64(&self) -> Result<u64> {
        match self {
            InfoValue::U64(v) => Ok(*v),
            other => Err(Error::Arg(format!("expected integer info value, got {:?}", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_accessors() {
        assert_eq!(ConfigValue::U64(7).as_u64().unwrap(), 7);
        assert!(ConfigValue::Bool(true).as_u64().is_err());
        assert_eq!(ConfigValue::Str("9600/8n1".into()).as_str().unwrap(), "9600/8n1");
    }

    #[test]
    fn scan_option_keys() {
        assert_eq!(
            ScanOption::Connection("/dev/ttyUSB0".into()).key(),
            ScanOptionKey::Connection
        );
        assert_eq!(
            ScanOption::SerialComm("115200/8n1".into()).key(),
            ScanOptionKey::SerialComm
        );
    }
}
