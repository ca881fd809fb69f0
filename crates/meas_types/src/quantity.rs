//! Measured quantities, units, and measurement modifier flags.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The physical quantity a measurement describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Mq {
    Voltage,
    Current,
    Resistance,
    Capacitance,
    Temperature,
    Frequency,
    DutyCycle,
    Continuity,
    PulseWidth,
    Conductance,
    Power,
    Gain,
    SoundPressureLevel,
    GasConcentration,
    RelativeHumidity,
}

/// The unit a measurement is expressed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Unit {
    Volt,
    Ampere,
    Ohm,
    Farad,
    Hertz,
    Kelvin,
    Celsius,
    Fahrenheit,
    Percent,
    Second,
    Siemens,
    DecibelMw,
    DecibelVolt,
    DecibelSpl,
    /// Dimensionless reading, e.g. transistor gain.
    Unitless,
    Ratio,
    /// Two-state reading, e.g. continuity or logic level.
    Boolean,
}

/// Modifier flags attached to a measurement, held as a bitset so a reading
/// can carry several at once (e.g. AC | RMS | AUTORANGE).
#[derive(Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MqFlags(u32);

impl MqFlags {
    pub const NONE: MqFlags = MqFlags(0);
    pub const AC: MqFlags = MqFlags(1 << 0);
    pub const DC: MqFlags = MqFlags(1 << 1);
    pub const RMS: MqFlags = MqFlags(1 << 2);
    pub const DIODE: MqFlags = MqFlags(1 << 3);
    pub const HOLD: MqFlags = MqFlags(1 << 4);
    pub const MAX: MqFlags = MqFlags(1 << 5);
    pub const MIN: MqFlags = MqFlags(1 << 6);
    pub const AUTORANGE: MqFlags = MqFlags(1 << 7);
    pub const RELATIVE: MqFlags = MqFlags(1 << 8);
    pub const SPL_FREQ_WEIGHT_A: MqFlags = MqFlags(1 << 9);
    pub const SPL_FREQ_WEIGHT_C: MqFlags = MqFlags(1 << 10);
    pub const SPL_FREQ_WEIGHT_Z: MqFlags = MqFlags(1 << 11);
    pub const SPL_FREQ_WEIGHT_FLAT: MqFlags = MqFlags(1 << 12);
    pub const SPL_TIME_WEIGHT_S: MqFlags = MqFlags(1 << 13);
    pub const SPL_TIME_WEIGHT_F: MqFlags = MqFlags(1 << 14);
    pub const SPL_LAT: MqFlags = MqFlags(1 << 15);
    pub const SPL_PCT_OVER_ALARM: MqFlags = MqFlags(1 << 16);

    pub fn empty() -> MqFlags {
        MqFlags::NONE
    }

    pub fn contains(self, other: MqFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: MqFlags) {
        self.0 |= other.0;
    }

    pub fn bits(self) -> u32 {
        self.0
    }
}

impl std::ops::BitOr for MqFlags {
    type Output = MqFlags;
    fn bitor(self, rhs: MqFlags) -> MqFlags {
        MqFlags(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for MqFlags {
    fn bitor_assign(&mut self, rhs: MqFlags) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for MqFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: &[(u32, &str)] = &[
            (1 << 0, "AC"),
            (1 << 1, "DC"),
            (1 << 2, "RMS"),
            (1 << 3, "DIODE"),
            (1 << 4, "HOLD"),
            (1 << 5, "MAX"),
            (1 << 6, "MIN"),
            (1 << 7, "AUTORANGE"),
            (1 << 8, "RELATIVE"),
            (1 << 9, "SPL_FREQ_WEIGHT_A"),
            (1 << 10, "SPL_FREQ_WEIGHT_C"),
            (1 << 11, "SPL_FREQ_WEIGHT_Z"),
            (1 << 12, "SPL_FREQ_WEIGHT_FLAT"),
            (1 << 13, "SPL_TIME_WEIGHT_S"),
            (1 << 14, "SPL_TIME_WEIGHT_F"),
            (1 << 15, "SPL_LAT"),
            (1 << 16, "SPL_PCT_OVER_ALARM"),
        ];
        let mut first = true;
        for &(bit, name) in NAMES {
            if self.0 & bit != 0 {
                if !first {
                    write!(f, "|")?;
                }
                write!(f, "{}", name)?;
                first = false;
            }
        }
        if first {
            write!(f, "NONE")?;
        }
        Ok(())
    }
}
