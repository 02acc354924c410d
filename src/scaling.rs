//! Scaling factors for different PSU models
//!
//! Different RD60xx models report voltage, current and power with a different number
//! of decimal places. Raw register values are divided by the scale to get volts, amps
//! and watts. Each quantity has a default, an override keyed on the full model number
//! (hardware revision included) and an override keyed on the model without its revision
//! digit. The full model wins over the revision-less one.

use crate::error::{Error, Result};
use crate::register::ModelNumber;

/// Scale used when no override matches.
pub const DEFAULT_VOLTAGE_SCALE: f64 = 100.0;
pub const DEFAULT_CURRENT_SCALE: f64 = 100.0;
pub const DEFAULT_POWER_SCALE: f64 = 100.0;

/// Firmware register holds the version times 100.
pub const FIRMWARE_SCALE: f64 = 100.0;

/// Battery Ah / Wh counters are in thousandths.
pub const BATTERY_SCALE: f64 = 1000.0;

/// Overrides keyed on the full MODEL register value.
const VOLTAGE_BY_MODEL: &[(u16, f64)] = &[(60065, 1000.0), (60125, 1000.0)];
const CURRENT_BY_MODEL: &[(u16, f64)] = &[(60065, 10000.0), (60125, 1000.0)];
const POWER_BY_MODEL: &[(u16, f64)] = &[(60065, 1000.0), (60125, 1000.0)];

/// Overrides keyed on the model with the hardware revision removed.
const VOLTAGE_BY_FAMILY: &[(u16, f64)] = &[];
// Confirmed on an RD6006.
const CURRENT_BY_FAMILY: &[(u16, f64)] = &[(6006, 1000.0)];
const POWER_BY_FAMILY: &[(u16, f64)] = &[];

/// Models whose current resolution follows the CURRENT_RANGE register.
const SWITCHABLE_CURRENT_RANGE: &[u16] = &[60125];

/// Scaling factors for converting raw register values to standard units
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScalingFactors {
    /// Divisor taking raw voltage registers to volts.
    pub voltage: f64,
    /// Divisor taking raw current registers to amps.
    pub current: f64,
    /// Divisor taking raw power registers to watts.
    pub power: f64,
}

impl Default for ScalingFactors {
    fn default() -> Self {
        Self {
            voltage: DEFAULT_VOLTAGE_SCALE,
            current: DEFAULT_CURRENT_SCALE,
            power: DEFAULT_POWER_SCALE,
        }
    }
}

fn lookup(model: ModelNumber, by_model: &[(u16, f64)], by_family: &[(u16, f64)], default: f64) -> f64 {
    let find = |table: &[(u16, f64)], key: u16| {
        table
            .iter()
            .find(|(entry, _)| *entry == key)
            .map(|(_, scale)| *scale)
    };

    find(by_model, model.0)
        .or_else(|| find(by_family, model.excluding_revision()))
        .unwrap_or(default)
}

/// Whether this model switches current resolution at run time.
pub fn has_switchable_current_range(model: ModelNumber) -> bool {
    SWITCHABLE_CURRENT_RANGE.contains(&model.0)
}

impl ScalingFactors {
    /// Create a new `ScalingFactors` instance with the specified divisors.
    pub const fn new(voltage: f64, current: f64, power: f64) -> Self {
        Self {
            voltage,
            current,
            power,
        }
    }

    /// Get scaling factors for a product model.
    ///
    /// `current_range` is the live CURRENT_RANGE register. It only matters for models with
    /// a switchable range, where `0` selects the low range and adds a decimal place.
    pub fn for_model(model: ModelNumber, current_range: Option<u16>) -> Self {
        let voltage = lookup(model, VOLTAGE_BY_MODEL, VOLTAGE_BY_FAMILY, DEFAULT_VOLTAGE_SCALE);
        let mut current = lookup(model, CURRENT_BY_MODEL, CURRENT_BY_FAMILY, DEFAULT_CURRENT_SCALE);
        let power = lookup(model, POWER_BY_MODEL, POWER_BY_FAMILY, DEFAULT_POWER_SCALE);

        if has_switchable_current_range(model) && current_range == Some(0) {
            current *= 10.0;
        }

        Self {
            voltage,
            current,
            power,
        }
    }

    /// Convert raw voltage register value to volts
    #[inline]
    pub fn raw_to_voltage(&self, raw: u16) -> f64 {
        raw as f64 / self.voltage
    }

    /// Convert volts to raw voltage register value, truncating toward zero.
    #[inline]
    pub fn voltage_to_raw(&self, volts: f64) -> Result<u16> {
        to_register(volts, self.voltage)
    }

    /// Convert raw current register value to amps
    #[inline]
    pub fn raw_to_current(&self, raw: u16) -> f64 {
        raw as f64 / self.current
    }

    /// Convert amps to raw current register value, truncating toward zero.
    #[inline]
    pub fn current_to_raw(&self, amps: f64) -> Result<u16> {
        to_register(amps, self.current)
    }

    /// Convert a raw 32-bit power value to watts
    #[inline]
    pub fn raw_to_power(&self, raw: u32) -> f64 {
        raw as f64 / self.power
    }
}

/// `int(value * scale)`, refusing anything that does not fit a register.
fn to_register(value: f64, scale: f64) -> Result<u16> {
    let scaled = (value * scale).trunc();
    if !scaled.is_finite() || scaled < 0.0 || scaled > u16::MAX as f64 {
        return Err(Error::InvalidRange);
    }
    Ok(scaled as u16)
}
