//! This module is used to define the registers on the RD60xx PSUs.

use serde::Serialize;
use strum_macros::EnumIter;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u16)]
pub enum RdRegister {
    /// __R__ - Product model, `VVCCR` (voltage, current rating, hardware revision).
    Model = 0,
    /// __R__ - Serial number, upper 16 bits.
    SerialHigh = 1,
    /// __R__ - Serial number, lower 16 bits.
    SerialLow = 2,
    /// __R__ - Firmware version number.
    ///
    /// Decimal value of `141` -> `1.41`.
    Firmware = 3,
    /// __R__ - Internal temperature sign.
    /// * `0` - Positive.
    /// * `1` - Negative.
    TempCelsiusSign = 4,
    /// __R__ - Internal temperature magnitude in degrees celsius.
    TempCelsius = 5,
    /// __R__ - Internal temperature sign (fahrenheit).
    TempFahrenheitSign = 6,
    /// __R__ - Internal temperature magnitude in degrees fahrenheit.
    TempFahrenheit = 7,
    /// __R/W__ - Voltage setting.
    VSet = 8,
    /// __R/W__ - Current setting.
    ISet = 9,
    /// __R__ - Output voltage display value.
    VOut = 10,
    /// __R__ - Output current display value.
    IOut = 11,
    /// __R__ - Output power display value, upper 16 bits.
    PowerHigh = 12,
    /// __R__ - Output power display value, lower 16 bits.
    PowerLow = 13,
    /// __R__ - Input voltage display value.
    VIn = 14,
    /// __R/W__ - Key lock.
    KeypadLock = 15,
    /// __R__ - Protect status.
    ///
    /// See [`ProtectionStatus`] for possible protection statuses.
    Protect = 16,
    /// __R__ - Constant voltage constant current state.
    ///
    /// See [`OutputMode`].
    CvCc = 17,
    /// __R/W__ - Switched output.
    /// * `0` - Off.
    /// * `1` - On.
    OutputEnable = 18,
    /// __R/W__ - Quickly call up a preset group (0 - 9).
    Preset = 19,
    /// __R__ - Current range on models with a switchable range.
    /// * `0` - Low range, one extra decimal place.
    /// * `1` - High range.
    CurrentRange = 20,
    /// __R__ - Battery charging mode active.
    BatteryMode = 32,
    /// __R__ - Battery voltage.
    BatteryVoltage = 33,
    /// __R__ - External temperature sign.
    ExtTempCelsiusSign = 34,
    /// __R__ - External temperature magnitude in degrees celsius.
    ExtTempCelsius = 35,
    /// __R__ - External temperature sign (fahrenheit).
    ExtTempFahrenheitSign = 36,
    /// __R__ - External temperature magnitude in degrees fahrenheit.
    ExtTempFahrenheit = 37,
    /// __R__ - Battery capacity, upper 16 bits.
    BatteryAhHigh = 38,
    /// __R__ - Battery capacity, lower 16 bits.
    BatteryAhLow = 39,
    /// __R__ - Battery energy, upper 16 bits.
    BatteryWhHigh = 40,
    /// __R__ - Battery energy, lower 16 bits.
    BatteryWhLow = 41,
    /// __R/W__ - Clock year. Followed by month, day, hour, minute, second.
    Year = 48,
    Month = 49,
    Day = 50,
    Hour = 51,
    Minute = 52,
    Second = 53,
}

impl From<RdRegister> for u16 {
    fn from(value: RdRegister) -> Self {
        value as u16
    }
}

/// A contiguous run of holding registers read in one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterBlock {
    pub start: u16,
    pub count: u16,
}

impl RegisterBlock {
    pub const fn new(start: u16, count: u16) -> Self {
        Self { start, count }
    }

    /// Fetch `register` out of a response for this block.
    ///
    /// Callers check the response length with [`Self::check`] first, so a miss
    /// here means the register lies outside the block.
    pub fn get(&self, registers: &[u16], register: impl Into<u16>) -> u16 {
        let address: u16 = register.into();
        let index = address.wrapping_sub(self.start) as usize;
        registers.get(index).copied().unwrap_or_default()
    }

    /// Assemble a 32-bit value from a `(hi, lo)` register pair.
    pub fn get_u32(
        &self,
        registers: &[u16],
        high: impl Into<u16>,
        low: impl Into<u16>,
    ) -> u32 {
        combine_u32(self.get(registers, high), self.get(registers, low))
    }

    /// Decode a sign + magnitude register pair.
    pub fn get_signed(
        &self,
        registers: &[u16],
        sign: impl Into<u16>,
        magnitude: impl Into<u16>,
    ) -> i32 {
        signed_magnitude(self.get(registers, sign), self.get(registers, magnitude))
    }

    /// Reject responses carrying the wrong number of registers.
    pub fn check(&self, registers: &[u16]) -> crate::error::Result<()> {
        if registers.len() != self.count as usize {
            return Err(crate::error::Error::RegisterCount {
                expected: self.count as usize,
                actual: registers.len(),
            });
        }
        Ok(())
    }
}

/// Everything from MODEL up to the last battery register, polled each cycle.
pub const STATUS_BLOCK: RegisterBlock =
    RegisterBlock::new(RdRegister::Model as u16, RdRegister::BatteryWhLow as u16 + 1);

/// Model, serial and firmware; enough to work out who connected.
pub const IDENTITY_BLOCK: RegisterBlock =
    RegisterBlock::new(RdRegister::Model as u16, RdRegister::Firmware as u16 + 1);

/// Join a `(hi, lo)` register pair.
pub const fn combine_u32(high: u16, low: u16) -> u32 {
    ((high as u32) << 16) | low as u32
}

/// Temperatures come as a sign register (`1` = negative) and a magnitude.
pub const fn signed_magnitude(sign: u16, magnitude: u16) -> i32 {
    if sign == 1 {
        -(magnitude as i32)
    } else {
        magnitude as i32
    }
}

/// The raw MODEL register value, e.g. `60301`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct ModelNumber(pub u16);

impl ModelNumber {
    /// Model with the trailing hardware revision digit removed, e.g. `6030`.
    pub const fn excluding_revision(&self) -> u16 {
        self.0 / 10
    }
}

impl core::fmt::Display for ModelNumber {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "RD{}", self.excluding_revision())
    }
}

/// "Protection status register".
#[derive(Debug, EnumIter, PartialEq, Eq, Clone, Copy, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtectionStatus {
    /// 0: No protection tripped.
    Normal,
    /// 1: OVP overvoltage protection.
    Ovp,
    /// 2: OCP overcurrent protection.
    Ocp,
    /// Anything else.
    Unknown,
}

impl From<u16> for ProtectionStatus {
    fn from(value: u16) -> Self {
        match value {
            0 => Self::Normal,
            1 => Self::Ovp,
            2 => Self::Ocp,
            _ => Self::Unknown,
        }
    }
}

/// Represents the two possible power supply control modes.
#[derive(Debug, EnumIter, PartialEq, Eq, Clone, Copy, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    /// Constant voltage regulation mode.
    Cv,
    /// Constant current regulation mode.
    Cc,
    Unknown,
}

impl From<u16> for OutputMode {
    fn from(value: u16) -> Self {
        match value {
            0x00 => Self::Cv,
            0x01 => Self::Cc,
            _ => Self::Unknown,
        }
    }
}
