use serde::Serialize;
use strum::EnumCount;
use strum_macros::EnumCount as EnumCountMacro;
use tokio::time::{Duration, Instant};

use crate::{
    error::Result,
    register::RegisterBlock,
    scaling::ScalingFactors,
};

/// The base address of the first preset registers.
///
/// Base address of preset = PRESET_OFFSET + {group number} * [`PresetOffsets::COUNT`].
///
/// There are 10 groups: M0 - M9. M0 holds the live settings.
pub const PRESET_OFFSET: u16 = 80;

/// Number of preset groups on the device.
pub const PRESET_GROUPS: u16 = 10;

/// To save querying the PSU too much, presets are only re-read this often.
pub const PRESET_REFRESH_INTERVAL: Duration = Duration::from_secs(5);

/// These are the offsets from the base address of each preset group.
///
/// See [`PRESET_OFFSET`] for calculating the base address of any group.
#[derive(Debug, Copy, Clone, EnumCountMacro, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u16)]
pub enum PresetOffsets {
    /// __R/W__ - Voltage setting.
    VSet = 0x00,
    /// __R/W__ - Current setting.
    ISet = 0x01,
    /// __R/W__ - Over voltage protection.
    SOvp = 0x02,
    /// __R/W__ - Over current protection.
    SOcp = 0x03,
}

impl PresetOffsets {
    /// Return the address of this register provided the group number (0 - 9).
    pub fn address_in_group(&self, group: u16) -> u16 {
        PRESET_OFFSET + (group * PresetOffsets::COUNT as u16) + *self as u16
    }
}

/// All ten preset groups, read in one request.
pub const PRESET_BLOCK: RegisterBlock =
    RegisterBlock::new(PRESET_OFFSET, PRESET_GROUPS * PresetOffsets::COUNT as u16);

/// M0 OVP and OCP, which are the active protection limits.
pub const PROTECTION_BLOCK: RegisterBlock = RegisterBlock::new(PRESET_OFFSET + PresetOffsets::SOvp as u16, 2);

/// One stored (voltage, current, OVP, OCP) profile in physical units.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Preset {
    #[serde(rename = "v")]
    pub voltage: f64,
    #[serde(rename = "c")]
    pub current: f64,
    pub ovp: f64,
    pub ocp: f64,
}

/// Decode the preset block into presets, keeping group order.
pub fn decode_presets(registers: &[u16], scaling: &ScalingFactors) -> Result<Vec<Preset>> {
    PRESET_BLOCK.check(registers)?;

    Ok(registers
        .chunks_exact(PresetOffsets::COUNT)
        .map(|group| Preset {
            voltage: scaling.raw_to_voltage(group[PresetOffsets::VSet as usize]),
            current: scaling.raw_to_current(group[PresetOffsets::ISet as usize]),
            ovp: scaling.raw_to_voltage(group[PresetOffsets::SOvp as usize]),
            ocp: scaling.raw_to_current(group[PresetOffsets::SOcp as usize]),
        })
        .collect())
}

/// Decoded presets plus when they were read. Owned by a single device worker.
#[derive(Debug, Default)]
pub struct PresetCache {
    presets: Vec<Preset>,
    refreshed_at: Option<Instant>,
}

impl PresetCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty, or older than [`PRESET_REFRESH_INTERVAL`].
    pub fn needs_refresh(&self, now: Instant) -> bool {
        match self.refreshed_at {
            Some(at) if !self.presets.is_empty() => now.duration_since(at) > PRESET_REFRESH_INTERVAL,
            _ => true,
        }
    }

    pub fn store(&mut self, presets: Vec<Preset>, now: Instant) {
        self.presets = presets;
        self.refreshed_at = Some(now);
    }

    pub fn presets(&self) -> &[Preset] {
        &self.presets
    }
}
