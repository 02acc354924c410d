//! Register decoder and encoder.
//!
//! Pure conversions between raw register arrays and [`DeviceSnapshot`] /
//! [`StateSetRequest`]. No I/O happens here; see [`crate::psu`] for that.

use chrono::{Datelike, NaiveDateTime, Timelike};

use crate::{
    error::{Error, Result},
    preset::{PROTECTION_BLOCK, Preset, PresetOffsets},
    register::{ModelNumber, RdRegister as R, STATUS_BLOCK},
    scaling::{BATTERY_SCALE, FIRMWARE_SCALE, ScalingFactors},
    types::{DeviceSnapshot, StateSetRequest},
};

/// A write of one or more consecutive holding registers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterWrite {
    pub address: u16,
    pub values: Vec<u16>,
}

impl RegisterWrite {
    pub fn single(address: impl Into<u16>, value: u16) -> Self {
        Self {
            address: address.into(),
            values: vec![value],
        }
    }
}

/// Ordered writes for a [`StateSetRequest`].
///
/// Toggling the output needs the current output state, so it is flagged rather
/// than encoded and is applied after every write.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EncodedState {
    pub writes: Vec<RegisterWrite>,
    pub toggle_output: bool,
}

/// Scaling for a status block, following its MODEL and CURRENT_RANGE registers.
pub fn status_scaling(status: &[u16]) -> Result<ScalingFactors> {
    STATUS_BLOCK.check(status)?;
    let model = ModelNumber(STATUS_BLOCK.get(status, R::Model));
    let range = STATUS_BLOCK.get(status, R::CurrentRange);
    Ok(ScalingFactors::for_model(model, Some(range)))
}

/// Render the FIRMWARE register, e.g. `141` -> `"1.41"`, `100` -> `"1.0"`.
pub fn firmware_version(raw: u16) -> String {
    format!("{:?}", raw as f64 / FIRMWARE_SCALE)
}

/// Decode a full poll. `status` is [`STATUS_BLOCK`], `protection` is [`PROTECTION_BLOCK`].
///
/// Either everything decodes or nothing does.
pub fn decode_state(status: &[u16], protection: &[u16], presets: &[Preset]) -> Result<DeviceSnapshot> {
    let scaling = status_scaling(status)?;
    PROTECTION_BLOCK.check(protection)?;

    let s = &STATUS_BLOCK;
    let voltage = |reg: R| scaling.raw_to_voltage(s.get(status, reg));
    let current = |reg: R| scaling.raw_to_current(s.get(status, reg));
    let battery = |high: R, low: R| s.get_u32(status, high, low) as f64 / BATTERY_SCALE;
    let limit = |offset: PresetOffsets| PROTECTION_BLOCK.get(protection, offset.address_in_group(0));

    Ok(DeviceSnapshot {
        model: ModelNumber(s.get(status, R::Model)),
        serial_no: s.get_u32(status, R::SerialHigh, R::SerialLow),
        firmware_version: firmware_version(s.get(status, R::Firmware)),
        temp_c: s.get_signed(status, R::TempCelsiusSign, R::TempCelsius),
        temp_f: s.get_signed(status, R::TempFahrenheitSign, R::TempFahrenheit),
        output_voltage_set: voltage(R::VSet),
        output_current_set: current(R::ISet),
        ovp: scaling.raw_to_voltage(limit(PresetOffsets::SOvp)),
        ocp: scaling.raw_to_current(limit(PresetOffsets::SOcp)),
        output_voltage_disp: voltage(R::VOut),
        output_current_disp: current(R::IOut),
        output_power_disp: scaling.raw_to_power(s.get_u32(status, R::PowerHigh, R::PowerLow)),
        input_voltage: voltage(R::VIn),
        protection_status: s.get(status, R::Protect).into(),
        output_mode: s.get(status, R::CvCc).into(),
        output_enable: s.get(status, R::OutputEnable) != 0,
        battery_mode: s.get(status, R::BatteryMode) != 0,
        battery_voltage: voltage(R::BatteryVoltage),
        ext_temp_c: s.get_signed(status, R::ExtTempCelsiusSign, R::ExtTempCelsius),
        ext_temp_f: s.get_signed(status, R::ExtTempFahrenheitSign, R::ExtTempFahrenheit),
        batt_ah: battery(R::BatteryAhHigh, R::BatteryAhLow),
        batt_wh: battery(R::BatteryWhHigh, R::BatteryWhLow),
        presets: presets.to_vec(),
    })
}

/// Encode a set request into register writes.
///
/// Only supplied fields produce writes. Voltage and current go out as one write when
/// both are present. Every value is scaled before anything is returned, so a value
/// out of range rejects the request without a partial write.
pub fn encode_state(request: &StateSetRequest, scaling: &ScalingFactors) -> Result<EncodedState> {
    let m0 = |offset: PresetOffsets| offset.address_in_group(0);
    let mut writes = Vec::new();

    if let Some(index) = request.preset_index {
        writes.push(RegisterWrite::single(R::Preset, index));
    }

    let voltage = request.output_voltage_set.map(|v| scaling.voltage_to_raw(v)).transpose()?;
    let current = request.output_current_set.map(|c| scaling.current_to_raw(c)).transpose()?;
    match (voltage, current) {
        (Some(v), Some(c)) => writes.push(RegisterWrite {
            address: m0(PresetOffsets::VSet),
            values: vec![v, c],
        }),
        (Some(v), None) => writes.push(RegisterWrite::single(m0(PresetOffsets::VSet), v)),
        (None, Some(c)) => writes.push(RegisterWrite::single(m0(PresetOffsets::ISet), c)),
        (None, None) => {}
    }

    if let Some(ovp) = request.ovp {
        writes.push(RegisterWrite::single(m0(PresetOffsets::SOvp), scaling.voltage_to_raw(ovp)?));
    }
    if let Some(ocp) = request.ocp {
        writes.push(RegisterWrite::single(m0(PresetOffsets::SOcp), scaling.current_to_raw(ocp)?));
    }
    if let Some(enable) = request.output_enable {
        writes.push(RegisterWrite::single(R::OutputEnable, enable as u16));
    }

    Ok(EncodedState {
        writes,
        toggle_output: request.output_toggle.unwrap_or(false),
    })
}

/// Clock registers, year through second.
pub fn encode_clock(now: &NaiveDateTime) -> Result<RegisterWrite> {
    let year = u16::try_from(now.year()).map_err(|_| Error::InvalidRange)?;
    Ok(RegisterWrite {
        address: R::Year.into(),
        values: vec![
            year,
            now.month() as u16,
            now.day() as u16,
            now.hour() as u16,
            now.minute() as u16,
            now.second() as u16,
        ],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preset::PRESET_BLOCK;

    /// A register image the size of the device's map, so encoded writes can be applied.
    fn device_image(model: u16, current_range: u16) -> Vec<u16> {
        let mut image = vec![0u16; 128];
        image[R::Model as usize] = model;
        image[R::SerialHigh as usize] = 0x0001;
        image[R::SerialLow as usize] = 0x0002;
        image[R::Firmware as usize] = 141;
        image[R::CurrentRange as usize] = current_range;
        image
    }

    fn apply(image: &mut [u16], encoded: &EncodedState) {
        for write in &encoded.writes {
            let start = write.address as usize;
            image[start..start + write.values.len()].copy_from_slice(&write.values);
            // The device mirrors M0 into the live setpoints.
            if start == PresetOffsets::VSet.address_in_group(0) as usize {
                image[R::VSet as usize] = write.values[0];
                if let Some(current) = write.values.get(1) {
                    image[R::ISet as usize] = *current;
                }
            }
            if start == PresetOffsets::ISet.address_in_group(0) as usize {
                image[R::ISet as usize] = write.values[0];
            }
        }
    }

    fn decode_image(image: &[u16]) -> DeviceSnapshot {
        let status = &image[..STATUS_BLOCK.count as usize];
        let start = PROTECTION_BLOCK.start as usize;
        let protection = &image[start..start + PROTECTION_BLOCK.count as usize];
        decode_state(status, protection, &[]).unwrap()
    }

    #[test]
    fn set_values_survive_round_trip_on_every_model() {
        let cases = [(60062, 1), (60065, 1), (60121, 1), (60125, 0), (60125, 1), (60181, 1), (60241, 1), (60301, 1)];
        let request = StateSetRequest {
            output_voltage_set: Some(12.345),
            output_current_set: Some(1.2345),
            ovp: Some(13.5),
            ocp: Some(1.5),
            ..Default::default()
        };

        for (model, range) in cases {
            let mut image = device_image(model, range);
            let scaling = status_scaling(&image[..STATUS_BLOCK.count as usize]).unwrap();
            let encoded = encode_state(&request, &scaling).unwrap();
            apply(&mut image, &encoded);
            let snapshot = decode_image(&image);

            let v_step = 1.0 / scaling.voltage + 1e-9;
            let i_step = 1.0 / scaling.current + 1e-9;
            assert!((snapshot.output_voltage_set - 12.345).abs() <= v_step, "model {model}");
            assert!((snapshot.output_current_set - 1.2345).abs() <= i_step, "model {model}");
            assert!((snapshot.ovp - 13.5).abs() <= v_step, "model {model}");
            assert!((snapshot.ocp - 1.5).abs() <= i_step, "model {model}");
        }
    }

    #[test]
    fn voltage_and_current_share_one_write() {
        let request = StateSetRequest {
            output_voltage_set: Some(5.0),
            output_current_set: Some(1.0),
            ..Default::default()
        };
        let encoded = encode_state(&request, &ScalingFactors::default()).unwrap();
        assert_eq!(
            encoded.writes,
            vec![RegisterWrite {
                address: 80,
                values: vec![500, 100]
            }]
        );
    }

    #[test]
    fn writes_follow_field_order() {
        let request = StateSetRequest {
            preset_index: Some(2),
            output_current_set: Some(2.0),
            ocp: Some(2.5),
            output_enable: Some(true),
            output_toggle: Some(true),
            ..Default::default()
        };
        let encoded = encode_state(&request, &ScalingFactors::default()).unwrap();
        assert_eq!(
            encoded.writes,
            vec![
                RegisterWrite::single(19u16, 2),
                RegisterWrite::single(81u16, 200),
                RegisterWrite::single(83u16, 250),
                RegisterWrite::single(18u16, 1),
            ]
        );
        assert!(encoded.toggle_output);
    }

    #[test]
    fn empty_request_writes_nothing() {
        let encoded = encode_state(&StateSetRequest::default(), &ScalingFactors::default()).unwrap();
        assert!(encoded.writes.is_empty());
        assert!(!encoded.toggle_output);
    }

    #[test]
    fn out_of_range_value_rejects_request() {
        let request = StateSetRequest {
            preset_index: Some(1),
            output_voltage_set: Some(-2.0),
            ..Default::default()
        };
        assert!(matches!(
            encode_state(&request, &ScalingFactors::default()),
            Err(Error::InvalidRange)
        ));
    }

    #[test]
    fn decodes_status_fields() {
        let mut image = device_image(60181, 1);
        image[R::TempCelsiusSign as usize] = 1;
        image[R::TempCelsius as usize] = 5;
        image[R::TempFahrenheit as usize] = 23;
        image[R::VOut as usize] = 1234;
        image[R::IOut as usize] = 150;
        image[R::PowerHigh as usize] = 0x0001;
        image[R::PowerLow as usize] = 0x0000;
        image[R::VIn as usize] = 2400;
        image[R::Protect as usize] = 2;
        image[R::CvCc as usize] = 1;
        image[R::OutputEnable as usize] = 1;
        image[R::BatteryAhHigh as usize] = 0;
        image[R::BatteryAhLow as usize] = 1500;
        image[R::BatteryWhLow as usize] = 20000;

        let snapshot = decode_image(&image);
        assert_eq!(snapshot.model, ModelNumber(60181));
        assert_eq!(snapshot.serial_no, 0x0001_0002);
        assert_eq!(snapshot.firmware_version, "1.41");
        assert_eq!(snapshot.temp_c, -5);
        assert_eq!(snapshot.temp_f, 23);
        assert_eq!(snapshot.output_voltage_disp, 12.34);
        assert_eq!(snapshot.output_current_disp, 1.5);
        assert_eq!(snapshot.output_power_disp, 655.36);
        assert_eq!(snapshot.input_voltage, 24.0);
        assert_eq!(snapshot.protection_status, crate::register::ProtectionStatus::Ocp);
        assert_eq!(snapshot.output_mode, crate::register::OutputMode::Cc);
        assert!(snapshot.output_enable);
        assert!(!snapshot.battery_mode);
        assert_eq!(snapshot.batt_ah, 1.5);
        assert_eq!(snapshot.batt_wh, 20.0);
    }

    #[test]
    fn wrong_register_count_fails_whole_decode() {
        let image = device_image(60181, 1);
        let result = decode_state(&image[..30], &[0, 0], &[]);
        assert!(matches!(result, Err(Error::RegisterCount { .. })));

        let result = decode_state(&image[..42], &[0], &[]);
        assert!(matches!(result, Err(Error::RegisterCount { .. })));
    }

    #[test]
    fn firmware_renders_as_decimal() {
        assert_eq!(firmware_version(141), "1.41");
        assert_eq!(firmware_version(100), "1.0");
    }

    #[test]
    fn clock_write_covers_year_to_second() {
        let now = chrono::NaiveDate::from_ymd_opt(2026, 10, 18)
            .unwrap()
            .and_hms_opt(15, 4, 5)
            .unwrap();
        let write = encode_clock(&now).unwrap();
        assert_eq!(write.address, 48);
        assert_eq!(write.values, vec![2026, 10, 18, 15, 4, 5]);
    }

    #[test]
    fn preset_block_follows_status_block() {
        assert!(PRESET_BLOCK.start > STATUS_BLOCK.start + STATUS_BLOCK.count);
    }
}
