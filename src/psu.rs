//! Driver for one RD60xx, on top of a [`RegisterSession`].

use std::sync::Arc;

use chrono::NaiveDateTime;
use tokio::time::Instant;
use tracing::debug;

use crate::{
    codec::{self, EncodedState, RegisterWrite},
    error::Result,
    preset::{PRESET_BLOCK, PROTECTION_BLOCK, PresetCache, decode_presets},
    register::{IDENTITY_BLOCK, ModelNumber, RdRegister, RegisterBlock, STATUS_BLOCK},
    scaling::{ScalingFactors, has_switchable_current_range},
    session::RegisterSession,
    types::{DeviceSnapshot, StateSetRequest},
};

/// Model, serial and firmware, as read when a PSU first connects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub model: ModelNumber,
    pub serial_no: u32,
    pub firmware_version: String,
}

/// Read the identity registers in a single request.
pub async fn read_device_info(session: &dyn RegisterSession) -> Result<DeviceInfo> {
    let registers = read_block(session, IDENTITY_BLOCK).await?;
    Ok(DeviceInfo {
        model: ModelNumber(IDENTITY_BLOCK.get(&registers, RdRegister::Model)),
        serial_no: IDENTITY_BLOCK.get_u32(&registers, RdRegister::SerialHigh, RdRegister::SerialLow),
        firmware_version: codec::firmware_version(IDENTITY_BLOCK.get(&registers, RdRegister::Firmware)),
    })
}

async fn read_block(session: &dyn RegisterSession, block: RegisterBlock) -> Result<Vec<u16>> {
    let registers = session.read_registers(block.start, block.count).await?;
    block.check(&registers)?;
    Ok(registers)
}

/// A RD60xx PSU reached through a [`RegisterSession`].
///
/// For its methods, "get" reads back device state and "set" writes configuration.
/// The preset table is cached here, so one `RdPsu` belongs to exactly one worker.
pub struct RdPsu {
    session: Arc<dyn RegisterSession>,
    presets: PresetCache,
}

impl RdPsu {
    pub fn new(session: Arc<dyn RegisterSession>) -> Self {
        Self {
            session,
            presets: PresetCache::new(),
        }
    }

    pub fn session(&self) -> &Arc<dyn RegisterSession> {
        &self.session
    }

    /// Read and decode the full device state.
    ///
    /// Presets are re-read only when the cache is due. Any failed read fails the
    /// whole call; nothing partial is returned.
    pub async fn get_state(&mut self) -> Result<DeviceSnapshot> {
        let status = read_block(self.session.as_ref(), STATUS_BLOCK).await?;
        let protection = read_block(self.session.as_ref(), PROTECTION_BLOCK).await?;

        let now = Instant::now();
        if self.presets.needs_refresh(now) {
            let scaling = codec::status_scaling(&status)?;
            let registers = read_block(self.session.as_ref(), PRESET_BLOCK).await?;
            self.presets.store(decode_presets(&registers, &scaling)?, now);
            debug!("Session {} refreshed presets", self.session.id());
        }

        codec::decode_state(&status, &protection, self.presets.presets())
    }

    /// Apply a sparse set request.
    ///
    /// The whole request is encoded before the first write, so a value out of range
    /// leaves the device untouched.
    pub async fn set_state(&mut self, request: &StateSetRequest) -> Result<()> {
        if request.is_empty() {
            return Ok(());
        }

        let scaling = self.scaling().await?;
        let EncodedState { writes, toggle_output } = codec::encode_state(request, &scaling)?;

        for write in &writes {
            self.write(write).await?;
        }

        if toggle_output {
            let enabled = self.read_single(RdRegister::OutputEnable).await? != 0;
            self.write(&RegisterWrite::single(RdRegister::OutputEnable, !enabled as u16))
                .await?;
        }
        Ok(())
    }

    /// Write the given local time to the device clock.
    pub async fn set_clock(&self, now: &NaiveDateTime) -> Result<()> {
        self.write(&codec::encode_clock(now)?).await
    }

    /// Scaling for the connected model.
    ///
    /// CURRENT_RANGE is only read on models where it changes anything.
    async fn scaling(&self) -> Result<ScalingFactors> {
        let model = ModelNumber(self.read_single(RdRegister::Model).await?);
        let current_range = if has_switchable_current_range(model) {
            Some(self.read_single(RdRegister::CurrentRange).await?)
        } else {
            None
        };
        Ok(ScalingFactors::for_model(model, current_range))
    }

    async fn read_single(&self, register: RdRegister) -> Result<u16> {
        let block = RegisterBlock::new(register.into(), 1);
        let registers = read_block(self.session.as_ref(), block).await?;
        Ok(block.get(&registers, register))
    }

    async fn write(&self, write: &RegisterWrite) -> Result<()> {
        self.session.write_registers(write.address, &write.values).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{error::Error, mock_session::MockSession};

    fn psu(session: &Arc<MockSession>) -> RdPsu {
        RdPsu::new(session.clone())
    }

    #[tokio::test]
    async fn device_info_takes_one_read() {
        let mock = MockSession::rd6018();
        let info = read_device_info(mock.as_ref()).await.unwrap();

        assert_eq!(info.model, ModelNumber(60181));
        assert_eq!(info.serial_no, 0x0001_0203);
        assert_eq!(info.firmware_version, "1.41");
        assert_eq!(mock.read_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn presets_are_only_reread_when_stale() {
        let mock = MockSession::rd6018();
        let mut psu = psu(&mock);

        let snapshot = psu.get_state().await.unwrap();
        assert_eq!(snapshot.presets.len(), 10);
        assert_eq!(mock.read_count(), 3);

        psu.get_state().await.unwrap();
        assert_eq!(mock.read_count(), 5);

        tokio::time::advance(std::time::Duration::from_secs(6)).await;
        psu.get_state().await.unwrap();
        assert_eq!(mock.read_count(), 8);
    }

    #[tokio::test]
    async fn failed_read_yields_no_snapshot() {
        let mock = MockSession::rd6018();
        mock.fail_reads(true);
        let mut psu = psu(&mock);
        assert!(psu.get_state().await.is_err());
    }

    #[tokio::test]
    async fn set_state_writes_only_supplied_fields() {
        let mock = MockSession::rd6018();
        let mut psu = psu(&mock);

        let request = StateSetRequest {
            output_voltage_set: Some(12.0),
            output_current_set: Some(2.5),
            ..Default::default()
        };
        psu.set_state(&request).await.unwrap();

        assert_eq!(mock.writes(), vec![(80, vec![1200, 250])]);
        let snapshot = psu.get_state().await.unwrap();
        assert_eq!(snapshot.output_voltage_set, 12.0);
        assert_eq!(snapshot.output_current_set, 2.5);
    }

    #[tokio::test]
    async fn toggle_inverts_output() {
        let mock = MockSession::rd6018();
        mock.set_register(RdRegister::OutputEnable, 1);
        let mut psu = psu(&mock);

        let request = StateSetRequest {
            output_toggle: Some(true),
            ..Default::default()
        };
        psu.set_state(&request).await.unwrap();
        assert_eq!(mock.register(RdRegister::OutputEnable), 0);

        psu.set_state(&request).await.unwrap();
        assert_eq!(mock.register(RdRegister::OutputEnable), 1);
    }

    #[tokio::test]
    async fn current_range_read_only_on_switchable_models() {
        let mock = MockSession::with_model(60125, 0x0000_0042);
        mock.set_register(RdRegister::CurrentRange, 0);
        let mut rd = psu(&mock);

        let request = StateSetRequest {
            output_current_set: Some(1.5),
            ..Default::default()
        };
        rd.set_state(&request).await.unwrap();
        // Model, range, then no further reads.
        assert_eq!(mock.read_count(), 2);
        assert_eq!(mock.writes(), vec![(81, vec![15000])]);

        let fixed = MockSession::rd6018();
        psu(&fixed).set_state(&request).await.unwrap();
        assert_eq!(fixed.read_count(), 1);
    }

    #[tokio::test]
    async fn out_of_range_set_writes_nothing() {
        let mock = MockSession::rd6018();
        let mut psu = psu(&mock);

        let request = StateSetRequest {
            preset_index: Some(2),
            ovp: Some(1000.0),
            ..Default::default()
        };
        assert!(matches!(psu.set_state(&request).await, Err(Error::InvalidRange)));
        assert!(mock.writes().is_empty());
    }

    #[tokio::test]
    async fn clock_is_written_in_one_request() {
        let mock = MockSession::rd6018();
        let psu = psu(&mock);
        let now = chrono::NaiveDate::from_ymd_opt(2026, 1, 2)
            .unwrap()
            .and_hms_opt(3, 4, 5)
            .unwrap();

        psu.set_clock(&now).await.unwrap();
        assert_eq!(mock.writes(), vec![(48, vec![2026, 1, 2, 3, 4, 5])]);
    }
}
