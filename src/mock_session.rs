//! We use this mocking module in unit tests to emulate a connected PSU.

use std::{
    net::SocketAddr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::{
    error::{Error, Result},
    preset::{PRESET_GROUPS, PRESET_OFFSET, PresetOffsets},
    register::RdRegister,
    session::{RegisterSession, SessionId},
};

const REGISTER_COUNT: usize = 128;

/// Our mock type used to emulate a PSU on the far side of a session.
pub struct MockSession {
    id: SessionId,
    peer: SocketAddr,
    /// Holding register image of the device.
    registers: Mutex<Vec<u16>>,
    /// Number of read requests served, failed ones included.
    reads: AtomicUsize,
    /// Every write request, in order.
    writes: Mutex<Vec<(u16, Vec<u16>)>>,
    /// Flag to simulate read errors
    should_error_on_read: AtomicBool,
    /// Flag to simulate a dropped connection on read
    should_reset_on_read: AtomicBool,
    /// Flag to simulate write errors
    should_error_on_write: AtomicBool,
    closed: CancellationToken,
}

impl MockSession {
    /// A RD6018 with firmware 1.41 and presets filled in.
    pub fn rd6018() -> Arc<Self> {
        Self::with_model(60181, 0x0001_0203)
    }

    pub fn with_model(model: u16, serial_no: u32) -> Arc<Self> {
        Self::new(model, serial_no, "192.0.2.1:5000")
    }

    pub fn new(model: u16, serial_no: u32, peer: &str) -> Arc<Self> {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1000);

        let mut registers = vec![0u16; REGISTER_COUNT];
        registers[RdRegister::Model as usize] = model;
        registers[RdRegister::SerialHigh as usize] = (serial_no >> 16) as u16;
        registers[RdRegister::SerialLow as usize] = serial_no as u16;
        registers[RdRegister::Firmware as usize] = 141;
        registers[RdRegister::CurrentRange as usize] = 1;
        for group in 0..PRESET_GROUPS {
            registers[PresetOffsets::VSet.address_in_group(group) as usize] = 500 + group * 100;
            registers[PresetOffsets::ISet.address_in_group(group) as usize] = 100 + group * 25;
            registers[PresetOffsets::SOvp.address_in_group(group) as usize] = 6200;
            registers[PresetOffsets::SOcp.address_in_group(group) as usize] = 1900;
        }
        registers[RdRegister::VSet as usize] = registers[PRESET_OFFSET as usize];
        registers[RdRegister::ISet as usize] = registers[PRESET_OFFSET as usize + 1];

        Arc::new(Self {
            id: SessionId(NEXT_ID.fetch_add(1, Ordering::Relaxed)),
            peer: peer.parse().unwrap(),
            registers: Mutex::new(registers),
            reads: AtomicUsize::new(0),
            writes: Mutex::new(Vec::new()),
            should_error_on_read: AtomicBool::new(false),
            should_reset_on_read: AtomicBool::new(false),
            should_error_on_write: AtomicBool::new(false),
            closed: CancellationToken::new(),
        })
    }

    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> Vec<(u16, Vec<u16>)> {
        self.writes.lock().unwrap().clone()
    }

    pub fn register(&self, register: impl Into<u16>) -> u16 {
        let address: u16 = register.into();
        self.registers.lock().unwrap()[address as usize]
    }

    pub fn set_register(&self, register: impl Into<u16>, value: u16) {
        let address: u16 = register.into();
        self.registers.lock().unwrap()[address as usize] = value;
    }

    /// Configure whether reads fail with a (non-fatal) timeout
    pub fn fail_reads(&self, should_error: bool) {
        self.should_error_on_read.store(should_error, Ordering::SeqCst);
    }

    /// Configure whether reads fail with a (fatal) connection reset
    pub fn fail_reads_with_io(&self, should_error: bool) {
        self.should_reset_on_read.store(should_error, Ordering::SeqCst);
    }

    /// Configure whether writes fail with a (non-fatal) timeout
    pub fn fail_writes(&self, should_error: bool) {
        self.should_error_on_write.store(should_error, Ordering::SeqCst);
    }
}

#[async_trait]
impl RegisterSession for MockSession {
    fn id(&self) -> SessionId {
        self.id
    }

    fn peer(&self) -> SocketAddr {
        self.peer
    }

    async fn read_registers(&self, address: u16, count: u16) -> Result<Vec<u16>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if self.closed.is_cancelled() {
            return Err(Error::SessionClosed);
        }
        if self.should_reset_on_read.load(Ordering::SeqCst) {
            return Err(Error::Io(std::io::ErrorKind::ConnectionReset.into()));
        }
        if self.should_error_on_read.load(Ordering::SeqCst) {
            return Err(Error::Timeout);
        }

        let start = address as usize;
        let end = start + count as usize;
        let registers = self.registers.lock().unwrap();
        registers
            .get(start..end)
            .map(<[u16]>::to_vec)
            .ok_or(Error::InvalidResponse)
    }

    async fn write_registers(&self, address: u16, values: &[u16]) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(Error::SessionClosed);
        }
        if self.should_error_on_write.load(Ordering::SeqCst) {
            return Err(Error::Timeout);
        }

        self.writes.lock().unwrap().push((address, values.to_vec()));
        let mut registers = self.registers.lock().unwrap();
        for (offset, value) in values.iter().enumerate() {
            let target = address as usize + offset;
            registers[target] = *value;
            // M0 is live: the device mirrors it into the setpoint registers.
            if target == PresetOffsets::VSet.address_in_group(0) as usize {
                registers[RdRegister::VSet as usize] = *value;
            }
            if target == PresetOffsets::ISet.address_in_group(0) as usize {
                registers[RdRegister::ISet as usize] = *value;
            }
        }
        Ok(())
    }

    fn close(&self) {
        self.closed.cancel();
    }

    fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    async fn closed(&self) {
        self.closed.cancelled().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_counts_requests() {
        let mock = MockSession::rd6018();
        assert_eq!(mock.read_registers(0, 4).await.unwrap(), vec![60181, 1, 0x0203, 141]);
        assert_eq!(mock.read_count(), 1);
    }

    #[tokio::test]
    async fn test_write_mirrors_m0_setpoints() {
        let mock = MockSession::rd6018();
        mock.write_registers(80, &[1234, 321]).await.unwrap();
        assert_eq!(mock.register(RdRegister::VSet), 1234);
        assert_eq!(mock.register(RdRegister::ISet), 321);
        assert_eq!(mock.writes(), vec![(80, vec![1234, 321])]);
    }

    #[tokio::test]
    async fn test_error_flags_toggle() {
        let mock = MockSession::rd6018();

        mock.fail_reads(true);
        assert!(matches!(mock.read_registers(0, 1).await, Err(Error::Timeout)));
        mock.fail_reads(false);
        assert!(mock.read_registers(0, 1).await.is_ok());

        mock.fail_reads_with_io(true);
        let err = mock.read_registers(0, 1).await.unwrap_err();
        assert!(err.is_fatal());
        mock.fail_reads_with_io(false);

        mock.fail_writes(true);
        assert!(mock.write_registers(18, &[1]).await.is_err());
        assert!(mock.writes().is_empty());
    }

    #[tokio::test]
    async fn test_closed_session_refuses_io() {
        let mock = MockSession::rd6018();
        mock.close();
        mock.close();
        mock.closed().await;
        assert!(matches!(mock.read_registers(0, 1).await, Err(Error::SessionClosed)));
        assert!(matches!(mock.write_registers(18, &[1]).await, Err(Error::SessionClosed)));
    }
}
