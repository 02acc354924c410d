//! The register-level view of one connected PSU.
//!
//! Everything above the transport talks to a PSU through [`RegisterSession`], so
//! workers and the identity cache can be driven by an in-memory device in tests.

use std::net::SocketAddr;

use async_trait::async_trait;

use crate::error::Result;

/// Unique per accepted connection. Never reused within one process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl core::fmt::Display for SessionId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Modbus holding register access to a single PSU.
///
/// Requests are serialized: at most one is in flight per session.
#[async_trait]
pub trait RegisterSession: Send + Sync {
    fn id(&self) -> SessionId;

    /// Address the PSU connected from.
    fn peer(&self) -> SocketAddr;

    /// Read `count` holding registers starting at `address`.
    async fn read_registers(&self, address: u16, count: u16) -> Result<Vec<u16>>;

    /// Write `values` to consecutive holding registers starting at `address`.
    ///
    /// A single value goes out as a single register write.
    async fn write_registers(&self, address: u16, values: &[u16]) -> Result<()>;

    /// Close the connection. Calling this more than once is harmless.
    fn close(&self);

    fn is_closed(&self) -> bool;

    /// Resolves once the connection is gone, however that happened.
    async fn closed(&self);
}
