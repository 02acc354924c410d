//! Working out which PSU is on the other end of a new session.
//!
//! The PSU's network address says nothing stable about it, so the identity is built
//! from the model and serial registers. Addresses are remembered for a while to save
//! a query when a PSU reconnects.

use std::{collections::HashMap, net::IpAddr, time::Duration};

use serde::Serialize;
use tokio::time::Instant;
use tracing::debug;

use crate::{
    error::Result,
    psu::{DeviceInfo, read_device_info},
    register::ModelNumber,
    session::RegisterSession,
};

/// Six hours.
pub const DEFAULT_IDENTITY_CACHE_TTL: Duration = Duration::from_secs(21600);

/// Stable key of a physical PSU: `"{model}_{serial}"`, e.g. `"60181_66051"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct DeviceIdentity(String);

impl DeviceIdentity {
    pub fn new(model: ModelNumber, serial_no: u32) -> Self {
        Self(format!("{}_{}", model.0, serial_no))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for DeviceIdentity {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl core::fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Outcome of resolving a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedDevice {
    pub identity: DeviceIdentity,
    pub info: DeviceInfo,
}

#[derive(Debug)]
struct CacheEntry {
    device: ResolvedDevice,
    last_seen: Instant,
}

/// Maps source addresses to identities, with entries expiring after a TTL.
///
/// Owned by the onboarding task, which resolves one session at a time.
#[derive(Debug)]
pub struct IdentityResolver {
    ttl: Duration,
    cache: HashMap<IpAddr, CacheEntry>,
}

impl IdentityResolver {
    /// A `ttl` of zero disables caching.
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            cache: HashMap::new(),
        }
    }

    /// Identity of the PSU behind `session`.
    ///
    /// Served from the cache if this address was seen within the TTL, otherwise by one
    /// register read. Either way the entry's timestamp is refreshed. On failure nothing
    /// is cached; closing the session is left to the caller.
    pub async fn resolve(&mut self, session: &dyn RegisterSession) -> Result<ResolvedDevice> {
        let host = session.peer().ip();
        let now = Instant::now();

        if let Some(entry) = self.cache.get_mut(&host) {
            if !self.ttl.is_zero() && now.duration_since(entry.last_seen) <= self.ttl {
                entry.last_seen = now;
                debug!("Identity of {host} served from cache: {}", entry.device.identity);
                return Ok(entry.device.clone());
            }
        }

        let info = read_device_info(session).await?;
        let device = ResolvedDevice {
            identity: DeviceIdentity::new(info.model, info.serial_no),
            info,
        };
        if !self.ttl.is_zero() {
            self.cache.insert(
                host,
                CacheEntry {
                    device: device.clone(),
                    last_seen: now,
                },
            );
        }
        Ok(device)
    }

    /// Drop every entry older than the TTL.
    pub fn evict_expired(&mut self) {
        let now = Instant::now();
        let ttl = self.ttl;
        self.cache
            .retain(|_, entry| !ttl.is_zero() && now.duration_since(entry.last_seen) <= ttl);
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}
