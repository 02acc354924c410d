//! Per-PSU state that outlives any single connection.

use std::{collections::HashMap, time::Duration};

use serde::Serialize;
use tokio::sync::watch;

use crate::identity::DeviceIdentity;

/// Seconds between automatic polls. Zero disables polling.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default, Serialize)]
#[serde(transparent)]
pub struct UpdatePeriod(f64);

impl UpdatePeriod {
    /// Fastest polling allowed, in seconds.
    pub const MIN_SECS: f64 = 0.1;

    pub const DISABLED: Self = Self(0.0);

    /// Any nonzero value is raised to at least [`Self::MIN_SECS`].
    ///
    /// Returns `None` for values that are not finite.
    pub fn from_secs(secs: f64) -> Option<Self> {
        if !secs.is_finite() {
            return None;
        }
        if secs == 0.0 {
            return Some(Self::DISABLED);
        }
        Some(Self(secs.max(Self::MIN_SECS)))
    }

    pub fn as_secs(&self) -> f64 {
        self.0
    }

    pub fn is_enabled(&self) -> bool {
        self.0 > 0.0
    }

    /// Poll interval, or `None` when polling is disabled.
    pub fn as_duration(&self) -> Option<Duration> {
        self.is_enabled().then(|| Duration::from_secs_f64(self.0))
    }
}

/// Read side of one PSU's persistent state, held by its worker.
///
/// The worker reads the current period on every loop iteration rather than keeping
/// its own copy, so changes apply from the next wait onwards.
pub type PeriodWatch = watch::Receiver<UpdatePeriod>;

/// Identity to persistent state. Written only by the orchestrator.
///
/// Entries are created on first reference and kept for the life of the process.
#[derive(Debug, Default)]
pub struct PersistentStates {
    states: HashMap<DeviceIdentity, watch::Sender<UpdatePeriod>>,
}

impl PersistentStates {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&mut self, identity: &DeviceIdentity) -> &watch::Sender<UpdatePeriod> {
        self.states
            .entry(identity.clone())
            .or_insert_with(|| watch::Sender::new(UpdatePeriod::DISABLED))
    }

    /// Subscribe to `identity`'s period, creating its state if needed.
    pub fn watch(&mut self, identity: &DeviceIdentity) -> PeriodWatch {
        self.entry(identity).subscribe()
    }

    /// Current period, without creating anything. Unknown identities report disabled.
    pub fn period(&self, identity: &DeviceIdentity) -> UpdatePeriod {
        self.states
            .get(identity)
            .map(|state| *state.borrow())
            .unwrap_or(UpdatePeriod::DISABLED)
    }

    /// Store a new period, creating the state if needed.
    pub fn set_period(&mut self, identity: &DeviceIdentity, period: UpdatePeriod) {
        self.entry(identity).send_replace(period);
    }

    #[cfg(test)]
    pub fn contains(&self, identity: &DeviceIdentity) -> bool {
        self.states.contains_key(identity)
    }
}
