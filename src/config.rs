//! Bridge configuration, read from an optional TOML file.

use std::{collections::HashMap, net::SocketAddr, path::Path, time::Duration};

use serde::Deserialize;

use crate::{
    bridge::{BridgeOptions, DEFAULT_REQUERY_DELAY},
    error::{Error, Result},
    identity::DEFAULT_IDENTITY_CACHE_TTL,
    pubsub::{DEFAULT_BASE_TOPIC, Topics},
    transport::{DEFAULT_LISTEN_ADDR, DEFAULT_REQUEST_TIMEOUT},
};

/// Every field is optional in the file; missing ones take their defaults.
///
/// ```toml
/// listen_addr = "0.0.0.0:8080"
/// base_topic = "riden_psu"
/// identity_cache_ttl_secs = 21600
///
/// [names]
/// "60181_66051" = "Bench"
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BridgeConfig {
    /// Address PSUs connect to.
    pub listen_addr: String,
    pub base_topic: String,
    /// How long an address keeps its identity. `0` disables the cache.
    pub identity_cache_ttl_secs: u64,
    pub set_clock_on_connection: bool,
    pub requery_delay_secs: f64,
    pub request_timeout_secs: f64,
    pub log_level: String,
    /// Identity to friendly name.
    pub names: HashMap<String, String>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR.to_owned(),
            base_topic: DEFAULT_BASE_TOPIC.to_owned(),
            identity_cache_ttl_secs: DEFAULT_IDENTITY_CACHE_TTL.as_secs(),
            set_clock_on_connection: true,
            requery_delay_secs: DEFAULT_REQUERY_DELAY.as_secs_f64(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT.as_secs_f64(),
            log_level: "info".to_owned(),
            names: HashMap::new(),
        }
    }
}

impl BridgeConfig {
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    pub fn validate(&self) -> Result<()> {
        self.listen_addr()?;
        if self.base_topic.is_empty() || self.base_topic.contains(['+', '#']) {
            return Err(Error::Config(format!("invalid base topic '{}'", self.base_topic)));
        }
        seconds("requery_delay_secs", self.requery_delay_secs)?;
        let timeout = seconds("request_timeout_secs", self.request_timeout_secs)?;
        if timeout.is_zero() {
            return Err(Error::Config("request_timeout_secs must be above zero".into()));
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> Result<SocketAddr> {
        self.listen_addr
            .parse()
            .map_err(|e| Error::Config(format!("listen_addr '{}': {e}", self.listen_addr)))
    }

    pub fn request_timeout(&self) -> Result<Duration> {
        seconds("request_timeout_secs", self.request_timeout_secs)
    }

    pub fn bridge_options(&self) -> Result<BridgeOptions> {
        Ok(BridgeOptions {
            topics: Topics::new(self.base_topic.clone()),
            identity_cache_ttl: Duration::from_secs(self.identity_cache_ttl_secs),
            set_clock_on_connection: self.set_clock_on_connection,
            requery_delay: seconds("requery_delay_secs", self.requery_delay_secs)?,
            names: self.names.clone(),
        })
    }
}

fn seconds(field: &str, value: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(value).map_err(|_| Error::Config(format!("{field} must be a non-negative number")))
}
