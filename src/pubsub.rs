//! The publish/subscribe side of the bridge.
//!
//! The broker client itself lives outside this crate. It feeds [`InboundMessage`]s
//! in and receives outgoing messages through a [`Publisher`].

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::{
    error::{Error, Result},
    identity::DeviceIdentity,
};

pub const DEFAULT_BASE_TOPIC: &str = "riden_psu";

/// A message received from the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

/// A message handed to the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub topic: String,
    pub payload: String,
}

#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, topic: &str, payload: String) -> Result<()>;
}

/// Serialize `value` and publish it. Failures are logged and otherwise ignored.
pub async fn publish_json<T: Serialize + ?Sized>(publisher: &dyn Publisher, topic: &str, value: &T) {
    let payload = match serde_json::to_string(value) {
        Ok(payload) => payload,
        Err(e) => {
            warn!("Could not serialize message for {topic}: {e}");
            return;
        }
    };
    debug!("Publishing on {topic}: {payload}");
    if let Err(e) = publisher.publish(topic, payload).await {
        warn!("Publish on {topic} failed: {e}");
    }
}

/// Forwards published messages into a channel.
#[derive(Debug, Clone)]
pub struct ChannelPublisher {
    tx: mpsc::UnboundedSender<OutboundMessage>,
}

impl ChannelPublisher {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<OutboundMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl Publisher for ChannelPublisher {
    async fn publish(&self, topic: &str, payload: String) -> Result<()> {
        self.tx
            .send(OutboundMessage {
                topic: topic.to_owned(),
                payload,
            })
            .map_err(|e| Error::Publish(e.to_string()))
    }
}

/// What an inbound topic asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    StateSet(DeviceIdentity),
    StateGet(DeviceIdentity),
    ListGet,
}

/// Topic layout under a base prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    base: String,
}

impl Default for Topics {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_TOPIC)
    }
}

impl Topics {
    pub fn new(base: impl Into<String>) -> Self {
        Self { base: base.into() }
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    /// `<base>/psu/<identity>/state`
    pub fn state(&self, identity: &DeviceIdentity) -> String {
        format!("{}/psu/{}/state", self.base, identity)
    }

    /// `<base>/psu/list`
    pub fn list(&self) -> String {
        format!("{}/psu/list", self.base)
    }

    /// Filters the broker client should subscribe to.
    pub fn subscriptions(&self) -> Vec<String> {
        vec![
            format!("{}/psu/list/get", self.base),
            format!("{}/psu/+/state/get", self.base),
            format!("{}/psu/+/state/set", self.base),
        ]
    }

    /// Work out what an inbound topic is for. Unrelated topics give `None`.
    pub fn route(&self, topic: &str) -> Option<Route> {
        let rest = topic.strip_prefix(self.base.as_str())?.strip_prefix("/psu/")?;
        if rest == "list/get" {
            return Some(Route::ListGet);
        }

        let mut parts = rest.split('/');
        let identity = parts.next().filter(|identity| !identity.is_empty() && *identity != "+")?;
        let route = match (parts.next(), parts.next(), parts.next()) {
            (Some("state"), Some("set"), None) => Route::StateSet(identity.into()),
            (Some("state"), Some("get"), None) => Route::StateGet(identity.into()),
            _ => return None,
        };
        Some(route)
    }
}
