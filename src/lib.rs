//! This crate bridges Riden RD60xx programmable power supplies to publish/subscribe topics.
//!
//! The PSUs' WiFi modules open a TCP connection to the bridge (a reverse connection)
//! and then speak Modbus RTU over it. For each connected PSU the bridge:
//! * works out a stable identity from its model and serial number,
//! * runs a worker that polls it on a configurable period and publishes snapshots,
//! * applies set commands received on its `state/set` topic.
//!
//! Example PSU model numbers which this should work with:
//! * RD6006 / RD6006P
//! * RD6012 / RD6012P
//! * RD6018
//! * RD6024
//! * RD6030
//!
//! Topics, under a configurable base (default `riden_psu`):
//! * `<base>/psu/<identity>/state` - published snapshots and status replies.
//! * `<base>/psu/<identity>/state/set` - sparse JSON set commands, plus `period`.
//! * `<base>/psu/<identity>/state/get` - `{"query": true}` reads the PSU, anything
//!   else gets a status-only reply.
//! * `<base>/psu/list/get` and `<base>/psu/list` - the connected PSUs.

pub mod bridge;
pub mod codec;
pub mod config;
pub mod error;
pub mod identity;
pub mod persistent;
pub mod preset;
pub mod psu;
pub mod pubsub;
pub mod register;
pub mod scaling;
pub mod session;
pub mod transport;
pub mod types;
pub mod worker;

#[cfg(test)]
mod mock_session;
