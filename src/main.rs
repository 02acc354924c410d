//! RD60xx bridge.
//!
//! Accepts reverse TCP connections from Riden RD60xx power supplies and bridges them
//! to publish/subscribe topics.
//!
//! # Usage
//!
//! ```bash
//! # Defaults: PSUs connect to port 8080, topics live under riden_psu/
//! riden-psu-bridge
//!
//! # With a config file and more logging
//! riden-psu-bridge --config bridge.toml --log-level debug
//! ```
//!
//! The broker side is line based: each stdin line `<topic> <json>` is an inbound
//! message, and every published message is written to stdout in the same form.
//! Logs go to stderr.

use std::{path::PathBuf, sync::Arc};

use anyhow::Context;
use async_trait::async_trait;
use clap::Parser;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Stdout},
    net::TcpListener,
    sync::Mutex,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use riden_psu_bridge::{
    bridge::{BridgeHandle, bridge},
    config::BridgeConfig,
    error::Result,
    pubsub::{InboundMessage, Publisher},
    transport,
};

/// Riden RD60xx reverse TCP to pub/sub bridge
#[derive(Parser, Debug)]
#[command(name = "riden-psu-bridge")]
#[command(version)]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address PSUs connect to, e.g. 0.0.0.0:8080
    #[arg(short, long)]
    listen: Option<String>,

    /// Topic prefix
    #[arg(short, long)]
    base_topic: Option<String>,

    /// Log level (trace, debug, info, warn, error). RUST_LOG takes precedence.
    #[arg(long)]
    log_level: Option<String>,
}

/// Writes published messages to stdout, one per line.
struct StdoutPublisher {
    stdout: Mutex<Stdout>,
}

#[async_trait]
impl Publisher for StdoutPublisher {
    async fn publish(&self, topic: &str, payload: String) -> Result<()> {
        let mut stdout = self.stdout.lock().await;
        stdout.write_all(format!("{topic} {payload}\n").as_bytes()).await?;
        stdout.flush().await?;
        Ok(())
    }
}

async fn read_stdin(handle: BridgeHandle) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let (topic, payload) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
                handle.deliver(InboundMessage::new(topic, payload.trim()));
            }
            Ok(None) => break,
            Err(e) => {
                warn!("Reading stdin failed: {e}");
                break;
            }
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Could not listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Could not listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => BridgeConfig::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => BridgeConfig::default(),
    };
    if let Some(listen) = args.listen {
        config.listen_addr = listen;
    }
    if let Some(base_topic) = args.base_topic {
        config.base_topic = base_topic;
    }
    if let Some(log_level) = args.log_level {
        config.log_level = log_level;
    }
    config.validate()?;

    // Setup logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    info!("RD60xx bridge v{}", env!("CARGO_PKG_VERSION"));

    let addr = config.listen_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;

    let options = config.bridge_options()?;
    for topic in options.topics.subscriptions() {
        info!("Accepting messages on {topic}");
    }

    let publisher = Arc::new(StdoutPublisher {
        stdout: Mutex::new(tokio::io::stdout()),
    });
    let (bridge, handle) = bridge(options, publisher);
    let bridge_task = tokio::spawn(bridge.run());
    let server = tokio::spawn(transport::serve(
        listener,
        handle.session_sink(),
        config.request_timeout()?,
        handle.cancellation(),
    ));
    tokio::spawn(read_stdin(handle.clone()));

    shutdown_signal().await;
    info!("Shutting down");
    handle.shutdown();

    bridge_task.await?;
    server.await??;
    Ok(())
}
