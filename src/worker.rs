//! One task per connected PSU.
//!
//! A worker owns the PSU driver, a bounded command queue and the poll schedule. It
//! serves queued commands strictly in arrival order and polls whenever the period
//! has run out, publishing each snapshot it reads.

use std::{sync::Arc, time::Duration};

use serde_json::{Map, Value};
use tokio::{sync::mpsc, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    error::Result,
    identity::DeviceIdentity,
    persistent::{PeriodWatch, UpdatePeriod},
    psu::RdPsu,
    pubsub::{Publisher, publish_json},
    types::{StateMessage, StateSetRequest},
};

/// Commands queued beyond this are dropped.
pub const COMMAND_QUEUE_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub enum WorkerCommand {
    /// Read the PSU and publish a snapshot.
    Get,
    /// Apply a sparse set payload, as received.
    Set(Map<String, Value>),
}

/// How a worker finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// Cancelled by the orchestrator, or its handle went away.
    Cancelled,
    /// The session closed underneath it.
    Disconnected,
    /// A fatal protocol failure.
    Faulted,
}

/// Everything a worker needs besides its PSU.
pub struct WorkerConfig {
    pub identity: DeviceIdentity,
    pub name: String,
    pub period: PeriodWatch,
    pub publisher: Arc<dyn Publisher>,
    /// Where snapshots are published.
    pub state_topic: String,
    pub set_clock: bool,
}

/// The orchestrator's side of a worker.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    commands: mpsc::Sender<WorkerCommand>,
    cancel: CancellationToken,
}

impl WorkerHandle {
    /// Queue a get. Returns `false` if the queue is full and the command was dropped.
    pub fn queue_get(&self) -> bool {
        self.queue(WorkerCommand::Get)
    }

    /// Queue a set. Returns `false` if the queue is full and the command was dropped.
    pub fn queue_set(&self, payload: Map<String, Value>) -> bool {
        self.queue(WorkerCommand::Set(payload))
    }

    fn queue(&self, command: WorkerCommand) -> bool {
        self.commands.try_send(command).is_ok()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

/// Build a worker and the handle used to drive it. Nothing runs until
/// [`Worker::run`] is awaited.
pub fn worker(psu: RdPsu, config: WorkerConfig) -> (Worker, WorkerHandle) {
    let (tx, rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
    let cancel = CancellationToken::new();
    let worker = Worker {
        psu,
        config,
        commands: rx,
        cancel: cancel.clone(),
        last_poll: None,
    };
    (worker, WorkerHandle { commands: tx, cancel })
}

enum Wake {
    Command(WorkerCommand),
    QueueClosed,
    PollDue,
    PeriodChanged,
}

pub struct Worker {
    psu: RdPsu,
    config: WorkerConfig,
    commands: mpsc::Receiver<WorkerCommand>,
    cancel: CancellationToken,
    /// Last successful poll. `None` means a poll is due as soon as polling is on.
    last_poll: Option<Instant>,
}

impl Worker {
    /// Serve the PSU until cancelled, disconnected or faulted.
    ///
    /// The session is closed on every exit path.
    pub async fn run(mut self) -> WorkerExit {
        let cancel = self.cancel.clone();
        let session = self.psu.session().clone();
        let identity = self.config.identity.clone();

        let exit = tokio::select! {
            biased;
            _ = cancel.cancelled() => WorkerExit::Cancelled,
            _ = session.closed() => WorkerExit::Disconnected,
            result = self.serve() => match result {
                Ok(exit) => exit,
                Err(e) => {
                    error!("Worker for {identity} stopped: {e}");
                    WorkerExit::Faulted
                }
            },
        };

        session.close();
        info!("Worker for {identity} ({}) exited: {exit:?}", session.peer());
        exit
    }

    fn period(&self) -> UpdatePeriod {
        *self.config.period.borrow()
    }

    /// Time left until the next poll is due.
    fn until_poll(&self, interval: Duration) -> Duration {
        self.last_poll
            .map_or(Duration::ZERO, |at| interval.saturating_sub(at.elapsed()))
    }

    fn poll_due(&self) -> bool {
        self.period()
            .as_duration()
            .is_some_and(|interval| self.until_poll(interval).is_zero())
    }

    /// Only fatal failures come back as errors.
    async fn serve(&mut self) -> Result<WorkerExit> {
        if self.config.set_clock {
            self.set_clock().await?;
        }

        loop {
            let mut drained = false;
            while let Ok(command) = self.commands.try_recv() {
                self.process(command).await?;
                drained = true;
            }

            if !drained {
                let delay = self.period().as_duration().map(|interval| self.until_poll(interval));
                let wake = tokio::select! {
                    command = self.commands.recv() => command.map_or(Wake::QueueClosed, Wake::Command),
                    _ = sleep_or_forever(delay) => Wake::PollDue,
                    _ = period_changed(&mut self.config.period) => Wake::PeriodChanged,
                };
                match wake {
                    Wake::Command(command) => self.process(command).await?,
                    Wake::QueueClosed => return Ok(WorkerExit::Cancelled),
                    Wake::PeriodChanged => {
                        debug!("Period for {} is now {}s", self.config.identity, self.period().as_secs())
                    }
                    Wake::PollDue => {}
                }
            }

            if self.poll_due() {
                self.get().await?;
            }
        }
    }

    async fn process(&mut self, command: WorkerCommand) -> Result<()> {
        match command {
            WorkerCommand::Get => {
                debug!("Get state for {}", self.config.identity);
                self.get().await
            }
            WorkerCommand::Set(payload) => {
                debug!("Set state for {} ({payload:?})", self.config.identity);
                self.set(&payload).await
            }
        }
    }

    /// Poll and publish. A non-fatal failure publishes nothing and keeps the last
    /// poll time, so the previous snapshot simply ages.
    async fn get(&mut self) -> Result<()> {
        match self.psu.get_state().await {
            Ok(snapshot) => {
                let message = StateMessage::snapshot(snapshot, self.period().as_secs());
                publish_json(self.config.publisher.as_ref(), &self.config.state_topic, &message).await;
                self.last_poll = Some(Instant::now());
                Ok(())
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                debug!("Get state for {} failed: {e}", self.config.identity);
                Ok(())
            }
        }
    }

    async fn set(&mut self, payload: &Map<String, Value>) -> Result<()> {
        let request = match StateSetRequest::from_payload(payload) {
            Ok(request) => request,
            Err(e) => {
                warn!("Bad set data for {} ({}): {e}", self.config.identity, self.config.name);
                return Ok(());
            }
        };

        match self.psu.set_state(&request).await {
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                warn!("Set state for {} not applied: {e}", self.config.identity);
                Ok(())
            }
            Ok(()) => Ok(()),
        }
    }

    async fn set_clock(&mut self) -> Result<()> {
        let now = chrono::Local::now().naive_local();
        debug!("Set clock for {} to {now}", self.config.identity);
        match self.psu.set_clock(&now).await {
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                warn!("Could not set clock for {}: {e}", self.config.identity);
                Ok(())
            }
            Ok(()) => Ok(()),
        }
    }
}

async fn sleep_or_forever(delay: Option<Duration>) {
    match delay {
        Some(delay) => tokio::time::sleep(delay).await,
        None => std::future::pending().await,
    }
}

async fn period_changed(period: &mut PeriodWatch) {
    // A dropped sender can never change again.
    if period.changed().await.is_err() {
        std::future::pending::<()>().await;
    }
}
