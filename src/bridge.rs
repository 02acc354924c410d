//! The bridge orchestrator.
//!
//! A single task owns every piece of shared state: the active workers, the persistent
//! per-PSU state and the re-query timers. Everything else talks to it by message:
//! the transport announces sessions, the onboarding task reports resolved PSUs,
//! workers report their exit, and the broker side delivers inbound messages.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
    time::Duration,
};

use serde_json::{Map, Value};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    identity::{DEFAULT_IDENTITY_CACHE_TTL, DeviceIdentity, IdentityResolver, ResolvedDevice},
    persistent::{PersistentStates, UpdatePeriod},
    psu::{DeviceInfo, RdPsu},
    pubsub::{InboundMessage, Publisher, Route, Topics, publish_json},
    session::{RegisterSession, SessionId},
    types::{PsuListEntry, StateMessage},
    worker::{WorkerConfig, WorkerExit, WorkerHandle, worker},
};

/// Sessions waiting for identity resolution beyond this are closed.
pub const ONBOARDING_QUEUE_CAPACITY: usize = 16;

pub const DEFAULT_REQUERY_DELAY: Duration = Duration::from_millis(500);

/// Listed name of PSUs without a configured one.
pub const UNNAMED: &str = "Unnamed";

/// Orchestrator settings.
#[derive(Debug, Clone)]
pub struct BridgeOptions {
    pub topics: Topics,
    /// Zero disables the identity cache.
    pub identity_cache_ttl: Duration,
    pub set_clock_on_connection: bool,
    /// Delay before the state is re-read after a set.
    pub requery_delay: Duration,
    /// Identity to friendly name.
    pub names: HashMap<String, String>,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        Self {
            topics: Topics::default(),
            identity_cache_ttl: DEFAULT_IDENTITY_CACHE_TTL,
            set_clock_on_connection: true,
            requery_delay: DEFAULT_REQUERY_DELAY,
            names: HashMap::new(),
        }
    }
}

impl BridgeOptions {
    fn name_of(&self, identity: &DeviceIdentity) -> &str {
        self.names.get(identity.as_str()).map_or(UNNAMED, String::as_str)
    }
}

enum BridgeEvent {
    Message(InboundMessage),
    Onboarded {
        session: Arc<dyn RegisterSession>,
        device: ResolvedDevice,
    },
    SessionClosed(SessionId),
    WorkerExited {
        identity: DeviceIdentity,
        session_id: SessionId,
        exit: WorkerExit,
    },
    RequeryDue {
        identity: DeviceIdentity,
        ticket: u64,
    },
}

/// Where the transport hands over new sessions and reports closed ones.
#[derive(Clone)]
pub struct SessionSink {
    onboard: mpsc::Sender<Arc<dyn RegisterSession>>,
    events: mpsc::UnboundedSender<BridgeEvent>,
}

impl SessionSink {
    /// Queue a new session for onboarding without waiting.
    ///
    /// Returns `false` if the queue is full; the caller should then close the session.
    pub fn offer(&self, session: Arc<dyn RegisterSession>) -> bool {
        self.onboard.try_send(session).is_ok()
    }

    pub fn session_closed(&self, id: SessionId) {
        let _ = self.events.send(BridgeEvent::SessionClosed(id));
    }
}

/// Cloneable handle for feeding a running [`Bridge`].
#[derive(Clone)]
pub struct BridgeHandle {
    sink: SessionSink,
    cancel: CancellationToken,
}

impl BridgeHandle {
    /// Hand over a message received from the broker.
    pub fn deliver(&self, message: InboundMessage) {
        let _ = self.sink.events.send(BridgeEvent::Message(message));
    }

    pub fn session_sink(&self) -> SessionSink {
        self.sink.clone()
    }

    /// Stop the bridge. Every worker closes its session before [`Bridge::run`] returns.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

struct ActiveDevice {
    info: DeviceInfo,
    session: Arc<dyn RegisterSession>,
    handle: WorkerHandle,
}

/// At most one pending delayed re-query per PSU.
///
/// Each timer carries a ticket so a late timer for a cleared entry is recognised.
struct RequeryScheduler {
    delay: Duration,
    next_ticket: u64,
    pending: HashMap<DeviceIdentity, (u64, JoinHandle<()>)>,
    events: mpsc::UnboundedSender<BridgeEvent>,
}

impl RequeryScheduler {
    fn new(delay: Duration, events: mpsc::UnboundedSender<BridgeEvent>) -> Self {
        Self {
            delay,
            next_ticket: 0,
            pending: HashMap::new(),
            events,
        }
    }

    /// Returns `false` if a re-query was already pending and this one coalesced into it.
    fn schedule(&mut self, identity: &DeviceIdentity) -> bool {
        if self.pending.contains_key(identity) {
            return false;
        }

        self.next_ticket += 1;
        let ticket = self.next_ticket;
        let delay = self.delay;
        let events = self.events.clone();
        let timer_identity = identity.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(BridgeEvent::RequeryDue {
                identity: timer_identity,
                ticket,
            });
        });
        self.pending.insert(identity.clone(), (ticket, task));
        true
    }

    /// Clear the marker for a fired timer. `false` if it was cancelled meanwhile.
    fn complete(&mut self, identity: &DeviceIdentity, ticket: u64) -> bool {
        match self.pending.get(identity) {
            Some((pending, _)) if *pending == ticket => {
                self.pending.remove(identity);
                true
            }
            _ => false,
        }
    }

    fn cancel(&mut self, identity: &DeviceIdentity) {
        if let Some((_, task)) = self.pending.remove(identity) {
            task.abort();
        }
    }

    fn cancel_all(&mut self) {
        for (_, (_, task)) in self.pending.drain() {
            task.abort();
        }
    }
}

/// The orchestrator. Build with [`bridge`], then await [`Bridge::run`].
pub struct Bridge {
    options: BridgeOptions,
    publisher: Arc<dyn Publisher>,
    events_tx: mpsc::UnboundedSender<BridgeEvent>,
    events_rx: mpsc::UnboundedReceiver<BridgeEvent>,
    onboard_rx: mpsc::Receiver<Arc<dyn RegisterSession>>,
    cancel: CancellationToken,
}

pub fn bridge(options: BridgeOptions, publisher: Arc<dyn Publisher>) -> (Bridge, BridgeHandle) {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (onboard_tx, onboard_rx) = mpsc::channel(ONBOARDING_QUEUE_CAPACITY);
    let cancel = CancellationToken::new();

    let handle = BridgeHandle {
        sink: SessionSink {
            onboard: onboard_tx,
            events: events_tx.clone(),
        },
        cancel: cancel.clone(),
    };
    let bridge = Bridge {
        options,
        publisher,
        events_tx,
        events_rx,
        onboard_rx,
        cancel,
    };
    (bridge, handle)
}

impl Bridge {
    pub async fn run(self) {
        let Bridge {
            options,
            publisher,
            events_tx,
            mut events_rx,
            onboard_rx,
            cancel,
        } = self;

        let resolver = IdentityResolver::new(options.identity_cache_ttl);
        let onboarding = tokio::spawn(onboard(onboard_rx, resolver, events_tx.clone(), cancel.clone()));

        let mut core = Core {
            requery: RequeryScheduler::new(options.requery_delay, events_tx.clone()),
            options,
            publisher,
            events: events_tx,
            states: PersistentStates::new(),
            devices: BTreeMap::new(),
            tasks: Vec::new(),
        };

        info!("Bridge running");
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = events_rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            core.handle(event).await;
        }

        core.shutdown().await;
        let _ = onboarding.await;
        info!("Bridge stopped");
    }
}

/// Resolve new sessions one at a time.
async fn onboard(
    mut sessions: mpsc::Receiver<Arc<dyn RegisterSession>>,
    mut resolver: IdentityResolver,
    events: mpsc::UnboundedSender<BridgeEvent>,
    cancel: CancellationToken,
) {
    loop {
        let session = tokio::select! {
            _ = cancel.cancelled() => break,
            session = sessions.recv() => match session {
                Some(session) => session,
                None => break,
            },
        };
        if session.is_closed() {
            continue;
        }

        resolver.evict_expired();
        let resolved = tokio::select! {
            _ = cancel.cancelled() => {
                session.close();
                break;
            }
            resolved = resolver.resolve(session.as_ref()) => resolved,
        };

        match resolved {
            Ok(device) => {
                let _ = events.send(BridgeEvent::Onboarded { session, device });
            }
            Err(e) => {
                warn!("Could not identify PSU at {}: {e}", session.peer());
                session.close();
            }
        }
    }

    sessions.close();
    while let Ok(session) = sessions.try_recv() {
        session.close();
    }
}

struct Core {
    options: BridgeOptions,
    publisher: Arc<dyn Publisher>,
    events: mpsc::UnboundedSender<BridgeEvent>,
    states: PersistentStates,
    devices: BTreeMap<DeviceIdentity, ActiveDevice>,
    requery: RequeryScheduler,
    tasks: Vec<JoinHandle<()>>,
}

impl Core {
    async fn handle(&mut self, event: BridgeEvent) {
        match event {
            BridgeEvent::Message(message) => self.route(message).await,
            BridgeEvent::Onboarded { session, device } => self.add_device(session, device).await,
            BridgeEvent::SessionClosed(id) => {
                let identity = self
                    .devices
                    .iter()
                    .find(|(_, device)| device.session.id() == id)
                    .map(|(identity, _)| identity.clone());
                if let Some(identity) = identity {
                    self.remove_device(&identity).await;
                }
            }
            BridgeEvent::WorkerExited {
                identity,
                session_id,
                exit,
            } => {
                debug!("Worker for {identity} on session {session_id} exited: {exit:?}");
                let current = self
                    .devices
                    .get(&identity)
                    .is_some_and(|device| device.session.id() == session_id);
                if current {
                    self.remove_device(&identity).await;
                }
            }
            BridgeEvent::RequeryDue { identity, ticket } => {
                if self.requery.complete(&identity, ticket) {
                    if let Some(device) = self.devices.get(&identity) {
                        debug!("Re-query {identity}");
                        device.handle.queue_get();
                    }
                }
            }
        }
    }

    async fn add_device(&mut self, session: Arc<dyn RegisterSession>, device: ResolvedDevice) {
        if session.is_closed() {
            debug!("Session {} closed before its worker started", session.id());
            return;
        }

        let ResolvedDevice { identity, info } = device;
        let name = self.options.name_of(&identity).to_owned();
        info!(
            "PSU {}'s identity is {identity}, its name is '{name}' ({} firmware {})",
            session.peer(),
            info.model,
            info.firmware_version
        );

        if let Some(previous) = self.devices.remove(&identity) {
            info!("PSU {identity} reconnected, replacing session {}", previous.session.id());
            previous.handle.cancel();
            previous.session.close();
        }

        let config = WorkerConfig {
            identity: identity.clone(),
            name,
            period: self.states.watch(&identity),
            publisher: self.publisher.clone(),
            state_topic: self.options.topics.state(&identity),
            set_clock: self.options.set_clock_on_connection,
        };
        let (worker, handle) = worker(RdPsu::new(session.clone()), config);

        let events = self.events.clone();
        let session_id = session.id();
        let exited = identity.clone();
        self.tasks.retain(|task| !task.is_finished());
        self.tasks.push(tokio::spawn(async move {
            let exit = worker.run().await;
            let _ = events.send(BridgeEvent::WorkerExited {
                identity: exited,
                session_id,
                exit,
            });
        }));

        self.devices.insert(identity, ActiveDevice { info, session, handle });
        self.publish_list().await;
    }

    async fn remove_device(&mut self, identity: &DeviceIdentity) {
        let Some(device) = self.devices.remove(identity) else {
            return;
        };
        info!("PSU {identity} disconnected ({})", device.session.peer());
        device.handle.cancel();
        device.session.close();
        self.requery.cancel(identity);

        let status = StateMessage::status(false, self.states.period(identity).as_secs());
        publish_json(self.publisher.as_ref(), &self.options.topics.state(identity), &status).await;
        self.publish_list().await;
    }

    async fn route(&mut self, message: InboundMessage) {
        let Some(route) = self.options.topics.route(&message.topic) else {
            debug!("Ignoring message on {}", message.topic);
            return;
        };
        let payload = serde_json::from_slice::<Value>(&message.payload).ok();
        debug!("Message on {}: {payload:?}", message.topic);

        match route {
            Route::StateSet(identity) => match payload {
                Some(Value::Object(payload)) => self.state_set(identity, payload),
                _ => warn!("Ignoring set for {identity} without a JSON object payload"),
            },
            Route::StateGet(identity) => {
                let query = payload
                    .as_ref()
                    .and_then(|payload| payload.get("query"))
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                self.state_get(identity, query).await;
            }
            Route::ListGet => self.publish_list().await,
        }
    }

    fn state_set(&mut self, identity: DeviceIdentity, mut payload: Map<String, Value>) {
        if let Some(Value::Number(period)) = payload.remove("period") {
            match period.as_f64().and_then(UpdatePeriod::from_secs) {
                Some(period) => {
                    debug!("Update {identity} period to {}s", period.as_secs());
                    self.states.set_period(&identity, period);
                }
                None => warn!("Ignoring period {period} for {identity}"),
            }
        }

        let Some(device) = self.devices.get(&identity) else {
            return;
        };
        if !payload.is_empty() {
            debug!("Set {identity} state to {payload:?}");
            if !device.handle.queue_set(payload) {
                debug!("Command queue for {identity} full, set dropped");
            }
        }
        if !self.requery.schedule(&identity) {
            debug!("Re-query for {identity} already pending");
        }
    }

    async fn state_get(&mut self, identity: DeviceIdentity, query: bool) {
        if let Some(device) = self.devices.get(&identity).filter(|_| query) {
            debug!("Get {identity} state with query");
            if !device.handle.queue_get() {
                debug!("Command queue for {identity} full, get dropped");
            }
            return;
        }

        debug!("Get {identity} state without query");
        let status = StateMessage::status(
            self.devices.contains_key(&identity),
            self.states.period(&identity).as_secs(),
        );
        publish_json(self.publisher.as_ref(), &self.options.topics.state(&identity), &status).await;
    }

    fn list(&self) -> Vec<PsuListEntry> {
        self.devices
            .iter()
            .map(|(identity, device)| PsuListEntry {
                identity: identity.to_string(),
                name: self.options.name_of(identity).to_owned(),
                model: device.info.model.0,
                serial_no: device.info.serial_no,
            })
            .collect()
    }

    async fn publish_list(&self) {
        let list = self.list();
        publish_json(self.publisher.as_ref(), &self.options.topics.list(), &list).await;
    }

    async fn shutdown(&mut self) {
        self.requery.cancel_all();
        for (_, device) in std::mem::take(&mut self.devices) {
            device.handle.cancel();
        }
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
    }
}
