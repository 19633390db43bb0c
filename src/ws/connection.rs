//! Client side of the meter stream.
//!
//! [`ConnectionManager`] owns the single live websocket, its heartbeat and
//! reconnect timers, and the state fed by inbound frames (series buffer, alert
//! sink, trend cache). Every connection attempt gets a new generation; transport
//! callbacks and timers from an older generation are ignored.

use crate::alert::AlertSink;
use crate::config::StreamConfig;
use crate::error::{AppError, Result};
use crate::persist::{Snapshot, SnapshotStore};
use crate::telemetry::{normalize, Reading, SeriesBuffer, SeriesPoint};
use crate::trend::{TrendCache, TrendKind};
use crate::ws::protocol::{endpoint_url, validate_target_id, InboundFrame, OutboundFrame};
use chrono::NaiveDate;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Error,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Error => "error",
            ConnectionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Derived state published to observers
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MonitorEvent {
    State { state: ConnectionState },
    Reading { reading: Reading },
    Alert { description: String, count: u64 },
}

pub struct ConnectionManager {
    shared: Shared,
}

#[derive(Clone)]
struct Shared {
    inner: Arc<Mutex<Inner>>,
    persister: Arc<Persister>,
}

struct Inner {
    client_id: String,
    settings: StreamConfig,
    state: ConnectionState,
    target_id: String,
    generation: u64,
    revision: u64,
    outbound: Option<mpsc::UnboundedSender<OutboundFrame>>,
    heartbeat: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
    series: SeriesBuffer,
    alerts: AlertSink,
    trends: TrendCache,
    events: broadcast::Sender<MonitorEvent>,
}

/// Hands snapshots to the store from a dedicated writer task; an older
/// revision never overwrites a newer one.
struct Persister {
    store: Arc<dyn SnapshotStore>,
    saved_revision: Arc<Mutex<u64>>,
    writer: Mutex<Option<mpsc::UnboundedSender<PersistRequest>>>,
}

type Commit = (u64, Snapshot);

enum PersistRequest {
    Commit(Commit),
    Flush(oneshot::Sender<()>),
}

impl ConnectionManager {
    pub fn new(settings: StreamConfig, alerts: AlertSink, store: Arc<dyn SnapshotStore>) -> Self {
        Self::with_series(settings, SeriesBuffer::new(), alerts, store)
    }

    /// Build a manager around an existing series buffer (e.g. one with a custom clock).
    /// A snapshot found in `store` is restored, including its target identifier.
    pub fn with_series(
        settings: StreamConfig,
        mut series: SeriesBuffer,
        alerts: AlertSink,
        store: Arc<dyn SnapshotStore>,
    ) -> Self {
        let client_id = format!("meter-realtime-{}", uuid::Uuid::new_v4());
        let mut target_id = settings.target_id.clone();
        let mut trends = TrendCache::new();

        match store.load() {
            Ok(Some(snapshot)) => {
                if validate_target_id(&snapshot.target_id).is_ok() {
                    target_id = snapshot.target_id;
                }
                info!(
                    client_id = %client_id,
                    target_id = %target_id,
                    points = snapshot.series.len(),
                    "restored realtime snapshot"
                );
                series.restore(snapshot.series, snapshot.latest, snapshot.last_saved_date);
                trends = snapshot.trends;
            }
            Ok(None) => {}
            Err(e) => warn!(client_id = %client_id, error = %e, "failed to load snapshot"),
        }

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let inner = Inner {
            client_id,
            settings,
            state: ConnectionState::Idle,
            target_id,
            generation: 0,
            revision: 0,
            outbound: None,
            heartbeat: None,
            reconnect: None,
            series,
            alerts,
            trends,
            events,
        };

        Self {
            shared: Shared {
                inner: Arc::new(Mutex::new(inner)),
                persister: Arc::new(Persister::new(store)),
            },
        }
    }

    /// Replace any existing connection with a new one to `target_id`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn connect(&self, target_id: &str) -> Result<()> {
        validate_target_id(target_id)?;

        let mut inner = self.shared.lock();
        inner.target_id = target_id.to_string();
        self.shared.connect_locked(&mut inner)
    }

    /// Reconnect to the current target
    pub fn reconnect(&self) -> Result<()> {
        let mut inner = self.shared.lock();
        self.shared.connect_locked(&mut inner)
    }

    /// Switch to another target: the realtime buffer is wiped before the new
    /// connection is opened. Nothing changes if the target is invalid or there
    /// is no runtime to connect from.
    pub fn change_target(&self, target_id: &str) -> Result<()> {
        validate_target_id(target_id)?;
        current_runtime()?;

        let (commit, connected) = {
            let mut inner = self.shared.lock();
            info!(
                client_id = %inner.client_id,
                from = %inner.target_id,
                to = %target_id,
                "changing target"
            );
            inner.target_id = target_id.to_string();
            inner.series.clear();
            inner.alerts.on_target_change();
            let commit = inner.commit();
            let connected = self.shared.connect_locked(&mut inner);
            (commit, connected)
        };

        self.shared.persister.save(commit);
        connected
    }

    /// Cancel both timers, close the transport and go idle. Idempotent.
    pub fn teardown(&self) {
        self.shared.lock().teardown();
    }

    /// Explicit clear of the realtime buffer and latest reading
    pub fn clear_realtime(&self) {
        let commit = {
            let mut inner = self.shared.lock();
            inner.series.clear();
            inner.commit()
        };
        self.shared.persister.save(commit);
    }

    /// Explicit session clear of the alert count
    pub fn reset_alerts(&self) {
        self.shared.lock().alerts.reset();
    }

    pub fn save_trend(&self, kind: TrendKind, data: Value) {
        let commit = {
            let mut inner = self.shared.lock();
            inner.trends.save_trend(kind, data);
            inner.commit()
        };
        self.shared.persister.save(commit);
    }

    pub fn clear_trends(&self) {
        let commit = {
            let mut inner = self.shared.lock();
            inner.trends.clear_trends();
            inner.commit()
        };
        self.shared.persister.save(commit);
    }

    /// Wait until every snapshot committed so far has reached the store.
    pub async fn flush(&self) {
        self.shared.persister.flush().await;
    }

    pub fn trend(&self, kind: TrendKind) -> Option<Value> {
        self.shared.lock().trends.get(kind).cloned()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.shared.lock().events.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.lock().state
    }

    pub fn target_id(&self) -> String {
        self.shared.lock().target_id.clone()
    }

    pub fn client_id(&self) -> String {
        self.shared.lock().client_id.clone()
    }

    pub fn alert_count(&self) -> u64 {
        self.shared.lock().alerts.count()
    }

    pub fn latest_reading(&self) -> Option<Reading> {
        self.shared.lock().series.latest().cloned()
    }

    pub fn series(&self) -> Vec<SeriesPoint> {
        self.shared.lock().series.to_vec()
    }

    pub fn last_saved_date(&self) -> Option<NaiveDate> {
        self.shared.lock().series.last_saved_date()
    }

    pub fn snapshot(&self) -> Snapshot {
        self.shared.lock().snapshot()
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.shared.lock().teardown();
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.shared.lock();
        f.debug_struct("ConnectionManager")
            .field("client_id", &inner.client_id)
            .field("state", &inner.state)
            .field("target_id", &inner.target_id)
            .field("generation", &inner.generation)
            .finish_non_exhaustive()
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn connect_locked(&self, inner: &mut Inner) -> Result<()> {
        let url = endpoint_url(&inner.settings.base_url, &inner.target_id)?;
        let runtime = current_runtime()?;

        inner.teardown();
        let generation = inner.generation;

        info!(
            client_id = %inner.client_id,
            target_id = %inner.target_id,
            generation,
            url = %url,
            "connecting to meter stream"
        );

        let (tx, rx) = mpsc::unbounded_channel();
        inner.outbound = Some(tx);
        inner.set_state(ConnectionState::Connecting);
        runtime.spawn(run_transport(self.clone(), generation, url, rx));

        Ok(())
    }

    fn on_open(&self, generation: u64) {
        let mut inner = self.lock();
        if inner.generation != generation {
            return;
        }

        inner.set_state(ConnectionState::Open);

        let period = inner.settings.heartbeat_interval();
        if let Some(handle) = inner.heartbeat.take() {
            handle.abort();
        }
        inner.heartbeat = Some(tokio::spawn(run_heartbeat(self.clone(), generation, period)));
    }

    fn on_message(&self, generation: u64, text: &str) {
        let commit = {
            let mut inner = self.lock();
            if inner.generation != generation {
                debug!(generation, "discarding frame from superseded connection");
                return;
            }
            inner.handle_frame(text)
        };

        if let Some(commit) = commit {
            self.persister.save(commit);
        }
    }

    fn on_error(&self, generation: u64, err: impl fmt::Display) {
        let mut inner = self.lock();
        if inner.generation != generation {
            return;
        }

        warn!(
            client_id = %inner.client_id,
            target_id = %inner.target_id,
            error = %err,
            "transport error"
        );
        inner.set_state(ConnectionState::Error);
    }

    /// Every close is treated as transient: retry the last target after the
    /// fixed delay, forever.
    fn on_close(&self, generation: u64) {
        let mut inner = self.lock();
        if inner.generation != generation {
            return;
        }

        inner.outbound = None;
        if let Some(handle) = inner.heartbeat.take() {
            handle.abort();
        }
        inner.set_state(ConnectionState::Closed);

        let delay = inner.settings.reconnect_delay();
        debug!(
            client_id = %inner.client_id,
            delay_ms = delay.as_millis() as u64,
            "scheduling reconnect"
        );
        if let Some(handle) = inner.reconnect.take() {
            handle.abort();
        }
        inner.reconnect = Some(tokio::spawn(run_reconnect(self.clone(), generation, delay)));
    }
}

impl Inner {
    fn teardown(&mut self) {
        if let Some(handle) = self.heartbeat.take() {
            handle.abort();
        }
        if let Some(handle) = self.reconnect.take() {
            handle.abort();
        }

        // Late callbacks from the old transport now carry a stale generation
        self.generation += 1;

        // Dropping the sender makes the transport task close the socket and exit
        if self.outbound.take().is_some() {
            debug!(client_id = %self.client_id, "closing transport");
        }

        self.set_state(ConnectionState::Idle);
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state == state {
            return;
        }

        info!(
            client_id = %self.client_id,
            target_id = %self.target_id,
            from = %self.state,
            to = %state,
            "connection state changed"
        );
        self.state = state;
        let _ = self.events.send(MonitorEvent::State { state });
    }

    /// Apply one inbound frame. Returns a commit when persisted state changed.
    fn handle_frame(&mut self, text: &str) -> Option<Commit> {
        let frame = match InboundFrame::parse(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(client_id = %self.client_id, error = %e, "failed to parse stream frame");
                debug!(raw = %text, "unparseable frame");
                return None;
            }
        };

        match frame {
            InboundFrame::Alert { description } => {
                let count = self.alerts.push_alert(&description);
                let _ = self.events.send(MonitorEvent::Alert { description, count });
                None
            }
            InboundFrame::Telemetry(value) => {
                let reading = normalize(&value)?;
                let power_w = reading.power_w;

                self.series.save_realtime(reading.clone());
                self.series
                    .push_point(chrono::Utc::now().timestamp_millis(), power_w);
                let _ = self.events.send(MonitorEvent::Reading { reading });

                Some(self.commit())
            }
        }
    }

    fn commit(&mut self) -> Commit {
        self.revision += 1;
        (self.revision, self.snapshot())
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot {
            target_id: self.target_id.clone(),
            latest: self.series.latest().cloned(),
            series: self.series.to_vec(),
            last_saved_date: self.series.last_saved_date(),
            trends: self.trends.clone(),
        }
    }
}

fn current_runtime() -> Result<Handle> {
    Handle::try_current()
        .map_err(|e| AppError::Internal(format!("connect requires a Tokio runtime: {}", e)))
}

impl Persister {
    fn new(store: Arc<dyn SnapshotStore>) -> Self {
        Self {
            store,
            saved_revision: Arc::new(Mutex::new(0)),
            writer: Mutex::new(None),
        }
    }

    /// Queue a commit for the writer task. Without a runtime there is no
    /// stream to stall, so the commit is written inline.
    fn save(&self, commit: Commit) {
        let runtime = match Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                write_commit(self.store.as_ref(), &self.saved_revision, commit);
                return;
            }
        };

        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let request = PersistRequest::Commit(commit);
        let request = match writer.as_ref() {
            Some(tx) => match tx.send(request) {
                Ok(()) => return,
                Err(mpsc::error::SendError(request)) => request,
            },
            None => request,
        };

        // No writer yet, or it went away with an earlier runtime
        let (tx, rx) = mpsc::unbounded_channel();
        runtime.spawn(run_persister(
            self.store.clone(),
            self.saved_revision.clone(),
            rx,
        ));
        if tx.send(request).is_err() {
            warn!("snapshot writer unavailable");
        }
        *writer = Some(tx);
    }

    async fn flush(&self) {
        let ack = {
            let writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
            let Some(tx) = writer.as_ref() else {
                return;
            };
            let (ack_tx, ack_rx) = oneshot::channel();
            if tx.send(PersistRequest::Flush(ack_tx)).is_err() {
                return;
            }
            ack_rx
        };

        let _ = ack.await;
    }
}

fn write_commit(store: &dyn SnapshotStore, saved_revision: &Mutex<u64>, commit: Commit) {
    let (revision, snapshot) = commit;
    let mut saved = saved_revision.lock().unwrap_or_else(PoisonError::into_inner);
    if revision <= *saved {
        return;
    }

    match store.save(&snapshot) {
        Ok(()) => *saved = revision,
        Err(e) => warn!(error = %e, revision, "failed to persist snapshot"),
    }
}

/// Drains queued commits, writing only the newest of each batch on the
/// blocking pool. Exits once the manager is gone.
async fn run_persister(
    store: Arc<dyn SnapshotStore>,
    saved_revision: Arc<Mutex<u64>>,
    mut requests: mpsc::UnboundedReceiver<PersistRequest>,
) {
    while let Some(first) = requests.recv().await {
        let mut newest: Option<Commit> = None;
        let mut acks = Vec::new();
        let mut next = Some(first);

        while let Some(request) = next {
            match request {
                PersistRequest::Commit(commit) => {
                    if newest.as_ref().map_or(true, |(revision, _)| commit.0 > *revision) {
                        newest = Some(commit);
                    }
                }
                PersistRequest::Flush(ack) => acks.push(ack),
            }
            next = requests.try_recv().ok();
        }

        if let Some(commit) = newest {
            let store = store.clone();
            let saved_revision = saved_revision.clone();
            let written = tokio::task::spawn_blocking(move || {
                write_commit(store.as_ref(), &saved_revision, commit)
            })
            .await;
            if let Err(e) = written {
                error!(error = %e, "snapshot writer task failed");
            }
        }

        for ack in acks {
            let _ = ack.send(());
        }
    }

    debug!("snapshot writer stopped");
}

async fn run_transport(
    shared: Shared,
    generation: u64,
    url: String,
    mut outbound: mpsc::UnboundedReceiver<OutboundFrame>,
) {
    let socket = tokio::select! {
        result = tokio_tungstenite::connect_async(url.as_str()) => match result {
            Ok((socket, _response)) => socket,
            Err(e) => {
                shared.on_error(generation, AppError::from(e));
                shared.on_close(generation);
                return;
            }
        },
        _ = sender_dropped(&mut outbound) => {
            debug!(generation, url = %url, "connection attempt abandoned");
            return;
        }
    };

    shared.on_open(generation);
    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            frame = outbound.recv() => match frame {
                Some(frame) => {
                    let text = match frame.to_json() {
                        Ok(text) => text,
                        Err(e) => {
                            error!(error = %e, "failed to serialize outbound frame");
                            continue;
                        }
                    };
                    if let Err(e) = sink.send(Message::Text(text)).await {
                        warn!(generation, error = %e, "failed to send frame");
                    }
                }
                None => {
                    if let Err(e) = sink.close().await {
                        debug!(generation, error = %e, "error while closing transport");
                    }
                    return;
                }
            },
            message = stream.next() => match message {
                Some(Ok(Message::Text(text))) => shared.on_message(generation, &text),
                Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                    Ok(text) => shared.on_message(generation, text),
                    Err(_) => warn!(generation, len = bytes.len(), "discarding non-UTF-8 binary frame"),
                },
                Some(Ok(Message::Close(frame))) => {
                    debug!(generation, ?frame, "server closed the stream");
                    shared.on_close(generation);
                    return;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    shared.on_error(generation, AppError::from(e));
                    shared.on_close(generation);
                    return;
                }
                None => {
                    shared.on_close(generation);
                    return;
                }
            }
        }
    }
}

async fn sender_dropped(outbound: &mut mpsc::UnboundedReceiver<OutboundFrame>) {
    while outbound.recv().await.is_some() {}
}

/// Keepalive while the transport reports itself open. Sends are fire-and-forget.
async fn run_heartbeat(shared: Shared, generation: u64, period: Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        let current = {
            let inner = shared.lock();
            if inner.generation == generation && inner.state == ConnectionState::Open {
                if let Some(tx) = &inner.outbound {
                    if tx.send(OutboundFrame::Ping).is_ok() {
                        debug!(client_id = %inner.client_id, "heartbeat sent");
                    }
                }
            }
            inner.generation == generation
        };

        if !current {
            break;
        }
    }
}

async fn run_reconnect(shared: Shared, generation: u64, delay: Duration) {
    tokio::time::sleep(delay).await;

    let mut inner = shared.lock();
    if inner.generation != generation {
        return;
    }

    // Detach ourselves first so the teardown inside connect does not abort this task
    inner.reconnect.take();
    info!(
        client_id = %inner.client_id,
        target_id = %inner.target_id,
        "reconnecting"
    );
    if let Err(e) = shared.connect_locked(&mut inner) {
        error!(client_id = %inner.client_id, error = %e, "reconnect failed");
    }
}
