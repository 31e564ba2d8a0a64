//! # Connection Orchestrator
//!
//! [`ConnectionManager`] owns one adapter instance at a time and everything
//! observers look at: connection state, the message buffers, the dedup
//! window, the event log and intake counters.
//!
//! ## Tasks
//!
//! ```text
//! adapter ──► Subscription ──► tap task ──► intake (dedup → paused | live → trim)
//!         ──► state_changes ──► watch task ──► session state + event log
//!         ──► consume stream ──► consume task ──► durable history + ack table
//! ```
//!
//! Every task holds a `Weak` reference to the session and the connection
//! generation it was started for. Disconnect bumps the generation, aborts
//! the tasks and waits for them before the adapter is released.
//!
//! All mutable state sits behind one `parking_lot` lock that is never held
//! across an `.await`.

use crate::buffers::MessageLog;
use crate::dedup::DedupWindow;
use crate::events::{EventLog, SessionEvent, SessionStats};
use mq_adapters::{AdapterHandle, BasicClient, ProviderRegistry, StreamingClient, Subscription};
use mq_config::{sanitize_url, ProviderKind, SessionSettings};
use mq_types::{
    AckAction, AcknowledgeableMessage, BrokerError, BrokerResult, ConnectionConfig,
    ConnectionState, ConsumerConfig, ConsumerInfo, MessageId, PublishAck, StreamConfig,
    StreamInfo, UnifiedMessage,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const DEFAULT_CLIENT_NAME: &str = "mqtap";
const FEED_CAPACITY: usize = 1024;
const STATE_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionMode {
    /// Plain publish/subscribe
    #[default]
    Basic,
    /// Persistent streams with explicit acknowledgement
    DurableStream,
}

/// Everything needed to open a session
#[derive(Clone, Default, PartialEq)]
pub struct ConnectRequest {
    /// Raw URL; embedded credentials are stripped before use
    pub url: String,
    pub name: String,
    /// Registry id; inferred from the URL scheme when absent
    pub provider: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub token: Option<String>,
    pub options: BTreeMap<String, String>,
    pub mode: SessionMode,
    /// Overrides the provider's firehose default
    pub auto_firehose: Option<bool>,
}

impl ConnectRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    pub fn with_mode(mut self, mode: SessionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_auto_firehose(mut self, enabled: bool) -> Self {
        self.auto_firehose = Some(enabled);
        self
    }
}

impl fmt::Debug for ConnectRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let url = sanitize_url(&self.url)
            .map(|clean| clean.url)
            .unwrap_or_else(|_| "<invalid url>".to_string());
        f.debug_struct("ConnectRequest")
            .field("url", &url)
            .field("name", &self.name)
            .field("provider", &self.provider)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("token", &self.token.as_ref().map(|_| "***"))
            .field("options", &self.options.keys().collect::<Vec<_>>())
            .field("mode", &self.mode)
            .field("auto_firehose", &self.auto_firehose)
            .finish()
    }
}

/// Registry id for a connect request
///
/// An explicit id wins over the URL scheme; durable-stream mode upgrades
/// plain NATS to JetStream.
pub fn resolve_provider(
    explicit: Option<&str>,
    scheme: &str,
    mode: SessionMode,
) -> BrokerResult<String> {
    let id = match explicit.map(str::trim).filter(|id| !id.is_empty()) {
        Some(id) => id.to_ascii_lowercase(),
        None => ProviderKind::from_scheme(scheme)
            .map(|kind| kind.id().to_string())
            .ok_or_else(|| {
                BrokerError::invalid_configuration(format!(
                    "cannot infer a provider from scheme '{}'",
                    scheme
                ))
            })?,
    };

    if mode == SessionMode::DurableStream && id == ProviderKind::Nats.id() {
        return Ok(ProviderKind::JetStream.id().to_string());
    }
    Ok(id)
}

/// Summary of the open connection
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionSummary {
    pub provider: String,
    /// Sanitized URL
    pub url: String,
    pub mode: SessionMode,
    pub firehose: Option<String>,
    pub subscriptions: Vec<String>,
}

struct Connection {
    adapter: AdapterHandle,
    provider: String,
    kind: Option<ProviderKind>,
    url: String,
    mode: SessionMode,
}

struct TapTask {
    id: u64,
    pattern: String,
    handle: JoinHandle<()>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ConsumeKey {
    stream: String,
    consumer: String,
}

#[derive(Debug, Clone)]
enum Tap {
    Pattern(String),
    Firehose(String),
    Consume(ConsumeKey),
}

impl fmt::Display for Tap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tap::Pattern(pattern) => write!(f, "subscription '{}'", pattern),
            Tap::Firehose(pattern) => write!(f, "firehose '{}'", pattern),
            Tap::Consume(key) => write!(f, "consumer {}/{}", key.stream, key.consumer),
        }
    }
}

struct SessionState {
    connection_state: ConnectionState,
    connection: Option<Connection>,
    generation: u64,
    next_task: u64,
    paused: bool,
    log: MessageLog,
    dedup: DedupWindow,
    events: EventLog,
    stats: SessionStats,
    subscriptions: HashMap<String, TapTask>,
    firehose: Option<TapTask>,
    consumers: HashMap<ConsumeKey, TapTask>,
    state_watch: Option<JoinHandle<()>>,
    streams: Vec<StreamInfo>,
}

impl SessionState {
    fn new(settings: &SessionSettings) -> Self {
        Self {
            connection_state: ConnectionState::Disconnected,
            connection: None,
            generation: 0,
            next_task: 1,
            paused: false,
            log: MessageLog::new(settings.retention_limit),
            dedup: DedupWindow::new(settings.dedup_window),
            events: EventLog::new(settings.event_log_limit),
            stats: SessionStats::default(),
            subscriptions: HashMap::new(),
            firehose: None,
            consumers: HashMap::new(),
            state_watch: None,
            streams: Vec::new(),
        }
    }

    fn task_id(&mut self) -> u64 {
        let id = self.next_task;
        self.next_task += 1;
        id
    }

    fn connection(&self) -> BrokerResult<&Connection> {
        self.connection.as_ref().ok_or(BrokerError::NotConnected)
    }

    fn basic(&self) -> BrokerResult<Arc<dyn BasicClient>> {
        Ok(self.connection()?.adapter.basic.clone())
    }

    fn streaming(&self) -> BrokerResult<Arc<dyn StreamingClient>> {
        let connection = self.connection()?;
        if connection.mode != SessionMode::DurableStream {
            return Err(BrokerError::not_supported(
                "stream operations outside durable stream mode",
            ));
        }
        let client = connection.adapter.streaming.clone().ok_or_else(|| {
            BrokerError::not_supported(format!("persistent streams on {}", connection.provider))
        })?;
        if !client.is_streaming_available() {
            return Err(BrokerError::not_supported(format!(
                "{} offered no stream context",
                connection.provider
            )));
        }
        Ok(client)
    }

    /// Every running task handle, leaving the tables empty
    fn take_tasks(&mut self) -> Vec<JoinHandle<()>> {
        let mut tasks: Vec<JoinHandle<()>> = self
            .subscriptions
            .drain()
            .map(|(_, task)| task.handle)
            .collect();
        tasks.extend(self.firehose.take().map(|task| task.handle));
        tasks.extend(self.consumers.drain().map(|(_, task)| task.handle));
        tasks.extend(self.state_watch.take());
        tasks
    }
}

impl Drop for SessionState {
    fn drop(&mut self) {
        for task in self.take_tasks() {
            task.abort();
        }
    }
}

struct Shared {
    registry: ProviderRegistry,
    settings: SessionSettings,
    state: Mutex<SessionState>,
    state_tx: broadcast::Sender<ConnectionState>,
    feed_tx: broadcast::Sender<UnifiedMessage>,
}

impl Shared {
    fn set_state(&self, state: &mut SessionState, next: ConnectionState) {
        if state.connection_state == next {
            return;
        }
        debug!(from = %state.connection_state, to = %next, "Session state transition");
        state.connection_state = next.clone();
        let _ = self.state_tx.send(next);
    }

    fn intake(&self, generation: u64, message: UnifiedMessage) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.generation != generation {
            return;
        }
        if state.dedup.is_duplicate(&message) {
            state.stats.record_duplicate();
            debug!(subject = %message.subject(), "Suppressed duplicate delivery");
            return;
        }

        state.stats.record(message.size());
        if state.paused {
            state.log.push_paused(message);
        } else {
            let _ = self.feed_tx.send(message.clone());
            state.log.push_live(message);
        }
    }

    fn intake_durable(&self, generation: u64, message: AcknowledgeableMessage) -> bool {
        let mut state = self.state.lock();
        if state.generation != generation {
            message.release();
            return false;
        }
        state.stats.record(message.message().size());
        let _ = self.feed_tx.send(message.message().clone());
        state.log.push_durable(message);
        true
    }

    /// A tap task finished on its own: stream end or terminal error
    fn end_tap(&self, generation: u64, task_id: u64, tap: &Tap, failure: Option<BrokerError>) {
        let mut state = self.state.lock();
        if state.generation != generation {
            return;
        }
        match tap {
            Tap::Pattern(pattern) => {
                if state.subscriptions.get(pattern).is_some_and(|t| t.id == task_id) {
                    state.subscriptions.remove(pattern);
                }
            }
            Tap::Firehose(_) => {
                if state.firehose.as_ref().is_some_and(|t| t.id == task_id) {
                    state.firehose = None;
                }
            }
            Tap::Consume(key) => {
                if state.consumers.get(key).is_some_and(|t| t.id == task_id) {
                    state.consumers.remove(key);
                }
            }
        }
        match failure {
            Some(e) => {
                warn!(tap = %tap, error = %e, "Tap failed");
                state.events.error(format!("{} failed: {}", tap, e));
            }
            None => {
                info!(tap = %tap, "Tap ended");
                state.events.warn(format!("{} ended", tap));
            }
        }
    }

    fn mirror(&self, generation: u64, next: ConnectionState) {
        let mut state = self.state.lock();
        if state.generation != generation || state.connection.is_none() {
            return;
        }
        match &next {
            ConnectionState::Error(reason) => {
                error!(reason = %reason, "Adapter reported an error");
                state.events.error(format!("Connection error: {}", reason));
            }
            ConnectionState::Reconnecting => state.events.warn("Adapter reconnecting"),
            ConnectionState::Disconnected => state.events.warn("Adapter disconnected"),
            ConnectionState::Connected => state.events.info("Adapter connected"),
            ConnectionState::Connecting => return,
        }
        self.set_state(&mut state, next);
    }
}

async fn watch_state(
    shared: Weak<Shared>,
    generation: u64,
    mut changes: broadcast::Receiver<ConnectionState>,
) {
    loop {
        let next = match changes.recv().await {
            Ok(next) => next,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(skipped, "State watch lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return,
        };
        match shared.upgrade() {
            Some(shared) => shared.mirror(generation, next),
            None => return,
        }
    }
}

async fn drain_tap(
    shared: Weak<Shared>,
    generation: u64,
    task_id: u64,
    tap: Tap,
    mut subscription: Subscription<UnifiedMessage>,
) {
    while let Some(item) = subscription.recv().await {
        let Some(shared) = shared.upgrade() else {
            return;
        };
        match item {
            Ok(message) => shared.intake(generation, message),
            Err(e) => {
                shared.end_tap(generation, task_id, &tap, Some(e));
                return;
            }
        }
    }
    if let Some(shared) = shared.upgrade() {
        shared.end_tap(generation, task_id, &tap, None);
    }
}

async fn drain_consume(
    shared: Weak<Shared>,
    generation: u64,
    task_id: u64,
    tap: Tap,
    mut subscription: Subscription<AcknowledgeableMessage>,
) {
    while let Some(item) = subscription.recv().await {
        let Some(shared) = shared.upgrade() else {
            return;
        };
        match item {
            Ok(message) => {
                shared.intake_durable(generation, message);
            }
            Err(e) => {
                shared.end_tap(generation, task_id, &tap, Some(e));
                return;
            }
        }
    }
    if let Some(shared) = shared.upgrade() {
        shared.end_tap(generation, task_id, &tap, None);
    }
}

/// Session orchestrator over one broker connection at a time
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("ConnectionManager")
            .field("state", &state.connection_state)
            .field("provider", &state.connection.as_ref().map(|c| c.provider.clone()))
            .field("subscriptions", &state.subscriptions.len())
            .field("paused", &state.paused)
            .finish()
    }
}

impl ConnectionManager {
    /// Manager over the built-in providers
    pub fn new(settings: SessionSettings) -> Self {
        Self::with_registry(ProviderRegistry::with_builtins(), settings)
    }

    pub fn with_registry(registry: ProviderRegistry, settings: SessionSettings) -> Self {
        let (state_tx, _) = broadcast::channel(STATE_CAPACITY);
        let (feed_tx, _) = broadcast::channel(FEED_CAPACITY);
        let state = SessionState::new(&settings);
        Self {
            shared: Arc::new(Shared {
                registry,
                settings,
                state: Mutex::new(state),
                state_tx,
                feed_tx,
            }),
        }
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.shared.settings
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Open a session; a second attempt while one is running is rejected
    pub async fn connect(&self, request: ConnectRequest) -> BrokerResult<()> {
        let shared = &self.shared;
        let generation = {
            let mut state = shared.state.lock();
            if state.connection_state.is_connecting() {
                return Err(BrokerError::connection_failed(
                    "a connection attempt is already in progress",
                ));
            }
            if state.connection.is_some() {
                return Err(BrokerError::connection_failed(
                    "already connected; disconnect first",
                ));
            }
            state.generation += 1;
            shared.set_state(&mut state, ConnectionState::Connecting);
            state.generation
        };

        let connection = match self.establish(&request, generation).await {
            Ok(connection) => connection,
            Err(e) => {
                error!(error = %e, "Connect failed");
                let mut state = shared.state.lock();
                if state.generation == generation {
                    if let Some(watch) = state.state_watch.take() {
                        watch.abort();
                    }
                    state.events.error(format!("Connect failed: {}", e));
                    shared.set_state(&mut state, ConnectionState::Error(e.to_string()));
                }
                return Err(e);
            }
        };

        let outcome = {
            let mut state = shared.state.lock();
            if state.generation != generation {
                Err(connection)
            } else {
                let auto_firehose = request
                    .auto_firehose
                    .unwrap_or_else(|| connection.kind.is_some_and(|k| k.auto_firehose_default()));
                let durable = connection.mode == SessionMode::DurableStream;
                info!(provider = %connection.provider, url = %connection.url, "Session connected");
                state
                    .events
                    .info(format!("Connected to {} via {}", connection.url, connection.provider));
                state.connection = Some(connection);
                shared.set_state(&mut state, ConnectionState::Connected);
                Ok((auto_firehose, durable))
            }
        };
        let (auto_firehose, durable) = match outcome {
            Ok(flags) => flags,
            Err(connection) => {
                warn!("Disconnected while connecting; closing the new connection");
                let _ = connection.adapter.basic.disconnect().await;
                return Err(BrokerError::connection_failed(
                    "connection attempt was cancelled",
                ));
            }
        };

        if auto_firehose {
            if let Err(e) = self.start_firehose().await {
                warn!(error = %e, "Firehose did not start");
                shared
                    .state
                    .lock()
                    .events
                    .warn(format!("Firehose did not start: {}", e));
            }
        }
        if durable {
            if let Err(e) = self.refresh_streams().await {
                warn!(error = %e, "Stream list unavailable");
                shared
                    .state
                    .lock()
                    .events
                    .warn(format!("Stream list unavailable: {}", e));
            }
        }
        Ok(())
    }

    async fn establish(&self, request: &ConnectRequest, generation: u64) -> BrokerResult<Connection> {
        let shared = &self.shared;
        let clean = sanitize_url(&request.url)?;
        let provider = resolve_provider(request.provider.as_deref(), &clean.scheme, request.mode)?;

        let mut config = ConnectionConfig::new(clean.url.clone())
            .with_tls(clean.tls)
            .with_name(if request.name.is_empty() {
                DEFAULT_CLIENT_NAME
            } else {
                request.name.as_str()
            });
        config.username = request.username.clone().or(clean.username);
        config.password = request.password.clone().or(clean.password);
        config.token = request.token.clone();
        config.options = request.options.clone();

        let wants_streams = request.mode == SessionMode::DurableStream;
        let adapter = shared.registry.create(&provider, &shared.settings, wants_streams)?;
        let mode = if wants_streams && adapter.streaming.is_none() {
            warn!(provider = %provider, "Provider has no persistent streams; using basic mode");
            shared
                .state
                .lock()
                .events
                .warn(format!("{} has no persistent streams; using basic mode", provider));
            SessionMode::Basic
        } else {
            request.mode
        };

        let watch = tokio::spawn(watch_state(
            Arc::downgrade(shared),
            generation,
            adapter.basic.state_changes(),
        ));
        {
            let mut state = shared.state.lock();
            if state.generation != generation {
                watch.abort();
                return Err(BrokerError::connection_failed(
                    "connection attempt was cancelled",
                ));
            }
            state.state_watch = Some(watch);
        }

        info!(provider = %provider, url = %clean.url, tls = clean.tls, ?mode, "Connecting");
        adapter.basic.connect(&config).await?;

        Ok(Connection {
            kind: ProviderKind::from_id(&provider),
            adapter,
            provider,
            url: clean.url,
            mode,
        })
    }

    /// Tear the session down: tasks first, then the adapter, then the buffers
    pub async fn disconnect(&self) -> BrokerResult<()> {
        let shared = &self.shared;
        let (tasks, connection) = {
            let mut state = shared.state.lock();
            state.generation += 1;
            (state.take_tasks(), state.connection.take())
        };

        for task in &tasks {
            task.abort();
        }
        // Aborted tasks drop their subscriptions before the adapter goes away
        for task in tasks {
            let _ = task.await;
        }

        let result = match connection {
            Some(connection) => {
                info!(provider = %connection.provider, "Disconnecting");
                let result = connection.adapter.basic.disconnect().await;
                drop(connection);
                result
            }
            None => Ok(()),
        };

        let mut state = shared.state.lock();
        state.log.clear();
        state.dedup.clear();
        state.streams.clear();
        state.paused = false;
        if let Err(e) = &result {
            warn!(error = %e, "Adapter disconnect reported an error");
            state.events.warn(format!("Disconnect: {}", e));
        }
        state.events.info("Disconnected");
        shared.set_state(&mut state, ConnectionState::Disconnected);
        result
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state.lock().connection_state.clone()
    }

    /// Every session state transition from now on
    pub fn state_changes(&self) -> broadcast::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    /// Messages as they become visible in live or durable history
    pub fn message_feed(&self) -> broadcast::Receiver<UnifiedMessage> {
        self.shared.feed_tx.subscribe()
    }

    pub fn summary(&self) -> Option<ConnectionSummary> {
        let state = self.shared.state.lock();
        let connection = state.connection.as_ref()?;
        let mut subscriptions: Vec<String> = state.subscriptions.keys().cloned().collect();
        subscriptions.sort();
        Some(ConnectionSummary {
            provider: connection.provider.clone(),
            url: connection.url.clone(),
            mode: connection.mode,
            firehose: state.firehose.as_ref().map(|t| t.pattern.clone()),
            subscriptions,
        })
    }

    // ------------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------------

    /// Start tapping `pattern`; already tapped patterns are a no-op
    pub async fn subscribe(&self, pattern: &str) -> BrokerResult<()> {
        let (adapter, generation) = {
            let state = self.shared.state.lock();
            if state.subscriptions.contains_key(pattern) {
                return Ok(());
            }
            (state.basic()?, state.generation)
        };

        let subscription = adapter.subscribe(pattern).await?;

        let mut state = self.shared.state.lock();
        if state.generation != generation {
            return Err(BrokerError::NotConnected);
        }
        if state.subscriptions.contains_key(pattern) {
            // A concurrent call won; dropping ours cancels it
            return Ok(());
        }
        let id = state.task_id();
        let handle = tokio::spawn(drain_tap(
            Arc::downgrade(&self.shared),
            generation,
            id,
            Tap::Pattern(pattern.to_string()),
            subscription,
        ));
        state.subscriptions.insert(
            pattern.to_string(),
            TapTask {
                id,
                pattern: pattern.to_string(),
                handle,
            },
        );
        state.events.info(format!("Subscribed to '{}'", pattern));
        info!(pattern = %pattern, "Subscribed");
        Ok(())
    }

    /// Stop tapping `pattern`; unknown patterns are a no-op
    pub async fn unsubscribe(&self, pattern: &str) -> BrokerResult<()> {
        let (task, adapter, shared_with_firehose) = {
            let mut state = self.shared.state.lock();
            let Some(task) = state.subscriptions.remove(pattern) else {
                return Ok(());
            };
            state.events.info(format!("Unsubscribed from '{}'", pattern));
            let shared_with_firehose = state
                .firehose
                .as_ref()
                .is_some_and(|f| f.pattern == pattern);
            (task, state.basic().ok(), shared_with_firehose)
        };
        task.handle.abort();

        if let (Some(adapter), false) = (adapter, shared_with_firehose) {
            if let Err(e) = adapter.unsubscribe(pattern).await {
                warn!(pattern = %pattern, error = %e, "Adapter unsubscribe failed");
            }
        }
        info!(pattern = %pattern, "Unsubscribed");
        Ok(())
    }

    /// Patterns with a running tap, sorted
    pub fn subscriptions(&self) -> Vec<String> {
        let mut patterns: Vec<String> = self.shared.state.lock().subscriptions.keys().cloned().collect();
        patterns.sort();
        patterns
    }

    /// Tap everything the provider's wildcard reaches
    pub async fn start_firehose(&self) -> BrokerResult<()> {
        let (adapter, generation, pattern) = {
            let state = self.shared.state.lock();
            if state.firehose.is_some() {
                return Ok(());
            }
            let connection = state.connection()?;
            let pattern = connection
                .kind
                .map(|kind| kind.firehose_pattern())
                .ok_or_else(|| {
                    BrokerError::not_supported(format!("firehose on {}", connection.provider))
                })?;
            (connection.adapter.basic.clone(), state.generation, pattern)
        };

        let subscription = adapter.subscribe(pattern).await?;

        let mut state = self.shared.state.lock();
        if state.generation != generation {
            return Err(BrokerError::NotConnected);
        }
        if state.firehose.is_some() {
            return Ok(());
        }
        let id = state.task_id();
        let handle = tokio::spawn(drain_tap(
            Arc::downgrade(&self.shared),
            generation,
            id,
            Tap::Firehose(pattern.to_string()),
            subscription,
        ));
        state.firehose = Some(TapTask {
            id,
            pattern: pattern.to_string(),
            handle,
        });
        state.events.info(format!("Firehose started on '{}'", pattern));
        info!(pattern = %pattern, "Firehose started");
        Ok(())
    }

    pub fn stop_firehose(&self) -> bool {
        let mut state = self.shared.state.lock();
        match state.firehose.take() {
            Some(task) => {
                task.handle.abort();
                state.events.info("Firehose stopped");
                info!(pattern = %task.pattern, "Firehose stopped");
                true
            }
            None => false,
        }
    }

    pub fn firehose(&self) -> Option<String> {
        self.shared
            .state
            .lock()
            .firehose
            .as_ref()
            .map(|t| t.pattern.clone())
    }

    // ------------------------------------------------------------------
    // Buffers
    // ------------------------------------------------------------------

    pub fn pause(&self) {
        let mut state = self.shared.state.lock();
        if !state.paused {
            state.paused = true;
            state.events.info("Paused");
        }
    }

    /// Resume intake into live history; returns how many paused messages moved
    pub fn resume(&self) -> usize {
        let mut guard = self.shared.state.lock();
        let state = &mut *guard;
        if !state.paused {
            return 0;
        }
        state.paused = false;
        let moved = state.log.resume();
        let live = state.log.live();
        for message in live.iter().take(moved).rev() {
            let _ = self.shared.feed_tx.send(message.clone());
        }
        state.events.info(format!("Resumed; {} buffered messages", moved));
        moved
    }

    pub fn is_paused(&self) -> bool {
        self.shared.state.lock().paused
    }

    pub fn retention(&self) -> usize {
        self.shared.state.lock().log.retention()
    }

    /// Change the retention limit; every buffer is trimmed right away
    pub fn set_retention(&self, limit: usize) -> BrokerResult<()> {
        if limit == 0 {
            return Err(BrokerError::invalid_configuration(
                "retention limit must be at least 1",
            ));
        }
        let mut state = self.shared.state.lock();
        state.log.set_retention(limit);
        state.events.info(format!("Retention set to {}", limit));
        debug!(limit, "Retention changed");
        Ok(())
    }

    /// Live history, most recent first
    pub fn messages(&self) -> Vec<UnifiedMessage> {
        self.shared.state.lock().log.live()
    }

    /// Deliveries held back while paused, in receipt order
    pub fn paused_messages(&self) -> Vec<UnifiedMessage> {
        self.shared.state.lock().log.paused()
    }

    /// Display copies of persistent-stream deliveries, most recent first
    pub fn durable_messages(&self) -> Vec<UnifiedMessage> {
        self.shared.state.lock().log.durable()
    }

    pub fn pending_acks(&self) -> usize {
        self.shared.state.lock().log.pending_count()
    }

    pub fn clear_messages(&self) {
        self.shared.state.lock().log.clear_live();
    }

    pub fn events(&self) -> Vec<SessionEvent> {
        self.shared.state.lock().events.snapshot()
    }

    pub fn stats(&self) -> SessionStats {
        self.shared.state.lock().stats
    }

    // ------------------------------------------------------------------
    // Passthrough
    // ------------------------------------------------------------------

    pub async fn publish(&self, message: UnifiedMessage, subject: &str) -> BrokerResult<()> {
        let adapter = self.shared.state.lock().basic()?;
        adapter.publish(message, subject).await
    }

    /// Request/reply; `None` timeout uses the configured request timeout
    pub async fn request(
        &self,
        message: UnifiedMessage,
        subject: &str,
        timeout: Option<Duration>,
    ) -> BrokerResult<Option<UnifiedMessage>> {
        let adapter = self.shared.state.lock().basic()?;
        let timeout = timeout.unwrap_or_else(|| self.shared.settings.timeouts.request());
        adapter.request(message, subject, timeout).await
    }

    pub async fn fetch_last(&self, subject: &str, count: usize) -> BrokerResult<Vec<UnifiedMessage>> {
        let adapter = self.shared.state.lock().basic()?;
        adapter.fetch_last(subject, count).await
    }

    // ------------------------------------------------------------------
    // Durable streams
    // ------------------------------------------------------------------

    fn streaming(&self) -> BrokerResult<(Arc<dyn StreamingClient>, u64)> {
        let state = self.shared.state.lock();
        Ok((state.streaming()?, state.generation))
    }

    /// Reload the stream list from the broker
    pub async fn refresh_streams(&self) -> BrokerResult<Vec<StreamInfo>> {
        let (client, generation) = self.streaming()?;
        let streams = client.list_streams().await?;
        let mut state = self.shared.state.lock();
        if state.generation == generation {
            state.streams = streams.clone();
        }
        debug!(count = streams.len(), "Stream list refreshed");
        Ok(streams)
    }

    /// Stream list as of the last refresh
    pub fn streams(&self) -> Vec<StreamInfo> {
        self.shared.state.lock().streams.clone()
    }

    pub async fn create_stream(&self, config: StreamConfig) -> BrokerResult<StreamInfo> {
        let (client, generation) = self.streaming()?;
        let info = client.create_stream(config).await?;
        let mut state = self.shared.state.lock();
        if state.generation == generation {
            state.streams.retain(|s| s.name() != info.name());
            state.streams.push(info.clone());
            state
                .events
                .info(format!("Created stream '{}'", info.name()));
        }
        Ok(info)
    }

    /// Delete a stream, stopping its consume loops first
    pub async fn delete_stream(&self, name: &str) -> BrokerResult<()> {
        let (client, generation) = self.streaming()?;
        {
            let mut state = self.shared.state.lock();
            let doomed: Vec<ConsumeKey> = state
                .consumers
                .keys()
                .filter(|key| key.stream == name)
                .cloned()
                .collect();
            for key in doomed {
                if let Some(task) = state.consumers.remove(&key) {
                    task.handle.abort();
                }
            }
        }
        client.delete_stream(name).await?;
        let mut state = self.shared.state.lock();
        if state.generation == generation {
            state.streams.retain(|s| s.name() != name);
            state.events.info(format!("Deleted stream '{}'", name));
        }
        Ok(())
    }

    pub async fn stream_info(&self, name: &str) -> BrokerResult<Option<StreamInfo>> {
        let (client, _) = self.streaming()?;
        client.stream_info(name).await
    }

    pub async fn list_consumers(&self, stream: &str) -> BrokerResult<Vec<ConsumerInfo>> {
        let (client, _) = self.streaming()?;
        client.list_consumers(stream).await
    }

    pub async fn create_consumer(
        &self,
        stream: &str,
        config: ConsumerConfig,
    ) -> BrokerResult<ConsumerInfo> {
        let (client, _) = self.streaming()?;
        let info = client.create_consumer(stream, config).await?;
        self.shared
            .state
            .lock()
            .events
            .info(format!("Created consumer {}/{}", stream, info.name()));
        Ok(info)
    }

    pub async fn delete_consumer(&self, stream: &str, consumer: &str) -> BrokerResult<()> {
        let (client, _) = self.streaming()?;
        self.stop_consume(stream, consumer);
        client.delete_consumer(stream, consumer).await?;
        self.shared
            .state
            .lock()
            .events
            .info(format!("Deleted consumer {}/{}", stream, consumer));
        Ok(())
    }

    pub async fn consumer_info(
        &self,
        stream: &str,
        consumer: &str,
    ) -> BrokerResult<Option<ConsumerInfo>> {
        let (client, _) = self.streaming()?;
        client.consumer_info(stream, consumer).await
    }

    pub async fn publish_persistent(
        &self,
        message: UnifiedMessage,
        subject: &str,
    ) -> BrokerResult<PublishAck> {
        let (client, _) = self.streaming()?;
        client.publish_persistent(message, subject).await
    }

    /// Start a consume loop for (stream, consumer); a running one is kept
    pub async fn start_consume(&self, stream: &str, consumer: &str) -> BrokerResult<()> {
        let key = ConsumeKey {
            stream: stream.to_string(),
            consumer: consumer.to_string(),
        };
        let (client, generation) = {
            let state = self.shared.state.lock();
            if state.consumers.contains_key(&key) {
                return Ok(());
            }
            (state.streaming()?, state.generation)
        };

        let subscription = client.consume(stream, consumer).await?;

        let mut state = self.shared.state.lock();
        if state.generation != generation {
            return Err(BrokerError::NotConnected);
        }
        if state.consumers.contains_key(&key) {
            return Ok(());
        }
        let id = state.task_id();
        let handle = tokio::spawn(drain_consume(
            Arc::downgrade(&self.shared),
            generation,
            id,
            Tap::Consume(key.clone()),
            subscription,
        ));
        state.consumers.insert(
            key,
            TapTask {
                id,
                pattern: format!("{}/{}", stream, consumer),
                handle,
            },
        );
        state
            .events
            .info(format!("Consuming {}/{}", stream, consumer));
        info!(stream = %stream, consumer = %consumer, "Consume started");
        Ok(())
    }

    pub fn stop_consume(&self, stream: &str, consumer: &str) -> bool {
        let key = ConsumeKey {
            stream: stream.to_string(),
            consumer: consumer.to_string(),
        };
        let mut state = self.shared.state.lock();
        match state.consumers.remove(&key) {
            Some(task) => {
                task.handle.abort();
                state
                    .events
                    .info(format!("Stopped consuming {}/{}", stream, consumer));
                true
            }
            None => false,
        }
    }

    /// Running consume loops as `stream/consumer`, sorted
    pub fn consumers(&self) -> Vec<String> {
        let mut running: Vec<String> = self
            .shared
            .state
            .lock()
            .consumers
            .values()
            .map(|t| t.pattern.clone())
            .collect();
        running.sort();
        running
    }

    /// One bounded pull; fetched deliveries also land in durable history
    pub async fn fetch(
        &self,
        stream: &str,
        consumer: &str,
        batch: usize,
        expires: Duration,
    ) -> BrokerResult<Vec<UnifiedMessage>> {
        let (client, generation) = self.streaming()?;
        let fetched = client.fetch(stream, consumer, batch, expires).await?;
        let mut visible = Vec::with_capacity(fetched.len());
        for message in fetched {
            let display = message.message().clone();
            if self.shared.intake_durable(generation, message) {
                visible.push(display);
            }
        }
        debug!(stream = %stream, consumer = %consumer, count = visible.len(), "Fetched");
        Ok(visible)
    }

    pub async fn ack(&self, id: MessageId) -> BrokerResult<()> {
        self.acknowledge(id, AckAction::Ack).await
    }

    pub async fn nak(&self, id: MessageId, delay: Option<Duration>) -> BrokerResult<()> {
        self.acknowledge(id, AckAction::Nak(delay)).await
    }

    pub async fn term(&self, id: MessageId) -> BrokerResult<()> {
        self.acknowledge(id, AckAction::Term).await
    }

    pub async fn in_progress(&self, id: MessageId) -> BrokerResult<()> {
        self.acknowledge(id, AckAction::InProgress).await
    }

    async fn acknowledge(&self, id: MessageId, action: AckAction) -> BrokerResult<()> {
        let message = self
            .shared
            .state
            .lock()
            .log
            .pending(id)
            .ok_or_else(BrokerError::message_unavailable)?;

        let result = match action {
            AckAction::Ack => message.ack().await,
            AckAction::Nak(delay) => message.nak(delay).await,
            AckAction::Term => message.term().await,
            AckAction::InProgress => message.in_progress().await,
        };

        let mut state = self.shared.state.lock();
        match &result {
            Ok(()) => {
                state.log.remove_pending(id);
                debug!(action = action.name(), id = %id, "Acknowledged");
            }
            Err(e) if *e == BrokerError::message_unavailable() => {
                state.log.remove_pending(id);
            }
            Err(e) => {
                warn!(action = action.name(), id = %id, error = %e, "Acknowledgement failed");
                state
                    .events
                    .warn(format!("{} for {} failed: {}", action.name(), id, e));
            }
        }
        result
    }
}
