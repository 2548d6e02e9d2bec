//! Push connection manager.
//!
//! Owns exactly one push session (WebSocket or SSE) and at most one REST
//! polling loop. Handles the connection state machine, reconnect backoff,
//! suspension while backgrounded, liveness degradation, and the switch to
//! polling once the reconnect budget is spent.

use crate::error::{TransportError, TransportResult};
use crate::event_bus::{EventBus, StreamEvent, Subscription};
use crate::liveness::LivenessMonitor;
use crate::message::{ConnectionEvent, ConnectionStatus, PushMessage};
use crate::poller::{PollEndpoint, Poller};
use crate::sse::SseDecoder;
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex as TokioMutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// REST base URL used by the polling fallback.
    pub base_url: String,
    /// Push URL: `ws://`/`wss://` for WebSocket, `http://`/`https://` for SSE.
    pub push_url: Option<String>,
    /// Force-disable the push channel.
    pub push_enabled: bool,
    /// Reconnect attempts before giving up on push (0 = infinite).
    pub max_reconnect_attempts: u32,
    /// Base delay for exponential backoff.
    pub reconnect_base_delay_ms: u64,
    /// Ceiling for exponential backoff.
    pub reconnect_max_delay_ms: u64,
    /// Push silence that marks the channel degraded (0 = disabled).
    pub stale_after_ms: u64,
    /// Start polling while the push channel is degraded.
    pub poll_on_degraded: bool,
    /// Polling interval.
    pub poll_interval_ms: u64,
    /// Maximum jitter added to each polling interval.
    pub poll_jitter_ms: u64,
    /// Per-request timeout for polling.
    pub request_timeout_ms: u64,
    /// Connect timeout for push and polling.
    pub connect_timeout_ms: u64,
    /// Snapshot endpoints fetched by the polling fallback.
    pub poll_endpoints: Vec<PollEndpoint>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:5001".to_string(),
            push_url: None,
            push_enabled: true,
            max_reconnect_attempts: 8,
            reconnect_base_delay_ms: 1_000,
            reconnect_max_delay_ms: 30_000,
            stale_after_ms: 45_000,
            poll_on_degraded: true,
            poll_interval_ms: 10_000,
            poll_jitter_ms: 1_000,
            request_timeout_ms: 8_000,
            connect_timeout_ms: 10_000,
            poll_endpoints: Vec::new(),
        }
    }
}

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Push is open but unhealthy; polling carries the data.
    Degraded,
    Reconnecting,
    /// Reconnect budget exhausted.
    Failed,
    /// Push is down and polling is the only source.
    PollingFallback,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Degraded => "degraded",
            Self::Reconnecting => "reconnecting",
            Self::Failed => "failed",
            Self::PollingFallback => "polling_fallback",
        }
    }

    /// Whether the push channel is open.
    pub fn is_push_open(&self) -> bool {
        matches!(self, Self::Connected | Self::Degraded)
    }
}

/// Push channel flavour, derived from the push URL scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushKind {
    WebSocket,
    Sse,
}

impl PushKind {
    pub fn from_url(url: &str) -> TransportResult<Self> {
        let scheme = url.split_once("://").map(|(s, _)| s).unwrap_or("");
        match scheme.to_ascii_lowercase().as_str() {
            "ws" | "wss" => Ok(Self::WebSocket),
            "http" | "https" => Ok(Self::Sse),
            _ => Err(TransportError::UnsupportedScheme(url.to_string())),
        }
    }
}

/// Host visibility. Reconnects wait while hidden.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Visibility {
    #[default]
    Visible,
    Hidden,
}

/// Externally observed network quality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NetworkQuality {
    #[default]
    Good,
    Poor,
}

struct TaskHandle {
    token: CancellationToken,
    join: JoinHandle<()>,
}

impl TaskHandle {
    fn is_running(&self) -> bool {
        !self.join.is_finished()
    }
}

/// Push/poll connection manager.
pub struct ConnectionManager {
    config: ConnectionConfig,
    push_kind: Option<PushKind>,
    bus: EventBus,
    state: Arc<RwLock<ConnectionState>>,
    reconnect_count: AtomicU32,
    liveness: LivenessMonitor,
    /// Outbound frames (drained by the WebSocket session).
    outbound_tx: mpsc::Sender<String>,
    outbound_rx: TokioMutex<mpsc::Receiver<String>>,
    /// Client for polling (with request timeout).
    http: reqwest::Client,
    /// Client for SSE (no overall timeout; the stream is long-lived).
    stream_http: reqwest::Client,
    session: Mutex<Option<TaskHandle>>,
    poller: Mutex<Option<TaskHandle>>,
    visibility: watch::Sender<Visibility>,
    quality: watch::Sender<NetworkQuality>,
}

impl ConnectionManager {
    /// Create a new connection manager. Nothing connects until [`connect`].
    ///
    /// [`connect`]: ConnectionManager::connect
    pub fn new(config: ConnectionConfig) -> TransportResult<Self> {
        let push_kind = match (&config.push_url, config.push_enabled) {
            (Some(url), true) => Some(PushKind::from_url(url)?),
            _ => None,
        };

        let connect_timeout = Duration::from_millis(config.connect_timeout_ms);
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| {
                TransportError::ConnectionFailed(format!("Failed to create HTTP client: {e}"))
            })?;
        let stream_http = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| {
                TransportError::ConnectionFailed(format!("Failed to create SSE client: {e}"))
            })?;

        let (outbound_tx, outbound_rx) = mpsc::channel(100);
        let (visibility, _) = watch::channel(Visibility::default());
        let (quality, _) = watch::channel(NetworkQuality::default());

        Ok(Self {
            liveness: LivenessMonitor::new(config.stale_after_ms),
            config,
            push_kind,
            bus: EventBus::new(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            reconnect_count: AtomicU32::new(0),
            outbound_tx,
            outbound_rx: TokioMutex::new(outbound_rx),
            http,
            stream_http,
            session: Mutex::new(None),
            poller: Mutex::new(None),
            visibility,
            quality,
        })
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// The bus that push and poll payloads are published on.
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Register a callback for a typed event.
    pub fn subscribe<E, F>(&self, callback: F) -> Subscription
    where
        E: StreamEvent,
        F: Fn(&E::Payload) + Send + Sync + 'static,
    {
        self.bus.subscribe::<E, F>(callback)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    pub fn push_enabled(&self) -> bool {
        self.push_kind.is_some()
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_count.load(Ordering::Acquire)
    }

    pub fn is_polling(&self) -> bool {
        self.poller
            .lock()
            .as_ref()
            .is_some_and(TaskHandle::is_running)
    }

    /// Start the push session.
    ///
    /// No-op while a session is already running. With push disabled this
    /// emits a `failed` connection event and returns; callers then rely on
    /// [`start_polling`](Self::start_polling). Must be called from within a
    /// Tokio runtime.
    pub fn connect(self: &Arc<Self>) {
        if self.push_kind.is_none() {
            info!("Push channel disabled, reporting failed");
            *self.state.write() = ConnectionState::Failed;
            self.emit_status(
                ConnectionState::Failed,
                Some(TransportError::Disabled.to_string()),
            );
            return;
        }

        let mut session = self.session.lock();
        if session.as_ref().is_some_and(TaskHandle::is_running) {
            debug!("connect() ignored, push session already running");
            return;
        }

        let token = CancellationToken::new();
        let manager = Arc::clone(self);
        let loop_token = token.clone();
        let join = tokio::spawn(async move { manager.run_push_loop(loop_token).await });
        *session = Some(TaskHandle { token, join });
    }

    /// Tear down the push session, the polling loop and their timers.
    /// Safe to call any number of times.
    pub fn disconnect(&self) {
        let session = self.session.lock().take();
        let poller = self.poller.lock().take();

        let had_tasks = session.is_some() || poller.is_some();
        for handle in [session, poller].into_iter().flatten() {
            handle.token.cancel();
        }

        self.reconnect_count.store(0, Ordering::Release);
        self.set_state(ConnectionState::Disconnected, None);
        if had_tasks {
            info!("Connection manager disconnected");
        }
    }

    /// Best-effort send over the push channel.
    ///
    /// Dropped silently unless a WebSocket session is open.
    pub fn send(&self, event: &str, data: Value) {
        if self.push_kind != Some(PushKind::WebSocket) || !self.state().is_push_open() {
            debug!(event = %event, "Push channel not writable, dropping send");
            return;
        }

        let text = match PushMessage::new(event, data).to_text() {
            Ok(text) => text,
            Err(e) => {
                debug!(event = %event, error = %e, "Failed to encode outbound frame");
                return;
            }
        };

        if let Err(e) = self.outbound_tx.try_send(text) {
            debug!(event = %event, error = %e, "Outbound queue unavailable, dropping send");
        }
    }

    /// Start the REST polling loop. At most one loop runs at a time.
    pub fn start_polling(&self) {
        let mut poller = self.poller.lock();
        if poller.as_ref().is_some_and(TaskHandle::is_running) {
            return;
        }
        if self.config.poll_endpoints.is_empty() {
            warn!("No poll endpoints configured, polling fallback unavailable");
            return;
        }

        let token = CancellationToken::new();
        let task = Poller::new(
            self.http.clone(),
            self.config.base_url.clone(),
            self.config.poll_endpoints.clone(),
            self.config.poll_interval_ms,
            self.config.poll_jitter_ms,
            self.bus.clone(),
        );
        let join = tokio::spawn(task.run(token.clone()));
        *poller = Some(TaskHandle { token, join });
        drop(poller);

        info!(
            interval_ms = self.config.poll_interval_ms,
            "Polling fallback started"
        );
        if matches!(
            self.state(),
            ConnectionState::Disconnected | ConnectionState::Failed
        ) {
            self.set_state(ConnectionState::PollingFallback, None);
        }
    }

    pub fn stop_polling(&self) {
        if let Some(handle) = self.poller.lock().take() {
            handle.token.cancel();
            info!("Polling fallback stopped");
        }
    }

    /// Report host visibility. Reconnect attempts wait while hidden.
    pub fn set_visibility(&self, visibility: Visibility) {
        let previous = self.visibility.send_replace(visibility);
        if previous != visibility {
            info!(?visibility, "Visibility changed");
        }
    }

    /// Report network quality. Poor quality switches to polling proactively
    /// when `poll_on_degraded` is set; good quality switches back.
    pub fn report_network_quality(&self, quality: NetworkQuality) {
        let previous = self.quality.send_replace(quality);
        if previous == quality || !self.config.poll_on_degraded {
            return;
        }

        match quality {
            NetworkQuality::Poor => {
                warn!("Network quality degraded, switching to polling");
                if self.state() == ConnectionState::Connected {
                    self.set_state(ConnectionState::Degraded, Some("poor network".to_string()));
                }
                self.start_polling();
            }
            NetworkQuality::Good => {
                info!("Network quality restored");
                if self.state() == ConnectionState::Degraded && !self.liveness.is_stale() {
                    self.set_state(ConnectionState::Connected, None);
                    self.stop_polling();
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Push loop
    // ------------------------------------------------------------------

    async fn run_push_loop(self: Arc<Self>, token: CancellationToken) {
        self.reconnect_count.store(0, Ordering::Release);
        if !self.transition_live(&token, ConnectionState::Connecting, None, false) {
            return;
        }

        loop {
            if token.is_cancelled() {
                return;
            }

            match self.run_session(&token).await {
                Ok(()) => info!("Push channel closed"),
                Err(e) => warn!(error = %e, "Push channel error"),
            }

            if token.is_cancelled() {
                info!("Shutdown requested, not reconnecting");
                return;
            }

            let attempt = self.reconnect_count.fetch_add(1, Ordering::AcqRel) + 1;

            if self.config.max_reconnect_attempts > 0
                && attempt > self.config.max_reconnect_attempts
            {
                error!(attempt, "Max reconnection attempts reached, falling back to polling");
                let failed = self.transition_live(
                    &token,
                    ConnectionState::Failed,
                    Some("max reconnection attempts reached".to_string()),
                    true,
                );
                if failed {
                    self.start_polling();
                    // A disconnect racing the fallback must not leave a poller behind.
                    if token.is_cancelled() {
                        self.stop_polling();
                        self.set_state(ConnectionState::Disconnected, None);
                    }
                }
                return;
            }

            // Reported per attempt so observers can count retries.
            if !self.transition_live(&token, ConnectionState::Reconnecting, None, true) {
                return;
            }

            if !self.wait_until_visible(&token).await {
                return;
            }

            let delay = calculate_backoff_delay(
                attempt,
                self.config.reconnect_base_delay_ms,
                self.config.reconnect_max_delay_ms,
            );
            warn!(attempt, delay_ms = delay.as_millis() as u64, "Reconnecting");

            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = token.cancelled() => {
                    info!("Shutdown requested during backoff");
                    return;
                }
            }
        }
    }

    /// Block while backgrounded. Returns `false` if cancelled meanwhile.
    async fn wait_until_visible(&self, token: &CancellationToken) -> bool {
        let mut rx = self.visibility.subscribe();
        loop {
            if *rx.borrow_and_update() == Visibility::Visible {
                return true;
            }
            info!("Reconnect suspended while hidden");
            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        return true;
                    }
                }
                () = token.cancelled() => return false,
            }
        }
    }

    async fn run_session(&self, token: &CancellationToken) -> TransportResult<()> {
        let url = self
            .config
            .push_url
            .as_deref()
            .ok_or(TransportError::Disabled)?;

        match self.push_kind {
            Some(PushKind::WebSocket) => self.run_websocket(url, token).await,
            Some(PushKind::Sse) => self.run_sse(url, token).await,
            None => Err(TransportError::Disabled),
        }
    }

    async fn run_websocket(&self, url: &str, token: &CancellationToken) -> TransportResult<()> {
        info!(url = %url, "Connecting to WebSocket");

        let connect_timeout = Duration::from_millis(self.config.connect_timeout_ms);
        let handshake = tokio::time::timeout(connect_timeout, connect_async(url));
        let (ws_stream, _response) = tokio::select! {
            () = token.cancelled() => {
                info!("Shutdown requested during WebSocket handshake");
                return Ok(());
            }
            result = handshake => result
                .map_err(|_| TransportError::ConnectionFailed("connect timed out".to_string()))??,
        };
        let (mut write, mut read) = ws_stream.split();

        if !self.on_push_connected(token) {
            if let Err(e) = write.send(Message::Close(None)).await {
                debug!(error = %e, "Failed to close socket opened after shutdown");
            }
            return Ok(());
        }

        // Frames queued while disconnected are stale.
        {
            let mut rx = self.outbound_rx.lock().await;
            while rx.try_recv().is_ok() {}
        }

        loop {
            let outbound_recv = async { self.outbound_rx.lock().await.recv().await };

            tokio::select! {
                () = token.cancelled() => {
                    if let Err(e) = write.send(Message::Close(None)).await {
                        debug!(error = %e, "Failed to send Close frame during shutdown");
                    }
                    return Ok(());
                }

                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => self.handle_push_text(&text),
                        Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                            Ok(text) => self.handle_push_text(&text),
                            Err(_) => debug!("Dropping non-UTF-8 binary frame"),
                        },
                        // Control frames keep proxies happy but carry no data,
                        // so they do not count toward liveness.
                        Some(Ok(Message::Ping(data))) => {
                            write.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Pong(_))) => trace!("Pong received"),
                        Some(Ok(Message::Close(frame))) => {
                            let (code, reason) = frame
                                .map(|f| (u16::from(f.code), f.reason.to_string()))
                                .unwrap_or((1000, "Normal close".to_string()));
                            warn!(code, %reason, "WebSocket closed by server");
                            return Err(TransportError::ConnectionClosed { code, reason });
                        }
                        Some(Ok(Message::Frame(_))) => {}
                        Some(Err(e)) => {
                            error!(error = %e, "WebSocket read error");
                            return Err(e.into());
                        }
                        None => {
                            warn!("WebSocket stream ended");
                            return Ok(());
                        }
                    }
                }

                outbound = outbound_recv => {
                    if let Some(text) = outbound {
                        write.send(Message::Text(text)).await?;
                    }
                }

                () = self.liveness.wait_for_check() => {
                    self.check_liveness();
                    if self.liveness.should_ping() {
                        write.send(Message::Ping(Vec::new())).await?;
                        self.liveness.record_ping();
                    }
                }
            }
        }
    }

    async fn run_sse(&self, url: &str, token: &CancellationToken) -> TransportResult<()> {
        info!(url = %url, "Connecting to SSE stream");

        let request = self
            .stream_http
            .get(url)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send();
        let response = tokio::select! {
            () = token.cancelled() => {
                info!("Shutdown requested while opening SSE stream");
                return Ok(());
            }
            result = request => result?,
        };

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        if !self.on_push_connected(token) {
            return Ok(());
        }

        let mut body = response.bytes_stream();
        let mut decoder = SseDecoder::new();

        loop {
            tokio::select! {
                () = token.cancelled() => return Ok(()),

                chunk = body.next() => {
                    match chunk {
                        Some(Ok(bytes)) => {
                            for event in decoder.push(&bytes) {
                                self.handle_push_message(event.into_push_message());
                            }
                        }
                        Some(Err(e)) => {
                            error!(error = %e, "SSE read error");
                            return Err(e.into());
                        }
                        None => {
                            warn!("SSE stream ended");
                            return Ok(());
                        }
                    }
                }

                () = self.liveness.wait_for_check() => self.check_liveness(),
            }
        }
    }

    /// Returns `false` when the session was cancelled while the channel was
    /// opening; the caller drops the channel.
    fn on_push_connected(&self, token: &CancellationToken) -> bool {
        self.reconnect_count.store(0, Ordering::Release);
        self.liveness.reset();
        if !self.transition_live(token, ConnectionState::Connected, None, false) {
            debug!("Push channel opened after disconnect, dropping it");
            return false;
        }
        self.stop_polling();
        info!("Push channel connected");
        true
    }

    fn handle_push_text(&self, text: &str) {
        match PushMessage::parse(text) {
            Ok(msg) => self.handle_push_message(msg),
            Err(e) => {
                self.on_push_activity();
                debug!(error = %e, "Dropping unparsable push frame");
            }
        }
    }

    fn handle_push_message(&self, msg: PushMessage) {
        self.on_push_activity();
        trace!(event = %msg.event, "Push message received");
        self.bus.dispatch_raw(&msg.event, &msg.data);
    }

    /// Any traffic proves the channel is alive again.
    fn on_push_activity(&self) {
        self.liveness.record_message();
        if self.state() == ConnectionState::Degraded
            && *self.quality.borrow() == NetworkQuality::Good
        {
            info!("Push channel recovered");
            self.set_state(ConnectionState::Connected, None);
            self.stop_polling();
        }
    }

    fn check_liveness(&self) {
        if self.state() != ConnectionState::Connected || !self.liveness.is_stale() {
            return;
        }
        warn!(
            silence_ms = self.liveness.silence().as_millis() as u64,
            "Push channel silent, marking degraded"
        );
        self.set_state(ConnectionState::Degraded, Some("push channel silent".to_string()));
        if self.config.poll_on_degraded {
            self.start_polling();
        }
    }

    // ------------------------------------------------------------------
    // State
    // ------------------------------------------------------------------

    fn set_state(&self, next: ConnectionState, reason: Option<String>) {
        let changed = {
            let mut state = self.state.write();
            let changed = *state != next;
            *state = next;
            changed
        };
        if changed {
            self.emit_status(next, reason);
        }
    }

    /// Transition on behalf of the push task unless `token` is cancelled.
    ///
    /// The token is checked under the state lock. `disconnect` cancels before
    /// it takes the lock, so it always writes the final state.
    fn transition_live(
        &self,
        token: &CancellationToken,
        next: ConnectionState,
        reason: Option<String>,
        always_emit: bool,
    ) -> bool {
        let changed = {
            let mut state = self.state.write();
            if token.is_cancelled() {
                return false;
            }
            let changed = *state != next;
            *state = next;
            changed
        };
        if changed || always_emit {
            self.emit_status(next, reason);
        }
        true
    }

    fn emit_status(&self, status: ConnectionState, reason: Option<String>) {
        let event = ConnectionEvent {
            status,
            attempt: self.reconnect_attempts(),
            reason,
        };
        debug!(status = status.as_str(), attempt = event.attempt, "Connection state changed");
        self.bus.publish::<ConnectionStatus>(&event);
    }
}

/// Exponential backoff: `base * 2^(attempt-1)`, capped at `max`.
///
/// No jitter is added, so delays never decrease and never exceed `max`.
pub fn calculate_backoff_delay(attempt: u32, base_ms: u64, max_ms: u64) -> Duration {
    let exponent = attempt.saturating_sub(1).min(32);
    let delay = base_ms.saturating_mul(1u64 << exponent);
    Duration::from_millis(delay.min(max_ms))
}
