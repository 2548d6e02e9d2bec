//! Main application orchestration.
//!
//! Coordinates all components:
//! - Push/poll transport
//! - Mover pipeline (normalize, rank, reconcile, publish)
//! - Watchlist store and its cross-process sync
//! - Session cache priming and saving
//! - Periodic status logging

use crate::config::AppConfig;
use crate::error::AppResult;
use crate::pipeline::MoverPipeline;
use pulse_persistence::{
    ChangeObserver, JsonFileStore, SessionCache, WatchlistStore, WATCHLIST_KEY,
};
use pulse_telemetry::Metrics;
use pulse_transport::{
    ConnectionManager, ConnectionState, ConnectionStatus, PollTick, PriceUpdate, StreamEvent,
    Subscription, TablesUpdate,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Main application.
pub struct Application {
    config: AppConfig,
    transport: Arc<ConnectionManager>,
    pipeline: Arc<MoverPipeline>,
    watchlist: Arc<WatchlistStore>,
    backend: Arc<JsonFileStore>,
    session: Option<SessionCache>,
    subscriptions: Vec<Subscription>,
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Application {
    /// Build the transport, stores and pipeline. Nothing connects until
    /// [`start`](Self::start).
    pub fn new(config: AppConfig) -> AppResult<Self> {
        config.validate()?;

        let backend = Arc::new(JsonFileStore::open(&config.storage.data_dir)?);
        let watchlist = Arc::new(WatchlistStore::load(backend.clone()));
        Metrics::watchlist_size(watchlist.len());

        let pipeline = Arc::new(MoverPipeline::new(
            &config.lists,
            config.unit_hint,
            config.flat_stream_key.clone(),
            watchlist.clone(),
        ));

        let transport = Arc::new(ConnectionManager::new(config.connection_config())?);
        let subscriptions = wire_transport(&transport, &pipeline);

        let session = config.storage.session_cache.then(|| {
            let max_age = config.storage.session_max_age();
            match &config.storage.session_cache_path {
                Some(path) => SessionCache::new(path, max_age),
                None => SessionCache::in_temp_dir("movers", max_age),
            }
        });
        if let Some(cache) = &session {
            let primed = pipeline.prime(cache.load());
            if primed > 0 {
                info!(primed, path = %cache.path().display(), "Primed lists from session cache");
            }
        }

        Ok(Self {
            config,
            transport,
            pipeline,
            watchlist,
            backend,
            session,
            subscriptions,
            token: CancellationToken::new(),
            tasks: Vec::new(),
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn transport(&self) -> &Arc<ConnectionManager> {
        &self.transport
    }

    pub fn pipeline(&self) -> &Arc<MoverPipeline> {
        &self.pipeline
    }

    pub fn watchlist(&self) -> &Arc<WatchlistStore> {
        &self.watchlist
    }

    /// Connect the transport and start background sync. Must be called from
    /// within a Tokio runtime.
    pub fn start(&mut self) {
        info!(
            base_url = %self.config.base_url,
            push_url = ?self.config.push_url,
            device = %self.config.device,
            lists = ?self.pipeline.list_names(),
            "Starting application"
        );

        self.transport.connect();
        if !self.transport.push_enabled() {
            self.transport.start_polling();
        }

        let watcher = Arc::new(self.backend.watcher(
            vec![WATCHLIST_KEY.to_string()],
            self.config.storage.watch_interval(),
        ));
        self.tasks.push(watcher.clone().spawn(self.token.child_token()));
        let observer: Arc<dyn ChangeObserver> = watcher;
        self.tasks.push(
            self.watchlist
                .clone()
                .spawn_sync(observer, self.token.child_token()),
        );
    }

    /// Run until Ctrl-C, then shut down.
    pub async fn run(mut self) -> AppResult<()> {
        self.start();

        let period = Duration::from_secs(self.config.metrics_log_interval_secs.max(1));
        let mut status_interval = tokio::time::interval(period);
        status_interval.tick().await;

        info!("Entering main event loop");
        loop {
            tokio::select! {
                _ = status_interval.tick() => {
                    self.log_status();
                }

                _ = tokio::signal::ctrl_c() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        self.shutdown().await;
        Ok(())
    }

    /// Stop every task, save the session cache and disconnect. Safe to call
    /// more than once.
    pub async fn shutdown(&mut self) {
        for subscription in &self.subscriptions {
            subscription.unsubscribe();
        }
        self.transport.disconnect();
        self.token.cancel();

        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }

        if let Some(cache) = &self.session {
            let snapshot = self.pipeline.session_snapshot();
            match cache.save(&snapshot) {
                Ok(()) => debug!(streams = snapshot.len(), "Session cache saved"),
                Err(e) => warn!(error = %e, "Failed to save session cache"),
            }
        }

        info!("Application stopped");
    }

    fn log_status(&self) {
        let lists: Vec<(String, usize)> = self
            .pipeline
            .list_names()
            .into_iter()
            .map(|name| {
                let len = self.pipeline.current_list(name).map(|l| l.len()).unwrap_or(0);
                (name.to_string(), len)
            })
            .collect();

        info!(
            state = self.transport.state().as_str(),
            polling = self.transport.is_polling(),
            reconnect_attempts = self.transport.reconnect_attempts(),
            streams = self.pipeline.slots().len(),
            watchlist = self.watchlist.len(),
            ?lists,
            "Status"
        );
    }
}

/// Route transport events into the pipeline and metrics.
fn wire_transport(
    transport: &ConnectionManager,
    pipeline: &Arc<MoverPipeline>,
) -> Vec<Subscription> {
    let tables = {
        let pipeline = pipeline.clone();
        transport.subscribe::<TablesUpdate, _>(move |payload| {
            Metrics::event_received(TablesUpdate::NAME);
            pipeline.handle_tables(payload);
        })
    };

    let prices = {
        let pipeline = pipeline.clone();
        transport.subscribe::<PriceUpdate, _>(move |payload| {
            Metrics::event_received(PriceUpdate::NAME);
            pipeline.handle_prices(payload);
        })
    };

    let status = transport.subscribe::<ConnectionStatus, _>(|event| {
        Metrics::connection_state_set(event.status.as_str());
        match event.status {
            ConnectionState::Reconnecting if event.attempt > 0 => Metrics::reconnect_attempt(),
            ConnectionState::Failed => {
                Metrics::push_failed();
                warn!(attempt = event.attempt, reason = ?event.reason, "Push channel failed");
            }
            ConnectionState::PollingFallback => info!("Serving data from polling fallback"),
            _ => {}
        }
    });

    let ticks = transport.subscribe::<PollTick, _>(|outcome| {
        Metrics::poll_tick(outcome.aborted, outcome.failed);
    });

    vec![tables, prices, status, ticks]
}
