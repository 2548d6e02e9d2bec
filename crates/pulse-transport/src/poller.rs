//! REST polling fallback.
//!
//! Fetches every configured snapshot endpoint once per tick and publishes
//! each body as a `tables:update` keyed by the endpoint's stream key. A tick
//! that is still in flight when the next one is due is dropped, which aborts
//! its requests, so at most one set of requests is ever outstanding.

use crate::error::{TransportError, TransportResult};
use crate::event_bus::EventBus;
use crate::message::{PollOutcome, PollTick, TablePayload, TablesUpdate};
use futures_util::future::join_all;
use rand::Rng;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A REST snapshot endpoint and the stream key its body is published under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollEndpoint {
    /// Stream key (e.g. `"gainers_1m"`).
    pub key: String,
    /// Path relative to the REST base URL, or an absolute URL.
    pub path: String,
}

impl PollEndpoint {
    pub fn new(key: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            path: path.into(),
        }
    }

    pub fn url(&self, base_url: &str) -> String {
        if self.path.starts_with("http://") || self.path.starts_with("https://") {
            return self.path.clone();
        }
        format!(
            "{}/{}",
            base_url.trim_end_matches('/'),
            self.path.trim_start_matches('/')
        )
    }
}

pub struct Poller {
    http: Client,
    base_url: String,
    endpoints: Vec<PollEndpoint>,
    interval_ms: u64,
    jitter_ms: u64,
    bus: EventBus,
}

impl Poller {
    pub fn new(
        http: Client,
        base_url: String,
        endpoints: Vec<PollEndpoint>,
        interval_ms: u64,
        jitter_ms: u64,
        bus: EventBus,
    ) -> Self {
        Self {
            http,
            base_url,
            endpoints,
            interval_ms,
            jitter_ms,
            bus,
        }
    }

    /// Poll until cancelled.
    pub async fn run(self, token: CancellationToken) {
        info!(
            endpoints = self.endpoints.len(),
            interval_ms = self.interval_ms,
            "Polling loop started"
        );

        loop {
            let interval = poll_interval(self.interval_ms, self.jitter_ms);
            let deadline = Instant::now() + interval;

            let outcome = tokio::select! {
                () = token.cancelled() => break,
                () = sleep_until(deadline) => {
                    warn!(
                        interval_ms = interval.as_millis() as u64,
                        "Poll tick overran its interval, aborting in-flight requests"
                    );
                    PollOutcome { succeeded: 0, failed: 0, aborted: true }
                }
                outcome = self.poll_once() => outcome,
            };

            self.bus.publish::<PollTick>(&outcome);
            if outcome.aborted {
                continue;
            }

            tokio::select! {
                () = token.cancelled() => break,
                () = sleep_until(deadline) => {}
            }
        }

        info!("Polling loop stopped");
    }

    /// Fetch every endpoint once and publish the successful bodies.
    pub async fn poll_once(&self) -> PollOutcome {
        let results = join_all(
            self.endpoints
                .iter()
                .map(|endpoint| async move { (endpoint, self.fetch(endpoint).await) }),
        )
        .await;

        let mut outcome = PollOutcome {
            succeeded: 0,
            failed: 0,
            aborted: false,
        };

        for (endpoint, result) in results {
            match result {
                Ok(body) => {
                    outcome.succeeded += 1;
                    self.bus
                        .publish::<TablesUpdate>(&TablePayload::keyed(&endpoint.key, body));
                }
                Err(e) => {
                    outcome.failed += 1;
                    warn!(key = %endpoint.key, error = %e, "Poll request failed");
                }
            }
        }

        debug!(
            succeeded = outcome.succeeded,
            failed = outcome.failed,
            "Poll tick complete"
        );
        outcome
    }

    async fn fetch(&self, endpoint: &PollEndpoint) -> TransportResult<Value> {
        let url = endpoint.url(&self.base_url);
        let response = self.http.get(&url).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::HttpStatus {
                status: status.as_u16(),
                url,
            });
        }

        Ok(response.json::<Value>().await?)
    }
}

/// Poll interval plus up to `jitter_ms` of jitter.
pub fn poll_interval(interval_ms: u64, jitter_ms: u64) -> Duration {
    Duration::from_millis(interval_ms + rand_jitter(jitter_ms))
}

/// Random jitter in `[0, max_ms]`, drawn per call so that clients started
/// together spread their requests.
fn rand_jitter(max_ms: u64) -> u64 {
    if max_ms == 0 {
        return 0;
    }
    rand::thread_rng().gen_range(0..=max_ms)
}
