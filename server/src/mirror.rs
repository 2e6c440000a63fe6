//! Periodic mirror of the PLC directory operation log.
//!
//! A single replica at a time pages through the upstream `/export` endpoint
//! and appends new operations through the schema abstraction; the advisory
//! lock enforces the single writer. Leadership is checked both before and
//! after pagination so a demoted replica never writes.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use skymirror_core::config::AppConfig;
use skymirror_core::db::pglock::AdvisoryLock;
use skymirror_core::plc::{self, PlcLogEntry};
use skymirror_core::ratelimit::RateLimiter;
use skymirror_core::schema::PlcDatabaseRef;

use crate::metrics::Metrics;
use crate::supervisor::Supervised;

// Current upstream rate limit is `500 per five minutes`; stay a bit under it.
const DEFAULT_RATE_LIMIT: f64 = 450.0 / 300.0;
const CAUGHT_UP_RATE_LIMIT: f64 = 0.2;
const CAUGHT_UP_THRESHOLD: Duration = Duration::from_secs(10 * 60);
const RATE_LIMIT_BURST: u32 = 4;

const RETRY_INTERVAL: Duration = Duration::from_secs(10);
const PAGE_SIZE: &str = "1000";

pub struct Mirror {
    db: PlcDatabaseRef,
    upstream: Url,
    client: Client,
    limiter: RateLimiter,
    metrics: Arc<Metrics>,
    last_completion: RwLock<Option<DateTime<Utc>>>,
}

impl Mirror {
    pub fn new(config: &AppConfig, db: PlcDatabaseRef, metrics: Arc<Metrics>) -> Result<Self> {
        let mut upstream: Url = config
            .plc_upstream
            .parse()
            .with_context(|| format!("parsing upstream URL {:?}", config.plc_upstream))?;
        upstream
            .path_segments_mut()
            .map_err(|_| anyhow::anyhow!("upstream URL cannot be a base"))?
            .pop_if_empty()
            .push("export");

        Ok(Self {
            db,
            upstream,
            client: Client::new(),
            limiter: RateLimiter::new(DEFAULT_RATE_LIMIT, RATE_LIMIT_BURST),
            metrics,
            last_completion: RwLock::new(None),
        })
    }

    /// When the latest `run_once` finished; health reporting treats the
    /// mirror as live while this is under 30 s old.
    pub fn last_completion(&self) -> Option<DateTime<Utc>> {
        *self.last_completion.read().expect("completion lock poisoned")
    }

    pub async fn last_record_timestamp(&self) -> Result<Option<DateTime<Utc>>> {
        let Some(head) = self.db.head_timestamp().await? else {
            return Ok(None);
        };
        plc::parse_timestamp(&head)
            .with_context(|| format!("parsing timestamp {head:?}"))
            .map(Some)
    }

    /// Leader loop: hold the advisory lock, mirror in 10 s rounds, back off
    /// while another replica leads.
    pub async fn run(&self, lock: &mut AdvisoryLock, shutdown: &CancellationToken) -> Result<()> {
        loop {
            if shutdown.is_cancelled() {
                info!("directory log mirror stopped");
                return Ok(());
            }

            let mut is_leader = match lock.check().await {
                Ok(leader) => leader,
                Err(err) => {
                    error!(
                        error = format!("{err:#}"),
                        "failed to check leader election status"
                    );
                    lock.reset().await;
                    sleep_or_shutdown(RETRY_INTERVAL, shutdown).await;
                    continue;
                }
            };

            if !is_leader {
                match lock.try_lock().await {
                    Ok(true) => {
                        is_leader = true;
                        info!("became the leader");
                    }
                    Ok(false) => {}
                    Err(err) => {
                        error!(error = format!("{err:#}"), "failed to acquire leader lock");
                    }
                }
            }

            if is_leader {
                match self.run_once(lock, shutdown).await {
                    Ok(()) => {
                        *self
                            .last_completion
                            .write()
                            .expect("completion lock poisoned") = Some(Utc::now());
                    }
                    Err(err) => {
                        if !shutdown.is_cancelled() {
                            error!(
                                error = format!("{err:#}"),
                                "failed to get new log entries from the directory"
                            );
                        }
                    }
                }
            }
            sleep_or_shutdown(RETRY_INTERVAL, shutdown).await;
        }
    }

    /// One catch-up pass: page from the stored head until the upstream runs
    /// dry or stops making forward progress.
    async fn run_once(&self, lock: &mut AdvisoryLock, shutdown: &CancellationToken) -> Result<()> {
        let mut cursor = self
            .db
            .head_timestamp()
            .await
            .context("failed to get the cursor")?
            .unwrap_or_default();

        match plc::parse_timestamp(&cursor) {
            Some(ts) => self.update_rate_limit(ts),
            None => {
                if !cursor.is_empty() {
                    error!(timestamp = %cursor, "failed to parse the stored cursor");
                }
            }
        }

        loop {
            let mut url = self.upstream.clone();
            {
                let mut query = url.query_pairs_mut();
                query.append_pair("count", PAGE_SIZE);
                if !cursor.is_empty() {
                    query.append_pair("after", &cursor);
                }
            }

            self.limiter.wait().await;
            if shutdown.is_cancelled() {
                return Ok(());
            }
            info!(cursor = %cursor, "listing directory log entries");
            debug!(url = %url, "request URL");

            let response = self
                .client
                .get(url)
                .send()
                .await
                .context("sending request")?;
            if response.status() != StatusCode::OK {
                bail!("unexpected status code: {}", response.status());
            }
            let body = response.text().await.context("reading response body")?;

            let old_cursor = cursor.clone();
            let new_entries = parse_export_page(&body)?;

            let mut last_timestamp = None;
            for entry in &new_entries {
                cursor = entry.created_at.clone();
                match plc::parse_timestamp(&entry.created_at) {
                    Some(ts) => {
                        self.metrics.plc_last_event_timestamp.set(ts.timestamp());
                        last_timestamp = Some(ts);
                    }
                    None => {
                        warn!(timestamp = %entry.created_at, "failed to parse entry timestamp")
                    }
                }
            }

            if new_entries.is_empty() || cursor == old_cursor {
                break;
            }

            if !lock
                .check()
                .await
                .context("failed to check leadership status")?
            {
                warn!("lost leadership status");
                return Ok(());
            }

            self.db
                .append_entries(&new_entries)
                .await
                .context("inserting log entries into database")?;
            self.metrics
                .plc_log_entries_total
                .inc_by(new_entries.len() as u64);

            if let Some(ts) = last_timestamp {
                self.update_rate_limit(ts);
            }
            info!(count = new_entries.len(), cursor = %cursor, "got directory log entries");
        }
        Ok(())
    }

    /// Slow down when caught up so new records arrive in larger batches.
    fn update_rate_limit(&self, last_record_timestamp: DateTime<Utc>) {
        let age = Utc::now()
            .signed_duration_since(last_record_timestamp)
            .to_std()
            .unwrap_or(Duration::ZERO);
        let desired = desired_rate(age);
        if (self.limiter.rate() - desired).abs() > 1e-7 {
            self.limiter.set_rate(desired);
        }
    }
}

fn desired_rate(last_record_age: Duration) -> f64 {
    if last_record_age < CAUGHT_UP_THRESHOLD {
        CAUGHT_UP_RATE_LIMIT
    } else {
        DEFAULT_RATE_LIMIT
    }
}

/// The export endpoint streams newline-delimited JSON entries.
fn parse_export_page(body: &str) -> Result<Vec<PlcLogEntry>> {
    serde_json::Deserializer::from_str(body)
        .into_iter::<PlcLogEntry>()
        .collect::<Result<Vec<_>, _>>()
        .context("parsing log entry")
}

async fn sleep_or_shutdown(duration: Duration, shutdown: &CancellationToken) {
    tokio::select! {
        _ = shutdown.cancelled() => {}
        _ = tokio::time::sleep(duration) => {}
    }
}

/// Pairs the shared mirror with the advisory lock it drives so the
/// supervisor can restart the loop as one unit.
pub struct MirrorTask {
    pub mirror: Arc<Mirror>,
    pub lock: AdvisoryLock,
}

#[async_trait]
impl Supervised for MirrorTask {
    fn name(&self) -> &str {
        "plc-mirror"
    }

    async fn run_once(&mut self, shutdown: &CancellationToken) -> Result<()> {
        self.mirror.run(&mut self.lock, shutdown).await
    }
}
