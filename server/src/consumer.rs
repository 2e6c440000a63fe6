//! Long-lived firehose subscription to one repository host.
//!
//! Each consumer owns its `pds` row: the in-memory copy is a cache that
//! converges with the database on every durable write, and no other task
//! touches those columns. Events are processed strictly in upstream `seq`
//! order.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use futures_util::stream::{SplitStream, StreamExt};
use futures_util::SinkExt;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use url::Url;

use skymirror_core::car;
use skymirror_core::db::index_store::{IndexStore, NewRecord};
use skymirror_core::firehose::{self, CommitEvent, Event, Frame};
use skymirror_core::models::RepoHost;

use crate::metrics::Metrics;
use crate::supervisor::Supervised;

const SUBSCRIBE_PATH: &str = "xrpc/com.atproto.sync.subscribeRepos";
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(60);

/// Cursor writes within this sequence window and persist interval stay in
/// memory only; small skips are recovered by the resume-from-lag logic on
/// reconnect.
const CURSOR_PERSIST_SEQ_WINDOW: i64 = 100;
const CURSOR_PERSIST_INTERVAL: Duration = Duration::from_secs(5);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct Consumer {
    store: IndexStore,
    remote: RepoHost,
    metrics: Arc<Metrics>,
    last_cursor_persist: Option<Instant>,
}

impl Consumer {
    pub fn new(store: IndexStore, remote: RepoHost, metrics: Arc<Metrics>) -> Self {
        Self {
            store,
            remote,
            metrics,
            last_cursor_persist: None,
        }
    }

    /// One subscription attempt: dial, pump keepalive pings, process frames
    /// until the stream errors or shutdown is requested.
    async fn subscribe(&mut self, shutdown: &CancellationToken) -> Result<()> {
        let url = subscribe_url(&self.remote.host, self.remote.cursor)?;
        let (ws, _response) = connect_async(url.as_str())
            .await
            .context("establishing websocket connection")?;
        let (mut sink, mut stream) = ws.split();

        let pinger = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(KEEPALIVE_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(err) = sink.send(Message::Ping(b"ping".to_vec())).await {
                    error!(error = format!("{err:#}"), "failed to send ping");
                    return;
                }
            }
        });

        let result = self.read_loop(&mut stream, shutdown).await;
        pinger.abort();
        result
    }

    async fn read_loop(
        &mut self,
        stream: &mut SplitStream<WsStream>,
        shutdown: &CancellationToken,
    ) -> Result<()> {
        let mut first = true;
        loop {
            let message = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                message = stream.next() => message,
            };
            let message = match message {
                Some(message) => message.context("websocket read")?,
                None => bail!("websocket stream ended"),
            };
            let payload = match message {
                Message::Binary(bytes) => bytes,
                Message::Text(text) => text.into_bytes(),
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
                Message::Close(frame) => bail!("websocket closed by upstream: {frame:?}"),
            };

            match firehose::decode_frame(&payload)? {
                Frame::Event { kind, body } => {
                    let event = Event::parse(&kind, &body)
                        .with_context(|| format!("parsing {kind} event"))?;
                    self.process_event(event, first).await?;
                }
                Frame::Unknown { op } => warn!(op, "unknown 'op' value received"),
            }
            first = false;
        }
    }

    async fn process_event(&mut self, event: Event, first: bool) -> Result<()> {
        match event {
            Event::Commit(commit) => {
                self.metrics.record_event("commit");
                self.prologue(commit.seq, first).await?;
                self.process_commit(commit).await?;
            }
            Event::Handle(handle) => {
                self.metrics.record_event("handle");
                self.prologue(handle.seq, first).await?;
                // Handles are not stored.
                self.update_cursor(handle.seq).await?;
            }
            Event::Migrate(migrate) => {
                self.metrics.record_event("migrate");
                self.prologue(migrate.seq, first).await?;
                // TODO: rebind the repo to its new host once the re-indexer
                // can pick it up from there.
                debug!(
                    did = %migrate.did,
                    migrate_to = migrate.migrate_to.as_deref().unwrap_or(""),
                    "repo migration"
                );
                self.update_cursor(migrate.seq).await?;
            }
            Event::Tombstone(tombstone) => {
                self.metrics.record_event("tombstone");
                self.prologue(tombstone.seq, first).await?;
                debug!(did = %tombstone.did, "repo tombstoned");
                self.update_cursor(tombstone.seq).await?;
            }
            Event::Info(info) => {
                self.metrics.record_event("info");
                match info.name.as_str() {
                    "OutdatedCursor" => {
                        if !first {
                            warn!(
                                message = info.message.as_deref().unwrap_or(""),
                                "received cursor reset notification in the middle of a stream"
                            );
                        }
                        self.remote.first_cursor_since_reset = 0;
                    }
                    other => error!(name = other, "unknown #info message"),
                }
            }
            Event::Unknown { kind } => warn!(kind, "unknown message type received"),
        }
        Ok(())
    }

    /// Shared by all seq-carrying events: establish the reset boundary when
    /// none is known, and detect silent resets on the first frame.
    async fn prologue(&mut self, seq: i64, first: bool) -> Result<()> {
        if self.remote.first_cursor_since_reset == 0 {
            self.reset_cursor(seq)
                .await
                .context("handling cursor reset")?;
        }
        if first {
            self.check_for_cursor_reset(seq).await?;
        }
        Ok(())
    }

    /// Some upstreams do not emit an explicit #info when connecting with an
    /// outdated cursor; a sequence gap on the first frame is a silent reset.
    async fn check_for_cursor_reset(&mut self, seq: i64) -> Result<()> {
        if seq == self.remote.cursor + 1 {
            return Ok(());
        }
        self.reset_cursor(seq).await
    }

    async fn reset_cursor(&mut self, seq: i64) -> Result<()> {
        warn!(
            host = %self.remote.host,
            from = self.remote.cursor,
            to = seq,
            "cursor reset"
        );
        self.store
            .set_host_reset_boundary(self.remote.id, seq)
            .await
            .context("updating first_cursor_since_reset")?;
        self.remote.first_cursor_since_reset = seq;
        Ok(())
    }

    /// Advances the cursor, amortizing the durable write: small advances
    /// shortly after a persist stay in memory.
    async fn update_cursor(&mut self, seq: i64) -> Result<()> {
        let elapsed = self.last_cursor_persist.map(|at| at.elapsed());
        if !cursor_write_due(seq, self.remote.cursor, elapsed) {
            self.remote.cursor = seq;
            return Ok(());
        }

        self.store
            .update_host_cursor(self.remote.id, seq)
            .await
            .context("updating cursor")?;
        self.remote.cursor = seq;
        self.last_cursor_persist = Some(Instant::now());
        Ok(())
    }

    async fn process_commit(&mut self, commit: CommitEvent) -> Result<()> {
        let repo = self
            .store
            .ensure_repo(&commit.repo, self.remote.id)
            .await
            .with_context(|| format!("ensuring repo {:?}", commit.repo))?;
        if repo.pds != self.remote.id {
            error!(
                did = %commit.repo,
                rev = %commit.rev,
                "commit from an incorrect host, skipping"
            );
            return Ok(());
        }

        let mut expect_records = false;
        let mut deletions = Vec::new();
        for op in &commit.ops {
            match op.action.as_str() {
                "create" | "update" => expect_records = true,
                "delete" => deletions.push(op.path.as_str()),
                other => warn!(action = other, "unknown op action"),
            }
        }

        for path in deletions {
            let Some((collection, rkey)) = split_record_path(path) else {
                continue;
            };
            self.store
                .mark_record_deleted(repo.id, collection, rkey)
                .await
                .with_context(|| format!("failed to mark {}/{path} as deleted", commit.repo))?;
        }

        let extracted =
            car::extract_records(&commit.blocks).context("failed to extract records")?;
        let mut records = Vec::new();
        for (path, content) in extracted {
            let Some((collection, rkey)) = split_record_path(&path) else {
                warn!(path, "unexpected record key format");
                continue;
            };
            records.push(NewRecord {
                repo: repo.id,
                collection: collection.to_string(),
                rkey: rkey.to_string(),
                content,
            });
        }
        if records.is_empty() && expect_records {
            debug!(seq = commit.seq, host = %self.remote.host, "no records extracted");
        }
        self.store.upsert_records(&records).await?;

        if commit.too_big {
            // Elided payload; stamping the rev boundary triggers a full
            // re-index of the repo.
            self.store
                .set_repo_reset_boundary(repo.id, self.remote.first_cursor_since_reset, &commit.rev)
                .await
                .context("failed to update repo info after cursor reset")?;
        }

        if repo.first_cursor_since_reset != self.remote.first_cursor_since_reset {
            self.store
                .set_repo_reset_boundary(repo.id, self.remote.first_cursor_since_reset, &commit.rev)
                .await
                .context("failed to update repo info after cursor reset")?;
        }

        self.update_cursor(commit.seq).await
    }
}

#[async_trait::async_trait]
impl Supervised for Consumer {
    fn name(&self) -> &str {
        &self.remote.host
    }

    async fn run_once(&mut self, shutdown: &CancellationToken) -> Result<()> {
        self.subscribe(shutdown).await
    }
}

/// Builds the subscription URL: force `wss`, join the xrpc path, resume from
/// the cursor when one is known.
fn subscribe_url(host: &str, cursor: i64) -> Result<Url> {
    let mut url: Url = host
        .parse()
        .with_context(|| format!("parsing URL {host:?}"))?;
    url.set_scheme("wss")
        .map_err(|_| anyhow::anyhow!("cannot use wss scheme with {host:?}"))?;
    url.path_segments_mut()
        .map_err(|_| anyhow::anyhow!("URL {host:?} cannot be a base"))?
        .pop_if_empty()
        .extend(SUBSCRIBE_PATH.split('/'));
    if cursor > 0 {
        url.query_pairs_mut()
            .append_pair("cursor", &cursor.to_string());
    }
    Ok(url)
}

fn split_record_path(path: &str) -> Option<(&str, &str)> {
    let (collection, rkey) = path.split_once('/')?;
    if collection.is_empty() || rkey.is_empty() {
        return None;
    }
    Some((collection, rkey))
}

/// A durable cursor write is due unless the advance is small and a persist
/// happened recently.
fn cursor_write_due(seq: i64, cursor: i64, elapsed_since_persist: Option<Duration>) -> bool {
    let small_advance = (seq - cursor).abs() < CURSOR_PERSIST_SEQ_WINDOW;
    let recently_persisted =
        elapsed_since_persist.is_some_and(|elapsed| elapsed < CURSOR_PERSIST_INTERVAL);
    !(small_advance && recently_persisted)
}
