//! Frame decoding for the repository event subscription.
//!
//! Every websocket message is a concatenation of two CBOR items: a header
//! map `{op: int, t?: string}` followed by a body map. CBOR items are
//! self-delimiting, so the header decode must stop exactly at the item
//! boundary and leave the body bytes in place.

use anyhow::{Context, Result, bail};
use ciborium::Value;

/// Header of one subscription frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    pub op: i64,
    /// Event type tag; absent on error frames.
    pub kind: Option<String>,
}

/// Terminal error payload carried by an `op == -1` frame. Returning it ends
/// the current subscription; the supervisor reconnects.
#[derive(Debug, Clone)]
pub struct StreamError {
    pub error: String,
    pub message: Option<String>,
}

impl std::error::Error for StreamError {}

impl std::fmt::Display for StreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.message {
            Some(message) => write!(f, "upstream error {}: {message}", self.error),
            None => write!(f, "upstream error {}", self.error),
        }
    }
}

#[derive(Debug)]
pub enum Frame {
    Event { kind: String, body: Value },
    /// Unrecognized `op`; logged and skipped by the consumer.
    Unknown { op: i64 },
}

/// Decodes one websocket message into a frame.
///
/// An `op == -1` frame is returned as a [`StreamError`] through the error
/// channel, matching its role as the terminal outcome of a subscription.
pub fn decode_frame(message: &[u8]) -> Result<Frame> {
    let mut reader = message;
    let header_node: Value =
        ciborium::de::from_reader(&mut reader).context("unmarshaling message header")?;
    let header = parse_header(&header_node)?;

    match header.op {
        1 => {
            let kind = header.kind.context("missing 't' in event frame")?;
            let body: Value =
                ciborium::de::from_reader(&mut reader).context("unmarshaling message body")?;
            Ok(Frame::Event { kind, body })
        }
        -1 => {
            let body: Value =
                ciborium::de::from_reader(&mut reader).context("unmarshaling error payload")?;
            Err(parse_error(&body)?.into())
        }
        op => Ok(Frame::Unknown { op }),
    }
}

fn parse_header(node: &Value) -> Result<FrameHeader> {
    let op = as_i64(require(node, "op")?).context("op")?;
    if op == -1 {
        // Error frame, type should not be present.
        return Ok(FrameHeader { op, kind: None });
    }
    let kind = as_str(require(node, "t")?).context("t")?.to_string();
    Ok(FrameHeader {
        op,
        kind: Some(kind),
    })
}

fn parse_error(node: &Value) -> Result<StreamError> {
    let error = as_str(require(node, "error")?)
        .context("error")?
        .to_string();
    let message = match map_get(node, "message") {
        Some(value) => Some(as_str(value).context("message")?.to_string()),
        None => None,
    };
    Ok(StreamError { error, message })
}

/// One event from the subscription, dispatched on the header type tag.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Commit(CommitEvent),
    Handle(HandleEvent),
    Migrate(MigrateEvent),
    Tombstone(TombstoneEvent),
    Info(InfoEvent),
    /// Unrecognized type tag; logged and skipped.
    Unknown { kind: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommitEvent {
    pub seq: i64,
    pub repo: String,
    pub rev: String,
    pub too_big: bool,
    pub ops: Vec<RepoOp>,
    pub blocks: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoOp {
    pub action: String,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandleEvent {
    pub seq: i64,
    pub did: String,
    pub handle: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrateEvent {
    pub seq: i64,
    pub did: String,
    pub migrate_to: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TombstoneEvent {
    pub seq: i64,
    pub did: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfoEvent {
    pub name: String,
    pub message: Option<String>,
}

impl Event {
    pub fn parse(kind: &str, body: &Value) -> Result<Self> {
        match kind {
            "#commit" => Ok(Self::Commit(parse_commit(body)?)),
            "#handle" => Ok(Self::Handle(parse_handle(body)?)),
            "#migrate" => Ok(Self::Migrate(parse_migrate(body)?)),
            "#tombstone" => Ok(Self::Tombstone(parse_tombstone(body)?)),
            "#info" => Ok(Self::Info(parse_info(body)?)),
            other => Ok(Self::Unknown {
                kind: other.to_string(),
            }),
        }
    }

    /// The event's sequence number; `#info` frames carry none.
    pub fn seq(&self) -> Option<i64> {
        match self {
            Self::Commit(commit) => Some(commit.seq),
            Self::Handle(handle) => Some(handle.seq),
            Self::Migrate(migrate) => Some(migrate.seq),
            Self::Tombstone(tombstone) => Some(tombstone.seq),
            Self::Info(_) | Self::Unknown { .. } => None,
        }
    }
}

fn parse_commit(body: &Value) -> Result<CommitEvent> {
    let ops = match map_get(body, "ops") {
        Some(value) => value
            .as_array()
            .context("ops is not an array")?
            .iter()
            .map(parse_op)
            .collect::<Result<Vec<_>>>()?,
        None => Vec::new(),
    };
    let blocks = match map_get(body, "blocks") {
        Some(value) => as_bytes(value).context("blocks")?.to_vec(),
        None => Vec::new(),
    };
    Ok(CommitEvent {
        seq: as_i64(require(body, "seq")?).context("seq")?,
        repo: as_str(require(body, "repo")?).context("repo")?.to_string(),
        rev: as_str(require(body, "rev")?).context("rev")?.to_string(),
        too_big: match map_get(body, "tooBig") {
            Some(value) => as_bool(value).context("tooBig")?,
            None => false,
        },
        ops,
        blocks,
    })
}

fn parse_op(node: &Value) -> Result<RepoOp> {
    Ok(RepoOp {
        action: as_str(require(node, "action")?)
            .context("action")?
            .to_string(),
        path: as_str(require(node, "path")?).context("path")?.to_string(),
    })
}

fn parse_handle(body: &Value) -> Result<HandleEvent> {
    Ok(HandleEvent {
        seq: as_i64(require(body, "seq")?).context("seq")?,
        did: as_str(require(body, "did")?).context("did")?.to_string(),
        handle: as_str(require(body, "handle")?)
            .context("handle")?
            .to_string(),
    })
}

fn parse_migrate(body: &Value) -> Result<MigrateEvent> {
    let migrate_to = match map_get(body, "migrateTo") {
        Some(Value::Null) | None => None,
        Some(value) => Some(as_str(value).context("migrateTo")?.to_string()),
    };
    Ok(MigrateEvent {
        seq: as_i64(require(body, "seq")?).context("seq")?,
        did: as_str(require(body, "did")?).context("did")?.to_string(),
        migrate_to,
    })
}

fn parse_tombstone(body: &Value) -> Result<TombstoneEvent> {
    Ok(TombstoneEvent {
        seq: as_i64(require(body, "seq")?).context("seq")?,
        did: as_str(require(body, "did")?).context("did")?.to_string(),
    })
}

fn parse_info(body: &Value) -> Result<InfoEvent> {
    let message = match map_get(body, "message") {
        Some(Value::Null) | None => None,
        Some(value) => Some(as_str(value).context("message")?.to_string()),
    };
    Ok(InfoEvent {
        name: as_str(require(body, "name")?).context("name")?.to_string(),
        message,
    })
}

pub(crate) fn map_get<'a>(node: &'a Value, key: &str) -> Option<&'a Value> {
    node.as_map()?.iter().find_map(|(k, v)| {
        (k.as_text() == Some(key)).then_some(v)
    })
}

pub(crate) fn require<'a>(node: &'a Value, key: &str) -> Result<&'a Value> {
    map_get(node, key).with_context(|| format!("missing '{key}'"))
}

pub(crate) fn as_i64(value: &Value) -> Result<i64> {
    match value {
        Value::Integer(n) => i64::try_from(i128::from(*n)).context("integer out of range"),
        other => bail!("expected integer, got {other:?}"),
    }
}

pub(crate) fn as_str(value: &Value) -> Result<&str> {
    value
        .as_text()
        .with_context(|| format!("expected string, got {value:?}"))
}

pub(crate) fn as_bytes(value: &Value) -> Result<&[u8]> {
    match value {
        Value::Bytes(bytes) => Ok(bytes),
        other => bail!("expected bytes, got {other:?}"),
    }
}

pub(crate) fn as_bool(value: &Value) -> Result<bool> {
    value
        .as_bool()
        .with_context(|| format!("expected bool, got {value:?}"))
}
