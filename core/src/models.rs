use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// An upstream repository host we hold a firehose subscription to.
///
/// `cursor` is the most recently durably advanced sequence number;
/// `first_cursor_since_reset` marks the first event seen after the latest
/// cursor reset (zero until a boundary is established).
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct RepoHost {
    pub id: i64,
    pub host: String,
    pub cursor: i64,
    pub first_cursor_since_reset: i64,
    pub created_at: DateTime<Utc>,
}

/// A repository (DID) referenced by firehose events, bound to the host it
/// currently lives on.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Repo {
    pub id: i64,
    pub did: String,
    pub pds: i64,
    pub first_cursor_since_reset: i64,
    pub first_rev_since_reset: String,
    pub created_at: DateTime<Utc>,
}
