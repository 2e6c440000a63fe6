//! Pluggable persistence shapes for the directory operation log.
//!
//! Two schemas coexist: v1 keeps one row per operation, v2 groups
//! operations into one array per DID with a trigger-maintained head marker.
//! Detection is probe-driven and monotone: v2 wins when present and
//! non-empty, v1 is kept when it alone has data, fresh installs get v2.

use std::fmt;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::db::{PgPool, errors::is_undefined_table};
use crate::plc::PlcLogEntry;

pub mod v1;
pub mod v2;

#[async_trait]
pub trait PlcDatabase: Send + Sync {
    /// Greatest `created_at` stored, or `None` when the store is empty.
    async fn head_timestamp(&self) -> Result<Option<String>>;
    /// Appends a batch atomically; idempotent on `(did, cid)`.
    async fn append_entries(&self, entries: &[PlcLogEntry]) -> Result<()>;
    /// Newest non-nullified operation for the DID, or `None`.
    async fn last_operation_for_did(&self, did: &str) -> Result<Option<PlcLogEntry>>;
    /// Creates missing tables, indexes, and triggers.
    async fn auto_migrate(&self) -> Result<()>;
}

pub type PlcDatabaseRef = Arc<dyn PlcDatabase>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaVersion {
    V1,
    V2,
}

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::V1 => write!(f, "v1"),
            Self::V2 => write!(f, "v2"),
        }
    }
}

pub async fn detect_version(pool: &PgPool) -> Result<SchemaVersion> {
    if v2::is_active(pool).await.context("probing schema v2")? {
        return Ok(SchemaVersion::V2);
    }
    if v1::is_active(pool).await.context("probing schema v1")? {
        return Ok(SchemaVersion::V1);
    }
    Ok(SchemaVersion::V2)
}

/// Detects the active schema, runs its migration, and returns it behind the
/// uniform interface.
pub async fn connect(pool: &PgPool, use_trigger: bool) -> Result<(SchemaVersion, PlcDatabaseRef)> {
    let version = detect_version(pool).await?;
    let db: PlcDatabaseRef = match version {
        SchemaVersion::V1 => Arc::new(v1::V1Database::new(pool.clone())),
        SchemaVersion::V2 => Arc::new(v2::V2Database::new(pool.clone(), use_trigger)),
    };
    db.auto_migrate()
        .await
        .context("auto-migrating directory log schema")?;
    Ok((version, db))
}

/// Probes a table for at least one row, treating an undefined relation as
/// "not present".
pub(crate) async fn table_has_rows(pool: &PgPool, probe_sql: &str) -> Result<bool> {
    match sqlx::query(probe_sql).fetch_optional(pool).await {
        Ok(row) => Ok(row.is_some()),
        Err(err) if is_undefined_table(&err) => Ok(false),
        Err(err) => Err(err.into()),
    }
}
