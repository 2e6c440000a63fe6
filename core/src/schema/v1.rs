//! Schema v1: one row per directory log operation.

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::QueryBuilder;
use sqlx::types::Json;

use crate::db::PgPool;
use crate::plc::PlcLogEntry;
use crate::schema::{PlcDatabase, table_has_rows};

pub async fn is_active(pool: &PgPool) -> Result<bool> {
    table_has_rows(pool, "SELECT 1 FROM plc_log_entries LIMIT 1").await
}

pub struct V1Database {
    pool: PgPool,
}

impl V1Database {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PlcDatabase for V1Database {
    async fn auto_migrate(&self) -> Result<()> {
        let statements = [
            "CREATE TABLE IF NOT EXISTS plc_log_entries (
                id BIGSERIAL PRIMARY KEY,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                did TEXT NOT NULL,
                cid TEXT NOT NULL,
                plc_timestamp TEXT NOT NULL,
                nullified BOOLEAN NOT NULL DEFAULT false,
                operation JSONB NOT NULL
            )",
            "CREATE UNIQUE INDEX IF NOT EXISTS did_cid ON plc_log_entries (did, cid)",
            "CREATE INDEX IF NOT EXISTS did_timestamp
             ON plc_log_entries (did, plc_timestamp DESC)",
            "CREATE INDEX IF NOT EXISTS idx_plc_log_entries_plc_timestamp
             ON plc_log_entries (plc_timestamp DESC)",
        ];
        for statement in statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .context("migrating schema v1")?;
        }
        Ok(())
    }

    async fn head_timestamp(&self) -> Result<Option<String>> {
        sqlx::query_scalar(
            "SELECT plc_timestamp FROM plc_log_entries
             ORDER BY plc_timestamp DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await
        .context("querying head timestamp")
    }

    async fn append_entries(&self, entries: &[PlcLogEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }

        let mut builder = QueryBuilder::new(
            "INSERT INTO plc_log_entries (did, cid, plc_timestamp, nullified, operation) ",
        );
        builder.push_values(entries, |mut row, entry| {
            row.push_bind(&entry.did)
                .push_bind(&entry.cid)
                .push_bind(&entry.created_at)
                .push_bind(entry.nullified)
                .push_bind(Json(&entry.operation));
        });
        builder.push(" ON CONFLICT (did, cid) DO NOTHING");

        builder
            .build()
            .execute(&self.pool)
            .await
            .context("inserting log entries into database")?;
        Ok(())
    }

    async fn last_operation_for_did(&self, did: &str) -> Result<Option<PlcLogEntry>> {
        let row: Option<(String, String, String, bool, Json<serde_json::Value>)> =
            sqlx::query_as(
                "SELECT did, cid, plc_timestamp, nullified, operation
                 FROM plc_log_entries
                 WHERE did = $1 AND (NOT nullified)
                 ORDER BY plc_timestamp DESC LIMIT 1",
            )
            .bind(did)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("querying last operation for {did:?}"))?;

        Ok(row.map(|(did, cid, created_at, nullified, operation)| PlcLogEntry {
            did,
            cid,
            created_at,
            nullified,
            operation: operation.0,
        }))
    }
}
