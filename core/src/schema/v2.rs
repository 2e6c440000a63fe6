//! Schema v2: one row per DID holding a newest-first array of operations,
//! plus a singleton `head_timestamp` table tracking the global maximum
//! `created_at`.

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use sqlx::types::Json;

use crate::db::PgPool;
use crate::plc::{self, LogEntryBody, PlcLogEntry};
use crate::schema::{PlcDatabase, table_has_rows};

/// Recomputes the head from each inserted or updated row. With multiple
/// writers the trigger keeps the head from lagging or regressing; business
/// logic only maintains it when the trigger is disabled.
const TRIGGER_FUNCTION: &str = r#"create or replace function v2_update_head_timestamp() returns trigger as $end$
    declare
            rowTS text;
    begin
        if array_length(NEW.log, 1) = 0 then
            return null;
        end if;

        select max(v->>'createdAt') into rowTS from unnest(NEW.log) as v;
        if not found then
            return null;
        end if;

        update head_timestamp
            set timestamp = rowTS
            where timestamp < rowTS;
        return null;
    end;
$end$ language plpgsql"#;

const INSTALL_TRIGGER: &str = "create or replace trigger v2_update_head_timestamp
after insert or update on data
for each row execute function v2_update_head_timestamp()";

const DROP_TRIGGER: &str = "drop trigger if exists v2_update_head_timestamp on data";

pub async fn is_active(pool: &PgPool) -> Result<bool> {
    table_has_rows(pool, "SELECT 1 FROM data LIMIT 1").await
}

pub struct V2Database {
    pool: PgPool,
    use_trigger: bool,
}

impl V2Database {
    pub fn new(pool: PgPool, use_trigger: bool) -> Self {
        Self { pool, use_trigger }
    }

    /// The `head_timestamp` table must hold exactly one row: seed an empty
    /// one when the table is fresh, keep only the maximum when duplicates
    /// have crept in.
    async fn repair_head_row(&self) -> Result<()> {
        let count: i64 = sqlx::query_scalar("SELECT count(*) FROM head_timestamp")
            .fetch_one(&self.pool)
            .await
            .context("counting head rows")?;

        if count == 0 {
            sqlx::query("INSERT INTO head_timestamp (timestamp) VALUES ('')")
                .execute(&self.pool)
                .await
                .context("seeding head row")?;
        }
        if count > 1 {
            let mut tx = self.pool.begin().await?;
            let max: Option<String> = sqlx::query_scalar("SELECT max(timestamp) FROM head_timestamp")
                .fetch_one(tx.as_mut())
                .await
                .context("finding max head timestamp")?;
            sqlx::query("DELETE FROM head_timestamp WHERE timestamp < $1")
                .bind(max.unwrap_or_default())
                .execute(tx.as_mut())
                .await
                .context("deleting stale head rows")?;
            tx.commit().await?;
        }
        Ok(())
    }
}

#[async_trait]
impl PlcDatabase for V2Database {
    async fn auto_migrate(&self) -> Result<()> {
        let statements = [
            "CREATE TABLE IF NOT EXISTS data (
                did TEXT PRIMARY KEY,
                log JSONB[] NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS head_timestamp (
                timestamp TEXT NOT NULL
            )",
        ];
        for statement in statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .context("migrating schema v2")?;
        }

        if self.use_trigger {
            sqlx::query(TRIGGER_FUNCTION)
                .execute(&self.pool)
                .await
                .context("creating trigger function")?;
            sqlx::query(INSTALL_TRIGGER)
                .execute(&self.pool)
                .await
                .context("installing the trigger")?;
        } else {
            sqlx::query(DROP_TRIGGER)
                .execute(&self.pool)
                .await
                .context("ensuring that the trigger is not installed")?;
        }

        self.repair_head_row().await
    }

    async fn head_timestamp(&self) -> Result<Option<String>> {
        let max: Option<String> = sqlx::query_scalar("SELECT max(timestamp) FROM head_timestamp")
            .fetch_one(&self.pool)
            .await
            .context("querying head timestamp")?;
        Ok(max.filter(|ts| !ts.is_empty()))
    }

    async fn append_entries(&self, entries: &[PlcLogEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let new_head = plc::next_cursor(entries);
        if new_head.is_empty() {
            bail!("failed to get the new head timestamp");
        }

        let rows = plc::group_newest_first(entries.to_vec());

        let mut tx = self.pool.begin().await?;

        if !self.use_trigger {
            sqlx::query("UPDATE head_timestamp SET timestamp = $1 WHERE timestamp < $2")
                .bind(&new_head)
                .bind(&new_head)
                .execute(tx.as_mut())
                .await
                .context("updating head timestamp")?;
        }

        for (did, log) in rows {
            // The sorted-descending block is prepended, preserving the
            // newest-first invariant of the stored array.
            let log: Vec<Json<LogEntryBody>> = log.into_iter().map(Json).collect();
            sqlx::query(
                "INSERT INTO data (did, log) VALUES ($1, $2)
                 ON CONFLICT (did) DO UPDATE SET log = array_cat(EXCLUDED.log, data.log)",
            )
            .bind(&did)
            .bind(&log)
            .execute(tx.as_mut())
            .await
            .with_context(|| format!("upserting log entries for {did:?}"))?;
        }

        tx.commit().await.context("committing append batch")
    }

    async fn last_operation_for_did(&self, did: &str) -> Result<Option<PlcLogEntry>> {
        let log: Option<Vec<Json<LogEntryBody>>> =
            sqlx::query_scalar("SELECT log FROM data WHERE did = $1")
                .bind(did)
                .fetch_optional(&self.pool)
                .await
                .with_context(|| format!("querying log for {did:?}"))?;

        let Some(log) = log else {
            return Ok(None);
        };
        Ok(log
            .into_iter()
            .find(|entry| !entry.0.nullified)
            .map(|entry| entry.0.into_entry(did)))
    }
}
