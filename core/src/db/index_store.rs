//! Consumer-side persistence: repo hosts, repos, and materialized records.

use anyhow::{Context, Result};
use sqlx::QueryBuilder;

use crate::db::PgPool;
use crate::models::{Repo, RepoHost};

/// A record row about to be upserted. The conflict target is the
/// `(repo, collection, rkey)` triple and only `content` is replaced, so a
/// recreate after a delete keeps the `deleted` flag set.
#[derive(Debug, Clone)]
pub struct NewRecord {
    pub repo: i64,
    pub collection: String,
    pub rkey: String,
    pub content: Vec<u8>,
}

#[derive(Clone)]
pub struct IndexStore {
    pool: PgPool,
}

impl IndexStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn list_hosts(&self) -> Result<Vec<RepoHost>> {
        sqlx::query_as(
            "SELECT id, host, cursor, first_cursor_since_reset, created_at
             FROM pds ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await
        .context("listing repo hosts")
    }

    /// Registers a host if it is not already known and returns its row.
    pub async fn ensure_host(&self, host: &str) -> Result<RepoHost> {
        sqlx::query("INSERT INTO pds (host) VALUES ($1) ON CONFLICT (host) DO NOTHING")
            .bind(host)
            .execute(&self.pool)
            .await
            .context("registering repo host")?;

        sqlx::query_as(
            "SELECT id, host, cursor, first_cursor_since_reset, created_at
             FROM pds WHERE host = $1",
        )
        .bind(host)
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("loading repo host {host:?}"))
    }

    pub async fn update_host_cursor(&self, host_id: i64, cursor: i64) -> Result<()> {
        sqlx::query("UPDATE pds SET cursor = $1 WHERE id = $2")
            .bind(cursor)
            .bind(host_id)
            .execute(&self.pool)
            .await
            .context("updating cursor")?;
        Ok(())
    }

    pub async fn set_host_reset_boundary(&self, host_id: i64, seq: i64) -> Result<()> {
        sqlx::query("UPDATE pds SET first_cursor_since_reset = $1 WHERE id = $2")
            .bind(seq)
            .bind(host_id)
            .execute(&self.pool)
            .await
            .context("updating first_cursor_since_reset")?;
        Ok(())
    }

    /// Looks a repo up by DID, creating it bound to `host_id` on first
    /// reference. Repos are never deleted.
    pub async fn ensure_repo(&self, did: &str, host_id: i64) -> Result<Repo> {
        sqlx::query("INSERT INTO repos (did, pds) VALUES ($1, $2) ON CONFLICT (did) DO NOTHING")
            .bind(did)
            .bind(host_id)
            .execute(&self.pool)
            .await
            .with_context(|| format!("creating repo {did:?}"))?;

        sqlx::query_as(
            "SELECT id, did, pds, first_cursor_since_reset, first_rev_since_reset, created_at
             FROM repos WHERE did = $1",
        )
        .bind(did)
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("loading repo {did:?}"))
    }

    /// Stamps the reset boundary a re-indexer needs to refetch the repo from.
    pub async fn set_repo_reset_boundary(
        &self,
        repo_id: i64,
        first_cursor: i64,
        first_rev: &str,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE repos SET first_cursor_since_reset = $1, first_rev_since_reset = $2
             WHERE id = $3",
        )
        .bind(first_cursor)
        .bind(first_rev)
        .bind(repo_id)
        .execute(&self.pool)
        .await
        .context("updating repo reset boundary")?;
        Ok(())
    }

    /// Flags a record as deleted, keeping its last known content. Missing
    /// rows are left missing.
    pub async fn mark_record_deleted(
        &self,
        repo_id: i64,
        collection: &str,
        rkey: &str,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE records SET deleted = true
             WHERE repo = $1 AND collection = $2 AND rkey = $3",
        )
        .bind(repo_id)
        .bind(collection)
        .bind(rkey)
        .execute(&self.pool)
        .await
        .with_context(|| format!("marking {collection}/{rkey} as deleted"))?;
        Ok(())
    }

    pub async fn upsert_records(&self, records: &[NewRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let mut builder =
            QueryBuilder::new("INSERT INTO records (repo, collection, rkey, content) ");
        builder.push_values(records, |mut row, record| {
            row.push_bind(record.repo)
                .push_bind(&record.collection)
                .push_bind(&record.rkey)
                .push_bind(&record.content);
        });
        builder.push(
            " ON CONFLICT (repo, collection, rkey) DO UPDATE SET content = EXCLUDED.content",
        );

        builder
            .build()
            .execute(&self.pool)
            .await
            .context("inserting records into the database")?;
        Ok(())
    }
}
