//! Session-scoped Postgres advisory locking for leader election.
//!
//! A lock pins one pooled connection for as long as it is held; Postgres
//! releases advisory locks when the session ends, so `lock_count > 0` plus a
//! live connection means the lock is still ours.

use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use sqlx::pool::PoolConnection;
use sqlx::{Connection, Postgres};

use crate::db::PgPool;

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("not locked")]
    NotLocked,
}

pub struct AdvisoryLock {
    pool: PgPool,
    lock_id: i64,
    conn: Option<PoolConnection<Postgres>>,
    lock_count: u32,
    last_error: Option<String>,
}

impl AdvisoryLock {
    pub fn new(pool: PgPool, lock_id: i64) -> Self {
        Self {
            pool,
            lock_id,
            conn: None,
            lock_count: 0,
            last_error: None,
        }
    }

    async fn ensure_conn(&mut self) -> Result<&mut PoolConnection<Postgres>> {
        if self.conn.is_none() {
            let conn = self
                .pool
                .acquire()
                .await
                .context("acquiring lock connection")?;
            self.conn = Some(conn);
            self.lock_count = 0;
            self.last_error = None;
        }
        Ok(self.conn.as_mut().expect("connection just ensured"))
    }

    /// Blocks until the server grants the lock. Reentrant; every `lock` must
    /// be paired with an `unlock`.
    pub async fn lock(&mut self) -> Result<()> {
        let lock_id = self.lock_id;
        let conn = self.ensure_conn().await?;
        sqlx::query("select pg_advisory_lock($1)")
            .bind(lock_id)
            .execute(conn.as_mut())
            .await
            .context("acquiring lock")?;
        self.lock_count += 1;
        Ok(())
    }

    /// Non-blocking acquire; returns `false` without touching the count when
    /// another session holds the lock.
    pub async fn try_lock(&mut self) -> Result<bool> {
        let lock_id = self.lock_id;
        let conn = self.ensure_conn().await?;
        let acquired: bool = sqlx::query_scalar("select pg_try_advisory_lock($1)")
            .bind(lock_id)
            .fetch_one(conn.as_mut())
            .await
            .context("acquiring lock")?;
        if acquired {
            self.lock_count += 1;
        }
        Ok(acquired)
    }

    /// Bounded blocking acquire. A timed-out `pg_advisory_lock` leaves the
    /// connection mid-query, so the connection is discarded before returning
    /// `false`.
    pub async fn lock_with_timeout(&mut self, timeout: Duration) -> Result<bool> {
        match tokio::time::timeout(timeout, self.lock()).await {
            Ok(Ok(())) => Ok(true),
            Ok(Err(err)) => Err(err),
            Err(_elapsed) => {
                self.reset().await;
                Ok(false)
            }
        }
    }

    /// Releases one hold. Fails with [`LockError::NotLocked`] when nothing is
    /// held; returns the connection to the pool once the count reaches zero.
    pub async fn unlock(&mut self) -> Result<()> {
        if self.conn.is_none() || self.lock_count == 0 {
            return Err(LockError::NotLocked.into());
        }

        let lock_id = self.lock_id;
        let conn = self.conn.as_mut().expect("checked above");
        sqlx::query("select pg_advisory_unlock($1)")
            .bind(lock_id)
            .execute(conn.as_mut())
            .await
            .context("releasing lock")?;
        self.lock_count -= 1;

        if self.lock_count == 0 {
            self.conn = None;
        }
        Ok(())
    }

    /// Returns `true` iff a lock is held and the connection still answers.
    /// A failed round-trip latches the error; later calls return it without
    /// probing again until `reset`.
    pub async fn check(&mut self) -> Result<bool> {
        if let Some(message) = &self.last_error {
            return Err(anyhow!("lock connection failed: {message}"));
        }

        let Some(conn) = self.conn.as_mut() else {
            return Ok(false);
        };
        if self.lock_count == 0 {
            return Ok(false);
        }

        if let Err(err) = conn.ping().await {
            let message = err.to_string();
            self.last_error = Some(message.clone());
            return Err(anyhow!("lock connection failed: {message}"));
        }
        Ok(true)
    }

    /// Forcibly closes the connection (releasing any server-side locks) and
    /// clears the latched error and count.
    pub async fn reset(&mut self) {
        if let Some(conn) = self.conn.take() {
            let _ = conn.detach().close().await;
        }
        self.lock_count = 0;
        self.last_error = None;
    }
}
