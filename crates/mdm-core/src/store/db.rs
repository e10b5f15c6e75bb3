//! SQLite-backed job store.
//!
//! Handles connection, migrations, and the load/save snapshot pair.

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Pool, Row, Sqlite};
use std::path::Path;

use super::JobStore;
use crate::batch::BatchRecord;
use crate::job::{unix_timestamp, Job};

/// Percent-encode a path for use in a sqlite:// URI so spaces and special chars don't break parsing.
fn path_to_sqlite_uri(path: &Path) -> String {
    let s = path.to_string_lossy();
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '%' => out.push_str("%25"),
            ' ' => out.push_str("%20"),
            '#' => out.push_str("%23"),
            '?' => out.push_str("%3F"),
            '&' => out.push_str("%26"),
            c => out.push(c),
        }
    }
    format!("sqlite://{}", out)
}

/// Handle to the SQLite-backed job store.
///
/// The database file is stored under the XDG state directory:
/// `~/.local/state/mdm/jobs.db` on Debian.
#[derive(Clone)]
pub struct SqliteJobStore {
    pool: Pool<Sqlite>,
}

impl SqliteJobStore {
    /// Open (or create) the default job database and run migrations.
    pub async fn open_default() -> Result<Self> {
        let state_dir = crate::logging::state_dir()?;
        Self::open_at(state_dir.join("jobs.db")).await
    }

    /// Open (or create) the database at a specific path. Creates parent dirs if needed.
    pub async fn open_at(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let uri = path_to_sqlite_uri(path) + "?mode=rwc";
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect(&uri)
            .await
            .with_context(|| format!("open job store {}", path.display()))?;
        let store = SqliteJobStore { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        // - `seq` preserves submission (FIFO) order across restarts.
        // - `job_json` holds the full record; `status` is duplicated for inspection.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                seq INTEGER NOT NULL,
                status TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                job_json TEXT NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS batches (
                id TEXT PRIMARY KEY,
                seq INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                batch_json TEXT NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Number of persisted rows (including unreadable ones).
    pub async fn row_count(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM jobs")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("n"))
    }
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn load(&self) -> Result<Vec<Job>> {
        let rows = sqlx::query(
            r#"
            SELECT id, job_json
            FROM jobs
            ORDER BY seq ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row.get("id");
            let json: String = row.get("job_json");
            match serde_json::from_str::<Job>(&json) {
                Ok(job) => out.push(job),
                Err(e) => tracing::warn!(job_id = %id, "skipping unreadable job row: {}", e),
            }
        }
        Ok(out)
    }

    async fn save(&self, jobs: &[Job]) -> Result<()> {
        let now = unix_timestamp();
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM jobs").execute(&mut *tx).await?;
        for (seq, job) in jobs.iter().enumerate() {
            let json = serde_json::to_string(job)?;
            sqlx::query(
                r#"
                INSERT INTO jobs (id, seq, status, created_at, updated_at, job_json)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
            )
            .bind(job.id())
            .bind(seq as i64)
            .bind(job.status.as_str())
            .bind(job.created_at)
            .bind(now)
            .bind(json)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn load_batches(&self) -> Result<Vec<BatchRecord>> {
        let rows = sqlx::query("SELECT id, batch_json FROM batches ORDER BY seq ASC")
            .fetch_all(&self.pool)
            .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row.get("id");
            let json: String = row.get("batch_json");
            match serde_json::from_str::<BatchRecord>(&json) {
                Ok(batch) => out.push(batch),
                Err(e) => tracing::warn!(batch_id = %id, "skipping unreadable batch row: {}", e),
            }
        }
        Ok(out)
    }

    async fn save_batches(&self, batches: &[BatchRecord]) -> Result<()> {
        let now = unix_timestamp();
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM batches").execute(&mut *tx).await?;
        for (seq, batch) in batches.iter().enumerate() {
            sqlx::query(
                "INSERT INTO batches (id, seq, updated_at, batch_json) VALUES (?1, ?2, ?3, ?4)",
            )
            .bind(&batch.id)
            .bind(seq as i64)
            .bind(now)
            .bind(serde_json::to_string(batch)?)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
/// Open an in-memory database for tests (no disk I/O).
pub(crate) async fn open_memory() -> Result<SqliteJobStore> {
    // Single connection to avoid in-memory pool handing back a different empty DB.
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await?;
    let store = SqliteJobStore { pool };
    store.migrate().await?;
    Ok(store)
}

#[cfg(test)]
impl SqliteJobStore {
    pub(crate) async fn insert_raw(&self, id: &str, seq: i64, json: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO jobs (id, seq, status, created_at, updated_at, job_json)
            VALUES (?1, ?2, 'pending', 0, 0, ?3)
            "#,
        )
        .bind(id)
        .bind(seq)
        .bind(json)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
