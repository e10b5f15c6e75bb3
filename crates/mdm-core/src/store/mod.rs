//! Durable job store for restart recovery of the queue.
//!
//! The engine only needs `load` and `save`; the batch coordinator keeps its
//! own records next to the jobs. The SQLite implementation keeps one row per
//! record with the full value as JSON so older or newer builds can still read
//! what they understand.

mod db;
mod memory;

use anyhow::Result;
use async_trait::async_trait;

use crate::batch::BatchRecord;
use crate::job::Job;

pub use db::SqliteJobStore;
pub use memory::MemoryJobStore;

/// Durable key-value state for the engine's queue and history.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Load all persisted jobs in submission order. Unreadable rows are skipped.
    async fn load(&self) -> Result<Vec<Job>>;

    /// Replace the persisted state with `jobs` (in submission order).
    async fn save(&self, jobs: &[Job]) -> Result<()>;

    /// Load the batch coordinator's records in registration order.
    async fn load_batches(&self) -> Result<Vec<BatchRecord>>;

    /// Replace the persisted batch records.
    async fn save_batches(&self, batches: &[BatchRecord]) -> Result<()>;
}
