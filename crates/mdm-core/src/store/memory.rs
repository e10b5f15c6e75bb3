//! In-memory store for headless runs and tests.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Mutex;

use super::JobStore;
use crate::batch::BatchRecord;
use crate::job::Job;

#[derive(Debug, Default)]
pub struct MemoryJobStore {
    jobs: Mutex<Vec<Job>>,
    batches: Mutex<Vec<BatchRecord>>,
    saves: Mutex<u64>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-populated with `jobs`, as if a previous run had saved them.
    pub fn with_jobs(jobs: Vec<Job>) -> Self {
        Self {
            jobs: Mutex::new(jobs),
            ..Self::default()
        }
    }

    /// Number of `save` calls so far.
    pub fn save_count(&self) -> u64 {
        self.saves.lock().map(|n| *n).unwrap_or(0)
    }

    /// Copy of the last saved state.
    pub fn snapshot(&self) -> Vec<Job> {
        self.jobs.lock().map(|j| j.clone()).unwrap_or_default()
    }

    /// Copy of the last saved batch records.
    pub fn batch_snapshot(&self) -> Vec<BatchRecord> {
        self.batches.lock().map(|b| b.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn load(&self) -> Result<Vec<Job>> {
        Ok(self.snapshot())
    }

    async fn save(&self, jobs: &[Job]) -> Result<()> {
        let mut guard = self
            .jobs
            .lock()
            .map_err(|_| anyhow::anyhow!("memory store lock poisoned"))?;
        *guard = jobs.to_vec();
        if let Ok(mut n) = self.saves.lock() {
            *n += 1;
        }
        Ok(())
    }

    async fn load_batches(&self) -> Result<Vec<BatchRecord>> {
        Ok(self.batch_snapshot())
    }

    async fn save_batches(&self, batches: &[BatchRecord]) -> Result<()> {
        let mut guard = self
            .batches
            .lock()
            .map_err(|_| anyhow::anyhow!("memory store lock poisoned"))?;
        *guard = batches.to_vec();
        Ok(())
    }
}
