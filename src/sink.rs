// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Capture sink: the only owner of stored records.

use crate::error::{ProxyError, Result};
use crate::record::{Record, RecordPatch};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// Storage seam used by the capture paths, replay and the control API.
#[async_trait]
pub trait CaptureSink: Send + Sync {
    /// Stores a new record. The sink stamps `created_at`.
    async fn create(&self, record: Record) -> Result<Uuid>;

    async fn get(&self, id: Uuid) -> Result<Record>;

    /// All records, newest first.
    async fn list_all(&self) -> Result<Vec<Record>>;

    /// Applies a partial update. Attaching a second response fails.
    async fn update(&self, id: Uuid, patch: RecordPatch) -> Result<()>;

    /// Removes records older than `horizon`, returning how many were dropped.
    async fn purge_older_than(&self, horizon: chrono::Duration) -> Result<usize>;
}

/// In-process record store.
#[derive(Default)]
pub struct MemorySink {
    records: RwLock<HashMap<Uuid, Record>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a record as-is, keeping its timestamp. Used when replaying a journal.
    pub(crate) fn restore(&self, record: Record) -> Result<()> {
        let mut records = self.write()?;
        records.insert(record.id, record);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<Uuid, Record>>> {
        self.records
            .write()
            .map_err(|_| ProxyError::Storage("record store lock poisoned".into()))
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, HashMap<Uuid, Record>>> {
        self.records
            .read()
            .map_err(|_| ProxyError::Storage("record store lock poisoned".into()))
    }

    pub(crate) fn create_sync(&self, mut record: Record) -> Result<Record> {
        record.created_at = Utc::now();
        let mut records = self.write()?;
        records.insert(record.id, record.clone());
        Ok(record)
    }

    /// Checks that `patch` would apply to `id` without changing anything.
    pub(crate) fn check_update(&self, id: Uuid, patch: &RecordPatch) -> Result<()> {
        let records = self.read()?;
        let record = records
            .get(&id)
            .ok_or_else(|| ProxyError::NotFound(id.to_string()))?;
        patch.check(record)
    }

    pub(crate) fn update_sync(&self, id: Uuid, patch: RecordPatch) -> Result<()> {
        let mut records = self.write()?;
        let record = records
            .get_mut(&id)
            .ok_or_else(|| ProxyError::NotFound(id.to_string()))?;
        patch.apply(record)
    }
}

#[async_trait]
impl CaptureSink for MemorySink {
    async fn create(&self, record: Record) -> Result<Uuid> {
        Ok(self.create_sync(record)?.id)
    }

    async fn get(&self, id: Uuid) -> Result<Record> {
        self.read()?
            .get(&id)
            .cloned()
            .ok_or_else(|| ProxyError::NotFound(id.to_string()))
    }

    async fn list_all(&self) -> Result<Vec<Record>> {
        let mut all: Vec<Record> = self.read()?.values().cloned().collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(all)
    }

    async fn update(&self, id: Uuid, patch: RecordPatch) -> Result<()> {
        self.update_sync(id, patch)
    }

    async fn purge_older_than(&self, horizon: chrono::Duration) -> Result<usize> {
        let now = Utc::now();
        let mut records = self.write()?;
        let before = records.len();
        records.retain(|_, r| r.age(now) <= horizon);
        Ok(before - records.len())
    }
}

/// Periodically drops records past the retention horizon.
pub fn spawn_retention_task(
    sink: Arc<dyn CaptureSink>,
    horizon: chrono::Duration,
    every: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            match sink.purge_older_than(horizon).await {
                Ok(0) => {}
                Ok(n) => debug!(removed = n, "purged expired records"),
                Err(e) => warn!(error = %e, "retention purge failed"),
            }
        }
    })
}
