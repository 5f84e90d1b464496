// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! JSONL-journaled capture sink.
//!
//! Every create and update is appended to the journal as one line before it
//! reaches memory, so a failed append leaves no trace in either. On startup
//! the journal is replayed into memory; malformed lines are skipped. Purging
//! rewrites the journal with the surviving records only.

use crate::error::{ProxyError, Result};
use crate::record::{Record, RecordPatch};
use crate::sink::{CaptureSink, MemorySink};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JournalEntry {
    Create { record: Record },
    Update { id: Uuid, patch: RecordPatch },
}

fn encode(entry: &JournalEntry) -> Result<String> {
    let mut line = serde_json::to_string(entry)
        .map_err(|e| ProxyError::Storage(format!("journal encode: {e}")))?;
    line.push('\n');
    Ok(line)
}

async fn open_append(path: &Path) -> std::io::Result<tokio::fs::File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
}

async fn write_line(file: &mut tokio::fs::File, line: &str) -> Result<()> {
    file.write_all(line.as_bytes()).await?;
    file.flush().await?;
    Ok(())
}

pub struct JournalSink {
    memory: MemorySink,
    // Held across check, append and commit so memory follows journal order.
    journal: Mutex<tokio::fs::File>,
    path: PathBuf,
}

impl JournalSink {
    /// Opens (or creates) the journal at `path` and replays it.
    pub async fn open<P: Into<PathBuf>>(path: P) -> anyhow::Result<Self> {
        let path: PathBuf = path.into();
        let memory = MemorySink::new();

        let entries = load_journal(&path).await?;
        let count = entries.len();
        for entry in entries {
            let applied = match entry {
                JournalEntry::Create { record } => memory.restore(record),
                JournalEntry::Update { id, patch } => memory.update_sync(id, patch),
            };
            if let Err(e) = applied {
                tracing::warn!(error = %e, "skipping journal entry that does not apply");
            }
        }
        tracing::info!(entries = count, records = memory.len(), path = ?path, "replayed capture journal");

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = open_append(&path).await?;
        Ok(Self {
            memory,
            journal: Mutex::new(file),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replaces the journal with one `create` line per surviving record, oldest
    /// first, and returns a fresh append handle on it.
    async fn compact(&self) -> Result<tokio::fs::File> {
        let mut records = self.memory.list_all().await?;
        records.reverse();
        let mut out = String::new();
        for record in records {
            out.push_str(&encode(&JournalEntry::Create { record })?);
        }

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(out.as_bytes()).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(open_append(&self.path).await?)
    }
}

#[async_trait]
impl CaptureSink for JournalSink {
    async fn create(&self, mut record: Record) -> Result<Uuid> {
        let mut journal = self.journal.lock().await;
        record.created_at = Utc::now();
        let id = record.id;
        let line = encode(&JournalEntry::Create {
            record: record.clone(),
        })?;
        write_line(&mut journal, &line).await?;
        self.memory.restore(record)?;
        Ok(id)
    }

    async fn get(&self, id: Uuid) -> Result<Record> {
        self.memory.get(id).await
    }

    async fn list_all(&self) -> Result<Vec<Record>> {
        self.memory.list_all().await
    }

    async fn update(&self, id: Uuid, patch: RecordPatch) -> Result<()> {
        let mut journal = self.journal.lock().await;
        self.memory.check_update(id, &patch)?;
        let line = encode(&JournalEntry::Update {
            id,
            patch: patch.clone(),
        })?;
        write_line(&mut journal, &line).await?;
        self.memory.update_sync(id, patch)
    }

    async fn purge_older_than(&self, horizon: chrono::Duration) -> Result<usize> {
        let mut journal = self.journal.lock().await;
        let removed = self.memory.purge_older_than(horizon).await?;
        if removed > 0 {
            let file = self
                .compact()
                .await
                .map_err(|e| ProxyError::Storage(format!("journal compaction: {e}")))?;
            *journal = file;
            tracing::debug!(removed, path = ?self.path, "compacted capture journal");
        }
        Ok(removed)
    }
}

/// Load journal entries from a JSONL file
///
/// Reads the file line-by-line and deserializes each line as a JournalEntry.
/// Malformed lines are skipped with a warning logged.
pub async fn load_journal<P: AsRef<Path>>(path: P) -> anyhow::Result<Vec<JournalEntry>> {
    use tokio::io::AsyncBufReadExt;

    let path_ref = path.as_ref();

    if !tokio::fs::try_exists(path_ref).await.unwrap_or(false) {
        return Ok(Vec::new());
    }

    let file = tokio::fs::File::open(path_ref).await?;
    let reader = tokio::io::BufReader::new(file);
    let mut lines = reader.lines();
    let mut entries = Vec::new();
    let mut line_num = 0;

    while let Some(line) = lines.next_line().await? {
        line_num += 1;
        if line.trim().is_empty() {
            continue;
        }

        match serde_json::from_str::<JournalEntry>(&line) {
            Ok(entry) => entries.push(entry),
            Err(e) => {
                tracing::warn!(line = line_num, error = %e, "failed to parse journal entry, skipping");
            }
        }
    }

    Ok(entries)
}
