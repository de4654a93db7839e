//! In-process backend
//!
//! Keeps a profiler log per database in memory. Appending entries feeds every
//! open tail, administrative commands are recorded instead of executed, and
//! failures can be injected. Used by the test suite and for demos without a
//! MongoDB deployment.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use mongodb::bson::Document;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{LogCursor, ProfilerBackend};
use crate::error::{ProfilerError, ProfilerResult};
use crate::types::{DatabaseId, RawLogEntry};

type TailItem = Result<Vec<RawLogEntry>, String>;

#[derive(Default)]
struct MemoryDatabase {
    name: String,
    log: Vec<RawLogEntry>,
    commands: Vec<Document>,
    tails: Vec<mpsc::UnboundedSender<TailItem>>,
    command_failure: Option<String>,
    open_failure: Option<String>,
    command_delay: Option<Duration>,
}

/// In-memory monitored databases
#[derive(Default)]
pub struct MemoryBackend {
    databases: Mutex<HashMap<DatabaseId, MemoryDatabase>>,
}

impl MemoryBackend {
    /// Create an empty backend
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a database under `id` with the given database name
    pub fn add_database(&self, id: &DatabaseId, name: impl Into<String>) {
        self.databases.lock().insert(
            id.clone(),
            MemoryDatabase {
                name: name.into(),
                ..Default::default()
            },
        );
    }

    /// Append entries to the log and deliver them to open tails as one batch
    pub fn append(&self, id: &DatabaseId, entries: Vec<RawLogEntry>) {
        let mut databases = self.databases.lock();
        if let Some(db) = databases.get_mut(id) {
            db.log.extend(entries.iter().cloned());
            db.tails.retain(|tail| tail.send(Ok(entries.clone())).is_ok());
        }
    }

    /// Make every open tail of `id` fail on its next batch
    pub fn fail_tails(&self, id: &DatabaseId, message: impl Into<String>) {
        let message = message.into();
        let mut databases = self.databases.lock();
        if let Some(db) = databases.get_mut(id) {
            db.tails.retain(|tail| tail.send(Err(message.clone())).is_ok());
        }
    }

    /// Make administrative commands against `id` fail (or succeed again with `None`)
    pub fn set_command_failure(&self, id: &DatabaseId, message: Option<String>) {
        if let Some(db) = self.databases.lock().get_mut(id) {
            db.command_failure = message;
        }
    }

    /// Make opening a tail on `id` fail (or succeed again with `None`)
    pub fn set_open_failure(&self, id: &DatabaseId, message: Option<String>) {
        if let Some(db) = self.databases.lock().get_mut(id) {
            db.open_failure = message;
        }
    }

    /// Delay every administrative command against `id`
    pub fn set_command_delay(&self, id: &DatabaseId, delay: Option<Duration>) {
        if let Some(db) = self.databases.lock().get_mut(id) {
            db.command_delay = delay;
        }
    }

    /// Commands issued against `id`, oldest first
    pub fn commands(&self, id: &DatabaseId) -> Vec<Document> {
        self.databases
            .lock()
            .get(id)
            .map(|db| db.commands.clone())
            .unwrap_or_default()
    }

    /// Number of tails on `id` whose cursor is still alive
    pub fn open_tails(&self, id: &DatabaseId) -> usize {
        self.databases
            .lock()
            .get(id)
            .map(|db| db.tails.iter().filter(|tail| !tail.is_closed()).count())
            .unwrap_or(0)
    }
}

#[async_trait]
impl ProfilerBackend for MemoryBackend {
    type Cursor = MemoryCursor;

    fn database_name(&self, id: &DatabaseId) -> ProfilerResult<String> {
        self.databases
            .lock()
            .get(id)
            .map(|db| db.name.clone())
            .ok_or_else(|| ProfilerError::UnknownDatabase(id.clone()))
    }

    async fn run_command(&self, id: &DatabaseId, command: Document) -> ProfilerResult<()> {
        let delay = self
            .databases
            .lock()
            .get(id)
            .ok_or_else(|| ProfilerError::UnknownDatabase(id.clone()))?
            .command_delay;

        // Commands take effect when they complete, like a round trip.
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut databases = self.databases.lock();
        let db = databases
            .get_mut(id)
            .ok_or_else(|| ProfilerError::UnknownDatabase(id.clone()))?;
        if let Some(message) = &db.command_failure {
            return Err(ProfilerError::configuration(id, message));
        }
        db.commands.push(command);
        Ok(())
    }

    async fn open_tail(&self, id: &DatabaseId) -> ProfilerResult<Self::Cursor> {
        let mut databases = self.databases.lock();
        let db = databases
            .get_mut(id)
            .ok_or_else(|| ProfilerError::UnknownDatabase(id.clone()))?;
        if let Some(message) = &db.open_failure {
            return Err(ProfilerError::Cursor(message.clone()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        // A fresh tail starts at the beginning of the log, like a capped collection.
        if !db.log.is_empty() {
            let _ = tx.send(Ok(db.log.clone()));
        }
        db.tails.push(tx);
        Ok(MemoryCursor { rx })
    }

    async fn recent_entries(
        &self,
        id: &DatabaseId,
        limit: usize,
        collection: Option<&str>,
    ) -> ProfilerResult<Vec<RawLogEntry>> {
        let databases = self.databases.lock();
        let db = databases
            .get(id)
            .ok_or_else(|| ProfilerError::UnknownDatabase(id.clone()))?;

        let mut entries: Vec<RawLogEntry> = db
            .log
            .iter()
            .filter(|entry| match collection {
                Some(name) => entry.namespace == format!("{}.{}", db.name, name),
                None => true,
            })
            .cloned()
            .collect();
        entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        entries.truncate(limit);
        Ok(entries)
    }
}

/// Tail over a [`MemoryBackend`] log
pub struct MemoryCursor {
    rx: mpsc::UnboundedReceiver<TailItem>,
}

#[async_trait]
impl LogCursor for MemoryCursor {
    async fn next_batch(
        &mut self,
        cancel: &CancellationToken,
    ) -> ProfilerResult<Option<Vec<RawLogEntry>>> {
        tokio::select! {
            _ = cancel.cancelled() => Ok(None),
            item = self.rx.recv() => match item {
                Some(Ok(batch)) => Ok(Some(batch)),
                Some(Err(message)) => Err(ProfilerError::Cursor(message)),
                None => Err(ProfilerError::Cursor("tail closed".to_string())),
            },
        }
    }
}
