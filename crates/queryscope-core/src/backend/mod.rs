//! Monitored-database backends
//!
//! The profiler only needs three things from a monitored database: run an
//! administrative command, tail the profiler collection, and point-read the
//! most recent profiler entries.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  ProfilerBackend                                                │
//! │  ├── run_command      (profile level / exclusion filter)        │
//! │  ├── open_tail        → LogCursor (awaitable, cancellable)      │
//! │  └── recent_entries   (most-recent-first, bounded)              │
//! │                                                                 │
//! │  MongoBackend:  mongodb driver, one client per URI              │
//! │  MemoryBackend: in-process log, used by tests and demos         │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use async_trait::async_trait;
use mongodb::bson::Document;
use tokio_util::sync::CancellationToken;

use crate::error::ProfilerResult;
use crate::types::{DatabaseId, RawLogEntry};

pub mod memory;
pub mod mongo;

pub use memory::{MemoryBackend, MemoryCursor};
pub use mongo::{MongoBackend, MongoLogCursor};

/// Awaitable cursor over the profiler collection
#[async_trait]
pub trait LogCursor: Send {
    /// Wait for the next batch of entries.
    ///
    /// Blocks until entries arrive, the cursor fails, or `cancel` fires.
    /// Returns `Ok(None)` when cancelled. A batch may be empty.
    async fn next_batch(
        &mut self,
        cancel: &CancellationToken,
    ) -> ProfilerResult<Option<Vec<RawLogEntry>>>;
}

/// Access to the monitored databases
#[async_trait]
pub trait ProfilerBackend: Send + Sync + 'static {
    /// Cursor type returned by [`ProfilerBackend::open_tail`]
    type Cursor: LogCursor + 'static;

    /// Name of the database behind `id`
    fn database_name(&self, id: &DatabaseId) -> ProfilerResult<String>;

    /// Run an administrative command against the database behind `id`
    async fn run_command(&self, id: &DatabaseId, command: Document) -> ProfilerResult<()>;

    /// Open a tail over the profiler collection: empty filter, natural order
    async fn open_tail(&self, id: &DatabaseId) -> ProfilerResult<Self::Cursor>;

    /// Read up to `limit` profiler entries, newest first, optionally only
    /// those recorded against `collection`
    async fn recent_entries(
        &self,
        id: &DatabaseId,
        limit: usize,
        collection: Option<&str>,
    ) -> ProfilerResult<Vec<RawLogEntry>>;
}
