//! Per-session tailing worker
//!
//! Consumes the profiler collection through a [`LogCursor`], drops replays
//! with a timestamp watermark, canonicalizes what is left and hands the
//! events to the fanout.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::fanout::EventFanout;
use super::shape::canonicalize;
use crate::backend::{LogCursor, ProfilerBackend};
use crate::error::ProfilerError;
use crate::types::{DatabaseId, RawLogEntry, SessionId};

/// Timestamp of the most recently accepted entry
///
/// Only strictly newer timestamps are accepted. Two distinct entries sharing
/// a timestamp cannot be told apart; the second one is dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Watermark(DateTime<Utc>);

impl Watermark {
    /// Start a watermark at `start`; nothing at or before it is accepted
    pub fn new(start: DateTime<Utc>) -> Self {
        Self(start)
    }

    /// Accept `timestamp` if it is newer than the watermark, advancing it
    pub fn advance(&mut self, timestamp: DateTime<Utc>) -> bool {
        if timestamp > self.0 {
            self.0 = timestamp;
            true
        } else {
            false
        }
    }

    /// Current watermark
    pub fn current(&self) -> DateTime<Utc> {
        self.0
    }
}

/// Why a tailing worker stopped
#[derive(Debug)]
pub enum TailExit {
    /// The session's cancellation token fired
    Cancelled,
    /// Opening or reading the cursor failed
    Failed(ProfilerError),
}

/// Tailing worker for one profiling session
pub struct TailingEngine<B: ProfilerBackend> {
    database_id: DatabaseId,
    session_id: SessionId,
    backend: Arc<B>,
    fanout: Arc<EventFanout>,
    cancel: CancellationToken,
    watermark: Watermark,
    published: u64,
}

impl<B: ProfilerBackend> TailingEngine<B> {
    /// Create a worker whose watermark starts at `started_at`
    pub fn new(
        database_id: DatabaseId,
        session_id: SessionId,
        backend: Arc<B>,
        fanout: Arc<EventFanout>,
        cancel: CancellationToken,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            database_id,
            session_id,
            backend,
            fanout,
            cancel,
            watermark: Watermark::new(started_at),
            published: 0,
        }
    }

    /// Database this worker tails
    pub fn database_id(&self) -> &DatabaseId {
        &self.database_id
    }

    /// Session this worker belongs to
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Run until cancelled or the cursor fails. The cursor is dropped on return.
    pub async fn run(mut self) -> TailExit {
        debug!(database_id = %self.database_id, session = %self.session_id, "Tail started");

        let open = tokio::select! {
            _ = self.cancel.cancelled() => return TailExit::Cancelled,
            open = self.backend.open_tail(&self.database_id) => open,
        };
        let mut cursor = match open {
            Ok(cursor) => cursor,
            Err(err) => return TailExit::Failed(err),
        };

        let exit = loop {
            if self.cancel.is_cancelled() {
                break TailExit::Cancelled;
            }
            match cursor.next_batch(&self.cancel).await {
                Ok(Some(batch)) => {
                    if !self.process_batch(batch).await {
                        break TailExit::Cancelled;
                    }
                }
                Ok(None) => break TailExit::Cancelled,
                Err(err) => break TailExit::Failed(err),
            }
        };
        drop(cursor);

        debug!(
            database_id = %self.database_id,
            session = %self.session_id,
            published = self.published,
            "Tail ended"
        );
        exit
    }

    /// Handle one batch in order; returns false if cancelled part-way.
    async fn process_batch(&mut self, batch: Vec<RawLogEntry>) -> bool {
        for entry in batch {
            if self.cancel.is_cancelled() {
                return false;
            }
            if !self.watermark.advance(entry.timestamp) {
                trace!(database_id = %self.database_id, ts = %entry.timestamp, "Dropping replayed entry");
                continue;
            }
            if entry.is_profile_namespace() {
                continue;
            }

            let shape = canonicalize(&entry);
            if !shape.is_supported() {
                trace!(database_id = %self.database_id, ns = %entry.namespace, %shape, "Skipping entry");
                continue;
            }

            let event = shape.into_event(&self.database_id, &entry);
            self.fanout.publish(event).await;
            self.published += 1;
        }
        true
    }
}
