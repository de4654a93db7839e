//! MongoDB backend
//!
//! Tails `system.profile` with a tailable-await cursor. The profiler
//! collection only exists once the first operation has been profiled, and a
//! tailable cursor over a missing or empty capped collection is dead on
//! arrival, so the cursor transparently reopens after `reopen_delay` when the
//! server reports it exhausted. Replayed entries are dropped by the session
//! watermark.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use mongodb::bson::{doc, Document};
use mongodb::options::{ClientOptions, CursorType, FindOptions};
use mongodb::{Client, Collection, Cursor};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use super::{LogCursor, ProfilerBackend};
use crate::config::{CursorSection, DatabaseTarget};
use crate::error::{ProfilerError, ProfilerResult};
use crate::types::{DatabaseId, RawLogEntry, PROFILE_COLLECTION};

const APP_NAME: &str = "queryscope";

struct MongoTarget {
    client: Client,
    database: String,
}

/// Backend talking to real MongoDB deployments
pub struct MongoBackend {
    targets: HashMap<DatabaseId, MongoTarget>,
    reopen_delay: Duration,
    max_await: Duration,
}

impl MongoBackend {
    /// Build clients for every configured target.
    ///
    /// Targets sharing a URI share one client. No connection is made until
    /// the first command runs.
    pub async fn connect(targets: &[DatabaseTarget], cursor: &CursorSection) -> ProfilerResult<Self> {
        let mut clients: HashMap<String, Client> = HashMap::new();
        let mut resolved = HashMap::new();

        for target in targets {
            let client = match clients.get(&target.uri) {
                Some(client) => client.clone(),
                None => {
                    let mut options = ClientOptions::parse(&target.uri).await?;
                    options.app_name = Some(APP_NAME.to_string());
                    let client = Client::with_options(options)?;
                    clients.insert(target.uri.clone(), client.clone());
                    client
                }
            };
            debug!(database_id = %target.id, database = %target.database, "Registered MongoDB target");
            resolved.insert(
                target.id.clone(),
                MongoTarget {
                    client,
                    database: target.database.clone(),
                },
            );
        }

        info!(targets = resolved.len(), clients = clients.len(), "MongoDB backend ready");

        Ok(Self {
            targets: resolved,
            reopen_delay: Duration::from_millis(cursor.reopen_delay_ms),
            max_await: Duration::from_millis(cursor.max_await_ms),
        })
    }

    fn target(&self, id: &DatabaseId) -> ProfilerResult<&MongoTarget> {
        self.targets
            .get(id)
            .ok_or_else(|| ProfilerError::UnknownDatabase(id.clone()))
    }

    fn profile_collection(&self, id: &DatabaseId) -> ProfilerResult<Collection<Document>> {
        let target = self.target(id)?;
        Ok(target
            .client
            .database(&target.database)
            .collection::<Document>(PROFILE_COLLECTION))
    }
}

#[async_trait]
impl ProfilerBackend for MongoBackend {
    type Cursor = MongoLogCursor;

    fn database_name(&self, id: &DatabaseId) -> ProfilerResult<String> {
        Ok(self.target(id)?.database.clone())
    }

    async fn run_command(&self, id: &DatabaseId, command: Document) -> ProfilerResult<()> {
        let target = self.target(id)?;
        let reply = target
            .client
            .database(&target.database)
            .run_command(command)
            .await?;
        trace!(database_id = %id, ?reply, "Command reply");
        Ok(())
    }

    async fn open_tail(&self, id: &DatabaseId) -> ProfilerResult<Self::Cursor> {
        let collection = self.profile_collection(id)?;
        let mut cursor = MongoLogCursor {
            database_id: id.clone(),
            collection,
            cursor: None,
            reopen_delay: self.reopen_delay,
            max_await: self.max_await,
        };
        cursor.open().await?;
        Ok(cursor)
    }

    async fn recent_entries(
        &self,
        id: &DatabaseId,
        limit: usize,
        collection: Option<&str>,
    ) -> ProfilerResult<Vec<RawLogEntry>> {
        let database = self.database_name(id)?;
        let mut cursor = self
            .profile_collection(id)?
            .find(recent_filter(&database, collection))
            .with_options(recent_options(limit))
            .await?;

        let mut entries = Vec::new();
        while let Some(doc) = cursor.try_next().await? {
            match RawLogEntry::from_document(&doc) {
                Ok(entry) => entries.push(entry),
                Err(e) => debug!(database_id = %id, error = %e, "Skipping profiler document"),
            }
        }
        Ok(entries)
    }
}

/// Filter selecting profiler entries, optionally for one collection
fn recent_filter(database: &str, collection: Option<&str>) -> Document {
    match collection {
        Some(name) => doc! { "ns": format!("{}.{}", database, name) },
        None => doc! {},
    }
}

/// Newest entries first, at most `limit`
fn recent_options(limit: usize) -> FindOptions {
    FindOptions::builder()
        .sort(doc! { "ts": -1 })
        .limit(i64::try_from(limit).unwrap_or(i64::MAX))
        .build()
}

/// Natural order, waiting up to `max_await` per getMore, never timing out
fn tail_options(max_await: Duration) -> FindOptions {
    FindOptions::builder()
        .cursor_type(CursorType::TailableAwait)
        .no_cursor_timeout(true)
        .max_await_time(max_await)
        .build()
}

/// Tailable-await cursor over `system.profile`
pub struct MongoLogCursor {
    database_id: DatabaseId,
    collection: Collection<Document>,
    cursor: Option<Cursor<Document>>,
    reopen_delay: Duration,
    max_await: Duration,
}

impl MongoLogCursor {
    async fn open(&mut self) -> ProfilerResult<()> {
        let cursor = self
            .collection
            .find(doc! {})
            .with_options(tail_options(self.max_await))
            .await?;
        debug!(database_id = %self.database_id, "Opened profiler tail");
        self.cursor = Some(cursor);
        Ok(())
    }
}

#[async_trait]
impl LogCursor for MongoLogCursor {
    async fn next_batch(
        &mut self,
        cancel: &CancellationToken,
    ) -> ProfilerResult<Option<Vec<RawLogEntry>>> {
        loop {
            let next = match self.cursor.as_mut() {
                Some(cursor) => tokio::select! {
                    _ = cancel.cancelled() => return Ok(None),
                    next = cursor.next() => next,
                },
                None => {
                    self.open().await?;
                    continue;
                }
            };

            match next {
                Some(Ok(doc)) => {
                    let batch = match RawLogEntry::from_document(&doc) {
                        Ok(entry) => vec![entry],
                        Err(e) => {
                            debug!(database_id = %self.database_id, error = %e, "Skipping profiler document");
                            Vec::new()
                        }
                    };
                    return Ok(Some(batch));
                }
                Some(Err(e)) => return Err(ProfilerError::Cursor(e.to_string())),
                None => {
                    trace!(database_id = %self.database_id, "Profiler tail exhausted; reopening");
                    self.cursor = None;
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(None),
                        _ = tokio::time::sleep(self.reopen_delay) => {}
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recent_filter_scopes_to_collection() {
        assert_eq!(
            recent_filter("shop", Some("orders")),
            doc! { "ns": "shop.orders" }
        );
        assert_eq!(recent_filter("shop", None), doc! {});
    }

    #[test]
    fn test_recent_options_sort_newest_first() {
        let options = recent_options(25);
        assert_eq!(options.sort, Some(doc! { "ts": -1 }));
        assert_eq!(options.limit, Some(25));

        assert_eq!(recent_options(usize::MAX).limit, Some(i64::MAX));
    }

    #[test]
    fn test_tail_options_await_data() {
        let options = tail_options(Duration::from_millis(750));
        assert!(matches!(options.cursor_type, Some(CursorType::TailableAwait)));
        assert_eq!(options.no_cursor_timeout, Some(true));
        assert_eq!(options.max_await_time, Some(Duration::from_millis(750)));
        assert!(options.sort.is_none());
    }

    #[tokio::test]
    async fn test_unknown_target_is_rejected() {
        let backend = MongoBackend::connect(&[], &CursorSection::default())
            .await
            .unwrap();
        let id = DatabaseId::new("missing").unwrap();
        assert!(matches!(
            backend.database_name(&id),
            Err(ProfilerError::UnknownDatabase(_))
        ));
        assert!(matches!(
            backend.open_tail(&id).await,
            Err(ProfilerError::UnknownDatabase(_))
        ));
    }
}
