//! One-shot lookups of recent profiler entries, no session involved.

use std::sync::Arc;

use tracing::debug;

use super::shape::canonicalize;
use crate::backend::ProfilerBackend;
use crate::error::ProfilerResult;
use crate::types::{DatabaseId, ProfiledQueryEvent};

/// Reads and canonicalizes the most recent profiler entries
pub struct HistoryReader<B> {
    backend: Arc<B>,
    max_limit: usize,
}

impl<B: ProfilerBackend> HistoryReader<B> {
    /// Create a reader that never returns more than `max_limit` entries
    pub fn new(backend: Arc<B>, max_limit: usize) -> Self {
        Self { backend, max_limit }
    }

    /// List up to `limit` entries, newest first.
    ///
    /// Unsupported shapes are kept so operators can see every recorded
    /// operation. A blank collection filter means no filter.
    pub async fn list_recent(
        &self,
        id: &DatabaseId,
        limit: usize,
        collection: Option<&str>,
    ) -> ProfilerResult<Vec<ProfiledQueryEvent>> {
        let limit = limit.min(self.max_limit);
        if limit == 0 {
            return Ok(Vec::new());
        }
        let collection = collection.map(str::trim).filter(|c| !c.is_empty());

        let mut entries = self.backend.recent_entries(id, limit, collection).await?;
        entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        entries.truncate(limit);

        debug!(database_id = %id, count = entries.len(), ?collection, "Listed recent entries");

        Ok(entries
            .iter()
            .map(|entry| canonicalize(entry).into_event(id, entry))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::profiler::shape::UNSUPPORTED_QUERY;
    use crate::types::{LogPayload, RawLogEntry};
    use chrono::{Duration, Utc};
    use mongodb::bson::doc;

    fn setup() -> (Arc<MemoryBackend>, DatabaseId) {
        let backend = Arc::new(MemoryBackend::new());
        let id = DatabaseId::new("shop-local").unwrap();
        backend.add_database(&id, "shop");

        let now = Utc::now();
        backend.append(
            &id,
            vec![
                RawLogEntry::new(
                    now,
                    "shop.orders",
                    3,
                    LogPayload::Command(doc! { "find": "orders", "filter": { "a": 1 } }),
                ),
                RawLogEntry::new(now + Duration::seconds(1), "shop.users", 7, LogPayload::Absent),
                RawLogEntry::new(
                    now + Duration::seconds(2),
                    "shop.orders",
                    1,
                    LogPayload::Command(doc! { "count": "orders" }),
                ),
            ],
        );
        (backend, id)
    }

    #[tokio::test]
    async fn test_newest_first_and_canonical() {
        let (backend, id) = setup();
        let reader = HistoryReader::new(backend, 100);

        let events = reader.list_recent(&id, 10, None).await.unwrap();
        let shapes: Vec<&str> = events.iter().map(|e| e.query_shape.as_str()).collect();
        assert_eq!(
            shapes,
            vec!["db.orders.count({})", UNSUPPORTED_QUERY, "db.orders.find({a: 1})"]
        );
        assert_eq!(events[1].collection, "users");
        assert_eq!(events[1].execution_time_ms, 7);
    }

    #[tokio::test]
    async fn test_collection_filter_and_limit() {
        let (backend, id) = setup();
        let reader = HistoryReader::new(backend, 100);

        let events = reader.list_recent(&id, 1, Some("orders")).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].query_shape, "db.orders.count({})");

        let events = reader.list_recent(&id, 10, Some("  ")).await.unwrap();
        assert_eq!(events.len(), 3);
    }

    #[tokio::test]
    async fn test_limit_is_clamped() {
        let (backend, id) = setup();
        let reader = HistoryReader::new(backend, 2);
        assert_eq!(reader.list_recent(&id, 50, None).await.unwrap().len(), 2);
        assert!(reader.list_recent(&id, 0, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_database_errors() {
        let reader = HistoryReader::new(Arc::new(MemoryBackend::new()), 10);
        let id = DatabaseId::new("missing").unwrap();
        assert!(reader.list_recent(&id, 5, None).await.is_err());
    }
}
