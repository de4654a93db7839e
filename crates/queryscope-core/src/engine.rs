//! Profiler facade
//!
//! Wires the session registry, the fanout and the history reader behind the
//! three surfaces the API layer consumes: session control, real-time
//! delivery and one-shot lookups.

use std::sync::Arc;

use tracing::info;

use crate::backend::{MongoBackend, ProfilerBackend};
use crate::config::ProfilerConfig;
use crate::error::ProfilerResult;
use crate::profiler::{
    EventFanout, HistoryReader, SessionRegistry, StartOutcome, Subscription,
};
use crate::types::{DatabaseId, ProfileLevel, ProfiledQueryEvent};

/// Entry point for profiling monitored databases
pub struct Profiler<B: ProfilerBackend> {
    registry: SessionRegistry<B>,
    fanout: Arc<EventFanout>,
    history: HistoryReader<B>,
    default_limit: usize,
}

impl Profiler<MongoBackend> {
    /// Build a profiler over the MongoDB targets listed in `config`
    pub async fn connect(config: &ProfilerConfig) -> ProfilerResult<Self> {
        let backend = MongoBackend::connect(&config.databases, &config.cursor).await?;
        Ok(Self::new(Arc::new(backend), config))
    }
}

impl<B: ProfilerBackend> Profiler<B> {
    /// Build a profiler over any backend
    pub fn new(backend: Arc<B>, config: &ProfilerConfig) -> Self {
        let fanout = Arc::new(EventFanout::new(config.fanout.fanout_config()));
        let registry = SessionRegistry::new(
            backend.clone(),
            fanout.clone(),
            config.profiling.session_settings(),
        );
        let history = HistoryReader::new(backend, config.history.max_limit);

        info!(
            level = %config.profiling.profile_level(),
            slow_ms = config.profiling.slow_ms,
            "Profiler ready"
        );

        Self {
            registry,
            fanout,
            history,
            default_limit: config.history.default_limit,
        }
    }

    /// Start a profiling session for `id`
    pub async fn start_session(&self, id: &DatabaseId) -> ProfilerResult<StartOutcome> {
        self.registry.start(id).await
    }

    /// Stop the profiling session for `id`; `Ok(false)` if none was running
    pub async fn stop_session(&self, id: &DatabaseId) -> ProfilerResult<bool> {
        self.registry.stop(id).await
    }

    /// Check if a session is running for `id`
    pub fn is_active(&self, id: &DatabaseId) -> bool {
        self.registry.is_active(id)
    }

    /// Databases with a running session
    pub fn active_sessions(&self) -> Vec<DatabaseId> {
        self.registry.active_sessions()
    }

    /// Subscribe to live events from every session
    pub fn subscribe(&self) -> Subscription {
        self.fanout.subscribe()
    }

    /// Fanout shared by all sessions
    pub fn fanout(&self) -> &Arc<EventFanout> {
        &self.fanout
    }

    /// Most recent profiler entries of `id`, newest first
    ///
    /// `limit` defaults to `history.default_limit` and is capped at
    /// `history.max_limit`.
    pub async fn list_recent(
        &self,
        id: &DatabaseId,
        limit: Option<usize>,
        collection: Option<&str>,
    ) -> ProfilerResult<Vec<ProfiledQueryEvent>> {
        self.history
            .list_recent(id, limit.unwrap_or(self.default_limit), collection)
            .await
    }

    /// Set the profiling level of `id` directly, outside any session
    pub async fn set_level(
        &self,
        id: &DatabaseId,
        level: ProfileLevel,
        slow_ms: Option<u64>,
    ) -> ProfilerResult<()> {
        self.registry.set_level(id, level, slow_ms).await
    }

    /// Stop every session and wait for the workers
    pub async fn shutdown(&self) {
        self.registry.shutdown().await;
    }
}
