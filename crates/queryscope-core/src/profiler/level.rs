//! Profiling level control
//!
//! Issues MongoDB's `profile` command. Enabling always installs a filter that
//! keeps operations on the profiler collection itself out of the log, so
//! tailing never feeds on its own reads.

use std::sync::Arc;

use mongodb::bson::{doc, Document};
use tracing::info;

use crate::backend::ProfilerBackend;
use crate::error::{ProfilerError, ProfilerResult};
use crate::types::{profile_namespace, DatabaseId, ProfileLevel};

/// Build the `profile` command for `level`.
///
/// `slow_ms` is sent for [`ProfileLevel::All`] when given; a
/// [`ProfileLevel::SlowOnly`] threshold always wins. The exclusion filter is
/// omitted when turning the profiler off.
pub fn profile_command(level: ProfileLevel, slow_ms: Option<u64>, exclude_namespace: &str) -> Document {
    let mut command = doc! { "profile": level.as_profile_value() };

    let slow_ms = match level {
        ProfileLevel::Off => None,
        ProfileLevel::SlowOnly { threshold_ms } => Some(threshold_ms),
        ProfileLevel::All => slow_ms,
    };
    if let Some(ms) = slow_ms {
        command.insert("slowms", i64::try_from(ms).unwrap_or(i64::MAX));
    }

    if level != ProfileLevel::Off {
        command.insert("filter", doc! { "ns": { "$ne": exclude_namespace } });
    }
    command
}

/// Sets the profiling level of monitored databases
pub struct ProfileLevelController<B> {
    backend: Arc<B>,
}

impl<B: ProfilerBackend> ProfileLevelController<B> {
    /// Create a controller issuing commands through `backend`
    pub fn new(backend: Arc<B>) -> Self {
        Self { backend }
    }

    /// Set the profiling level of the database behind `id`.
    ///
    /// On error the level must be assumed unchanged.
    pub async fn set_level(
        &self,
        id: &DatabaseId,
        level: ProfileLevel,
        slow_ms: Option<u64>,
    ) -> ProfilerResult<()> {
        let database = self.backend.database_name(id)?;
        let command = profile_command(level, slow_ms, &profile_namespace(&database));

        self.backend
            .run_command(id, command)
            .await
            .map_err(|err| match err {
                ProfilerError::Configuration { .. } | ProfilerError::UnknownDatabase(_) => err,
                other => ProfilerError::configuration(id, other),
            })?;

        info!(database_id = %id, %database, %level, "Profiling level set");
        Ok(())
    }

    /// Turn the profiler off for the database behind `id`
    pub async fn disable(&self, id: &DatabaseId) -> ProfilerResult<()> {
        self.set_level(id, ProfileLevel::Off, None).await
    }
}
