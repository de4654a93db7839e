//! Core types for queryscope

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use mongodb::bson::{Bson, Document};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::error::{ProfilerError, ProfilerResult};

/// Name of the collection MongoDB writes profiler entries to.
pub const PROFILE_COLLECTION: &str = "system.profile";

/// Identifier of a monitored database, as known to the API layer
///
/// This is the handle operators use to start and stop sessions. It is
/// resolved to a connection and database name by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DatabaseId(String);

impl DatabaseId {
    /// Create a DatabaseId, rejecting empty or whitespace-only ids
    pub fn new(id: impl Into<String>) -> ProfilerResult<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(ProfilerError::InvalidDatabaseId(id));
        }
        Ok(Self(id))
    }

    /// Get the id as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for DatabaseId {
    type Err = ProfilerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for DatabaseId {
    type Error = ProfilerError;

    fn try_from(id: String) -> Result<Self, Self::Error> {
        Self::new(id)
    }
}

impl From<DatabaseId> for String {
    fn from(id: DatabaseId) -> Self {
        id.0
    }
}

impl fmt::Display for DatabaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Unique identifier for one profiling session
///
/// Uses ULID so session ids sort by start time in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub Ulid);

impl SessionId {
    /// Create a new SessionId with current timestamp
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session_{}", self.0)
    }
}

/// Profiling verbosity of a monitored database
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProfileLevel {
    /// Profiler disabled
    Off,
    /// Only operations slower than the threshold are logged
    SlowOnly {
        /// Slow-operation threshold in milliseconds
        threshold_ms: u64,
    },
    /// Every operation is logged
    All,
}

impl ProfileLevel {
    /// Numeric value of the `profile` command (0, 1 or 2)
    pub fn as_profile_value(&self) -> i32 {
        match self {
            ProfileLevel::Off => 0,
            ProfileLevel::SlowOnly { .. } => 1,
            ProfileLevel::All => 2,
        }
    }
}

impl fmt::Display for ProfileLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProfileLevel::Off => write!(f, "off"),
            ProfileLevel::SlowOnly { threshold_ms } => write!(f, "slow (>{}ms)", threshold_ms),
            ProfileLevel::All => write!(f, "all"),
        }
    }
}

/// The operation recorded by a profiler entry
#[derive(Debug, Clone, PartialEq)]
pub enum LogPayload {
    /// Legacy query-style entry carrying the filter document
    Query(Document),
    /// Command-style entry carrying the full command document
    Command(Document),
    /// Neither a query nor a command was recorded
    Absent,
}

impl LogPayload {
    /// Pick the payload out of a profiler document; `query` wins over `command`.
    pub fn from_document(doc: &Document) -> Self {
        if let Ok(query) = doc.get_document("query") {
            LogPayload::Query(query.clone())
        } else if let Ok(command) = doc.get_document("command") {
            LogPayload::Command(command.clone())
        } else {
            LogPayload::Absent
        }
    }
}

/// One entry of the monitored database's execution log
#[derive(Debug, Clone, PartialEq)]
pub struct RawLogEntry {
    /// When the operation ran
    pub timestamp: DateTime<Utc>,
    /// `database.collection` the operation targeted
    pub namespace: String,
    /// Execution time in milliseconds
    pub duration_ms: i64,
    /// Recorded operation
    pub payload: LogPayload,
}

impl RawLogEntry {
    /// Create an entry from its parts
    pub fn new(
        timestamp: DateTime<Utc>,
        namespace: impl Into<String>,
        duration_ms: i64,
        payload: LogPayload,
    ) -> Self {
        Self {
            timestamp,
            namespace: namespace.into(),
            duration_ms,
            payload,
        }
    }

    /// Parse a `system.profile` document.
    ///
    /// `ts` and `ns` are required. `millis` defaults to 0 when missing.
    pub fn from_document(doc: &Document) -> ProfilerResult<Self> {
        let ts = doc
            .get_datetime("ts")
            .map_err(|e| ProfilerError::MalformedEntry(format!("ts: {}", e)))?;
        let timestamp = DateTime::<Utc>::from_timestamp_millis(ts.timestamp_millis())
            .ok_or_else(|| ProfilerError::MalformedEntry("ts out of range".to_string()))?;

        let namespace = doc
            .get_str("ns")
            .map_err(|e| ProfilerError::MalformedEntry(format!("ns: {}", e)))?;

        let duration_ms = match doc.get("millis") {
            Some(Bson::Int32(v)) => i64::from(*v),
            Some(Bson::Int64(v)) => *v,
            Some(Bson::Double(v)) => *v as i64,
            _ => 0,
        };

        Ok(Self {
            timestamp,
            namespace: namespace.to_string(),
            duration_ms,
            payload: LogPayload::from_document(doc),
        })
    }

    /// Collection part of the namespace
    pub fn collection(&self) -> &str {
        collection_of(&self.namespace)
    }

    /// Whether the entry records an operation on the profiler collection itself
    pub fn is_profile_namespace(&self) -> bool {
        self.collection() == PROFILE_COLLECTION
    }
}

/// Strip the `database.` prefix from a namespace.
///
/// A namespace without a dot is returned whole.
pub fn collection_of(namespace: &str) -> &str {
    namespace
        .split_once('.')
        .map(|(_, collection)| collection)
        .unwrap_or(namespace)
}

/// Namespace of the profiler collection for a database name
pub fn profile_namespace(database: &str) -> String {
    format!("{}.{}", database, PROFILE_COLLECTION)
}

/// Canonical event emitted for every accepted profiler entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfiledQueryEvent {
    /// Monitored database the entry came from
    pub database_id: DatabaseId,
    /// When the operation ran
    pub timestamp: DateTime<Utc>,
    /// Collection the operation targeted
    pub collection: String,
    /// Human-readable query shape
    pub query_shape: String,
    /// Execution time in milliseconds
    pub execution_time_ms: i64,
}
