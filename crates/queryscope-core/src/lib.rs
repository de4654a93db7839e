//! queryscope Core Library
//!
//! Live MongoDB profiler tailing and query-shape canonicalization.
//!
//! ## Overview
//!
//! queryscope lets operators watch the queries hitting a monitored database
//! as they run. A profiling session enables MongoDB's profiler, tails
//! `system.profile`, and turns every new entry into a readable query shape
//! such as `db.orders.find({status: "open"})`, broadcast to all listeners.
//!
//! ## Core Principles
//!
//! - **One tail per database**: starting twice never opens a second cursor
//! - **Never feeds on itself**: reads of the profiler collection are excluded
//! - **Slow listeners degrade alone**: delivery is bounded per listener
//!
//! ## Quick Start
//!
//! ```ignore
//! use queryscope_core::{DatabaseId, Profiler, ProfilerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ProfilerConfig::load(&ProfilerConfig::default_path())?;
//!     let profiler = Profiler::connect(&config).await?;
//!     let id = DatabaseId::new("orders-prod")?;
//!
//!     let mut events = profiler.subscribe();
//!     profiler.start_session(&id).await?;
//!
//!     while let Some(event) = events.recv().await {
//!         println!("{} {}ms {}", event.collection, event.execution_time_ms, event.query_shape);
//!     }
//!
//!     profiler.stop_session(&id).await?;
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod config;
pub mod engine;
pub mod error;
pub mod profiler;
pub mod types;

// Re-exports
pub use backend::{LogCursor, MemoryBackend, MongoBackend, ProfilerBackend};
pub use config::{DatabaseTarget, ProfilerConfig};
pub use engine::Profiler;
pub use error::{ProfilerError, ProfilerResult};
pub use profiler::{
    canonicalize, EventFanout, FanoutConfig, QueryShape, SessionRegistry, StartOutcome,
    Subscription,
};
pub use types::*;
