//! Profiling sessions and the live tailing pipeline
//!
//! ## Overview
//!
//! Starting a session enables MongoDB's profiler on the monitored database and
//! spawns a worker that tails `system.profile`. Every new entry is turned into
//! a canonical query shape and broadcast to the subscribed listeners.
//!
//! ## Architecture
//!
//! ```text
//! SessionRegistry::start
//!   │
//!   ├── ProfileLevelController ── profile: 2, filter: { ns: { $ne: <db>.system.profile } }
//!   │
//!   └── TailingEngine (tokio task, one per database)
//!         │  LogCursor::next_batch   (blocks until data or cancellation)
//!         │  Watermark::advance      (drops replays and duplicates)
//!         │  shape::canonicalize     (find / aggregate / count / distinct)
//!         ▼
//!       EventFanout::publish ──► Subscription, Subscription, ...
//!
//! HistoryReader::list_recent ── recent_entries ── shape::canonicalize
//! ```

pub mod fanout;
pub mod history;
pub mod level;
pub mod registry;
pub mod shape;
pub mod tail;

pub use fanout::{EventFanout, FanoutConfig, ListenerId, PublishReport, Subscription};
pub use history::HistoryReader;
pub use level::{profile_command, ProfileLevelController};
pub use registry::{SessionRegistry, SessionSettings, StartOutcome};
pub use shape::{canonicalize, canonicalize_payload, CommandKind, QueryShape};
pub use tail::{TailExit, TailingEngine, Watermark};
