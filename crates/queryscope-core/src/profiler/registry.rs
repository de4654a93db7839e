//! Profiling session registry
//!
//! The `SessionRegistry` owns every live profiling session, at most one per
//! monitored database, and the tailing worker spawned for it.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  SessionRegistry                                                │
//! │  ├── sessions: Mutex<HashMap<DatabaseId, SessionSlot>>          │
//! │  │   └── session id + token + start state + worker handle       │
//! │  ├── config_locks: one async lock per database                  │
//! │  │   └── held across every profile command for that database    │
//! │  ├── controller: ProfileLevelController                         │
//! │  │   └── enables on start, disables on stop                     │
//! │  └── fanout: EventFanout                                        │
//! │      └── receives every event the workers accept                │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Lifecycle
//!
//! - `start` reserves the slot under the session lock (one winner per id),
//!   then configures profiling under the database's config lock. A
//!   configuration failure releases the slot.
//! - A `start` that finds a slot still configuring waits for that attempt.
//!   It returns `AlreadyActive` if it succeeded, `StartInterrupted` if a stop
//!   cancelled it, and retries on its own if it failed.
//! - `stop` removes and cancels the slot under the session lock, then
//!   disables profiling. It does not wait for the worker to exit.
//! - A worker whose cursor fails removes its own slot, if the slot still
//!   belongs to its session, and disables profiling. There is no retry.
//!
//! Every disable runs under the config lock and is skipped when a newer
//! session owns the database by then, so the last command a database sees
//! always matches whether a session is registered for it. The session lock
//! is never held across an await.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::{watch, Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::fanout::EventFanout;
use super::level::ProfileLevelController;
use super::tail::{TailExit, TailingEngine};
use crate::backend::ProfilerBackend;
use crate::error::{ProfilerError, ProfilerResult};
use crate::types::{DatabaseId, ProfileLevel, SessionId};

/// How long `shutdown` waits for each worker to exit
const WORKER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

type SessionMap = Arc<Mutex<HashMap<DatabaseId, SessionSlot>>>;

type ConfigLocks = Arc<Mutex<HashMap<DatabaseId, Arc<AsyncMutex<()>>>>>;

/// Result of a start request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// A new session was started
    Started(SessionId),
    /// A session was already running and was left untouched
    AlreadyActive(SessionId),
}

impl StartOutcome {
    /// Session that is running after the call
    pub fn session_id(&self) -> SessionId {
        match self {
            StartOutcome::Started(id) | StartOutcome::AlreadyActive(id) => *id,
        }
    }
}

/// Profiling level applied when a session starts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSettings {
    /// Level to enable
    pub level: ProfileLevel,
    /// Slow-operation threshold sent along with the level
    pub slow_ms: Option<u64>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            level: ProfileLevel::All,
            slow_ms: Some(100),
        }
    }
}

/// Where a session's start attempt stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    /// Profiling is being enabled
    Starting,
    /// Worker spawned
    Active,
    /// Enabling failed and the slot was released
    Failed,
    /// A stop removed the slot before the start finished
    Interrupted,
}

/// State for a single session
struct SessionSlot {
    session_id: SessionId,
    cancel: CancellationToken,
    state: watch::Sender<SlotState>,
    /// Set once the worker is spawned
    worker: Option<JoinHandle<()>>,
}

/// What `start` found when it looked up the slot
enum Reservation {
    /// This call owns a fresh slot and must configure it
    Reserved {
        session_id: SessionId,
        cancel: CancellationToken,
    },
    /// Another call is still configuring
    Starting {
        session_id: SessionId,
        state: watch::Receiver<SlotState>,
    },
    /// A session is running
    Active(SessionId),
}

/// Registry of profiling sessions, one per monitored database
pub struct SessionRegistry<B: ProfilerBackend> {
    sessions: SessionMap,
    config_locks: ConfigLocks,
    backend: Arc<B>,
    controller: Arc<ProfileLevelController<B>>,
    fanout: Arc<EventFanout>,
    settings: SessionSettings,
}

impl<B: ProfilerBackend> SessionRegistry<B> {
    /// Create an empty registry
    pub fn new(backend: Arc<B>, fanout: Arc<EventFanout>, settings: SessionSettings) -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            config_locks: Arc::new(Mutex::new(HashMap::new())),
            controller: Arc::new(ProfileLevelController::new(backend.clone())),
            backend,
            fanout,
            settings,
        }
    }

    /// Check if a session is running for `id`
    pub fn is_active(&self, id: &DatabaseId) -> bool {
        self.sessions.lock().contains_key(id)
    }

    /// Number of running sessions
    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Databases with a running session, sorted
    pub fn active_sessions(&self) -> Vec<DatabaseId> {
        let mut ids: Vec<DatabaseId> = self.sessions.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Start profiling `id`.
    ///
    /// If a session already runs for `id` it is left untouched and
    /// `AlreadyActive` is returned. Configuration failures are returned and
    /// leave no session behind.
    pub async fn start(&self, id: &DatabaseId) -> ProfilerResult<StartOutcome> {
        loop {
            let (pending, mut state) = match self.reserve(id) {
                Reservation::Reserved { session_id, cancel } => {
                    return self.launch(id, session_id, cancel).await;
                }
                Reservation::Active(session_id) => {
                    debug!(database_id = %id, session = %session_id, "Session already active");
                    return Ok(StartOutcome::AlreadyActive(session_id));
                }
                Reservation::Starting { session_id, state } => (session_id, state),
            };

            debug!(database_id = %id, session = %pending, "Waiting for in-flight start");
            let settled = state
                .wait_for(|state| *state != SlotState::Starting)
                .await
                .map(|state| *state)
                .unwrap_or(SlotState::Failed);

            match settled {
                SlotState::Active => return Ok(StartOutcome::AlreadyActive(pending)),
                SlotState::Interrupted => return Err(ProfilerError::StartInterrupted(id.clone())),
                // the other attempt failed; make our own
                SlotState::Starting | SlotState::Failed => continue,
            }
        }
    }

    fn reserve(&self, id: &DatabaseId) -> Reservation {
        let mut sessions = self.sessions.lock();
        if let Some(slot) = sessions.get(id) {
            let starting = *slot.state.borrow() == SlotState::Starting;
            return if starting {
                Reservation::Starting {
                    session_id: slot.session_id,
                    state: slot.state.subscribe(),
                }
            } else {
                Reservation::Active(slot.session_id)
            };
        }

        let (state, _) = watch::channel(SlotState::Starting);
        let slot = SessionSlot {
            session_id: SessionId::new(),
            cancel: CancellationToken::new(),
            state,
            worker: None,
        };
        let reservation = Reservation::Reserved {
            session_id: slot.session_id,
            cancel: slot.cancel.clone(),
        };
        sessions.insert(id.clone(), slot);
        reservation
    }

    /// Configure profiling for a reserved slot and spawn its worker
    async fn launch(
        &self,
        id: &DatabaseId,
        session_id: SessionId,
        cancel: CancellationToken,
    ) -> ProfilerResult<StartOutcome> {
        info!(database_id = %id, session = %session_id, "Starting profiling session");
        let _config = lock_config(&self.config_locks, id).await;

        if cancel.is_cancelled() {
            debug!(database_id = %id, session = %session_id, "Stopped before profiling was enabled");
            return Err(ProfilerError::StartInterrupted(id.clone()));
        }

        let started_at = Utc::now();
        if let Err(err) = self
            .controller
            .set_level(id, self.settings.level, self.settings.slow_ms)
            .await
        {
            release_slot(&self.sessions, id, session_id);
            warn!(database_id = %id, error = %err, "Could not enable profiling");
            return Err(err);
        }

        if cancel.is_cancelled() {
            // The stop that removed the slot is queued on the config lock and
            // disables after this enable.
            debug!(database_id = %id, session = %session_id, "Stopped while profiling was being enabled");
            return Err(ProfilerError::StartInterrupted(id.clone()));
        }

        let engine = TailingEngine::new(
            id.clone(),
            session_id,
            self.backend.clone(),
            self.fanout.clone(),
            cancel,
            started_at,
        );
        let worker = tokio::spawn(session_task(
            engine,
            self.sessions.clone(),
            self.config_locks.clone(),
            self.controller.clone(),
        ));

        let mut sessions = self.sessions.lock();
        match sessions.get_mut(id) {
            Some(slot) if slot.session_id == session_id => {
                slot.worker = Some(worker);
                slot.state.send_replace(SlotState::Active);
            }
            // stopped in the meantime; the worker sees the cancellation
            _ => debug!(database_id = %id, session = %session_id, "Session stopped during start"),
        }

        Ok(StartOutcome::Started(session_id))
    }

    /// Stop profiling `id`.
    ///
    /// Returns `Ok(false)` if no session was running. Otherwise the session
    /// is removed and cancelled before profiling is disabled, so a disable
    /// failure is reported but never resurrects the session.
    pub async fn stop(&self, id: &DatabaseId) -> ProfilerResult<bool> {
        let slot = self.sessions.lock().remove(id);
        let Some(slot) = slot else {
            debug!(database_id = %id, "No session to stop");
            return Ok(false);
        };

        info!(database_id = %id, session = %slot.session_id, "Stopping profiling session");
        slot.cancel.cancel();
        settle(&slot.state, SlotState::Interrupted);

        let _config = lock_config(&self.config_locks, id).await;
        disable_unless_owned(&self.sessions, &self.controller, id).await?;
        Ok(true)
    }

    /// Set the profiling level of `id` directly, outside any session
    pub async fn set_level(
        &self,
        id: &DatabaseId,
        level: ProfileLevel,
        slow_ms: Option<u64>,
    ) -> ProfilerResult<()> {
        let _config = lock_config(&self.config_locks, id).await;
        self.controller.set_level(id, level, slow_ms).await
    }

    /// Stop every session and wait for the workers to exit
    pub async fn shutdown(&self) {
        let slots: Vec<(DatabaseId, SessionSlot)> = self.sessions.lock().drain().collect();
        info!(sessions = slots.len(), "Shutting down profiling sessions");

        for (_, slot) in &slots {
            slot.cancel.cancel();
            settle(&slot.state, SlotState::Interrupted);
        }

        for (id, slot) in slots {
            {
                let _config = lock_config(&self.config_locks, &id).await;
                if let Err(err) = disable_unless_owned(&self.sessions, &self.controller, &id).await {
                    warn!(database_id = %id, error = %err, "Could not disable profiling during shutdown");
                }
            }
            if let Some(worker) = slot.worker {
                if tokio::time::timeout(WORKER_SHUTDOWN_TIMEOUT, worker).await.is_err() {
                    warn!(database_id = %id, "Tail worker did not exit in time");
                }
            }
        }
    }
}

/// Take the configuration lock of `id`
async fn lock_config(locks: &ConfigLocks, id: &DatabaseId) -> OwnedMutexGuard<()> {
    let lock = locks.lock().entry(id.clone()).or_default().clone();
    lock.lock_owned().await
}

/// Resolve a pending start, leaving settled states alone
fn settle(state: &watch::Sender<SlotState>, outcome: SlotState) {
    state.send_if_modified(|current| {
        if *current == SlotState::Starting {
            *current = outcome;
            true
        } else {
            false
        }
    });
}

/// Remove the slot for `id` if it still belongs to `session_id`
fn release_slot(sessions: &SessionMap, id: &DatabaseId, session_id: SessionId) -> bool {
    let mut sessions = sessions.lock();
    let owned = sessions
        .get(id)
        .map(|slot| slot.session_id == session_id)
        .unwrap_or(false);
    if owned {
        if let Some(slot) = sessions.remove(id) {
            settle(&slot.state, SlotState::Failed);
        }
    }
    owned
}

/// Disable profiling for `id` unless a session owns it again.
///
/// Callers hold the config lock of `id`. Returns whether the command was sent.
async fn disable_unless_owned<B: ProfilerBackend>(
    sessions: &SessionMap,
    controller: &ProfileLevelController<B>,
    id: &DatabaseId,
) -> ProfilerResult<bool> {
    let owner = sessions.lock().get(id).map(|slot| slot.session_id);
    if let Some(owner) = owner {
        debug!(database_id = %id, session = %owner, "Database owned by a newer session; leaving profiling on");
        return Ok(false);
    }
    controller.disable(id).await?;
    Ok(true)
}

/// Background task running one session's worker
async fn session_task<B: ProfilerBackend>(
    engine: TailingEngine<B>,
    sessions: SessionMap,
    config_locks: ConfigLocks,
    controller: Arc<ProfileLevelController<B>>,
) {
    let database_id = engine.database_id().clone();
    let session_id = engine.session_id();

    match engine.run().await {
        TailExit::Cancelled => {
            debug!(%database_id, session = %session_id, "Session worker cancelled");
        }
        TailExit::Failed(err) => {
            warn!(%database_id, session = %session_id, error = %err, "Profiler tail failed; ending session");
            if release_slot(&sessions, &database_id, session_id) {
                let _config = lock_config(&config_locks, &database_id).await;
                if let Err(err) = disable_unless_owned(&sessions, &controller, &database_id).await {
                    warn!(%database_id, error = %err, "Could not disable profiling after tail failure");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;

    fn setup() -> (Arc<MemoryBackend>, SessionRegistry<MemoryBackend>, DatabaseId) {
        let backend = Arc::new(MemoryBackend::new());
        let id = DatabaseId::new("shop-local").unwrap();
        backend.add_database(&id, "shop");
        let registry = SessionRegistry::new(
            backend.clone(),
            Arc::new(EventFanout::with_defaults()),
            SessionSettings::default(),
        );
        (backend, registry, id)
    }

    async fn wait_for(condition: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    fn spawn_start(
        registry: &Arc<SessionRegistry<MemoryBackend>>,
        id: &DatabaseId,
    ) -> JoinHandle<ProfilerResult<StartOutcome>> {
        let registry = registry.clone();
        let id = id.clone();
        tokio::spawn(async move { registry.start(&id).await })
    }

    fn last_profile_value(backend: &MemoryBackend, id: &DatabaseId) -> i32 {
        backend
            .commands(id)
            .last()
            .map(|command| command.get_i32("profile").unwrap())
            .unwrap()
    }

    #[tokio::test]
    async fn test_registry_starts_empty() {
        let (_, registry, id) = setup();
        assert_eq!(registry.session_count(), 0);
        assert!(!registry.is_active(&id));
        assert!(registry.active_sessions().is_empty());
    }

    #[tokio::test]
    async fn test_start_then_stop() {
        let (backend, registry, id) = setup();

        let outcome = registry.start(&id).await.unwrap();
        assert!(matches!(outcome, StartOutcome::Started(_)));
        assert!(registry.is_active(&id));
        assert_eq!(registry.active_sessions(), vec![id.clone()]);

        assert!(registry.stop(&id).await.unwrap());
        assert!(!registry.is_active(&id));

        let commands = backend.commands(&id);
        assert_eq!(commands.len(), 2);
        assert_eq!(commands[0].get_i32("profile").unwrap(), 2);
        assert_eq!(commands[1].get_i32("profile").unwrap(), 0);
    }

    #[tokio::test]
    async fn test_double_start_keeps_existing_session() {
        let (backend, registry, id) = setup();

        let first = registry.start(&id).await.unwrap();
        let second = registry.start(&id).await.unwrap();
        assert_eq!(second, StartOutcome::AlreadyActive(first.session_id()));
        assert_eq!(backend.commands(&id).len(), 1);
    }

    #[tokio::test]
    async fn test_stop_unknown_returns_false() {
        let (backend, registry, id) = setup();
        assert!(!registry.stop(&id).await.unwrap());
        assert!(backend.commands(&id).is_empty());
    }

    #[tokio::test]
    async fn test_start_failure_leaves_no_session() {
        let (backend, registry, id) = setup();
        backend.set_command_failure(&id, Some("not authorized".to_string()));

        let err = registry.start(&id).await.unwrap_err();
        assert!(matches!(err, ProfilerError::Configuration { .. }));
        assert!(!registry.is_active(&id));

        backend.set_command_failure(&id, None);
        assert!(matches!(
            registry.start(&id).await.unwrap(),
            StartOutcome::Started(_)
        ));
    }

    #[tokio::test]
    async fn test_stop_failure_still_removes_session() {
        let (backend, registry, id) = setup();
        registry.start(&id).await.unwrap();
        backend.set_command_failure(&id, Some("connection reset".to_string()));

        assert!(registry.stop(&id).await.is_err());
        assert!(!registry.is_active(&id));
        assert!(!registry.stop(&id).await.unwrap());
    }

    #[tokio::test]
    async fn test_unknown_database_cannot_start() {
        let (_, registry, _) = setup();
        let missing = DatabaseId::new("missing").unwrap();
        let err = registry.start(&missing).await.unwrap_err();
        assert!(matches!(err, ProfilerError::UnknownDatabase(_)));
        assert!(!registry.is_active(&missing));
    }

    #[tokio::test]
    async fn test_stop_during_start_interrupts_it() {
        let (backend, registry, id) = setup();
        backend.set_command_delay(&id, Some(Duration::from_millis(100)));
        let registry = Arc::new(registry);

        let starter = spawn_start(&registry, &id);
        wait_for(|| registry.is_active(&id)).await;
        assert!(registry.stop(&id).await.unwrap());

        let result = starter.await.unwrap();
        assert!(matches!(result, Err(ProfilerError::StartInterrupted(_))));
        assert!(!registry.is_active(&id));

        // enable from the interrupted start, then disable from stop
        let commands = backend.commands(&id);
        assert_eq!(commands.len(), 2);
        assert_eq!(commands.last().unwrap().get_i32("profile").unwrap(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_start_waits_for_in_flight_success() {
        let (backend, registry, id) = setup();
        backend.set_command_delay(&id, Some(Duration::from_millis(100)));
        let registry = Arc::new(registry);

        let first = spawn_start(&registry, &id);
        wait_for(|| registry.is_active(&id)).await;

        let second = registry.start(&id).await.unwrap();
        let first = first.await.unwrap().unwrap();
        assert!(matches!(first, StartOutcome::Started(_)));
        assert_eq!(second, StartOutcome::AlreadyActive(first.session_id()));
        assert_eq!(backend.commands(&id).len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_start_reports_its_own_failure() {
        let (backend, registry, id) = setup();
        backend.set_command_delay(&id, Some(Duration::from_millis(50)));
        backend.set_command_failure(&id, Some("not authorized".to_string()));
        let registry = Arc::new(registry);

        let first = spawn_start(&registry, &id);
        wait_for(|| registry.is_active(&id)).await;

        let second = registry.start(&id).await;
        assert!(matches!(second, Err(ProfilerError::Configuration { .. })));
        assert!(matches!(
            first.await.unwrap(),
            Err(ProfilerError::Configuration { .. })
        ));
        assert!(!registry.is_active(&id));
    }

    #[tokio::test]
    async fn test_concurrent_start_is_interrupted_with_the_first() {
        let (backend, registry, id) = setup();
        backend.set_command_delay(&id, Some(Duration::from_millis(100)));
        let registry = Arc::new(registry);

        let first = spawn_start(&registry, &id);
        wait_for(|| registry.is_active(&id)).await;
        let second = spawn_start(&registry, &id);
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(registry.stop(&id).await.unwrap());
        assert!(matches!(
            first.await.unwrap(),
            Err(ProfilerError::StartInterrupted(_))
        ));
        assert!(matches!(
            second.await.unwrap(),
            Err(ProfilerError::StartInterrupted(_))
        ));
        assert!(!registry.is_active(&id));
        assert_eq!(last_profile_value(&backend, &id), 0);
    }

    #[tokio::test]
    async fn test_restart_after_interrupted_start_stays_enabled() {
        let (backend, registry, id) = setup();
        backend.set_command_delay(&id, Some(Duration::from_millis(100)));
        let registry = Arc::new(registry);

        let first = spawn_start(&registry, &id);
        wait_for(|| registry.is_active(&id)).await;

        let stopper = {
            let registry = registry.clone();
            let id = id.clone();
            tokio::spawn(async move { registry.stop(&id).await })
        };
        wait_for(|| !registry.is_active(&id)).await;

        let second = registry.start(&id).await.unwrap();
        assert!(matches!(
            first.await.unwrap(),
            Err(ProfilerError::StartInterrupted(_))
        ));
        assert!(stopper.await.unwrap().unwrap());

        assert!(matches!(second, StartOutcome::Started(_)));
        assert!(registry.is_active(&id));
        assert_eq!(last_profile_value(&backend, &id), 2);
    }

    #[tokio::test]
    async fn test_failed_worker_leaves_successor_enabled() {
        let (backend, registry, id) = setup();
        registry.start(&id).await.unwrap();
        wait_for(|| backend.open_tails(&id) == 1).await;

        backend.set_command_delay(&id, Some(Duration::from_millis(50)));
        backend.fail_tails(&id, "cursor killed");
        wait_for(|| !registry.is_active(&id)).await;

        let second = registry.start(&id).await.unwrap();
        assert!(matches!(second, StartOutcome::Started(_)));

        // let the failed worker finish its cleanup
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(registry.is_active(&id));
        assert_eq!(last_profile_value(&backend, &id), 2);
    }

    #[tokio::test]
    async fn test_shutdown_stops_everything() {
        let (backend, registry, id) = setup();
        let other = DatabaseId::new("users-local").unwrap();
        backend.add_database(&other, "users");

        registry.start(&id).await.unwrap();
        registry.start(&other).await.unwrap();
        assert_eq!(registry.session_count(), 2);

        registry.shutdown().await;
        assert_eq!(registry.session_count(), 0);
        assert_eq!(backend.open_tails(&id), 0);
        assert_eq!(backend.open_tails(&other), 0);
    }
}
