//! Real-time event fanout
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  EventFanout                                                    │
//! │  ├── listeners: HashMap<ListenerId, Listener>                   │
//! │  │   └── bounded mpsc queue per listener (listener_capacity)    │
//! │  │                                                              │
//! │  └── publish(event)                                             │
//! │      ├── sends to every listener concurrently                   │
//! │      ├── each send waits at most delivery_timeout               │
//! │      └── evicts closed listeners and listeners that missed      │
//! │          max_missed_deliveries in a row                         │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A stuck listener costs each publish at most one delivery timeout and
//! never delays delivery to the others. Late subscribers only see events
//! published after they subscribed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tracing::{debug, warn};

use crate::types::ProfiledQueryEvent;

/// Default queue length per listener.
const DEFAULT_LISTENER_CAPACITY: usize = 256;

/// Default time a publish waits on one full listener queue.
const DEFAULT_DELIVERY_TIMEOUT: Duration = Duration::from_millis(250);

/// Default number of consecutive missed deliveries before eviction.
const DEFAULT_MAX_MISSED_DELIVERIES: u32 = 3;

/// Identifier of a subscribed listener
pub type ListenerId = u64;

/// Configuration for the event fanout.
#[derive(Debug, Clone)]
pub struct FanoutConfig {
    /// Events buffered per listener before sends start waiting.
    pub listener_capacity: usize,
    /// Longest a publish waits for room in one listener's queue.
    pub delivery_timeout: Duration,
    /// Consecutive timed-out deliveries after which a listener is dropped.
    pub max_missed_deliveries: u32,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            listener_capacity: DEFAULT_LISTENER_CAPACITY,
            delivery_timeout: DEFAULT_DELIVERY_TIMEOUT,
            max_missed_deliveries: DEFAULT_MAX_MISSED_DELIVERIES,
        }
    }
}

/// Outcome of one publish
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    /// Listeners that received the event
    pub delivered: usize,
    /// Listeners that missed the event but stay subscribed
    pub missed: usize,
    /// Listeners removed during this publish
    pub evicted: usize,
}

struct Listener {
    tx: mpsc::Sender<ProfiledQueryEvent>,
    missed: u32,
}

/// Receiving end of a fanout subscription
///
/// Dropping it unsubscribes; the listener is removed on the next publish.
pub struct Subscription {
    id: ListenerId,
    rx: mpsc::Receiver<ProfiledQueryEvent>,
}

impl Subscription {
    /// Listener id, usable with [`EventFanout::unsubscribe`]
    pub fn id(&self) -> ListenerId {
        self.id
    }

    /// Wait for the next event; `None` once the listener was evicted
    pub async fn recv(&mut self) -> Option<ProfiledQueryEvent> {
        self.rx.recv().await
    }

    /// Take an already delivered event without waiting
    pub fn try_recv(&mut self) -> Option<ProfiledQueryEvent> {
        self.rx.try_recv().ok()
    }
}

/// Broadcasts canonical events to dynamically joining listeners
pub struct EventFanout {
    listeners: Mutex<HashMap<ListenerId, Listener>>,
    next_id: AtomicU64,
    config: FanoutConfig,
}

impl EventFanout {
    /// Create a fanout with the given configuration.
    pub fn new(config: FanoutConfig) -> Self {
        Self {
            listeners: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            config,
        }
    }

    /// Create a fanout with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(FanoutConfig::default())
    }

    /// Subscribe a new listener
    pub fn subscribe(&self) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.config.listener_capacity.max(1));
        self.listeners.lock().insert(id, Listener { tx, missed: 0 });
        debug!(listener = id, "Listener subscribed");
        Subscription { id, rx }
    }

    /// Remove a listener; returns whether it was subscribed
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.listeners.lock().remove(&id).is_some()
    }

    /// Number of subscribed listeners
    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }

    /// Deliver `event` to every subscribed listener.
    pub async fn publish(&self, event: ProfiledQueryEvent) -> PublishReport {
        let targets: Vec<(ListenerId, mpsc::Sender<ProfiledQueryEvent>)> = self
            .listeners
            .lock()
            .iter()
            .map(|(id, listener)| (*id, listener.tx.clone()))
            .collect();

        let mut report = PublishReport::default();
        if targets.is_empty() {
            return report;
        }

        let timeout = self.config.delivery_timeout;
        let results = join_all(targets.into_iter().map(|(id, tx)| {
            let event = event.clone();
            async move { (id, tx.send_timeout(event, timeout).await) }
        }))
        .await;

        let mut listeners = self.listeners.lock();
        for (id, result) in results {
            match result {
                Ok(()) => {
                    if let Some(listener) = listeners.get_mut(&id) {
                        listener.missed = 0;
                    }
                    report.delivered += 1;
                }
                Err(SendTimeoutError::Timeout(_)) => {
                    let Some(listener) = listeners.get_mut(&id) else {
                        continue;
                    };
                    listener.missed += 1;
                    if listener.missed >= self.config.max_missed_deliveries {
                        listeners.remove(&id);
                        warn!(listener = id, "Evicting listener after repeated delivery timeouts");
                        report.evicted += 1;
                    } else {
                        report.missed += 1;
                    }
                }
                Err(SendTimeoutError::Closed(_)) => {
                    if listeners.remove(&id).is_some() {
                        debug!(listener = id, "Removing closed listener");
                        report.evicted += 1;
                    }
                }
            }
        }
        report
    }
}

impl Default for EventFanout {
    fn default() -> Self {
        Self::with_defaults()
    }
}
