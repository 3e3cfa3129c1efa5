//! Realtime queue events
//!
//! A registry of subscribers with an explicit lifecycle: a [`Subscription`]
//! is registered on connect and unregisters itself when dropped. Publishing
//! prunes subscribers whose receiver is gone, and [`EventRegistry::sweep`]
//! removes those that stopped draining their channel.

use crate::checks::CheckRun;
use crate::types::{EntryId, MergeableState, QueueEntry, RepositoryId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

/// Buffered events per subscriber
const SUBSCRIBER_CAPACITY: usize = 64;

/// Something that happened to a queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueueEvent {
    /// An entry was admitted or changed status
    EntryUpdated {
        /// The entry after the change
        entry: QueueEntry,
    },
    /// The active queue was reordered
    QueueReordered {
        /// Repository
        repository: RepositoryId,
        /// Entry IDs in their new order
        order: Vec<EntryId>,
    },
    /// A check run was recorded
    CheckRunUpdated {
        /// Repository
        repository: RepositoryId,
        /// The stored run
        run: CheckRun,
        /// Mergeable state after the update
        mergeable: MergeableState,
    },
    /// Detection found conflicts that need a human
    ConflictsDetected {
        /// Repository
        repository: RepositoryId,
        /// Entry parked for resolution
        entry: EntryId,
        /// Conflicted paths
        paths: Vec<String>,
    },
}

impl QueueEvent {
    /// Event name, matching the serialized `type` tag
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::EntryUpdated { .. } => "entry_updated",
            Self::QueueReordered { .. } => "queue_reordered",
            Self::CheckRunUpdated { .. } => "check_run_updated",
            Self::ConflictsDetected { .. } => "conflicts_detected",
        }
    }

    /// Repository the event concerns
    pub const fn repository(&self) -> &RepositoryId {
        match self {
            Self::EntryUpdated { entry } => &entry.repository,
            Self::QueueReordered { repository, .. }
            | Self::CheckRunUpdated { repository, .. }
            | Self::ConflictsDetected { repository, .. } => repository,
        }
    }
}

#[derive(Debug)]
struct Subscriber {
    repository: Option<RepositoryId>,
    sender: mpsc::Sender<QueueEvent>,
    stalled_since: Option<Instant>,
}

/// Process-wide registry of event subscribers
#[derive(Debug, Default)]
pub struct EventRegistry {
    subscribers: Mutex<HashMap<u64, Subscriber>>,
    next_id: AtomicU64,
}

impl EventRegistry {
    /// Create an empty registry
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn subscribers(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Subscriber>> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Subscribe to events, optionally only for one repository
    pub fn register(self: &Arc<Self>, repository: Option<RepositoryId>) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::channel(SUBSCRIBER_CAPACITY);
        self.subscribers().insert(
            id,
            Subscriber {
                repository,
                sender,
                stalled_since: None,
            },
        );
        debug!(subscriber = id, "event subscriber registered");
        Subscription {
            id,
            receiver,
            registry: Arc::downgrade(self),
        }
    }

    fn unregister(&self, id: u64) {
        if self.subscribers().remove(&id).is_some() {
            debug!(subscriber = id, "event subscriber unregistered");
        }
    }

    /// Number of registered subscribers
    pub fn len(&self) -> usize {
        self.subscribers().len()
    }

    /// Whether nobody is subscribed
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver an event to every matching subscriber without blocking.
    ///
    /// A subscriber with a full channel misses the event; one whose receiver
    /// is gone is removed.
    pub fn publish(&self, event: &QueueEvent) {
        let mut subscribers = self.subscribers();
        subscribers.retain(|id, subscriber| {
            if subscriber
                .repository
                .as_ref()
                .is_some_and(|r| r != event.repository())
            {
                return true;
            }
            match subscriber.sender.try_send(event.clone()) {
                Ok(()) => {
                    subscriber.stalled_since = None;
                    true
                }
                Err(TrySendError::Full(_)) => {
                    subscriber.stalled_since.get_or_insert_with(Instant::now);
                    warn!(subscriber = id, "event subscriber lagging, dropping event");
                    true
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(subscriber = id, "event subscriber gone");
                    false
                }
            }
        });
    }

    /// Remove subscribers that disconnected or have been stalled longer than
    /// `stall_limit`; returns how many were removed
    pub fn sweep(&self, stall_limit: Duration) -> usize {
        let mut subscribers = self.subscribers();
        let before = subscribers.len();
        subscribers.retain(|_, s| {
            !s.sender.is_closed() && s.stalled_since.is_none_or(|since| since.elapsed() < stall_limit)
        });
        let removed = before - subscribers.len();
        if removed > 0 {
            debug!(removed, "swept event subscribers");
        }
        removed
    }
}

/// A registered subscriber; unregisters on drop
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    receiver: mpsc::Receiver<QueueEvent>,
    registry: Weak<EventRegistry>,
}

impl Subscription {
    /// Subscriber ID
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Next event; `None` once the registry dropped this subscriber
    pub async fn recv(&mut self) -> Option<QueueEvent> {
        self.receiver.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.unregister(self.id);
        }
    }
}
