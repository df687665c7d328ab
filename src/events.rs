use crate::status::ServiceState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusChangeEvent {
    pub service_id: String,
    pub previous: ServiceState,
    pub current: ServiceState,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ObserverError {
    #[error("{0}")]
    Failed(String),
    /// The receiving side is gone; the subscription is dropped.
    #[error("observer disconnected")]
    Disconnected,
}

pub trait StatusObserver: Send + Sync {
    fn on_status_change(&self, event: &StatusChangeEvent) -> Result<(), ObserverError>;
}

impl<F> StatusObserver for F
where
    F: Fn(&StatusChangeEvent) -> Result<(), ObserverError> + Send + Sync,
{
    fn on_status_change(&self, event: &StatusChangeEvent) -> Result<(), ObserverError> {
        self(event)
    }
}

/// Forwards events into an unbounded channel for async consumers.
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<StatusChangeEvent>,
}

impl ChannelObserver {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<StatusChangeEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl StatusObserver for ChannelObserver {
    fn on_status_change(&self, event: &StatusChangeEvent) -> Result<(), ObserverError> {
        self.tx
            .send(event.clone())
            .map_err(|_| ObserverError::Disconnected)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Default)]
struct Subscribers {
    next_id: u64,
    entries: Vec<(SubscriptionId, Arc<dyn StatusObserver>)>,
}

/// Synchronous fan-out to registered observers, in subscription order.
#[derive(Default)]
pub struct Observers {
    subscribers: Mutex<Subscribers>,
}

impl Observers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, observer: Arc<dyn StatusObserver>) -> SubscriptionId {
        let mut subs = self.lock();
        let id = SubscriptionId(subs.next_id);
        subs.next_id += 1;
        subs.entries.push((id, observer));
        id
    }

    /// Returns false if the handle was not (or no longer) subscribed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subs = self.lock();
        let before = subs.entries.len();
        subs.entries.retain(|(sid, _)| *sid != id);
        subs.entries.len() != before
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver to every current subscriber. Each delivery is isolated: an
    /// error or panic is logged and the remaining subscribers still run.
    /// Returns the number of successful deliveries.
    pub fn publish(&self, event: &StatusChangeEvent) -> usize {
        // Deliver outside the lock so observers may (un)subscribe.
        let snapshot: Vec<_> = self.lock().entries.clone();

        let mut delivered = 0;
        let mut disconnected = Vec::new();
        for (id, observer) in snapshot {
            match catch_unwind(AssertUnwindSafe(|| observer.on_status_change(event))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(ObserverError::Disconnected)) => disconnected.push(id),
                Ok(Err(e)) => {
                    tracing::warn!(service = %event.service_id, error = %e, "observer failed");
                }
                Err(_) => {
                    tracing::warn!(service = %event.service_id, "observer panicked");
                }
            }
        }

        for id in disconnected {
            tracing::debug!(?id, "dropping disconnected observer");
            self.unsubscribe(id);
        }

        delivered
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Subscribers> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
