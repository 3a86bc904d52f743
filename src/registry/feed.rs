use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, Notify};

use crate::models::coordinate::OperatorId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    Upserted,
    Removed,
    Evicted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryEvent {
    pub operator_id: OperatorId,
    pub kind: ChangeKind,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FeedNotice {
    Changed(RegistryEvent),
    /// The subscriber fell behind and `missed` events were dropped.
    /// Consumers should take a fresh snapshot.
    Resync { missed: u64 },
}

/// Fan-out of registry mutations to every current subscriber.
///
/// There is no backlog: a subscriber only sees mutations published after it
/// subscribed and should snapshot the registry right after subscribing.
pub struct ChangeFeed {
    tx: broadcast::Sender<RegistryEvent>,
}

impl ChangeFeed {
    pub fn new(capacity: usize) -> Self {
        let (tx, _unused_rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: RegistryEvent) {
        // No subscribers is not an error.
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn subscribe(&self) -> (FeedEvents, Unsubscribe) {
        let state = Arc::new(SubscriptionState {
            closed: AtomicBool::new(false),
            notify: Notify::new(),
        });

        let events = FeedEvents {
            rx: Some(self.tx.subscribe()),
            state: state.clone(),
        };
        (events, Unsubscribe { state })
    }
}

struct SubscriptionState {
    closed: AtomicBool,
    notify: Notify,
}

/// The broadcast receiver is released, and stops counting towards
/// `subscriber_count`, as soon as `recv` observes the close or the value is
/// dropped.
pub struct FeedEvents {
    rx: Option<broadcast::Receiver<RegistryEvent>>,
    state: Arc<SubscriptionState>,
}

impl FeedEvents {
    /// Waits for the next notice. Returns `None` once unsubscribed or when
    /// the feed itself is gone.
    pub async fn recv(&mut self) -> Option<FeedNotice> {
        let notice = self.next_notice().await;
        if notice.is_none() {
            self.rx = None;
        }
        notice
    }

    async fn next_notice(&mut self) -> Option<FeedNotice> {
        let notified = self.state.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if self.state.closed.load(Ordering::Acquire) {
            return None;
        }
        let rx = self.rx.as_mut()?;

        tokio::select! {
            biased;
            _ = &mut notified => None,
            result = rx.recv() => {
                if self.state.closed.load(Ordering::Acquire) {
                    return None;
                }
                match result {
                    Ok(event) => Some(FeedNotice::Changed(event)),
                    Err(RecvError::Lagged(missed)) => Some(FeedNotice::Resync { missed }),
                    Err(RecvError::Closed) => None,
                }
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::Acquire)
    }
}

#[derive(Clone)]
pub struct Unsubscribe {
    state: Arc<SubscriptionState>,
}

impl Unsubscribe {
    /// Idempotent. Any `recv` in flight returns `None`.
    pub fn unsubscribe(&self) {
        if !self.state.closed.swap(true, Ordering::AcqRel) {
            self.state.notify.notify_waiters();
        }
    }
}
