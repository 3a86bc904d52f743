pub mod feed;

use std::sync::Arc;

use chrono::Duration;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;

use crate::clock::Clock;
use crate::models::coordinate::{Coordinate, OperatorId};
use crate::models::live_location::LiveLocationEntry;

pub use feed::{ChangeFeed, ChangeKind, FeedEvents, FeedNotice, RegistryEvent, Unsubscribe};

/// Last known position of every operator currently on duty.
///
/// Notifications are published while the entry's shard lock is held, so an
/// observer that snapshots after a notification always sees that mutation,
/// and notifications for one operator leave in mutation order.
pub struct LiveLocationRegistry {
    entries: DashMap<OperatorId, LiveLocationEntry>,
    feed: ChangeFeed,
    clock: Arc<dyn Clock>,
}

impl LiveLocationRegistry {
    pub fn new(feed: ChangeFeed, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            feed,
            clock,
        }
    }

    pub fn upsert(&self, operator_id: &OperatorId, coordinate: Coordinate) -> LiveLocationEntry {
        let now = self.clock.now();
        let entry = LiveLocationEntry {
            operator_id: operator_id.clone(),
            coordinate,
            last_updated: now,
        };

        let guard = self.entries.entry(operator_id.clone()).insert(entry.clone());
        self.feed.publish(RegistryEvent {
            operator_id: operator_id.clone(),
            kind: ChangeKind::Upserted,
            at: now,
        });
        drop(guard);

        entry
    }

    /// Returns whether an entry was present.
    pub fn remove(&self, operator_id: &OperatorId) -> bool {
        self.remove_with(operator_id, ChangeKind::Removed, |_| true)
    }

    pub fn get(&self, operator_id: &OperatorId) -> Option<LiveLocationEntry> {
        self.entries
            .get(operator_id)
            .map(|entry| entry.value().clone())
    }

    /// Copy of every entry, ordered by operator id.
    pub fn snapshot(&self) -> Vec<LiveLocationEntry> {
        let mut entries: Vec<LiveLocationEntry> = self
            .entries
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        entries.sort_by(|a, b| a.operator_id.cmp(&b.operator_id));
        entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn subscribe(&self) -> (FeedEvents, Unsubscribe) {
        self.feed.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.feed.subscriber_count()
    }

    /// Drops entries not refreshed within `max_age`.
    pub fn evict_stale(&self, max_age: Duration) -> Vec<OperatorId> {
        let cutoff = self.clock.now() - max_age;
        let candidates: Vec<OperatorId> = self
            .entries
            .iter()
            .filter(|entry| entry.value().last_updated < cutoff)
            .map(|entry| entry.key().clone())
            .collect();

        candidates
            .into_iter()
            .filter(|operator_id| {
                // Re-checked under the entry lock: a fresh sample may have
                // landed since the scan.
                self.remove_with(operator_id, ChangeKind::Evicted, |entry| {
                    entry.last_updated < cutoff
                })
            })
            .collect()
    }

    fn remove_with(
        &self,
        operator_id: &OperatorId,
        kind: ChangeKind,
        should_remove: impl Fn(&LiveLocationEntry) -> bool,
    ) -> bool {
        match self.entries.entry(operator_id.clone()) {
            Entry::Occupied(occupied) if should_remove(occupied.get()) => {
                self.feed.publish(RegistryEvent {
                    operator_id: operator_id.clone(),
                    kind,
                    at: self.clock.now(),
                });
                occupied.remove();
                debug!(operator_id = %operator_id, ?kind, "live location removed");
                true
            }
            _ => false,
        }
    }
}
