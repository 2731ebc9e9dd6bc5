//! Persistence store - external collaborator holding normalized rows
//!
//! The pipeline only needs four operations from a store: bulk insertion and
//! the approximate-count / timestamp-range queries the reporting surface
//! reads. Anything richer (schema, indexes, migration) belongs to the store
//! implementation, not here.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use virta_core::{EventRecord, Result};

/// Storage backend for normalized event rows
///
/// Implementations must be thread-safe. Inserts are append-only; the
/// pipeline never updates or deletes rows.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Append a whole batch in one bulk operation
    async fn insert_batch(&self, records: Vec<EventRecord>) -> Result<()>;

    /// Roughly how many rows the store holds
    async fn approximate_count(&self) -> Result<u64>;

    /// Creation time of the oldest stored event, if any
    async fn earliest_created_at(&self) -> Result<Option<DateTime<Utc>>>;

    /// Creation time of the newest stored event, if any
    async fn latest_created_at(&self) -> Result<Option<DateTime<Utc>>>;
}

/// In-memory store for tests and single-process deployments
pub struct MemoryEventStore {
    rows: RwLock<Vec<EventRecord>>,
}

impl MemoryEventStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self {
            rows: RwLock::new(Vec::new()),
        }
    }

    /// Snapshot of all stored rows, in insertion order
    pub fn rows(&self) -> Vec<EventRecord> {
        self.rows.read().clone()
    }
}

impl Default for MemoryEventStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn insert_batch(&self, records: Vec<EventRecord>) -> Result<()> {
        self.rows.write().extend(records);
        Ok(())
    }

    async fn approximate_count(&self) -> Result<u64> {
        Ok(self.rows.read().len() as u64)
    }

    async fn earliest_created_at(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(self.rows.read().iter().map(|r| r.created_at).min())
    }

    async fn latest_created_at(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(self.rows.read().iter().map(|r| r.created_at).max())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;
    use virta_core::Event;

    fn make_record(id: i64, created_at: &str) -> EventRecord {
        let event = Event::from_value(json!({
            "id": id,
            "text": "x",
            "created_at": created_at,
            "user": {"id": 1, "screen_name": "a", "name": "A"}
        }));
        EventRecord::from_event(&event).unwrap()
    }

    #[tokio::test]
    async fn empty_store_has_no_range() {
        let store = MemoryEventStore::new();
        assert_eq!(store.approximate_count().await.unwrap(), 0);
        assert_eq!(store.earliest_created_at().await.unwrap(), None);
        assert_eq!(store.latest_created_at().await.unwrap(), None);
    }

    #[tokio::test]
    async fn bulk_insert_and_range_queries() {
        let store = MemoryEventStore::new();
        store
            .insert_batch(vec![
                make_record(1, "Sat Sep 22 10:00:00 +0000 2012"),
                make_record(2, "Sat Sep 22 12:00:00 +0000 2012"),
                make_record(3, "Sat Sep 22 11:00:00 +0000 2012"),
            ])
            .await
            .unwrap();

        assert_eq!(store.approximate_count().await.unwrap(), 3);
        let earliest = store.earliest_created_at().await.unwrap().unwrap();
        let latest = store.latest_created_at().await.unwrap().unwrap();
        assert!(earliest < latest);
        assert_eq!(earliest, make_record(0, "Sat Sep 22 10:00:00 +0000 2012").created_at);
    }

    #[tokio::test]
    async fn duplicate_ids_are_kept() {
        // append-only: the store does not enforce event-id uniqueness
        let store = MemoryEventStore::new();
        let record = make_record(5, "Sat Sep 22 10:00:00 +0000 2012");
        store
            .insert_batch(vec![record.clone(), record])
            .await
            .unwrap();
        assert_eq!(store.approximate_count().await.unwrap(), 2);
    }
}
