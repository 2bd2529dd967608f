//! Writes one delivery record per recipient in bounded, independent batches.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use herald_common::types::ChannelType;

use crate::store::DeliveryStore;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MaterializeReport {
    pub created: u64,
    pub skipped_existing: u64,
    /// Batches that committed.
    pub batches: u32,
    /// One entry per batch that failed; its rows were not written.
    pub errors: Vec<String>,
}

impl MaterializeReport {
    pub fn is_complete(&self) -> bool {
        self.errors.is_empty()
    }
}

pub struct Materializer {
    store: Arc<dyn DeliveryStore>,
    batch_size: usize,
}

impl Materializer {
    pub fn new(store: Arc<dyn DeliveryStore>, batch_size: usize) -> Self {
        Self {
            store,
            batch_size: batch_size.max(1),
        }
    }

    /// Insert-or-ignore records for `recipients` on `channel`. Safe to call
    /// again for the same broadcast: existing records are counted as skipped.
    pub async fn materialize(
        &self,
        broadcast_id: Uuid,
        recipients: &[Uuid],
        channel: ChannelType,
        max_attempts: i32,
        now: DateTime<Utc>,
    ) -> MaterializeReport {
        let mut report = MaterializeReport::default();

        for (index, chunk) in recipients.chunks(self.batch_size).enumerate() {
            match self
                .store
                .insert_records(broadcast_id, channel, chunk, max_attempts, now)
                .await
            {
                Ok(created) => {
                    report.batches += 1;
                    report.created += created;
                    report.skipped_existing += chunk.len() as u64 - created;
                }
                Err(e) => {
                    tracing::error!(
                        broadcast_id = %broadcast_id,
                        channel = %channel,
                        batch = index,
                        error = %e,
                        "Materialization batch failed"
                    );
                    report.errors.push(format!("batch {}: {}", index, e));
                }
            }
        }

        tracing::info!(
            broadcast_id = %broadcast_id,
            channel = %channel,
            created = report.created,
            skipped = report.skipped_existing,
            batches = report.batches,
            "Materialized delivery records"
        );

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn test_replay_skips_existing() {
        let store = Arc::new(MemoryStore::default());
        let materializer = Materializer::new(store.clone(), 2);
        let broadcast_id = Uuid::new_v4();
        let users: Vec<Uuid> = (0..5).map(|_| Uuid::new_v4()).collect();
        let now = Utc::now();

        let first = materializer
            .materialize(broadcast_id, &users[..3], ChannelType::Email, 3, now)
            .await;
        assert_eq!((first.created, first.skipped_existing, first.batches), (3, 0, 2));

        let second = materializer
            .materialize(broadcast_id, &users, ChannelType::Email, 3, now)
            .await;
        assert_eq!((second.created, second.skipped_existing, second.batches), (2, 3, 3));
        assert!(second.is_complete());
        assert_eq!(store.records_of(broadcast_id).await.len(), 5);
    }

    #[tokio::test]
    async fn test_channels_are_separate_records() {
        let store = Arc::new(MemoryStore::default());
        let materializer = Materializer::new(store.clone(), 100);
        let broadcast_id = Uuid::new_v4();
        let user = [Uuid::new_v4()];
        let now = Utc::now();

        materializer
            .materialize(broadcast_id, &user, ChannelType::Email, 3, now)
            .await;
        let sms = materializer
            .materialize(broadcast_id, &user, ChannelType::Sms, 3, now)
            .await;

        assert_eq!(sms.created, 1);
        assert_eq!(store.records_of(broadcast_id).await.len(), 2);
    }
}
