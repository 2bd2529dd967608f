//! In-process [`DeliveryStore`] with the same transition rules as Postgres.
//!
//! One mutex guards everything, so each method is trivially atomic.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use herald_common::error::AppError;
use herald_common::types::{
    Broadcast, BroadcastStatus, ChannelType, DeliveryRecord, DeliveryStatus, ErrorLogEntry,
};

use super::{
    CompletionPolicy, DeliveryStore, ErrorCount, Expect, ProgressSnapshot, RecordPage,
    StatusCounts, Transition, WindowUsage,
};

#[derive(Default)]
struct Inner {
    broadcasts: HashMap<Uuid, Broadcast>,
    records: HashMap<Uuid, DeliveryRecord>,
    keys: HashSet<(Uuid, Uuid, ChannelType)>,
    jobs: HashMap<String, DateTime<Utc>>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    policy: CompletionPolicy,
}

impl MemoryStore {
    pub fn new(policy: CompletionPolicy) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            policy,
        }
    }

    /// All records of a broadcast, oldest first.
    pub async fn records_of(&self, broadcast_id: Uuid) -> Vec<DeliveryRecord> {
        let inner = self.inner.lock().await;
        let mut records: Vec<_> = inner
            .records
            .values()
            .filter(|r| r.broadcast_id == broadcast_id)
            .cloned()
            .collect();
        records.sort_by_key(|r| (r.created_at, r.recipient_id, r.channel.to_string()));
        records
    }

    fn holds(record: &DeliveryRecord, expect: Expect) -> bool {
        match expect {
            Expect::Lease(lease) => {
                record.status == DeliveryStatus::Processing && record.lease_id == Some(lease)
            }
            Expect::Pending => record.status == DeliveryStatus::Pending,
        }
    }

    fn miss(record: Option<&DeliveryRecord>) -> Transition {
        match record.map(|r| r.status) {
            Some(DeliveryStatus::Cancelled) => Transition::Cancelled,
            _ => Transition::StaleLease,
        }
    }

    fn complete_if_finished(broadcast: &mut Broadcast, now: DateTime<Utc>, policy: CompletionPolicy) {
        if broadcast.status == BroadcastStatus::Sending
            && broadcast.materialized_at.is_some()
            && broadcast.sent_count + broadcast.failed_count >= broadcast.recipient_count
        {
            broadcast.status = policy.final_status(broadcast.failed_count, broadcast.recipient_count);
            broadcast.completed_at = Some(now);
            broadcast.updated_at = now;
            tracing::info!(
                broadcast_id = %broadcast.id,
                status = %broadcast.status,
                sent = broadcast.sent_count,
                failed = broadcast.failed_count,
                "Broadcast finished"
            );
        }
    }
}

#[async_trait]
impl DeliveryStore for MemoryStore {
    async fn insert_broadcast(&self, broadcast: &Broadcast) -> Result<(), AppError> {
        let mut inner = self.inner.lock().await;
        if inner.broadcasts.contains_key(&broadcast.id) {
            return Err(AppError::Conflict(format!(
                "broadcast {} already exists",
                broadcast.id
            )));
        }
        inner.broadcasts.insert(broadcast.id, broadcast.clone());
        Ok(())
    }

    async fn get_broadcast(&self, id: Uuid) -> Result<Option<Broadcast>, AppError> {
        Ok(self.inner.lock().await.broadcasts.get(&id).cloned())
    }

    async fn claim_due_broadcasts(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Broadcast>, AppError> {
        let mut inner = self.inner.lock().await;

        let mut due: Vec<_> = inner
            .broadcasts
            .values()
            .filter(|b| b.status == BroadcastStatus::Draft)
            .filter(|b| b.scheduled_at.is_none_or(|at| at <= now))
            .map(|b| (b.scheduled_at.unwrap_or(b.created_at), b.id))
            .collect();
        due.sort();

        let mut claimed = Vec::new();
        for (_, id) in due.into_iter().take(limit.max(0) as usize) {
            if let Some(b) = inner.broadcasts.get_mut(&id) {
                b.status = BroadcastStatus::Sending;
                b.sent_at = Some(now);
                b.updated_at = now;
                claimed.push(b.clone());
            }
        }
        Ok(claimed)
    }

    async fn reclaim_unmaterialized(
        &self,
        claimed_before: DateTime<Utc>,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Broadcast>, AppError> {
        let mut inner = self.inner.lock().await;

        let mut stuck: Vec<_> = inner
            .broadcasts
            .values()
            .filter(|b| b.status == BroadcastStatus::Sending && b.materialized_at.is_none())
            .filter(|b| b.sent_at.is_some_and(|at| at < claimed_before))
            .map(|b| (b.sent_at, b.id))
            .collect();
        stuck.sort();

        let mut reclaimed = Vec::new();
        for (_, id) in stuck.into_iter().take(limit.max(0) as usize) {
            if let Some(b) = inner.broadcasts.get_mut(&id) {
                b.sent_at = Some(now);
                b.updated_at = now;
                reclaimed.push(b.clone());
            }
        }
        Ok(reclaimed)
    }

    async fn finish_materialization(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<Broadcast>, AppError> {
        let mut inner = self.inner.lock().await;
        let total = inner.records.values().filter(|r| r.broadcast_id == id).count() as i64;

        let Some(b) = inner.broadcasts.get_mut(&id) else {
            return Ok(None);
        };
        if b.status != BroadcastStatus::Sending {
            return Ok(None);
        }

        b.recipient_count = total;
        b.materialized_at = Some(now);
        b.updated_at = now;
        Self::complete_if_finished(b, now, self.policy);
        Ok(Some(b.clone()))
    }

    async fn fail_broadcast(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        entry: &ErrorLogEntry,
    ) -> Result<bool, AppError> {
        let mut inner = self.inner.lock().await;
        match inner.broadcasts.get_mut(&id) {
            Some(b) if b.status == BroadcastStatus::Sending => {
                b.status = BroadcastStatus::Failed;
                b.completed_at = Some(now);
                b.updated_at = now;
                b.error_log.push(entry.clone());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn append_error_log(
        &self,
        id: Uuid,
        entries: &[ErrorLogEntry],
    ) -> Result<(), AppError> {
        let mut inner = self.inner.lock().await;
        if let Some(b) = inner.broadcasts.get_mut(&id) {
            b.error_log.extend_from_slice(entries);
        }
        Ok(())
    }

    async fn cancel_broadcast(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<u64>, AppError> {
        let mut inner = self.inner.lock().await;
        match inner.broadcasts.get_mut(&id) {
            Some(b) if !b.status.is_terminal() => {
                b.status = BroadcastStatus::Cancelled;
                b.completed_at = Some(now);
                b.updated_at = now;
            }
            _ => return Ok(None),
        }

        let mut cancelled = 0;
        for record in inner.records.values_mut() {
            if record.broadcast_id == id && !record.status.is_terminal() {
                record.status = DeliveryStatus::Cancelled;
                record.processed_at = Some(now);
                record.lease_id = None;
                cancelled += 1;
            }
        }
        Ok(Some(cancelled))
    }

    async fn reset_failed(&self, id: Uuid, now: DateTime<Utc>) -> Result<Option<u64>, AppError> {
        let mut inner = self.inner.lock().await;
        match inner.broadcasts.get(&id).map(|b| b.status) {
            Some(BroadcastStatus::Completed | BroadcastStatus::Failed) => {}
            _ => return Ok(None),
        }

        let mut rearmed = 0u64;
        for record in inner.records.values_mut() {
            if record.broadcast_id == id && record.status == DeliveryStatus::Failed {
                record.status = DeliveryStatus::Pending;
                record.attempts = 0;
                record.scheduled_at = now;
                record.error_message = None;
                record.processed_at = None;
                record.lease_id = None;
                record.locked_at = None;
                rearmed += 1;
            }
        }

        if rearmed > 0 {
            if let Some(b) = inner.broadcasts.get_mut(&id) {
                b.failed_count -= rearmed as i64;
                b.status = BroadcastStatus::Sending;
                b.completed_at = None;
                b.updated_at = now;
            }
        }
        Ok(Some(rearmed))
    }

    async fn insert_records(
        &self,
        broadcast_id: Uuid,
        channel: ChannelType,
        recipients: &[Uuid],
        max_attempts: i32,
        now: DateTime<Utc>,
    ) -> Result<u64, AppError> {
        let mut inner = self.inner.lock().await;
        let mut created = 0;

        for &recipient_id in recipients {
            if !inner.keys.insert((broadcast_id, recipient_id, channel)) {
                continue;
            }
            let record = DeliveryRecord {
                id: Uuid::new_v4(),
                broadcast_id,
                recipient_id,
                channel,
                status: DeliveryStatus::Pending,
                attempts: 0,
                max_attempts,
                scheduled_at: now,
                lease_id: None,
                locked_at: None,
                error_message: None,
                provider_message_id: None,
                processed_at: None,
                created_at: now,
            };
            inner.records.insert(record.id, record);
            created += 1;
        }
        Ok(created)
    }

    async fn claim_pending(
        &self,
        now: DateTime<Utc>,
        limit: i64,
        lease: Uuid,
    ) -> Result<Vec<DeliveryRecord>, AppError> {
        let mut inner = self.inner.lock().await;

        let open: HashSet<Uuid> = inner
            .broadcasts
            .values()
            .filter(|b| b.status == BroadcastStatus::Sending && b.materialized_at.is_some())
            .map(|b| b.id)
            .collect();

        let mut due: Vec<_> = inner
            .records
            .values()
            .filter(|r| r.status == DeliveryStatus::Pending && r.scheduled_at <= now)
            .filter(|r| open.contains(&r.broadcast_id))
            .map(|r| (r.scheduled_at, r.id))
            .collect();
        due.sort();

        let mut claimed = Vec::new();
        for (_, id) in due.into_iter().take(limit.max(0) as usize) {
            if let Some(r) = inner.records.get_mut(&id) {
                r.status = DeliveryStatus::Processing;
                r.lease_id = Some(lease);
                r.locked_at = Some(now);
                claimed.push(r.clone());
            }
        }
        Ok(claimed)
    }

    async fn window_usage(
        &self,
        recipient: Uuid,
        channel: ChannelType,
        since: DateTime<Utc>,
        lease: Uuid,
    ) -> Result<WindowUsage, AppError> {
        let inner = self.inner.lock().await;
        let mut usage = WindowUsage::default();

        for r in inner.records.values() {
            if r.recipient_id != recipient || r.channel != channel {
                continue;
            }
            let counted_at = match r.status {
                DeliveryStatus::Sent => r.processed_at,
                DeliveryStatus::Processing if r.lease_id != Some(lease) => r.locked_at,
                _ => None,
            };
            if let Some(at) = counted_at.filter(|at| *at > since) {
                usage.count += 1;
                usage.oldest = Some(usage.oldest.map_or(at, |o| o.min(at)));
            }
        }
        Ok(usage)
    }

    async fn mark_sent(
        &self,
        record_id: Uuid,
        lease: Uuid,
        now: DateTime<Utc>,
        provider_message_id: Option<String>,
    ) -> Result<Transition, AppError> {
        let mut inner = self.inner.lock().await;

        let broadcast_id = match inner.records.get_mut(&record_id) {
            Some(r) if Self::holds(r, Expect::Lease(lease)) => {
                r.status = DeliveryStatus::Sent;
                r.processed_at = Some(now);
                r.provider_message_id = provider_message_id;
                r.error_message = None;
                r.lease_id = None;
                r.broadcast_id
            }
            other => return Ok(Self::miss(other.map(|r| &*r))),
        };

        if let Some(b) = inner.broadcasts.get_mut(&broadcast_id) {
            b.sent_count += 1;
            b.updated_at = now;
            Self::complete_if_finished(b, now, self.policy);
        }
        Ok(Transition::Applied)
    }

    async fn mark_failed(
        &self,
        record_id: Uuid,
        expect: Expect,
        attempts: i32,
        now: DateTime<Utc>,
        reason: &str,
    ) -> Result<Transition, AppError> {
        let mut inner = self.inner.lock().await;

        let entry = match inner.records.get_mut(&record_id) {
            Some(r) if Self::holds(r, expect) => {
                r.status = DeliveryStatus::Failed;
                r.attempts = attempts;
                r.processed_at = Some(now);
                r.error_message = Some(reason.to_string());
                r.lease_id = None;
                (
                    r.broadcast_id,
                    ErrorLogEntry {
                        timestamp: now,
                        recipient_id: Some(r.recipient_id),
                        channel: Some(r.channel),
                        reason: reason.to_string(),
                    },
                )
            }
            other => return Ok(Self::miss(other.map(|r| &*r))),
        };

        let (broadcast_id, entry) = entry;
        if let Some(b) = inner.broadcasts.get_mut(&broadcast_id) {
            b.failed_count += 1;
            b.error_log.push(entry);
            b.updated_at = now;
            Self::complete_if_finished(b, now, self.policy);
        }
        Ok(Transition::Applied)
    }

    async fn reschedule(
        &self,
        record_id: Uuid,
        expect: Expect,
        attempts: i32,
        at: DateTime<Utc>,
        reason: Option<&str>,
    ) -> Result<Transition, AppError> {
        let mut inner = self.inner.lock().await;
        match inner.records.get_mut(&record_id) {
            Some(r) if Self::holds(r, expect) => {
                r.status = DeliveryStatus::Pending;
                r.attempts = attempts;
                r.scheduled_at = at;
                if let Some(reason) = reason {
                    r.error_message = Some(reason.to_string());
                }
                r.lease_id = None;
                r.locked_at = None;
                Ok(Transition::Applied)
            }
            other => Ok(Self::miss(other.map(|r| &*r))),
        }
    }

    async fn list_stalled(
        &self,
        locked_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<DeliveryRecord>, AppError> {
        let inner = self.inner.lock().await;
        let mut stalled: Vec<_> = inner
            .records
            .values()
            .filter(|r| r.status == DeliveryStatus::Processing)
            .filter(|r| r.locked_at.is_some_and(|at| at < locked_before))
            .cloned()
            .collect();
        stalled.sort_by_key(|r| r.locked_at);
        stalled.truncate(limit.max(0) as usize);
        Ok(stalled)
    }

    async fn list_exhausted(&self, limit: i64) -> Result<Vec<DeliveryRecord>, AppError> {
        let inner = self.inner.lock().await;
        let mut exhausted: Vec<_> = inner
            .records
            .values()
            .filter(|r| r.status == DeliveryStatus::Pending && r.attempts >= r.max_attempts)
            .cloned()
            .collect();
        exhausted.sort_by_key(|r| r.scheduled_at);
        exhausted.truncate(limit.max(0) as usize);
        Ok(exhausted)
    }

    async fn purge_terminal(&self, older_than: DateTime<Utc>) -> Result<u64, AppError> {
        let mut inner = self.inner.lock().await;
        let doomed: Vec<_> = inner
            .records
            .values()
            .filter(|r| r.status.is_terminal())
            .filter(|r| r.processed_at.is_some_and(|at| at < older_than))
            .map(|r| (r.id, (r.broadcast_id, r.recipient_id, r.channel)))
            .collect();

        for (id, key) in &doomed {
            inner.records.remove(id);
            inner.keys.remove(key);
        }
        Ok(doomed.len() as u64)
    }

    async fn claim_job_slot(
        &self,
        job: &str,
        now: DateTime<Utc>,
        min_interval: chrono::Duration,
    ) -> Result<bool, AppError> {
        let mut inner = self.inner.lock().await;
        match inner.jobs.get(job) {
            Some(last) if *last > now - min_interval => Ok(false),
            _ => {
                inner.jobs.insert(job.to_string(), now);
                Ok(true)
            }
        }
    }

    async fn progress_snapshot(
        &self,
        id: Uuid,
        top_errors: i64,
    ) -> Result<Option<ProgressSnapshot>, AppError> {
        let inner = self.inner.lock().await;
        let Some(broadcast) = inner.broadcasts.get(&id).cloned() else {
            return Ok(None);
        };

        let mut counts = StatusCounts::default();
        let mut by_message: HashMap<String, i64> = HashMap::new();
        for r in inner.records.values().filter(|r| r.broadcast_id == id) {
            counts.add(r.status, 1);
            if r.status == DeliveryStatus::Failed {
                let message = r
                    .error_message
                    .clone()
                    .unwrap_or_else(|| "unknown error".to_string());
                *by_message.entry(message).or_default() += 1;
            }
        }

        let mut errors: Vec<_> = by_message
            .into_iter()
            .map(|(message, count)| ErrorCount { message, count })
            .collect();
        errors.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.message.cmp(&b.message)));
        errors.truncate(top_errors.max(0) as usize);

        Ok(Some(ProgressSnapshot {
            broadcast,
            counts,
            errors,
        }))
    }

    async fn list_records(
        &self,
        broadcast_id: Uuid,
        status: Option<DeliveryStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<RecordPage, AppError> {
        let inner = self.inner.lock().await;
        let mut matching: Vec<_> = inner
            .records
            .values()
            .filter(|r| r.broadcast_id == broadcast_id)
            .filter(|r| status.is_none_or(|s| r.status == s))
            .cloned()
            .collect();
        matching.sort_by_key(|r| (r.created_at, r.id));

        let total = matching.len() as i64;
        let records = matching
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect();

        Ok(RecordPage { records, total })
    }
}
