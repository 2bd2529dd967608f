//! Durable state of the pipeline: broadcasts and their delivery records.
//!
//! Every mutation the pipeline performs is one method here, and each method
//! is atomic on its own. Record transitions are guarded by the state the
//! caller expects the record to be in (its lease, or `pending`), so a worker
//! whose lease was reclaimed, or whose broadcast was cancelled, cannot
//! overwrite the newer state. Aggregate counters move in the same atomic
//! step as the record transition that causes them.
//!
//! Two backends:
//! - [`PgStore`]: Postgres, used in production
//! - [`MemoryStore`]: in-process, used by tests and local runs

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use herald_common::error::AppError;
use herald_common::types::{
    Broadcast, BroadcastStatus, ChannelType, DeliveryRecord, DeliveryStatus, ErrorLogEntry,
};

/// State a record must be in for a transition to apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expect {
    /// `processing`, held by this lease
    Lease(Uuid),
    /// `pending`
    Pending,
}

/// Result of a guarded record transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Applied,
    /// The record was cancelled while the caller held it; the result is discarded.
    Cancelled,
    /// The record is no longer in the expected state (lease reclaimed, already finished).
    StaleLease,
}

/// Recent deliveries counted against a per-recipient limit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WindowUsage {
    pub count: u32,
    /// Oldest counted delivery; the window frees a slot when it ages out.
    pub oldest: Option<DateTime<Utc>>,
}

/// Per-status record counts for one broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub pending: i64,
    pub processing: i64,
    pub sent: i64,
    pub failed: i64,
    pub cancelled: i64,
}

impl StatusCounts {
    pub fn total(&self) -> i64 {
        self.pending + self.processing + self.sent + self.failed + self.cancelled
    }

    pub fn add(&mut self, status: DeliveryStatus, n: i64) {
        match status {
            DeliveryStatus::Pending => self.pending += n,
            DeliveryStatus::Processing => self.processing += n,
            DeliveryStatus::Sent => self.sent += n,
            DeliveryStatus::Failed => self.failed += n,
            DeliveryStatus::Cancelled => self.cancelled += n,
        }
    }
}

/// Distinct error message among failed records, with its frequency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorCount {
    pub message: String,
    pub count: i64,
}

/// Consistent read of a broadcast and its records, taken at one instant.
#[derive(Debug, Clone)]
pub struct ProgressSnapshot {
    pub broadcast: Broadcast,
    pub counts: StatusCounts,
    pub errors: Vec<ErrorCount>,
}

#[derive(Debug, Clone)]
pub struct RecordPage {
    pub records: Vec<DeliveryRecord>,
    pub total: i64,
}

/// Decides the final status of a broadcast whose records all finished.
///
/// Without a threshold a finished broadcast is always `completed`, even when
/// every delivery failed. With `failure_threshold = Some(t)`, it is `failed`
/// when `failed / total > t`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CompletionPolicy {
    pub failure_threshold: Option<f64>,
}

impl CompletionPolicy {
    pub fn new(failure_threshold: Option<f64>) -> Self {
        Self { failure_threshold }
    }

    pub fn final_status(&self, failed: i64, total: i64) -> BroadcastStatus {
        match self.failure_threshold {
            Some(t) if total > 0 && failed as f64 > t * total as f64 => BroadcastStatus::Failed,
            _ => BroadcastStatus::Completed,
        }
    }
}

#[async_trait]
pub trait DeliveryStore: Send + Sync {
    // --- broadcasts ---

    async fn insert_broadcast(&self, broadcast: &Broadcast) -> Result<(), AppError>;

    async fn get_broadcast(&self, id: Uuid) -> Result<Option<Broadcast>, AppError>;

    /// Move due `draft` broadcasts to `sending`, stamping `sent_at`. Each
    /// broadcast is handed to exactly one caller.
    async fn claim_due_broadcasts(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Broadcast>, AppError>;

    /// Re-claim `sending` broadcasts whose materialization never finished and
    /// whose claim is older than `claimed_before`.
    async fn reclaim_unmaterialized(
        &self,
        claimed_before: DateTime<Utc>,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Broadcast>, AppError>;

    /// Fix `recipient_count` to the number of stored records and open the
    /// broadcast for dispatch. Returns `None` if it is no longer `sending`.
    async fn finish_materialization(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<Broadcast>, AppError>;

    /// Mark a `sending` broadcast `failed` before any delivery happened.
    async fn fail_broadcast(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        entry: &ErrorLogEntry,
    ) -> Result<bool, AppError>;

    async fn append_error_log(&self, id: Uuid, entries: &[ErrorLogEntry])
    -> Result<(), AppError>;

    /// Cancel a non-terminal broadcast and all its unfinished records.
    /// Returns the number of records cancelled, or `None` when the broadcast
    /// was already terminal (or does not exist).
    async fn cancel_broadcast(&self, id: Uuid, now: DateTime<Utc>)
    -> Result<Option<u64>, AppError>;

    /// Re-arm every failed record of a finished broadcast and reopen it.
    /// Returns `None` when the broadcast is not `completed`/`failed`.
    async fn reset_failed(&self, id: Uuid, now: DateTime<Utc>) -> Result<Option<u64>, AppError>;

    // --- delivery records ---

    /// Insert-or-ignore one batch of records in one transaction. Returns the
    /// number of rows actually created.
    async fn insert_records(
        &self,
        broadcast_id: Uuid,
        channel: ChannelType,
        recipients: &[Uuid],
        max_attempts: i32,
        now: DateTime<Utc>,
    ) -> Result<u64, AppError>;

    /// Lease up to `limit` due `pending` records of dispatchable broadcasts,
    /// oldest `scheduled_at` first, moving them to `processing`.
    async fn claim_pending(
        &self,
        now: DateTime<Utc>,
        limit: i64,
        lease: Uuid,
    ) -> Result<Vec<DeliveryRecord>, AppError>;

    /// Deliveries to `recipient` on `channel` after `since`: records sent in
    /// the window plus records in flight under other leases.
    async fn window_usage(
        &self,
        recipient: Uuid,
        channel: ChannelType,
        since: DateTime<Utc>,
        lease: Uuid,
    ) -> Result<WindowUsage, AppError>;

    async fn mark_sent(
        &self,
        record_id: Uuid,
        lease: Uuid,
        now: DateTime<Utc>,
        provider_message_id: Option<String>,
    ) -> Result<Transition, AppError>;

    /// Terminal failure: counts toward `failed_count` and the error log.
    async fn mark_failed(
        &self,
        record_id: Uuid,
        expect: Expect,
        attempts: i32,
        now: DateTime<Utc>,
        reason: &str,
    ) -> Result<Transition, AppError>;

    /// Back to `pending`, eligible again at `at`.
    async fn reschedule(
        &self,
        record_id: Uuid,
        expect: Expect,
        attempts: i32,
        at: DateTime<Utc>,
        reason: Option<&str>,
    ) -> Result<Transition, AppError>;

    /// `processing` records whose lease was taken before `locked_before`.
    async fn list_stalled(
        &self,
        locked_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<DeliveryRecord>, AppError>;

    /// `pending` records that already used every attempt.
    async fn list_exhausted(&self, limit: i64) -> Result<Vec<DeliveryRecord>, AppError>;

    /// Delete terminal records processed before `older_than`.
    async fn purge_terminal(&self, older_than: DateTime<Utc>) -> Result<u64, AppError>;

    /// Claim the slot of a cadenced job if it last ran at least
    /// `min_interval` ago. At most one caller wins per slot.
    async fn claim_job_slot(
        &self,
        job: &str,
        now: DateTime<Utc>,
        min_interval: chrono::Duration,
    ) -> Result<bool, AppError>;

    async fn progress_snapshot(
        &self,
        id: Uuid,
        top_errors: i64,
    ) -> Result<Option<ProgressSnapshot>, AppError>;

    async fn list_records(
        &self,
        broadcast_id: Uuid,
        status: Option<DeliveryStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<RecordPage, AppError>;
}
