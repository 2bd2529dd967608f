//! Read-only progress view of a broadcast.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use herald_common::error::AppError;
use herald_common::types::{Broadcast, BroadcastStatus};

use crate::store::{DeliveryStore, ErrorCount, ProgressSnapshot};

pub const DEFAULT_TOP_ERRORS: i64 = 10;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Progress {
    pub broadcast_id: Uuid,
    pub status: BroadcastStatus,
    pub total: i64,
    pub sent: i64,
    pub failed: i64,
    /// Records not yet finished: `pending` plus `processing`.
    pub pending: i64,
    pub cancelled: i64,
    pub progress_pct: i64,
    pub error_summary: Vec<ErrorCount>,
    pub sent_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Progress {
    fn from_snapshot(snapshot: ProgressSnapshot, top_errors: usize) -> Self {
        let ProgressSnapshot {
            broadcast: b,
            counts,
            errors,
        } = snapshot;

        // Counters move atomically with their records, so they agree with
        // `counts` and survive purging of old records.
        let total = if b.materialized_at.is_some() {
            b.recipient_count
        } else {
            counts.total()
        };

        let error_summary = if errors.is_empty() && b.failed_count > 0 {
            summarize_log(&b, top_errors)
        } else {
            errors
        };

        Self {
            broadcast_id: b.id,
            status: b.status,
            total,
            sent: b.sent_count,
            failed: b.failed_count,
            pending: counts.pending + counts.processing,
            cancelled: counts.cancelled,
            progress_pct: percent(b.sent_count + b.failed_count, total),
            error_summary,
            sent_at: b.sent_at,
            completed_at: b.completed_at,
        }
    }
}

pub fn percent(done: i64, total: i64) -> i64 {
    if total <= 0 {
        return 0;
    }
    (done as f64 / total as f64 * 100.0).round() as i64
}

/// Error counts rebuilt from the broadcast's own log, used once the failed
/// records themselves have been purged.
fn summarize_log(broadcast: &Broadcast, top: usize) -> Vec<ErrorCount> {
    let mut counts: HashMap<&str, i64> = HashMap::new();
    for entry in broadcast.error_log.iter().filter(|e| e.recipient_id.is_some()) {
        *counts.entry(entry.reason.as_str()).or_default() += 1;
    }

    let mut summary: Vec<ErrorCount> = counts
        .into_iter()
        .map(|(message, count)| ErrorCount {
            message: message.to_string(),
            count,
        })
        .collect();
    summary.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.message.cmp(&b.message)));
    summary.truncate(top);
    summary
}

pub struct ProgressTracker {
    store: Arc<dyn DeliveryStore>,
    top_errors: i64,
}

impl ProgressTracker {
    pub fn new(store: Arc<dyn DeliveryStore>) -> Self {
        Self {
            store,
            top_errors: DEFAULT_TOP_ERRORS,
        }
    }

    pub fn with_top_errors(mut self, top_errors: i64) -> Self {
        self.top_errors = top_errors.max(0);
        self
    }

    pub async fn get_progress(&self, broadcast_id: Uuid) -> Result<Progress, AppError> {
        let snapshot = self
            .store
            .progress_snapshot(broadcast_id, self.top_errors)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Broadcast {} not found", broadcast_id)))?;

        Ok(Progress::from_snapshot(snapshot, self.top_errors as usize))
    }
}
