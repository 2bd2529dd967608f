//! Backoff policy and the reconciliation pass for abandoned work.
//!
//! Transient send failures are re-armed by the dispatcher as soon as the
//! result comes back, using [`RetryPolicy::decide`]. This module's
//! [`RetryEngine`] handles what no live worker will: records left in
//! `processing` by a crashed worker past the stall threshold, and `pending`
//! records that somehow already used every attempt.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use herald_common::config::PipelineConfig;
use herald_common::error::AppError;
use herald_common::types::DeliveryRecord;

use crate::store::{DeliveryStore, Expect, Transition};

const LEASE_EXPIRED: &str = "worker lease expired";

/// Exponential backoff with a ceiling on attempts and on delay.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-arm with the new attempt count, eligible at `at`.
    Retry { attempts: i32, at: DateTime<Utc> },
    /// No attempts left; record the failure.
    Exhausted { attempts: i32 },
}

impl RetryPolicy {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            base_delay: Duration::seconds(config.retry_base_delay_secs as i64),
            multiplier: config.retry_backoff_multiplier,
            max_delay: Duration::seconds(config.retry_max_delay_secs as i64),
        }
    }

    /// `base * multiplier^attempt`, capped at `max_delay`.
    pub fn delay(&self, attempt: i32) -> Duration {
        let base_ms = self.base_delay.num_milliseconds() as f64;
        let cap_ms = self.max_delay.num_milliseconds() as f64;
        let ms = (base_ms * self.multiplier.powi(attempt.max(0))).min(cap_ms);
        Duration::milliseconds(ms as i64)
    }

    /// Account for one more failed attempt of a record that has failed
    /// `attempts` times so far.
    pub fn decide(&self, attempts: i32, max_attempts: i32, now: DateTime<Utc>) -> RetryDecision {
        let attempts = attempts + 1;
        if attempts >= max_attempts {
            RetryDecision::Exhausted { attempts }
        } else {
            RetryDecision::Retry {
                attempts,
                at: now + self.delay(attempts),
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RetryReport {
    /// Stalled records put back in the queue.
    pub reclaimed: u64,
    /// Records that ran out of attempts.
    pub failed: u64,
    /// Records another actor moved first.
    pub skipped: u64,
}

pub struct RetryEngine {
    store: Arc<dyn DeliveryStore>,
    policy: RetryPolicy,
    stall_threshold: Duration,
    scan_limit: i64,
}

impl RetryEngine {
    pub fn new(
        store: Arc<dyn DeliveryStore>,
        policy: RetryPolicy,
        stall_threshold: Duration,
        scan_limit: i64,
    ) -> Self {
        Self {
            store,
            policy,
            stall_threshold,
            scan_limit,
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub async fn run(&self, now: DateTime<Utc>) -> Result<RetryReport, AppError> {
        let mut report = RetryReport::default();

        let stalled = self
            .store
            .list_stalled(now - self.stall_threshold, self.scan_limit)
            .await?;
        for record in stalled {
            self.recover_stalled(&record, now, &mut report).await?;
        }

        let exhausted = self.store.list_exhausted(self.scan_limit).await?;
        for record in exhausted {
            let reason = record
                .error_message
                .clone()
                .unwrap_or_else(|| "attempts exhausted".to_string());
            let outcome = self
                .store
                .mark_failed(record.id, Expect::Pending, record.attempts, now, &reason)
                .await?;
            tally(&mut report.failed, &mut report.skipped, outcome, &record);
        }

        if report != RetryReport::default() {
            tracing::info!(
                reclaimed = report.reclaimed,
                failed = report.failed,
                skipped = report.skipped,
                "Retry pass finished"
            );
        }
        Ok(report)
    }

    async fn recover_stalled(
        &self,
        record: &DeliveryRecord,
        now: DateTime<Utc>,
        report: &mut RetryReport,
    ) -> Result<(), AppError> {
        let Some(lease) = record.lease_id else {
            return Ok(());
        };
        let expect = Expect::Lease(lease);

        match self.policy.decide(record.attempts, record.max_attempts, now) {
            RetryDecision::Retry { attempts, at } => {
                let outcome = self
                    .store
                    .reschedule(record.id, expect, attempts, at, Some(LEASE_EXPIRED))
                    .await?;
                if outcome == Transition::Applied {
                    tracing::warn!(
                        record_id = %record.id,
                        broadcast_id = %record.broadcast_id,
                        attempts,
                        retry_at = %at,
                        "Reclaimed stalled delivery"
                    );
                }
                tally(&mut report.reclaimed, &mut report.skipped, outcome, record);
            }
            RetryDecision::Exhausted { attempts } => {
                let outcome = self
                    .store
                    .mark_failed(record.id, expect, attempts, now, LEASE_EXPIRED)
                    .await?;
                tally(&mut report.failed, &mut report.skipped, outcome, record);
            }
        }
        Ok(())
    }
}

fn tally(applied: &mut u64, skipped: &mut u64, outcome: Transition, record: &DeliveryRecord) {
    match outcome {
        Transition::Applied => *applied += 1,
        Transition::Cancelled | Transition::StaleLease => {
            tracing::debug!(record_id = %record.id, ?outcome, "Record moved before retry pass");
            *skipped += 1;
        }
    }
}
