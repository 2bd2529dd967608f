//! Dispatcher: leases due delivery records and fans them out to channel
//! senders through a bounded worker pool.
//!
//! A batch goes through three phases:
//! 1. claim: one store call moves up to `batch_size` due records to
//!    `processing` under a fresh lease
//! 2. gate: per-recipient rate limits are checked in `scheduled_at` order and
//!    over-limit records are deferred without consuming an attempt
//! 3. send: the admitted records run through `buffer_unordered` with at most
//!    `concurrency` sends in flight; each result is settled on its own
//!
//! No store transaction spans a send. Every settlement is guarded by the
//! lease, so a result for a record that was cancelled or reclaimed in the
//! meantime is discarded.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use uuid::Uuid;

use herald_common::config::PipelineConfig;
use herald_common::error::AppError;
use herald_common::types::{
    Broadcast, BroadcastStatus, ChannelType, DeliveryRecord, OutboundMessage, Recipient,
};
use herald_notifier::{ChannelRegistry, ChannelSender, DeliveryReceipt, SendError};

use crate::directory::RecipientDirectory;
use crate::retry::{RetryDecision, RetryPolicy};
use crate::store::{DeliveryStore, Expect, Transition, WindowUsage};

const RECIPIENT_LIMIT_REASON: &str = "deferred: recipient rate limit";
const PROVIDER_LIMIT_REASON: &str = "deferred: provider rate limit";

#[derive(Debug, Clone, Copy)]
pub struct DispatcherConfig {
    pub batch_size: i64,
    pub concurrency: usize,
    pub send_timeout: Duration,
    pub max_batches: u32,
}

impl DispatcherConfig {
    pub fn from_pipeline(config: &PipelineConfig) -> Self {
        Self {
            batch_size: config.send_batch_size.max(1) as i64,
            concurrency: config.dispatch_concurrency.max(1),
            send_timeout: config.send_timeout(),
            max_batches: config.max_batches_per_tick.max(1),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    pub claimed: u64,
    pub sent: u64,
    pub failed: u64,
    /// Transient failures re-armed with backoff.
    pub retried: u64,
    /// Rate-limited records pushed forward without using an attempt.
    pub deferred: u64,
    /// Results dropped because the record was cancelled mid-flight.
    pub discarded: u64,
    /// Results dropped because the lease was no longer held.
    pub stale: u64,
    /// Settlements that could not be written.
    pub errors: u64,
}

impl DispatchReport {
    fn merge(&mut self, other: &DispatchReport) {
        self.claimed += other.claimed;
        self.sent += other.sent;
        self.failed += other.failed;
        self.retried += other.retried;
        self.deferred += other.deferred;
        self.discarded += other.discarded;
        self.stale += other.stale;
        self.errors += other.errors;
    }

    fn count(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Sent => self.sent += 1,
            Outcome::Failed => self.failed += 1,
            Outcome::Retried => self.retried += 1,
            Outcome::Deferred => self.deferred += 1,
            Outcome::Discarded => self.discarded += 1,
            Outcome::Stale => self.stale += 1,
            Outcome::Error => self.errors += 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Sent,
    Failed,
    Retried,
    Deferred,
    Discarded,
    Stale,
    Error,
}

/// An admitted record, ready to send.
struct Job {
    record: DeliveryRecord,
    sender: Arc<dyn ChannelSender>,
    recipient: Recipient,
    message: Arc<OutboundMessage>,
}

/// Rate-limit bookkeeping for one (recipient, channel) within a batch.
struct Window {
    usage: WindowUsage,
    admitted: u32,
}

pub struct Dispatcher {
    store: Arc<dyn DeliveryStore>,
    directory: Arc<dyn RecipientDirectory>,
    senders: ChannelRegistry,
    retry: RetryPolicy,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn DeliveryStore>,
        directory: Arc<dyn RecipientDirectory>,
        senders: ChannelRegistry,
        retry: RetryPolicy,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            store,
            directory,
            senders,
            retry,
            config,
        }
    }

    /// Dispatch batches until the queue of due records is empty or the
    /// per-tick batch cap is reached.
    pub async fn drain(&self, now: DateTime<Utc>) -> Result<DispatchReport, AppError> {
        let mut total = DispatchReport::default();

        for _ in 0..self.config.max_batches {
            let report = self.dispatch_batch(now).await?;
            total.merge(&report);
            if (report.claimed as i64) < self.config.batch_size {
                break;
            }
        }

        if total.claimed > 0 {
            tracing::info!(
                claimed = total.claimed,
                sent = total.sent,
                failed = total.failed,
                retried = total.retried,
                deferred = total.deferred,
                discarded = total.discarded,
                "Dispatch drain finished"
            );
        }
        Ok(total)
    }

    /// Claim and process one batch.
    pub async fn dispatch_batch(&self, now: DateTime<Utc>) -> Result<DispatchReport, AppError> {
        let lease = Uuid::new_v4();
        let records = self
            .store
            .claim_pending(now, self.config.batch_size, lease)
            .await?;

        let mut report = DispatchReport {
            claimed: records.len() as u64,
            ..Default::default()
        };
        if records.is_empty() {
            return Ok(report);
        }

        tracing::debug!(lease = %lease, claimed = records.len(), "Claimed delivery batch");

        let (broadcasts, contacts) = match self.load_context(&records).await {
            Ok(context) => context,
            Err(e) => {
                self.release(&records, lease, now).await;
                return Err(e);
            }
        };

        let payloads: HashMap<Uuid, Arc<OutboundMessage>> = broadcasts
            .iter()
            .map(|(id, b)| (*id, Arc::new(b.payload())))
            .collect();
        let mut windows: HashMap<(Uuid, ChannelType), Window> = HashMap::new();
        let mut jobs = Vec::with_capacity(records.len());

        for record in records {
            let Some(broadcast) = broadcasts.get(&record.broadcast_id) else {
                let err = SendError::Permanent("broadcast not found".into());
                let outcome = self.settle(&record, lease, Err(err), now).await;
                report.count(outcome);
                continue;
            };

            if broadcast.status == BroadcastStatus::Cancelled {
                report.count(Outcome::Discarded);
                continue;
            }

            let Some(sender) = self.senders.get(record.channel) else {
                let err = SendError::Permanent(format!(
                    "no sender registered for channel {}",
                    record.channel
                ));
                let outcome = self.settle(&record, lease, Err(err), now).await;
                report.count(outcome);
                continue;
            };

            let Some(recipient) = contacts.get(&record.recipient_id).cloned() else {
                let err = SendError::Permanent("recipient not found".into());
                let outcome = self.settle(&record, lease, Err(err), now).await;
                report.count(outcome);
                continue;
            };

            if let Some(limit) = sender.recipient_limit() {
                let window = match windows.entry((record.recipient_id, record.channel)) {
                    Entry::Occupied(entry) => entry.into_mut(),
                    Entry::Vacant(entry) => {
                        let since = now - limit.window;
                        match self
                            .store
                            .window_usage(record.recipient_id, record.channel, since, lease)
                            .await
                        {
                            Ok(usage) => entry.insert(Window { usage, admitted: 0 }),
                            Err(e) => {
                                tracing::error!(record_id = %record.id, error = %e, "Rate window lookup failed");
                                self.release(std::slice::from_ref(&record), lease, now).await;
                                report.count(Outcome::Error);
                                continue;
                            }
                        }
                    }
                };

                if window.usage.count + window.admitted >= limit.max {
                    // Admissions in this batch count as sent at `now`.
                    let oldest = window.usage.oldest.map_or(now, |o| o.min(now));
                    let at = (oldest + limit.window).max(now);
                    let outcome = self
                        .defer(&record, lease, at, RECIPIENT_LIMIT_REASON)
                        .await;
                    if outcome == Outcome::Deferred {
                        tracing::debug!(
                            record_id = %record.id,
                            recipient_id = %record.recipient_id,
                            channel = %record.channel,
                            retry_at = %at,
                            "Recipient over rate limit, deferred"
                        );
                    }
                    report.count(outcome);
                    continue;
                }
                window.admitted += 1;
            }

            let Some(message) = payloads.get(&broadcast.id).cloned() else {
                continue;
            };
            jobs.push(Job {
                message,
                record,
                sender,
                recipient,
            });
        }

        let outcomes: Vec<Outcome> = futures::stream::iter(jobs)
            .map(|job| self.run(job, lease, now))
            .buffer_unordered(self.config.concurrency)
            .collect()
            .await;

        for outcome in outcomes {
            report.count(outcome);
        }
        Ok(report)
    }

    async fn load_context(
        &self,
        records: &[DeliveryRecord],
    ) -> Result<(HashMap<Uuid, Broadcast>, HashMap<Uuid, Recipient>), AppError> {
        let broadcast_ids: HashSet<Uuid> = records.iter().map(|r| r.broadcast_id).collect();
        let mut broadcasts = HashMap::with_capacity(broadcast_ids.len());
        for id in broadcast_ids {
            if let Some(b) = self.store.get_broadcast(id).await? {
                broadcasts.insert(id, b);
            }
        }

        let recipient_ids: Vec<Uuid> = records
            .iter()
            .map(|r| r.recipient_id)
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        let contacts = self.directory.contacts(&recipient_ids).await?;

        Ok((broadcasts, contacts))
    }

    /// Hand records back to the queue untouched after an infrastructure error.
    async fn release(&self, records: &[DeliveryRecord], lease: Uuid, now: DateTime<Utc>) {
        for record in records {
            if let Err(e) = self
                .store
                .reschedule(record.id, Expect::Lease(lease), record.attempts, now, None)
                .await
            {
                tracing::error!(record_id = %record.id, error = %e, "Failed to release record");
            }
        }
    }

    async fn run(&self, job: Job, lease: Uuid, now: DateTime<Utc>) -> Outcome {
        let Job {
            record,
            sender,
            recipient,
            message,
        } = job;

        let result = match tokio::time::timeout(
            self.config.send_timeout,
            sender.send(&recipient, &message),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(SendError::Transient(format!(
                "send timed out after {}s",
                self.config.send_timeout.as_secs()
            ))),
        };

        self.settle(&record, lease, result, now).await
    }

    /// Record the result of one send attempt.
    async fn settle(
        &self,
        record: &DeliveryRecord,
        lease: Uuid,
        result: Result<DeliveryReceipt, SendError>,
        now: DateTime<Utc>,
    ) -> Outcome {
        let expect = Expect::Lease(lease);

        let written = match result {
            Ok(receipt) => self
                .store
                .mark_sent(record.id, lease, now, receipt.provider_message_id)
                .await
                .map(|t| (t, Outcome::Sent)),
            Err(SendError::Permanent(reason)) => self
                .store
                .mark_failed(record.id, expect, record.attempts + 1, now, &reason)
                .await
                .map(|t| (t, Outcome::Failed)),
            Err(SendError::Transient(reason)) => {
                match self.retry.decide(record.attempts, record.max_attempts, now) {
                    RetryDecision::Retry { attempts, at } => self
                        .store
                        .reschedule(record.id, expect, attempts, at, Some(&reason))
                        .await
                        .map(|t| (t, Outcome::Retried)),
                    RetryDecision::Exhausted { attempts } => self
                        .store
                        .mark_failed(record.id, expect, attempts, now, &reason)
                        .await
                        .map(|t| (t, Outcome::Failed)),
                }
            }
            Err(SendError::RateLimited { retry_after }) => {
                let at = now
                    + chrono::Duration::from_std(retry_after)
                        .unwrap_or_else(|_| chrono::Duration::seconds(60));
                return self.defer(record, lease, at, PROVIDER_LIMIT_REASON).await;
            }
        };

        resolve(record, written)
    }

    async fn defer(
        &self,
        record: &DeliveryRecord,
        lease: Uuid,
        at: DateTime<Utc>,
        reason: &str,
    ) -> Outcome {
        let written = self
            .store
            .reschedule(record.id, Expect::Lease(lease), record.attempts, at, Some(reason))
            .await
            .map(|t| (t, Outcome::Deferred));
        resolve(record, written)
    }
}

fn resolve(record: &DeliveryRecord, written: Result<(Transition, Outcome), AppError>) -> Outcome {
    match written {
        Ok((Transition::Applied, outcome)) => outcome,
        Ok((Transition::Cancelled, _)) => {
            tracing::debug!(record_id = %record.id, "Record cancelled in flight, result discarded");
            Outcome::Discarded
        }
        Ok((Transition::StaleLease, _)) => {
            tracing::warn!(
                record_id = %record.id,
                broadcast_id = %record.broadcast_id,
                "Lease lost before settlement, result discarded"
            );
            Outcome::Stale
        }
        Err(e) => {
            tracing::error!(record_id = %record.id, error = %e, "Failed to settle delivery");
            Outcome::Error
        }
    }
}
