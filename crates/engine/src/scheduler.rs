//! Periodic driver tying the pipeline together.
//!
//! Each tick runs, in order: promotion of due broadcasts (resolve target,
//! materialize records, open for dispatch), a dispatcher drain, the retry
//! pass, and, on its own slower cadence, the purge of old terminal records.
//! A failing step is logged and does not stop the steps after it.
//!
//! Overlapping ticks, on one instance or several, are safe: broadcasts and
//! records are claimed before they are worked on, and the purge slot is
//! claimed through `scheduler_state`.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use herald_common::config::PipelineConfig;
use herald_common::error::AppError;
use herald_common::types::{Broadcast, ErrorLogEntry};
use herald_notifier::ChannelRegistry;

use crate::directory::RecipientDirectory;
use crate::dispatcher::{DispatchReport, Dispatcher, DispatcherConfig};
use crate::materializer::Materializer;
use crate::retry::{RetryEngine, RetryPolicy, RetryReport};
use crate::store::DeliveryStore;
use crate::target::{TargetError, TargetResolver};

const PURGE_JOB: &str = "purge";
const UNKNOWN_RECIPIENT: &str = "recipient not found";

/// Broadcasts promoted per tick.
const PROMOTE_LIMIT: i64 = 20;
/// Records examined per retry pass.
const RETRY_SCAN_LIMIT: i64 = 1000;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    /// Broadcasts opened for dispatch this tick.
    pub promoted: u64,
    /// Delivery records created this tick.
    pub materialized: u64,
    pub dispatch: DispatchReport,
    pub retry: RetryReport,
    /// `None` when the purge slot was not due.
    pub purged: Option<u64>,
}

pub struct Scheduler {
    store: Arc<dyn DeliveryStore>,
    resolver: TargetResolver,
    materializer: Materializer,
    dispatcher: Dispatcher,
    retry: RetryEngine,
    stall_threshold: chrono::Duration,
    retention: chrono::Duration,
    purge_interval: chrono::Duration,
    tick_interval: Duration,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn DeliveryStore>,
        directory: Arc<dyn RecipientDirectory>,
        senders: ChannelRegistry,
        config: &PipelineConfig,
    ) -> Self {
        let policy = RetryPolicy::from_config(config);
        let stall_threshold = config.stall_threshold();

        Self {
            resolver: TargetResolver::new(directory.clone(), config.max_custom_recipients),
            materializer: Materializer::new(store.clone(), config.materialize_batch_size),
            dispatcher: Dispatcher::new(
                store.clone(),
                directory,
                senders,
                policy,
                DispatcherConfig::from_pipeline(config),
            ),
            retry: RetryEngine::new(store.clone(), policy, stall_threshold, RETRY_SCAN_LIMIT),
            store,
            stall_threshold,
            retention: chrono::Duration::days(config.retention_days),
            purge_interval: chrono::Duration::hours(config.purge_interval_hours),
            tick_interval: config.tick_interval(),
        }
    }

    /// Tick forever on a fixed interval.
    pub async fn run(&self) {
        let mut interval = tokio::time::interval(self.tick_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        tracing::info!(
            tick_interval_secs = self.tick_interval.as_secs(),
            "Scheduler started"
        );

        loop {
            interval.tick().await;
            self.tick(Utc::now()).await;
        }
    }

    pub async fn tick(&self, now: DateTime<Utc>) -> TickReport {
        let mut report = TickReport::default();

        match self.promote(now).await {
            Ok((promoted, created)) => {
                report.promoted = promoted;
                report.materialized = created;
            }
            Err(e) => tracing::error!(error = %e, "Promotion step failed"),
        }

        match self.dispatcher.drain(now).await {
            Ok(dispatch) => report.dispatch = dispatch,
            Err(e) => tracing::error!(error = %e, "Dispatch step failed"),
        }

        match self.retry.run(now).await {
            Ok(retry) => report.retry = retry,
            Err(e) => tracing::error!(error = %e, "Retry step failed"),
        }

        match self.purge(now).await {
            Ok(purged) => report.purged = purged,
            Err(e) => tracing::error!(error = %e, "Purge step failed"),
        }

        tracing::debug!(?report, "Tick finished");
        report
    }

    /// Claim due drafts plus abandoned promotions and materialize them.
    async fn promote(&self, now: DateTime<Utc>) -> Result<(u64, u64), AppError> {
        let mut claimed = self.store.claim_due_broadcasts(now, PROMOTE_LIMIT).await?;
        claimed.extend(
            self.store
                .reclaim_unmaterialized(now - self.stall_threshold, now, PROMOTE_LIMIT)
                .await?,
        );

        let (mut promoted, mut created) = (0, 0);
        for broadcast in claimed {
            match self.materialize_broadcast(&broadcast, now).await {
                Ok(Some(n)) => {
                    promoted += 1;
                    created += n;
                }
                Ok(None) => {}
                Err(e) => {
                    // Left in `sending` without `materialized_at`; reclaimed later.
                    tracing::error!(
                        broadcast_id = %broadcast.id,
                        error = %e,
                        "Materialization failed, will retry"
                    );
                }
            }
        }
        Ok((promoted, created))
    }

    /// Returns the number of records created, or `None` if the broadcast was
    /// not opened for dispatch this time.
    async fn materialize_broadcast(
        &self,
        broadcast: &Broadcast,
        now: DateTime<Utc>,
    ) -> Result<Option<u64>, AppError> {
        let resolution = match self.resolver.resolve(&broadcast.target_spec).await {
            Ok(resolution) => resolution,
            Err(TargetError::Directory(e)) => return Err(e),
            Err(e) => {
                let entry = ErrorLogEntry {
                    timestamp: now,
                    recipient_id: None,
                    channel: None,
                    reason: e.to_string(),
                };
                if self.store.fail_broadcast(broadcast.id, now, &entry).await? {
                    tracing::warn!(
                        broadcast_id = %broadcast.id,
                        error = %e,
                        "Target rejected, broadcast failed"
                    );
                }
                return Ok(None);
            }
        };

        let unknown: Vec<ErrorLogEntry> = resolution
            .unknown
            .iter()
            .filter(|id| {
                !broadcast
                    .error_log
                    .iter()
                    .any(|e| e.recipient_id == Some(**id) && e.reason == UNKNOWN_RECIPIENT)
            })
            .map(|id| ErrorLogEntry {
                timestamp: now,
                recipient_id: Some(*id),
                channel: None,
                reason: UNKNOWN_RECIPIENT.to_string(),
            })
            .collect();
        self.store.append_error_log(broadcast.id, &unknown).await?;

        let mut created = 0;
        let mut complete = true;
        for &channel in &broadcast.channels {
            let report = self
                .materializer
                .materialize(
                    broadcast.id,
                    &resolution.recipients,
                    channel,
                    broadcast.max_attempts,
                    now,
                )
                .await;
            created += report.created;
            complete &= report.is_complete();
        }

        if !complete {
            tracing::warn!(
                broadcast_id = %broadcast.id,
                "Materialization incomplete, will resume after stall threshold"
            );
            return Ok(None);
        }

        match self.store.finish_materialization(broadcast.id, now).await? {
            Some(opened) => {
                tracing::info!(
                    broadcast_id = %opened.id,
                    target_type = opened.target_spec.kind(),
                    recipient_count = opened.recipient_count,
                    status = %opened.status,
                    "Broadcast opened for dispatch"
                );
                Ok(Some(created))
            }
            None => Ok(None),
        }
    }

    async fn purge(&self, now: DateTime<Utc>) -> Result<Option<u64>, AppError> {
        if !self
            .store
            .claim_job_slot(PURGE_JOB, now, self.purge_interval)
            .await?
        {
            return Ok(None);
        }

        let purged = self.store.purge_terminal(now - self.retention).await?;
        tracing::info!(
            purged,
            retention_days = self.retention.num_days(),
            "Purged terminal delivery records"
        );
        Ok(Some(purged))
    }
}
