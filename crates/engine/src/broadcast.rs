//! Broadcast service: creation and control operations.
//!
//! Creation only validates and stores a `draft`; the scheduler does the rest
//! asynchronously. Control operations (cancel, retry, progress, recipient
//! listing) act on whatever state the pipeline has reached.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use herald_common::config::PipelineConfig;
use herald_common::error::AppError;
use herald_common::types::{
    Broadcast, BroadcastStatus, ChannelType, DeliveryRecord, DeliveryStatus, NotificationKind,
    Priority, RelatedObject, TargetSpec,
};

use crate::progress::{Progress, ProgressTracker};
use crate::store::DeliveryStore;
use crate::target;

pub const TITLE_MAX_CHARS: usize = 200;
pub const MESSAGE_MAX_CHARS: usize = 1000;
pub const MAX_ATTEMPTS_CEILING: i32 = 10;
pub const DEFAULT_PER_PAGE: i64 = 50;
pub const MAX_PER_PAGE: i64 = 200;

fn default_channels() -> Vec<ChannelType> {
    vec![ChannelType::InApp]
}

/// Parameters for creating a broadcast.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateBroadcastParams {
    pub title: String,
    pub message: String,
    pub target_spec: TargetSpec,
    #[serde(default = "default_channels")]
    pub channels: Vec<ChannelType>,
    #[serde(default)]
    pub kind: NotificationKind,
    #[serde(default)]
    pub priority: Priority,
    pub related_object: Option<RelatedObject>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub max_attempts: Option<i32>,
}

/// Parameters for a notification to a single user.
#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleNotificationParams {
    pub recipient_id: Uuid,
    pub title: String,
    pub body: String,
    #[serde(default)]
    pub kind: NotificationKind,
    #[serde(default)]
    pub priority: Priority,
    pub related_object: Option<RelatedObject>,
    #[serde(default = "default_channels")]
    pub channels: Vec<ChannelType>,
    pub scheduled_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CancelSummary {
    pub broadcast_id: Uuid,
    pub records_cancelled: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RetrySummary {
    pub broadcast_id: Uuid,
    pub requeued: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecipientPage {
    pub records: Vec<DeliveryRecord>,
    pub total: i64,
    pub page: i64,
    pub per_page: i64,
}

pub struct BroadcastService {
    store: Arc<dyn DeliveryStore>,
    tracker: ProgressTracker,
    default_max_attempts: i32,
    max_custom_recipients: usize,
}

impl BroadcastService {
    pub fn new(store: Arc<dyn DeliveryStore>, config: &PipelineConfig) -> Self {
        Self {
            tracker: ProgressTracker::new(store.clone()),
            store,
            default_max_attempts: config.max_attempts,
            max_custom_recipients: config.max_custom_recipients,
        }
    }

    /// Validate and store a new `draft` broadcast.
    pub async fn create(
        &self,
        creator_id: Uuid,
        params: CreateBroadcastParams,
    ) -> Result<Broadcast, AppError> {
        let CreateBroadcastParams {
            title,
            message,
            target_spec,
            channels,
            kind,
            priority,
            related_object,
            scheduled_at,
            max_attempts,
        } = params;

        let title = title.trim().to_string();
        check_length("title", &title, TITLE_MAX_CHARS)?;
        check_length("message", &message, MESSAGE_MAX_CHARS)?;
        target::validate(&target_spec, self.max_custom_recipients)?;

        let channels = dedup_channels(channels);
        if channels.is_empty() {
            return Err(AppError::Validation(
                "At least one channel is required".to_string(),
            ));
        }

        let max_attempts = max_attempts.unwrap_or(self.default_max_attempts);
        if !(1..=MAX_ATTEMPTS_CEILING).contains(&max_attempts) {
            return Err(AppError::Validation(format!(
                "max_attempts must be between 1 and {}",
                MAX_ATTEMPTS_CEILING
            )));
        }

        let now = Utc::now();
        let broadcast = Broadcast {
            id: Uuid::new_v4(),
            creator_id,
            title,
            message,
            kind,
            priority,
            related_object,
            target_spec,
            channels,
            status: BroadcastStatus::Draft,
            recipient_count: 0,
            sent_count: 0,
            failed_count: 0,
            max_attempts,
            error_log: Vec::new(),
            scheduled_at,
            sent_at: None,
            materialized_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        };

        self.store.insert_broadcast(&broadcast).await?;

        tracing::info!(
            broadcast_id = %broadcast.id,
            creator_id = %creator_id,
            target_type = broadcast.target_spec.kind(),
            channels = broadcast.channels.len(),
            scheduled = broadcast.scheduled_at.is_some(),
            "Broadcast created"
        );

        Ok(broadcast)
    }

    /// A broadcast addressed to exactly one user.
    pub async fn schedule_notification(
        &self,
        creator_id: Uuid,
        params: ScheduleNotificationParams,
    ) -> Result<Broadcast, AppError> {
        self.create(
            creator_id,
            CreateBroadcastParams {
                title: params.title,
                message: params.body,
                target_spec: TargetSpec::Custom(vec![params.recipient_id]),
                channels: params.channels,
                kind: params.kind,
                priority: params.priority,
                related_object: params.related_object,
                scheduled_at: params.scheduled_at,
                max_attempts: None,
            },
        )
        .await
    }

    pub async fn get(&self, id: Uuid) -> Result<Broadcast, AppError> {
        self.store
            .get_broadcast(id)
            .await?
            .ok_or_else(|| not_found(id))
    }

    /// Cancel a broadcast that has not finished. In-flight sends complete but
    /// their results are discarded.
    pub async fn cancel(&self, id: Uuid) -> Result<CancelSummary, AppError> {
        match self.store.cancel_broadcast(id, Utc::now()).await? {
            Some(records_cancelled) => {
                tracing::info!(broadcast_id = %id, records_cancelled, "Broadcast cancelled");
                Ok(CancelSummary {
                    broadcast_id: id,
                    records_cancelled,
                })
            }
            None => {
                let broadcast = self.get(id).await?;
                Err(AppError::Conflict(format!(
                    "Broadcast {} is already {}",
                    id, broadcast.status
                )))
            }
        }
    }

    /// Requeue every failed record of a finished broadcast with a fresh
    /// attempt budget.
    pub async fn retry_failed(&self, id: Uuid) -> Result<RetrySummary, AppError> {
        match self.store.reset_failed(id, Utc::now()).await? {
            Some(requeued) => {
                tracing::info!(broadcast_id = %id, requeued, "Failed deliveries requeued");
                Ok(RetrySummary {
                    broadcast_id: id,
                    requeued,
                })
            }
            None => {
                let broadcast = self.get(id).await?;
                Err(AppError::Conflict(format!(
                    "Broadcast {} is {}; only completed or failed broadcasts can be retried",
                    id, broadcast.status
                )))
            }
        }
    }

    pub async fn get_progress(&self, id: Uuid) -> Result<Progress, AppError> {
        self.tracker.get_progress(id).await
    }

    /// One page of delivery records, optionally filtered by status. Pages
    /// start at 1.
    pub async fn list_recipients(
        &self,
        id: Uuid,
        status: Option<DeliveryStatus>,
        page: Option<i64>,
        per_page: Option<i64>,
    ) -> Result<RecipientPage, AppError> {
        self.get(id).await?;

        let page = page.unwrap_or(1).max(1);
        let per_page = per_page.unwrap_or(DEFAULT_PER_PAGE).clamp(1, MAX_PER_PAGE);
        let offset = (page - 1).saturating_mul(per_page);

        let result = self.store.list_records(id, status, per_page, offset).await?;
        Ok(RecipientPage {
            records: result.records,
            total: result.total,
            page,
            per_page,
        })
    }
}

fn not_found(id: Uuid) -> AppError {
    AppError::NotFound(format!("Broadcast {} not found", id))
}

fn check_length(field: &str, value: &str, max: usize) -> Result<(), AppError> {
    let len = value.chars().count();
    if value.trim().is_empty() {
        return Err(AppError::Validation(format!("{} must not be empty", field)));
    }
    if len > max {
        return Err(AppError::Validation(format!(
            "{} is {} characters, limit is {}",
            field, len, max
        )));
    }
    Ok(())
}

fn dedup_channels(channels: Vec<ChannelType>) -> Vec<ChannelType> {
    let mut seen = HashSet::new();
    channels.into_iter().filter(|c| seen.insert(*c)).collect()
}
