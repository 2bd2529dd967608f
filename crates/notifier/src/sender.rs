//! Channel sender contract.
//!
//! Every delivery channel implements [`ChannelSender`]. The dispatcher only
//! sees this trait: it never knows which provider sits behind a channel.
//! Senders own formatting (truncation), provider-side throttling and the
//! classification of failures into transient vs permanent.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use herald_common::types::{ChannelType, OutboundMessage, Recipient};

/// Successful provider hand-off.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryReceipt {
    /// Provider-assigned message ID, when the provider returns one.
    pub provider_message_id: Option<String>,
}

impl DeliveryReceipt {
    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            provider_message_id: Some(id.into()),
        }
    }
}

/// Why a send did not go through.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    /// Network failure, timeout, 5xx, provider busy. Eligible for retry.
    #[error("transient send error: {0}")]
    Transient(String),

    /// Invalid address, blocked recipient, malformed request. Never retried.
    #[error("permanent send error: {0}")]
    Permanent(String),

    /// Provider-side throttle hit. The attempt is deferred, not failed.
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },
}

impl SendError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, SendError::Transient(_))
    }

    /// Message persisted on the delivery record.
    pub fn reason(&self) -> String {
        match self {
            SendError::Transient(msg) | SendError::Permanent(msg) => msg.clone(),
            SendError::RateLimited { retry_after } => {
                format!("rate limited for {}s", retry_after.as_secs())
            }
        }
    }
}

/// Per-recipient service-side limit: at most `max` deliveries per `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub max: u32,
    pub window: chrono::Duration,
}

impl RateLimit {
    pub fn per_hour(max: u32) -> Self {
        Self {
            max,
            window: chrono::Duration::hours(1),
        }
    }
}

/// A pluggable delivery channel.
#[async_trait]
pub trait ChannelSender: Send + Sync {
    /// The channel this sender serves.
    fn channel(&self) -> ChannelType;

    /// Per-recipient limit the dispatcher enforces before calling [`send`](Self::send).
    fn recipient_limit(&self) -> Option<RateLimit> {
        None
    }

    /// Deliver one message to one recipient.
    async fn send(
        &self,
        recipient: &Recipient,
        message: &OutboundMessage,
    ) -> Result<DeliveryReceipt, SendError>;
}

/// Channel → sender lookup used by the dispatcher.
#[derive(Clone, Default)]
pub struct ChannelRegistry {
    senders: HashMap<ChannelType, Arc<dyn ChannelSender>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a sender, replacing any previous sender for the same channel.
    pub fn register(&mut self, sender: Arc<dyn ChannelSender>) {
        let channel = sender.channel();
        if self.senders.insert(channel, sender).is_some() {
            tracing::warn!(channel = %channel, "Replaced existing channel sender");
        }
    }

    pub fn with(mut self, sender: Arc<dyn ChannelSender>) -> Self {
        self.register(sender);
        self
    }

    pub fn get(&self, channel: ChannelType) -> Option<Arc<dyn ChannelSender>> {
        self.senders.get(&channel).cloned()
    }

    pub fn channels(&self) -> Vec<ChannelType> {
        self.senders.keys().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.senders.is_empty()
    }
}

impl std::fmt::Debug for ChannelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelRegistry")
            .field("channels", &self.channels())
            .finish()
    }
}
