//! Push channel via an FCM-compatible HTTP gateway.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use herald_common::types::{ChannelType, OutboundMessage, Priority, Recipient};

use crate::format;
use crate::http::{check_response, classify_transport};
use crate::sender::{ChannelSender, DeliveryReceipt, RateLimit, SendError};
use crate::throttle::ProviderThrottle;

#[derive(Debug, Serialize)]
struct PushRequest<'a> {
    to: &'a str,
    priority: &'static str,
    notification: PushNotification,
    data: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct PushNotification {
    title: String,
    body: String,
}

#[derive(Debug, Deserialize)]
struct PushResponse {
    #[serde(default)]
    results: Vec<PushResult>,
}

#[derive(Debug, Deserialize)]
struct PushResult {
    message_id: Option<String>,
    error: Option<String>,
}

/// Gateway error codes meaning the token will never work again.
const DEAD_TOKEN_ERRORS: &[&str] = &["NotRegistered", "InvalidRegistration", "MismatchSenderId"];

pub struct PushSender {
    client: Client,
    gateway_url: String,
    server_key: String,
    hourly_limit: Option<u32>,
    throttle: Option<ProviderThrottle>,
}

impl PushSender {
    pub fn new(client: Client, gateway_url: String, server_key: String) -> Self {
        Self {
            client,
            gateway_url,
            server_key,
            hourly_limit: None,
            throttle: None,
        }
    }

    pub fn with_hourly_limit(mut self, limit: Option<u32>) -> Self {
        self.hourly_limit = limit;
        self
    }

    pub fn with_throttle(mut self, throttle: ProviderThrottle) -> Self {
        self.throttle = Some(throttle);
        self
    }

    fn build_request<'a>(&self, token: &'a str, message: &OutboundMessage) -> PushRequest<'a> {
        let priority = match message.priority {
            Priority::High | Priority::Urgent => "high",
            Priority::Normal | Priority::Low => "normal",
        };
        PushRequest {
            to: token,
            priority,
            notification: PushNotification {
                title: format::push_title(message),
                body: format::push_body(message),
            },
            data: serde_json::json!({
                "broadcast_id": message.broadcast_id,
                "kind": message.kind,
                "related_object": message.related_object,
            }),
        }
    }

    /// Interpret the per-token result of a 200 response.
    fn interpret(result: Option<PushResult>) -> Result<DeliveryReceipt, SendError> {
        match result {
            Some(PushResult {
                message_id: Some(id),
                ..
            }) => Ok(DeliveryReceipt::with_id(id)),
            Some(PushResult {
                error: Some(error), ..
            }) if DEAD_TOKEN_ERRORS.contains(&error.as_str()) => {
                Err(SendError::Permanent(format!("push token rejected: {}", error)))
            }
            Some(PushResult {
                error: Some(error), ..
            }) => Err(SendError::Transient(format!("push gateway error: {}", error))),
            _ => Ok(DeliveryReceipt::default()),
        }
    }
}

#[async_trait]
impl ChannelSender for PushSender {
    fn channel(&self) -> ChannelType {
        ChannelType::Push
    }

    fn recipient_limit(&self) -> Option<RateLimit> {
        self.hourly_limit.map(RateLimit::per_hour)
    }

    async fn send(
        &self,
        recipient: &Recipient,
        message: &OutboundMessage,
    ) -> Result<DeliveryReceipt, SendError> {
        let token = recipient
            .push_token
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| SendError::Permanent("recipient has no push token".into()))?;

        if let Some(throttle) = &self.throttle {
            throttle.acquire(ChannelType::Push).await?;
        }

        let response = self
            .client
            .post(&self.gateway_url)
            .header("Authorization", format!("key={}", self.server_key))
            .json(&self.build_request(token, message))
            .send()
            .await
            .map_err(|e| classify_transport(&e))?;

        let response = check_response(response).await?;
        let body: PushResponse = response
            .json()
            .await
            .map_err(|e| SendError::Transient(format!("unreadable provider response: {}", e)))?;

        Self::interpret(body.results.into_iter().next())
    }
}
