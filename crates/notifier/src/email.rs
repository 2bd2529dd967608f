//! Email channel via the Resend HTTP API.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use herald_common::types::{ChannelType, OutboundMessage, Recipient};

use crate::format;
use crate::http::{check_response, classify_transport};
use crate::sender::{ChannelSender, DeliveryReceipt, SendError};
use crate::throttle::ProviderThrottle;

const RESEND_API_URL: &str = "https://api.resend.com/emails";

#[derive(Debug, Serialize)]
struct ResendRequest<'a> {
    from: &'a str,
    to: [&'a str; 1],
    subject: String,
    text: String,
}

#[derive(Debug, Deserialize)]
struct ResendResponse {
    id: String,
}

pub struct EmailSender {
    client: Client,
    api_key: String,
    from: String,
    endpoint: String,
    throttle: Option<ProviderThrottle>,
}

impl EmailSender {
    pub fn new(client: Client, api_key: String, from: String) -> Self {
        Self {
            client,
            api_key,
            from,
            endpoint: RESEND_API_URL.to_string(),
            throttle: None,
        }
    }

    pub fn with_throttle(mut self, throttle: ProviderThrottle) -> Self {
        self.throttle = Some(throttle);
        self
    }

    /// Point at a different endpoint (staging or a local mock).
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    fn build_request<'a>(&'a self, to: &'a str, message: &OutboundMessage) -> ResendRequest<'a> {
        ResendRequest {
            from: &self.from,
            to: [to],
            subject: format::email_subject(message),
            text: message.body.clone(),
        }
    }
}

#[async_trait]
impl ChannelSender for EmailSender {
    fn channel(&self) -> ChannelType {
        ChannelType::Email
    }

    async fn send(
        &self,
        recipient: &Recipient,
        message: &OutboundMessage,
    ) -> Result<DeliveryReceipt, SendError> {
        let to = recipient
            .email
            .as_deref()
            .filter(|e| e.contains('@'))
            .ok_or_else(|| SendError::Permanent("recipient has no valid email address".into()))?;

        if let Some(throttle) = &self.throttle {
            throttle.acquire(ChannelType::Email).await?;
        }

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&self.build_request(to, message))
            .send()
            .await
            .map_err(|e| classify_transport(&e))?;

        let response = check_response(response).await?;
        let body: ResendResponse = response
            .json()
            .await
            .map_err(|e| SendError::Transient(format!("unreadable provider response: {}", e)))?;

        Ok(DeliveryReceipt::with_id(body.id))
    }
}
