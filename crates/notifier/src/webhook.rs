//! Chat webhook channel via the Telegram Bot API.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use herald_common::types::{ChannelType, OutboundMessage, Recipient};

use crate::format;
use crate::http::{check_response, classify_transport};
use crate::sender::{ChannelSender, DeliveryReceipt, SendError};
use crate::throttle::ProviderThrottle;

const TELEGRAM_API_BASE: &str = "https://api.telegram.org";

#[derive(Debug, Serialize)]
struct SendMessageRequest<'a> {
    chat_id: &'a str,
    text: String,
    disable_web_page_preview: bool,
}

#[derive(Debug, Deserialize)]
struct TelegramResponse {
    ok: bool,
    result: Option<TelegramMessage>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TelegramMessage {
    message_id: i64,
}

pub struct WebhookSender {
    client: Client,
    bot_token: String,
    api_base: String,
    throttle: Option<ProviderThrottle>,
}

impl WebhookSender {
    pub fn new(client: Client, bot_token: String) -> Self {
        Self {
            client,
            bot_token,
            api_base: TELEGRAM_API_BASE.to_string(),
            throttle: None,
        }
    }

    pub fn with_throttle(mut self, throttle: ProviderThrottle) -> Self {
        self.throttle = Some(throttle);
        self
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    fn send_message_url(&self) -> String {
        format!("{}/bot{}/sendMessage", self.api_base, self.bot_token)
    }
}

#[async_trait]
impl ChannelSender for WebhookSender {
    fn channel(&self) -> ChannelType {
        ChannelType::Webhook
    }

    async fn send(
        &self,
        recipient: &Recipient,
        message: &OutboundMessage,
    ) -> Result<DeliveryReceipt, SendError> {
        let chat_id = recipient
            .chat_id
            .as_deref()
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| SendError::Permanent("recipient has no linked chat".into()))?;

        if let Some(throttle) = &self.throttle {
            throttle.acquire(ChannelType::Webhook).await?;
        }

        let request = SendMessageRequest {
            chat_id,
            text: format::chat_text(message),
            disable_web_page_preview: true,
        };

        // 403 means the user blocked the bot: permanent, handled by check_response.
        let response = self
            .client
            .post(self.send_message_url())
            .json(&request)
            .send()
            .await
            .map_err(|e| classify_transport(&e))?;

        let response = check_response(response).await?;
        let body: TelegramResponse = response
            .json()
            .await
            .map_err(|e| SendError::Transient(format!("unreadable provider response: {}", e)))?;

        match body {
            TelegramResponse {
                ok: true,
                result: Some(msg),
                ..
            } => Ok(DeliveryReceipt::with_id(msg.message_id.to_string())),
            TelegramResponse { ok: true, .. } => Ok(DeliveryReceipt::default()),
            TelegramResponse { description, .. } => Err(SendError::Permanent(
                description.unwrap_or_else(|| "telegram rejected the message".to_string()),
            )),
        }
    }
}
