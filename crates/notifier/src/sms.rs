//! SMS channel via the Twilio Messages API.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;

use herald_common::types::{ChannelType, OutboundMessage, Recipient};

use crate::format;
use crate::http::{check_response, classify_transport};
use crate::sender::{ChannelSender, DeliveryReceipt, RateLimit, SendError};
use crate::throttle::ProviderThrottle;

const TWILIO_API_BASE: &str = "https://api.twilio.com/2010-04-01";

#[derive(Debug, Deserialize)]
struct TwilioMessage {
    sid: String,
}

pub struct SmsSender {
    client: Client,
    account_sid: String,
    auth_token: String,
    from_number: String,
    api_base: String,
    hourly_limit: Option<u32>,
    throttle: Option<ProviderThrottle>,
}

impl SmsSender {
    pub fn new(client: Client, account_sid: String, auth_token: String, from_number: String) -> Self {
        Self {
            client,
            account_sid,
            auth_token,
            from_number,
            api_base: TWILIO_API_BASE.to_string(),
            hourly_limit: None,
            throttle: None,
        }
    }

    /// Cap deliveries per recipient per trailing hour.
    pub fn with_hourly_limit(mut self, limit: Option<u32>) -> Self {
        self.hourly_limit = limit;
        self
    }

    pub fn with_throttle(mut self, throttle: ProviderThrottle) -> Self {
        self.throttle = Some(throttle);
        self
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    fn messages_url(&self) -> String {
        format!("{}/Accounts/{}/Messages.json", self.api_base, self.account_sid)
    }

    /// Rough E.164 check: leading `+`, 8–15 digits.
    fn is_plausible_number(phone: &str) -> bool {
        let Some(digits) = phone.strip_prefix('+') else {
            return false;
        };
        (8..=15).contains(&digits.len()) && digits.chars().all(|c| c.is_ascii_digit())
    }
}

#[async_trait]
impl ChannelSender for SmsSender {
    fn channel(&self) -> ChannelType {
        ChannelType::Sms
    }

    fn recipient_limit(&self) -> Option<RateLimit> {
        self.hourly_limit.map(RateLimit::per_hour)
    }

    async fn send(
        &self,
        recipient: &Recipient,
        message: &OutboundMessage,
    ) -> Result<DeliveryReceipt, SendError> {
        let to = recipient
            .phone
            .as_deref()
            .filter(|p| Self::is_plausible_number(p))
            .ok_or_else(|| SendError::Permanent("recipient has no valid phone number".into()))?;

        if let Some(throttle) = &self.throttle {
            throttle.acquire(ChannelType::Sms).await?;
        }

        let body = format::sms_text(message);
        let form = [("From", self.from_number.as_str()), ("To", to), ("Body", body.as_str())];

        let response = self
            .client
            .post(self.messages_url())
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(&form)
            .send()
            .await
            .map_err(|e| classify_transport(&e))?;

        let response = check_response(response).await?;
        let sent: TwilioMessage = response
            .json()
            .await
            .map_err(|e| SendError::Transient(format!("unreadable provider response: {}", e)))?;

        Ok(DeliveryReceipt::with_id(sent.sid))
    }
}
