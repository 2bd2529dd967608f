//! Channel senders for the broadcast pipeline.
//!
//! - `in_app` : inbox rows in Postgres
//! - `email`  : Resend HTTP API
//! - `sms`    : Twilio Messages API
//! - `push`   : FCM-compatible gateway
//! - `webhook`: Telegram Bot API
//!
//! All of them implement [`ChannelSender`] and report failures as
//! [`SendError`], classified transient vs permanent.

pub mod email;
pub mod format;
pub mod http;
pub mod in_app;
pub mod push;
pub mod sender;
pub mod sms;
pub mod throttle;
pub mod webhook;

pub use sender::{ChannelRegistry, ChannelSender, DeliveryReceipt, RateLimit, SendError};
