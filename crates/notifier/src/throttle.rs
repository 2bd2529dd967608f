//! Provider-side throttle: Redis-backed fixed-window counters per channel.
//!
//! Providers cap how fast one account may send. Every sender instance across
//! every scheduler process shares one counter per channel per window, so the
//! cap holds globally. Uses `INCR` + `EXPIRE` in one atomic pipeline.

use std::time::Duration;

use chrono::Utc;
use redis::aio::ConnectionManager;

use herald_common::types::ChannelType;

use crate::sender::SendError;

#[derive(Clone)]
pub struct ProviderThrottle {
    redis: ConnectionManager,
    max_per_window: u32,
    window_secs: u64,
}

impl ProviderThrottle {
    pub fn new(redis: ConnectionManager, max_per_window: u32, window: Duration) -> Self {
        Self {
            redis,
            max_per_window,
            window_secs: window.as_secs().max(1),
        }
    }

    pub fn per_minute(redis: ConnectionManager, max: u32) -> Self {
        Self::new(redis, max, Duration::from_secs(60))
    }

    /// Take one slot for `channel` in the current window.
    ///
    /// Returns `RateLimited` with the time left in the window when the slot
    /// budget is spent. A Redis failure lets the send through: losing the
    /// limiter must not stall delivery.
    pub async fn acquire(&self, channel: ChannelType) -> Result<(), SendError> {
        let now = Utc::now().timestamp().max(0) as u64;
        let (key, remaining) = Self::window_key(channel, now, self.window_secs);

        let mut conn = self.redis.clone();
        let result: redis::RedisResult<(u64,)> = redis::pipe()
            .atomic()
            .incr(&key, 1u64)
            .expire(&key, self.window_secs as i64)
            .ignore()
            .query_async(&mut conn)
            .await;

        match result {
            Ok((count,)) if count > self.max_per_window as u64 => {
                tracing::debug!(
                    channel = %channel,
                    count,
                    limit = self.max_per_window,
                    "Provider throttle exhausted for current window"
                );
                Err(SendError::RateLimited {
                    retry_after: Duration::from_secs(remaining),
                })
            }
            Ok(_) => Ok(()),
            Err(e) => {
                tracing::warn!(channel = %channel, error = %e, "Provider throttle unavailable, sending anyway");
                Ok(())
            }
        }
    }

    /// Key for the window containing `now`, plus seconds until it closes.
    fn window_key(channel: ChannelType, now: u64, window_secs: u64) -> (String, u64) {
        let window_start = now - now % window_secs;
        let remaining = window_start + window_secs - now;
        (
            format!("provider:throttle:{}:{}", channel, window_start),
            remaining,
        )
    }
}
