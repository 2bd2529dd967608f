use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

/// Global application configuration loaded from environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// PostgreSQL connection string
    pub database_url: String,

    /// Redis connection string (provider-side throttle)
    pub redis_url: String,

    /// Maximum number of PostgreSQL connections in the pool (default: 20)
    pub db_max_connections: u32,

    /// JWT secret for API authentication
    pub jwt_secret: String,

    /// Port the API server binds to (default: 3000)
    pub api_port: u16,

    /// Resend API key for email delivery
    pub resend_api_key: Option<String>,

    /// Email sender address
    pub email_from: Option<String>,

    /// Twilio account SID for SMS delivery
    pub twilio_account_sid: Option<String>,

    /// Twilio auth token
    pub twilio_auth_token: Option<String>,

    /// Sender number for outbound SMS
    pub sms_from_number: Option<String>,

    /// FCM-compatible push gateway endpoint
    pub push_gateway_url: Option<String>,

    /// Server key for the push gateway
    pub push_server_key: Option<String>,

    /// Telegram bot token (chat webhook channel)
    pub telegram_bot_token: Option<String>,

    /// Broadcast pipeline tuning
    pub pipeline: PipelineConfig,
}

/// Tuning knobs for the broadcast delivery pipeline.
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// Scheduler tick period in seconds
    pub tick_interval_secs: u64,
    /// Records claimed per dispatch batch
    pub send_batch_size: u32,
    /// Width of the dispatch worker pool
    pub dispatch_concurrency: usize,
    /// Upper bound on dispatch batches drained in one tick
    pub max_batches_per_tick: u32,
    /// Hard timeout for a single channel send, in seconds
    pub send_timeout_secs: u64,
    /// Rows per materializer transaction
    pub materialize_batch_size: usize,
    /// Attempt ceiling per delivery record
    pub max_attempts: i32,
    /// Backoff base delay in seconds
    pub retry_base_delay_secs: u64,
    /// Backoff multiplier applied per attempt
    pub retry_backoff_multiplier: f64,
    /// Backoff cap in seconds
    pub retry_max_delay_secs: u64,
    /// Age after which a `processing` record is presumed abandoned
    pub stall_threshold_secs: u64,
    /// Terminal delivery records older than this are purged
    pub retention_days: i64,
    /// How often the purge step runs
    pub purge_interval_hours: i64,
    /// Per-recipient SMS limit per trailing hour
    pub sms_hourly_limit: Option<u32>,
    /// Per-recipient push limit per trailing hour
    pub push_hourly_limit: Option<u32>,
    /// Provider-side sends per minute per channel
    pub provider_rate_per_minute: u32,
    /// Largest accepted explicit recipient list
    pub max_custom_recipients: usize,
    /// Failure ratio above which a finished broadcast is marked `failed`
    pub failure_threshold: Option<f64>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: 60,
            send_batch_size: 100,
            dispatch_concurrency: 8,
            max_batches_per_tick: 50,
            send_timeout_secs: 30,
            materialize_batch_size: 1000,
            max_attempts: 3,
            retry_base_delay_secs: 300,
            retry_backoff_multiplier: 2.0,
            retry_max_delay_secs: 86_400,
            stall_threshold_secs: 300,
            retention_days: 30,
            purge_interval_hours: 24,
            sms_hourly_limit: Some(10),
            push_hourly_limit: None,
            provider_rate_per_minute: 600,
            max_custom_recipients: 100_000,
            failure_threshold: None,
        }
    }
}

impl PipelineConfig {
    /// Load pipeline settings from the environment, falling back to defaults.
    pub fn from_env() -> anyhow::Result<Self> {
        let d = Self::default();

        let failure_threshold = optional_env::<f64>("BROADCAST_FAILURE_THRESHOLD")?;
        if let Some(t) = failure_threshold
            && !(0.0..=1.0).contains(&t)
        {
            anyhow::bail!("BROADCAST_FAILURE_THRESHOLD must be between 0 and 1");
        }

        Ok(Self {
            tick_interval_secs: env_or("SCHEDULER_TICK_SECS", d.tick_interval_secs)?,
            send_batch_size: env_or("SEND_BATCH_SIZE", d.send_batch_size)?,
            dispatch_concurrency: env_or("DISPATCH_CONCURRENCY", d.dispatch_concurrency)?.max(1),
            max_batches_per_tick: env_or("MAX_BATCHES_PER_TICK", d.max_batches_per_tick)?,
            send_timeout_secs: env_or("SEND_TIMEOUT_SECS", d.send_timeout_secs)?,
            materialize_batch_size: env_or("MATERIALIZE_BATCH_SIZE", d.materialize_batch_size)?
                .max(1),
            max_attempts: env_or("MAX_ATTEMPTS", d.max_attempts)?.max(1),
            retry_base_delay_secs: env_or("RETRY_BASE_DELAY_SECS", d.retry_base_delay_secs)?,
            retry_backoff_multiplier: env_or(
                "RETRY_BACKOFF_MULTIPLIER",
                d.retry_backoff_multiplier,
            )?,
            retry_max_delay_secs: env_or("RETRY_MAX_DELAY_SECS", d.retry_max_delay_secs)?,
            stall_threshold_secs: env_or("STALL_THRESHOLD_SECS", d.stall_threshold_secs)?,
            retention_days: env_or("RETENTION_DAYS", d.retention_days)?,
            purge_interval_hours: env_or("PURGE_INTERVAL_HOURS", d.purge_interval_hours)?,
            sms_hourly_limit: optional_env("SMS_HOURLY_LIMIT")?.or(d.sms_hourly_limit),
            push_hourly_limit: optional_env("PUSH_HOURLY_LIMIT")?,
            provider_rate_per_minute: env_or(
                "PROVIDER_RATE_PER_MINUTE",
                d.provider_rate_per_minute,
            )?,
            max_custom_recipients: env_or("MAX_CUSTOM_RECIPIENTS", d.max_custom_recipients)?,
            failure_threshold,
        })
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }

    pub fn stall_threshold(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.stall_threshold_secs as i64)
    }
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            database_url: std::env::var("DATABASE_URL")
                .map_err(|_| anyhow::anyhow!("DATABASE_URL environment variable is required"))?,
            redis_url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            db_max_connections: env_or("DB_MAX_CONNECTIONS", 20)?,
            // The scheduler never issues tokens, so an unset secret only fails the API.
            jwt_secret: std::env::var("JWT_SECRET").unwrap_or_default(),
            api_port: env_or("API_PORT", 3000)?,
            resend_api_key: std::env::var("RESEND_API_KEY").ok(),
            email_from: std::env::var("EMAIL_FROM").ok(),
            twilio_account_sid: std::env::var("TWILIO_ACCOUNT_SID").ok(),
            twilio_auth_token: std::env::var("TWILIO_AUTH_TOKEN").ok(),
            sms_from_number: std::env::var("SMS_FROM_NUMBER").ok(),
            push_gateway_url: std::env::var("PUSH_GATEWAY_URL").ok(),
            push_server_key: std::env::var("PUSH_SERVER_KEY").ok(),
            telegram_bot_token: std::env::var("TELEGRAM_BOT_TOKEN").ok(),
            pipeline: PipelineConfig::from_env()?,
        })
    }

    /// Fail unless a JWT secret is configured. Called by the API at startup.
    pub fn require_jwt_secret(&self) -> anyhow::Result<()> {
        if self.jwt_secret.is_empty() {
            anyhow::bail!("JWT_SECRET environment variable is required");
        }
        Ok(())
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> anyhow::Result<T> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("{} has an invalid value: {:?}", key, raw)),
        Err(_) => Ok(default),
    }
}

fn optional_env<T: FromStr>(key: &str) -> anyhow::Result<Option<T>> {
    match std::env::var(key) {
        Ok(raw) if raw.trim().is_empty() => Ok(None),
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| anyhow::anyhow!("{} has an invalid value: {:?}", key, raw)),
        Err(_) => Ok(None),
    }
}
