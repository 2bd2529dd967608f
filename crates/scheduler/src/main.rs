//! Herald scheduler: drives the broadcast pipeline.
//!
//! Runs a tick every `SCHEDULER_TICK_SECS`, or exactly one tick with
//! `--once` for deployments where cron or a job runner triggers it.

use std::sync::Arc;

use chrono::Utc;
use redis::aio::ConnectionManager;

use herald_common::config::AppConfig;
use herald_common::db;
use herald_common::redis_pool::create_redis_pool;
use herald_engine::directory::PgDirectory;
use herald_engine::scheduler::Scheduler;
use herald_engine::store::{CompletionPolicy, PgStore};
use herald_notifier::ChannelRegistry;
use herald_notifier::email::EmailSender;
use herald_notifier::http::build_client;
use herald_notifier::in_app::InAppSender;
use herald_notifier::push::PushSender;
use herald_notifier::sms::SmsSender;
use herald_notifier::throttle::ProviderThrottle;
use herald_notifier::webhook::WebhookSender;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "herald_scheduler=info,herald_engine=info,herald_notifier=info".into()
            }),
        )
        .json()
        .init();

    let once = std::env::args().skip(1).any(|arg| arg == "--once");
    tracing::info!(once, "Herald scheduler starting...");

    let config = AppConfig::from_env()?;

    let pool = db::create_pool(&config.database_url, config.db_max_connections).await?;
    db::run_migrations(&pool).await?;

    let redis = match create_redis_pool(&config.redis_url).await {
        Ok(manager) => Some(manager),
        Err(e) => {
            tracing::warn!(error = %e, "Redis unavailable, provider throttle disabled");
            None
        }
    };

    let senders = build_senders(&config, pool.clone(), redis)?;
    tracing::info!(channels = ?senders.channels(), "Channel senders registered");

    let store = Arc::new(PgStore::new(
        pool.clone(),
        CompletionPolicy::new(config.pipeline.failure_threshold),
    ));
    let directory = Arc::new(PgDirectory::new(pool));
    let scheduler = Scheduler::new(store, directory, senders, &config.pipeline);

    if once {
        let report = scheduler.tick(Utc::now()).await;
        tracing::info!(
            promoted = report.promoted,
            materialized = report.materialized,
            sent = report.dispatch.sent,
            failed = report.dispatch.failed + report.retry.failed,
            purged = ?report.purged,
            "Single tick finished"
        );
        return Ok(());
    }

    tokio::select! {
        _ = scheduler.run() => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal, stopping gracefully...");
        }
    }

    tracing::info!("Herald scheduler stopped.");
    Ok(())
}

/// In-app delivery is always available; external channels are registered
/// only when their credentials are configured.
fn build_senders(
    config: &AppConfig,
    pool: sqlx::PgPool,
    redis: Option<ConnectionManager>,
) -> anyhow::Result<ChannelRegistry> {
    let pipeline = &config.pipeline;
    let client = build_client(pipeline.send_timeout())?;
    let throttle = |redis: &ConnectionManager| {
        ProviderThrottle::per_minute(redis.clone(), pipeline.provider_rate_per_minute)
    };

    let mut registry = ChannelRegistry::new().with(Arc::new(InAppSender::new(pool)));

    if let (Some(api_key), Some(from)) = (&config.resend_api_key, &config.email_from) {
        let mut sender = EmailSender::new(client.clone(), api_key.clone(), from.clone());
        if let Some(redis) = &redis {
            sender = sender.with_throttle(throttle(redis));
        }
        registry.register(Arc::new(sender));
    }

    if let (Some(sid), Some(token), Some(from)) = (
        &config.twilio_account_sid,
        &config.twilio_auth_token,
        &config.sms_from_number,
    ) {
        let mut sender = SmsSender::new(client.clone(), sid.clone(), token.clone(), from.clone())
            .with_hourly_limit(pipeline.sms_hourly_limit);
        if let Some(redis) = &redis {
            sender = sender.with_throttle(throttle(redis));
        }
        registry.register(Arc::new(sender));
    }

    if let (Some(url), Some(key)) = (&config.push_gateway_url, &config.push_server_key) {
        let mut sender = PushSender::new(client.clone(), url.clone(), key.clone())
            .with_hourly_limit(pipeline.push_hourly_limit);
        if let Some(redis) = &redis {
            sender = sender.with_throttle(throttle(redis));
        }
        registry.register(Arc::new(sender));
    }

    if let Some(token) = &config.telegram_bot_token {
        let mut sender = WebhookSender::new(client, token.clone());
        if let Some(redis) = &redis {
            sender = sender.with_throttle(throttle(redis));
        }
        registry.register(Arc::new(sender));
    }

    Ok(registry)
}
