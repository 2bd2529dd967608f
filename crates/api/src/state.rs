//! Shared application state for the Axum API server.

use std::sync::Arc;

use herald_common::config::AppConfig;
use herald_engine::broadcast::BroadcastService;
use herald_engine::store::DeliveryStore;
use sqlx::PgPool;

/// Application state shared across all route handlers via Axum `State`.
#[derive(Clone)]
pub struct AppState {
    /// Used for API key lookups against `users`.
    pub pool: PgPool,
    pub config: AppConfig,
    pub broadcasts: Arc<BroadcastService>,
}

impl AppState {
    pub fn new(pool: PgPool, config: AppConfig, store: Arc<dyn DeliveryStore>) -> Self {
        let broadcasts = Arc::new(BroadcastService::new(store, &config.pipeline));
        Self {
            pool,
            config,
            broadcasts,
        }
    }
}
