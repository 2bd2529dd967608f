//! HTTP control surface for the broadcast pipeline.
//!
//! Endpoints:
//! - `POST /api/broadcasts`: create a draft broadcast
//! - `POST /api/notifications`: schedule a single-recipient notification
//! - `GET  /api/broadcasts/{id}`: broadcast row with counters
//! - `GET  /api/broadcasts/{id}/progress`: live progress snapshot
//! - `POST /api/broadcasts/{id}/cancel`: stop remaining deliveries
//! - `POST /api/broadcasts/{id}/retry`: requeue failed deliveries
//! - `GET  /api/broadcasts/{id}/recipients`: paged delivery records
//! - `GET  /health`, `GET /health/ready`

pub mod middleware;
pub mod routes;
pub mod state;
