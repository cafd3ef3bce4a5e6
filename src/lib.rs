//! fedinbox - subscription scheduler and ingestion pipeline for a
//! federated inbox
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 Scheduler (background loop)                  │
//! │  - Selects due subscriptions, connects them serially        │
//! │  - Trims expired messages                                   │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Service Layer                            │
//! │  - Transport negotiation and import                         │
//! │  - Chain resolution, deduplication, moderation rules        │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌──────────────────────────────┬──────────────────────────────┐
//! │        Federation            │          Data Layer          │
//! │  ActivityPub, WebSub, RSS    │  SQLite (sqlx), task queue   │
//! └──────────────────────────────┴──────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - `service`: Scheduler, ingestion and moderation
//! - `federation`: Remote documents and transport adapters
//! - `data`: Records, storage traits and the SQLite implementation
//! - `config`: Configuration management
//! - `metrics`: Prometheus metrics
//! - `error`: Error types

pub mod config;
pub mod data;
pub mod error;
pub mod federation;
pub mod metrics;
pub mod service;

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::IntoResponse;

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<config::AppConfig>,

    /// Subscription lifecycle and push receipt
    pub subscriptions: service::SubscriptionService,
}

/// Build the Axum router with all routes.
///
/// Shared by the binary and integration tests.
pub fn build_router(state: AppState) -> axum::Router {
    use axum::Router;
    use axum::routing::get;
    use tower_http::trace::TraceLayer;

    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_handler))
        .route(
            "/websub/:subscription_id",
            get(websub_verify).post(websub_receive),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check() -> &'static str {
    "OK"
}

async fn metrics_handler() -> Result<impl IntoResponse, error::AppError> {
    let body = metrics::render()?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    ))
}

/// Hub verification of a subscribe/unsubscribe intent
async fn websub_verify(
    State(state): State<AppState>,
    Path(subscription_id): Path<String>,
    Query(query): Query<federation::IntentQuery>,
) -> Result<String, error::AppError> {
    state
        .subscriptions
        .verify_intent(&subscription_id, &query)
        .await
}

/// Content pushed by a hub
async fn websub_receive(
    State(state): State<AppState>,
    Path(subscription_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, error::AppError> {
    let signature = headers
        .get("x-hub-signature")
        .and_then(|value| value.to_str().ok());
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("application/xml");

    let stored = state
        .subscriptions
        .receive_websub(&subscription_id, signature, content_type, &body)
        .await?;
    tracing::debug!(subscription_id = %subscription_id, stored, "WebSub content received");

    Ok(StatusCode::NO_CONTENT)
}
