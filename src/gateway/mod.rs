//! HTTP Gateway
//!
//! Thin axum surface over [`LedgerEngine`]. Caller identity is taken from
//! request fields; authentication belongs to the deployment in front.

pub mod handlers;
pub mod types;

use axum::{
    Router,
    routing::{get, post},
};
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

use crate::config::GatewayConfig;
use crate::engine::LedgerEngine;

/// Build the gateway router
pub fn router(engine: Arc<LedgerEngine>) -> Router {
    let api = Router::new()
        // Wallets
        .route("/wallets", post(handlers::open_wallet))
        .route("/wallets/{wallet_id}/balance", get(handlers::get_balance))
        // Transfers
        .route("/transfers", post(handlers::create_transfer))
        .route("/transfers/{transfer_id}", get(handlers::get_transfer))
        .route(
            "/transfers/{transfer_id}/review",
            post(handlers::review_transfer),
        )
        .route("/fx-transfers", post(handlers::create_fx_transfer))
        // Funding
        .route("/deposits", post(handlers::create_deposit))
        .route("/withdrawals", post(handlers::request_withdrawal))
        .route("/withdrawals/approve", post(handlers::approve_withdrawal))
        // Card holds
        .route("/holds", post(handlers::authorize_hold))
        .route("/holds/{card_tx_id}/capture", post(handlers::capture_hold))
        .route("/holds/{card_tx_id}/reverse", post(handlers::reverse_hold))
        // Corrections
        .route("/reversals", post(handlers::create_reversal))
        .route("/adjustments", post(handlers::create_adjustment))
        // Health check
        .route("/health", get(handlers::health_check));

    Router::new().nest("/api/v1", api).with_state(engine)
}

/// Serve until `shutdown` resolves
pub async fn run_server(
    config: &GatewayConfig,
    engine: Arc<LedgerEngine>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to bind to {}: {}", addr, e))?;

    info!(addr = %addr, store = engine.store_name(), "Gateway listening");
    axum::serve(listener, router(engine))
        .with_graceful_shutdown(shutdown)
        .await?;
    info!("Gateway stopped");
    Ok(())
}
