//! HTTP API and push channel for the operator console.
//!
//! - `api`: REST handlers over the registry, coordinator and ledger
//! - `websocket`: `{"event", "data"}` frames, push events plus request/reply

mod api;
mod websocket;

use axum::{
    Router,
    routing::{get, post},
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use tokio::sync::broadcast;

use crate::context::AppContext;

pub use api::ApiError;

#[derive(Clone)]
pub struct WebState {
    pub ctx: AppContext,
    /// Open WebSocket connections.
    pub clients: Arc<AtomicUsize>,
}

impl WebState {
    pub fn new(ctx: AppContext) -> Self {
        Self {
            ctx,
            clients: Arc::new(AtomicUsize::new(0)),
        }
    }
}

pub fn router(state: WebState) -> Router {
    Router::new()
        .route("/api/drives", get(api::list_drives))
        .route("/api/drives/{id}", get(api::get_drive))
        .route("/api/drives/{id}/rearm", post(api::rearm_drive))
        .route("/api/wipe/{device_id}", post(api::wipe_drive))
        .route("/api/rescan", post(api::rescan))
        .route("/api/devices/statistics", get(api::device_statistics))
        .route("/api/devices/{id}/wipe-history", get(api::device_history))
        .route("/api/jobs", get(api::list_jobs).post(api::submit_job))
        .route("/api/jobs/{id}", get(api::get_job))
        .route("/api/jobs/{id}/cancel", post(api::cancel_job))
        .route("/api/jobs/{id}/history", get(api::job_history))
        .route("/api/blockchain", get(api::blockchain))
        .route("/api/verify_chain/{certificate_id}", get(api::verify_certificate))
        .route("/api/verify_code", post(api::verify_code))
        .route("/download_certificate/{device_id}", get(api::download_certificate))
        .route("/upload_certificate", post(api::upload_certificate))
        .route("/sync_certificates", post(api::sync_certificates))
        .route("/ws", get(websocket::ws_handler))
        .with_state(state)
}

pub struct WebServer {
    bind_addr: SocketAddr,
    state: WebState,
    shutdown_tx: broadcast::Sender<()>,
}

impl WebServer {
    pub fn new(ctx: AppContext, bind_addr: SocketAddr) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            bind_addr,
            state: WebState::new(ctx),
            shutdown_tx,
        }
    }

    /// Serve until `shutdown()` is called.
    pub async fn start(&self) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(self.bind_addr).await?;
        tracing::info!(addr = %self.bind_addr, "HTTP API listening");

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        axum::serve(listener, router(self.state.clone()))
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
            })
            .await?;

        Ok(())
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}
