//! HTTP surface for pairhub.
//!
//! Maps the session API onto [`SessionOrchestrator`](pairhub_core::SessionOrchestrator)
//! calls and streams lifecycle notices over WebSocket.
//!
//! | Route                  | Method | Purpose                          |
//! |------------------------|--------|----------------------------------|
//! | `/api/start`           | GET    | idempotent session start         |
//! | `/api/qr`              | GET    | pairing code status              |
//! | `/api/status`          | GET    | readiness and admin identity     |
//! | `/api/send`            | POST   | send a text message              |
//! | `/api/disconnect`      | POST   | log out and start a new pairing  |
//! | `/api/sessions`        | GET    | snapshot of every session        |
//! | `/ws/events`           | GET    | lifecycle notice stream          |

mod routes;
mod state;
mod websocket;

use axum::{
    http::{header, Method},
    routing::{get, post},
    Router,
};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

pub use routes::{ApiError, MessageResponse};
pub use state::SharedState;

/// Build the application router.
pub fn router(state: Arc<SharedState>) -> Router {
    Router::new()
        .route("/api/start", get(routes::start))
        .route("/api/qr", get(routes::qr))
        .route("/api/status", get(routes::status))
        .route("/api/send", post(routes::send))
        .route("/api/disconnect", post(routes::disconnect))
        .route("/api/sessions", get(routes::sessions))
        .route("/ws/events", get(websocket::ws_handler))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([Method::GET, Method::POST])
                .allow_headers([header::CONTENT_TYPE]),
        )
        .with_state(state)
}

/// Bind `addr` and serve until `shutdown` resolves.
pub async fn serve(
    state: Arc<SharedState>,
    addr: SocketAddr,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    log::info!("HTTP server listening on http://{}", listener.local_addr()?);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            shutdown.await;
            log::info!("HTTP server shutting down");
        })
        .await
}
