use axum::{
    routing::{get, post},
    Router,
};
use secrecy::SecretString;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::stream::StreamSessionController;
use crate::{Result, StreamerError};

use super::api;
use super::auth::AuthLayer;
use super::sse::sse_handler;

pub struct HttpServer {
    controller: StreamSessionController,
    api_key: Option<Arc<SecretString>>,
}

#[derive(Clone)]
pub struct AppState {
    pub controller: StreamSessionController,
}

impl HttpServer {
    pub fn new(controller: StreamSessionController, api_key: Option<SecretString>) -> Self {
        Self {
            controller,
            api_key: api_key.map(Arc::new),
        }
    }

    pub fn router(&self) -> Router {
        let state = AppState {
            controller: self.controller.clone(),
        };

        Router::new()
            .route("/health", get(api::health_check))
            .route("/events", get(sse_handler))
            .route("/api/displays", get(api::list_displays))
            .route("/api/displays/refresh", post(api::refresh_displays))
            .route("/api/streams", get(api::list_streams))
            .route("/api/streams/:name", get(api::get_stream))
            .route("/api/streams/:name/start", post(api::start_stream))
            .route("/api/streams/:name/stop", post(api::stop_stream))
            .with_state(state)
            .layer(CorsLayer::permissive())
            .layer(TraceLayer::new_for_http())
            .layer(AuthLayer::new(self.api_key.clone()))
    }

    /// Serve until `shutdown` resolves.
    pub async fn run<F>(self, addr: SocketAddr, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let app = self.router();
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| StreamerError::Network(format!("Failed to bind to {}: {}", addr, e)))?;
        info!("q8-streamer HTTP server listening on http://{}", addr);

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| StreamerError::Network(format!("Server error: {}", e)))?;

        Ok(())
    }
}
