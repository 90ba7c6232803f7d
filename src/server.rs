use crate::config::ApiConfig;
use crate::counter::HashtagCounter;
use crate::error::Result;
use crate::handlers::{
    count, count_default, health_check, method_not_allowed, not_found, reset, reset_without_filter, AppState,
    SharedState,
};
use crate::middleware::logging_middleware;
use crate::redis::RedisStore;
use axum::routing::{delete, get};
use axum::{middleware, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Builds the query API router over an existing state
pub fn create_app(state: SharedState) -> Router {
    Router::new()
        .route("/count", get(count_default).fallback(method_not_allowed))
        .route("/count/:num_results", get(count).fallback(method_not_allowed))
        .route("/reset", delete(reset_without_filter).fallback(method_not_allowed))
        .route("/reset/", delete(reset_without_filter).fallback(method_not_allowed))
        .route("/reset/:tweet_filter", delete(reset).fallback(method_not_allowed))
        .route("/health", get(health_check).fallback(method_not_allowed))
        .fallback(not_found)
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive())
                .layer(middleware::from_fn(logging_middleware)),
        )
}

pub struct Server {
    app: Router,
    bind_addr: SocketAddr,
}

impl Server {
    pub async fn new(config: ApiConfig) -> Result<Self> {
        let store = Arc::new(RedisStore::connect(&config.redis_url).await?);
        let counter = HashtagCounter::new(store, config.cache_ttl);
        let state = Arc::new(AppState::new(counter, &config.filter));

        Ok(Self {
            app: create_app(state),
            bind_addr: config.bind_addr,
        })
    }

    pub async fn run(self) -> std::io::Result<()> {
        let listener = tokio::net::TcpListener::bind(self.bind_addr).await?;

        tracing::info!("Hashtag count API listening on {}", self.bind_addr);
        tracing::info!("Top hashtags available at /count and /count/{{n}}");

        axum::serve(
            listener,
            self.app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await
    }
}

/// Resolves on Ctrl+C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
        },
    }
}
