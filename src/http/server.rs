use super::app_error::AppError;
use super::health::{liveness, readiness};
use super::prometheus::prometheus_remote_write;
use super::state::HttpServerState;
use crate::config;
use anyhow::Result;
use axum::extract::DefaultBodyLimit;
use axum::http::header;
use axum::routing::{get, post};
use axum::{Json, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::{timeout::TimeoutLayer, trace, trace::TraceLayer, ServiceBuilderExt};
use tracing::Level;

pub async fn run_http_server(state: HttpServerState, address: SocketAddr) -> Result<()> {
    let config = config::get()?;
    let max_body_layer = DefaultBodyLimit::max(config.parse_http_body_limit()?);
    let timeout_seconds = config.http_server_timeout_seconds;

    // List of headers that shouldn't be logged
    let sensitive_headers: Arc<[_]> = vec![header::AUTHORIZATION, header::COOKIE].into();

    let middleware = ServiceBuilder::new()
        .sensitive_request_headers(sensitive_headers.clone())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(trace::DefaultMakeSpan::new().level(Level::INFO))
                .on_response(trace::DefaultOnResponse::new().level(Level::INFO)),
        )
        .sensitive_response_headers(sensitive_headers)
        .layer(TimeoutLayer::new(Duration::from_secs(timeout_seconds)))
        .into_inner();

    let app = Router::new()
        .route("/", get(handler))
        .route("/health/live", get(liveness))
        .route("/health/ready", get(readiness))
        // Prometheus Remote Write API
        .route(
            "/api/v1/write",
            post(prometheus_remote_write).layer(max_body_layer),
        )
        .layer(middleware)
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(address).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install shutdown CTRL+C signal handler");
}

async fn handler() -> Result<Json<String>, AppError> {
    Ok(Json("tsbridge".to_string()))
}
