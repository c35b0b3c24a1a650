use super::app_error::AppError;
use super::state::HttpServerState;
use crate::parsing::{parse_remote_write_request, to_incoming_series};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use tokio_util::bytes::Bytes;
use tracing::warn;

fn verify_write_headers(headers: &HeaderMap) -> Result<(), AppError> {
    match headers.get("content-encoding") {
        Some(content_encoding) => match content_encoding.to_str() {
            Ok("snappy") | Ok("SNAPPY") => {}
            _ => {
                return Err(AppError::bad_request(anyhow::anyhow!(
                    "Unsupported content-encoding, must be snappy"
                )));
            }
        },
        None => {
            return Err(AppError::bad_request(anyhow::anyhow!(
                "Missing content-encoding header"
            )));
        }
    }

    match headers.get("content-type") {
        Some(content_type) => match content_type.to_str() {
            Ok("application/x-protobuf") | Ok("APPLICATION/X-PROTOBUF") => {}
            _ => {
                return Err(AppError::bad_request(anyhow::anyhow!(
                    "Unsupported content-type, must be application/x-protobuf"
                )));
            }
        },
        None => {
            return Err(AppError::bad_request(anyhow::anyhow!(
                "Missing content-type header"
            )));
        }
    }

    match headers.get("x-prometheus-remote-write-version") {
        Some(version) => match version.to_str() {
            Ok("0.1.0") => {}
            _ => {
                return Err(AppError::bad_request(anyhow::anyhow!(
                    "Unsupported x-prometheus-remote-write-version, must be 0.1.0"
                )));
            }
        },
        None => {
            return Err(AppError::bad_request(anyhow::anyhow!(
                "Missing x-prometheus-remote-write-version header"
            )));
        }
    }

    Ok(())
}

/// Prometheus Remote Write API.
///
/// It follows the [Prometheus Remote Write specification](https://prometheus.io/docs/concepts/remote_write_spec/).
/// Partial per-series failures are logged and do not fail the request;
/// only structurally invalid input does.
#[utoipa::path(
    post,
    path = "/api/v1/write",
    tag = "Prometheus",
    request_body(
        content = Vec<u8>,
        content_type = "application/x-protobuf",
        description = "Snappy-compressed Prometheus Remote Write payload",
    ),
    params(
        ("content-encoding" = String, Header, description = "Content encoding, must be snappy"),
        ("content-type" = String, Header, description = "Content type, must be application/x-protobuf"),
        ("x-prometheus-remote-write-version" = String, Header, description = "Remote write version, must be 0.1.0"),
    ),
    responses(
        (status = 204, description = "No Content"),
        (status = 400, description = "Bad Request", body = AppError),
        (status = 500, description = "Internal Server Error", body = AppError),
    )
)]
pub async fn prometheus_remote_write(
    State(state): State<HttpServerState>,
    headers: HeaderMap,
    bytes: Bytes,
) -> Result<StatusCode, AppError> {
    verify_write_headers(&headers)?;

    let request = parse_remote_write_request(&bytes).map_err(AppError::bad_request)?;
    let series = to_incoming_series(request);

    let outcome = state
        .pipeline
        .ingest(series)
        .await
        .map_err(AppError::bad_request)?;

    if !outcome.is_fully_accepted() {
        for (metric, error) in &outcome.metric_errors {
            warn!(metric, error = %error, "rows rejected during ingestion");
        }
        warn!(
            accepted = outcome.accepted_rows,
            rejected = outcome.rejected_rows,
            "write request partially rejected"
        );
    }

    Ok(StatusCode::NO_CONTENT)
}
