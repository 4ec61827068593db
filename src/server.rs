// server.rs
//! HTTP surface: one fallback handler feeding every request into the pipeline.
//!
//! Routing by path and method is the pipeline's first step, so the router has
//! no routes of its own. Path and method are checked before the body is read;
//! a body that can't be read (too large, broken stream) gets the pipeline's
//! 500. A panic anywhere below is turned into that same 500 response and the
//! listener keeps serving.

use axum::body::{to_bytes, Body};
use axum::extract::{Request, State};
use axum::response::{IntoResponse, Response};
use axum::Router;
use std::any::Any;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, warn};

use crate::webhook::{validation_failed, WebhookPipeline};

/// GitHub caps webhook payloads at 25 MB.
const MAX_PAYLOAD_BYTES: usize = 25 * 1024 * 1024;

pub fn build_router(pipeline: WebhookPipeline) -> Router {
    Router::new()
        .fallback(handle_request)
        .with_state(pipeline)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CatchPanicLayer::custom(handle_panic)),
        )
}

pub async fn serve(listener: TcpListener, pipeline: WebhookPipeline) -> anyhow::Result<()> {
    axum::serve(listener, build_router(pipeline)).await?;
    Ok(())
}

async fn handle_request(
    State(pipeline): State<WebhookPipeline>,
    request: Request<Body>,
) -> Response {
    let (parts, body) = request.into_parts();
    if let Err(e) = pipeline.check_route(&parts.method, parts.uri.path()) {
        return e.into_response();
    }

    let body = match to_bytes(body, MAX_PAYLOAD_BYTES).await {
        Ok(body) => body,
        Err(e) => {
            warn!(error = %e, "Failed to read webhook body");
            return validation_failed();
        }
    };

    pipeline
        .handle(&parts.method, parts.uri.path(), &parts.headers, &body)
        .await
        .into_response()
}

fn handle_panic(err: Box<dyn Any + Send + 'static>) -> Response {
    let detail = err
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| err.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic");
    error!(detail, "Request handler panicked");
    validation_failed()
}
