//! Gateway router - dispatches HTTP requests to module handlers
//!
//! Routes are not known when the router is built: every request goes through
//! [`handle_gateway_request`], which resolves it against the live route table.

use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderValue, Request, StatusCode},
    response::Response,
    routing::any,
    Router,
};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use monoservice_sdk::{Request as SdkRequest, Response as SdkResponse};

use crate::adapter;
use crate::runtime::{HandlerFault, RouteEntry};
use crate::AppState;

/// Create the gateway router that handles all incoming requests
pub fn create_gateway_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/{*path}", any(handle_gateway_request))
        .route("/", any(handle_gateway_request))
        .with_state(state)
}

#[derive(Error, Debug)]
enum DispatchError {
    #[error(transparent)]
    Fault(#[from] HandlerFault),

    #[error("handler task failed: {0}")]
    Task(String),

    #[error("handler did not answer within {0:?}")]
    TimedOut(Duration),
}

async fn handle_gateway_request(
    State(state): State<Arc<AppState>>,
    request: Request<Body>,
) -> Response {
    let method = request.method().clone();
    let path = adapter::decoded_path(request.uri()).into_owned();
    let request_id = Uuid::new_v4().to_string();

    tracing::debug!(
        request_id = %request_id,
        method = %method,
        path = %path,
        "Incoming request"
    );

    let Some(entry) = state.routes.lookup(&path) else {
        tracing::debug!(
            request_id = %request_id,
            path = %path,
            table_empty = state.routes.is_empty(),
            "No route bound"
        );
        return adapter::error_response(StatusCode::NOT_FOUND, "Not Found");
    };

    if !entry.allows(&method) {
        tracing::debug!(
            request_id = %request_id,
            method = %method,
            route = %entry.path,
            module = %entry.module(),
            "Method not allowed"
        );
        let mut response = adapter::error_response(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed");
        if let Ok(allow) = HeaderValue::from_str(&entry.allow_header()) {
            response.headers_mut().insert(header::ALLOW, allow);
        }
        return response;
    }

    let sdk_request = match adapter::to_sdk_request(request, state.config.max_body_bytes, &request_id).await {
        Ok(r) => r,
        Err(e) => {
            tracing::warn!(request_id = %request_id, error = %e, "Rejected request body");
            return adapter::error_response(StatusCode::BAD_REQUEST, "Failed to read body");
        }
    };

    let timeout = Duration::from_secs(state.config.handler_timeout_secs);
    match execute_with_timeout(entry, sdk_request, timeout).await {
        Ok(response) => adapter::into_http_response(response),
        Err(DispatchError::TimedOut(limit)) => {
            tracing::warn!(request_id = %request_id, path = %path, ?limit, "Handler timed out");
            adapter::error_response(StatusCode::GATEWAY_TIMEOUT, "Gateway Timeout")
        }
        Err(e) => {
            tracing::error!(request_id = %request_id, path = %path, error = %e, "Handler error");
            adapter::error_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
        }
    }
}

/// Run `process()` on the blocking pool, bounded by `timeout`.
///
/// The entry is moved into the task, so the handler it points at stays alive
/// until the call returns even if the route is rebound meanwhile. A timed-out
/// call keeps running; its result is discarded.
async fn execute_with_timeout(
    entry: Arc<RouteEntry>,
    request: SdkRequest,
    timeout: Duration,
) -> Result<SdkResponse, DispatchError> {
    let task = tokio::task::spawn_blocking(move || entry.handler.process(&request));

    match tokio::time::timeout(timeout, task).await {
        Ok(Ok(result)) => Ok(result?),
        Ok(Err(e)) => Err(DispatchError::Task(e.to_string())),
        Err(_) => Err(DispatchError::TimedOut(timeout)),
    }
}
