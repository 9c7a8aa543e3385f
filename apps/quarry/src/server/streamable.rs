//! The modern multiplexed transport: JSON-RPC over `POST /mcp` with a
//! session id assigned during the initialize handshake and echoed in the
//! `Mcp-Session-Id` header.

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use serde_json::Value;
use tracing::debug;

use crate::mcp::protocol::{
    error_response, JsonRpcRequest, ERROR_INVALID_REQUEST, ERROR_PARSE,
};
use crate::server::{observed_auth, reject, AppState, SESSION_ID_HEADER};
use crate::session::CloseReason;

pub async fn post_mcp(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if body.is_array() {
        let body = error_response(None, ERROR_INVALID_REQUEST, "batch requests not supported");
        return (StatusCode::BAD_REQUEST, Json(body)).into_response();
    }
    let request: JsonRpcRequest = match serde_json::from_value(body) {
        Ok(request) => request,
        Err(err) => {
            let body = error_response(None, ERROR_PARSE, format!("malformed request: {err}"));
            return (StatusCode::BAD_REQUEST, Json(body)).into_response();
        }
    };
    let request_id = request.id.clone();
    let auth = observed_auth(&headers);
    let session_header = headers
        .get(SESSION_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    match session_header {
        Some(session_id) => {
            match state.manager.dispatch(&session_id, request, auth).await {
                Ok(Some(response)) => {
                    ([(SESSION_ID_HEADER, session_id.as_str())], Json(response)).into_response()
                }
                Ok(None) => StatusCode::ACCEPTED.into_response(),
                Err(err) => reject(err, request_id),
            }
        }
        None => match state.manager.open_streamable(request, auth).await {
            Ok(open) => match open.session_id {
                Some(session_id) => {
                    ([(SESSION_ID_HEADER, session_id.as_str())], Json(open.response))
                        .into_response()
                }
                // Handshake rejected before an id existed: only the protocol
                // error travels back.
                None => (StatusCode::BAD_REQUEST, Json(open.response)).into_response(),
            },
            Err(err) => reject(err, request_id),
        },
    }
}

pub async fn delete_mcp(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let Some(session_id) = headers
        .get(SESSION_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
    else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    if state
        .manager
        .close_streamable(&session_id, CloseReason::Explicit)
        .await
    {
        debug!(target: "quarry::server", session = %session_id, "session closed by client");
        StatusCode::NO_CONTENT.into_response()
    } else {
        StatusCode::NOT_FOUND.into_response()
    }
}

pub async fn get_mcp() -> Response {
    // Server-initiated streaming is not offered on this transport; the
    // legacy /sse endpoint covers push-style clients.
    StatusCode::METHOD_NOT_ALLOWED.into_response()
}
