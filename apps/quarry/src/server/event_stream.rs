//! The legacy event-stream transport: an SSE channel opened by `GET /sse`
//! announces its message endpoint, requests arrive via `POST /messages`,
//! and every response is pushed over the stream.

use std::convert::Infallible;

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Json, Response};
use serde::Deserialize;
use serde_json::Value;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;
use tracing::debug;

use crate::mcp::protocol::{error_response, JsonRpcRequest, ERROR_PARSE};
use crate::server::{observed_auth, reject, AppState};
use crate::session::{CloseReason, SessionManager};

pub async fn get_sse(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let auth = observed_auth(&headers);
    let (session, rx) = match state.manager.open_event_stream(auth).await {
        Ok(opened) => opened,
        Err(err) => return reject(err, None),
    };

    let endpoint = format!("/messages?session_id={}", session.id());
    debug!(target: "quarry::server", session = %session.id(), "event stream attached");

    let guard = DisconnectGuard {
        manager: state.manager.clone(),
        session_id: session.id().to_string(),
    };
    let announce = tokio_stream::once(Ok::<Event, Infallible>(
        Event::default().event("endpoint").data(endpoint),
    ));
    let messages = UnboundedReceiverStream::new(rx).map(move |response| {
        // The guard rides along with the stream; dropping the connection
        // drops it and closes the session.
        let _ = &guard;
        let data = serde_json::to_string(&response).unwrap_or_else(|_| "{}".to_string());
        Ok(Event::default().event("message").data(data))
    });

    Sse::new(announce.chain(messages))
        .keep_alive(KeepAlive::default())
        .into_response()
}

#[derive(Debug, Deserialize)]
pub struct MessageQuery {
    pub session_id: String,
}

pub async fn post_message(
    State(state): State<AppState>,
    Query(query): Query<MessageQuery>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let request: JsonRpcRequest = match serde_json::from_value(body) {
        Ok(request) => request,
        Err(err) => {
            let body = error_response(None, ERROR_PARSE, format!("malformed request: {err}"));
            return (StatusCode::BAD_REQUEST, Json(body)).into_response();
        }
    };
    let auth = observed_auth(&headers);
    match state
        .manager
        .dispatch_event_stream(&query.session_id, request, auth)
        .await
    {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(err) => reject(err, None),
    }
}

/// Closes the session when the client drops the SSE connection.
struct DisconnectGuard {
    manager: SessionManager,
    session_id: String,
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        let manager = self.manager.clone();
        let session_id = std::mem::take(&mut self.session_id);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                manager
                    .close_event_stream(&session_id, CloseReason::ClientDisconnect)
                    .await;
            });
        }
    }
}
