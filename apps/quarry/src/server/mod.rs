pub mod event_stream;
pub mod streamable;

use axum::extract::State;
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde_json::Value;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use url::Url;

use crate::auth::{SessionAuth, TokenSource};
use crate::capacity::HealthSnapshot;
use crate::mcp::protocol::{
    error_response, JsonRpcResponse, ERROR_CAPACITY, ERROR_INTERNAL, ERROR_NOT_INITIALIZED,
    ERROR_RATE_LIMITED, ERROR_UNKNOWN_SESSION,
};
use crate::session::{SessionError, SessionManager};

pub const SESSION_ID_HEADER: &str = "mcp-session-id";
const PRIVATE_TOKEN_HEADER: &str = "private-token";
const FORGE_URL_HEADER: &str = "x-forge-url";

#[derive(Clone)]
pub struct AppState {
    pub manager: SessionManager,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route(
            "/mcp",
            post(streamable::post_mcp)
                .delete(streamable::delete_mcp)
                .get(streamable::get_mcp),
        )
        .route("/sse", get(event_stream::get_sse))
        .route("/messages", post(event_stream::post_message))
        .route("/healthz", get(health_check))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check(State(state): State<AppState>) -> Json<HealthSnapshot> {
    Json(state.manager.health().await)
}

/// Build the per-request [`SessionAuth`] from the inbound headers, if any
/// credential material was supplied.
pub fn observed_auth(headers: &HeaderMap) -> Option<SessionAuth> {
    let mut token = None;
    let mut source = None;

    if let Some(value) = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok()) {
        if let Some(bearer) = value.strip_prefix("Bearer ") {
            let bearer = bearer.trim();
            if !bearer.is_empty() {
                token = Some(bearer.to_string());
                source = Some(TokenSource::Bearer);
            }
        }
    }
    if token.is_none() {
        if let Some(value) = headers.get(PRIVATE_TOKEN_HEADER).and_then(|v| v.to_str().ok()) {
            let value = value.trim();
            if !value.is_empty() {
                token = Some(value.to_string());
                source = Some(TokenSource::PrivateToken);
            }
        }
    }

    let forge_url = headers
        .get(FORGE_URL_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| Url::parse(v).ok());

    if token.is_none() && forge_url.is_none() {
        return None;
    }
    Some(SessionAuth::new(token, forge_url, source))
}

/// Map a manager rejection to its transport-level status and stable
/// JSON-RPC code, so callers can tell "back off" from "re-authenticate"
/// from "re-initialize".
pub fn reject(err: SessionError, id: Option<Value>) -> Response {
    let (status, code) = match &err {
        SessionError::CapacityExceeded => (StatusCode::SERVICE_UNAVAILABLE, ERROR_CAPACITY),
        SessionError::RateLimited => (StatusCode::TOO_MANY_REQUESTS, ERROR_RATE_LIMITED),
        SessionError::UnknownSession(_) => (StatusCode::NOT_FOUND, ERROR_UNKNOWN_SESSION),
        SessionError::NotInitialized => (StatusCode::BAD_REQUEST, ERROR_NOT_INITIALIZED),
        SessionError::Closed | SessionError::Handshake(_) => {
            (StatusCode::INTERNAL_SERVER_ERROR, ERROR_INTERNAL)
        }
    };
    let body: JsonRpcResponse = error_response(id, code, err.to_string());
    (status, Json(body)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn bearer_header_wins_over_private_token() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer abc"));
        headers.insert(PRIVATE_TOKEN_HEADER, HeaderValue::from_static("xyz"));
        let auth = observed_auth(&headers).unwrap();
        assert_eq!(auth.token(), Some("abc"));
        assert_eq!(auth.source(), Some(TokenSource::Bearer));
    }

    #[test]
    fn private_token_header_is_recognized() {
        let mut headers = HeaderMap::new();
        headers.insert(PRIVATE_TOKEN_HEADER, HeaderValue::from_static("xyz"));
        let auth = observed_auth(&headers).unwrap();
        assert_eq!(auth.token(), Some("xyz"));
        assert_eq!(auth.source(), Some(TokenSource::PrivateToken));
    }

    #[test]
    fn forge_url_override_alone_is_enough() {
        let mut headers = HeaderMap::new();
        headers.insert(
            FORGE_URL_HEADER,
            HeaderValue::from_static("https://forge.internal"),
        );
        let auth = observed_auth(&headers).unwrap();
        assert!(auth.token().is_none());
        assert_eq!(auth.forge_url().unwrap().as_str(), "https://forge.internal/");
    }

    #[test]
    fn no_credential_headers_yield_none() {
        let headers = HeaderMap::new();
        assert!(observed_auth(&headers).is_none());

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic dXNlcg=="));
        assert!(observed_auth(&headers).is_none());
    }
}
