//! Thin HTTP client for a GitLab-compatible forge REST API.
//!
//! The client performs one call at a time with an explicitly supplied
//! [`CallAuth`] and hands back the parsed JSON body. It never interprets the
//! shape of a successful payload; non-2xx responses become a structured
//! [`ForgeError::Api`] carrying the status and the forge's own message.

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};
use reqwest::{Client, Method, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum ForgeError {
    #[error("invalid forge url: {0}")]
    InvalidUrl(String),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("forge api error ({status}): {message}")]
    Api { status: u16, message: String },
}

impl ForgeError {
    pub fn status(&self) -> Option<u16> {
        match self {
            ForgeError::Api { status, .. } => Some(*status),
            ForgeError::Http(err) => err.status().map(|s| s.as_u16()),
            ForgeError::InvalidUrl(_) => None,
        }
    }
}

/// Effective credentials for exactly one outbound call.
///
/// Constructed fresh per call by the credential resolution pipeline and
/// threaded down explicitly; the client holds no ambient auth state.
#[derive(Debug, Clone, Default)]
pub struct CallAuth {
    pub token: Option<String>,
    pub base_url: Option<Url>,
    pub headers: Vec<(String, String)>,
}

impl CallAuth {
    pub fn bearer(token: impl Into<String>) -> Self {
        Self {
            token: Some(token.into()),
            base_url: None,
            headers: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ForgeClient {
    http: Client,
    base_url: Url,
}

impl ForgeClient {
    pub fn new(base_url: Url, timeout: Duration) -> Result<Self, ForgeError> {
        if base_url.cannot_be_a_base() {
            return Err(ForgeError::InvalidUrl(base_url.to_string()));
        }
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(ForgeError::Http)?;
        Ok(Self { http, base_url })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub async fn get(
        &self,
        path: &str,
        query: &[(&str, String)],
        auth: &CallAuth,
    ) -> Result<Value, ForgeError> {
        self.send(Method::GET, path, query, None, auth).await
    }

    pub async fn post(
        &self,
        path: &str,
        body: Value,
        auth: &CallAuth,
    ) -> Result<Value, ForgeError> {
        self.send(Method::POST, path, &[], Some(body), auth).await
    }

    pub async fn put(&self, path: &str, body: Value, auth: &CallAuth) -> Result<Value, ForgeError> {
        self.send(Method::PUT, path, &[], Some(body), auth).await
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<Value>,
        auth: &CallAuth,
    ) -> Result<Value, ForgeError> {
        let base = normalize_base(auth.base_url.as_ref().unwrap_or(&self.base_url));
        let url = base
            .join(path.trim_start_matches('/'))
            .map_err(|err| ForgeError::InvalidUrl(format!("{path}: {err}")))?;

        let mut request = self.http.request(method, url);
        if !query.is_empty() {
            request = request.query(query);
        }
        if let Some(body) = body {
            request = request.json(&body);
        }
        request = request.headers(header_map(auth));

        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            if status == StatusCode::NO_CONTENT {
                return Ok(Value::Null);
            }
            return Ok(response.json().await?);
        }

        let text = response.text().await.unwrap_or_default();
        Err(ForgeError::Api {
            status: status.as_u16(),
            message: decode_error_message(&text),
        })
    }
}

/// `Url::join` treats a base without a trailing slash as a file and drops
/// its last path segment; self-hosted forges mounted under a subpath need
/// the slash preserved.
fn normalize_base(base: &Url) -> Url {
    let mut base = base.clone();
    if !base.path().ends_with('/') {
        base.set_path(&format!("{}/", base.path()));
    }
    base
}

fn header_map(auth: &CallAuth) -> HeaderMap {
    let mut headers = HeaderMap::new();
    if let Some(token) = &auth.token {
        if let Ok(value) = HeaderValue::from_str(&format!("Bearer {token}")) {
            headers.insert(AUTHORIZATION, value);
        }
    }
    for (name, value) in &auth.headers {
        let parsed = (
            name.parse::<HeaderName>(),
            HeaderValue::from_str(value.as_str()),
        );
        if let (Ok(name), Ok(value)) = parsed {
            if !headers.contains_key(&name) {
                headers.insert(name, value);
            }
        }
    }
    headers
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: Option<Value>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
}

fn decode_error_message(text: &str) -> String {
    let body: ErrorBody = match serde_json::from_str(text) {
        Ok(body) => body,
        Err(_) => {
            let trimmed = text.trim();
            return if trimmed.is_empty() {
                "unknown error".to_string()
            } else {
                trimmed.to_string()
            };
        }
    };
    if let Some(message) = body.message {
        return match message {
            Value::String(s) => s,
            other => other.to_string(),
        };
    }
    body.error_description
        .or(body.error)
        .unwrap_or_else(|| "unknown error".to_string())
}
