//! Credential resolution: per-request overrides, the TTL cache, interactive
//! OAuth, secret scripts and files, cookie sessions, and the static default,
//! consulted in that order for every outbound forge call.

pub mod cache;
pub mod cookies;
pub mod oauth;
pub mod secrets;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use forge_api::CallAuth;
use thiserror::Error;
use time::OffsetDateTime;
use tracing::debug;
use url::Url;

use crate::auth::cache::CredentialCache;
use crate::auth::cookies::CookieRuntime;
use crate::auth::oauth::OauthManager;

const DEFAULT_BROWSER_USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64; rv:122.0) Gecko/20100101 Firefox/122.0";

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("auth config error: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("secret script failed: {0}")]
    Script(String),
    #[error("secret file {path} is readable by group/other (mode {mode:o})")]
    FilePermissions { path: PathBuf, mode: u32 },
    #[error("oauth token endpoint error ({status}): {message}")]
    TokenEndpoint { status: u16, message: String },
    #[error("oauth callback error: {0}")]
    Callback(String),
    #[error("no credential source produced a token")]
    Unavailable,
}

/// Which request header carried a per-request token. Diagnostic only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenSource {
    Bearer,
    PrivateToken,
}

/// Per-request authentication observed on an inbound call.
///
/// Immutable once constructed; a session keeps the most recently observed
/// value and the manager threads it by value into each dispatch.
#[derive(Debug, Clone)]
pub struct SessionAuth {
    token: Option<String>,
    forge_url: Option<Url>,
    source: Option<TokenSource>,
    observed_at: OffsetDateTime,
}

impl SessionAuth {
    pub fn new(token: Option<String>, forge_url: Option<Url>, source: Option<TokenSource>) -> Self {
        Self {
            token,
            forge_url,
            source,
            observed_at: OffsetDateTime::now_utc(),
        }
    }

    pub fn empty() -> Self {
        Self::new(None, None, None)
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    pub fn forge_url(&self) -> Option<&Url> {
        self.forge_url.as_ref()
    }

    pub fn source(&self) -> Option<TokenSource> {
        self.source
    }

    pub fn observed_at(&self) -> OffsetDateTime {
        self.observed_at
    }

    pub fn has_credentials(&self) -> bool {
        self.token.is_some() || self.forge_url.is_some()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ResolverConfig {
    pub default_token: Option<String>,
    pub token_script: Option<String>,
    pub script_timeout: Duration,
    pub cache_ttl: Duration,
    pub token_file: Option<PathBuf>,
    pub token_file_allow_loose: bool,
    pub browser_bypass: bool,
    pub browser_user_agent: Option<String>,
}

/// Orchestrates the credential sources for each outgoing call.
pub struct CredentialResolver {
    config: ResolverConfig,
    forge_base: Url,
    cache: tokio::sync::Mutex<CredentialCache>,
    oauth: Option<Arc<OauthManager>>,
    cookies: Option<Arc<CookieRuntime>>,
    http: reqwest::Client,
}

impl CredentialResolver {
    pub fn new(
        config: ResolverConfig,
        forge_base: Url,
        oauth: Option<Arc<OauthManager>>,
        cookies: Option<Arc<CookieRuntime>>,
    ) -> Result<Self, AuthError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|err| AuthError::Config(err.to_string()))?;
        Ok(Self {
            config,
            forge_base,
            cache: tokio::sync::Mutex::new(CredentialCache::new()),
            oauth,
            cookies,
            http,
        })
    }

    /// Produce the effective credentials for one outbound call.
    ///
    /// First success wins: per-request override, unexpired cache entry,
    /// OAuth, secret script, secret file, static default. Cookie freshness
    /// and warm-up run on every resolution regardless of which source
    /// supplies the token; a failed source never poisons the cache.
    pub async fn resolve(&self, per_request: Option<&SessionAuth>) -> Result<CallAuth, AuthError> {
        let root = per_request
            .and_then(|auth| auth.forge_url().cloned())
            .unwrap_or_else(|| self.forge_base.clone());

        let extra_headers = self.compat_headers();
        if let Some(cookies) = &self.cookies {
            cookies.ensure_fresh().await?;
            cookies.warm_up(&root, &self.http, &extra_headers).await;
        }

        let token = self.resolve_token(per_request).await?;
        let mut headers = extra_headers;
        if let Some(cookies) = &self.cookies {
            if let Some(header) = cookies.header_for(&root).await {
                headers.push(("Cookie".to_string(), header));
            }
        }

        Ok(CallAuth {
            token,
            base_url: Some(root),
            headers,
        })
    }

    async fn resolve_token(
        &self,
        per_request: Option<&SessionAuth>,
    ) -> Result<Option<String>, AuthError> {
        if let Some(token) = per_request.and_then(|auth| auth.token()) {
            return Ok(Some(token.to_string()));
        }

        let now = OffsetDateTime::now_utc();
        if let Some(cached) = self.cache.lock().await.get(now) {
            return Ok(Some(cached));
        }

        if let Some(oauth) = &self.oauth {
            return Ok(Some(oauth.access_token().await?));
        }

        if let Some(script) = &self.config.token_script {
            let secret =
                secrets::run_secret_command(script, self.config.script_timeout).await?;
            self.remember(secret.clone(), now).await;
            return Ok(Some(secret));
        }

        if let Some(path) = &self.config.token_file {
            let secret =
                secrets::load_secret_file(path, self.config.token_file_allow_loose).await?;
            self.remember(secret.clone(), now).await;
            return Ok(Some(secret));
        }

        if let Some(default) = &self.config.default_token {
            return Ok(Some(default.clone()));
        }

        // Cookie-only deployments legitimately run without a bearer token.
        if self.cookies.is_some() {
            debug!(target: "quarry::auth", "no token source configured; relying on cookie session");
            return Ok(None);
        }
        Err(AuthError::Unavailable)
    }

    async fn remember(&self, secret: String, now: OffsetDateTime) {
        if self.config.cache_ttl.is_zero() {
            return;
        }
        self.cache
            .lock()
            .await
            .put(secret, self.config.cache_ttl, now);
    }

    fn compat_headers(&self) -> Vec<(String, String)> {
        if !self.config.browser_bypass {
            return Vec::new();
        }
        let user_agent = self
            .config
            .browser_user_agent
            .clone()
            .unwrap_or_else(|| DEFAULT_BROWSER_USER_AGENT.to_string());
        vec![
            ("User-Agent".to_string(), user_agent),
            ("Accept-Language".to_string(), "en-US,en;q=0.9".to_string()),
            ("Cache-Control".to_string(), "no-cache".to_string()),
        ]
    }
}
