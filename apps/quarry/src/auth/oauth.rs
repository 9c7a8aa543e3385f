//! Interactive OAuth against the forge: stored-token reuse, refresh, and the
//! authorization-code + PKCE flow over a short-lived loopback listener.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};
use url::Url;

use crate::auth::AuthError;

/// Ceiling on the loopback callback wait.
const CALLBACK_TIMEOUT: Duration = Duration::from_secs(180);

/// A token is treated as expired this long before its computed expiry.
const EXPIRY_MARGIN: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct OauthConfig {
    pub client_id: String,
    pub client_secret: Option<String>,
    pub scopes: String,
    pub redirect_uri: Url,
    pub token_path: PathBuf,
    pub auto_open: bool,
}

impl OauthConfig {
    pub fn default_token_path() -> PathBuf {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".into());
        PathBuf::from(home).join(".quarry").join("oauth-token.toml")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredToken {
    pub access_token: String,
    pub token_type: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl StoredToken {
    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        match self.expires_in {
            Some(lifetime) => {
                let expires_at = self.created_at + Duration::from_secs(lifetime);
                expires_at - EXPIRY_MARGIN <= now
            }
            None => false,
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenEndpointResponse {
    access_token: String,
    #[serde(default = "default_token_type")]
    token_type: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

pub struct OauthManager {
    config: OauthConfig,
    forge_base: Url,
    http: Client,
    // Serializes every resolution attempt; a caller arriving mid-flight
    // waits here and then finds the freshly persisted token.
    flight: tokio::sync::Mutex<()>,
}

impl OauthManager {
    pub fn new(config: OauthConfig, mut forge_base: Url) -> Result<Self, AuthError> {
        if !forge_base.path().ends_with('/') {
            forge_base.set_path(&format!("{}/", forge_base.path()));
        }
        let scheme = config.redirect_uri.scheme();
        let host = config.redirect_uri.host_str().unwrap_or_default();
        let loopback = matches!(host, "127.0.0.1" | "localhost" | "[::1]" | "::1");
        if scheme != "http" || !loopback {
            return Err(AuthError::Config(format!(
                "oauth redirect uri must be a loopback http address, got {}",
                config.redirect_uri
            )));
        }
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|err| AuthError::Config(err.to_string()))?;
        Ok(Self {
            config,
            forge_base,
            http,
            flight: tokio::sync::Mutex::new(()),
        })
    }

    /// Resolve a valid access token, refreshing or escalating to the full
    /// interactive flow as needed. Single-flighted: concurrent callers share
    /// one attempt and all observe its outcome.
    pub async fn access_token(&self) -> Result<String, AuthError> {
        let _flight = self.flight.lock().await;
        let now = OffsetDateTime::now_utc();

        if let Some(stored) = self.load_stored()? {
            if !stored.is_expired(now) {
                return Ok(stored.access_token);
            }
            if let Some(refresh_token) = stored.refresh_token.clone() {
                match self.refresh(&refresh_token).await {
                    Ok(token) => {
                        self.persist(&token)?;
                        return Ok(token.access_token);
                    }
                    Err(err) => {
                        warn!(target: "quarry::auth", error = %err, "token refresh failed; starting interactive authorization");
                    }
                }
            }
        }

        let token = self.interactive().await?;
        self.persist(&token)?;
        Ok(token.access_token)
    }

    fn load_stored(&self) -> Result<Option<StoredToken>, AuthError> {
        let path = &self.config.token_path;
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(path)?;
        let token = toml::from_str(&raw)
            .map_err(|err| AuthError::Config(format!("corrupt token store: {err}")))?;
        Ok(Some(token))
    }

    fn persist(&self, token: &StoredToken) -> Result<(), AuthError> {
        let path = &self.config.token_path;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let serialized = toml::to_string_pretty(token)
            .map_err(|err| AuthError::Config(err.to_string()))?;

        // Write-replace atomically so a crash never leaves a partial store.
        let staged = path.with_extension("tmp");
        let mut options = OpenOptions::new();
        options.create(true).write(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(&staged)?;
        file.write_all(serialized.as_bytes())?;
        file.sync_all()?;
        drop(file);
        fs::rename(&staged, path)?;
        Ok(())
    }

    async fn refresh(&self, refresh_token: &str) -> Result<StoredToken, AuthError> {
        debug!(target: "quarry::auth", "refreshing oauth access token");
        let mut form = vec![
            ("grant_type", "refresh_token".to_string()),
            ("refresh_token", refresh_token.to_string()),
            ("client_id", self.config.client_id.clone()),
            ("redirect_uri", self.config.redirect_uri.to_string()),
        ];
        if let Some(secret) = &self.config.client_secret {
            form.push(("client_secret", secret.clone()));
        }
        self.token_request(&form).await
    }

    async fn interactive(&self) -> Result<StoredToken, AuthError> {
        let verifier = pkce_verifier();
        let challenge = pkce_challenge(&verifier);
        let state = random_state();
        let authorize_url = self.authorize_url(&challenge, &state)?;

        let host = self
            .config
            .redirect_uri
            .host_str()
            .unwrap_or("127.0.0.1")
            .trim_matches(|c| c == '[' || c == ']')
            .to_string();
        let port = self.config.redirect_uri.port().unwrap_or(80);
        let listener = TcpListener::bind((host.as_str(), port))
            .await
            .map_err(|err| {
                AuthError::Callback(format!("failed to bind loopback listener: {err}"))
            })?;

        info!(target: "quarry::auth", url = %authorize_url, "waiting for oauth authorization");
        if self.config.auto_open {
            open_browser(authorize_url.as_str());
        } else {
            println!("Open this URL to authorize quarry:\n\n  {authorize_url}\n");
        }

        let code = wait_for_callback(listener, &state, self.config.redirect_uri.path()).await?;

        let mut form = vec![
            ("grant_type", "authorization_code".to_string()),
            ("code", code),
            ("client_id", self.config.client_id.clone()),
            ("redirect_uri", self.config.redirect_uri.to_string()),
            ("code_verifier", verifier),
        ];
        if let Some(secret) = &self.config.client_secret {
            form.push(("client_secret", secret.clone()));
        }
        self.token_request(&form).await
    }

    fn authorize_url(&self, challenge: &str, state: &str) -> Result<Url, AuthError> {
        let mut url = self.endpoint("oauth/authorize")?;
        url.query_pairs_mut()
            .append_pair("client_id", &self.config.client_id)
            .append_pair("redirect_uri", self.config.redirect_uri.as_str())
            .append_pair("response_type", "code")
            .append_pair("scope", &self.config.scopes)
            .append_pair("state", state)
            .append_pair("code_challenge", challenge)
            .append_pair("code_challenge_method", "S256");
        Ok(url)
    }

    fn endpoint(&self, path: &str) -> Result<Url, AuthError> {
        self.forge_base.join(path).map_err(|err| {
            AuthError::Config(format!("invalid oauth endpoint '{path}': {err}"))
        })
    }

    async fn token_request(&self, form: &[(&str, String)]) -> Result<StoredToken, AuthError> {
        let url = self.endpoint("oauth/token")?;
        let response = self.http.post(url).form(form).send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(AuthError::TokenEndpoint {
                status: status.as_u16(),
                message: oauth_error_detail(&text),
            });
        }
        let body: TokenEndpointResponse = response.json().await?;
        Ok(StoredToken {
            access_token: body.access_token,
            token_type: body.token_type,
            refresh_token: body.refresh_token,
            expires_in: body.expires_in,
            created_at: OffsetDateTime::now_utc(),
        })
    }
}

/// Wait for the authorization callback on the loopback listener.
///
/// Resolves exactly once: with the authorization code, or with an error on
/// timeout, state mismatch, or a provider-reported denial. The listener is
/// dropped in every exit path.
async fn wait_for_callback(
    listener: TcpListener,
    expected_state: &str,
    callback_path: &str,
) -> Result<String, AuthError> {
    let deadline = tokio::time::Instant::now() + CALLBACK_TIMEOUT;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return Err(AuthError::Callback(format!(
                "authorization timed out after {}s",
                CALLBACK_TIMEOUT.as_secs()
            )));
        }
        let (stream, _) = match tokio::time::timeout(remaining, listener.accept()).await {
            Ok(Ok(accepted)) => accepted,
            Ok(Err(err)) => {
                return Err(AuthError::Callback(format!("loopback accept failed: {err}")))
            }
            Err(_) => {
                return Err(AuthError::Callback(format!(
                    "authorization timed out after {}s",
                    CALLBACK_TIMEOUT.as_secs()
                )))
            }
        };

        match read_callback(stream, expected_state, callback_path).await {
            CallbackOutcome::Code(code) => return Ok(code),
            CallbackOutcome::Failed(err) => return Err(err),
            // Stray request (favicon, health probe): keep waiting.
            CallbackOutcome::Ignored => continue,
        }
    }
}

enum CallbackOutcome {
    Code(String),
    Failed(AuthError),
    Ignored,
}

async fn read_callback(
    mut stream: TcpStream,
    expected_state: &str,
    callback_path: &str,
) -> CallbackOutcome {
    let mut buf = vec![0u8; 4096];
    let read = match stream.read(&mut buf).await {
        Ok(n) => n,
        Err(_) => return CallbackOutcome::Ignored,
    };
    let request = String::from_utf8_lossy(&buf[..read]);
    let target = match request.split_whitespace().nth(1) {
        Some(target) => target,
        None => return CallbackOutcome::Ignored,
    };

    let parsed = match Url::parse(&format!("http://localhost{target}")) {
        Ok(parsed) => parsed,
        Err(_) => return CallbackOutcome::Ignored,
    };
    if parsed.path() != callback_path {
        let _ = respond(&mut stream, 404, "not found").await;
        return CallbackOutcome::Ignored;
    }

    let mut code = None;
    let mut state = None;
    let mut error = None;
    for (key, value) in parsed.query_pairs() {
        match key.as_ref() {
            "code" => code = Some(value.into_owned()),
            "state" => state = Some(value.into_owned()),
            "error" => error = Some(value.into_owned()),
            _ => {}
        }
    }

    if let Some(error) = error {
        let _ = respond(&mut stream, 400, "authorization failed; you can close this window").await;
        return CallbackOutcome::Failed(AuthError::Callback(format!(
            "provider returned error '{error}'"
        )));
    }
    if state.as_deref() != Some(expected_state) {
        let _ = respond(&mut stream, 400, "state mismatch; you can close this window").await;
        return CallbackOutcome::Failed(AuthError::Callback(
            "state parameter mismatch in callback".to_string(),
        ));
    }
    match code {
        Some(code) if !code.is_empty() => {
            let _ = respond(&mut stream, 200, "authorization complete; you can close this window")
                .await;
            CallbackOutcome::Code(code)
        }
        _ => {
            let _ = respond(&mut stream, 400, "missing authorization code").await;
            CallbackOutcome::Failed(AuthError::Callback(
                "callback carried no authorization code".to_string(),
            ))
        }
    }
}

async fn respond(stream: &mut TcpStream, status: u16, body: &str) -> std::io::Result<()> {
    let reason = match status {
        200 => "OK",
        404 => "Not Found",
        _ => "Bad Request",
    };
    let payload = format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(payload.as_bytes()).await?;
    stream.shutdown().await
}

fn open_browser(url: &str) {
    #[cfg(target_os = "macos")]
    let launcher = "open";
    #[cfg(not(target_os = "macos"))]
    let launcher = "xdg-open";

    match std::process::Command::new(launcher).arg(url).spawn() {
        Ok(_) => {}
        Err(err) => {
            warn!(target: "quarry::auth", error = %err, "failed to open browser; authorize manually");
            println!("Open this URL to authorize quarry:\n\n  {url}\n");
        }
    }
}

pub fn pkce_verifier() -> String {
    let mut bytes = [0u8; 48];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

pub fn pkce_challenge(verifier: &str) -> String {
    let digest = Sha256::digest(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(digest)
}

pub fn random_state() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

fn oauth_error_detail(text: &str) -> String {
    #[derive(Deserialize)]
    struct ErrorBody {
        #[serde(default)]
        error: Option<String>,
        #[serde(default)]
        error_description: Option<String>,
    }
    match serde_json::from_str::<ErrorBody>(text) {
        Ok(body) => body
            .error_description
            .or(body.error)
            .unwrap_or_else(|| "unknown error".to_string()),
        Err(_) => text.trim().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verifier_is_url_safe_and_long_enough() {
        let verifier = pkce_verifier();
        assert_eq!(verifier.len(), 64);
        assert!(verifier
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[test]
    fn challenge_is_deterministic_s256() {
        let challenge = pkce_challenge("fixed-verifier");
        assert_eq!(challenge, pkce_challenge("fixed-verifier"));
        assert_ne!(challenge, pkce_challenge("other-verifier"));
        // BASE64URL(SHA256(x)) of a 32-byte digest is always 43 chars.
        assert_eq!(challenge.len(), 43);
    }

    #[test]
    fn token_expiry_uses_margin() {
        let created = OffsetDateTime::now_utc();
        let token = StoredToken {
            access_token: "a".into(),
            token_type: "Bearer".into(),
            refresh_token: None,
            expires_in: Some(600),
            created_at: created,
        };
        assert!(!token.is_expired(created));
        assert!(!token.is_expired(created + Duration::from_secs(299)));
        // Expired 300s early, never exactly at expiry.
        assert!(token.is_expired(created + Duration::from_secs(300)));
        assert!(token.is_expired(created + Duration::from_secs(600)));
    }

    #[test]
    fn token_without_lifetime_never_expires() {
        let token = StoredToken {
            access_token: "a".into(),
            token_type: "Bearer".into(),
            refresh_token: None,
            expires_in: None,
            created_at: OffsetDateTime::now_utc(),
        };
        assert!(!token.is_expired(OffsetDateTime::now_utc() + Duration::from_secs(86_400)));
    }

    #[test]
    fn non_loopback_redirect_is_rejected() {
        let config = OauthConfig {
            client_id: "id".into(),
            client_secret: None,
            scopes: "api".into(),
            redirect_uri: Url::parse("https://example.com/callback").unwrap(),
            token_path: OauthConfig::default_token_path(),
            auto_open: false,
        };
        let err = OauthManager::new(config, Url::parse("https://gitlab.com").unwrap());
        assert!(err.is_err());
    }

    #[test]
    fn stored_token_round_trips_via_toml() {
        let token = StoredToken {
            access_token: "at".into(),
            token_type: "Bearer".into(),
            refresh_token: Some("rt".into()),
            expires_in: Some(7200),
            created_at: OffsetDateTime::now_utc(),
        };
        let serialized = toml::to_string_pretty(&token).unwrap();
        let decoded: StoredToken = toml::from_str(&serialized).unwrap();
        assert_eq!(decoded.access_token, "at");
        assert_eq!(decoded.refresh_token.as_deref(), Some("rt"));
        assert_eq!(decoded.expires_in, Some(7200));
    }
}
