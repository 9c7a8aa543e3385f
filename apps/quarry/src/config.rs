use std::env;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub port: u16,
    pub forge_url: String,
    pub forge_timeout_secs: u64,
    pub default_token: Option<String>,
    pub max_sessions: usize,
    pub idle_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    pub session_requests_per_minute: u32,
    pub oauth_client_id: Option<String>,
    pub oauth_client_secret: Option<String>,
    pub oauth_scopes: String,
    pub oauth_redirect_uri: String,
    pub oauth_token_path: Option<PathBuf>,
    pub oauth_auto_open: bool,
    pub token_script: Option<String>,
    pub token_script_timeout_secs: u64,
    pub token_cache_ttl_secs: u64,
    pub token_file: Option<PathBuf>,
    pub token_file_allow_loose: bool,
    pub cookie_file: Option<PathBuf>,
    pub cookie_warmup_path: String,
    pub browser_bypass: bool,
    pub browser_user_agent: Option<String>,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            bind_addr: env::var("QUARRY_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env::var("QUARRY_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(3310),
            forge_url: env::var("FORGE_URL").unwrap_or_else(|_| "https://gitlab.com".to_string()),
            forge_timeout_secs: env::var("FORGE_TIMEOUT")
                .ok()
                .and_then(|t| t.parse().ok())
                .unwrap_or(30),
            default_token: env::var("FORGE_TOKEN").ok().filter(|t| !t.trim().is_empty()),
            max_sessions: env::var("QUARRY_MAX_SESSIONS")
                .ok()
                .and_then(|m| m.parse().ok())
                .unwrap_or(100),
            idle_timeout_secs: env::var("QUARRY_IDLE_TIMEOUT")
                .ok()
                .and_then(|t| t.parse().ok())
                .unwrap_or(300),
            sweep_interval_secs: env::var("QUARRY_SWEEP_INTERVAL")
                .ok()
                .and_then(|t| t.parse().ok())
                .unwrap_or(60),
            session_requests_per_minute: env::var("QUARRY_SESSION_RPM")
                .ok()
                .and_then(|r| r.parse().ok())
                .unwrap_or(120),
            oauth_client_id: env::var("QUARRY_OAUTH_CLIENT_ID").ok(),
            oauth_client_secret: env::var("QUARRY_OAUTH_CLIENT_SECRET").ok(),
            oauth_scopes: env::var("QUARRY_OAUTH_SCOPES").unwrap_or_else(|_| "api".to_string()),
            oauth_redirect_uri: env::var("QUARRY_OAUTH_REDIRECT_URI")
                .unwrap_or_else(|_| "http://127.0.0.1:7171/callback".to_string()),
            oauth_token_path: env::var("QUARRY_OAUTH_TOKEN_PATH").ok().map(PathBuf::from),
            oauth_auto_open: env::var("QUARRY_OAUTH_AUTO_OPEN")
                .map(|v| matches_truthy(&v))
                .unwrap_or(true),
            token_script: env::var("QUARRY_TOKEN_SCRIPT").ok().filter(|s| !s.trim().is_empty()),
            token_script_timeout_secs: env::var("QUARRY_TOKEN_SCRIPT_TIMEOUT")
                .ok()
                .and_then(|t| t.parse().ok())
                .unwrap_or(10),
            token_cache_ttl_secs: env::var("QUARRY_TOKEN_CACHE_TTL")
                .ok()
                .and_then(|t| t.parse().ok())
                .unwrap_or(300),
            token_file: env::var("QUARRY_TOKEN_FILE").ok().map(PathBuf::from),
            token_file_allow_loose: env::var("QUARRY_TOKEN_FILE_ALLOW_LOOSE")
                .map(|v| matches_truthy(&v))
                .unwrap_or(false),
            cookie_file: env::var("QUARRY_COOKIE_FILE").ok().map(PathBuf::from),
            cookie_warmup_path: env::var("QUARRY_COOKIE_WARMUP_PATH")
                .unwrap_or_else(|_| "/api/v4/version".to_string()),
            browser_bypass: env::var("QUARRY_BROWSER_BYPASS")
                .map(|v| matches_truthy(&v))
                .unwrap_or(false),
            browser_user_agent: env::var("QUARRY_BROWSER_USER_AGENT").ok(),
        }
    }

    pub fn forge_timeout(&self) -> Duration {
        Duration::from_secs(self.forge_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0".to_string(),
            port: 3310,
            forge_url: "https://gitlab.com".to_string(),
            forge_timeout_secs: 30,
            default_token: None,
            max_sessions: 100,
            idle_timeout_secs: 300,
            sweep_interval_secs: 60,
            session_requests_per_minute: 120,
            oauth_client_id: None,
            oauth_client_secret: None,
            oauth_scopes: "api".to_string(),
            oauth_redirect_uri: "http://127.0.0.1:7171/callback".to_string(),
            oauth_token_path: None,
            oauth_auto_open: true,
            token_script: None,
            token_script_timeout_secs: 10,
            token_cache_ttl_secs: 300,
            token_file: None,
            token_file_allow_loose: false,
            cookie_file: None,
            cookie_warmup_path: "/api/v4/version".to_string(),
            browser_bypass: false,
            browser_user_agent: None,
        }
    }
}

fn matches_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truthy_values() {
        assert!(matches_truthy("1"));
        assert!(matches_truthy(" TRUE "));
        assert!(matches_truthy("on"));
        assert!(!matches_truthy("0"));
        assert!(!matches_truthy("off"));
    }

    #[test]
    fn defaults_are_consistent() {
        let config = Config::default();
        assert_eq!(config.session_requests_per_minute, 120);
        assert_eq!(config.token_cache_ttl_secs, 300);
        assert!(!config.token_file_allow_loose);
    }
}
