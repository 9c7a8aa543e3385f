//! Browser-cookie sessions: a netscape-format jar, reloaded when its backing
//! file changes, with one warm-up request per API root to establish
//! server-side session state before real calls go out.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::SystemTime;

use reqwest::Client;
use tracing::{debug, warn};
use url::Url;

use crate::auth::AuthError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CookieEntry {
    pub domain: String,
    pub include_subdomains: bool,
    pub path: String,
    pub secure: bool,
    pub name: String,
    pub value: String,
}

impl CookieEntry {
    fn matches(&self, host: &str, path: &str) -> bool {
        let domain = self.domain.trim_start_matches('.');
        let host_matches = host == domain
            || (self.include_subdomains && host.ends_with(&format!(".{domain}")));
        host_matches && path.starts_with(&self.path)
    }
}

/// Parse a netscape-format cookie file. Comment lines are skipped except for
/// the `#HttpOnly_` prefix curl emits; malformed lines are ignored.
pub fn parse_netscape(raw: &str) -> Vec<CookieEntry> {
    let mut entries = Vec::new();
    for line in raw.lines() {
        let line = line.strip_prefix("#HttpOnly_").unwrap_or(line);
        let line = line.trim_end();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() != 7 {
            continue;
        }
        entries.push(CookieEntry {
            domain: fields[0].to_string(),
            include_subdomains: fields[1].eq_ignore_ascii_case("TRUE")
                || fields[0].starts_with('.'),
            path: fields[2].to_string(),
            secure: fields[3].eq_ignore_ascii_case("TRUE"),
            name: fields[5].to_string(),
            value: fields[6].to_string(),
        });
    }
    entries
}

#[derive(Debug, Default)]
struct JarState {
    entries: Vec<CookieEntry>,
    loaded_mtime: Option<SystemTime>,
    warmed_roots: HashSet<String>,
}

pub struct CookieRuntime {
    path: PathBuf,
    warmup_path: String,
    state: tokio::sync::Mutex<JarState>,
}

impl CookieRuntime {
    pub fn new(path: PathBuf, warmup_path: String) -> Self {
        Self {
            path,
            warmup_path,
            state: tokio::sync::Mutex::new(JarState::default()),
        }
    }

    /// Reload the jar if the backing file changed since the last load.
    ///
    /// The state mutex makes this single-flight: concurrent callers queue
    /// behind the in-progress reload and then observe a fresh mtime. A
    /// reload clears the warmed-roots memory.
    pub async fn ensure_fresh(&self) -> Result<(), AuthError> {
        let mtime = tokio::fs::metadata(&self.path)
            .await
            .map_err(|err| {
                AuthError::Config(format!(
                    "cookie jar {} unavailable: {err}",
                    self.path.display()
                ))
            })?
            .modified()
            .ok();

        let mut state = self.state.lock().await;
        if state.loaded_mtime.is_some() && state.loaded_mtime == mtime {
            return Ok(());
        }

        let raw = tokio::fs::read_to_string(&self.path).await?;
        let entries = parse_netscape(&raw);
        debug!(target: "quarry::auth", cookies = entries.len(), path = %self.path.display(), "loaded cookie jar");
        state.entries = entries;
        state.loaded_mtime = mtime;
        state.warmed_roots.clear();
        Ok(())
    }

    /// Cookie header value for the given root, if any cookies match.
    pub async fn header_for(&self, root: &Url) -> Option<String> {
        let host = root.host_str()?;
        let path = root.path();
        let state = self.state.lock().await;
        let https = root.scheme() == "https";
        let pairs: Vec<String> = state
            .entries
            .iter()
            .filter(|entry| entry.matches(host, path) && (https || !entry.secure))
            .map(|entry| format!("{}={}", entry.name, entry.value))
            .collect();
        if pairs.is_empty() {
            None
        } else {
            Some(pairs.join("; "))
        }
    }

    /// Issue the one-time warm-up request for this API root.
    ///
    /// Best-effort: failures are logged and never block the real call. Any
    /// response below the server-error threshold marks the root warmed. The
    /// state lock is held across the request so concurrent first callers on
    /// the same root collapse into one warm-up.
    pub async fn warm_up(&self, root: &Url, client: &Client, extra_headers: &[(String, String)]) {
        let root_key = match root.host_str() {
            Some(host) => format!("{}://{host}", root.scheme()),
            None => return,
        };

        let mut state = self.state.lock().await;
        if state.warmed_roots.contains(&root_key) {
            return;
        }

        let url = match root.join(self.warmup_path.trim_start_matches('/')) {
            Ok(url) => url,
            Err(err) => {
                warn!(target: "quarry::auth", error = %err, "invalid warm-up path");
                return;
            }
        };

        let https = root.scheme() == "https";
        let cookie_header = {
            let pairs: Vec<String> = state
                .entries
                .iter()
                .filter(|entry| {
                    entry.matches(root.host_str().unwrap_or_default(), "/")
                        && (https || !entry.secure)
                })
                .map(|entry| format!("{}={}", entry.name, entry.value))
                .collect();
            pairs.join("; ")
        };

        let mut request = client.get(url.clone());
        if !cookie_header.is_empty() {
            request = request.header("Cookie", cookie_header);
        }
        for (name, value) in extra_headers {
            request = request.header(name.as_str(), value.as_str());
        }

        match request.send().await {
            Ok(response) if response.status().as_u16() < 500 => {
                debug!(target: "quarry::auth", root = %root_key, status = response.status().as_u16(), "warm-up request succeeded");
                state.warmed_roots.insert(root_key);
            }
            Ok(response) => {
                warn!(target: "quarry::auth", root = %root_key, status = response.status().as_u16(), "warm-up request returned server error");
            }
            Err(err) => {
                warn!(target: "quarry::auth", root = %root_key, error = %err, "warm-up request failed");
            }
        }
    }

    #[cfg(test)]
    pub(crate) async fn warmed_root_count(&self) -> usize {
        self.state.lock().await.warmed_roots.len()
    }
}
