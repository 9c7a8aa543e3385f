//! Secret retrieval from external commands and permission-checked files.

use std::path::Path;
use std::time::Duration;

use serde_json::Value;
use tokio::process::Command;
use tracing::debug;

use crate::auth::AuthError;

/// Output larger than this aborts the retrieval rather than buffering an
/// unbounded secret-helper response.
pub const MAX_SECRET_OUTPUT_BYTES: usize = 64 * 1024;

/// Structured secret fields recognized in helper output, in priority order.
const SECRET_FIELDS: [&str; 3] = ["token", "access_token", "password"];

/// Parse helper output: structured JSON first, plain text as fallback.
///
/// A JSON object exposing one of the recognized fields wins; anything else is
/// treated as plain text and the first non-empty line is the secret.
pub fn parse_secret_output(raw: &str) -> Option<String> {
    if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(raw) {
        for field in SECRET_FIELDS {
            if let Some(Value::String(secret)) = map.get(field) {
                let secret = secret.trim();
                if !secret.is_empty() {
                    return Some(secret.to_string());
                }
            }
        }
        return None;
    }
    raw.lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_string)
}

/// Run the configured secret-retrieval command and parse its stdout.
///
/// The subprocess is bounded by `timeout` and by
/// [`MAX_SECRET_OUTPUT_BYTES`]; exceeding either aborts the call.
pub async fn run_secret_command(command: &str, timeout: Duration) -> Result<String, AuthError> {
    debug!(target: "quarry::auth", "invoking secret-retrieval command");
    let child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|err| AuthError::Script(format!("failed to spawn: {err}")))?;

    let output = tokio::time::timeout(timeout, child.wait_with_output())
        .await
        .map_err(|_| AuthError::Script(format!("timed out after {}s", timeout.as_secs())))?
        .map_err(|err| AuthError::Script(format!("wait failed: {err}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(AuthError::Script(format!(
            "exited with {}: {}",
            output.status,
            stderr.trim()
        )));
    }
    if output.stdout.len() > MAX_SECRET_OUTPUT_BYTES {
        return Err(AuthError::Script(format!(
            "output exceeds {MAX_SECRET_OUTPUT_BYTES} bytes"
        )));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    parse_secret_output(&stdout)
        .ok_or_else(|| AuthError::Script("output contained no usable secret".to_string()))
}

/// Read a secret file, rejecting group/other-readable permission bits unless
/// the lenient flag is set.
pub async fn load_secret_file(path: &Path, allow_loose: bool) -> Result<String, AuthError> {
    #[cfg(unix)]
    if !allow_loose {
        use std::os::unix::fs::PermissionsExt;
        let metadata = tokio::fs::metadata(path).await?;
        let mode = metadata.permissions().mode();
        if mode & 0o044 != 0 {
            return Err(AuthError::FilePermissions {
                path: path.to_path_buf(),
                mode: mode & 0o777,
            });
        }
    }

    let raw = tokio::fs::read_to_string(path).await?;
    parse_secret_output(&raw).ok_or_else(|| {
        AuthError::Config(format!("secret file {} is empty", path.display()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_secret() {
        assert_eq!(parse_secret_output("glpat-abc123\n"), Some("glpat-abc123".into()));
    }

    #[test]
    fn skips_leading_blank_lines() {
        assert_eq!(parse_secret_output("\n\n  tok  \nignored"), Some("tok".into()));
    }

    #[test]
    fn prefers_token_field() {
        let out = r#"{"access_token":"b","token":"a","password":"c"}"#;
        assert_eq!(parse_secret_output(out), Some("a".into()));
    }

    #[test]
    fn falls_through_field_priority() {
        assert_eq!(
            parse_secret_output(r#"{"password":"c","access_token":"b"}"#),
            Some("b".into())
        );
        assert_eq!(parse_secret_output(r#"{"password":"c"}"#), Some("c".into()));
    }

    #[test]
    fn structured_output_without_fields_is_rejected() {
        assert_eq!(parse_secret_output(r#"{"user":"me"}"#), None);
        assert_eq!(parse_secret_output(r#"{"token":""}"#), None);
    }

    #[test]
    fn empty_output_is_rejected() {
        assert_eq!(parse_secret_output(""), None);
        assert_eq!(parse_secret_output("   \n \n"), None);
    }

    #[tokio::test]
    async fn command_timeout_aborts() {
        let err = run_secret_command("sleep 5", Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn command_failure_surfaces_stderr() {
        let err = run_secret_command("echo nope >&2; exit 3", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("nope"));
    }

    #[tokio::test]
    async fn command_json_output_resolves() {
        let secret =
            run_secret_command("echo '{\"access_token\":\"abc\"}'", Duration::from_secs(5))
                .await
                .unwrap();
        assert_eq!(secret, "abc");
    }
}
