//! Runtime configuration.
//!
//! Values come from the environment (with CLI overrides applied by the
//! binary). Launcher scripts sometimes pass values wrapped in shell quotes;
//! those are stripped before use.

use std::path::PathBuf;
use std::time::Duration;

/// Default TCP bind when no Unix socket is configured.
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 28256;

/// Default database file, relative to the working directory.
pub const DEFAULT_DB_PATH: &str = "scheduler.db";

const DEFAULT_TASK_TIMEOUT_SECS: u64 = 900;
const DEFAULT_CONDITION_TIMEOUT_SECS: u64 = 60;

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid configuration value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },
}

/// Resolved process configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite database file.
    pub db_path: PathBuf,
    /// URL prefix the API is mounted under ("/" for none).
    pub base_path: String,
    /// Unix domain socket path; when set, TCP is not bound.
    pub unix_socket: Option<PathBuf>,
    /// Bind a dual-stack IPv6 TCP socket instead of IPv4.
    pub prefer_ipv6: bool,
    pub bind_address: String,
    pub port: u16,
    /// Hard wall-clock bound per task execution.
    pub task_timeout: Duration,
    /// Bound per condition script evaluation.
    pub condition_timeout: Duration,
}

impl Config {
    /// Build from the environment, applying the given CLI overrides.
    pub fn load(
        db: Option<String>,
        base_path: Option<String>,
        unix_socket: Option<String>,
    ) -> Result<Self, ConfigError> {
        let db_path = db
            .as_deref()
            .map(strip_wrapping_quotes)
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DB_PATH));
        let base_path = normalize_base_path(
            base_path
                .as_deref()
                .map(strip_wrapping_quotes)
                .unwrap_or_default()
                .as_str(),
        );
        let unix_socket = unix_socket
            .as_deref()
            .map(strip_wrapping_quotes)
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);

        Ok(Self {
            db_path,
            base_path,
            unix_socket,
            prefer_ipv6: env_flag("SCHEDULER_PREFER_IPV6"),
            bind_address: DEFAULT_BIND_ADDRESS.to_string(),
            port: DEFAULT_PORT,
            task_timeout: Duration::from_secs(env_seconds(
                "SCHEDULER_TASK_TIMEOUT",
                DEFAULT_TASK_TIMEOUT_SECS,
            )?),
            condition_timeout: Duration::from_secs(env_seconds(
                "SCHEDULER_CONDITION_TIMEOUT",
                DEFAULT_CONDITION_TIMEOUT_SECS,
            )?),
        })
    }
}

fn env_seconds(key: &str, default: u64) -> Result<u64, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                reason: format!("expected a number of seconds, got {raw:?}"),
            }),
        Err(_) => Ok(default),
    }
}

fn env_flag(key: &str) -> bool {
    matches!(
        std::env::var(key).as_deref(),
        Ok("1") | Ok("true") | Ok("yes")
    )
}

/// Force a leading slash, trim trailing slashes, empty means root.
pub fn normalize_base_path(raw: &str) -> String {
    let mut base = raw.trim().to_string();
    if base.is_empty() {
        return "/".to_string();
    }
    if !base.starts_with('/') {
        base = format!("/{base}");
    }
    while base.len() > 1 && base.ends_with('/') {
        base.pop();
    }
    base
}

/// Remove one layer of matching wrapping quotes.
pub fn strip_wrapping_quotes(value: &str) -> String {
    let trimmed = value.trim();
    let bytes = trimmed.as_bytes();
    if bytes.len() >= 2
        && bytes[0] == bytes[bytes.len() - 1]
        && (bytes[0] == b'"' || bytes[0] == b'\'')
    {
        return trimmed[1..trimmed.len() - 1].to_string();
    }
    trimmed.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_path_normalization() {
        assert_eq!(normalize_base_path(""), "/");
        assert_eq!(normalize_base_path("  "), "/");
        assert_eq!(normalize_base_path("/"), "/");
        assert_eq!(normalize_base_path("scheduler"), "/scheduler");
        assert_eq!(normalize_base_path("/scheduler/"), "/scheduler");
        assert_eq!(normalize_base_path("/a/b//"), "/a/b");
    }

    #[test]
    fn quote_stripping() {
        assert_eq!(strip_wrapping_quotes("\"/var/db\""), "/var/db");
        assert_eq!(strip_wrapping_quotes("'/var/db'"), "/var/db");
        assert_eq!(strip_wrapping_quotes(" plain "), "plain");
        assert_eq!(strip_wrapping_quotes("\"mismatched'"), "\"mismatched'");
        assert_eq!(strip_wrapping_quotes("\""), "\"");
    }

    #[test]
    fn defaults_applied() {
        let config = Config::load(None, None, None).unwrap();
        assert_eq!(config.db_path, PathBuf::from(DEFAULT_DB_PATH));
        assert_eq!(config.base_path, "/");
        assert!(config.unix_socket.is_none());
        assert_eq!(config.port, DEFAULT_PORT);
    }

    #[test]
    fn cli_values_unquoted() {
        let config = Config::load(
            Some("'/tmp/x.db'".to_string()),
            Some("\"/sched/\"".to_string()),
            Some("''".to_string()),
        )
        .unwrap();
        assert_eq!(config.db_path, PathBuf::from("/tmp/x.db"));
        assert_eq!(config.base_path, "/sched");
        assert!(config.unix_socket.is_none());
    }
}
