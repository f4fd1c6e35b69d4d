//! Server configuration.

use crate::webhook::WebhookConfig;
use edgesync_engine::{EngineConfig, RetryConfig};
use edgesync_protocol::ConflictPolicy;
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use zeroize::Zeroizing;

/// Errors raised while reading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required variable is unset or blank.
    #[error("missing required environment variable: {0}")]
    MissingVar(&'static str),
    /// A variable is set to something unusable.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Configuration for the sync server.
#[derive(Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Directory holding engine state and run history.
    pub state_dir: PathBuf,
    /// Path of the primary SQLite database.
    pub primary_path: PathBuf,
    /// Query endpoint of the replica.
    pub replica_url: String,
    /// Bearer token for the replica endpoint.
    pub replica_token: Zeroizing<String>,
    /// Webhook verification settings.
    pub webhook: WebhookConfig,
    /// Timeout applied to each store call.
    pub call_timeout: Duration,
    /// Attempts per store call, including the first.
    pub retry_attempts: u32,
    /// Policy for divergent entities.
    pub conflict_policy: ConflictPolicy,
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("bind_addr", &self.bind_addr)
            .field("state_dir", &self.state_dir)
            .field("primary_path", &self.primary_path)
            .field("replica_url", &self.replica_url)
            .field("replica_token", &"[REDACTED]")
            .field("webhook", &self.webhook)
            .field("call_timeout", &self.call_timeout)
            .field("retry_attempts", &self.retry_attempts)
            .field("conflict_policy", &self.conflict_policy)
            .finish()
    }
}

impl ServerConfig {
    /// Reads `EDGESYNC_*` variables from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let values: HashMap<String, String> = env::vars().collect();
        Self::from_lookup(|name| values.get(name).cloned())
    }

    /// Reads configuration through `lookup`.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `EDGESYNC_BIND_ADDR` | `127.0.0.1:8787` |
    /// | `EDGESYNC_STATE_DIR` | `.edgesync` |
    /// | `EDGESYNC_PRIMARY_PATH` | required |
    /// | `EDGESYNC_REPLICA_URL` | required |
    /// | `EDGESYNC_REPLICA_TOKEN` | required |
    /// | `EDGESYNC_WEBHOOK_SECRET` | required, 16 bytes or more |
    /// | `EDGESYNC_WEBHOOK_SKEW_SECS` | `300` |
    /// | `EDGESYNC_CALL_TIMEOUT_MS` | `30000` |
    /// | `EDGESYNC_RETRY_ATTEMPTS` | `3` |
    /// | `EDGESYNC_CONFLICT_POLICY` | `lastWriteWins` |
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let bind_addr = value_or_default(&lookup, "EDGESYNC_BIND_ADDR", "127.0.0.1:8787")
            .parse::<SocketAddr>()
            .map_err(|_| {
                ConfigError::Invalid("EDGESYNC_BIND_ADDR must be a socket address".to_string())
            })?;
        let state_dir = PathBuf::from(value_or_default(&lookup, "EDGESYNC_STATE_DIR", ".edgesync"));
        let primary_path = PathBuf::from(required_trimmed(&lookup, "EDGESYNC_PRIMARY_PATH")?);

        let replica_url = required_trimmed(&lookup, "EDGESYNC_REPLICA_URL")?;
        if !is_http_url(&replica_url) {
            return Err(ConfigError::Invalid(
                "EDGESYNC_REPLICA_URL must start with http:// or https://".to_string(),
            ));
        }
        let replica_token = Zeroizing::new(required_trimmed(&lookup, "EDGESYNC_REPLICA_TOKEN")?);

        let webhook_secret = Zeroizing::new(required_trimmed(&lookup, "EDGESYNC_WEBHOOK_SECRET")?);
        if webhook_secret.len() < 16 {
            return Err(ConfigError::Invalid(
                "EDGESYNC_WEBHOOK_SECRET must be at least 16 bytes".to_string(),
            ));
        }
        let skew_secs = parse_in_range(&lookup, "EDGESYNC_WEBHOOK_SKEW_SECS", "300", 1, 3600)?;
        let webhook = WebhookConfig::new(webhook_secret.as_bytes().to_vec())
            .with_max_skew(Duration::from_secs(skew_secs));

        let call_timeout_ms =
            parse_in_range(&lookup, "EDGESYNC_CALL_TIMEOUT_MS", "30000", 100, 600_000)?;
        let retry_attempts = parse_in_range(&lookup, "EDGESYNC_RETRY_ATTEMPTS", "3", 1, 10)?;
        let conflict_policy = parse_policy(&value_or_default(
            &lookup,
            "EDGESYNC_CONFLICT_POLICY",
            "lastWriteWins",
        ))?;

        Ok(Self {
            bind_addr,
            state_dir,
            primary_path,
            replica_url,
            replica_token,
            webhook,
            call_timeout: Duration::from_millis(call_timeout_ms),
            retry_attempts: retry_attempts as u32,
            conflict_policy,
        })
    }

    /// Engine settings derived from this configuration.
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig::new()
            .with_call_timeout(self.call_timeout)
            .with_retry(RetryConfig::new(self.retry_attempts))
            .with_conflict_policy(self.conflict_policy)
    }
}

fn parse_policy(value: &str) -> Result<ConflictPolicy, ConfigError> {
    match value.to_ascii_lowercase().replace(['-', '_'], "").as_str() {
        "lastwritewins" | "lww" => Ok(ConflictPolicy::LastWriteWins),
        "primarywins" => Ok(ConflictPolicy::PrimaryWins),
        "replicawins" => Ok(ConflictPolicy::ReplicaWins),
        "manual" => Ok(ConflictPolicy::Manual),
        _ => Err(ConfigError::Invalid(format!(
            "EDGESYNC_CONFLICT_POLICY must be lastWriteWins, primaryWins, replicaWins \
             or manual, got {value}"
        ))),
    }
}

fn parse_in_range(
    lookup: impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: &str,
    min: u64,
    max: u64,
) -> Result<u64, ConfigError> {
    let value = value_or_default(lookup, name, default)
        .parse::<u64>()
        .map_err(|_| ConfigError::Invalid(format!("{name} must be an integer in [{min}, {max}]")))?;
    if !(min..=max).contains(&value) {
        return Err(ConfigError::Invalid(format!(
            "{name} must be in [{min}, {max}]"
        )));
    }
    Ok(value)
}

fn value_or_default(lookup: impl Fn(&str) -> Option<String>, name: &str, default: &str) -> String {
    optional_trimmed(lookup, name).unwrap_or_else(|| default.to_string())
}

fn required_trimmed(
    lookup: impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<String, ConfigError> {
    optional_trimmed(lookup, name).ok_or(ConfigError::MissingVar(name))
}

fn optional_trimmed(lookup: impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    lookup(name).and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn is_http_url(value: &str) -> bool {
    value.starts_with("http://") || value.starts_with("https://")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> HashMap<&'static str, &'static str> {
        HashMap::from([
            ("EDGESYNC_PRIMARY_PATH", "/var/lib/edgesync/primary.db"),
            ("EDGESYNC_REPLICA_URL", "https://replica.example.test/query"),
            ("EDGESYNC_REPLICA_TOKEN", "replica-token"),
            ("EDGESYNC_WEBHOOK_SECRET", "0123456789abcdef-secret"),
        ])
    }

    fn load(map: &HashMap<&str, &str>) -> Result<ServerConfig, ConfigError> {
        ServerConfig::from_lookup(|key| map.get(key).map(|value| (*value).to_string()))
    }

    #[test]
    fn defaults_apply() {
        let config = load(&base()).unwrap();
        assert_eq!(config.bind_addr, "127.0.0.1:8787".parse().unwrap());
        assert_eq!(config.state_dir, PathBuf::from(".edgesync"));
        assert_eq!(config.webhook.max_skew, Duration::from_secs(300));
        assert_eq!(config.call_timeout, Duration::from_secs(30));
        assert_eq!(config.retry_attempts, 3);
        assert_eq!(config.conflict_policy, ConflictPolicy::LastWriteWins);

        let engine = config.engine_config();
        assert_eq!(engine.retry.max_attempts, 3);
        assert_eq!(engine.call_timeout, Duration::from_secs(30));
    }

    #[test]
    fn requires_replica_and_secret() {
        let mut map = base();
        map.remove("EDGESYNC_WEBHOOK_SECRET");
        let err = load(&map).unwrap_err();
        assert!(err.to_string().contains("EDGESYNC_WEBHOOK_SECRET"));

        let mut map = base();
        map.insert("EDGESYNC_REPLICA_URL", "   ");
        assert!(matches!(
            load(&map),
            Err(ConfigError::MissingVar("EDGESYNC_REPLICA_URL"))
        ));
    }

    #[test]
    fn rejects_invalid_values() {
        for (key, value) in [
            ("EDGESYNC_REPLICA_URL", "ftp://replica"),
            ("EDGESYNC_WEBHOOK_SECRET", "short"),
            ("EDGESYNC_RETRY_ATTEMPTS", "0"),
            ("EDGESYNC_CALL_TIMEOUT_MS", "soon"),
            ("EDGESYNC_BIND_ADDR", "localhost"),
            ("EDGESYNC_CONFLICT_POLICY", "coinFlip"),
        ] {
            let mut map = base();
            map.insert(key, value);
            assert!(
                matches!(load(&map), Err(ConfigError::Invalid(_))),
                "{key}={value} should be rejected"
            );
        }
    }

    #[test]
    fn reads_overrides() {
        let mut map = base();
        map.insert("EDGESYNC_BIND_ADDR", "0.0.0.0:9000");
        map.insert("EDGESYNC_CONFLICT_POLICY", "manual");
        map.insert("EDGESYNC_WEBHOOK_SKEW_SECS", "60");
        let config = load(&map).unwrap();
        assert_eq!(config.bind_addr.port(), 9000);
        assert_eq!(config.conflict_policy, ConflictPolicy::Manual);
        assert_eq!(config.webhook.max_skew, Duration::from_secs(60));
    }

    #[test]
    fn debug_redacts_secrets() {
        let debug = format!("{:?}", load(&base()).unwrap());
        assert!(!debug.contains("replica-token"));
        assert!(!debug.contains("0123456789abcdef-secret"));
        assert!(debug.contains("[REDACTED]"));
    }
}
