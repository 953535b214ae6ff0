//! Textcast configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Result, TextcastError};

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TextcastConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub transport: TransportConfig,
}

impl TextcastConfig {
    /// Load config from `$TEXTCAST_CONFIG` or the default path, falling back
    /// to defaults when no file exists.
    pub fn load() -> Result<Self> {
        let path = std::env::var("TEXTCAST_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| Self::default_path());
        if path.exists() {
            Self::load_from(&path)
        } else {
            tracing::debug!("No config at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| TextcastError::Config(format!("Failed to read config: {e}")))?;
        Self::from_toml(&content)
    }

    /// Parse config from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| TextcastError::Config(format!("Failed to parse config: {e}")))?;
        config.retry.validate()?;
        Ok(config)
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the Textcast home directory (~/.textcast).
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".textcast")
    }
}

/// SQLite database location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

fn default_db_path() -> String { "~/.textcast/textcast.db".into() }

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { path: default_db_path() }
    }
}

/// Gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_host")]
    pub host: String,
    /// Allowed CORS origins. Empty means any origin.
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

fn default_port() -> u16 { 8787 }
fn default_host() -> String { "127.0.0.1".into() }

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            cors_origins: Vec::new(),
        }
    }
}

/// Due-message scanner and dispatch queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Run the scanner and retry loops in-process. Deployments that only
    /// serve a pull-based delivery agent can turn this off.
    #[serde(default = "bool_true")]
    pub enabled: bool,
    #[serde(default = "default_scan_interval")]
    pub scan_interval_secs: u64,
    #[serde(default = "default_scan_batch")]
    pub scan_batch_size: usize,
    /// A claimed row still `pending` after this long is re-selected.
    #[serde(default = "default_claim_timeout")]
    pub claim_timeout_secs: u64,
    #[serde(default = "default_queue_capacity")]
    pub dispatch_queue_capacity: usize,
    #[serde(default = "default_dispatch_concurrency")]
    pub dispatch_concurrency: usize,
    /// Deliver manual messages from this process. Off when an external
    /// agent pulls them through the API.
    #[serde(default)]
    pub push_manual: bool,
    /// Deliver study messages from this process.
    #[serde(default = "bool_true")]
    pub push_study: bool,
}

fn bool_true() -> bool { true }
fn default_scan_interval() -> u64 { 60 }
fn default_scan_batch() -> usize { 50 }
fn default_claim_timeout() -> u64 { 15 * 60 }
fn default_queue_capacity() -> usize { 256 }
fn default_dispatch_concurrency() -> usize { 4 }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            scan_interval_secs: default_scan_interval(),
            scan_batch_size: default_scan_batch(),
            claim_timeout_secs: default_claim_timeout(),
            dispatch_queue_capacity: default_queue_capacity(),
            dispatch_concurrency: default_dispatch_concurrency(),
            push_manual: false,
            push_study: true,
        }
    }
}

/// Retry controller configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_retry_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Minimum age of the last attempt before a retry.
    #[serde(default = "default_min_cooldown")]
    pub min_cooldown_secs: u64,
    /// Failures older than this are abandoned for manual handling.
    #[serde(default = "default_max_staleness")]
    pub max_staleness_secs: u64,
    #[serde(default = "default_retry_batch")]
    pub batch_size: usize,
}

fn default_retry_interval() -> u64 { 60 * 60 }
fn default_max_attempts() -> u32 { 3 }
fn default_min_cooldown() -> u64 { 60 * 60 }
fn default_max_staleness() -> u64 { 24 * 60 * 60 }
fn default_retry_batch() -> usize { 25 }

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_retry_interval(),
            max_attempts: default_max_attempts(),
            min_cooldown_secs: default_min_cooldown(),
            max_staleness_secs: default_max_staleness(),
            batch_size: default_retry_batch(),
        }
    }
}

impl RetryConfig {
    /// The retry window must be non-empty.
    pub fn validate(&self) -> Result<()> {
        if self.min_cooldown_secs >= self.max_staleness_secs {
            return Err(TextcastError::Config(format!(
                "retry.min_cooldown_secs ({}) must be below retry.max_staleness_secs ({})",
                self.min_cooldown_secs, self.max_staleness_secs
            )));
        }
        Ok(())
    }
}

/// Outbound SMS transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// "log" (dry run), "webhook", or "twilio".
    #[serde(default = "default_transport_kind")]
    pub kind: String,
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub account_sid: String,
    #[serde(default)]
    pub auth_token: String,
    #[serde(default)]
    pub from_number: String,
    #[serde(default = "default_transport_timeout")]
    pub timeout_secs: u64,
    /// Country calling code applied to national-format numbers.
    #[serde(default = "default_country_code")]
    pub default_country_code: String,
}

fn default_transport_kind() -> String { "log".into() }
fn default_transport_timeout() -> u64 { 30 }
fn default_country_code() -> String { "1".into() }

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            kind: default_transport_kind(),
            endpoint: String::new(),
            api_key: String::new(),
            account_sid: String::new(),
            auth_token: String::new(),
            from_number: String::new(),
            timeout_secs: default_transport_timeout(),
            default_country_code: default_country_code(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_design_targets() {
        let cfg = TextcastConfig::default();
        assert_eq!(cfg.scheduler.scan_interval_secs, 60);
        assert_eq!(cfg.scheduler.scan_batch_size, 50);
        assert_eq!(cfg.retry.max_attempts, 3);
        assert_eq!(cfg.retry.batch_size, 25);
        assert_eq!(cfg.retry.min_cooldown_secs, 3600);
        assert_eq!(cfg.retry.max_staleness_secs, 86400);
        assert_eq!(cfg.transport.kind, "log");
        assert!(!cfg.scheduler.push_manual);
        assert!(cfg.scheduler.push_study);
    }

    #[test]
    fn test_partial_toml() {
        let cfg = TextcastConfig::from_toml(
            r#"
            [gateway]
            port = 9000

            [retry]
            max_attempts = 5

            [transport]
            kind = "twilio"
            account_sid = "AC123"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.gateway.port, 9000);
        assert_eq!(cfg.gateway.host, "127.0.0.1");
        assert_eq!(cfg.retry.max_attempts, 5);
        assert_eq!(cfg.retry.interval_secs, 3600);
        assert_eq!(cfg.transport.kind, "twilio");
        assert_eq!(cfg.transport.default_country_code, "1");
    }

    #[test]
    fn test_empty_retry_window_rejected() {
        let err = TextcastConfig::from_toml(
            "[retry]\nmin_cooldown_secs = 7200\nmax_staleness_secs = 3600\n",
        );
        assert!(matches!(err, Err(TextcastError::Config(_))));
    }
}
