//! Runtime configuration.
//!
//! The policy file doubles as the gateway's configuration: its `settings`
//! block carries the log directory, dashboard address, approval timeout, and
//! the optional secret-scanner and rate-limit sections. This module resolves
//! those settings into a typed [`Config`] with defaults applied, durations
//! parsed, and `~` expanded. Configuration failures are fatal at startup;
//! nothing partial-loads.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::policy::{self, PolicyError, PolicyFile, Settings};
use crate::Verdict;

/// Default dashboard listen address.
pub const DEFAULT_DASHBOARD_ADDR: &str = "127.0.0.1:8080";

/// Default approval timeout.
pub const DEFAULT_APPROVAL_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Default audit log directory (before `~` expansion).
pub const DEFAULT_LOG_DIR: &str = "~/.toolgate/logs";

/// Default Shannon-entropy threshold for the secret scanner.
pub const DEFAULT_ENTROPY_THRESHOLD: f64 = 4.5;

/// Resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub policy: PolicyFile,
    pub policy_path: Option<PathBuf>,
    pub default_action: Verdict,
    pub log_dir: PathBuf,
    pub dashboard_addr: String,
    pub approval_timeout: Duration,
    pub secret_scanner: Option<SecretScannerConfig>,
    pub rate_limit: Option<RateLimitConfig>,
}

/// Resolved secret scanner configuration.
#[derive(Debug, Clone, Copy)]
pub struct SecretScannerConfig {
    pub entropy_threshold: f64,
}

/// Resolved sliding-window rate limits.
#[derive(Debug, Clone, Default)]
pub struct RateLimitConfig {
    pub global: Option<RateLimit>,
    pub per_tool: HashMap<String, RateLimit>,
}

/// One resolved rate limit.
#[derive(Debug, Clone, Copy)]
pub struct RateLimit {
    pub max: usize,
    pub window: Duration,
}

/// Configuration failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error("invalid {field} duration {value:?}: {reason}")]
    InvalidDuration {
        field: &'static str,
        value: String,
        reason: String,
    },
}

impl Config {
    /// Load and resolve configuration from a policy file path.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let policy = policy::load_file(path)?;
        Self::from_policy(policy, Some(path.to_path_buf()))
    }

    /// Resolve configuration from an already-loaded policy file.
    pub fn from_policy(
        policy: PolicyFile,
        policy_path: Option<PathBuf>,
    ) -> Result<Self, ConfigError> {
        let settings = &policy.settings;

        let default_action = settings.default_action.unwrap_or(Verdict::Deny);

        let log_dir = expand_home(
            settings
                .log_dir
                .as_deref()
                .filter(|s| !s.is_empty())
                .unwrap_or(DEFAULT_LOG_DIR),
        );

        let dashboard_addr = settings
            .dashboard_addr
            .clone()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| DEFAULT_DASHBOARD_ADDR.to_string());

        let approval_timeout = match settings.approval_timeout.as_deref() {
            Some(value) if !value.is_empty() => parse_duration("approval_timeout", value)?,
            _ => DEFAULT_APPROVAL_TIMEOUT,
        };

        let secret_scanner = resolve_secret_scanner(settings);
        let rate_limit = resolve_rate_limit(settings)?;

        Ok(Config {
            policy,
            policy_path,
            default_action,
            log_dir,
            dashboard_addr,
            approval_timeout,
            secret_scanner,
            rate_limit,
        })
    }
}

impl Default for Config {
    /// Configuration for the no-config-file case: deny everything by default.
    fn default() -> Self {
        Config {
            policy: PolicyFile {
                version: 1,
                settings: Settings::default(),
                rules: Vec::new(),
            },
            policy_path: None,
            default_action: Verdict::Deny,
            log_dir: expand_home(DEFAULT_LOG_DIR),
            dashboard_addr: DEFAULT_DASHBOARD_ADDR.to_string(),
            approval_timeout: DEFAULT_APPROVAL_TIMEOUT,
            secret_scanner: None,
            rate_limit: None,
        }
    }
}

fn resolve_secret_scanner(settings: &Settings) -> Option<SecretScannerConfig> {
    let scanner = settings.secret_scanner.as_ref()?;
    if !scanner.enabled {
        return None;
    }
    Some(SecretScannerConfig {
        entropy_threshold: scanner.entropy_threshold.unwrap_or(DEFAULT_ENTROPY_THRESHOLD),
    })
}

fn resolve_rate_limit(settings: &Settings) -> Result<Option<RateLimitConfig>, ConfigError> {
    let Some(raw) = settings.rate_limit.as_ref() else {
        return Ok(None);
    };

    let global = raw
        .global
        .as_ref()
        .map(|rule| {
            Ok::<RateLimit, ConfigError>(RateLimit {
                max: rule.max,
                window: parse_duration("rate_limit window", &rule.window)?,
            })
        })
        .transpose()?;

    let mut per_tool = HashMap::with_capacity(raw.per_tool.len());
    for (tool, rule) in &raw.per_tool {
        per_tool.insert(
            tool.clone(),
            RateLimit {
                max: rule.max,
                window: parse_duration("rate_limit window", &rule.window)?,
            },
        );
    }

    Ok(Some(RateLimitConfig { global, per_tool }))
}

fn parse_duration(field: &'static str, value: &str) -> Result<Duration, ConfigError> {
    humantime::parse_duration(value).map_err(|e| ConfigError::InvalidDuration {
        field,
        value: value.to_string(),
        reason: e.to_string(),
    })
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return Path::new(&home).join(rest);
        }
    }
    PathBuf::from(path)
}
