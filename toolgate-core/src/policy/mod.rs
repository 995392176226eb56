//! Policy model and evaluation backends.
//!
//! Two interchangeable backends implement the [`PolicyBackend`] contract: the
//! declarative first-match-wins engine over YAML rules ([`yaml::YamlEngine`])
//! and an adapter for externally compiled policy modules
//! ([`external::ExternalEngine`]). The rest of the gateway depends only on
//! the trait.

mod external;
mod loader;
mod yaml;

pub use external::{CompiledPolicyModule, ExternalEngine, ExternalPolicyError};
pub use loader::{load_bytes, load_file};
pub use yaml::YamlEngine;

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::Verdict;

/// Rule name recorded when no declarative rule matched.
pub const DEFAULT_RULE_NAME: &str = "_default";

// ─────────────────────────────────────────────────────────────────────────────
// Policy File Model
// ─────────────────────────────────────────────────────────────────────────────

/// Top-level policy file: version, settings, and an ordered rule list.
///
/// Immutable after load; [`PolicyBackend::reload`] replaces it wholesale.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyFile {
    pub version: u32,
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub rules: Vec<Rule>,
}

/// Global gateway settings carried in the policy file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_action: Option<Verdict>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dashboard_addr: Option<String>,
    /// Humantime duration string, e.g. `"10m"` or `"30s"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_timeout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_scanner: Option<SecretScannerSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimitSettings>,
}

/// Secret scanner toggle and tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretScannerSettings {
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entropy_threshold: Option<f64>,
}

/// Sliding-window rate limit settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateLimitSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub global: Option<RateLimitRule>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub per_tool: HashMap<String, RateLimitRule>,
}

/// One rate limit: at most `max` requests per `window` (humantime string).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitRule {
    pub max: usize,
    pub window: String,
}

/// A single policy rule. Order in the file is significant: evaluation is
/// first-match-wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub name: String,
    #[serde(rename = "match")]
    pub matcher: RuleMatch,
    pub action: Verdict,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Match predicate of a rule. Empty `method`/`tool` match anything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleMatch {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub method: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tool: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub arguments: HashMap<String, ArgumentMatch>,
}

/// Predicate over a single argument value: an exact string, a regex, or
/// (with neither set) match-anything. The key `_any_value` matches when any
/// argument value satisfies the predicate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArgumentMatch {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub exact: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub regex: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// Evaluation Contract
// ─────────────────────────────────────────────────────────────────────────────

/// Input to one policy evaluation.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EvalInput {
    pub method: String,
    pub tool: String,
    pub arguments: Option<Value>,
}

/// Outcome of one policy evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct EvalResult {
    pub verdict: Verdict,
    pub rule: String,
    pub message: String,
}

/// Contract shared by all policy backends.
///
/// `evaluate` must be a pure function of the input and the currently loaded
/// rule set; `reload` swaps the rule set atomically so concurrent evaluations
/// observe either the old or the new set in its entirety.
pub trait PolicyBackend: Send + Sync {
    fn evaluate(&self, input: &EvalInput) -> Result<EvalResult, PolicyError>;

    fn reload(&self) -> Result<(), PolicyError>;

    /// Currently loaded declarative policy, when the backend has one to show.
    fn policy(&self) -> Option<Arc<PolicyFile>> {
        None
    }
}

/// Policy loading and evaluation failures.
///
/// Load failures are fatal at startup and reject a reload; the previous rule
/// set stays in effect (never partial-loads).
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("reading policy file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("parsing policy YAML: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("unsupported policy version: {found} (expected 1)")]
    UnsupportedVersion { found: u32 },

    #[error("rule {index}: name is required")]
    MissingRuleName { index: usize },

    #[error("duplicate rule name: {name:?}")]
    DuplicateRuleName { name: String },

    #[error("rule {rule:?}: match.method is required")]
    MissingMatchMethod { rule: String },

    #[error("rule {rule:?}: argument {key:?} regex invalid: {source}")]
    InvalidRegex {
        rule: String,
        key: String,
        #[source]
        source: regex::Error,
    },

    #[error("policy engine has no reloadable source")]
    NoSource,

    #[error("external policy error: {0}")]
    External(#[from] ExternalPolicyError),
}

// ─────────────────────────────────────────────────────────────────────────────
// Standalone Check API
// ─────────────────────────────────────────────────────────────────────────────

/// Body of a side-effect-free policy check (CLI `check`, `POST /api/v1/check`).
#[derive(Debug, Clone, Deserialize)]
pub struct CheckRequest {
    pub method: String,
    #[serde(default)]
    pub tool: Option<String>,
    #[serde(default)]
    pub arguments: Option<Value>,
}

/// Result of a policy check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResponse {
    pub verdict: Verdict,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub rule: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

impl CheckRequest {
    pub fn into_eval_input(self) -> EvalInput {
        EvalInput {
            method: self.method,
            tool: self.tool.unwrap_or_default(),
            arguments: self.arguments,
        }
    }
}

impl From<EvalResult> for CheckResponse {
    fn from(result: EvalResult) -> Self {
        CheckResponse {
            verdict: result.verdict,
            rule: result.rule,
            message: result.message,
        }
    }
}
