//! Declarative first-match-wins policy engine.
//!
//! Rules are compiled once at load (regexes included) into an immutable set
//! held behind an `ArcSwap`: evaluation is lock-free, and `reload` swaps the
//! whole compiled set atomically, so a concurrent evaluation sees either the
//! old or the new rule set in its entirety.

use std::path::PathBuf;
use std::sync::Arc;

use arc_swap::ArcSwap;
use regex::Regex;
use serde_json::Value;

use crate::Verdict;

use super::{
    loader, ArgumentMatch, EvalInput, EvalResult, PolicyBackend, PolicyError, PolicyFile, Rule,
    DEFAULT_RULE_NAME,
};

/// The declarative YAML backend.
pub struct YamlEngine {
    compiled: ArcSwap<CompiledPolicy>,
    path: Option<PathBuf>,
}

struct CompiledPolicy {
    file: Arc<PolicyFile>,
    rules: Vec<CompiledRule>,
    default_action: Verdict,
}

struct CompiledRule {
    name: String,
    method: String,
    tool: String,
    arguments: Vec<(String, CompiledMatch)>,
    action: Verdict,
    message: String,
}

enum CompiledMatch {
    Exact(String),
    Pattern(Regex),
    Any,
}

impl YamlEngine {
    /// Load the engine from a policy file path. `reload` re-reads this path.
    pub fn from_path(path: impl Into<PathBuf>) -> Result<Self, PolicyError> {
        let path = path.into();
        let file = loader::load_file(&path)?;
        Ok(Self {
            compiled: ArcSwap::from_pointee(compile(file)?),
            path: Some(path),
        })
    }

    /// Build the engine from an already-loaded policy. `reload` is a no-op
    /// error for path-less engines.
    pub fn from_policy(file: PolicyFile) -> Result<Self, PolicyError> {
        Ok(Self {
            compiled: ArcSwap::from_pointee(compile(file)?),
            path: None,
        })
    }
}

impl PolicyBackend for YamlEngine {
    fn evaluate(&self, input: &EvalInput) -> Result<EvalResult, PolicyError> {
        let compiled = self.compiled.load();

        for rule in &compiled.rules {
            if rule.matches(input) {
                return Ok(EvalResult {
                    verdict: rule.action,
                    rule: rule.name.clone(),
                    message: rule.message.clone(),
                });
            }
        }

        Ok(EvalResult {
            verdict: compiled.default_action,
            rule: DEFAULT_RULE_NAME.to_string(),
            message: "no matching rule; default action applied".to_string(),
        })
    }

    fn reload(&self) -> Result<(), PolicyError> {
        let path = self.path.as_ref().ok_or(PolicyError::NoSource)?;
        let file = loader::load_file(path)?;
        let compiled = compile(file)?;
        self.compiled.store(Arc::new(compiled));
        Ok(())
    }

    fn policy(&self) -> Option<Arc<PolicyFile>> {
        Some(self.compiled.load().file.clone())
    }
}

fn compile(file: PolicyFile) -> Result<CompiledPolicy, PolicyError> {
    let default_action = file.settings.default_action.unwrap_or(Verdict::Deny);

    let mut rules = Vec::with_capacity(file.rules.len());
    for rule in &file.rules {
        rules.push(compile_rule(rule)?);
    }

    Ok(CompiledPolicy {
        file: Arc::new(file),
        rules,
        default_action,
    })
}

fn compile_rule(rule: &Rule) -> Result<CompiledRule, PolicyError> {
    let mut arguments = Vec::with_capacity(rule.matcher.arguments.len());
    for (key, arg) in &rule.matcher.arguments {
        arguments.push((key.clone(), compile_match(rule, key, arg)?));
    }

    Ok(CompiledRule {
        name: rule.name.clone(),
        method: rule.matcher.method.clone(),
        tool: rule.matcher.tool.clone(),
        arguments,
        action: rule.action,
        message: rule.message.clone().unwrap_or_default(),
    })
}

fn compile_match(rule: &Rule, key: &str, arg: &ArgumentMatch) -> Result<CompiledMatch, PolicyError> {
    if !arg.exact.is_empty() {
        return Ok(CompiledMatch::Exact(arg.exact.clone()));
    }
    if !arg.regex.is_empty() {
        let pattern = Regex::new(&arg.regex).map_err(|source| PolicyError::InvalidRegex {
            rule: rule.name.clone(),
            key: key.to_string(),
            source,
        })?;
        return Ok(CompiledMatch::Pattern(pattern));
    }
    Ok(CompiledMatch::Any)
}

impl CompiledRule {
    fn matches(&self, input: &EvalInput) -> bool {
        if !self.method.is_empty() && self.method != input.method {
            return false;
        }
        if !self.tool.is_empty() && self.tool != input.tool {
            return false;
        }

        if self.arguments.is_empty() {
            return true;
        }

        let Some(args) = input.arguments.as_ref().and_then(Value::as_object) else {
            return false;
        };

        self.arguments.iter().all(|(key, predicate)| {
            if key == "_any_value" {
                args.values().any(|v| predicate.matches(v))
            } else {
                args.get(key).is_some_and(|v| predicate.matches(v))
            }
        })
    }
}

impl CompiledMatch {
    fn matches(&self, value: &Value) -> bool {
        let candidate = stringify(value);
        match self {
            CompiledMatch::Exact(expected) => candidate == *expected,
            CompiledMatch::Pattern(pattern) => pattern.is_match(&candidate),
            CompiledMatch::Any => true,
        }
    }
}

/// Stringify an argument value for predicate matching: strings compare by
/// their contents, everything else by its JSON text.
fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
