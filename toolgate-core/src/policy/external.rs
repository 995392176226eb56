//! External policy backend.
//!
//! Adapts a compiled external policy module (an embedded Rego/OPA engine, a
//! WASM bundle, anything that can answer a structured query) to the
//! [`PolicyBackend`] contract. Authoring and compiling the module is the
//! caller's concern; this adapter owns the query shape and the fail-closed
//! result mapping:
//!
//! | Module behavior            | Mapped result                      |
//! |----------------------------|------------------------------------|
//! | undefined (no result)      | deny, rule `_opa_default`          |
//! | evaluation error           | deny, rule `_opa_error`            |
//! | structurally unexpected    | deny, rule `_opa_parse_error`      |

use std::sync::Arc;

use arc_swap::ArcSwapAny;
use serde_json::{json, Value};

use crate::Verdict;

use super::{EvalInput, EvalResult, PolicyBackend, PolicyError};

/// Rule name recorded when the module produced no result.
pub const OPA_DEFAULT_RULE: &str = "_opa_default";
/// Rule name recorded when module evaluation failed.
pub const OPA_ERROR_RULE: &str = "_opa_error";
/// Rule name recorded when the module result had an unexpected shape.
pub const OPA_PARSE_ERROR_RULE: &str = "_opa_parse_error";

/// Error surfaced by a compiled policy module.
#[derive(Debug, thiserror::Error)]
pub enum ExternalPolicyError {
    #[error("policy module failed to compile: {reason}")]
    Compile { reason: String },

    #[error("policy evaluation failed: {reason}")]
    Evaluation { reason: String },
}

/// A compiled external policy module.
///
/// `query` receives `{method, tool, arguments}` and returns the module's
/// result document, or `None` when the decision is undefined.
pub trait CompiledPolicyModule: Send + Sync {
    fn query(&self, input: &Value) -> Result<Option<Value>, ExternalPolicyError>;
}

type ModuleLoader =
    Box<dyn Fn() -> Result<Arc<Box<dyn CompiledPolicyModule>>, PolicyError> + Send + Sync>;

/// [`PolicyBackend`] over a compiled external module.
///
/// When configured, this backend replaces the declarative engine; the rest of
/// the gateway only sees the `PolicyBackend` contract. `reload` re-runs the
/// loader and swaps the module atomically.
pub struct ExternalEngine {
    module: ArcSwapAny<Arc<Box<dyn CompiledPolicyModule>>>,
    loader: ModuleLoader,
}

impl ExternalEngine {
    /// Build the engine; the loader is invoked once immediately and again on
    /// every `reload`.
    pub fn new(loader: ModuleLoader) -> Result<Self, PolicyError> {
        let module = loader()?;
        Ok(Self {
            module: ArcSwapAny::new(module),
            loader,
        })
    }
}

impl PolicyBackend for ExternalEngine {
    fn evaluate(&self, input: &EvalInput) -> Result<EvalResult, PolicyError> {
        let module = self.module.load_full();

        let query_input = json!({
            "method": input.method,
            "tool": input.tool,
            "arguments": input.arguments.clone().unwrap_or(Value::Null),
        });

        let document = match module.query(&query_input) {
            Ok(Some(document)) => document,
            Ok(None) => {
                return Ok(EvalResult {
                    verdict: Verdict::Deny,
                    rule: OPA_DEFAULT_RULE.to_string(),
                    message: "external policy returned no result".to_string(),
                });
            }
            Err(e) => {
                return Ok(EvalResult {
                    verdict: Verdict::Deny,
                    rule: OPA_ERROR_RULE.to_string(),
                    message: format!("external policy evaluation error: {e}"),
                });
            }
        };

        Ok(parse_result(&document))
    }

    fn reload(&self) -> Result<(), PolicyError> {
        let module = (self.loader)()?;
        self.module.store(module);
        Ok(())
    }
}

/// Map the module's result document to an [`EvalResult`].
///
/// A missing or unknown `verdict` stays deny; `rule_name` and `message` are
/// optional strings.
fn parse_result(document: &Value) -> EvalResult {
    let Some(fields) = document.as_object() else {
        return EvalResult {
            verdict: Verdict::Deny,
            rule: OPA_PARSE_ERROR_RULE.to_string(),
            message: "unexpected external policy result type".to_string(),
        };
    };

    let verdict = fields
        .get("verdict")
        .and_then(Value::as_str)
        .and_then(|v| v.parse().ok())
        .unwrap_or(Verdict::Deny);

    EvalResult {
        verdict,
        rule: fields
            .get("rule_name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        message: fields
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedModule {
        result: Result<Option<Value>, fn() -> ExternalPolicyError>,
    }

    impl CompiledPolicyModule for FixedModule {
        fn query(&self, _input: &Value) -> Result<Option<Value>, ExternalPolicyError> {
            match &self.result {
                Ok(v) => Ok(v.clone()),
                Err(make) => Err(make()),
            }
        }
    }

    fn engine_returning(result: Result<Option<Value>, fn() -> ExternalPolicyError>) -> ExternalEngine {
        ExternalEngine::new(Box::new(move || {
            Ok(Arc::new(Box::new(FixedModule {
                result: result.clone(),
            }) as Box<dyn CompiledPolicyModule>))
        }))
        .unwrap()
    }

    fn probe() -> EvalInput {
        EvalInput {
            method: "tools/call".to_string(),
            tool: "write_file".to_string(),
            arguments: Some(serde_json::json!({"path": "/tmp/x"})),
        }
    }

    #[test]
    fn test_well_formed_result() {
        let e = engine_returning(Ok(Some(serde_json::json!({
            "verdict": "allow",
            "rule_name": "allow-writes",
            "message": "ok"
        }))));
        let result = e.evaluate(&probe()).unwrap();
        assert_eq!(result.verdict, Verdict::Allow);
        assert_eq!(result.rule, "allow-writes");
        assert_eq!(result.message, "ok");
    }

    #[test]
    fn test_undefined_maps_to_opa_default() {
        let e = engine_returning(Ok(None));
        let result = e.evaluate(&probe()).unwrap();
        assert_eq!(result.verdict, Verdict::Deny);
        assert_eq!(result.rule, OPA_DEFAULT_RULE);
    }

    #[test]
    fn test_evaluation_error_maps_to_opa_error() {
        let e = engine_returning(Err(|| ExternalPolicyError::Evaluation {
            reason: "boom".to_string(),
        }));
        let result = e.evaluate(&probe()).unwrap();
        assert_eq!(result.verdict, Verdict::Deny);
        assert_eq!(result.rule, OPA_ERROR_RULE);
        assert!(result.message.contains("boom"));
    }

    #[test]
    fn test_non_object_result_maps_to_parse_error() {
        let e = engine_returning(Ok(Some(Value::String("allow".to_string()))));
        let result = e.evaluate(&probe()).unwrap();
        assert_eq!(result.verdict, Verdict::Deny);
        assert_eq!(result.rule, OPA_PARSE_ERROR_RULE);
    }

    #[test]
    fn test_missing_verdict_defaults_to_deny() {
        let e = engine_returning(Ok(Some(serde_json::json!({"rule_name": "partial"}))));
        let result = e.evaluate(&probe()).unwrap();
        assert_eq!(result.verdict, Verdict::Deny);
        assert_eq!(result.rule, "partial");
    }

    #[test]
    fn test_unknown_verdict_string_stays_deny() {
        let e = engine_returning(Ok(Some(serde_json::json!({"verdict": "maybe"}))));
        assert_eq!(e.evaluate(&probe()).unwrap().verdict, Verdict::Deny);
    }

    #[test]
    fn test_reload_swaps_module() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        static CALLS: AtomicUsize = AtomicUsize::new(0);

        struct CountedModule {
            generation: usize,
        }
        impl CompiledPolicyModule for CountedModule {
            fn query(&self, _input: &Value) -> Result<Option<Value>, ExternalPolicyError> {
                Ok(Some(serde_json::json!({
                    "verdict": "allow",
                    "rule_name": format!("gen-{}", self.generation),
                })))
            }
        }

        let e = ExternalEngine::new(Box::new(|| {
            let generation = CALLS.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(Box::new(CountedModule { generation }) as Box<dyn CompiledPolicyModule>))
        }))
        .unwrap();

        assert_eq!(e.evaluate(&probe()).unwrap().rule, "gen-0");
        e.reload().unwrap();
        assert_eq!(e.evaluate(&probe()).unwrap().rule, "gen-1");
    }
}
