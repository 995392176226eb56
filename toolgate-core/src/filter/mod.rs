//! The filter chain: an ordered composition of stages over a per-message
//! context.
//!
//! Each message gets one [`FilterContext`]; the interposer creates it, the
//! chain's stages fill in the parsed envelope and the decision slots, and the
//! context is finally surrendered to the audit sink. A stage may halt the
//! pipeline by setting `halted`; later stages still run (so audit always
//! observes the decided verdict) but consult the flag and become no-ops where
//! appropriate.

mod audit;
mod builder;
mod outbound;
mod parse;
mod policy;
mod ratelimit;
mod secret;

pub use audit::AuditStage;
pub use builder::{build_inbound_chain, build_outbound_chain, ChainConfig};
pub use outbound::OutboundParseStage;
pub use parse::ParseStage;
pub use policy::PolicyStage;
pub use ratelimit::RateLimitStage;
pub use secret::SecretScanStage;

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::audit::{AuditError, AuditRecord};
use crate::jsonrpc::{CodecError, JsonRpcMessage};
use crate::policy::PolicyError;
use crate::{Direction, Verdict};

/// Per-message state threaded through the chain.
pub struct FilterContext {
    /// The original frame, preserved byte-for-byte for forwarding.
    pub raw: Vec<u8>,
    pub direction: Direction,
    pub message: Option<JsonRpcMessage>,
    pub method: String,
    /// Tool name for `tools/call` requests.
    pub tool: String,
    /// Raw `arguments` of a `tools/call` request, kept for audit fidelity.
    pub arguments: Option<Value>,
    pub verdict: Verdict,
    pub matched_rule: String,
    pub verdict_message: String,
    pub timestamp: DateTime<Utc>,
    pub started_at: Instant,
    /// Set when a stage decided the message's fate; later stages no-op.
    pub halted: bool,
}

impl FilterContext {
    pub fn new(raw: Vec<u8>, direction: Direction) -> Self {
        Self {
            raw,
            direction,
            message: None,
            method: String::new(),
            tool: String::new(),
            arguments: None,
            verdict: Verdict::Allow,
            matched_rule: String::new(),
            verdict_message: String::new(),
            timestamp: Utc::now(),
            started_at: Instant::now(),
            halted: false,
        }
    }

    /// Snapshot this context as an audit record.
    pub fn to_audit_record(&self) -> AuditRecord {
        AuditRecord {
            id: String::new(),
            timestamp: self.timestamp,
            direction: self.direction,
            method: self.method.clone(),
            tool: self.tool.clone(),
            arguments: self.arguments.clone(),
            verdict: self.verdict,
            rule: self.matched_rule.clone(),
            message: self.verdict_message.clone(),
            raw_size: self.raw.len(),
            duration_us: self.started_at.elapsed().as_micros() as u64,
        }
    }
}

/// One step of the pipeline.
#[async_trait]
pub trait FilterStage: Send + Sync {
    fn name(&self) -> &'static str;

    async fn process(&self, fc: &mut FilterContext) -> Result<(), FilterError>;
}

/// Stage failures, wrapped with the failing stage's name by the chain.
#[derive(Debug, thiserror::Error)]
pub enum FilterError {
    #[error("filter {stage:?}: {source}")]
    Stage {
        stage: &'static str,
        #[source]
        source: Box<FilterError>,
    },

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error(transparent)]
    Audit(#[from] AuditError),
}

/// An ordered, pre-configured stage list.
pub struct FilterChain {
    stages: Vec<Arc<dyn FilterStage>>,
}

impl FilterChain {
    pub fn new(stages: Vec<Arc<dyn FilterStage>>) -> Self {
        Self { stages }
    }

    /// Run every stage in order. A stage error aborts the chain; a halted
    /// context does not; halting is a decision, not a failure.
    pub async fn process(&self, fc: &mut FilterContext) -> Result<(), FilterError> {
        for stage in &self.stages {
            stage.process(fc).await.map_err(|e| FilterError::Stage {
                stage: stage.name(),
                source: Box::new(e),
            })?;
            tracing::debug!(
                stage = stage.name(),
                method = %fc.method,
                verdict = %fc.verdict,
                halted = fc.halted,
                "filter stage executed"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct SetVerdict {
        verdict: Verdict,
        halt: bool,
    }

    #[async_trait]
    impl FilterStage for SetVerdict {
        fn name(&self) -> &'static str {
            "set_verdict"
        }

        async fn process(&self, fc: &mut FilterContext) -> Result<(), FilterError> {
            fc.verdict = self.verdict;
            fc.matched_rule = "test-rule".to_string();
            if self.halt {
                fc.halted = true;
            }
            Ok(())
        }
    }

    struct Recorder {
        seen_halted: Arc<parking_lot::Mutex<Option<bool>>>,
    }

    #[async_trait]
    impl FilterStage for Recorder {
        fn name(&self) -> &'static str {
            "recorder"
        }

        async fn process(&self, fc: &mut FilterContext) -> Result<(), FilterError> {
            *self.seen_halted.lock() = Some(fc.halted);
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl FilterStage for Failing {
        fn name(&self) -> &'static str {
            "failing"
        }

        async fn process(&self, _fc: &mut FilterContext) -> Result<(), FilterError> {
            Err(FilterError::Codec(CodecError::MissingParams))
        }
    }

    #[tokio::test]
    async fn test_stages_run_after_halt() {
        let seen = Arc::new(parking_lot::Mutex::new(None));
        let chain = FilterChain::new(vec![
            Arc::new(SetVerdict {
                verdict: Verdict::Deny,
                halt: true,
            }),
            Arc::new(Recorder {
                seen_halted: seen.clone(),
            }),
        ]);

        let mut fc = FilterContext::new(b"{}".to_vec(), Direction::Inbound);
        chain.process(&mut fc).await.unwrap();

        // The later stage ran and observed the halted flag.
        assert_eq!(*seen.lock(), Some(true));
        assert_eq!(fc.verdict, Verdict::Deny);
    }

    #[tokio::test]
    async fn test_stage_error_aborts_and_names_stage() {
        let seen = Arc::new(parking_lot::Mutex::new(None));
        let chain = FilterChain::new(vec![
            Arc::new(Failing),
            Arc::new(Recorder {
                seen_halted: seen.clone(),
            }),
        ]);

        let mut fc = FilterContext::new(b"{}".to_vec(), Direction::Inbound);
        let err = chain.process(&mut fc).await.unwrap_err();
        assert!(matches!(err, FilterError::Stage { stage: "failing", .. }));
        assert!(err.to_string().contains("failing"));

        // The chain aborted before the recorder.
        assert_eq!(*seen.lock(), None);
    }

    #[test]
    fn test_audit_record_snapshot() {
        let mut fc = FilterContext::new(b"0123456789".to_vec(), Direction::Inbound);
        fc.method = "tools/call".to_string();
        fc.tool = "read_file".to_string();
        fc.verdict = Verdict::Deny;
        fc.matched_rule = "block".to_string();

        let record = fc.to_audit_record();
        assert_eq!(record.raw_size, 10);
        assert_eq!(record.method, "tools/call");
        assert_eq!(record.verdict, Verdict::Deny);
        assert_eq!(record.rule, "block");
    }
}
