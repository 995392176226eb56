//! Policy evaluation stage.

use std::sync::Arc;

use async_trait::async_trait;

use crate::jsonrpc::MessageKind;
use crate::policy::{EvalInput, PolicyBackend};
use crate::{Direction, Verdict};

use super::{FilterContext, FilterError, FilterStage};

/// Evaluates inbound requests and notifications against the policy backend
/// and halts the chain on `deny` and `ask`.
pub struct PolicyStage {
    backend: Arc<dyn PolicyBackend>,
}

impl PolicyStage {
    pub fn new(backend: Arc<dyn PolicyBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl FilterStage for PolicyStage {
    fn name(&self) -> &'static str {
        "policy"
    }

    async fn process(&self, fc: &mut FilterContext) -> Result<(), FilterError> {
        // Only inbound messages that carry a method are evaluated; responses
        // travelling inbound (client replies to server-initiated requests)
        // pass through.
        if fc.direction != Direction::Inbound || fc.method.is_empty() {
            fc.verdict = Verdict::Allow;
            return Ok(());
        }
        if let Some(message) = &fc.message {
            if matches!(message.classify(), Ok(MessageKind::Response)) {
                fc.verdict = Verdict::Allow;
                return Ok(());
            }
        }

        let input = EvalInput {
            method: fc.method.clone(),
            tool: fc.tool.clone(),
            arguments: fc.arguments.clone(),
        };
        let result = self.backend.evaluate(&input)?;

        fc.verdict = result.verdict;
        fc.matched_rule = result.rule;
        fc.verdict_message = result.message;

        if matches!(fc.verdict, Verdict::Deny | Verdict::Ask) {
            fc.halted = true;
        }
        Ok(())
    }
}
