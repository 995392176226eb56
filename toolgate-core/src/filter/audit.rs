//! Terminal audit stage.

use std::sync::Arc;

use async_trait::async_trait;

use crate::audit::AuditStore;
use crate::{Direction, Verdict};

use super::{FilterContext, FilterError, FilterStage};

/// Writes the audit record for every processed message. Always the last
/// stage, and never short-circuits on `halted`.
///
/// Inbound contexts carrying a still-pending `ask` are the one exception: the
/// record for those is written by whichever component resolves the ask (the
/// approval round-trip on stdio, the immediate denial on HTTP), so each
/// message yields exactly one record with its decided verdict.
pub struct AuditStage {
    store: Arc<dyn AuditStore>,
}

impl AuditStage {
    pub fn new(store: Arc<dyn AuditStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl FilterStage for AuditStage {
    fn name(&self) -> &'static str {
        "audit"
    }

    async fn process(&self, fc: &mut FilterContext) -> Result<(), FilterError> {
        if fc.direction == Direction::Inbound && fc.verdict == Verdict::Ask {
            return Ok(());
        }
        self.store.write(fc.to_audit_record())?;
        Ok(())
    }
}
