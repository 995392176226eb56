//! Lenient outbound parse stage.
//!
//! Outbound frames are the tool server's own responses; they are audited but
//! never blocked, and invalid JSON is tolerated as opaque payload.

use async_trait::async_trait;

use crate::jsonrpc;
use crate::Verdict;

use super::{FilterContext, FilterError, FilterStage};

pub struct OutboundParseStage;

#[async_trait]
impl FilterStage for OutboundParseStage {
    fn name(&self) -> &'static str {
        "outbound_parse"
    }

    async fn process(&self, fc: &mut FilterContext) -> Result<(), FilterError> {
        fc.verdict = Verdict::Allow;
        if let Ok(message) = jsonrpc::parse(&fc.raw) {
            fc.method = message.method().to_string();
            fc.message = Some(message);
        }
        Ok(())
    }
}
