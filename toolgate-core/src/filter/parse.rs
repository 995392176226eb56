//! Inbound parse stage: strict JSON-RPC decoding plus `tools/call` extraction.

use async_trait::async_trait;

use crate::jsonrpc;

use super::{FilterContext, FilterError, FilterStage};

/// Decodes the raw frame and extracts method, tool, and arguments. A decode
/// failure aborts the chain; the interposer drops the message and writes the
/// error-annotated audit record.
pub struct ParseStage;

#[async_trait]
impl FilterStage for ParseStage {
    fn name(&self) -> &'static str {
        "parse"
    }

    async fn process(&self, fc: &mut FilterContext) -> Result<(), FilterError> {
        let message = jsonrpc::parse(&fc.raw)?;
        fc.method = message.method().to_string();

        if fc.method == "tools/call" {
            let call = jsonrpc::extract_tool_call(&message)?;
            fc.tool = call.name;
            fc.arguments = call.arguments;
        }

        fc.message = Some(message);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jsonrpc::CodecError;
    use crate::Direction;

    #[tokio::test]
    async fn test_extracts_method_and_tool() {
        let mut fc = FilterContext::new(
            br#"{"jsonrpc":"2.0","id":1,"method":"tools/call","params":{"name":"write_file","arguments":{"path":"/tmp/x"}}}"#.to_vec(),
            Direction::Inbound,
        );
        ParseStage.process(&mut fc).await.unwrap();
        assert_eq!(fc.method, "tools/call");
        assert_eq!(fc.tool, "write_file");
        assert_eq!(fc.arguments.as_ref().unwrap()["path"], "/tmp/x");
        assert!(fc.message.is_some());
    }

    #[tokio::test]
    async fn test_non_tool_call_leaves_tool_empty() {
        let mut fc = FilterContext::new(
            br#"{"jsonrpc":"2.0","id":1,"method":"initialize"}"#.to_vec(),
            Direction::Inbound,
        );
        ParseStage.process(&mut fc).await.unwrap();
        assert_eq!(fc.method, "initialize");
        assert!(fc.tool.is_empty());
        assert!(fc.arguments.is_none());
    }

    #[tokio::test]
    async fn test_invalid_json_errors() {
        let mut fc = FilterContext::new(b"not json".to_vec(), Direction::Inbound);
        let err = ParseStage.process(&mut fc).await.unwrap_err();
        assert!(matches!(err, FilterError::Codec(CodecError::InvalidJson { .. })));
    }

    #[tokio::test]
    async fn test_tool_call_without_params_errors() {
        let mut fc = FilterContext::new(
            br#"{"jsonrpc":"2.0","id":1,"method":"tools/call"}"#.to_vec(),
            Direction::Inbound,
        );
        let err = ParseStage.process(&mut fc).await.unwrap_err();
        assert!(matches!(err, FilterError::Codec(CodecError::MissingParams)));
    }
}
