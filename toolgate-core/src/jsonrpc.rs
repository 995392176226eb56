//! JSON-RPC 2.0 message codec.
//!
//! Parses line-framed JSON-RPC envelopes from untrusted input, classifies
//! them by the presence of `id` and `method`, extracts `tools/call` payloads,
//! and builds the two synthetic error replies the interposers send on behalf
//! of a blocked tool server.
//!
//! The caller's `id` is preserved verbatim (string, integer, or null) so that
//! synthesized error replies correlate correctly on the host side.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Custom JSON-RPC error code for requests denied by policy.
pub const ERROR_CODE_POLICY_DENIED: i64 = -32001;

/// Custom JSON-RPC error code for approval requests that timed out.
pub const ERROR_CODE_APPROVAL_TIMEOUT: i64 = -32002;

/// A JSON-RPC 2.0 request id: string, integer, or null.
///
/// Floats, booleans, arrays, and objects are invalid ids and rejected at
/// parse time.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum JsonRpcId {
    Number(i64),
    String(String),
    Null,
}

impl JsonRpcId {
    fn from_value(value: Value) -> Result<Self, CodecError> {
        match value {
            Value::Number(n) => n
                .as_i64()
                .map(JsonRpcId::Number)
                .ok_or(CodecError::InvalidId),
            Value::String(s) => Ok(JsonRpcId::String(s)),
            Value::Null => Ok(JsonRpcId::Null),
            _ => Err(CodecError::InvalidId),
        }
    }
}

/// A JSON-RPC 2.0 envelope: request, notification, or response.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JsonRpcMessage {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<JsonRpcId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

/// A JSON-RPC 2.0 error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Classification by `id`/`method` presence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Both `method` and `id`: expects a response.
    Request,
    /// `method` without `id`: fire-and-forget.
    Notification,
    /// `id` without `method`: a reply to an earlier request.
    Response,
}

impl JsonRpcMessage {
    /// Classify this message.
    ///
    /// A message with neither `id` nor `method` is not classifiable; the
    /// filter pipeline treats that as malformed input.
    pub fn classify(&self) -> Result<MessageKind, CodecError> {
        match (&self.id, &self.method) {
            (Some(_), Some(_)) => Ok(MessageKind::Request),
            (None, Some(_)) => Ok(MessageKind::Notification),
            (Some(_), None) => Ok(MessageKind::Response),
            (None, None) => Err(CodecError::Unclassifiable),
        }
    }

    pub fn method(&self) -> &str {
        self.method.as_deref().unwrap_or_default()
    }
}

/// Decoded `params` of a `tools/call` request.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolCallParams {
    pub name: String,
    /// Kept as raw JSON for audit fidelity; re-projected to a string-keyed
    /// map on demand for policy matching.
    #[serde(default)]
    pub arguments: Option<Value>,
}

/// Codec failures.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("invalid JSON-RPC message: {reason}")]
    InvalidJson { reason: String },

    #[error("unsupported JSON-RPC version: {version:?}")]
    UnsupportedVersion { version: String },

    #[error("invalid id field: must be a string, integer, or null")]
    InvalidId,

    #[error("message has neither id nor method")]
    Unclassifiable,

    #[error("not a tools/call request: {method:?}")]
    NotToolCall { method: String },

    #[error("tools/call request has no params")]
    MissingParams,

    #[error("failed to parse tools/call params: {reason}")]
    InvalidParams { reason: String },
}

/// Parse a raw byte frame into a [`JsonRpcMessage`].
///
/// Fails when the frame is not a JSON object or the `jsonrpc` field is not
/// exactly `"2.0"`. A present-but-null `id` is kept as [`JsonRpcId::Null`],
/// distinct from an absent `id`.
pub fn parse(data: &[u8]) -> Result<JsonRpcMessage, CodecError> {
    let value: Value = serde_json::from_slice(data).map_err(|e| CodecError::InvalidJson {
        reason: e.to_string(),
    })?;

    let Value::Object(mut obj) = value else {
        return Err(CodecError::InvalidJson {
            reason: "not a JSON object".to_string(),
        });
    };

    let version = obj
        .get("jsonrpc")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    if version != "2.0" {
        return Err(CodecError::UnsupportedVersion { version });
    }

    let id = obj.remove("id").map(JsonRpcId::from_value).transpose()?;

    let method = match obj.remove("method") {
        None => None,
        Some(Value::String(m)) => Some(m),
        Some(_) => {
            return Err(CodecError::InvalidJson {
                reason: "method is not a string".to_string(),
            });
        }
    };

    let error = obj
        .remove("error")
        .map(serde_json::from_value)
        .transpose()
        .map_err(|e| CodecError::InvalidJson {
            reason: format!("invalid error object: {e}"),
        })?;

    Ok(JsonRpcMessage {
        jsonrpc: version,
        id,
        method,
        params: obj.remove("params"),
        result: obj.remove("result"),
        error,
    })
}

/// Extract tool name and arguments from a `tools/call` request.
pub fn extract_tool_call(msg: &JsonRpcMessage) -> Result<ToolCallParams, CodecError> {
    if msg.method() != "tools/call" {
        return Err(CodecError::NotToolCall {
            method: msg.method().to_string(),
        });
    }
    let params = msg.params.clone().ok_or(CodecError::MissingParams)?;
    serde_json::from_value(params).map_err(|e| CodecError::InvalidParams {
        reason: e.to_string(),
    })
}

/// Build a policy-deny error response carrying the original request id.
pub fn deny_response(id: Option<JsonRpcId>, message: &str) -> JsonRpcMessage {
    error_response(id, ERROR_CODE_POLICY_DENIED, message)
}

/// Build an approval-timeout error response carrying the original request id.
pub fn approval_timeout_response(id: Option<JsonRpcId>) -> JsonRpcMessage {
    error_response(
        id,
        ERROR_CODE_APPROVAL_TIMEOUT,
        "approval request timed out",
    )
}

fn error_response(id: Option<JsonRpcId>, code: i64, message: &str) -> JsonRpcMessage {
    JsonRpcMessage {
        jsonrpc: "2.0".to_string(),
        id,
        method: None,
        params: None,
        result: None,
        error: Some(JsonRpcError {
            code,
            message: message.to_string(),
            data: None,
        }),
    }
}

/// Serialize a message to its wire bytes (without a trailing newline).
pub fn to_bytes(msg: &JsonRpcMessage) -> Result<Vec<u8>, CodecError> {
    serde_json::to_vec(msg).map_err(|e| CodecError::InvalidJson {
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_request() {
        let msg =
            parse(br#"{"jsonrpc":"2.0","id":1,"method":"tools/call","params":{"name":"x"}}"#)
                .unwrap();
        assert_eq!(msg.classify().unwrap(), MessageKind::Request);
        assert_eq!(msg.id, Some(JsonRpcId::Number(1)));
        assert_eq!(msg.method(), "tools/call");
    }

    #[test]
    fn test_parse_notification() {
        let msg = parse(br#"{"jsonrpc":"2.0","method":"initialized"}"#).unwrap();
        assert_eq!(msg.classify().unwrap(), MessageKind::Notification);
        assert!(msg.id.is_none());
    }

    #[test]
    fn test_parse_response() {
        let msg = parse(br#"{"jsonrpc":"2.0","id":"abc","result":{"ok":true}}"#).unwrap();
        assert_eq!(msg.classify().unwrap(), MessageKind::Response);
        assert_eq!(msg.id, Some(JsonRpcId::String("abc".to_string())));
    }

    #[test]
    fn test_parse_null_id_is_present() {
        // `"id": null` is a present id, not an absent one.
        let msg = parse(br#"{"jsonrpc":"2.0","id":null,"result":"ok"}"#).unwrap();
        assert_eq!(msg.id, Some(JsonRpcId::Null));
        assert_eq!(msg.classify().unwrap(), MessageKind::Response);
    }

    #[test]
    fn test_parse_rejects_invalid_json() {
        let err = parse(b"{truncated").unwrap_err();
        assert!(matches!(err, CodecError::InvalidJson { .. }));
    }

    #[test]
    fn test_parse_rejects_wrong_version() {
        let err = parse(br#"{"jsonrpc":"1.0","id":1,"method":"x"}"#).unwrap_err();
        assert!(matches!(err, CodecError::UnsupportedVersion { ref version } if version == "1.0"));
    }

    #[test]
    fn test_parse_rejects_missing_version() {
        let err = parse(br#"{"id":1,"method":"x"}"#).unwrap_err();
        assert!(matches!(err, CodecError::UnsupportedVersion { ref version } if version.is_empty()));
    }

    #[test]
    fn test_parse_rejects_bad_id_types() {
        for frame in [
            &br#"{"jsonrpc":"2.0","id":true,"method":"x"}"#[..],
            br#"{"jsonrpc":"2.0","id":1.5,"method":"x"}"#,
            br#"{"jsonrpc":"2.0","id":[1],"method":"x"}"#,
        ] {
            let err = parse(frame).unwrap_err();
            assert!(matches!(err, CodecError::InvalidId), "frame {frame:?}");
        }
    }

    #[test]
    fn test_classify_neither_id_nor_method() {
        let msg = parse(br#"{"jsonrpc":"2.0"}"#).unwrap();
        assert!(matches!(
            msg.classify().unwrap_err(),
            CodecError::Unclassifiable
        ));
    }

    #[test]
    fn test_extract_tool_call() {
        let msg = parse(
            br#"{"jsonrpc":"2.0","id":7,"method":"tools/call","params":{"name":"read_file","arguments":{"path":"/tmp/a"}}}"#,
        )
        .unwrap();
        let tc = extract_tool_call(&msg).unwrap();
        assert_eq!(tc.name, "read_file");
        assert_eq!(tc.arguments.unwrap()["path"], "/tmp/a");
    }

    #[test]
    fn test_extract_tool_call_wrong_method() {
        let msg = parse(br#"{"jsonrpc":"2.0","id":7,"method":"initialize"}"#).unwrap();
        let err = extract_tool_call(&msg).unwrap_err();
        assert!(matches!(err, CodecError::NotToolCall { ref method } if method == "initialize"));
    }

    #[test]
    fn test_extract_tool_call_missing_params() {
        let msg = parse(br#"{"jsonrpc":"2.0","id":7,"method":"tools/call"}"#).unwrap();
        assert!(matches!(
            extract_tool_call(&msg).unwrap_err(),
            CodecError::MissingParams
        ));
    }

    #[test]
    fn test_deny_response_preserves_id() {
        let resp = deny_response(Some(JsonRpcId::Number(42)), "blocked by policy");
        let value: Value = serde_json::from_slice(&to_bytes(&resp).unwrap()).unwrap();
        assert_eq!(value["jsonrpc"], "2.0");
        assert_eq!(value["id"], 42);
        assert_eq!(value["error"]["code"], json!(ERROR_CODE_POLICY_DENIED));
        assert_eq!(value["error"]["message"], "blocked by policy");
        assert!(value.get("method").is_none());
    }

    #[test]
    fn test_deny_response_string_and_null_ids() {
        let resp = deny_response(Some(JsonRpcId::String("req-1".into())), "no");
        let value: Value = serde_json::from_slice(&to_bytes(&resp).unwrap()).unwrap();
        assert_eq!(value["id"], "req-1");

        let resp = deny_response(Some(JsonRpcId::Null), "no");
        let value: Value = serde_json::from_slice(&to_bytes(&resp).unwrap()).unwrap();
        assert!(value["id"].is_null());
        assert!(value.as_object().unwrap().contains_key("id"));
    }

    #[test]
    fn test_approval_timeout_response_code() {
        let resp = approval_timeout_response(Some(JsonRpcId::Number(3)));
        let value: Value = serde_json::from_slice(&to_bytes(&resp).unwrap()).unwrap();
        assert_eq!(value["error"]["code"], json!(ERROR_CODE_APPROVAL_TIMEOUT));
        assert_eq!(value["error"]["message"], "approval request timed out");
    }

    #[test]
    fn test_serialize_parse_roundtrip() {
        let original = parse(
            br#"{"jsonrpc":"2.0","id":9,"method":"tools/call","params":{"name":"w","arguments":{"k":"v"}}}"#,
        )
        .unwrap();
        let bytes = to_bytes(&original).unwrap();
        let reparsed = parse(&bytes).unwrap();
        assert_eq!(original, reparsed);
    }

    #[test]
    fn test_roundtrip_error_envelope() {
        let original = parse(
            br#"{"jsonrpc":"2.0","id":5,"error":{"code":-32600,"message":"Invalid Request"}}"#,
        )
        .unwrap();
        let reparsed = parse(&to_bytes(&original).unwrap()).unwrap();
        assert_eq!(original, reparsed);
        assert_eq!(original.error.as_ref().unwrap().code, -32600);
    }
}
