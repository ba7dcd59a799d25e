//! JSON-RPC 2.0 message types and the line-classification rule.
//!
//! Each input line is first attempted as a request (must carry an `id`);
//! failing that, as a notification (no `id`); failing both it is a parse
//! error.  Parse errors for notifications are dropped silently; for
//! requests an error response with a `null` id goes back.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const JSONRPC_VERSION: &str = "2.0";
pub const PROTOCOL_VERSION: &str = "2024-11-05";

pub const PARSE_ERROR: i32 = -32700;
pub const INVALID_REQUEST: i32 = -32600;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const INTERNAL_ERROR: i32 = -32603;

#[derive(Debug, Clone, Deserialize)]
pub struct RpcRequest {
    #[serde(default)]
    #[allow(dead_code)]
    pub jsonrpc: String,
    pub id: Value,
    pub method: String,
    #[serde(default)]
    pub params: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RpcResponse {
    pub jsonrpc: &'static str,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
}

impl RpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Value, code: i32, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            result: None,
            error: Some(RpcError {
                code,
                message: message.into(),
            }),
        }
    }
}

/// What one input line turned out to be.
#[derive(Debug)]
pub enum Inbound {
    Request(RpcRequest),
    Notification { method: String },
    /// Unparseable as either; treated as a failed request (null-id error).
    ParseError,
    /// Valid JSON that fits neither shape but carries no id: dropped.
    MalformedNotification,
}

/// Classify one line of input.
pub fn classify(line: &str) -> Inbound {
    let Ok(value) = serde_json::from_str::<Value>(line) else {
        return Inbound::ParseError;
    };

    let has_id = value.get("id").map(|id| !id.is_null()).unwrap_or(false);
    if has_id {
        match serde_json::from_value::<RpcRequest>(value) {
            Ok(request) => Inbound::Request(request),
            Err(_) => Inbound::ParseError,
        }
    } else {
        match value.get("method").and_then(|method| method.as_str()) {
            Some(method) => Inbound::Notification {
                method: method.to_string(),
            },
            None => Inbound::MalformedNotification,
        }
    }
}

/// The tool-call result envelope: a text content block plus the error flag.
pub fn tool_result(text: &str, is_error: bool) -> Value {
    serde_json::json!({
        "content": [{ "type": "text", "text": text }],
        "isError": is_error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn classifies_requests_notifications_and_garbage() {
        match classify(r#"{"jsonrpc":"2.0","id":1,"method":"initialize"}"#) {
            Inbound::Request(request) => {
                assert_eq!(request.method, "initialize");
                assert_eq!(request.id, json!(1));
            }
            other => panic!("expected request, got {other:?}"),
        }

        match classify(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#) {
            Inbound::Notification { method } => assert_eq!(method, "notifications/initialized"),
            other => panic!("expected notification, got {other:?}"),
        }

        assert!(matches!(classify("{not json"), Inbound::ParseError));
        assert!(matches!(
            classify(r#"{"jsonrpc":"2.0"}"#),
            Inbound::MalformedNotification
        ));
    }

    #[test]
    fn request_with_null_id_is_a_notification_shape() {
        // A null id does not count as an id; without a method it is dropped.
        assert!(matches!(
            classify(r#"{"jsonrpc":"2.0","id":null}"#),
            Inbound::MalformedNotification
        ));
    }

    #[test]
    fn request_missing_method_is_a_parse_error() {
        assert!(matches!(
            classify(r#"{"jsonrpc":"2.0","id":7}"#),
            Inbound::ParseError
        ));
    }

    #[test]
    fn string_ids_are_preserved() {
        match classify(r#"{"id":"abc","method":"tools/list"}"#) {
            Inbound::Request(request) => assert_eq!(request.id, json!("abc")),
            other => panic!("expected request, got {other:?}"),
        }
    }

    #[test]
    fn response_envelope_shapes() {
        let success = RpcResponse::success(json!(1), json!({"ok": true}));
        let encoded = serde_json::to_value(&success).unwrap();
        assert_eq!(encoded["jsonrpc"], "2.0");
        assert_eq!(encoded["result"]["ok"], true);
        assert!(encoded.get("error").is_none());

        let failure = RpcResponse::failure(json!(2), METHOD_NOT_FOUND, "nope");
        let encoded = serde_json::to_value(&failure).unwrap();
        assert_eq!(encoded["error"]["code"], -32601);
        assert!(encoded.get("result").is_none());
    }

    #[test]
    fn tool_result_envelope() {
        let value = tool_result("all good", false);
        assert_eq!(value["content"][0]["type"], "text");
        assert_eq!(value["content"][0]["text"], "all good");
        assert_eq!(value["isError"], false);
    }
}
