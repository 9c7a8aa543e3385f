use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const JSONRPC_VERSION: &str = "2.0";
pub const MCP_PROTOCOL_VERSION: &str = "2024-11-05";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }

    pub fn is_initialize(&self) -> bool {
        self.method == "initialize"
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JsonRpcResponse {
    Result(JsonRpcResult),
    Error(JsonRpcErrorResponse),
}

impl JsonRpcResponse {
    pub fn is_error(&self) -> bool {
        matches!(self, JsonRpcResponse::Error(_))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResult {
    pub jsonrpc: String,
    pub id: Value,
    pub result: Value,
}

impl JsonRpcResult {
    pub fn new(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcErrorResponse {
    pub jsonrpc: String,
    pub id: Option<Value>,
    pub error: JsonRpcError,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

pub const ERROR_PARSE: i64 = -32700;
pub const ERROR_INVALID_REQUEST: i64 = -32600;
pub const ERROR_METHOD_NOT_FOUND: i64 = -32601;
pub const ERROR_INVALID_PARAMS: i64 = -32602;
pub const ERROR_INTERNAL: i64 = -32603;

// Stable codes for the manager's rejection taxonomy. Callers key retry
// behavior off these: capacity and rate-limit mean back off, unauthorized
// means re-authenticate, unknown session means re-initialize.
pub const ERROR_UNAUTHORIZED: i64 = -32001;
pub const ERROR_NOT_INITIALIZED: i64 = -32002;
pub const ERROR_UNKNOWN_SESSION: i64 = -32004;
pub const ERROR_CAPACITY: i64 = -32006;
pub const ERROR_RATE_LIMITED: i64 = -32007;

pub fn error_response(
    id: Option<Value>,
    code: i64,
    message: impl Into<String>,
) -> JsonRpcResponse {
    JsonRpcResponse::Error(JsonRpcErrorResponse {
        jsonrpc: JSONRPC_VERSION.to_string(),
        id,
        error: JsonRpcError {
            code,
            message: message.into(),
            data: None,
        },
    })
}

pub fn success_response(id: Value, result: Value) -> JsonRpcResponse {
    JsonRpcResponse::Result(JsonRpcResult::new(id, result))
}

pub fn method_not_found(id: Option<Value>, method: &str) -> JsonRpcResponse {
    error_response(
        id,
        ERROR_METHOD_NOT_FOUND,
        format!("method '{method}' not found"),
    )
}

pub fn invalid_params(id: Option<Value>, message: impl Into<String>) -> JsonRpcResponse {
    error_response(id, ERROR_INVALID_PARAMS, message)
}

pub fn internal_error(id: Option<Value>, message: impl Into<String>) -> JsonRpcResponse {
    error_response(id, ERROR_INTERNAL, message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn notification_has_no_id() {
        let request: JsonRpcRequest = serde_json::from_value(json!({
            "jsonrpc": "2.0",
            "method": "notifications/initialized"
        }))
        .unwrap();
        assert!(request.is_notification());
        assert!(!request.is_initialize());
    }

    #[test]
    fn responses_serialize_untagged() {
        let ok = success_response(json!(1), json!({"ok": true}));
        let encoded = serde_json::to_value(&ok).unwrap();
        assert_eq!(encoded["result"]["ok"], json!(true));
        assert!(encoded.get("error").is_none());

        let err = error_response(Some(json!(2)), ERROR_RATE_LIMITED, "slow down");
        let encoded = serde_json::to_value(&err).unwrap();
        assert_eq!(encoded["error"]["code"], json!(ERROR_RATE_LIMITED));
    }

    #[test]
    fn taxonomy_codes_are_distinct() {
        let codes = [
            ERROR_UNAUTHORIZED,
            ERROR_NOT_INITIALIZED,
            ERROR_UNKNOWN_SESSION,
            ERROR_CAPACITY,
            ERROR_RATE_LIMITED,
        ];
        for (i, a) in codes.iter().enumerate() {
            for b in codes.iter().skip(i + 1) {
                assert_ne!(a, b);
            }
        }
    }
}
