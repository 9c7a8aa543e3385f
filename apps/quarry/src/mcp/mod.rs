pub mod protocol;
pub mod registry;
pub mod tools;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::auth::{CredentialResolver, SessionAuth};
use crate::mcp::protocol::{
    error_response, internal_error, invalid_params, method_not_found, success_response,
    JsonRpcRequest, JsonRpcResponse, ERROR_NOT_INITIALIZED, ERROR_UNAUTHORIZED,
    MCP_PROTOCOL_VERSION,
};
use crate::mcp::registry::{ToolContext, ToolError, ToolRegistry};
use forge_api::ForgeClient;

pub const SERVER_NAME: &str = "quarry";
pub const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// The inner half of a transport/server pair: one instance per session,
/// dispatching the MCP methods against the tool registry.
pub struct McpService {
    registry: Arc<ToolRegistry>,
    forge: Arc<ForgeClient>,
    resolver: Arc<CredentialResolver>,
    initialized: AtomicBool,
}

impl McpService {
    pub fn new(
        registry: Arc<ToolRegistry>,
        forge: Arc<ForgeClient>,
        resolver: Arc<CredentialResolver>,
    ) -> Self {
        Self {
            registry,
            forge,
            resolver,
            initialized: AtomicBool::new(false),
        }
    }

    /// Handle one request. Notifications yield `None`; everything else gets
    /// a response, errors included. A failed call never tears the service
    /// down.
    pub async fn handle(
        &self,
        request: JsonRpcRequest,
        auth: &SessionAuth,
    ) -> Option<JsonRpcResponse> {
        let id = request.id.clone();
        match request.method.as_str() {
            "initialize" => Some(self.initialize(id, request.params)),
            "notifications/initialized" => {
                debug!(target: "quarry::mcp", "client reported initialized");
                None
            }
            "notifications/cancelled" => None,
            "ping" => id.map(|id| success_response(id, json!({}))),
            "tools/list" => id.map(|id| success_response(id, self.registry.describe())),
            "tools/call" => {
                let id = id?;
                Some(self.call_tool(id, request.params, auth).await)
            }
            other => {
                if request.is_notification() {
                    debug!(target: "quarry::mcp", method = other, "ignoring unknown notification");
                    return None;
                }
                Some(method_not_found(id, other))
            }
        }
    }

    fn initialize(&self, id: Option<Value>, params: Option<Value>) -> JsonRpcResponse {
        let Some(id) = id else {
            return invalid_params(None, "initialize must carry a request id");
        };
        let params = params.unwrap_or(Value::Null);
        if !params.is_object() {
            return invalid_params(Some(id), "initialize params must be an object");
        }
        let client = params
            .get("clientInfo")
            .and_then(|info| info.get("name"))
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        debug!(target: "quarry::mcp", client, "initialize handshake");

        self.initialized.store(true, Ordering::SeqCst);
        success_response(
            id,
            json!({
                "protocolVersion": MCP_PROTOCOL_VERSION,
                "capabilities": {
                    "tools": { "listChanged": false }
                },
                "serverInfo": {
                    "name": SERVER_NAME,
                    "version": SERVER_VERSION,
                }
            }),
        )
    }

    async fn call_tool(
        &self,
        id: Value,
        params: Option<Value>,
        auth: &SessionAuth,
    ) -> JsonRpcResponse {
        if !self.initialized.load(Ordering::SeqCst) {
            return error_response(
                Some(id),
                ERROR_NOT_INITIALIZED,
                "session has not completed initialization",
            );
        }
        let params = params.unwrap_or(Value::Null);
        let Some(name) = params.get("name").and_then(Value::as_str) else {
            return invalid_params(Some(id), "tools/call requires a tool name");
        };
        let arguments = params.get("arguments").cloned().unwrap_or(json!({}));

        let Some(tool) = self.registry.get(name) else {
            return invalid_params(Some(id), format!("unknown tool '{name}'"));
        };

        let ctx = ToolContext {
            forge: Arc::clone(&self.forge),
            resolver: Arc::clone(&self.resolver),
            auth: auth.clone(),
        };
        match (tool.handler)(ctx, arguments).await {
            Ok(value) => success_response(id, tool_content(value, false)),
            Err(ToolError::Api { status, message }) => {
                // Forge-side rejections are tool output, not protocol errors.
                let body = json!({ "status": status, "message": message });
                success_response(id, tool_content(body, true))
            }
            Err(ToolError::Arguments(message)) => invalid_params(Some(id), message),
            Err(ToolError::Auth(err)) => {
                warn!(target: "quarry::mcp", tool = name, error = %err, "credential resolution failed");
                error_response(Some(id), ERROR_UNAUTHORIZED, err.to_string())
            }
            Err(ToolError::Transport(message)) => {
                warn!(target: "quarry::mcp", tool = name, error = %message, "forge call failed");
                internal_error(Some(id), message)
            }
        }
    }
}

fn tool_content(value: Value, is_error: bool) -> Value {
    let text = serde_json::to_string_pretty(&value).unwrap_or_else(|_| value.to_string());
    json!({
        "content": [{ "type": "text", "text": text }],
        "isError": is_error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::ResolverConfig;
    use std::time::Duration;
    use url::Url;

    fn service() -> McpService {
        let mut registry = ToolRegistry::new();
        tools::register_tools(&mut registry);
        let base = Url::parse("https://gitlab.example.com").unwrap();
        let forge = Arc::new(ForgeClient::new(base.clone(), Duration::from_secs(5)).unwrap());
        let resolver = Arc::new(
            CredentialResolver::new(
                ResolverConfig {
                    default_token: Some("tok".into()),
                    ..ResolverConfig::default()
                },
                base,
                None,
                None,
            )
            .unwrap(),
        );
        McpService::new(Arc::new(registry), forge, resolver)
    }

    fn request(method: &str, id: Option<Value>, params: Option<Value>) -> JsonRpcRequest {
        JsonRpcRequest {
            jsonrpc: "2.0".into(),
            id,
            method: method.into(),
            params,
        }
    }

    #[tokio::test]
    async fn initialize_reports_server_info() {
        let service = service();
        let response = service
            .handle(
                request("initialize", Some(json!(1)), Some(json!({}))),
                &SessionAuth::empty(),
            )
            .await
            .unwrap();
        let encoded = serde_json::to_value(&response).unwrap();
        assert_eq!(encoded["result"]["serverInfo"]["name"], json!("quarry"));
        assert_eq!(
            encoded["result"]["protocolVersion"],
            json!(MCP_PROTOCOL_VERSION)
        );
    }

    #[tokio::test]
    async fn tools_call_before_initialize_is_rejected() {
        let service = service();
        let response = service
            .handle(
                request(
                    "tools/call",
                    Some(json!(2)),
                    Some(json!({"name": "get_project", "arguments": {"project_id": "1"}})),
                ),
                &SessionAuth::empty(),
            )
            .await
            .unwrap();
        let encoded = serde_json::to_value(&response).unwrap();
        assert_eq!(encoded["error"]["code"], json!(ERROR_NOT_INITIALIZED));
    }

    #[tokio::test]
    async fn notifications_produce_no_response() {
        let service = service();
        let response = service
            .handle(
                request("notifications/initialized", None, None),
                &SessionAuth::empty(),
            )
            .await;
        assert!(response.is_none());
    }

    #[tokio::test]
    async fn tools_list_describes_the_catalogue() {
        let service = service();
        service
            .handle(
                request("initialize", Some(json!(1)), Some(json!({}))),
                &SessionAuth::empty(),
            )
            .await;
        let response = service
            .handle(request("tools/list", Some(json!(2)), None), &SessionAuth::empty())
            .await
            .unwrap();
        let encoded = serde_json::to_value(&response).unwrap();
        let tools = encoded["result"]["tools"].as_array().unwrap();
        assert_eq!(tools.len(), 6);
    }

    #[tokio::test]
    async fn unknown_method_with_id_errors() {
        let service = service();
        let response = service
            .handle(request("bogus/method", Some(json!(3)), None), &SessionAuth::empty())
            .await
            .unwrap();
        assert!(response.is_error());
    }

    #[tokio::test]
    async fn unknown_tool_is_invalid_params() {
        let service = service();
        service
            .handle(
                request("initialize", Some(json!(1)), Some(json!({}))),
                &SessionAuth::empty(),
            )
            .await;
        let response = service
            .handle(
                request("tools/call", Some(json!(2)), Some(json!({"name": "nope"}))),
                &SessionAuth::empty(),
            )
            .await
            .unwrap();
        let encoded = serde_json::to_value(&response).unwrap();
        assert_eq!(encoded["error"]["code"], json!(-32602));
    }
}
