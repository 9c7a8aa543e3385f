use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::{json, Value};

use crate::auth::{CredentialResolver, SessionAuth};
use forge_api::ForgeClient;

/// Everything a tool handler needs for one invocation. The effective
/// [`SessionAuth`] is threaded in by value; nothing here outlives the call.
#[derive(Clone)]
pub struct ToolContext {
    pub forge: Arc<ForgeClient>,
    pub resolver: Arc<CredentialResolver>,
    pub auth: SessionAuth,
}

#[derive(Debug)]
pub enum ToolError {
    /// The forge rejected the call; reported as tool output, not a protocol
    /// failure.
    Api { status: u16, message: String },
    /// No credential source produced anything usable.
    Auth(crate::auth::AuthError),
    /// Bad arguments for this tool.
    Arguments(String),
    /// Transport-level failure talking to the forge.
    Transport(String),
}

impl From<forge_api::ForgeError> for ToolError {
    fn from(err: forge_api::ForgeError) -> Self {
        match err {
            forge_api::ForgeError::Api { status, message } => ToolError::Api { status, message },
            other => ToolError::Transport(other.to_string()),
        }
    }
}

impl From<crate::auth::AuthError> for ToolError {
    fn from(err: crate::auth::AuthError) -> Self {
        ToolError::Auth(err)
    }
}

pub type ToolResult = Result<Value, ToolError>;
pub type ToolHandler = Arc<dyn Fn(ToolContext, Value) -> BoxFuture<'static, ToolResult> + Send + Sync>;

/// Wrap an async closure as a boxed tool handler.
pub fn handler<F, Fut>(call: F) -> ToolHandler
where
    F: Fn(ToolContext, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ToolResult> + Send + 'static,
{
    Arc::new(move |ctx, args| Box::pin(call(ctx, args)))
}

pub struct RegisteredTool {
    pub name: &'static str,
    pub description: &'static str,
    pub input_schema: Value,
    pub handler: ToolHandler,
}

/// The tool catalogue seam: the policy/validation layer upstream decides
/// what is callable; the registry only maps names to handlers.
#[derive(Default)]
pub struct ToolRegistry {
    tools: BTreeMap<&'static str, RegisteredTool>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: RegisteredTool) {
        self.tools.insert(tool.name, tool);
    }

    pub fn get(&self, name: &str) -> Option<&RegisteredTool> {
        self.tools.get(name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn describe(&self) -> Value {
        let tools: Vec<Value> = self
            .tools
            .values()
            .map(|tool| {
                json!({
                    "name": tool.name,
                    "description": tool.description,
                    "inputSchema": tool.input_schema,
                })
            })
            .collect();
        json!({ "tools": tools })
    }
}
