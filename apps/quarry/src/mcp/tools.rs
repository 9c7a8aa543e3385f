//! Forge tools exposed over MCP. A representative slice of the catalogue:
//! project lookup, issues, merge requests, and search.

use serde::Deserialize;
use serde_json::{json, Value};

use crate::mcp::registry::{handler, RegisteredTool, ToolContext, ToolError, ToolRegistry, ToolResult};

pub fn register_tools(registry: &mut ToolRegistry) {
    registry.register(get_project_tool());
    registry.register(list_issues_tool());
    registry.register(get_issue_tool());
    registry.register(create_issue_tool());
    registry.register(list_merge_requests_tool());
    registry.register(search_tool());
}

fn decode_args<T: for<'de> Deserialize<'de>>(args: Value) -> Result<T, ToolError> {
    serde_json::from_value(args).map_err(|err| ToolError::Arguments(err.to_string()))
}

fn encode_project_id(id: &str) -> String {
    // Path-style ids ("group/project") must be percent-encoded in the API path.
    id.replace('/', "%2F")
}

async fn forge_get(ctx: &ToolContext, path: &str, query: &[(&str, String)]) -> ToolResult {
    let call_auth = ctx.resolver.resolve(Some(&ctx.auth)).await?;
    Ok(ctx.forge.get(path, query, &call_auth).await?)
}

async fn forge_post(ctx: &ToolContext, path: &str, body: Value) -> ToolResult {
    let call_auth = ctx.resolver.resolve(Some(&ctx.auth)).await?;
    Ok(ctx.forge.post(path, body, &call_auth).await?)
}

// get_project

#[derive(Debug, Deserialize)]
struct GetProjectArgs {
    project_id: String,
}

fn get_project_tool() -> RegisteredTool {
    RegisteredTool {
        name: "get_project",
        description: "Fetch a single project by numeric id or full path",
        input_schema: json!({
            "type": "object",
            "properties": {
                "project_id": {
                    "type": "string",
                    "description": "Numeric project id or URL-encoded path, e.g. 'group/project'"
                }
            },
            "required": ["project_id"]
        }),
        handler: handler(|ctx, args| async move {
            let args: GetProjectArgs = decode_args(args)?;
            let path = format!("/api/v4/projects/{}", encode_project_id(&args.project_id));
            forge_get(&ctx, &path, &[]).await
        }),
    }
}

// list_issues

#[derive(Debug, Deserialize)]
struct ListIssuesArgs {
    project_id: String,
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    labels: Option<String>,
    #[serde(default)]
    per_page: Option<u32>,
}

fn list_issues_tool() -> RegisteredTool {
    RegisteredTool {
        name: "list_issues",
        description: "List issues in a project, optionally filtered by state and labels",
        input_schema: json!({
            "type": "object",
            "properties": {
                "project_id": { "type": "string" },
                "state": { "type": "string", "enum": ["opened", "closed", "all"] },
                "labels": { "type": "string", "description": "Comma-separated label names" },
                "per_page": { "type": "integer", "minimum": 1, "maximum": 100 }
            },
            "required": ["project_id"]
        }),
        handler: handler(|ctx, args| async move {
            let args: ListIssuesArgs = decode_args(args)?;
            let path = format!(
                "/api/v4/projects/{}/issues",
                encode_project_id(&args.project_id)
            );
            let mut query: Vec<(&str, String)> = Vec::new();
            if let Some(state) = args.state {
                query.push(("state", state));
            }
            if let Some(labels) = args.labels {
                query.push(("labels", labels));
            }
            if let Some(per_page) = args.per_page {
                query.push(("per_page", per_page.to_string()));
            }
            forge_get(&ctx, &path, &query).await
        }),
    }
}

// get_issue

#[derive(Debug, Deserialize)]
struct GetIssueArgs {
    project_id: String,
    issue_iid: u64,
}

fn get_issue_tool() -> RegisteredTool {
    RegisteredTool {
        name: "get_issue",
        description: "Fetch one issue by project and issue iid",
        input_schema: json!({
            "type": "object",
            "properties": {
                "project_id": { "type": "string" },
                "issue_iid": { "type": "integer" }
            },
            "required": ["project_id", "issue_iid"]
        }),
        handler: handler(|ctx, args| async move {
            let args: GetIssueArgs = decode_args(args)?;
            let path = format!(
                "/api/v4/projects/{}/issues/{}",
                encode_project_id(&args.project_id),
                args.issue_iid
            );
            forge_get(&ctx, &path, &[]).await
        }),
    }
}

// create_issue

#[derive(Debug, Deserialize)]
struct CreateIssueArgs {
    project_id: String,
    title: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    labels: Option<String>,
}

fn create_issue_tool() -> RegisteredTool {
    RegisteredTool {
        name: "create_issue",
        description: "Create a new issue in a project",
        input_schema: json!({
            "type": "object",
            "properties": {
                "project_id": { "type": "string" },
                "title": { "type": "string" },
                "description": { "type": "string" },
                "labels": { "type": "string", "description": "Comma-separated label names" }
            },
            "required": ["project_id", "title"]
        }),
        handler: handler(|ctx, args| async move {
            let args: CreateIssueArgs = decode_args(args)?;
            let path = format!(
                "/api/v4/projects/{}/issues",
                encode_project_id(&args.project_id)
            );
            let mut body = json!({ "title": args.title });
            if let Some(description) = args.description {
                body["description"] = json!(description);
            }
            if let Some(labels) = args.labels {
                body["labels"] = json!(labels);
            }
            forge_post(&ctx, &path, body).await
        }),
    }
}

// list_merge_requests

#[derive(Debug, Deserialize)]
struct ListMergeRequestsArgs {
    project_id: String,
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    target_branch: Option<String>,
}

fn list_merge_requests_tool() -> RegisteredTool {
    RegisteredTool {
        name: "list_merge_requests",
        description: "List merge requests in a project",
        input_schema: json!({
            "type": "object",
            "properties": {
                "project_id": { "type": "string" },
                "state": { "type": "string", "enum": ["opened", "closed", "merged", "all"] },
                "target_branch": { "type": "string" }
            },
            "required": ["project_id"]
        }),
        handler: handler(|ctx, args| async move {
            let args: ListMergeRequestsArgs = decode_args(args)?;
            let path = format!(
                "/api/v4/projects/{}/merge_requests",
                encode_project_id(&args.project_id)
            );
            let mut query: Vec<(&str, String)> = Vec::new();
            if let Some(state) = args.state {
                query.push(("state", state));
            }
            if let Some(target_branch) = args.target_branch {
                query.push(("target_branch", target_branch));
            }
            forge_get(&ctx, &path, &query).await
        }),
    }
}

// search

#[derive(Debug, Deserialize)]
struct SearchArgs {
    scope: String,
    search: String,
}

fn search_tool() -> RegisteredTool {
    RegisteredTool {
        name: "search",
        description: "Search the forge globally by scope (projects, issues, merge_requests, ...)",
        input_schema: json!({
            "type": "object",
            "properties": {
                "scope": { "type": "string" },
                "search": { "type": "string" }
            },
            "required": ["scope", "search"]
        }),
        handler: handler(|ctx, args| async move {
            let args: SearchArgs = decode_args(args)?;
            let query = vec![("scope", args.scope), ("search", args.search)];
            forge_get(&ctx, "/api/v4/search", &query).await
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_the_catalogue() {
        let mut registry = ToolRegistry::new();
        register_tools(&mut registry);
        assert_eq!(registry.len(), 6);
        assert!(registry.get("get_project").is_some());
        assert!(registry.get("create_issue").is_some());
    }

    #[test]
    fn project_paths_are_encoded() {
        assert_eq!(encode_project_id("group/sub/project"), "group%2Fsub%2Fproject");
        assert_eq!(encode_project_id("42"), "42");
    }
}
