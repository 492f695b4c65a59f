//! The MCP server exposed to clients: a `ServerHandler` that aggregates
//! every backend's tools, resources, and prompts into one virtual catalog
//! and forwards calls through the middleware chain.

use std::sync::Arc;

use rmcp::{
    ErrorData as McpError, RoleServer, ServerHandler,
    model::{
        CallToolRequestParams, CallToolResult, CompleteRequestParams, CompleteResult, Content,
        GetPromptRequestParams, GetPromptResult, Implementation, ListPromptsResult,
        ListResourceTemplatesResult, ListResourcesResult, ListToolsResult, PaginatedRequestParams, Prompt,
        ProtocolVersion, ReadResourceRequestParams, ReadResourceResult, Resource, ServerCapabilities, ServerInfo, Tool,
    },
    service::RequestContext as McpRequestContext,
};
use serde_json::{Value, json};
use tracing::warn;

use crate::errors::RequestError;
use crate::middleware::{McpMethod, MiddlewareChain, RequestContext};
use crate::registry::{CapabilityRegistry, PromptEntry, ResourceEntry, ToolEntry};
use crate::session::{SessionManager, SessionRecord, TransportKind};

/// The caller's bearer token, carried on request extensions by whichever
/// transport terminates the connection (the SSE/streamable-http axum
/// middleware in `main.rs` inserts this before the request reaches the
/// handler; stdio has no header concept and never populates it).
#[derive(Debug, Clone, Default)]
pub struct BearerToken(pub Option<String>);

/// Aggregating MCP server: `list_*` reads the registry directly, `call_tool`
/// / `read_resource` / `get_prompt` forward through the middleware chain,
/// resolved against this connection's frozen session snapshot.
#[derive(Clone)]
pub struct GatewayServer {
    registry: Arc<CapabilityRegistry>,
    middleware: Arc<MiddlewareChain>,
    session: Arc<SessionRecord>,
}

impl GatewayServer {
    /// Builds a handler for one new connection, freezing a session snapshot
    /// of the registry's current route map. Called once per connection —
    /// the factory closures in `main.rs` invoke this for every accepted
    /// SSE/streamable-http connection, and `main.rs`'s stdio path calls it
    /// exactly once for the process's single stdio connection.
    pub fn new(
        registry: Arc<CapabilityRegistry>,
        middleware: Arc<MiddlewareChain>,
        sessions: &SessionManager,
        transport: TransportKind,
    ) -> Self {
        let session = sessions.create_session(&registry, transport, None);
        Self { registry, middleware, session }
    }

    fn bearer_token(context: &McpRequestContext<RoleServer>) -> Option<String> {
        context.extensions.get::<BearerToken>().and_then(|t| t.0.clone())
    }

    async fn dispatch(&self, method: McpMethod, capability_name: String, arguments: Option<Value>, context: &McpRequestContext<RoleServer>) -> Result<Value, RequestError> {
        let ctx = RequestContext::new(method, capability_name, arguments, Self::bearer_token(context));
        self.middleware.forward(ctx, &self.session).await
    }
}

fn tool_entry_to_model(entry: &ToolEntry) -> Option<Tool> {
    match serde_json::from_value(json!({
        "name": entry.name,
        "description": entry.description,
        "inputSchema": entry.input_schema,
    })) {
        Ok(tool) => Some(tool),
        Err(e) => {
            warn!(tool = %entry.name, error = %e, "tool entry could not be converted to MCP schema, omitting");
            None
        }
    }
}

fn resource_entry_to_model(entry: &ResourceEntry) -> Option<Resource> {
    match serde_json::from_value(json!({
        "uri": entry.uri,
        "name": entry.name,
        "description": entry.description,
        "mimeType": entry.mime_type,
    })) {
        Ok(resource) => Some(resource),
        Err(e) => {
            warn!(resource = %entry.uri, error = %e, "resource entry could not be converted to MCP schema, omitting");
            None
        }
    }
}

fn prompt_entry_to_model(entry: &PromptEntry) -> Option<Prompt> {
    match serde_json::from_value(json!({
        "name": entry.name,
        "description": entry.description,
    })) {
        Ok(prompt) => Some(prompt),
        Err(e) => {
            warn!(prompt = %entry.name, error = %e, "prompt entry could not be converted to MCP schema, omitting");
            None
        }
    }
}

/// Wraps a forwarded tool result (already flattened to a string or array of
/// strings by the backend layer) back into MCP's content-block shape.
fn value_to_call_tool_result(value: Value) -> CallToolResult {
    let content = match value {
        Value::String(s) => vec![Content::text(s)],
        Value::Array(items) => items
            .into_iter()
            .map(|item| match item {
                Value::String(s) => Content::text(s),
                other => Content::text(other.to_string()),
            })
            .collect(),
        other => vec![Content::text(other.to_string())],
    };
    CallToolResult::success(content)
}

fn request_error_to_mcp(err: RequestError) -> McpError {
    match &err {
        RequestError::CapabilityNotFound(_) => McpError::invalid_params(err.to_string(), None),
        RequestError::Unauthorized(_) | RequestError::Forbidden(_) => McpError::invalid_request(err.to_string(), None),
        RequestError::BackendUnavailable(_)
        | RequestError::BackendDisconnected(_)
        | RequestError::BackendCall { .. }
        | RequestError::InvalidBackendResponse(_)
        | RequestError::Internal => McpError::internal_error(err.to_string(), None),
    }
}

impl ServerHandler for GatewayServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2025_06_18,
            capabilities: ServerCapabilities::builder()
                .enable_tools()
                .enable_resources()
                .enable_prompts()
                .build(),
            server_info: Implementation::from_build_env(),
            instructions: Some(
                "This server aggregates tools, resources, and prompts from every configured \
                 backend MCP server into one namespace. Call tools, read resources, and get \
                 prompts exactly as advertised by list_tools / list_resources / list_prompts; \
                 the gateway resolves each name to its originating backend transparently."
                    .into(),
            ),
        }
    }

    fn list_tools(
        &self,
        _request: Option<PaginatedRequestParams>,
        _context: McpRequestContext<RoleServer>,
    ) -> impl std::future::Future<Output = Result<ListToolsResult, McpError>> + Send + '_ {
        async move {
            let tools = self.registry.all_tools().iter().filter_map(tool_entry_to_model).collect();
            Ok(ListToolsResult::with_all_items(tools))
        }
    }

    fn call_tool(
        &self,
        request: CallToolRequestParams,
        context: McpRequestContext<RoleServer>,
    ) -> impl std::future::Future<Output = Result<CallToolResult, McpError>> + Send + '_ {
        async move {
            let arguments = request.arguments.map(Value::Object);
            match self.dispatch(McpMethod::CallTool, request.name.to_string(), arguments, &context).await {
                Ok(value) => Ok(value_to_call_tool_result(value)),
                Err(e) => Ok(CallToolResult::error(vec![Content::text(e.to_string())])),
            }
        }
    }

    fn list_resources(
        &self,
        _request: Option<PaginatedRequestParams>,
        _context: McpRequestContext<RoleServer>,
    ) -> impl std::future::Future<Output = Result<ListResourcesResult, McpError>> + Send + '_ {
        async move {
            let resources = self.registry.all_resources().iter().filter_map(resource_entry_to_model).collect();
            Ok(ListResourcesResult { meta: None, next_cursor: None, resources })
        }
    }

    fn list_resource_templates(
        &self,
        _request: Option<PaginatedRequestParams>,
        _context: McpRequestContext<RoleServer>,
    ) -> impl std::future::Future<Output = Result<ListResourceTemplatesResult, McpError>> + Send + '_ {
        std::future::ready(Ok(ListResourceTemplatesResult { meta: None, next_cursor: None, resource_templates: Vec::new() }))
    }

    fn read_resource(
        &self,
        request: ReadResourceRequestParams,
        context: McpRequestContext<RoleServer>,
    ) -> impl std::future::Future<Output = Result<ReadResourceResult, McpError>> + Send + '_ {
        async move {
            let value = self
                .dispatch(McpMethod::ReadResource, request.uri, None, &context)
                .await
                .map_err(request_error_to_mcp)?;
            serde_json::from_value(value).map_err(|e| McpError::internal_error(format!("malformed resource contents: {e}"), None))
        }
    }

    fn list_prompts(
        &self,
        _request: Option<PaginatedRequestParams>,
        _context: McpRequestContext<RoleServer>,
    ) -> impl std::future::Future<Output = Result<ListPromptsResult, McpError>> + Send + '_ {
        async move {
            let prompts = self.registry.all_prompts().iter().filter_map(prompt_entry_to_model).collect();
            Ok(ListPromptsResult { meta: None, next_cursor: None, prompts })
        }
    }

    fn get_prompt(
        &self,
        request: GetPromptRequestParams,
        context: McpRequestContext<RoleServer>,
    ) -> impl std::future::Future<Output = Result<GetPromptResult, McpError>> + Send + '_ {
        async move {
            let arguments = request.arguments.map(Value::Object);
            let value = self
                .dispatch(McpMethod::GetPrompt, request.name, arguments, &context)
                .await
                .map_err(request_error_to_mcp)?;
            serde_json::from_value(value).map_err(|e| McpError::internal_error(format!("malformed prompt result: {e}"), None))
        }
    }

    fn complete(
        &self,
        _request: CompleteRequestParams,
        _context: McpRequestContext<RoleServer>,
    ) -> impl std::future::Future<Output = Result<CompleteResult, McpError>> + Send + '_ {
        std::future::ready(Err(McpError::invalid_request("completion is not supported by this gateway", None)))
    }
}
