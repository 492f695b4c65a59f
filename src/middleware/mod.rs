//! Middleware chain: recovery -> audit -> auth -> authorization -> routing.
//!
//! The chain is a fixed pipeline, not a plugin system — the gateway has
//! exactly five built-in layers and no runtime-loaded ones.

pub mod audit;
pub mod auth;
pub mod authorization;
pub mod recovery;
pub mod routing;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use uuid::Uuid;

use crate::auth::AuthProvider;
use crate::backend::BackendManager;
use crate::errors::RequestError;
use crate::session::SessionRecord;

use audit::AuditLayer;
use authorization::AuthorizationLayer;

/// MCP method restricted to the allowlist the forwarder understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum McpMethod {
    CallTool,
    ReadResource,
    GetPrompt,
}

impl McpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            McpMethod::CallTool => "call_tool",
            McpMethod::ReadResource => "read_resource",
            McpMethod::GetPrompt => "get_prompt",
        }
    }
}

/// Resolved caller identity, attached by the auth layer.
#[derive(Debug, Clone)]
pub struct UserIdentity {
    pub subject: String,
    pub email: Option<String>,
    pub name: Option<String>,
    pub roles: Vec<String>,
    pub provider: &'static str,
    pub claims: Value,
}

/// Per-request context threaded through the chain.
pub struct RequestContext {
    pub id: Uuid,
    pub mcp_method: McpMethod,
    pub capability_name: String,
    pub arguments: Option<Value>,
    pub server_name: Option<String>,
    pub original_name: Option<String>,
    pub error: Option<RequestError>,
    pub started_at: Instant,
    pub elapsed_ms: Option<u64>,
    pub metadata: HashMap<String, Value>,
    pub identity: Option<UserIdentity>,
    /// Raw bearer token presented on the request, if any.
    pub bearer_token: Option<String>,
}

impl RequestContext {
    pub fn new(mcp_method: McpMethod, capability_name: String, arguments: Option<Value>, bearer_token: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            mcp_method,
            capability_name,
            arguments,
            server_name: None,
            original_name: None,
            error: None,
            started_at: Instant::now(),
            elapsed_ms: None,
            metadata: HashMap::new(),
            identity: None,
            bearer_token,
        }
    }
}

/// Wires the five built-in layers around the registry and backend manager.
pub struct MiddlewareChain {
    audit: AuditLayer,
    auth: Arc<dyn AuthProvider>,
    authorization: Option<AuthorizationLayer>,
    manager: Arc<BackendManager>,
}

impl MiddlewareChain {
    pub fn new(auth: Arc<dyn AuthProvider>, authorization: Option<AuthorizationLayer>, manager: Arc<BackendManager>) -> Self {
        Self {
            audit: AuditLayer::new(),
            auth,
            authorization,
            manager,
        }
    }

    /// Runs a request through the full chain, outside-in: recovery wraps
    /// everything, audit brackets it, then auth, authorization, routing.
    /// Routing resolves against `session`'s frozen route map, not the live
    /// registry, so a hot reload never perturbs a live session's routing.
    pub async fn forward(&self, mut ctx: RequestContext, session: &SessionRecord) -> Result<Value, RequestError> {
        let auth = Arc::clone(&self.auth);
        let authorization = self.authorization.clone();
        let manager = Arc::clone(&self.manager);

        let inner = async move {
            let result = Self::run_inner(auth, authorization, manager, session, &mut ctx).await;
            self.audit.emit(&ctx, &result);
            result
        };

        recovery::guarded(inner).await
    }

    async fn run_inner(
        auth: Arc<dyn AuthProvider>,
        authorization: Option<AuthorizationLayer>,
        manager: Arc<BackendManager>,
        session: &SessionRecord,
        ctx: &mut RequestContext,
    ) -> Result<Value, RequestError> {
        auth::authenticate(auth.as_ref(), ctx).await?;
        if let Some(layer) = &authorization {
            layer.check(ctx)?;
        }
        routing::route(&manager, session, ctx).await
    }
}
