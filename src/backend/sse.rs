use anyhow::{Context, Result};
use rmcp::{ServiceExt, model::*, service::RunningService, transport::SseClientTransport};
use serde_json::Value;
use std::sync::atomic::{AtomicU8, Ordering};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use super::outgoing_auth::OutgoingAuth;
use super::{Backend, BackendState, STATE_HEALTHY, STATE_STARTING, STATE_STOPPED};
use super::{
    is_available_from_atomic, map_call_tool_result, map_prompts_to_entries, map_resources_to_entries,
    map_tools_to_entries, state_from_atomic, store_state,
};
use crate::config::BackendConfig;
use crate::registry::{PromptEntry, ResourceEntry, ToolEntry};

/// An SSE (server-sent events) MCP backend.
pub struct SseBackend {
    name: String,
    config: BackendConfig,
    service: RwLock<Option<RunningService<rmcp::RoleClient, ()>>>,
    state: AtomicU8,
    auth: OutgoingAuth,
}

impl SseBackend {
    pub fn new(name: String, config: BackendConfig) -> Self {
        let auth = OutgoingAuth::from_config(&config.outgoing_auth);
        Self {
            name,
            config,
            service: RwLock::new(None),
            state: AtomicU8::new(STATE_STARTING),
            auth,
        }
    }
}

#[async_trait::async_trait]
impl Backend for SseBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self) -> Result<()> {
        self.state.store(STATE_STARTING, Ordering::Release);

        let url = self
            .config
            .url
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("sse backend '{}' missing url", self.name))?;

        let mut headers = reqwest::header::HeaderMap::new();
        for (key, value) in &self.config.headers {
            if let (Ok(name), Ok(val)) = (
                key.parse::<reqwest::header::HeaderName>(),
                value.parse::<reqwest::header::HeaderValue>(),
            ) {
                headers.insert(name, val);
            } else {
                warn!(backend = %self.name, header = %key, "skipping unparseable header");
            }
        }
        for (key, value) in self.auth.headers().await? {
            if let (Ok(name), Ok(val)) = (
                key.parse::<reqwest::header::HeaderName>(),
                value.parse::<reqwest::header::HeaderValue>(),
            ) {
                headers.insert(name, val);
            }
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .context("failed to build HTTP client")?;

        let transport = SseClientTransport::start_with_client(
            client,
            rmcp::transport::sse_client::SseClientConfig {
                sse_endpoint: url.to_string().into(),
                ..Default::default()
            },
        )
        .await
        .with_context(|| format!("failed to start SSE transport for backend '{}'", self.name))?;

        let service = ()
            .serve(transport)
            .await
            .with_context(|| format!("failed MCP handshake with SSE backend '{}' at {}", self.name, url))?;

        if let Some(peer) = service.peer_info() {
            info!(
                backend = %self.name,
                url = %url,
                server_name = %peer.server_info.name,
                server_version = %peer.server_info.version,
                "SSE MCP handshake complete"
            );
        } else {
            info!(backend = %self.name, url = %url, "SSE MCP handshake complete (no peer info)");
        }

        *self.service.write().await = Some(service);
        self.state.store(STATE_HEALTHY, Ordering::Release);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.state.store(STATE_STOPPED, Ordering::Release);

        let mut guard = self.service.write().await;
        if let Some(service) = guard.take()
            && let Err(e) = service.cancel().await
        {
            error!(backend = %self.name, error = %e, "error cancelling SSE service");
        }

        info!(backend = %self.name, "SSE backend stopped");
        Ok(())
    }

    async fn call_tool(&self, tool_name: &str, arguments: Option<Value>) -> Result<Value> {
        let guard = self.service.read().await;
        let service = guard
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("SSE backend '{}' not started", self.name))?;

        let params = CallToolRequestParams {
            meta: None,
            name: tool_name.to_string().into(),
            arguments: arguments.and_then(|v| v.as_object().cloned()),
            task: None,
        };

        debug!(backend = %self.name, tool = %tool_name, "calling tool via SSE");

        let result = tokio::time::timeout(self.config.timeout, service.call_tool(params))
            .await
            .map_err(|_| anyhow::anyhow!("tool call '{}' on backend '{}' timed out", tool_name, self.name))?
            .map_err(|e| anyhow::anyhow!("tool call '{}' on backend '{}' failed: {}", tool_name, self.name, e))?;

        Ok(map_call_tool_result(result))
    }

    async fn read_resource(&self, uri: &str) -> Result<Value> {
        let guard = self.service.read().await;
        let service = guard
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("SSE backend '{}' not started", self.name))?;

        let result = service
            .read_resource(ReadResourceRequestParams { uri: uri.to_string() })
            .await
            .map_err(|e| anyhow::anyhow!("read_resource '{}' on backend '{}' failed: {}", uri, self.name, e))?;

        serde_json::to_value(result).context("failed to serialize resource contents")
    }

    async fn get_prompt(&self, name: &str, arguments: Option<Value>) -> Result<Value> {
        let guard = self.service.read().await;
        let service = guard
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("SSE backend '{}' not started", self.name))?;

        let args = arguments.and_then(|v| v.as_object().cloned());
        let result = service
            .get_prompt(GetPromptRequestParams {
                name: name.to_string(),
                arguments: args,
            })
            .await
            .map_err(|e| anyhow::anyhow!("get_prompt '{}' on backend '{}' failed: {}", name, self.name, e))?;

        serde_json::to_value(result).context("failed to serialize prompt result")
    }

    async fn discover_tools(&self) -> Result<Vec<ToolEntry>> {
        let guard = self.service.read().await;
        let service = guard
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("SSE backend '{}' not started", self.name))?;

        let tools = service
            .list_all_tools()
            .await
            .map_err(|e| anyhow::anyhow!("tool discovery on backend '{}' failed: {}", self.name, e))?;

        let entries = map_tools_to_entries(tools, &self.name);
        info!(backend = %self.name, tools = entries.len(), "discovered SSE tools");
        Ok(entries)
    }

    async fn discover_resources(&self) -> Result<Vec<ResourceEntry>> {
        let guard = self.service.read().await;
        let service = guard
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("SSE backend '{}' not started", self.name))?;

        let resources = service
            .list_all_resources()
            .await
            .map_err(|e| anyhow::anyhow!("resource discovery on backend '{}' failed: {}", self.name, e))?;

        let entries = map_resources_to_entries(resources, &self.name);
        info!(backend = %self.name, resources = entries.len(), "discovered SSE resources");
        Ok(entries)
    }

    async fn discover_prompts(&self) -> Result<Vec<PromptEntry>> {
        let guard = self.service.read().await;
        let service = guard
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("SSE backend '{}' not started", self.name))?;

        let prompts = service
            .list_all_prompts()
            .await
            .map_err(|e| anyhow::anyhow!("prompt discovery on backend '{}' failed: {}", self.name, e))?;

        let entries = map_prompts_to_entries(prompts, &self.name);
        info!(backend = %self.name, prompts = entries.len(), "discovered SSE prompts");
        Ok(entries)
    }

    fn is_available(&self) -> bool {
        is_available_from_atomic(&self.state)
    }

    fn state(&self) -> BackendState {
        state_from_atomic(&self.state)
    }

    fn set_state(&self, state: BackendState) {
        store_state(&self.state, state);
    }
}
