pub mod error;
pub mod health;
pub mod lenient_client;
pub mod outgoing_auth;
pub mod sse;
pub mod stdio;
pub mod streamable_http;

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use rmcp::model::{CallToolResult, RawContent};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::circuit_breaker::CircuitBreaker;
use crate::config::{BackendConfig, Config, Transport};
use crate::registry::{PromptEntry, ResourceEntry, ToolEntry};

pub(crate) const STATE_STARTING: u8 = 0;
pub(crate) const STATE_HEALTHY: u8 = 1;
pub(crate) const STATE_UNHEALTHY: u8 = 2;
pub(crate) const STATE_STOPPED: u8 = 3;

/// Map a CallToolResult to a JSON Value.
pub(crate) fn map_call_tool_result(result: CallToolResult) -> Value {
    let contents: Vec<Value> = result
        .content
        .into_iter()
        .map(|c| match c.raw {
            RawContent::Text(t) => Value::String(t.text),
            _ => Value::String("[non-text content]".to_string()),
        })
        .collect();

    if contents.len() == 1 {
        contents.into_iter().next().unwrap()
    } else {
        Value::Array(contents)
    }
}

/// Map an rmcp Tool list into ToolEntry values, tagging each with its
/// originating backend and the name it was discovered under.
pub(crate) fn map_tools_to_entries(tools: Vec<rmcp::model::Tool>, backend_name: &str) -> Vec<ToolEntry> {
    tools
        .into_iter()
        .map(|t| ToolEntry {
            name: t.name.to_string(),
            original_name: t.name.to_string(),
            description: t.description.unwrap_or_default().to_string(),
            backend_name: backend_name.to_string(),
            input_schema: serde_json::to_value(&t.input_schema)
                .unwrap_or(Value::Object(Default::default())),
        })
        .collect()
}

/// Map an rmcp Resource list (annotated RawResource) into ResourceEntry values.
pub(crate) fn map_resources_to_entries(resources: Vec<rmcp::model::Resource>, backend_name: &str) -> Vec<ResourceEntry> {
    resources
        .into_iter()
        .map(|r| r.raw)
        .map(|r| ResourceEntry {
            uri: r.uri.clone(),
            original_uri: r.uri,
            name: r.name,
            description: r.description,
            mime_type: r.mime_type,
            backend_name: backend_name.to_string(),
        })
        .collect()
}

/// Map an rmcp Prompt list into PromptEntry values.
pub(crate) fn map_prompts_to_entries(prompts: Vec<rmcp::model::Prompt>, backend_name: &str) -> Vec<PromptEntry> {
    prompts
        .into_iter()
        .map(|p| PromptEntry {
            name: p.name.clone(),
            original_name: p.name,
            description: p.description,
            backend_name: backend_name.to_string(),
        })
        .collect()
}

pub(crate) fn state_from_atomic(state: &AtomicU8) -> BackendState {
    match state.load(Ordering::Acquire) {
        STATE_STARTING => BackendState::Starting,
        STATE_HEALTHY => BackendState::Healthy,
        STATE_UNHEALTHY => BackendState::Unhealthy,
        _ => BackendState::Stopped,
    }
}

pub(crate) fn is_available_from_atomic(state: &AtomicU8) -> bool {
    state.load(Ordering::Acquire) == STATE_HEALTHY
}

pub(crate) fn store_state(atomic: &AtomicU8, state: BackendState) {
    let val = match state {
        BackendState::Starting => STATE_STARTING,
        BackendState::Healthy => STATE_HEALTHY,
        BackendState::Unhealthy => STATE_UNHEALTHY,
        BackendState::Stopped => STATE_STOPPED,
    };
    atomic.store(val, Ordering::Release);
}

/// Connection state of a backend, as observed by the Client Manager.
/// The circuit breaker tracks failures independently; this reflects whether
/// the transport is currently connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackendState {
    Starting,
    Healthy,
    Unhealthy,
    Stopped,
}

/// A connection to a single backend MCP server, over whichever transport it uses.
#[async_trait]
pub trait Backend: Send + Sync {
    fn name(&self) -> &str;
    async fn start(&self) -> Result<()>;
    async fn stop(&self) -> Result<()>;
    async fn call_tool(&self, tool_name: &str, arguments: Option<Value>) -> Result<Value>;
    async fn read_resource(&self, uri: &str) -> Result<Value>;
    async fn get_prompt(&self, name: &str, arguments: Option<Value>) -> Result<Value>;
    async fn discover_tools(&self) -> Result<Vec<ToolEntry>>;

    /// Lists resources advertised by the backend. Backends that don't
    /// implement the resources capability return an empty list rather
    /// than an error.
    async fn discover_resources(&self) -> Result<Vec<ResourceEntry>> {
        Ok(Vec::new())
    }

    /// Lists prompts advertised by the backend. Same no-capability
    /// contract as `discover_resources`.
    async fn discover_prompts(&self) -> Result<Vec<PromptEntry>> {
        Ok(Vec::new())
    }

    fn is_available(&self) -> bool;
    fn state(&self) -> BackendState;
    fn set_state(&self, state: BackendState);

    /// Resolves when the underlying connection exits unexpectedly (stdio
    /// child process death). HTTP-family backends never resolve.
    async fn wait_for_exit(&self) -> Option<std::process::ExitStatus> {
        None
    }
}

struct ManagedBackend {
    backend: Arc<dyn Backend>,
    circuit: Arc<CircuitBreaker>,
}

/// Client Manager: owns every backend connection, forwards calls, and
/// tracks per-backend circuit breaker state.
pub struct BackendManager {
    backends: DashMap<String, ManagedBackend>,
    configs: RwLock<std::collections::HashMap<String, BackendConfig>>,
    /// Backend names in acquisition order, so `stop_all` can close them LIFO.
    acquisition_order: std::sync::Mutex<Vec<String>>,
    failure_threshold: std::sync::atomic::AtomicU32,
    cooldown_millis: std::sync::atomic::AtomicU64,
}

impl BackendManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            backends: DashMap::new(),
            configs: RwLock::new(std::collections::HashMap::new()),
            acquisition_order: std::sync::Mutex::new(Vec::new()),
            failure_threshold: std::sync::atomic::AtomicU32::new(3),
            cooldown_millis: std::sync::atomic::AtomicU64::new(60_000),
        })
    }

    /// Start every configured backend concurrently and register its tools.
    pub async fn start_all(
        self: &Arc<Self>,
        config: &Config,
        registry: &Arc<crate::registry::CapabilityRegistry>,
    ) -> Result<()> {
        {
            let mut configs = self.configs.write().await;
            configs.clone_from(&config.backends);
        }
        self.failure_threshold
            .store(config.health.failure_threshold, Ordering::Release);
        self.cooldown_millis
            .store(config.health.cooldown.as_millis() as u64, Ordering::Release);

        let mut join_set = tokio::task::JoinSet::new();
        for (name, backend_config) in &config.backends {
            let name = name.clone();
            let backend_config = backend_config.clone();
            let manager = Arc::clone(self);
            let registry = Arc::clone(registry);
            let failure_threshold = config.health.failure_threshold;
            let cooldown = config.health.cooldown;

            join_set.spawn(async move {
                match manager
                    .start_backend(&name, &backend_config, &registry, failure_threshold, cooldown)
                    .await
                {
                    Ok(tool_count) => info!(backend = %name, tools = tool_count, "backend started"),
                    Err(e) => error!(backend = %name, error = %e, "failed to start backend"),
                }
            });
        }

        while join_set.join_next().await.is_some() {}
        info!(backends = self.backends.len(), "all backends started");
        Ok(())
    }

    async fn start_backend(
        &self,
        name: &str,
        config: &BackendConfig,
        registry: &Arc<crate::registry::CapabilityRegistry>,
        failure_threshold: u32,
        cooldown: std::time::Duration,
    ) -> Result<usize> {
        let is_stdio = config.transport == Transport::Stdio;

        let backend: Arc<dyn Backend> = match config.transport {
            Transport::Stdio => {
                let b = stdio::StdioBackend::new(name.to_string(), config.clone());
                b.start().await?;
                Arc::new(b)
            }
            Transport::Sse => {
                let b = sse::SseBackend::new(name.to_string(), config.clone());
                b.start().await?;
                Arc::new(b)
            }
            Transport::StreamableHttp => {
                let b = streamable_http::StreamableHttpBackend::new(name.to_string(), config.clone());
                b.start().await?;
                Arc::new(b)
            }
        };

        let tools = backend.discover_tools().await?;
        let tool_count = tools.len();
        registry.register_backend(name, tools, config);

        match backend.discover_resources().await {
            Ok(resources) => registry.register_backend_resources(name, resources, config),
            Err(e) => warn!(backend = %name, error = %e, "resource discovery failed"),
        }
        match backend.discover_prompts().await {
            Ok(prompts) => registry.register_backend_prompts(name, prompts, config),
            Err(e) => warn!(backend = %name, error = %e, "prompt discovery failed"),
        }

        let circuit = CircuitBreaker::new(failure_threshold, cooldown);
        self.backends.insert(
            name.to_string(),
            ManagedBackend {
                backend: Arc::clone(&backend),
                circuit,
            },
        );
        {
            let mut order = self.acquisition_order.lock().expect("acquisition order lock poisoned");
            order.retain(|n| n != name);
            order.push(name.to_string());
        }

        if is_stdio {
            let reaper_name = name.to_string();
            tokio::spawn(async move {
                if let Some(status) = backend.wait_for_exit().await
                    && backend.state() != BackendState::Stopped
                {
                    warn!(backend = %reaper_name, exit_code = ?status.code(), "backend process exited unexpectedly");
                    backend.set_state(BackendState::Stopped);
                }
            });
        }

        Ok(tool_count)
    }

    /// Looks up a backend, checks its circuit breaker and availability, and
    /// hands back handles the caller can use without holding the map entry.
    fn acquire(&self, backend_name: &str) -> Result<(Arc<dyn Backend>, Arc<CircuitBreaker>)> {
        let managed = self
            .backends
            .get(backend_name)
            .ok_or_else(|| anyhow::anyhow!("backend '{backend_name}' not found"))?;

        if !managed.circuit.allows_request() {
            anyhow::bail!("backend '{backend_name}' circuit breaker is open");
        }

        let backend = Arc::clone(&managed.backend);
        let circuit = Arc::clone(&managed.circuit);
        drop(managed);

        if !backend.is_available() {
            anyhow::bail!("backend '{backend_name}' is not available (state: {:?})", backend.state());
        }

        Ok((backend, circuit))
    }

    /// Forward a tool call to its backend, honoring circuit breaker state.
    pub async fn call_tool(
        &self,
        backend_name: &str,
        tool_name: &str,
        arguments: Option<Value>,
    ) -> Result<Value> {
        let (backend, circuit) = self.acquire(backend_name)?;
        match backend.call_tool(tool_name, arguments).await {
            Ok(v) => {
                circuit.record_success();
                Ok(v)
            }
            Err(e) => {
                circuit.record_failure();
                Err(e)
            }
        }
    }

    pub async fn read_resource(&self, backend_name: &str, uri: &str) -> Result<Value> {
        let (backend, circuit) = self.acquire(backend_name)?;
        match backend.read_resource(uri).await {
            Ok(v) => {
                circuit.record_success();
                Ok(v)
            }
            Err(e) => {
                circuit.record_failure();
                Err(e)
            }
        }
    }

    pub async fn get_prompt(
        &self,
        backend_name: &str,
        name: &str,
        arguments: Option<Value>,
    ) -> Result<Value> {
        let (backend, circuit) = self.acquire(backend_name)?;
        match backend.get_prompt(name, arguments).await {
            Ok(v) => {
                circuit.record_success();
                Ok(v)
            }
            Err(e) => {
                circuit.record_failure();
                Err(e)
            }
        }
    }

    fn backend_handle(&self, backend_name: &str) -> Result<Arc<dyn Backend>> {
        self.backends
            .get(backend_name)
            .map(|r| Arc::clone(&r.backend))
            .ok_or_else(|| anyhow::anyhow!("backend '{backend_name}' not found"))
    }

    /// Ping a backend (used by the health monitor) — lists its tools as a
    /// lightweight liveness probe over the existing connection.
    pub async fn ping_backend(&self, name: &str) -> Result<()> {
        let backend = self.backend_handle(name)?;
        backend.discover_tools().await.map(|_| ())
    }

    pub fn circuit_state(&self, name: &str) -> Option<crate::circuit_breaker::CircuitState> {
        self.backends.get(name).map(|r| r.circuit.state())
    }

    pub fn record_failure(&self, name: &str) {
        if let Some(r) = self.backends.get(name) {
            r.circuit.record_failure();
        }
    }

    pub fn record_success(&self, name: &str) {
        if let Some(r) = self.backends.get(name) {
            r.circuit.record_success();
        }
    }

    pub async fn restart_backend(
        &self,
        name: &str,
        registry: &Arc<crate::registry::CapabilityRegistry>,
    ) -> Result<usize> {
        if let Some((_, managed)) = self.backends.remove(name)
            && let Err(e) = managed.backend.stop().await
        {
            warn!(backend = %name, error = %e, "error stopping backend for restart");
        }
        registry.remove_backend(name);

        let config = {
            let configs = self.configs.read().await;
            configs
                .get(name)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("no config for backend '{name}'"))?
        };

        let failure_threshold = self.failure_threshold.load(Ordering::Acquire);
        let cooldown = std::time::Duration::from_millis(self.cooldown_millis.load(Ordering::Acquire));
        self.start_backend(name, &config, registry, failure_threshold, cooldown).await
    }

    pub fn set_backend_state(&self, name: &str, state: BackendState) {
        if let Some(managed) = self.backends.get(name) {
            managed.backend.set_state(state);
        }
    }

    pub fn get_all_status(&self) -> Vec<BackendStatus> {
        self.backends
            .iter()
            .map(|r| BackendStatus {
                name: r.key().clone(),
                state: r.value().backend.state(),
                available: r.value().backend.is_available(),
                circuit: r.value().circuit.state(),
            })
            .collect()
    }

    /// Stop every backend in reverse acquisition order (LIFO), one at a
    /// time, so a single backend hanging or failing to close doesn't
    /// prevent the ones acquired before it from being reaped.
    pub async fn stop_all(&self) {
        let order: Vec<String> = {
            let mut order = self.acquisition_order.lock().expect("acquisition order lock poisoned");
            std::mem::take(&mut *order)
        };

        for name in order.into_iter().rev() {
            if let Some((_, managed)) = self.backends.remove(&name)
                && let Err(e) = managed.backend.stop().await
            {
                warn!(backend = %name, error = %e, "error stopping backend");
            }
        }
        self.backends.clear();
        info!("all backends stopped");
    }
}

/// Status summary for a backend, surfaced via the management interface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendStatus {
    pub name: String,
    pub state: BackendState,
    pub available: bool,
    #[serde(skip)]
    pub circuit: crate::circuit_breaker::CircuitState,
}
