//! Capability Registry: aggregates tools, resources, and prompts discovered
//! from every backend into one namespace, applying rename -> filter ->
//! conflict-resolution in that order.

use anyhow::{Result, bail};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::{BackendConfig, ConflictPolicy, FilterConfig, ToolOverride};

/// A tool entry aggregated from a backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolEntry {
    /// The name this tool is registered under in the aggregate catalog.
    pub name: String,
    /// The name the backend itself uses, before rename/conflict resolution.
    pub original_name: String,
    pub description: String,
    pub backend_name: String,
    pub input_schema: Value,
}

/// A resource entry aggregated from a backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceEntry {
    pub uri: String,
    pub original_uri: String,
    pub name: String,
    pub description: Option<String>,
    pub mime_type: Option<String>,
    pub backend_name: String,
}

/// A prompt entry aggregated from a backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptEntry {
    pub name: String,
    pub original_name: String,
    pub description: Option<String>,
    pub backend_name: String,
}

/// Glob-based allow/deny check. Deny wins; an empty allow list means
/// "allow everything not denied".
fn passes_filters(name: &str, filters: &FilterConfig) -> bool {
    for pattern in &filters.deny {
        if glob::Pattern::new(pattern).is_ok_and(|p| p.matches(name)) {
            return false;
        }
    }
    if filters.allow.is_empty() {
        return true;
    }
    filters
        .allow
        .iter()
        .any(|pattern| glob::Pattern::new(pattern).is_ok_and(|p| p.matches(name)))
}

/// Decides the registered key for a capability name given the active
/// conflict policy and whatever is already taken.
///
/// Returns `Ok(None)` when the candidate should be silently dropped
/// (first-wins collision), `Ok(Some(key))` for the key to register under,
/// and `Err` when the `error` policy hits a collision.
fn resolve_key(
    candidate: &str,
    backend_name: &str,
    namespace: Option<&str>,
    priority: Option<u32>,
    existing: &DashMap<String, (String, Option<u32>)>,
    policy: &ConflictPolicy,
) -> Result<Option<String>> {
    if !existing.contains_key(candidate) {
        existing.insert(candidate.to_string(), (backend_name.to_string(), priority));
        return Ok(Some(candidate.to_string()));
    }

    match policy {
        ConflictPolicy::FirstWins => Ok(None),
        ConflictPolicy::Error => {
            bail!("capability '{candidate}' from backend '{backend_name}' conflicts with an existing registration")
        }
        ConflictPolicy::Prefix { separator } => {
            let ns = namespace.unwrap_or(backend_name);
            let key = format!("{ns}{separator}{candidate}");
            existing.insert(key.clone(), (backend_name.to_string(), priority));
            Ok(Some(key))
        }
        ConflictPolicy::Priority { separator } => {
            let (_, existing_priority) = existing.get(candidate).map(|r| r.value().clone()).unwrap();
            let incoming = priority.unwrap_or(u32::MAX);
            let current = existing_priority.unwrap_or(u32::MAX);
            if incoming < current {
                // Incoming wins the bare name; bump the old holder is out of
                // scope here (it already registered), so the bare key simply
                // gets overwritten by the caller and the loser keeps living
                // under its own prefixed key going forward isn't retroactive —
                // ties are resolved at registration order, so just take the
                // prefixed slot if we lose the race.
                existing.insert(candidate.to_string(), (backend_name.to_string(), priority));
                Ok(Some(candidate.to_string()))
            } else {
                let ns = namespace.unwrap_or(backend_name);
                let key = format!("{ns}{separator}{candidate}");
                existing.insert(key.clone(), (backend_name.to_string(), priority));
                Ok(Some(key))
            }
        }
    }
}

pub struct CapabilityRegistry {
    tools: DashMap<String, ToolEntry>,
    resources: DashMap<String, ResourceEntry>,
    prompts: DashMap<String, PromptEntry>,

    tool_keys: DashMap<String, (String, Option<u32>)>,
    resource_keys: DashMap<String, (String, Option<u32>)>,
    prompt_keys: DashMap<String, (String, Option<u32>)>,

    backend_tools: DashMap<String, Vec<String>>,
    backend_resources: DashMap<String, Vec<String>>,
    backend_prompts: DashMap<String, Vec<String>>,

    conflict_policy: ConflictPolicy,
}

impl CapabilityRegistry {
    pub fn new(conflict_policy: ConflictPolicy) -> Arc<Self> {
        Arc::new(Self {
            tools: DashMap::new(),
            resources: DashMap::new(),
            prompts: DashMap::new(),
            tool_keys: DashMap::new(),
            resource_keys: DashMap::new(),
            prompt_keys: DashMap::new(),
            backend_tools: DashMap::new(),
            backend_resources: DashMap::new(),
            backend_prompts: DashMap::new(),
            conflict_policy,
        })
    }

    /// Register a backend's discovered tools: rename via `tool_overrides`,
    /// drop anything the allow/deny filters reject, then resolve collisions.
    pub fn register_backend(&self, backend_name: &str, tools: Vec<ToolEntry>, config: &BackendConfig) {
        let mut registered = Vec::new();

        for mut entry in tools {
            let original = entry.original_name.clone();
            if !passes_filters(&original, &config.filters) {
                continue;
            }

            let override_ = config.tool_overrides.get(&original);
            let candidate = override_
                .and_then(|o| o.name.clone())
                .unwrap_or_else(|| original.clone());
            if let Some(description) = override_.and_then(|o| o.description.clone()) {
                entry.description = description;
            }

            match resolve_key(
                &candidate,
                backend_name,
                config.namespace.as_deref(),
                config.priority,
                &self.tool_keys,
                &self.conflict_policy,
            ) {
                Ok(Some(key)) => {
                    entry.name = key.clone();
                    entry.backend_name = backend_name.to_string();
                    registered.push(key.clone());
                    self.tools.insert(key, entry);
                }
                Ok(None) => {
                    tracing::warn!(backend = %backend_name, tool = %candidate, "dropped due to first-wins conflict");
                }
                Err(e) => {
                    tracing::warn!(backend = %backend_name, tool = %candidate, error = %e, "capability conflict");
                }
            }
        }

        self.backend_tools.insert(backend_name.to_string(), registered);
    }

    pub fn register_backend_resources(
        &self,
        backend_name: &str,
        resources: Vec<ResourceEntry>,
        config: &BackendConfig,
    ) {
        let mut registered = Vec::new();
        for mut entry in resources {
            let original = entry.original_uri.clone();
            if !passes_filters(&original, &config.filters) {
                continue;
            }
            let override_ = config.tool_overrides.get(&original);
            let candidate = override_.and_then(|o| o.name.clone()).unwrap_or(original);
            if let Some(description) = override_.and_then(|o| o.description.clone()) {
                entry.description = Some(description);
            }
            match resolve_key(
                &candidate,
                backend_name,
                config.namespace.as_deref(),
                config.priority,
                &self.resource_keys,
                &self.conflict_policy,
            ) {
                Ok(Some(key)) => {
                    entry.uri = key.clone();
                    entry.backend_name = backend_name.to_string();
                    registered.push(key.clone());
                    self.resources.insert(key, entry);
                }
                Ok(None) | Err(_) => {
                    tracing::warn!(backend = %backend_name, resource = %candidate, "dropped due to conflict");
                }
            }
        }
        self.backend_resources.insert(backend_name.to_string(), registered);
    }

    pub fn register_backend_prompts(&self, backend_name: &str, prompts: Vec<PromptEntry>, config: &BackendConfig) {
        let mut registered = Vec::new();
        for mut entry in prompts {
            let original = entry.original_name.clone();
            if !passes_filters(&original, &config.filters) {
                continue;
            }
            let override_ = config.tool_overrides.get(&original);
            let candidate = override_.and_then(|o| o.name.clone()).unwrap_or(original);
            if let Some(description) = override_.and_then(|o| o.description.clone()) {
                entry.description = Some(description);
            }
            match resolve_key(
                &candidate,
                backend_name,
                config.namespace.as_deref(),
                config.priority,
                &self.prompt_keys,
                &self.conflict_policy,
            ) {
                Ok(Some(key)) => {
                    entry.name = key.clone();
                    entry.backend_name = backend_name.to_string();
                    registered.push(key.clone());
                    self.prompts.insert(key, entry);
                }
                Ok(None) | Err(_) => {
                    tracing::warn!(backend = %backend_name, prompt = %candidate, "dropped due to conflict");
                }
            }
        }
        self.backend_prompts.insert(backend_name.to_string(), registered);
    }

    pub fn remove_backend(&self, backend_name: &str) {
        if let Some((_, names)) = self.backend_tools.remove(backend_name) {
            for name in names {
                self.tools.remove(&name);
                self.tool_keys.remove(&name);
            }
        }
        if let Some((_, names)) = self.backend_resources.remove(backend_name) {
            for name in names {
                self.resources.remove(&name);
                self.resource_keys.remove(&name);
            }
        }
        if let Some((_, names)) = self.backend_prompts.remove(backend_name) {
            for name in names {
                self.prompts.remove(&name);
                self.prompt_keys.remove(&name);
            }
        }
    }

    pub fn get_tool(&self, name: &str) -> Option<ToolEntry> {
        self.tools.get(name).map(|r| r.value().clone())
    }

    pub fn get_resource(&self, uri: &str) -> Option<ResourceEntry> {
        self.resources.get(uri).map(|r| r.value().clone())
    }

    pub fn get_prompt(&self, name: &str) -> Option<PromptEntry> {
        self.prompts.get(name).map(|r| r.value().clone())
    }

    pub fn all_tools(&self) -> Vec<ToolEntry> {
        self.tools.iter().map(|r| r.value().clone()).collect()
    }

    pub fn all_resources(&self) -> Vec<ResourceEntry> {
        self.resources.iter().map(|r| r.value().clone()).collect()
    }

    pub fn all_prompts(&self) -> Vec<PromptEntry> {
        self.prompts.iter().map(|r| r.value().clone()).collect()
    }

    pub fn tool_count(&self) -> usize {
        self.tools.len()
    }

    pub fn backend_count(&self) -> usize {
        self.backend_tools.len()
    }

    /// Snapshot of the currently registered route map, one map per
    /// capability kind. Session creation freezes a copy of this so
    /// hot-reload can't change an in-flight session's routing.
    pub fn route_map(&self) -> RouteMap {
        RouteMap {
            tools: self
                .tools
                .iter()
                .map(|r| (r.key().clone(), (r.value().backend_name.clone(), r.value().original_name.clone())))
                .collect(),
            resources: self
                .resources
                .iter()
                .map(|r| (r.key().clone(), (r.value().backend_name.clone(), r.value().original_uri.clone())))
                .collect(),
            prompts: self
                .prompts
                .iter()
                .map(|r| (r.key().clone(), (r.value().backend_name.clone(), r.value().original_name.clone())))
                .collect(),
        }
    }
}

/// A frozen route map, one entry set per capability kind: exposed name ->
/// (backend name, original name/uri).
#[derive(Debug, Clone, Default)]
pub struct RouteMap {
    pub tools: HashMap<String, (String, String)>,
    pub resources: HashMap<String, (String, String)>,
    pub prompts: HashMap<String, (String, String)>,
}

impl RouteMap {
    pub fn len(&self) -> usize {
        self.tools.len() + self.resources.len() + self.prompts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as Map;

    fn backend_config() -> BackendConfig {
        BackendConfig {
            transport: crate::config::Transport::Stdio,
            command: Some("echo".to_string()),
            args: Vec::new(),
            env: Map::new(),
            cwd: None,
            url: None,
            headers: Map::new(),
            outgoing_auth: crate::config::OutgoingAuthConfig::None,
            timeout: std::time::Duration::from_secs(30),
            filters: FilterConfig::default(),
            tool_overrides: Map::new(),
            namespace: None,
            priority: None,
        }
    }

    fn entry(name: &str, backend: &str) -> ToolEntry {
        ToolEntry {
            name: name.to_string(),
            original_name: name.to_string(),
            description: String::new(),
            backend_name: backend.to_string(),
            input_schema: serde_json::json!({}),
        }
    }

    #[test]
    fn first_wins_drops_the_second_registration() {
        let reg = CapabilityRegistry::new(ConflictPolicy::FirstWins);
        reg.register_backend("a", vec![entry("search", "a")], &backend_config());
        reg.register_backend("b", vec![entry("search", "b")], &backend_config());

        assert_eq!(reg.tool_count(), 1);
        assert_eq!(reg.get_tool("search").unwrap().backend_name, "a");
    }

    #[test]
    fn prefix_policy_namespaces_the_conflicting_entry() {
        let reg = CapabilityRegistry::new(ConflictPolicy::Prefix { separator: ".".to_string() });
        reg.register_backend("a", vec![entry("search", "a")], &backend_config());
        reg.register_backend("b", vec![entry("search", "b")], &backend_config());

        assert_eq!(reg.tool_count(), 2);
        assert!(reg.get_tool("search").is_some());
        assert!(reg.get_tool("b.search").is_some());
    }

    #[test]
    fn deny_filter_drops_matching_tools() {
        let reg = CapabilityRegistry::new(ConflictPolicy::FirstWins);
        let mut config = backend_config();
        config.filters.deny = vec!["secret_*".to_string()];
        reg.register_backend(
            "a",
            vec![entry("secret_delete", "a"), entry("search", "a")],
            &config,
        );

        assert_eq!(reg.tool_count(), 1);
        assert!(reg.get_tool("search").is_some());
        assert!(reg.get_tool("secret_delete").is_none());
    }

    #[test]
    fn remove_backend_clears_its_tools() {
        let reg = CapabilityRegistry::new(ConflictPolicy::FirstWins);
        reg.register_backend("a", vec![entry("search", "a")], &backend_config());
        assert_eq!(reg.tool_count(), 1);
        reg.remove_backend("a");
        assert_eq!(reg.tool_count(), 0);
    }

    #[test]
    fn tool_overrides_rename_before_conflict_resolution() {
        let reg = CapabilityRegistry::new(ConflictPolicy::FirstWins);
        let mut config = backend_config();
        config.tool_overrides.insert(
            "search".to_string(),
            ToolOverride { name: Some("find".to_string()), description: None },
        );
        reg.register_backend("a", vec![entry("search", "a")], &config);

        assert!(reg.get_tool("find").is_some());
        assert!(reg.get_tool("search").is_none());
    }

    #[test]
    fn tool_overrides_description_independent_of_rename() {
        let reg = CapabilityRegistry::new(ConflictPolicy::FirstWins);
        let mut config = backend_config();
        config.tool_overrides.insert(
            "search".to_string(),
            ToolOverride { name: None, description: Some("searches things".to_string()) },
        );
        reg.register_backend("a", vec![entry("search", "a")], &config);

        let tool = reg.get_tool("search").unwrap();
        assert_eq!(tool.description, "searches things");
    }

    #[test]
    fn route_map_covers_every_capability_kind() {
        let reg = CapabilityRegistry::new(ConflictPolicy::FirstWins);
        reg.register_backend("a", vec![entry("search", "a")], &backend_config());
        reg.register_backend_resources(
            "a",
            vec![ResourceEntry {
                uri: "file:///a".to_string(),
                original_uri: "file:///a".to_string(),
                name: "a".to_string(),
                description: None,
                mime_type: None,
                backend_name: "a".to_string(),
            }],
            &backend_config(),
        );
        reg.register_backend_prompts(
            "a",
            vec![PromptEntry {
                name: "greet".to_string(),
                original_name: "greet".to_string(),
                description: None,
                backend_name: "a".to_string(),
            }],
            &backend_config(),
        );

        let map = reg.route_map();
        assert_eq!(map.tools.get("search"), Some(&("a".to_string(), "search".to_string())));
        assert_eq!(map.resources.get("file:///a"), Some(&("a".to_string(), "file:///a".to_string())));
        assert_eq!(map.prompts.get("greet"), Some(&("a".to_string(), "greet".to_string())));
    }
}
