//! Session Manager: per-client session state with a frozen route-map
//! snapshot and TTL eviction.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::Notify;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::registry::{CapabilityRegistry, RouteMap};

/// A client-facing transport kind, recorded for observability only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Sse,
    StreamableHttp,
    Stdio,
}

pub struct SessionRecord {
    pub id: String,
    /// Frozen at creation time: does not mutate even if the registry
    /// hot-reloads the route map afterwards.
    pub route_map: RouteMap,
    pub transport: TransportKind,
    pub ttl: Duration,
    pub created_at: Instant,
    last_touched_at: std::sync::Mutex<Instant>,
}

impl SessionRecord {
    fn expired(&self) -> bool {
        let last_touched = *self.last_touched_at.lock().expect("session lock poisoned");
        last_touched.elapsed() > self.ttl
    }

    fn touch(&self) {
        *self.last_touched_at.lock().expect("session lock poisoned") = Instant::now();
    }
}

/// Holds every live client session, keyed by session ID.
pub struct SessionManager {
    sessions: DashMap<String, Arc<SessionRecord>>,
    default_ttl: Duration,
}

impl SessionManager {
    pub fn new(config: &SessionConfig) -> Arc<Self> {
        Arc::new(Self {
            sessions: DashMap::new(),
            default_ttl: config.ttl,
        })
    }

    /// Creates a session with a frozen copy of the registry's current
    /// route map. `session_id` lets a streamable-HTTP client supply its own
    /// `Mcp-Session-Id`; otherwise one is generated.
    pub fn create_session(
        &self,
        registry: &CapabilityRegistry,
        transport: TransportKind,
        session_id: Option<String>,
    ) -> Arc<SessionRecord> {
        let id = session_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let record = Arc::new(SessionRecord {
            id: id.clone(),
            route_map: registry.route_map(),
            transport,
            ttl: self.default_ttl,
            created_at: Instant::now(),
            last_touched_at: std::sync::Mutex::new(Instant::now()),
        });

        info!(
            session = %id,
            transport = ?transport,
            tools = record.route_map.len(),
            ttl_secs = record.ttl.as_secs(),
            "session created"
        );
        self.sessions.insert(id, Arc::clone(&record));
        record
    }

    /// Returns the session if it exists and is not expired, refreshing its
    /// idle timer. Evicts it in place if expired.
    pub fn get(&self, session_id: &str) -> Option<Arc<SessionRecord>> {
        let record = self.sessions.get(session_id).map(|r| Arc::clone(&r))?;
        if record.expired() {
            self.sessions.remove(session_id);
            return None;
        }
        record.touch();
        Some(record)
    }

    pub fn remove(&self, session_id: &str) -> bool {
        self.sessions.remove(session_id).is_some()
    }

    pub fn active_count(&self) -> usize {
        self.sessions.iter().filter(|r| !r.expired()).count()
    }

    fn sweep(&self) -> usize {
        let expired: Vec<String> = self
            .sessions
            .iter()
            .filter(|r| r.expired())
            .map(|r| r.key().clone())
            .collect();
        for id in &expired {
            self.sessions.remove(id);
        }
        expired.len()
    }
}

/// Periodically evicts expired sessions until `shutdown` is notified.
/// Must exit within one sweep interval of cancellation.
pub async fn run_sweeper(manager: Arc<SessionManager>, interval: Duration, shutdown: Arc<Notify>) {
    info!(interval_secs = interval.as_secs(), "session sweeper started");
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {},
            _ = shutdown.notified() => {
                debug!("session sweeper cancelled");
                return;
            }
        }

        let removed = manager.sweep();
        if removed > 0 {
            info!(removed, remaining = manager.active_count(), "session sweep complete");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConflictPolicy;
    use std::collections::HashMap;

    #[test]
    fn session_survives_registry_mutation_after_creation() {
        let registry = CapabilityRegistry::new(ConflictPolicy::FirstWins);
        let manager = SessionManager::new(&SessionConfig { ttl: Duration::from_secs(60), sweep_interval: Duration::from_secs(60) });

        let session = manager.create_session(&registry, TransportKind::Sse, None);
        assert!(session.route_map.is_empty());

        registry.register_backend(
            "a",
            vec![crate::registry::ToolEntry {
                name: "search".to_string(),
                original_name: "search".to_string(),
                description: String::new(),
                backend_name: "a".to_string(),
                input_schema: serde_json::json!({}),
            }],
            &test_backend_config(),
        );

        let fetched = manager.get(&session.id).unwrap();
        assert!(fetched.route_map.is_empty(), "session route map must not mutate after creation");
    }

    #[test]
    fn expired_session_is_evicted_on_get() {
        let registry = CapabilityRegistry::new(ConflictPolicy::FirstWins);
        let manager = SessionManager::new(&SessionConfig { ttl: Duration::from_millis(1), sweep_interval: Duration::from_secs(60) });
        let session = manager.create_session(&registry, TransportKind::StreamableHttp, None);
        std::thread::sleep(Duration::from_millis(20));
        assert!(manager.get(&session.id).is_none());
    }

    fn test_backend_config() -> crate::config::BackendConfig {
        crate::config::BackendConfig {
            transport: crate::config::Transport::Stdio,
            command: Some("echo".to_string()),
            args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
            url: None,
            headers: HashMap::new(),
            outgoing_auth: crate::config::OutgoingAuthConfig::None,
            timeout: Duration::from_secs(30),
            filters: crate::config::FilterConfig::default(),
            tool_overrides: HashMap::new(),
            namespace: None,
            priority: None,
        }
    }
}
