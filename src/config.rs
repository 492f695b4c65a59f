use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Once;
use std::time::Duration;

static DOTENV_ONCE: Once = Once::new();

/// Load `~/.env` into the process environment exactly once.
///
/// Must be called early in `main()` before spawning concurrent tasks.
pub fn load_dotenv() {
    DOTENV_ONCE.call_once(|| {
        let env_path = dirs::home_dir()
            .map(|h| h.join(".env"))
            .filter(|p| p.is_file());
        if let Some(env_file) = env_path
            && let Ok(contents) = std::fs::read_to_string(&env_file)
        {
            for line in contents.lines() {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                if let Some((key, value)) = line.split_once('=') {
                    // SAFETY: runs at most once via `Once`, before any task spawns.
                    unsafe { std::env::set_var(key.trim(), value.trim()) };
                }
            }
        }
    });
}

/// Top-level gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub backends: HashMap<String, BackendConfig>,

    /// How capability name collisions across backends are resolved.
    #[serde(default)]
    pub conflict_policy: ConflictPolicy,

    /// How incoming MCP client connections are authenticated.
    #[serde(default)]
    pub incoming_auth: IncomingAuthConfig,

    #[serde(default)]
    pub health: HealthConfig,

    #[serde(default)]
    pub session: SessionConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            server: ServerConfig::default(),
            backends: HashMap::new(),
            conflict_policy: ConflictPolicy::default(),
            incoming_auth: IncomingAuthConfig::default(),
            health: HealthConfig::default(),
            session: SessionConfig::default(),
        }
    }
}

/// How the gateway exposes itself to MCP clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_transport")]
    pub transport: GatewayTransport,

    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            transport: default_transport(),
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum GatewayTransport {
    Stdio,
    Sse,
    StreamableHttp,
}

/// Per-backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackendConfig {
    #[serde(default = "default_backend_transport")]
    pub transport: Transport,

    /// Command to spawn (stdio transport).
    pub command: Option<String>,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default)]
    pub env: HashMap<String, String>,

    pub cwd: Option<String>,

    /// URL for sse / streamable-http transports.
    pub url: Option<String>,

    /// Static headers sent on every request (sse / streamable-http transports).
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// How the gateway authenticates itself to this backend.
    #[serde(default)]
    pub outgoing_auth: OutgoingAuthConfig,

    #[serde(default = "default_timeout", with = "humantime_duration")]
    pub timeout: Duration,

    /// Glob allow/deny filters applied to this backend's capability names.
    #[serde(default)]
    pub filters: FilterConfig,

    /// Per-capability overrides before registration: original_name -> {name?, description?}.
    #[serde(default)]
    pub tool_overrides: HashMap<String, ToolOverride>,

    /// Separator used when `conflict_policy` is `prefix` or `priority`.
    /// Falls back to the policy's own default when unset.
    #[serde(default)]
    pub namespace: Option<String>,

    /// Ordering used when `conflict_policy` is `priority` (lower wins ties first).
    #[serde(default)]
    pub priority: Option<u32>,
}

/// Override applied to a single capability before registration. Either
/// field may be set independently: a rename with no description change, a
/// description change with no rename, or both.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ToolOverride {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// Glob-based allow/deny filtering for a backend's capabilities.
/// Deny is evaluated before allow; an empty allow list means "allow everything
/// not denied".
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FilterConfig {
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default)]
    pub deny: Vec<String>,
}

/// Transport used to reach a backend MCP server.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Transport {
    Stdio,
    Sse,
    StreamableHttp,
}

/// Outgoing authentication toward a backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum OutgoingAuthConfig {
    #[default]
    None,
    Static {
        #[serde(default)]
        headers: HashMap<String, String>,
    },
    #[serde(rename = "oauth2-client-credentials")]
    OAuth2ClientCredentials {
        token_url: String,
        client_id: String,
        client_secret: String,
        #[serde(default)]
        scope: Option<String>,
    },
}

/// Capability name collision policy, applied after rename and before registration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(tag = "strategy", rename_all = "kebab-case")]
pub enum ConflictPolicy {
    #[default]
    FirstWins,
    Prefix {
        #[serde(default = "default_separator")]
        separator: String,
    },
    Priority {
        #[serde(default = "default_separator")]
        separator: String,
    },
    Error,
}

/// Incoming authentication applied to MCP client connections.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum IncomingAuthConfig {
    #[default]
    Anonymous,
    Local {
        /// Compared against the presented bearer token using a constant-time
        /// comparison — never `==`.
        token: String,
    },
    Jwt {
        jwks_uri: String,
        issuer: String,
        audience: String,
        #[serde(default = "default_key_ttl", with = "humantime_duration")]
        key_ttl: Duration,
    },
    Oidc {
        /// Issuer base URL; `${issuer}/.well-known/openid-configuration` is
        /// fetched and parsed at runtime to discover `jwks_uri`.
        issuer: String,
        audience: String,
        #[serde(default = "default_key_ttl", with = "humantime_duration")]
        key_ttl: Duration,
    },
}

/// Health monitor and circuit breaker tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_health_interval", with = "humantime_duration")]
    pub interval: Duration,

    #[serde(default = "default_health_timeout", with = "humantime_duration")]
    pub timeout: Duration,

    /// Consecutive failures before the circuit breaker trips to OPEN.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// How long the circuit stays OPEN before allowing a HALF_OPEN probe.
    #[serde(default = "default_cooldown", with = "humantime_duration")]
    pub cooldown: Duration,

    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,

    #[serde(default = "default_restart_window", with = "humantime_duration")]
    pub restart_window: Duration,

    #[serde(default = "default_restart_initial_backoff", with = "humantime_duration")]
    pub restart_initial_backoff: Duration,

    #[serde(default = "default_restart_max_backoff", with = "humantime_duration")]
    pub restart_max_backoff: Duration,

    #[serde(default = "default_drain_timeout", with = "humantime_duration")]
    pub drain_timeout: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval: default_health_interval(),
            timeout: default_health_timeout(),
            failure_threshold: default_failure_threshold(),
            cooldown: default_cooldown(),
            max_restarts: default_max_restarts(),
            restart_window: default_restart_window(),
            restart_initial_backoff: default_restart_initial_backoff(),
            restart_max_backoff: default_restart_max_backoff(),
            drain_timeout: default_drain_timeout(),
        }
    }
}

/// Session TTL and sweep-loop tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_session_ttl", with = "humantime_duration")]
    pub ttl: Duration,

    #[serde(default = "default_sweep_interval", with = "humantime_duration")]
    pub sweep_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl: default_session_ttl(),
            sweep_interval: default_sweep_interval(),
        }
    }
}

// --- Defaults ---

fn default_log_level() -> String {
    "info".to_string()
}
fn default_transport() -> GatewayTransport {
    GatewayTransport::Stdio
}
fn default_backend_transport() -> Transport {
    Transport::Stdio
}
fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    8765
}
fn default_timeout() -> Duration {
    Duration::from_secs(30)
}
fn default_separator() -> String {
    ".".to_string()
}
fn default_key_ttl() -> Duration {
    Duration::from_secs(3600)
}
fn default_health_interval() -> Duration {
    Duration::from_secs(30)
}
fn default_health_timeout() -> Duration {
    Duration::from_secs(5)
}
fn default_failure_threshold() -> u32 {
    3
}
fn default_cooldown() -> Duration {
    Duration::from_secs(60)
}
fn default_max_restarts() -> u32 {
    5
}
fn default_restart_window() -> Duration {
    Duration::from_secs(60)
}
fn default_restart_initial_backoff() -> Duration {
    Duration::from_secs(1)
}
fn default_restart_max_backoff() -> Duration {
    Duration::from_secs(30)
}
fn default_drain_timeout() -> Duration {
    Duration::from_secs(10)
}
fn default_session_ttl() -> Duration {
    Duration::from_secs(1800)
}
fn default_sweep_interval() -> Duration {
    Duration::from_secs(60)
}

// --- humantime_duration serde helper ---
//
// Parses/formats durations as "30s" / "5m" / "1h" strings rather than pulling
// in the `humantime` crate, matching the rest of this config module's style.
mod humantime_duration {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format(duration))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse(&s).map_err(serde::de::Error::custom)
    }

    fn format(d: &Duration) -> String {
        let secs = d.as_secs();
        if secs.is_multiple_of(3600) && secs >= 3600 {
            format!("{}h", secs / 3600)
        } else if secs.is_multiple_of(60) && secs >= 60 {
            format!("{}m", secs / 60)
        } else {
            format!("{secs}s")
        }
    }

    fn parse(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        if let Some(n) = s.strip_suffix("ms") {
            return n
                .parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|e| format!("invalid duration '{s}': {e}"));
        }
        if let Some(n) = s.strip_suffix('s') {
            n.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|e| format!("invalid duration '{s}': {e}"))
        } else if let Some(n) = s.strip_suffix('m') {
            n.parse::<u64>()
                .map(|m| Duration::from_secs(m * 60))
                .map_err(|e| format!("invalid duration '{s}': {e}"))
        } else if let Some(n) = s.strip_suffix('h') {
            n.parse::<u64>()
                .map(|h| Duration::from_secs(h * 3600))
                .map_err(|e| format!("invalid duration '{s}': {e}"))
        } else {
            s.parse::<u64>().map(Duration::from_secs).map_err(|_| {
                format!("invalid duration '{s}': expected format like '30s', '5m', '1h'")
            })
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn parses_seconds_minutes_hours() {
            assert_eq!(parse("30s").unwrap(), Duration::from_secs(30));
            assert_eq!(parse("5m").unwrap(), Duration::from_secs(300));
            assert_eq!(parse("1h").unwrap(), Duration::from_secs(3600));
            assert_eq!(parse("500ms").unwrap(), Duration::from_millis(500));
        }

        #[test]
        fn formats_round_trip_where_exact() {
            assert_eq!(format(&Duration::from_secs(30)), "30s");
            assert_eq!(format(&Duration::from_secs(300)), "5m");
            assert_eq!(format(&Duration::from_secs(3600)), "1h");
        }

        #[test]
        fn rejects_garbage() {
            assert!(parse("banana").is_err());
        }
    }
}

// --- Loading ---

impl Config {
    /// Load config from a YAML file.
    ///
    /// Pipeline: read file -> shellexpand `${VAR}` from the process
    /// environment -> deserialize YAML -> validate.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        let expanded = shellexpand::env(&raw)
            .map_err(|e| anyhow::anyhow!("env var interpolation failed: {e}"))?;

        let config: Config = serde_yaml_ng::from_str(&expanded)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        for (name, backend) in &self.backends {
            match backend.transport {
                Transport::Stdio => {
                    if backend.command.is_none() {
                        anyhow::bail!("backend '{name}': stdio transport requires 'command'");
                    }
                }
                Transport::Sse | Transport::StreamableHttp => {
                    if backend.url.is_none() {
                        anyhow::bail!(
                            "backend '{name}': {:?} transport requires 'url'",
                            backend.transport
                        );
                    }
                }
            }

            if let OutgoingAuthConfig::OAuth2ClientCredentials { token_url, .. } =
                &backend.outgoing_auth
                && token_url.is_empty()
            {
                anyhow::bail!("backend '{name}': oauth2-client-credentials requires 'token_url'");
            }
        }

        match &self.incoming_auth {
            IncomingAuthConfig::Local { token } if token.is_empty() => {
                anyhow::bail!("incoming_auth local requires a non-empty 'token'");
            }
            IncomingAuthConfig::Jwt { jwks_uri, .. } if jwks_uri.is_empty() => {
                anyhow::bail!("incoming_auth jwt requires 'jwks_uri'");
            }
            _ => {}
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn stdio_backend_without_command_fails_validation() {
        let mut config = Config::default();
        config.backends.insert(
            "broken".to_string(),
            BackendConfig {
                transport: Transport::Stdio,
                command: None,
                args: Vec::new(),
                env: HashMap::new(),
                cwd: None,
                url: None,
                headers: HashMap::new(),
                outgoing_auth: OutgoingAuthConfig::None,
                timeout: default_timeout(),
                filters: FilterConfig::default(),
                tool_overrides: HashMap::new(),
                namespace: None,
                priority: None,
            },
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn sse_backend_without_url_fails_validation() {
        let mut config = Config::default();
        config.backends.insert(
            "broken".to_string(),
            BackendConfig {
                transport: Transport::Sse,
                command: None,
                args: Vec::new(),
                env: HashMap::new(),
                cwd: None,
                url: None,
                headers: HashMap::new(),
                outgoing_auth: OutgoingAuthConfig::None,
                timeout: default_timeout(),
                filters: FilterConfig::default(),
                tool_overrides: HashMap::new(),
                namespace: None,
                priority: None,
            },
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn local_auth_requires_token() {
        let mut config = Config::default();
        config.incoming_auth = IncomingAuthConfig::Local {
            token: String::new(),
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn conflict_policy_defaults_to_first_wins() {
        assert_eq!(ConflictPolicy::default(), ConflictPolicy::FirstWins);
    }

    #[test]
    fn env_var_interpolation_substitutes_from_process_env() {
        // SAFETY: test-local env var, no concurrent access in this test.
        unsafe { std::env::set_var("CAPGATE_TEST_TOKEN", "secret123") };
        let yaml = "incoming_auth:\n  type: local\n  token: \"${CAPGATE_TEST_TOKEN}\"\n";
        let expanded = shellexpand::env(yaml).unwrap();
        assert!(expanded.contains("secret123"));
        unsafe { std::env::remove_var("CAPGATE_TEST_TOKEN") };
    }
}
