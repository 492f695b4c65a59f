//! Named session management for detached gateway instances.
//!
//! Each `capgate start --detach --name foo` writes a JSON file under
//! `~/.capgate/sessions/<name>.json` recording the child's PID, listen
//! address, and config path, so `capgate status` and `capgate stop <name>`
//! can find it without talking to the process directly.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

fn name_is_valid(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else { return false };
    if name.len() > 32 || !(first.is_ascii_lowercase() || first.is_ascii_digit()) {
        return false;
    }
    name.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

/// Validates and normalizes a session name (lowercase alphanumeric + hyphens, 1-32 chars).
pub fn validate_name(name: &str) -> Result<String> {
    let normalized = name.to_lowercase();
    if !name_is_valid(&normalized) {
        bail!(
            "invalid session name '{name}': use lowercase alphanumeric and hyphens, 1-32 chars, starting with a letter or digit"
        );
    }
    Ok(normalized)
}

/// Derives a session name from the listen port when the caller didn't supply `--name`.
pub fn auto_name(port: u16, default_port: u16) -> String {
    if port == default_port { "default".to_string() } else { format!("capgate-{port}") }
}

/// `~/.capgate`, created on demand.
pub fn capgate_home() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")).join(".capgate")
}

fn sessions_dir() -> PathBuf {
    capgate_home().join("sessions")
}

fn session_path(name: &str) -> PathBuf {
    sessions_dir().join(format!("{name}.json"))
}

/// Metadata for a single detached gateway instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub name: String,
    pub pid: i32,
    pub host: String,
    pub port: u16,
    pub config: String,
    #[serde(default)]
    pub log_file: String,
    pub started_at: String,
}

impl SessionInfo {
    pub fn new(name: String, pid: i32, host: String, port: u16, config: String, log_file: String) -> Self {
        Self { name, pid, host, port, config, log_file, started_at: chrono_now() }
    }

    /// Whether the recorded PID still refers to a live process we can signal.
    pub fn is_alive(&self) -> bool {
        match signal::kill(Pid::from_raw(self.pid), None) {
            Ok(()) => true,
            // EPERM: the process exists but is owned by someone else; treat as alive.
            Err(nix::errno::Errno::EPERM) => true,
            Err(_) => false,
        }
    }
}

fn chrono_now() -> String {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    format!("{}", now.as_secs())
}

pub fn save_session(info: &SessionInfo) -> Result<PathBuf> {
    std::fs::create_dir_all(sessions_dir()).context("failed to create sessions directory")?;
    let path = session_path(&info.name);
    let json = serde_json::to_string_pretty(info)?;
    std::fs::write(&path, json).with_context(|| format!("failed to write session file {}", path.display()))?;
    debug!(session = %info.name, path = %path.display(), "session saved");
    Ok(path)
}

pub fn load_session(name: &str) -> Option<SessionInfo> {
    let path = session_path(name);
    let contents = std::fs::read_to_string(&path).ok()?;
    match serde_json::from_str(&contents) {
        Ok(info) => Some(info),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "corrupt session file");
            None
        }
    }
}

pub fn remove_session(name: &str) {
    let _ = std::fs::remove_file(session_path(name));
}

/// Lists saved sessions. Stale entries (dead PIDs) are removed as a side
/// effect unless `include_dead` is set.
pub fn list_sessions(include_dead: bool) -> Vec<SessionInfo> {
    let Ok(entries) = std::fs::read_dir(sessions_dir()) else {
        return Vec::new();
    };

    let mut names: Vec<String> = entries
        .filter_map(|e| e.ok())
        .filter_map(|e| e.path().file_stem().map(|s| s.to_string_lossy().into_owned()))
        .collect();
    names.sort();

    let mut sessions = Vec::new();
    for name in names {
        let Some(info) = load_session(&name) else { continue };
        if info.is_alive() {
            sessions.push(info);
        } else if include_dead {
            sessions.push(info);
        } else {
            info!(session = %info.name, pid = info.pid, "cleaning stale session");
            remove_session(&info.name);
        }
    }
    sessions
}

/// Finds a session by name, or the sole running session if `name` is `None`.
pub fn find_session(name: Option<&str>) -> Option<SessionInfo> {
    match name {
        Some(name) => load_session(name).filter(|info| info.is_alive()),
        None => {
            let mut alive = list_sessions(false);
            if alive.len() == 1 { alive.pop() } else { None }
        }
    }
}

/// Stops a session: SIGTERM, wait up to `timeout`, escalate to SIGKILL.
/// Removes the session file once the process is confirmed dead.
pub fn stop_session(info: &SessionInfo, timeout: Duration) -> Result<bool> {
    if !info.is_alive() {
        remove_session(&info.name);
        return Ok(true);
    }

    let pid = Pid::from_raw(info.pid);
    signal::kill(pid, Signal::SIGTERM).with_context(|| format!("failed to signal PID {}", info.pid))?;

    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if !info.is_alive() {
            remove_session(&info.name);
            return Ok(true);
        }
        std::thread::sleep(Duration::from_millis(100));
    }

    warn!(session = %info.name, pid = info.pid, "session did not exit after SIGTERM, escalating to SIGKILL");
    let _ = signal::kill(pid, Signal::SIGKILL);
    std::thread::sleep(Duration::from_millis(200));

    remove_session(&info.name);
    Ok(!info.is_alive())
}

/// Returns the running session already bound to `host:port`, if any.
pub fn check_port_conflict(host: &str, port: u16) -> Option<SessionInfo> {
    list_sessions(false)
        .into_iter()
        .find(|info| info.port == port && (info.host == host || info.host == "0.0.0.0"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_uppercase_and_leading_hyphen() {
        assert!(validate_name("My-Session").is_err());
        assert!(validate_name("-session").is_err());
        assert!(validate_name("session-1").is_ok());
    }

    #[test]
    fn auto_name_uses_default_for_default_port() {
        assert_eq!(auto_name(8080, 8080), "default");
        assert_eq!(auto_name(9090, 8080), "capgate-9090");
    }

    #[test]
    fn dead_pid_reports_not_alive() {
        let info = SessionInfo::new("t".to_string(), i32::MAX - 1, "127.0.0.1".to_string(), 1, "c.yaml".to_string(), String::new());
        assert!(!info.is_alive());
    }
}
