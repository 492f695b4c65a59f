use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::{Instant, timeout};
use tracing::{debug, error, info, warn};

use crate::backend::{BackendManager, BackendState};
use crate::circuit_breaker::CircuitState;
use crate::config::HealthConfig;
use crate::registry::CapabilityRegistry;

/// Per-backend restart bookkeeping. Circuit-open/closed state itself lives
/// in the backend's own `CircuitBreaker`; this only tracks restart attempts.
struct RestartTracker {
    restart_count: u32,
    last_restart: Option<Instant>,
    restart_window_start: Option<Instant>,
}

impl RestartTracker {
    fn new() -> Self {
        Self {
            restart_count: 0,
            last_restart: None,
            restart_window_start: None,
        }
    }

    fn backoff(&self, config: &HealthConfig) -> Duration {
        let multiplier = 2u64.saturating_pow(self.restart_count.min(5));
        (config.restart_initial_backoff * multiplier as u32).min(config.restart_max_backoff)
    }

    fn should_restart(&self, config: &HealthConfig) -> bool {
        if let Some(window_start) = self.restart_window_start
            && window_start.elapsed() > config.restart_window
        {
            return true;
        }
        self.restart_count < config.max_restarts
    }

    fn can_restart_now(&self, config: &HealthConfig) -> bool {
        self.last_restart.map(|t| t.elapsed() >= self.backoff(config)).unwrap_or(true)
    }

    fn note_attempt(&mut self, config: &HealthConfig) {
        if self
            .restart_window_start
            .map(|t| t.elapsed() > config.restart_window)
            .unwrap_or(true)
        {
            self.restart_count = 0;
            self.restart_window_start = Some(Instant::now());
        }
        self.restart_count += 1;
        self.last_restart = Some(Instant::now());
    }
}

/// Runs periodic health checks on all backends: pings healthy backends,
/// records successes/failures against each backend's circuit breaker, and
/// attempts auto-restart of stopped/unhealthy backends with backoff.
pub async fn run_health_checker(
    manager: Arc<BackendManager>,
    registry: Arc<CapabilityRegistry>,
    config: HealthConfig,
    shutdown: Arc<Notify>,
) {
    let interval = config.interval;

    info!(
        interval_secs = interval.as_secs(),
        failure_threshold = config.failure_threshold,
        "health checker started"
    );

    let mut restarts: std::collections::HashMap<String, RestartTracker> = std::collections::HashMap::new();

    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {},
            _ = shutdown.notified() => {
                info!("health checker shutting down");
                return;
            }
        }

        let statuses = manager.get_all_status();

        let healthy_names: Vec<String> = statuses
            .iter()
            .filter(|s| s.state == BackendState::Healthy)
            .map(|s| s.name.clone())
            .collect();

        if !healthy_names.is_empty() {
            let stagger = if healthy_names.len() > 1 {
                interval.mul_f64(0.8) / healthy_names.len() as u32
            } else {
                Duration::ZERO
            };

            let futures: Vec<_> = healthy_names
                .iter()
                .enumerate()
                .map(|(i, name)| {
                    let mgr = Arc::clone(&manager);
                    let name = name.clone();
                    let ping_timeout = config.timeout;
                    let delay = stagger * i as u32;
                    async move {
                        if !delay.is_zero() {
                            tokio::time::sleep(delay).await;
                        }
                        (name.clone(), timeout(ping_timeout, mgr.ping_backend(&name)).await)
                    }
                })
                .collect();

            for (name, result) in futures::future::join_all(futures).await {
                match result {
                    Ok(Ok(())) => {
                        manager.record_success(&name);
                    }
                    Ok(Err(e)) => {
                        warn!(backend = %name, error = %e, "health check failed");
                        manager.record_failure(&name);
                    }
                    Err(_) => {
                        warn!(backend = %name, timeout_secs = config.timeout.as_secs(), "health check timed out");
                        manager.record_failure(&name);
                    }
                }

                if manager.circuit_state(&name) == Some(CircuitState::Open) {
                    warn!(backend = %name, "circuit breaker open, marking backend unhealthy");
                    manager.set_backend_state(&name, BackendState::Unhealthy);
                }
            }
        }

        for status in &statuses {
            if !matches!(status.state, BackendState::Stopped | BackendState::Unhealthy) {
                continue;
            }

            // HALF_OPEN: try one probe before committing to a full restart.
            if manager.circuit_state(&status.name) == Some(CircuitState::HalfOpen) {
                debug!(backend = %status.name, "circuit half-open, probing");
                match timeout(config.timeout, manager.ping_backend(&status.name)).await {
                    Ok(Ok(())) => {
                        info!(backend = %status.name, "circuit breaker reset, backend recovered");
                        manager.record_success(&status.name);
                        manager.set_backend_state(&status.name, BackendState::Healthy);
                        continue;
                    }
                    _ => {
                        manager.record_failure(&status.name);
                        continue;
                    }
                }
            }

            let tracker = restarts
                .entry(status.name.clone())
                .or_insert_with(RestartTracker::new);

            if !tracker.should_restart(&config) {
                warn!(backend = %status.name, restarts = tracker.restart_count, "max restarts exceeded, not restarting");
                continue;
            }
            if !tracker.can_restart_now(&config) {
                debug!(backend = %status.name, "waiting for backoff before restart");
                continue;
            }

            info!(backend = %status.name, attempt = tracker.restart_count + 1, max = config.max_restarts, "attempting auto-restart");
            tracker.note_attempt(&config);

            match timeout(config.timeout, manager.restart_backend(&status.name, &registry)).await {
                Ok(Ok(tool_count)) => {
                    info!(backend = %status.name, tools = tool_count, "backend restarted successfully");
                    manager.record_success(&status.name);
                }
                Ok(Err(e)) => {
                    error!(backend = %status.name, error = %e, "auto-restart failed");
                }
                Err(_) => {
                    error!(backend = %status.name, "auto-restart timed out");
                }
            }
        }

        let current_names: std::collections::HashSet<String> = statuses.iter().map(|s| s.name.clone()).collect();
        restarts.retain(|name, _| current_names.contains(name));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restart_backoff_doubles_and_caps() {
        let config = HealthConfig::default();
        let mut t = RestartTracker::new();
        assert_eq!(t.backoff(&config), Duration::from_secs(1));
        t.restart_count = 1;
        assert_eq!(t.backoff(&config), Duration::from_secs(2));
        t.restart_count = 5;
        assert_eq!(t.backoff(&config), Duration::from_secs(30));
        t.restart_count = 10;
        assert_eq!(t.backoff(&config), Duration::from_secs(30));
    }

    #[test]
    fn should_restart_respects_max_restarts() {
        let config = HealthConfig::default();
        let mut t = RestartTracker::new();
        assert!(t.should_restart(&config));
        t.restart_count = config.max_restarts;
        t.restart_window_start = Some(Instant::now());
        assert!(!t.should_restart(&config));
    }
}
