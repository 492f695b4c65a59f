mod auth;
mod backend;
mod circuit_breaker;
mod cli;
mod config;
mod errors;
mod ipc;
mod middleware;
mod registry;
mod server;
mod session;

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use rmcp::ServiceExt;
use rmcp::transport::stdio;
use tokio::sync::Notify;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use config::GatewayTransport;
use errors::GatewayError;
use server::{BearerToken, GatewayServer};
use session::TransportKind;

/// Every long-lived component, held by `Arc` so background tasks can share
/// ownership without borrowing from `main`.
struct Gateway {
    config: config::Config,
    registry: Arc<registry::CapabilityRegistry>,
    backend_manager: Arc<backend::BackendManager>,
    middleware: Arc<middleware::MiddlewareChain>,
    sessions: Arc<session::SessionManager>,
    shutdown: Arc<Notify>,
}

impl Gateway {
    async fn initialize(config: config::Config, config_path: &Path) -> Result<Self> {
        info!(
            config_path = %config_path.display(),
            backends = config.backends.len(),
            transport = ?config.server.transport,
            "capgate starting"
        );

        let registry = registry::CapabilityRegistry::new(config.conflict_policy);
        let backend_manager = backend::BackendManager::new();

        backend_manager
            .start_all(&config, &registry)
            .await
            .map_err(GatewayError::Other)?;

        if registry.backend_count() == 0 && !config.backends.is_empty() {
            return Err(GatewayError::NoBackendsReachable.into());
        }

        let auth_provider = auth::build_provider(&config.incoming_auth).await?;
        let middleware = Arc::new(middleware::MiddlewareChain::new(auth_provider, None, Arc::clone(&backend_manager)));

        let sessions = session::SessionManager::new(&config.session);
        let shutdown = Arc::new(Notify::new());

        Ok(Self { config, registry, backend_manager, middleware, sessions, shutdown })
    }

    fn spawn_background_tasks(&self) {
        {
            let manager = Arc::clone(&self.backend_manager);
            let registry = Arc::clone(&self.registry);
            let health_config = self.config.health.clone();
            let shutdown = Arc::clone(&self.shutdown);
            tokio::spawn(async move {
                backend::health::run_health_checker(manager, registry, health_config, shutdown).await;
            });
        }
        {
            let manager = Arc::clone(&self.sessions);
            let interval = self.config.session.sweep_interval;
            let shutdown = Arc::clone(&self.shutdown);
            tokio::spawn(async move {
                session::run_sweeper(manager, interval, shutdown).await;
            });
        }
    }

    async fn shutdown(self) {
        info!("shutting down");
        self.shutdown.notify_waiters();
        self.backend_manager.stop_all().await;
    }
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
            .expect("failed to install SIGINT handler");
        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM"),
            _ = sigint.recv() => info!("received SIGINT"),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

async fn run_stdio(gw: Gateway) -> Result<()> {
    let server = GatewayServer::new(Arc::clone(&gw.registry), Arc::clone(&gw.middleware), &gw.sessions, TransportKind::Stdio);
    gw.spawn_background_tasks();

    info!("serving MCP over stdio");
    let service = server.serve(stdio()).await?;

    tokio::select! {
        result = service.waiting() => {
            if let Err(e) = result {
                warn!(error = %e, "MCP service exited with error");
            }
        }
        _ = wait_for_shutdown_signal() => {}
    }

    gw.shutdown().await;
    Ok(())
}

/// Reads the `Authorization: Bearer <token>` header off the incoming HTTP
/// request and stashes it on the request extensions, where it rides along
/// into the per-call `RequestContext` the handler sees.
async fn insert_bearer_token(mut request: axum::extract::Request, next: axum::middleware::Next) -> axum::response::Response {
    let token = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::to_string);
    request.extensions_mut().insert(BearerToken(token));
    next.run(request).await
}

async fn run_sse(gw: Gateway) -> Result<()> {
    use rmcp::transport::SseServer;
    use rmcp::transport::sse_server::SseServerConfig;

    gw.spawn_background_tasks();

    let bind_addr: std::net::SocketAddr = format!("{}:{}", gw.config.server.host, gw.config.server.port)
        .parse()
        .map_err(|e| GatewayError::Configuration(format!("invalid server.host/port: {e}")))?;

    let shutdown_ct = tokio_util::sync::CancellationToken::new();
    let (sse_server, sse_router) = SseServer::new(SseServerConfig {
        bind: bind_addr,
        sse_path: "/sse".to_string(),
        post_path: "/message".to_string(),
        ct: shutdown_ct.clone(),
        sse_keep_alive: None,
    });

    let registry = Arc::clone(&gw.registry);
    let middleware = Arc::clone(&gw.middleware);
    let sessions = Arc::clone(&gw.sessions);
    let _server_ct = sse_server.with_service(move || {
        GatewayServer::new(Arc::clone(&registry), Arc::clone(&middleware), &sessions, TransportKind::Sse)
    });

    let app = sse_router.layer(axum::middleware::from_fn(insert_bearer_token));
    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .map_err(|e| GatewayError::Configuration(format!("failed to bind {bind_addr}: {e}")))?;

    info!(addr = %bind_addr, "serving MCP over SSE");
    let server_shutdown = shutdown_ct.clone();
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = server_shutdown.cancelled() => {}
                _ = wait_for_shutdown_signal() => {}
            }
        })
        .await;
    if let Err(e) = result {
        warn!(error = %e, "SSE server exited with error");
    }

    shutdown_ct.cancel();
    gw.shutdown().await;
    Ok(())
}

async fn run_streamable_http(gw: Gateway) -> Result<()> {
    use rmcp::transport::streamable_http_server::{StreamableHttpService, session::local::LocalSessionManager};

    gw.spawn_background_tasks();

    let bind_addr = format!("{}:{}", gw.config.server.host, gw.config.server.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .map_err(|e| GatewayError::Configuration(format!("failed to bind {bind_addr}: {e}")))?;

    let registry = Arc::clone(&gw.registry);
    let middleware = Arc::clone(&gw.middleware);
    let sessions = Arc::clone(&gw.sessions);
    let service = StreamableHttpService::new(
        move || Ok(GatewayServer::new(Arc::clone(&registry), Arc::clone(&middleware), &sessions, TransportKind::StreamableHttp)),
        LocalSessionManager::default().into(),
        Default::default(),
    );
    let router = axum::Router::new()
        .nest_service("/mcp", service)
        .layer(axum::middleware::from_fn(insert_bearer_token));

    info!(addr = %bind_addr, "serving MCP over streamable-http");
    axum::serve(listener, router)
        .with_graceful_shutdown(wait_for_shutdown_signal())
        .await?;

    gw.shutdown().await;
    Ok(())
}

async fn start(config_path: std::path::PathBuf, host: Option<String>, port: Option<u16>, log_level: Option<String>) -> Result<()> {
    config::load_dotenv();
    let loaded = config::Config::load(&config_path)?;
    let filter = EnvFilter::try_new(log_level.as_deref().unwrap_or(&loaded.log_level)).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).with_ansi(false).init();

    let mut gw = Gateway::initialize(loaded, &config_path).await?;
    if let Some(host) = host {
        gw.config.server.host = host;
    }
    if let Some(port) = port {
        gw.config.server.port = port;
    }

    match gw.config.server.transport {
        GatewayTransport::Stdio => run_stdio(gw).await,
        GatewayTransport::Sse => run_sse(gw).await,
        GatewayTransport::StreamableHttp => run_streamable_http(gw).await,
    }
}

fn run_detached(config: std::path::PathBuf, host: Option<String>, port: Option<u16>, log_level: Option<String>, name: Option<String>) -> Result<()> {
    let loaded = config::Config::load(&config)?;
    let host = host.unwrap_or(loaded.server.host);
    let port = port.unwrap_or(loaded.server.port);

    if let Some(existing) = ipc::sessions::check_port_conflict(&host, port) {
        anyhow::bail!("session '{}' is already bound to {host}:{port}", existing.name);
    }

    let name = match name {
        Some(name) => ipc::sessions::validate_name(&name)?,
        None => ipc::sessions::auto_name(port, config::ServerConfig::default().port),
    };
    if ipc::sessions::load_session(&name).map(|s| s.is_alive()).unwrap_or(false) {
        anyhow::bail!("a session named '{name}' is already running");
    }

    let home = ipc::sessions::capgate_home();
    std::fs::create_dir_all(&home)?;
    let log_path = home.join("logs").join(format!("{name}.log"));
    std::fs::create_dir_all(log_path.parent().unwrap())?;

    let exe = std::env::current_exe()?;
    let mut cmd = std::process::Command::new(exe);
    cmd.arg("start").arg("--config").arg(&config).arg("--host").arg(&host).arg("--port").arg(port.to_string());
    if let Some(level) = &log_level {
        cmd.arg("--log-level").arg(level);
    }

    let log_file = std::fs::File::create(&log_path)?;
    cmd.stdout(log_file.try_clone()?).stderr(log_file);
    cmd.stdin(std::process::Stdio::null());

    let child = cmd.spawn()?;
    let info = ipc::sessions::SessionInfo::new(
        name.clone(),
        child.id() as i32,
        host.clone(),
        port,
        config.display().to_string(),
        log_path.display().to_string(),
    );
    ipc::sessions::save_session(&info)?;

    println!("Started '{name}' (pid {}) on {host}:{port}", child.id());
    println!("Logs: {}", log_path.display());
    Ok(())
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let cli = cli::Cli::parse();

    let result = match cli.command {
        cli::Command::Start { config, host, port, log_level, detach, name } => {
            if detach {
                run_detached(config, host, port, log_level, name)
            } else {
                start(config, host, port, log_level).await
            }
        }
        cli::Command::Status { name } => ipc::status::run(name.as_deref()),
        cli::Command::Stop { name } => ipc::stop::run(name.as_deref()),
    };

    match result {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            let code = e.downcast_ref::<GatewayError>().map(|g| g.exit_code()).unwrap_or(1);
            std::process::ExitCode::from(code as u8)
        }
    }
}
