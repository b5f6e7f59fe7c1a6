mod agent;
mod approvals;
mod auth;
mod cli;
mod config;
mod exec;
mod gateway;
mod logging;
mod net;
mod nodes;
mod server;
mod sessions;

use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use cli::{Cli, Command, ConfigCommand};

const DEFAULT_PORT: u16 = 18789;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        // No subcommand or explicit `start` both launch the gateway.
        None | Some(Command::Start) => match run_gateway().await {
            Ok(()) => ExitCode::SUCCESS,
            Err(err) => {
                error!(target: "gateway", "{err}");
                ExitCode::from(cli::EXIT_VALIDATION as u8)
            }
        },

        Some(Command::Status {
            host,
            port,
            timeout_ms,
        }) => {
            let port = port.unwrap_or_else(configured_port);
            ExitCode::from(cli::handle_status(&host, port, timeout_ms).await as u8)
        }

        Some(Command::Config(sub)) => {
            let result = match sub {
                ConfigCommand::Show => cli::handle_config_show(),
                ConfigCommand::Get { key } => cli::handle_config_get(&key),
                ConfigCommand::Path => {
                    cli::handle_config_path();
                    Ok(())
                }
            };
            match result {
                Ok(()) => ExitCode::SUCCESS,
                Err(err) => {
                    eprintln!("{err}");
                    ExitCode::from(cli::EXIT_VALIDATION as u8)
                }
            }
        }

        Some(Command::Version) => {
            cli::handle_version();
            ExitCode::SUCCESS
        }
    }
}

fn configured_port() -> u16 {
    config::load_config()
        .ok()
        .and_then(|cfg| {
            cfg.get("gateway")
                .and_then(|g| g.get("port"))
                .and_then(|v| v.as_u64())
        })
        .map(|p| p as u16)
        .unwrap_or(DEFAULT_PORT)
}

/// Initialize logging based on the CLAWDBOT_DEV environment variable.
fn init_logging_from_env() -> Result<(), Box<dyn std::error::Error>> {
    let log_config = if std::env::var("CLAWDBOT_DEV")
        .map(|v| !v.is_empty() && v != "0" && v.to_lowercase() != "false")
        .unwrap_or(false)
    {
        logging::LogConfig::development()
    } else {
        logging::LogConfig::production()
    };
    logging::init_logging(log_config)?;
    Ok(())
}

async fn run_gateway() -> Result<(), Box<dyn std::error::Error>> {
    init_logging_from_env()?;

    let cfg = config::load_config().unwrap_or_else(|e| {
        warn!(target: "config", "failed to load config: {e}, using defaults");
        serde_json::Value::Object(serde_json::Map::new())
    });

    let state_dir = config::state_dir();
    std::fs::create_dir_all(&state_dir)?;
    std::fs::create_dir_all(state_dir.join("sessions"))?;

    let ws_config = server::ws::WsServerConfig::from_config(&cfg)?;

    let approvals = Arc::new(approvals::ApprovalStore::in_state_dir(&state_dir));
    // Materialize the approvals file (and its socket token) at startup.
    let approvals_file = approvals.load()?;
    let manager = Arc::new(approvals::manager::ApprovalManager::new());

    let (exit_tx, exit_rx) = mpsc::unbounded_channel();
    let exec_engine = Arc::new(
        exec::executor::ExecEngine::new(Arc::clone(&approvals), Arc::clone(&manager))
            .with_exit_notes(exit_tx),
    );

    let session_store = Arc::new(sessions::store::SessionStore::new(state_dir.join("sessions")));
    let orchestrator = Arc::new(agent::runner::SessionOrchestrator::new(
        cfg.clone(),
        Arc::clone(&session_store),
        Arc::clone(&exec_engine),
    ));

    let node_registry = Arc::new(nodes::NodeRegistry::new());
    let state = Arc::new(server::ws::WsServerState::new(
        ws_config,
        cfg.clone(),
        node_registry,
        exec_engine,
        orchestrator,
    ));
    server::ws::wire_runtime(&state, exit_rx);

    let port = cfg
        .get("gateway")
        .and_then(|g| g.get("port"))
        .and_then(|v| v.as_u64())
        .map(|p| p as u16)
        .unwrap_or(DEFAULT_PORT);
    let addr: SocketAddr = ([127, 0, 0, 1], port).into();

    info!(target: "gateway", "clawdbot gateway v{}", env!("CARGO_PKG_VERSION"));
    info!(target: "gateway", "listening on ws://{addr}/ws");
    info!(target: "gateway", "state directory: {}", state_dir.display());
    info!(
        target: "approvals",
        "approval socket: {}",
        approvals_file.socket.path
    );

    let app = Router::new()
        .route("/ws", get(server::ws::ws_handler))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let reason = await_shutdown_trigger().await;
        info!(target: "gateway", "shutdown signal received ({reason})");
    })
    .await?;

    info!(target: "gateway", "gateway shut down");
    Ok(())
}

/// Wait for either Ctrl+C or SIGTERM (Unix only) and return a label.
#[cfg(unix)]
async fn await_shutdown_trigger() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => "ctrl-c",
                _ = sigterm.recv() => "SIGTERM",
            }
        }
        Err(e) => {
            warn!(
                target: "gateway",
                "failed to install SIGTERM handler: {e}; falling back to Ctrl+C only"
            );
            let _ = tokio::signal::ctrl_c().await;
            "ctrl-c"
        }
    }
}

#[cfg(not(unix))]
async fn await_shutdown_trigger() -> &'static str {
    let _ = tokio::signal::ctrl_c().await;
    "ctrl-c"
}
