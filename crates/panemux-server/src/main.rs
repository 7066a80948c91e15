//! panemux-server: persistent terminal session daemon.
//!
//! Keeps PTY-backed shells alive across UI remounts and client reconnects.
//! Clients talk to it over a local Unix socket or a WebSocket relay.

mod config;
mod connection;
mod server;
mod transport;

use clap::Parser;
use config::{CliOverrides, ServerConfig};
use panemux_core::pty::NativePtyBackend;
use panemux_core::{BufferPolicy, SessionRegistry};
use server::MuxServer;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

/// panemux-server: persistent terminal session daemon
#[derive(Parser, Debug)]
#[command(name = "panemux-server", version, about = "Persistent terminal session daemon")]
struct Cli {
    /// Config file path
    #[arg(long, default_value = "~/.panemux/config.toml")]
    config: String,

    /// WebSocket relay bind address
    #[arg(long)]
    bind: Option<String>,

    /// WebSocket relay port (0 disables the relay)
    #[arg(short, long)]
    port: Option<u16>,

    /// Local socket path ("" disables the socket)
    #[arg(long)]
    socket: Option<String>,

    /// Idle timeout in seconds (0 disables the sweep)
    #[arg(long)]
    idle_timeout: Option<u64>,

    /// Keep buffering output while no client is attached
    #[arg(long, value_enum)]
    buffer_policy: Option<PolicyArg>,

    /// Shell to run in new sessions
    #[arg(long)]
    shell: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum PolicyArg {
    Always,
    WhileAttached,
}

impl From<PolicyArg> for BufferPolicy {
    fn from(arg: PolicyArg) -> Self {
        match arg {
            PolicyArg::Always => BufferPolicy::Always,
            PolicyArg::WhileAttached => BufferPolicy::WhileAttached,
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting panemux-server");

    let config_path = PathBuf::from(&cli.config);
    let overrides = CliOverrides {
        bind: cli.bind,
        port: cli.port,
        socket: cli.socket,
        idle_timeout: cli.idle_timeout,
        buffer_policy: cli.buffer_policy.map(BufferPolicy::from),
        shell: cli.shell,
    };
    let server_config = match ServerConfig::load(Some(&config_path), overrides) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    let registry = SessionRegistry::new(
        Arc::new(NativePtyBackend::new()),
        server_config.registry.clone(),
    );
    let server = Arc::new(MuxServer::new(server_config, registry));

    tokio::select! {
        result = server.clone().run() => {
            if let Err(e) = result {
                error!(error = %e, "server error");
                server.shutdown("server error").await;
                std::process::exit(1);
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    server.shutdown("server shutdown").await;
    info!("panemux-server stopped");
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
