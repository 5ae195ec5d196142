//! HTTP to FastCGI gateway.
//!
//! Serves HTTP requests by translating them into FastCGI records for a
//! responder program listening on a Unix socket.
//!
//! # Architecture Overview
//!
//! ```text
//!                          ┌────────────────────────────────────────────┐
//!                          │                  GATEWAY                    │
//!                          │                                            │
//!     Client Request       │  ┌─────────┐    ┌──────────────────────┐   │
//!     ─────────────────────┼─▶│  http   │───▶│  gateway engine      │   │
//!                          │  │ server  │    │  pending → in-flight │   │
//!                          │  └─────────┘    └──────────┬───────────┘   │
//!                          │                            │               │
//!                          │                            ▼               │
//!                          │                 ┌──────────────────────┐   │
//!                          │                 │  backend connector   │   │     FastCGI
//!                          │                 │  backoff, get-values │◀──┼──── program
//!                          │                 └──────────┬───────────┘   │     (Unix socket)
//!                          │                            │               │
//!     Client Response      │  ┌─────────┐    ┌──────────▼───────────┐   │
//!     ◀────────────────────┼──│response │◀───│  fcgi framer/codec   │   │
//!                          │  │assembler│    │  records ↔ bytes     │   │
//!                          │  └─────────┘    └──────────────────────┘   │
//!                          │                                            │
//!                          │  ┌──────────────────────────────────────┐  │
//!                          │  │        Cross-Cutting Concerns        │  │
//!                          │  │  config · observability · lifecycle  │  │
//!                          │  │  process (launcher, pidfile)         │  │
//!                          │  └──────────────────────────────────────┘  │
//!                          └────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;

use clap::Parser;
use tokio::net::TcpListener;

use fcgi_gate::config::{loader, validation, GatewayConfig};
use fcgi_gate::process::{BackendProcess, Pidfile, STARTUP_GRACE};
use fcgi_gate::{gateway, observability};
use fcgi_gate::{HttpServer, Shutdown};

#[derive(Parser)]
#[command(name = "fcgi-gate")]
#[command(about = "Serve HTTP requests from a FastCGI program", long_about = None)]
struct Cli {
    /// Listening port number
    #[arg(long)]
    port: Option<u16>,

    /// Unix socket the FastCGI program listens on
    #[arg(long)]
    socket: Option<String>,

    /// Path to a TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Write a pidfile and refuse to start if it already exists
    #[arg(long)]
    pidfile: Option<PathBuf>,

    /// FastCGI program to launch, with its arguments
    #[arg(trailing_var_arg = true)]
    command: Vec<String>,
}

#[tokio::main]
async fn main() {
    observability::logging::init();

    // Every failure mode exits 1, bad usage included.
    let cli = Cli::try_parse().unwrap_or_else(|err| {
        let _ = err.print();
        std::process::exit(1);
    });

    if let Err(err) = run(cli).await {
        tracing::error!(error = %err, "Fatal error");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    tracing::info!("fcgi-gate v{} starting", env!("CARGO_PKG_VERSION"));

    let mut config = match &cli.config {
        Some(path) => loader::load_file(path)?,
        None => GatewayConfig::default(),
    };
    if let Some(port) = cli.port {
        config.listener.bind_address = format!("0.0.0.0:{port}");
    }
    if let Some(socket) = cli.socket {
        config.backend.socket_path = socket;
    }
    if let Err(errors) = validation::validate_config(&config) {
        for error in &errors {
            tracing::error!("Invalid configuration: {}", error);
        }
        return Err("configuration rejected".into());
    }

    tracing::info!(
        bind_address = %config.listener.bind_address,
        socket = %config.backend.socket_path,
        "Configuration loaded"
    );

    // Held for the rest of the run; removed on drop.
    let _pidfile = match &cli.pidfile {
        Some(path) => Some(Pidfile::acquire(path)?),
        None => None,
    };

    let mut backend = None;
    if !cli.command.is_empty() {
        backend = Some(BackendProcess::spawn(&cli.command)?);
        // Give the program time to bind its socket before we connect.
        tokio::time::sleep(STARTUP_GRACE).await;
    }

    let listener = TcpListener::bind(&config.listener.bind_address).await?;
    let local_addr = listener.local_addr()?;
    tracing::info!(address = %local_addr, "Listening for connections");

    let (handle, engine) = gateway::spawn(config.backend.clone());
    let server = HttpServer::new(&config, handle, local_addr.port());

    let shutdown = Shutdown::new();
    shutdown.trigger_on_ctrl_c();

    let result: Result<(), Box<dyn std::error::Error>> = tokio::select! {
        served = server.run(listener, shutdown.clone()) => served.map_err(Into::into),
        engine_exit = engine => match engine_exit {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(err.into()),
            Err(join_err) => Err(join_err.into()),
        },
        exited = wait_for_backend(&mut backend) => {
            // Already reaped; nothing left to stop.
            backend = None;
            match exited {
                Ok(status) => Err(format!("backend exited with {status}").into()),
                Err(err) => Err(err.into()),
            }
        },
    };

    if let Some(mut child) = backend {
        child.stop().await;
    }

    tracing::info!("Shutdown complete");
    result
}

/// Resolve when the launched backend exits; pend forever without one.
async fn wait_for_backend(
    backend: &mut Option<BackendProcess>,
) -> std::io::Result<std::process::ExitStatus> {
    match backend {
        Some(child) => child.wait().await,
        None => std::future::pending().await,
    }
}
