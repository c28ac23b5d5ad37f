#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # holocron
//!
//! Local tunnel agent. A controller (typically a browser extension through
//! native messaging) sends length-prefixed JSON requests on stdin; the agent
//! starts, stops, detects and diagnoses SSH, OpenVPN, V2Ray and Shadowsocks
//! tunnels and answers on stdout.
//!
//! ## Subcommands
//!
//! - `holocron serve` (default): serve the framed channel on stdio
//! - `holocron status <profile.json>`: one-shot status check, JSON to stdout
//!
//! The controller may append its own arguments (caller origin,
//! `--parent-window`); they are accepted and ignored.
//!
//! ## Commands
//!
//! | command          | effect                                             |
//! |------------------|----------------------------------------------------|
//! | `getStatus`      | detect + diagnostics (direct when tunnel is down)  |
//! | `startTunnel`    | launch and verify                                  |
//! | `stopTunnel`     | terminate and clean up, idempotent                 |
//! | `testConnection` | diagnostics, starting/stopping the tunnel if down  |
//! | `getLogs`        | tail of a connection's logs or the agent log       |
//! | `clearLogs`      | clear the same                                     |
//!
//! ## Architecture
//!
//! ```text
//! main.rs           entry point, clap subcommands, logging
//! config.rs         TOML + env-var configuration
//! protocol.rs       length-prefixed JSON framing, request decoding
//! server.rs         command loop and response shaping
//! tunnel.rs         facade + per-identifier state
//! launch/           start/stop engine (helpers, OpenVPN log tail, configs)
//! detect.rs         process-table detection, stale lock healing
//! extract.rs        SOCKS port extraction
//! ports.rs          listening-port owner lookup
//! artifacts.rs      per-connection files and their cleanup
//! diagnostics.rs    TCP ping + HTTP HEAD probes
//! process/          process table, signals, bounded helper execution
//! ```

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use clap::{Parser, Subcommand};
use tracing::{debug, error, info};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

use holocron::config::Config;
use holocron::launch::Engine;
use holocron::process::SystemProcessTable;
use holocron::server::Server;
use holocron::tunnel::TunnelManager;

/// Local tunnel agent for SSH, OpenVPN, V2Ray and Shadowsocks.
#[derive(Parser)]
#[command(name = "holocron", version, args_conflicts_with_subcommands = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Path to TOML config file.
    #[arg(long, global = true)]
    config: Option<String>,

    /// Caller origin appended by the controller.
    #[arg(hide = true)]
    caller: Option<String>,

    /// Window handle appended by the controller on some platforms.
    #[arg(long, hide = true)]
    parent_window: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the framed request channel on stdin/stdout (default).
    Serve,
    /// Print the status of one connection profile as JSON.
    Status {
        /// JSON file holding a connection profile.
        profile: PathBuf,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();

    let config = match Config::load(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("holocron: {e}");
            std::process::exit(1);
        }
    };
    init_logging(&config);
    if let Some(window) = &cli.parent_window {
        debug!("Parent window: {window}");
    }

    let code = match cli.command {
        None | Some(Commands::Serve) => run_server(config, cli.caller.as_deref()).await,
        Some(Commands::Status { profile }) => run_status(config, &profile).await,
    };
    std::process::exit(code);
}

/// Log to the configured file; stdout is reserved for the framed channel.
fn init_logging(config: &Config) {
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    let path = config.log_file();
    if let Some(dir) = path.parent() {
        let _ = std::fs::create_dir_all(dir);
    }
    let writer = match OpenOptions::new().create(true).append(true).open(&path) {
        Ok(file) => BoxMakeWriter::new(Mutex::new(file)),
        Err(e) => {
            eprintln!("holocron: cannot open {}: {e}; logging to stderr", path.display());
            BoxMakeWriter::new(std::io::stderr)
        }
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_filter))
        .with_ansi(false)
        .with_writer(writer)
        .init();
}

fn build_server(config: Config) -> Server {
    let engine = Engine::new(Arc::new(config), Arc::new(SystemProcessTable));
    Server::new(TunnelManager::new(engine))
}

async fn run_server(config: Config, caller: Option<&str>) -> i32 {
    info!("holocron v{} starting", env!("CARGO_PKG_VERSION"));
    if let Some(caller) = caller {
        info!("Caller: {caller}");
    }
    info!("Runtime dir: {}", config.runtime_dir().display());

    let mut server = build_server(config);
    let mut stdin = tokio::io::stdin();
    let mut stdout = tokio::io::stdout();
    match server.run(&mut stdin, &mut stdout).await {
        Ok(()) => {
            info!("holocron exiting");
            0
        }
        Err(e) => {
            error!("holocron exiting: {e}");
            1
        }
    }
}

async fn run_status(config: Config, profile: &Path) -> i32 {
    let text = match tokio::fs::read_to_string(profile).await {
        Ok(t) => t,
        Err(e) => {
            eprintln!("holocron: cannot read {}: {e}", profile.display());
            return 1;
        }
    };
    let profile: serde_json::Value = match serde_json::from_str(&text) {
        Ok(v) => v,
        Err(e) => {
            eprintln!("holocron: {} is not valid JSON: {e}", profile.display());
            return 1;
        }
    };

    let mut server = build_server(config);
    let request = serde_json::json!({ "command": "getStatus", "config": profile });
    let response = server.handle(request.to_string().as_bytes()).await;
    match serde_json::to_string_pretty(&response) {
        Ok(s) => {
            println!("{s}");
            0
        }
        Err(e) => {
            eprintln!("holocron: {e}");
            1
        }
    }
}
