//! `dronelink` – relay operator commands to a vehicle control endpoint and
//! broadcast every outcome to observers.
//!
//! On start the binary:
//!
//! 1. Loads `~/.dronelink/config.toml` (or `--config`), applying
//!    `DRONELINK_*` environment overrides.
//! 2. Loads or generates the hub's TLS material; `--plain` skips TLS.
//! 3. Runs the relay until Ctrl-C, or until the downstream link cannot be
//!    re-established, in which case it exits with status `1`.
//!
//! `--write-config` persists the effective settings instead of running.
//!
//! With `--enable-keyboard` every stdin line is enqueued as an operator
//! event (`press:w`, `release:w`, `press:k`, `throttle:0.4`, …).

mod config;
mod tls;

use std::net::IpAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use colored::Colorize;
use dronelink_hub::HubServer;
use dronelink_middleware::{EventQueue, TcpConnector};
use dronelink_runtime::{RelayService, init_tracing};
use dronelink_types::{Event, RelayError};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;

#[derive(Parser, Debug)]
#[command(name = "dronelink", version, about = "Reliable command relay and observer hub")]
struct Args {
    /// Config file (default `~/.dronelink/config.toml`).
    #[arg(long, env = "DRONELINK_CONFIG")]
    config: Option<PathBuf>,

    /// Read operator commands from stdin, one per line.
    #[arg(long)]
    enable_keyboard: bool,

    /// Serve observers over plain `ws` even when TLS material is available.
    #[arg(long)]
    plain: bool,

    /// Observer hub port.
    #[arg(long)]
    port: Option<u16>,

    /// Write the effective configuration to the config file and exit.
    #[arg(long)]
    write_config: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();
    let _telemetry = init_tracing("dronelink");

    print_banner();

    let config_path = args.config.clone().unwrap_or_else(config::config_path);
    let mut cfg = match config::load_or_default(&config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, path = %config_path.display(), "cannot load config");
            return ExitCode::FAILURE;
        }
    };
    if args.enable_keyboard {
        cfg.keyboard_enabled = true;
    }
    if let Some(port) = args.port {
        cfg.hub_port = port;
    }
    if args.write_config {
        return match config::save_to(&cfg, &config_path) {
            Ok(()) => {
                println!("  Config written to {}", config_path.display());
                ExitCode::SUCCESS
            }
            Err(e) => {
                error!(error = %e, "cannot write config");
                ExitCode::FAILURE
            }
        };
    }
    if let Err(e) = cfg.validate() {
        error!(error = %e, "invalid configuration");
        return ExitCode::FAILURE;
    }
    info!(config = ?cfg, "configuration loaded");

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "failed to build the async runtime");
            return ExitCode::FAILURE;
        }
    };

    let result = runtime.block_on(run(cfg, &config_path, args.plain));
    // A pending stdin read must not hold the process open.
    runtime.shutdown_timeout(Duration::from_secs(1));

    match result {
        Ok(()) => {
            println!("{}", "  ✓ Relay stopped.".green());
            ExitCode::SUCCESS
        }
        Err(RelayError::LinkExhausted { attempts }) => {
            error!(
                attempts,
                "downstream link lost for good; the vehicle must fall back to its own failsafe"
            );
            println!(
                "{}",
                format!("  ✗ Control link lost after {attempts} reconnect attempts.").red().bold()
            );
            ExitCode::FAILURE
        }
        Err(e) => {
            error!(error = %e, "relay failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(cfg: Config, config_path: &std::path::Path, plain: bool) -> Result<(), RelayError> {
    let connector = TcpConnector::new(cfg.downstream_addr())
        .with_connect_timeout(cfg.connect_timeout())
        .with_write_timeout(cfg.write_timeout());
    let mut service = RelayService::new(connector, cfg.relay_config());

    let bind: IpAddr = cfg
        .hub_bind
        .parse()
        .map_err(|e| RelayError::Config(format!("invalid hub_bind {:?}: {e}", cfg.hub_bind)))?;
    let mut hub = HubServer::new(service.hub_context(), cfg.auth_token.as_str())
        .with_port(cfg.hub_port)
        .with_bind(bind)
        .with_keyboard_enabled(cfg.keyboard_enabled)
        .with_ping_interval(cfg.hub_ping_interval());
    if !plain {
        let config_dir = config_path
            .parent()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        let (cert, key) = cfg.tls_paths(&config_dir);
        if let Some(acceptor) = tls::acceptor_or_plain(&cert, &key, cfg.generate_self_signed) {
            hub = hub.with_tls(acceptor);
        }
    }
    println!(
        "  Observers: {}://{}:{}",
        hub.protocol(),
        cfg.hub_bind,
        hub.port()
    );
    println!("  Downstream: {}", cfg.downstream_addr());
    println!();
    service.attach_hub(hub);

    let shutdown = service.shutdown_token();
    install_ctrlc(shutdown.clone());

    if cfg.keyboard_enabled {
        tokio::spawn(read_operator_input(service.queue(), shutdown));
    }

    service.run().await
}

fn install_ctrlc(shutdown: CancellationToken) {
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – initiating graceful shutdown …".yellow().bold());
        shutdown.cancel();
    }) {
        warn!(error = %e, "failed to install Ctrl-C handler; Ctrl-C will not shut down gracefully");
    }
}

/// Enqueue each non-empty stdin line as an operator event until EOF or
/// shutdown.
async fn read_operator_input(queue: Arc<EventQueue>, shutdown: CancellationToken) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    info!("keyboard input enabled; one command per line");
    loop {
        let line = tokio::select! {
            _ = shutdown.cancelled() => break,
            line = lines.next_line() => line,
        };
        match line {
            Ok(Some(line)) => {
                if let Some(event) = Event::from_wire(&line) {
                    queue.enqueue(event);
                }
            }
            Ok(None) => {
                info!("stdin closed; keyboard input stopped");
                break;
            }
            Err(e) => {
                warn!(error = %e, "stdin read failed; keyboard input stopped");
                break;
            }
        }
    }
}

fn print_banner() {
    println!();
    println!("{}", r#"     __                      ___       __  "#.bold().cyan());
    println!("{}", r#"  __/ /______  ___  ___ ___ / (_)__  / /__"#.bold().cyan());
    println!("{}", r#" / _  / __/ _ \/ _ \/ -_) -_) / / _ \/  '_/"#.bold().cyan());
    println!("{}", r#" \_,_/_/  \___/_//_/\__/\__/_/_/_//_/_/\_\ "#.bold().cyan());
    println!();
    println!(
        "  {} {}",
        "dronelink".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  Reliable command relay and observer hub");
    println!();
}
