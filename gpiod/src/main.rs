//! `gpiod`: multiplexed daemon exposing line, bus and script operations
//! over the wire protocol in [`protocol`].

mod commands;
mod permit;
mod protocol;
mod server;
mod session;

use std::{path::PathBuf, process::ExitCode, sync::Arc};

use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use gpio_core::Engine;
use permit::PermitSet;
use server::ServerConfig;

/// Exit codes: 0 ok, 1 bad args, 2 cannot bind, 3 permit-file error.
#[derive(Parser, Debug)]
#[command(name = "gpiod", version, about = "GPIO line, bus and script daemon")]
struct Args {
    /// Unix-domain socket path to listen on.
    #[arg(long)]
    bind_unix: Option<PathBuf>,

    /// TCP address (host:port) to listen on.
    #[arg(long, env = "GPIOD_PORT")]
    bind_tcp: Option<String>,

    /// INI-style permit file (§4.4). Omit to run with the default
    /// all-commands permit set, suitable for a trusted single-operator
    /// SBC.
    #[arg(long)]
    permit_file: Option<PathBuf>,

    /// Shared-secret file consulted during `set_user`.
    #[arg(long)]
    secret_file: Option<PathBuf>,

    /// Directory holding notification FIFOs handed out by `notify_open`.
    #[arg(long, default_value = "/tmp/gpiod-notify")]
    notifier_dir: PathBuf,

    /// Directory of scripts `shell_exec` may run.
    #[arg(long, default_value = "/etc/gpiod/shell")]
    script_dir: PathBuf,

    #[arg(long, default_value_t = tracing::Level::INFO)]
    log_level: tracing::Level,
}

fn main() -> ExitCode {
    let args = match try_parse_args() {
        Ok(args) => args,
        Err(code) => return code,
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(args.log_level.as_str())))
        .init();

    let permits = match load_permits(&args) {
        Ok(p) => p,
        Err(code) => return code,
    };

    if let Err(e) = std::fs::create_dir_all(&args.notifier_dir) {
        tracing::error!(error = %e, "cannot create notifier directory");
        return ExitCode::from(2);
    }

    let engine = Arc::new(Engine::new());
    let config = ServerConfig {
        bind_unix: args.bind_unix,
        bind_tcp: args.bind_tcp,
        notifier_dir: args.notifier_dir,
        script_dir: args.script_dir,
        sbc_name: sbc_name(),
    };

    match server::run(config, engine, Arc::new(permits)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "cannot bind listener");
            ExitCode::from(2)
        }
    }
}

fn try_parse_args() -> Result<Args, ExitCode> {
    match Args::try_parse() {
        Ok(args) => {
            if args.bind_unix.is_none() && args.bind_tcp.is_none() {
                eprintln!("gpiod: at least one of --bind-unix or --bind-tcp is required");
                return Err(ExitCode::from(1));
            }
            Ok(args)
        }
        Err(e) => {
            e.print().ok();
            Err(ExitCode::from(1))
        }
    }
}

fn load_permits(args: &Args) -> Result<PermitSet, ExitCode> {
    match &args.permit_file {
        Some(path) => PermitSet::load(path, args.secret_file.as_deref()).map_err(|e| {
            tracing::error!(error = %e, "failed to load permit file");
            ExitCode::from(3)
        }),
        None => Ok(PermitSet::open_default()),
    }
}

fn sbc_name() -> String {
    std::fs::read_to_string("/etc/hostname")
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|_| "gpiod".to_string())
}
