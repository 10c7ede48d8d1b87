//! gtoaes — observation control server for GWAC and follow-up telescopes.
//!
//! Accepts plan-submission and command traffic from operator clients over
//! six TCP ports, routes it to the matching observation system, drives each
//! unit through its observation plan and streams live status back to every
//! connected client.

use std::path::Path;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use gtoaes::config::Config;
use gtoaes::hub::Hub;
use gtoaes::pidlock::{PidLock, PidLockError};

const DAEMON_NAME: &str = "gtoaes";
const LOG_DIR: &str = "/var/log/gtoaes";
const CONFIG_NAME: &str = "gtoaes.xml";
const CONFIG_PATH: &str = "/usr/local/etc/gtoaes.xml";
const PID_PATH: &str = "/var/run/gtoaes.pid";

#[derive(Parser)]
#[command(name = DAEMON_NAME, version, about = "observation control server for GWAC / GFT")]
struct Cli {
    /// Write the default configuration file into the working directory and
    /// exit.
    #[arg(short = 'd', long = "default-config")]
    default_config: bool,
}

fn init_logging() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "gtoaes=info,obs_proto=info".into());
    if cfg!(debug_assertions) {
        tracing_subscriber::fmt().with_env_filter(filter).init();
        None
    } else {
        let appender = tracing_appender::rolling::daily(LOG_DIR, DAEMON_NAME);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(writer)
            .with_ansi(false)
            .init();
        Some(guard)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if cli.default_config {
        let path = Path::new(CONFIG_NAME);
        return match Config::default().save(path) {
            Ok(()) => {
                println!("default configuration written to {}", path.display());
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("{e}");
                ExitCode::FAILURE
            }
        };
    }

    let _log_guard = init_logging();

    let config_path = if cfg!(debug_assertions) {
        Path::new(CONFIG_NAME)
    } else {
        Path::new(CONFIG_PATH)
    };
    let config = match Config::load(config_path) {
        Ok(config) => config,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let _pid_lock = match PidLock::acquire(Path::new(PID_PATH)) {
        Ok(lock) => lock,
        Err(e @ PidLockError::AlreadyRunning(_)) => {
            error!("{DAEMON_NAME}: {e}");
            return ExitCode::from(2);
        }
        Err(e) => {
            error!("{DAEMON_NAME}: {e}");
            return ExitCode::FAILURE;
        }
    };

    info!(
        "launching {DAEMON_NAME} v{} at site {}",
        env!("CARGO_PKG_VERSION"),
        config.site.name
    );

    let hub = match Hub::start(config).await {
        Ok(hub) => hub,
        Err(e) => {
            error!("failed to launch {DAEMON_NAME}: {e}");
            return ExitCode::FAILURE;
        }
    };
    info!("daemon goes running");

    wait_for_signal().await;

    hub.stop().await;
    info!("daemon stopped");
    ExitCode::SUCCESS
}

async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
    info!("shutdown signal received");
}
