//! # obs-sim
//!
//! Impersonates one GWAC group against a running `gtoaes` broker: a mount
//! endpoint multiplexing N units, a focuser endpoint with five channels per
//! unit, and one camera process per unit. Useful for driving the broker
//! without hardware:
//!
//! ```text
//! obs-sim --host 127.0.0.1 --gid 001 --units 5
//! ```
//!
//! Each simulated device connects to the matching broker port, streams
//! status at the configured cadence and acknowledges every positional
//! command with a `...Rec...` response, so the retransmission discipline
//! sees a well-behaved device.

mod camera;
mod focuser;
mod mount;
mod wire;

use clap::Parser;
use tracing::info;

#[derive(Parser, Debug, Clone)]
#[command(name = "obs-sim", about = "GWAC device-group simulator")]
pub struct Cli {
    /// Broker host.
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    /// GWAC mount port of the broker.
    #[arg(long, default_value_t = 5011)]
    pub mount_port: u16,

    /// GWAC camera port of the broker.
    #[arg(long, default_value_t = 5012)]
    pub camera_port: u16,

    /// GWAC focuser port of the broker.
    #[arg(long, default_value_t = 5013)]
    pub focus_port: u16,

    /// Group identifier, three characters.
    #[arg(long, default_value = "001")]
    pub gid: String,

    /// Units multiplexed on the mount endpoint.
    #[arg(long, default_value_t = 5)]
    pub units: usize,

    /// Status cadence, seconds.
    #[arg(long, default_value_t = 2.0)]
    pub cadence: f64,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "obs_sim=info,obs_simulator=info".into()),
        )
        .init();

    let cli = Cli::parse();
    info!(
        "simulating group {} with {} units against {}",
        cli.gid, cli.units, cli.host
    );

    tokio::spawn(mount::run(cli.clone()));
    tokio::spawn(focuser::run(cli.clone()));
    for unit in 1..=cli.units {
        tokio::spawn(camera::run(cli.clone(), unit));
    }

    let _ = tokio::signal::ctrl_c().await;
    info!("simulator stopped");
}
