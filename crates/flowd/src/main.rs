//! flowd — the flowmesh daemon.
//!
//! # Usage
//!
//! ```text
//! flowd daemon --port 9002 --data-dir /var/lib/flowmesh --config flowd.toml
//! flowd gateways --config gateways.toml
//! ```

use std::net::IpAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use flowd::OrchestratorMode;
use flowd::daemon::DaemonOptions;

#[derive(Parser)]
#[command(name = "flowd", about = "flowmesh workflow daemon")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the control plane: state store, managers, health reconciler and API.
    Daemon {
        /// Port to listen on. Overrides `[daemon] port`.
        #[arg(long)]
        port: Option<u16>,

        /// Data directory for persistent state.
        #[arg(long, default_value = "/var/lib/flowmesh")]
        data_dir: PathBuf,

        /// Daemon configuration file (TOML).
        #[arg(long)]
        config: Option<PathBuf>,

        /// How deployments are applied.
        #[arg(long, value_enum, default_value_t = OrchestratorMode::Kubectl)]
        orchestrator: OrchestratorMode,

        /// Also run the gateways of this file, sharing the daemon's bus.
        #[arg(long)]
        gateways: Option<PathBuf>,
    },
    /// Run the gateways listed in a gateway file.
    Gateways {
        /// Gateway file (TOML).
        #[arg(long)]
        config: PathBuf,

        /// Address the gateways bind to.
        #[arg(long, default_value = "0.0.0.0")]
        bind: IpAddr,

        /// Failure endpoint. Overrides the file's `fail_url`.
        #[arg(long)]
        fail_url: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,flowd=debug,flowmesh=debug"));
    if cli.json_logs {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    match cli.command {
        Command::Daemon {
            port,
            data_dir,
            config,
            orchestrator,
            gateways,
        } => {
            flowd::daemon::run(DaemonOptions {
                port,
                data_dir,
                config,
                orchestrator,
                gateways,
            })
            .await
        }
        Command::Gateways {
            config,
            bind,
            fail_url,
        } => flowd::gateways::run(&config, bind, fail_url).await,
    }
}
