//! labfleetd: the control-plane daemon.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use labfleet::cloud::{CloudProvider, MockCloud};
use labfleet::{server, telemetry, ControlConfig};

#[derive(Parser, Debug)]
#[command(name = "labfleetd", about = "Control plane for virtual-lab worker fleets")]
struct Args {
    /// Path to the YAML configuration document
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Override the HTTP listen address
    #[arg(long)]
    listen: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => ControlConfig::load_from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => ControlConfig::load_from_env().context("loading configuration")?,
    };
    if let Some(listen) = args.listen {
        config.api.listen_addr = listen;
    }

    telemetry::init_tracing(&config.logging);

    // The in-process provider; a real IaaS adapter plugs in behind the same
    // trait.
    let cloud: Arc<dyn CloudProvider> = Arc::new(MockCloud::new());

    let shutdown = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "signal listener failed");
        }
    };

    server::run(config, cloud, shutdown)
        .await
        .context("control plane exited with error")?;
    Ok(())
}
