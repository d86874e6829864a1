use clap::Parser;
use dnsgate::config::StatePaths;
use dnsgate::core::Core;
use dnsgate::events::LogBus;
use dnsgate::{devices, http_server, ingest};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// DNS filtering engine for the router's resolver chain.
#[derive(Debug, Parser)]
#[command(name = "dnsgate", version)]
struct Cli {
    /// Optional mode token; `enable_superapi` turns on the config file,
    /// override lists and the admin API.
    #[arg(value_parser = ["enable_superapi"])]
    mode: Option<String>,

    /// State prefix; defaults to $TEST_PREFIX.
    #[arg(long)]
    prefix: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let spr_enabled = cli.mode.as_deref() == Some("enable_superapi");
    let paths = match cli.prefix {
        Some(prefix) => StatePaths::new(prefix),
        None => StatePaths::from_env(),
    };

    let core = Core::open(paths, spr_enabled, Arc::new(LogBus))?;

    // initial index build, then the periodic refresh
    {
        let core = core.clone();
        tokio::spawn(async move {
            ingest::download_with_retry(&core).await;
        });
    }
    tokio::spawn(ingest::refresh_loop(core.clone()));

    tokio::spawn(devices::refresh_loop(
        core.devices.clone(),
        core.paths().devices_path(),
        core.subscribe_shutdown(),
    ));

    if spr_enabled {
        let core = core.clone();
        tokio::spawn(async move {
            if let Err(e) = http_server::serve(core).await {
                error!(error = %e, "admin API exited");
            }
        });
    }

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    core.trigger_shutdown();

    Ok(())
}
