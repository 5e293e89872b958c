//! `kiln` — runs the daemon as either a primary or a replica, depending
//! on `--replicaof`.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use kiln::daemon;
use kiln_config::Settings;
use kiln_server::ShutdownHandle;

#[derive(Parser)]
#[command(name = "kiln", about = "An in-memory key/value store with primary/replica replication")]
struct Cli {
    /// Path to a TOML settings file. Defaults are used for anything it
    /// doesn't set, and entirely if the file doesn't exist.
    #[arg(long, default_value = "kiln.toml")]
    config: PathBuf,

    /// `host:port` of a primary to replicate from. Omit to run as a
    /// standalone primary.
    #[arg(long)]
    replicaof: Option<SocketAddr>,

    /// Overrides the settings file's bind address.
    #[arg(long)]
    bind: Option<String>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let mut settings = Settings::load_or_default(&cli.config)
        .with_context(|| format!("loading settings from {}", cli.config.display()))?;
    if let Some(bind) = cli.bind {
        settings.bind_address = bind;
    }

    let shutdown = ShutdownHandle::new();
    install_signal_handlers(shutdown.clone())?;

    match cli.replicaof {
        Some(primary_addr) => {
            info!(%primary_addr, "starting as a replica");
            daemon::run_replica(&settings, primary_addr, shutdown)?;
        }
        None => {
            info!("starting as a primary");
            let mut server = daemon::build_primary_server(&settings)?;
            server.run()?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn install_signal_handlers(shutdown: ShutdownHandle) -> Result<()> {
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM])?;
    std::thread::spawn(move || {
        if signals.forever().next().is_some() {
            shutdown.request();
        }
    });
    Ok(())
}

#[cfg(not(unix))]
fn install_signal_handlers(_shutdown: ShutdownHandle) -> Result<()> {
    Ok(())
}
