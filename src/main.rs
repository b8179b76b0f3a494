use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use rust_vswitch_common::metrics::SwitchMetrics;
use rust_vswitch_stack::SwitchConfig;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

mod echo;
mod iface;
mod switch;

use switch::Switch;

/// Userspace VXLAN virtual switch
#[derive(Parser)]
#[clap(author, version, about)]
struct Cli {
    /// Configuration file (toml, yaml or json)
    #[clap(short, long)]
    config: PathBuf,

    /// Overrides the bind address of the configuration
    #[clap(short, long)]
    bind: Option<SocketAddr>,

    /// Sets the level of verbosity
    #[clap(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(
        if cli.verbose { "debug" } else { "info" }
    )).init();

    let mut config = SwitchConfig::load(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;
    if let Some(bind) = cli.bind {
        config.bind = bind;
    }
    info!(
        "starting vswitch with {} tables, {} remotes and {} listeners",
        config.tables.len(),
        config.remotes.len(),
        config.listeners.len()
    );

    let metrics = Arc::new(SwitchMetrics::new());
    let switch = Switch::bind(&config, metrics).await?;
    switch.run().await
}
