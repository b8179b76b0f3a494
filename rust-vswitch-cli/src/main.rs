use anyhow::Result;
use clap::{Parser, Subcommand};
use rust_vswitch_common::types::Vni;
use std::net::IpAddr;
use std::path::PathBuf;

mod commands;

/// vswitch admin command line
#[derive(Parser)]
#[clap(author, version, about)]
struct Cli {
    /// Sets the level of verbosity
    #[clap(short, long, global = true)]
    verbose: bool,

    /// Subcommand to execute
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a configuration and print what it builds
    Check {
        /// Configuration file
        config: PathBuf,
    },

    /// Show which route a destination takes inside a table
    Route {
        /// Configuration file
        config: PathBuf,

        /// Table to look up in
        #[clap(long)]
        vni: Vni,

        /// Destination address
        ip: IpAddr,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(
        if cli.verbose { "debug" } else { "warn" }
    )).init();

    match cli.command {
        Commands::Check { config } => commands::check::handle_command(config),
        Commands::Route { config, vni, ip } => commands::route::handle_command(config, vni, ip),
    }
}
