//! Subcommand implementations.

use anyhow::{Context, Result};
use log::debug;
use rust_vswitch_stack::{NetworkStack, SwitchConfig};
use std::path::Path;

pub mod check;
pub mod route;

/// Load a configuration and build the stack it describes.
fn load_stack(path: &Path) -> Result<(SwitchConfig, NetworkStack)> {
    let config = SwitchConfig::load(path).with_context(|| format!("Failed to load {}", path.display()))?;
    debug!("loaded {} tables from {}", config.tables.len(), path.display());
    let stack = config
        .build_stack()
        .with_context(|| format!("Invalid configuration {}", path.display()))?;
    Ok((config, stack))
}
