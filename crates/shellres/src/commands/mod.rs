//! Command implementations
//!
//! Each subcommand loads the provider configuration and the resource record,
//! runs one lifecycle operation against them and reports the result as JSON
//! on stdout.

mod apply;
mod plan;

pub use apply::{apply, exists, Action};
pub use plan::plan;

use anyhow::{Context, Result};
use serde::Serialize;
use shellres_core::state::{Overrides, ResourceRecord};
use shellres_core::{Lifecycle, ProviderConfig};
use std::path::PathBuf;
use tracing::debug;

/// Resolved arguments of a resource subcommand
#[derive(Debug, Clone)]
pub struct ResourceArgs {
    pub config: PathBuf,
    pub record: PathBuf,
    pub overrides: Overrides,
}

/// Load the provider configuration and build the engine
fn load_engine(args: &ResourceArgs) -> Result<Lifecycle> {
    let config = ProviderConfig::load(&args.config)
        .with_context(|| format!("Failed to load provider config {}", args.config.display()))?;
    debug!(path = %args.config.display(), "Loaded provider config");
    Ok(Lifecycle::new(config)?)
}

fn load_record(args: &ResourceArgs) -> Result<ResourceRecord> {
    ResourceRecord::load(&args.record)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value).context("Failed to render JSON")?;
    println!("{}", rendered);
    Ok(())
}
