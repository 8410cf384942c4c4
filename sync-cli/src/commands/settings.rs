//! Effective configuration.

use anyhow::{Context, Result};
use sync_client::NodeConfig;

/// Print the configuration as TOML.
pub fn run(config: &NodeConfig) -> Result<()> {
    let rendered = config
        .to_toml()
        .context("Failed to render configuration")?;
    print!("{}", rendered);
    Ok(())
}
