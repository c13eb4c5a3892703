//! Command implementations.

mod add;
mod config;
mod crawl;

use std::path::Path;

use anyhow::Context;
use cidsift_core::Config;

pub use add::cmd_add;
pub use config::cmd_config;
pub use crawl::cmd_crawl;

/// Load and validate the effective configuration.
fn checked_config(file: Option<&Path>) -> anyhow::Result<Config> {
  let config = Config::load(file).context("loading configuration")?;
  config.check()?;
  Ok(config)
}
