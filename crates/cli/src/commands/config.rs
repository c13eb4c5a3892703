//! `config`: generate, check and dump configuration.

use std::path::Path;

use anyhow::{Result, bail};
use cidsift_core::Config;

use super::checked_config;
use crate::ConfigCommand;

pub async fn cmd_config(config_file: Option<&Path>, command: ConfigCommand) -> Result<()> {
  match command {
    ConfigCommand::Generate => {
      let Some(path) = config_file else {
        bail!("config generate requires --config FILE");
      };
      Config::default().write(path)?;
      println!("Default configuration written to {}", path.display());
      Ok(())
    }
    ConfigCommand::Check => {
      checked_config(config_file)?;
      println!("Configuration checked.");
      Ok(())
    }
    ConfigCommand::Dump => {
      let config = Config::load(config_file)?;
      print!("{}", config.to_yaml()?);
      Ok(())
    }
  }
}
