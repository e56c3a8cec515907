//! Config command implementation.

use std::path::Path;

use anyhow::{Context, Result};

use shrd_core::config::Config;

use super::{ConfigAction, ConfigArgs};

/// Run the config command.
pub fn run(args: ConfigArgs, config_path: Option<&Path>) -> Result<()> {
    let path = config_path.map_or_else(Config::config_path, Path::to_path_buf);

    match args.action {
        ConfigAction::Show => {
            let config = super::load_config(Some(path.as_path()))?;
            let rendered = toml::to_string_pretty(&config).context("rendering configuration")?;
            println!("# {}", path.display());
            println!();
            print!("{rendered}");
        }

        ConfigAction::Path => {
            println!("{}", path.display());
        }

        ConfigAction::Reset => {
            Config::default()
                .save_to(&path)
                .with_context(|| format!("writing {}", path.display()))?;
            println!("Configuration reset to defaults.");
        }
    }

    Ok(())
}
