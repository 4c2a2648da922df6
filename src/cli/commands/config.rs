//! Config command implementation.

use crate::cli::{ConfigAction, Output};
use crate::config::Settings;
use anyhow::Result;

/// Run the config command.
pub fn run_config(action: &ConfigAction, settings: &Settings, path: Option<&str>) -> Result<()> {
    match action {
        ConfigAction::Show => {
            let toml_str = toml::to_string_pretty(settings)
                .map_err(|e| anyhow::anyhow!("Failed to serialize config: {}", e))?;
            println!("{}", toml_str);
        }

        ConfigAction::Path => {
            let config_path = match path {
                Some(path) => std::path::PathBuf::from(path),
                None => Settings::default_config_path(),
            };
            println!("{}", config_path.display());
            if !config_path.exists() {
                Output::info("No config file yet; defaults and environment variables are in use.");
            }
        }
    }

    Ok(())
}
