//! Configuration management commands.

use std::path::Path;

use anyhow::bail;

use chatvault_core::{Config, Error};

use crate::ConfigAction;

pub fn handle(action: ConfigAction, project_dir: &Path) -> anyhow::Result<()> {
    let config =
        Config::load(project_dir).map_err(|e| Error::InvalidConfiguration(e.to_string()))?;

    match action {
        ConfigAction::Show => {
            println!(
                "# Sources: defaults, {}, {}, CHATVAULT_* env",
                Config::config_dir().join("config.toml").display(),
                project_dir.join(".chatvault/config.toml").display()
            );
            println!("# Database: {}", config.database_path().display());
            println!();
            print!("{}", config.to_toml()?);
        }
        ConfigAction::Validate => {
            let result = config.validate();

            for warning in result.warnings() {
                println!("warning: {}: {}", warning.field, warning.message);
            }
            let errors = result.errors();
            for error in &errors {
                println!("error: {}: {}", error.field, error.message);
            }

            if !errors.is_empty() {
                bail!("configuration has {} error(s)", errors.len());
            }
            println!("Configuration is valid");
        }
    }
    Ok(())
}
