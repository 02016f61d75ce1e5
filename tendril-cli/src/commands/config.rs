use colored::Colorize;
use tendril_core::TendrilConfig;

use super::{print_json, OutputFormat};

pub fn cmd_config(config: &TendrilConfig, format: OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => print_json(&serde_json::to_value(config)?),
        OutputFormat::Text => {
            println!("{}", "# Effective configuration".dimmed());
            print!("{}", toml::to_string_pretty(config)?);
            Ok(())
        }
    }
}
