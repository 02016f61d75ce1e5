use colored::Colorize;
use serde_json::json;
use std::sync::Arc;
use tendril_core::{
    CapabilityGrants, CliErrorDisplay, DiscoveredPlugin, PluginManifest, TendrilConfig,
    TendrilError,
};

use super::{print_json, OutputFormat, PluginSource};

struct Checked<'a> {
    plugin: &'a DiscoveredPlugin,
    result: Result<Arc<PluginManifest>, TendrilError>,
}

fn check<'a>(plugin: &'a DiscoveredPlugin, grants: Option<&CapabilityGrants>) -> Checked<'a> {
    let result = plugin.manifest.clone().and_then(|manifest| {
        if let Some(grants) = grants {
            manifest.check_grants(grants)?;
        }
        Ok(manifest)
    });
    Checked { plugin, result }
}

pub async fn cmd_validate(
    source: &PluginSource,
    config: Option<&TendrilConfig>,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let found = source.load().await?;
    let grants = config
        .map(|c| CapabilityGrants::from_config(&c.grants))
        .transpose()?;

    let checked: Vec<Checked> = found.iter().map(|p| check(p, grants.as_ref())).collect();
    let invalid = checked.iter().filter(|c| c.result.is_err()).count();

    if format == OutputFormat::Json {
        let entries: Vec<serde_json::Value> = checked.iter().map(to_json).collect();
        print_json(&json!({
            "source": source.path().display().to_string(),
            "checked": checked.len(),
            "invalid": invalid,
            "results": entries,
        }))?;
    } else {
        print_text(source, &checked);
    }

    if invalid > 0 {
        anyhow::bail!(
            "{} of {} manifest(s) failed validation",
            invalid,
            checked.len()
        );
    }
    Ok(())
}

fn to_json(checked: &Checked) -> serde_json::Value {
    let path = checked.plugin.manifest_path.display().to_string();
    match &checked.result {
        Ok(manifest) => json!({
            "path": path,
            "valid": true,
            "id": manifest.id,
            "version": manifest.version.to_string(),
        }),
        Err(err) => {
            let violations = match err {
                TendrilError::ManifestInvalid { violations, .. } => violations
                    .iter()
                    .map(|v| json!({ "field": v.field, "message": v.message }))
                    .collect(),
                _ => Vec::new(),
            };
            json!({
                "path": path,
                "valid": false,
                "error_code": err.error_code(),
                "message": err.to_string(),
                "violations": violations,
            })
        }
    }
}

fn print_text(source: &PluginSource, checked: &[Checked]) {
    println!(
        "{} {}",
        "Validating".cyan().bold(),
        source.path().display().to_string().dimmed()
    );
    println!();

    if checked.is_empty() {
        println!("{}", "No plugin manifests found.".yellow());
        return;
    }

    for entry in checked {
        match &entry.result {
            Ok(manifest) => println!(
                "  {} {} {} {}",
                "✓".green().bold(),
                manifest.id.bold(),
                manifest.version.to_string().dimmed(),
                format!("({})", entry.plugin.manifest_path.display()).dimmed()
            ),
            Err(err) => {
                println!(
                    "  {} {}",
                    "✗".red().bold(),
                    entry.plugin.manifest_path.display().to_string().bold()
                );
                for line in CliErrorDisplay::new(err).to_string().lines() {
                    println!("    {}", line);
                }
            }
        }
    }

    let valid = checked.iter().filter(|c| c.result.is_ok()).count();
    println!();
    println!(
        "  {} valid, {} invalid",
        valid.to_string().green(),
        (checked.len() - valid).to_string().red()
    );
}
