use colored::Colorize;
use serde_json::json;
use tendril_core::{CliErrorDisplay, DependencyGraph};

use super::{print_json, valid_manifests, OutputFormat, PluginSource};

pub async fn cmd_order(
    source: &PluginSource,
    reverse: bool,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let found = source.load().await?;
    let invalid: Vec<String> = found
        .iter()
        .filter(|p| !p.is_valid())
        .map(|p| p.manifest_path.display().to_string())
        .collect();

    let graph = DependencyGraph::new(valid_manifests(&found));
    let resolution = graph.resolve();
    let order = if reverse {
        resolution.shutdown_order()
    } else {
        resolution.order.clone()
    };

    if format == OutputFormat::Json {
        let failures: serde_json::Map<String, serde_json::Value> = resolution
            .failures
            .iter()
            .map(|(id, err)| {
                (
                    id.clone(),
                    json!({ "error_code": err.error_code(), "message": err.to_string() }),
                )
            })
            .collect();
        return print_json(&json!({
            "order": order,
            "reverse": reverse,
            "failures": failures,
            "invalid_manifests": invalid,
        }));
    }

    let title = if reverse {
        "Shutdown Order"
    } else {
        "Load Order"
    };
    println!("{}", title.cyan().bold());
    println!("{}", "═".repeat(40).dimmed());

    if order.is_empty() {
        println!("  {}", "Nothing to load.".yellow());
    }
    for (position, id) in order.iter().enumerate() {
        let deps: Vec<String> = graph
            .dependencies_of(id)
            .into_iter()
            .filter(|dep| resolution.is_resolved(dep))
            .collect();
        if deps.is_empty() {
            println!("  {:>3}. {}", position + 1, id.bold());
        } else {
            println!(
                "  {:>3}. {} {}",
                position + 1,
                id.bold(),
                format!("after {}", deps.join(", ")).dimmed()
            );
        }
    }

    if !resolution.failures.is_empty() {
        println!();
        println!("{}", "Unresolvable".red().bold());
        for (id, err) in &resolution.failures {
            println!("  {} {}", "✗".red(), id.bold());
            for line in CliErrorDisplay::new(err).without_suggestion().to_string().lines() {
                println!("      {}", line.dimmed());
            }
        }
    }

    if !invalid.is_empty() {
        println!();
        println!(
            "  {}",
            format!(
                "{} invalid manifest(s) skipped; run 'tendril validate' for details",
                invalid.len()
            )
            .yellow()
        );
    }

    if resolution.failures.is_empty() {
        Ok(())
    } else {
        anyhow::bail!(
            "{} plugin(s) could not be resolved",
            resolution.failures.len()
        )
    }
}
