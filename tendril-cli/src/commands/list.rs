use colored::Colorize;
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, Cell, Color, Table};
use serde_json::json;
use tendril_core::{DiscoveredPlugin, PluginManifest, PluginState};

use super::{print_json, OutputFormat, PluginSource};

pub async fn cmd_list(source: &PluginSource, format: OutputFormat) -> anyhow::Result<()> {
    let found = source.load().await?;

    if format == OutputFormat::Json {
        let plugins: Vec<serde_json::Value> = found.iter().map(to_json).collect();
        return print_json(&json!(plugins));
    }

    println!("{}", "Plugins".cyan().bold());
    println!("{}", source.path().display().to_string().dimmed());
    println!();

    if found.is_empty() {
        println!("{}", "No plugins found.".yellow());
        println!();
        println!(
            "{}",
            format!(
                "Each plugin lives in its own directory with a {} file.",
                PluginManifest::FILENAME
            )
            .dimmed()
        );
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(vec![
            Cell::new("ID").fg(Color::White),
            Cell::new("Version").fg(Color::White),
            Cell::new("State").fg(Color::White),
            Cell::new("Dependencies").fg(Color::White),
            Cell::new("Hooks").fg(Color::White),
            Cell::new("Capabilities").fg(Color::White),
        ]);

    for plugin in &found {
        let state = plugin.state();
        let state_cell = match state {
            PluginState::Validated => Cell::new(state.to_string()).fg(Color::Green),
            _ => Cell::new(state.to_string()).fg(Color::Red),
        };

        match &plugin.manifest {
            Ok(m) => table.add_row(vec![
                Cell::new(&m.id),
                Cell::new(m.version.to_string()),
                state_cell,
                Cell::new(join_or_dash(m.dependencies.iter().map(|d| {
                    if d.version_range.is_any() {
                        format!("{} ({})", d.id, d.kind)
                    } else {
                        format!("{} {} ({})", d.id, d.version_range, d.kind)
                    }
                }))),
                Cell::new(join_or_dash(m.hooks.iter().map(|h| h.name.clone()))),
                Cell::new(join_or_dash(m.capabilities.iter().map(|c| c.to_string()))),
            ]),
            Err(e) => table.add_row(vec![
                Cell::new(dir_name(plugin)),
                Cell::new("-"),
                state_cell,
                Cell::new(e.error_code()).fg(Color::Red),
                Cell::new("-"),
                Cell::new("-"),
            ]),
        };
    }

    println!("{table}");

    let failed = found.iter().filter(|p| !p.is_valid()).count();
    println!();
    println!("  Total: {} plugin(s)", found.len());
    if failed > 0 {
        println!(
            "  {}",
            format!(
                "{} invalid; run 'tendril validate' for details",
                failed
            )
            .yellow()
        );
    }

    Ok(())
}

fn to_json(plugin: &DiscoveredPlugin) -> serde_json::Value {
    match &plugin.manifest {
        Ok(m) => json!({
            "id": m.id,
            "state": plugin.state().to_string(),
            "source_dir": plugin.source_dir.display().to_string(),
            "manifest": m.as_ref(),
        }),
        Err(e) => json!({
            "id": serde_json::Value::Null,
            "state": plugin.state().to_string(),
            "source_dir": plugin.source_dir.display().to_string(),
            "error_code": e.error_code(),
            "error": e.to_string(),
        }),
    }
}

fn dir_name(plugin: &DiscoveredPlugin) -> String {
    plugin
        .source_dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| plugin.source_dir.display().to_string())
}

fn join_or_dash(items: impl Iterator<Item = String>) -> String {
    let items: Vec<String> = items.collect();
    if items.is_empty() {
        "-".to_string()
    } else {
        items.join(", ")
    }
}
