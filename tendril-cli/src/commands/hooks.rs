use colored::Colorize;
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, Cell, Color, Table};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tendril_core::{DependencyGraph, PluginManifest};

use super::{print_json, valid_manifests, OutputFormat, PluginSource};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeclaredSubscriber {
    pub plugin_id: String,
    pub priority: i32,
    pub resolved: bool,
}

/// Hook name to its subscribers in dispatch order.
///
/// Plugins subscribe when they start, so ties on priority break by load
/// order. Plugins that cannot be resolved never start and sort last.
pub fn collect_hooks(
    manifests: &[Arc<PluginManifest>],
) -> BTreeMap<String, Vec<DeclaredSubscriber>> {
    let resolution = DependencyGraph::new(manifests.iter().cloned()).resolve();
    let mut hooks: BTreeMap<String, Vec<(usize, DeclaredSubscriber)>> = BTreeMap::new();

    for manifest in manifests {
        let position = resolution.position(&manifest.id);
        for hook in &manifest.hooks {
            hooks.entry(hook.name.clone()).or_default().push((
                position.unwrap_or(usize::MAX),
                DeclaredSubscriber {
                    plugin_id: manifest.id.clone(),
                    priority: hook.priority,
                    resolved: position.is_some(),
                },
            ));
        }
    }

    hooks
        .into_iter()
        .map(|(name, mut subscribers)| {
            subscribers.sort_by(|(pa, a), (pb, b)| {
                (!a.resolved, a.priority, *pa, &a.plugin_id)
                    .cmp(&(!b.resolved, b.priority, *pb, &b.plugin_id))
            });
            (name, subscribers.into_iter().map(|(_, s)| s).collect())
        })
        .collect()
}

pub async fn cmd_hooks(
    source: &PluginSource,
    name: Option<&str>,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let found = source.load().await?;
    let mut hooks = collect_hooks(&valid_manifests(&found));

    if let Some(name) = name {
        hooks.retain(|hook, _| hook == name);
        if hooks.is_empty() {
            anyhow::bail!("no plugin declares hook '{}'", name);
        }
    }

    if format == OutputFormat::Json {
        let output: serde_json::Map<String, serde_json::Value> = hooks
            .iter()
            .map(|(hook, subscribers)| {
                let subscribers: Vec<serde_json::Value> = subscribers
                    .iter()
                    .map(|s| {
                        json!({
                            "plugin_id": s.plugin_id,
                            "priority": s.priority,
                            "resolved": s.resolved,
                        })
                    })
                    .collect();
                (hook.clone(), json!(subscribers))
            })
            .collect();
        return print_json(&serde_json::Value::Object(output));
    }

    println!("{}", "Declared Hooks".cyan().bold());
    println!();

    if hooks.is_empty() {
        println!("{}", "No plugin declares any hooks.".yellow());
        return Ok(());
    }

    for (hook, subscribers) in &hooks {
        println!("  {} {}", "●".cyan(), hook.bold());

        let mut table = Table::new();
        table
            .load_preset(UTF8_FULL)
            .apply_modifier(UTF8_ROUND_CORNERS)
            .set_header(vec![
                Cell::new("#").fg(Color::White),
                Cell::new("Plugin").fg(Color::White),
                Cell::new("Priority").fg(Color::White),
                Cell::new("Resolvable").fg(Color::White),
            ]);

        for (index, subscriber) in subscribers.iter().enumerate() {
            let resolved_cell = if subscriber.resolved {
                Cell::new("Yes").fg(Color::Green)
            } else {
                Cell::new("No").fg(Color::Red)
            };
            table.add_row(vec![
                Cell::new(index + 1),
                Cell::new(&subscriber.plugin_id),
                Cell::new(subscriber.priority),
                resolved_cell,
            ]);
        }

        println!("{table}");
        println!();
    }

    let total: usize = hooks.values().map(Vec::len).sum();
    println!("  Total subscriptions: {}", total);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest(id: &str, body: &str) -> Arc<PluginManifest> {
        Arc::new(
            PluginManifest::parse(&format!(
                "id = \"{id}\"\nversion = \"1.0.0\"\nentry_point = \"{id}\"\n{body}"
            ))
            .unwrap(),
        )
    }

    #[test]
    fn test_priority_then_load_order() {
        let manifests = vec![
            manifest("zeta", "hooks = [\"on_save\"]\n"),
            manifest(
                "alpha",
                "hooks = [\"on_save\"]\ndependencies = [\"zeta\"]\n",
            ),
            manifest("mid", "hooks = [{ name = \"on_save\", priority = -1 }]\n"),
        ];

        let hooks = collect_hooks(&manifests);
        let order: Vec<&str> = hooks["on_save"]
            .iter()
            .map(|s| s.plugin_id.as_str())
            .collect();
        assert_eq!(order, vec!["mid", "zeta", "alpha"]);
    }

    #[test]
    fn test_unresolved_subscribers_sort_last() {
        let manifests = vec![
            manifest(
                "broken",
                "hooks = [{ name = \"on_save\", priority = -10 }]\ndependencies = [\"ghost\"]\n",
            ),
            manifest("fine", "hooks = [\"on_save\"]\n"),
        ];

        let hooks = collect_hooks(&manifests);
        let subscribers = &hooks["on_save"];
        assert_eq!(subscribers[0].plugin_id, "fine");
        assert!(!subscribers[1].resolved);
    }
}
