pub mod config;
pub mod hooks;
pub mod list;
pub mod order;
pub mod validate;

pub use config::cmd_config;
pub use hooks::cmd_hooks;
pub use list::cmd_list;
pub use order::cmd_order;
pub use validate::cmd_validate;

use anyhow::{bail, Context};
use clap::ValueEnum;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tendril_core::{DiscoveredPlugin, PluginDiscovery, PluginManifest, TendrilConfig};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputFormat::Text => write!(f, "text"),
            OutputFormat::Json => write!(f, "json"),
        }
    }
}

/// Where a command reads manifests from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PluginSource {
    /// A single manifest file.
    File(PathBuf),
    /// A single plugin directory holding a manifest.
    Plugin(PathBuf),
    /// A plugins directory with one subdirectory per plugin.
    Dir(PathBuf),
}

impl PluginSource {
    /// Interpret a path argument, falling back to the configured plugins dir.
    pub fn from_arg(path: Option<PathBuf>, config: &TendrilConfig) -> Self {
        let path = path.unwrap_or_else(|| config.plugins_dir());
        if path.is_file() {
            PluginSource::File(path)
        } else if PluginDiscovery::manifest_path(&path).is_some() {
            PluginSource::Plugin(path)
        } else {
            PluginSource::Dir(path)
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            PluginSource::File(p) | PluginSource::Plugin(p) | PluginSource::Dir(p) => p,
        }
    }

    pub async fn load(&self) -> anyhow::Result<Vec<DiscoveredPlugin>> {
        match self {
            PluginSource::File(file) => {
                let source_dir = file
                    .parent()
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|| PathBuf::from("."));
                Ok(vec![load_one(source_dir, file.clone()).await])
            }
            PluginSource::Plugin(dir) => {
                let manifest_path = PluginDiscovery::manifest_path(dir)
                    .with_context(|| format!("no manifest found in {}", dir.display()))?;
                Ok(vec![load_one(dir.clone(), manifest_path).await])
            }
            PluginSource::Dir(dir) => {
                if !dir.is_dir() {
                    bail!("plugins directory {} does not exist", dir.display());
                }
                Ok(PluginDiscovery::new(dir).discover().await?)
            }
        }
    }
}

async fn load_one(source_dir: PathBuf, manifest_path: PathBuf) -> DiscoveredPlugin {
    let manifest = PluginManifest::load_from_file(&manifest_path)
        .await
        .map(Arc::new);
    DiscoveredPlugin {
        source_dir,
        manifest_path,
        manifest,
    }
}

/// Valid manifests, first one wins when two directories declare the same id.
pub fn valid_manifests(found: &[DiscoveredPlugin]) -> Vec<Arc<PluginManifest>> {
    let mut by_id: BTreeMap<String, Arc<PluginManifest>> = BTreeMap::new();
    for plugin in found {
        let Ok(manifest) = &plugin.manifest else {
            continue;
        };
        if by_id.contains_key(&manifest.id) {
            warn!(
                plugin_id = %manifest.id,
                path = ?plugin.manifest_path,
                "Duplicate plugin id, ignoring"
            );
            continue;
        }
        by_id.insert(manifest.id.clone(), manifest.clone());
    }
    by_id.into_values().collect()
}

pub fn print_json(value: &serde_json::Value) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
