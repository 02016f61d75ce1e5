use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::{TendrilError, TendrilResult};

use super::lifecycle::PluginState;
use super::manifest::PluginManifest;

/// Manifest filenames probed in each plugin directory, in order.
pub const MANIFEST_FILENAMES: [&str; 4] = [
    PluginManifest::FILENAME,
    "tendril-plugin.json",
    "tendril-plugin.yaml",
    "tendril-plugin.yml",
];

/// One plugin directory found on disk and the outcome of validating it.
#[derive(Debug, Clone)]
pub struct DiscoveredPlugin {
    pub source_dir: PathBuf,
    pub manifest_path: PathBuf,
    pub manifest: Result<Arc<PluginManifest>, TendrilError>,
}

impl DiscoveredPlugin {
    /// `Validated` when the manifest parsed cleanly, `Failed` otherwise.
    pub fn state(&self) -> PluginState {
        match self.manifest {
            Ok(_) => PluginState::Validated,
            Err(_) => PluginState::Failed,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.manifest.is_ok()
    }
}

pub struct PluginDiscovery {
    plugins_dir: PathBuf,
}

impl PluginDiscovery {
    pub fn new(plugins_dir: impl Into<PathBuf>) -> Self {
        Self {
            plugins_dir: plugins_dir.into(),
        }
    }

    pub fn plugins_dir(&self) -> &Path {
        &self.plugins_dir
    }

    pub async fn ensure_plugins_dir(&self) -> TendrilResult<()> {
        if !self.plugins_dir.exists() {
            tokio::fs::create_dir_all(&self.plugins_dir)
                .await
                .map_err(|e| {
                    TendrilError::Io(format!(
                        "Failed to create plugins directory {:?}: {}",
                        self.plugins_dir, e
                    ))
                })?;
            info!("Created plugins directory: {:?}", self.plugins_dir);
        }
        Ok(())
    }

    /// The manifest file inside `dir`, if any.
    pub fn manifest_path(dir: &Path) -> Option<PathBuf> {
        MANIFEST_FILENAMES
            .iter()
            .map(|name| dir.join(name))
            .find(|path| path.is_file())
    }

    /// Subdirectories that carry a manifest, sorted by path.
    pub async fn discover_dirs(&self) -> TendrilResult<Vec<PathBuf>> {
        self.ensure_plugins_dir().await?;

        let mut discovered = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.plugins_dir)
            .await
            .map_err(|e| TendrilError::Io(format!("Failed to read plugins directory: {}", e)))?;

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| TendrilError::Io(format!("Failed to read directory entry: {}", e)))?
        {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            if Self::manifest_path(&path).is_some() {
                discovered.push(path);
            } else {
                debug!("Skipping directory without manifest: {:?}", path);
            }
        }

        discovered.sort();
        info!("Discovered {} plugin directories", discovered.len());
        Ok(discovered)
    }

    pub async fn load_manifest(dir: &Path) -> TendrilResult<PluginManifest> {
        let path = Self::manifest_path(dir).ok_or_else(|| TendrilError::ManifestParse {
            origin: dir.display().to_string(),
            message: "no manifest file found".to_string(),
        })?;
        PluginManifest::load_from_file(&path).await
    }

    /// Scan the plugins directory and validate every manifest found.
    ///
    /// Invalid manifests are returned alongside valid ones so callers can
    /// report them; one bad plugin never hides the others.
    pub async fn discover(&self) -> TendrilResult<Vec<DiscoveredPlugin>> {
        let mut found = Vec::new();

        for dir in self.discover_dirs().await? {
            let Some(manifest_path) = Self::manifest_path(&dir) else {
                continue;
            };
            let manifest = PluginManifest::load_from_file(&manifest_path)
                .await
                .map(Arc::new);

            match &manifest {
                Ok(m) => debug!(plugin_id = %m.id, version = %m.version, "Validated manifest"),
                Err(e) => warn!(path = ?manifest_path, error_code = e.error_code(), "Invalid manifest: {}", e),
            }

            found.push(DiscoveredPlugin {
                source_dir: dir,
                manifest_path,
                manifest,
            });
        }

        Ok(found)
    }
}
