use anyhow::{bail, Context, Result};
use std::path::Path;
use tendril_core::TendrilConfig;

/// Load the layered configuration, or a single file when `--config` is given.
/// Environment overrides apply either way.
pub fn load(path: Option<&Path>) -> Result<TendrilConfig> {
    match path {
        Some(path) => {
            if !path.is_file() {
                bail!("config file {} does not exist", path.display());
            }
            TendrilConfig::load_from_paths(vec![path.to_path_buf()])
                .with_context(|| format!("failed to load {}", path.display()))
        }
        None => TendrilConfig::load().context("failed to load configuration"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_explicit_file() {
        let err = load(Some(Path::new("/nonexistent/tendril.toml"))).unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn test_explicit_file_is_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tendril.toml");
        std::fs::write(&path, "[hooks]\nhistory_size = 7\n").unwrap();

        let config = load(Some(&path)).unwrap();
        assert_eq!(config.hooks.history_size, 7);
    }
}
