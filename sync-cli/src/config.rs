//! Configuration and file locations for sync-cli.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use sync_client::NodeConfig;

/// File name of the rejoin state inside the data directory.
pub const REJOIN_FILE: &str = "rejoin.json";

/// Load the node configuration, or the defaults when no file is given.
pub fn load(path: Option<&Path>) -> Result<NodeConfig> {
    match path {
        Some(path) => NodeConfig::from_file(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display())),
        None => Ok(NodeConfig::default()),
    }
}

/// Get the default data directory for sync-cli.
pub fn default_data_dir() -> Result<PathBuf> {
    let dirs = directories::ProjectDirs::from("org", "scoutsync", "sync-cli")
        .context("Could not determine home directory")?;
    Ok(dirs.data_dir().to_path_buf())
}

/// Where the rejoin state lives: the configured path, else the data directory.
pub fn rejoin_path(config: &NodeConfig, data_dir: &Path) -> PathBuf {
    config
        .rejoin
        .state_path
        .clone()
        .unwrap_or_else(|| data_dir.join(REJOIN_FILE))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_flag_means_defaults() {
        let config = load(None).unwrap();
        assert_eq!(config, NodeConfig::default());
    }

    #[test]
    fn file_overrides_selected_fields() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("node.toml");
        std::fs::write(&path, "[sync]\naccept_pushes = false\n").unwrap();

        let config = load(Some(&path)).unwrap();
        assert!(!config.sync.accept_pushes);
        assert!(config.sync.accept_requests);
    }

    #[test]
    fn unreadable_file_names_the_path() {
        let err = load(Some(Path::new("/nonexistent/node.toml"))).unwrap_err();
        assert!(format!("{:#}", err).contains("/nonexistent/node.toml"));
    }

    #[test]
    fn configured_rejoin_path_wins() {
        let mut config = NodeConfig::default();
        let data_dir = Path::new("/var/lib/scoutsync");
        assert_eq!(
            rejoin_path(&config, data_dir),
            data_dir.join(REJOIN_FILE)
        );

        config.rejoin.state_path = Some(PathBuf::from("/tmp/elsewhere.json"));
        assert_eq!(
            rejoin_path(&config, data_dir),
            PathBuf::from("/tmp/elsewhere.json")
        );
    }
}
