use chrono::Local;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::config::{resolve_path, Config};
use crate::error::{ExpError, Result};
use crate::fingerprint::hash_config;

pub const EXPERIMENT_PREFIX: &str = "exp_";
pub const CONFIG_PREFIX: &str = "configs_";
pub const MODEL_DIR: &str = "model";
pub const DISPATCH_DIR: &str = "hydra";

/// Zero-padded and fixed width, so lexical order is chronological order.
const TIMESTAMP_FORMAT: &str = "%Y%m%d-%H%M%S-%6f";

pub fn timestamp() -> String {
    Local::now().format(TIMESTAMP_FORMAT).to_string()
}

/// Maps configurations to experiment directories under one save root.
///
/// ```text
/// <save_root>/exp_<fingerprint>/configs_<timestamp>.yaml
///                              /model/
///                              /model.md5
/// <save_root>/hydra/<timestamp>/
/// ```
///
/// Directories are created lazily and never overwritten.
#[derive(Debug, Clone)]
pub struct ExperimentLayout {
    save_path: PathBuf,
    exclude_keys: Vec<String>,
}

impl ExperimentLayout {
    pub fn new(save_path: &str, exclude_keys: Vec<String>) -> Result<Self> {
        let save_path = resolve_path(save_path)?;
        if save_path.is_file() {
            return Err(ExpError::configuration(format!(
                "save_path='{}' must be a folder",
                save_path.display()
            )));
        }
        fs::create_dir_all(&save_path)?;
        Ok(Self {
            save_path,
            exclude_keys,
        })
    }

    pub fn save_path(&self) -> &Path {
        &self.save_path
    }

    pub fn exclude_keys(&self) -> &[String] {
        &self.exclude_keys
    }

    pub fn fingerprint(&self, config: &Config) -> String {
        hash_config(config, &self.exclude_keys)
    }

    /// `exp_<fingerprint>`, created if absent.
    pub fn output_path(&self, config: &Config) -> Result<PathBuf> {
        let path = self
            .save_path
            .join(format!("{EXPERIMENT_PREFIX}{}", self.fingerprint(config)));
        fs::create_dir_all(&path)?;
        Ok(path)
    }

    pub fn model_path(&self, config: &Config) -> Result<PathBuf> {
        Ok(self.output_path(config)?.join(MODEL_DIR))
    }

    pub fn config_path(&self, config: &Config, timestamped: bool) -> Result<PathBuf> {
        let output = self.output_path(config)?;
        let name = if timestamped {
            format!("{CONFIG_PREFIX}{}.yaml", timestamp())
        } else {
            "configs.yaml".to_string()
        };
        Ok(output.join(name))
    }

    pub fn hydra_path(&self) -> Result<PathBuf> {
        let path = self.save_path.join(DISPATCH_DIR);
        fs::create_dir_all(&path)?;
        Ok(path)
    }

    /// All `exp_*` directories, sorted by name.
    pub fn experiment_dirs(&self) -> Result<Vec<PathBuf>> {
        let mut dirs = Vec::new();
        for entry in fs::read_dir(&self.save_path)? {
            let entry = entry?;
            let name = entry.file_name();
            if entry.file_type()?.is_dir()
                && name.to_string_lossy().starts_with(EXPERIMENT_PREFIX)
            {
                dirs.push(entry.path());
            }
        }
        dirs.sort();
        Ok(dirs)
    }

    /// Remove everything under the save root once `confirm` agrees.
    ///
    /// Returns the removed paths; nothing is touched when `confirm` declines.
    pub fn clear_all<F>(&self, confirm: F) -> Result<Vec<PathBuf>>
    where
        F: FnOnce(&Path) -> bool,
    {
        if !confirm(&self.save_path) {
            return Ok(Vec::new());
        }
        let mut removed = Vec::new();
        for entry in fs::read_dir(&self.save_path)? {
            let path = entry?.path();
            if path.is_dir() {
                fs::remove_dir_all(&path)?;
            } else {
                fs::remove_file(&path)?;
            }
            info!("Remove: {}", path.display());
            removed.push(path);
        }
        Ok(removed)
    }
}

/// Newest `configs_<timestamp>.yaml` inside an experiment directory.
pub fn latest_config(exp_dir: &Path) -> Result<Option<PathBuf>> {
    let mut snapshots: Vec<PathBuf> = fs::read_dir(exp_dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.file_name()
                .map(|n| n.to_string_lossy())
                .is_some_and(|n| n.starts_with(CONFIG_PREFIX) && n.ends_with(".yaml"))
        })
        .collect();
    snapshots.sort();
    Ok(snapshots.pop())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn layout(tmp: &TempDir) -> ExperimentLayout {
        ExperimentLayout::new(
            tmp.path().join("runs").to_str().unwrap(),
            vec!["seed".to_string()],
        )
        .unwrap()
    }

    #[test]
    fn output_path_is_keyed_by_fingerprint() {
        let tmp = TempDir::new().unwrap();
        let layout = layout(&tmp);
        let a = Config::new(json!({"lr": 0.1, "seed": 1}));
        let b = Config::new(json!({"lr": 0.1, "seed": 2}));
        let pa = layout.output_path(&a).unwrap();
        assert!(pa.is_dir());
        assert_eq!(pa, layout.output_path(&b).unwrap());
        let name = pa.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("exp_"));
        assert_eq!(name.len(), 4 + 8);
        assert_eq!(layout.model_path(&a).unwrap(), pa.join("model"));
    }

    #[test]
    fn save_path_must_not_be_a_file() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("occupied");
        fs::write(&file, b"x").unwrap();
        let err = ExperimentLayout::new(file.to_str().unwrap(), vec![]).unwrap_err();
        assert!(matches!(err, ExpError::Configuration(_)));
    }

    #[test]
    fn latest_config_picks_newest_snapshot() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("configs_20240101-000000-000000.yaml"), "a: 1").unwrap();
        fs::write(tmp.path().join("configs_20250101-000000-000000.yaml"), "a: 2").unwrap();
        fs::write(tmp.path().join("configs.yaml"), "a: 3").unwrap();
        let latest = latest_config(tmp.path()).unwrap().unwrap();
        assert!(latest.ends_with("configs_20250101-000000-000000.yaml"));
    }

    #[test]
    fn clear_all_requires_confirmation() {
        let tmp = TempDir::new().unwrap();
        let layout = layout(&tmp);
        layout.output_path(&Config::new(json!({"a": 1}))).unwrap();

        assert!(layout.clear_all(|_| false).unwrap().is_empty());
        assert_eq!(layout.experiment_dirs().unwrap().len(), 1);

        let removed = layout.clear_all(|_| true).unwrap();
        assert_eq!(removed.len(), 1);
        assert!(layout.experiment_dirs().unwrap().is_empty());
    }

    #[test]
    fn timestamps_are_fixed_width() {
        assert_eq!(timestamp().len(), "20240101-000000-000000".len());
    }
}
