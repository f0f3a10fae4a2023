use chrono::Local;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{info, warn};

use super::record::Checkpointable;
use crate::error::{ExpError, Result};
use crate::training::TrainerSnapshot;

pub const DEFAULT_MAX_TO_KEEP: usize = 5;
const TRAINER_FILE: &str = "trainer.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointEntry {
    pub id: u64,
    /// Directory name relative to the manager root.
    pub name: String,
    pub saved_at: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct CheckpointIndex {
    max_to_keep: usize,
    next_id: u64,
    checkpoints: Vec<CheckpointEntry>,
}

/// Rotating checkpoints of one namespace under one directory.
///
/// ```text
/// <dir>/<namespace>.index.json
/// <dir>/<namespace>-ckpt-<id>/model<i>.*  optimizer<i>.*  trainer.json
/// ```
///
/// At most `max_to_keep` checkpoints are kept; the oldest is evicted first.
#[derive(Debug)]
pub struct CheckpointManager {
    dir: PathBuf,
    namespace: String,
    index: CheckpointIndex,
}

impl CheckpointManager {
    /// Open a lineage, picking up the on-disk index when there is one.
    pub fn open(dir: &Path, namespace: &str, max_to_keep: usize) -> Result<Self> {
        if namespace.is_empty() || namespace.contains(['/', '\\']) {
            return Err(ExpError::checkpoint(format!(
                "invalid checkpoint namespace '{namespace}'"
            )));
        }
        fs::create_dir_all(dir)?;
        let index_path = index_path(dir, namespace);
        let mut index = if index_path.is_file() {
            serde_json::from_str::<CheckpointIndex>(&fs::read_to_string(&index_path)?)?
        } else {
            CheckpointIndex::default()
        };
        if max_to_keep > 0 {
            index.max_to_keep = max_to_keep;
        } else if index.max_to_keep == 0 {
            index.max_to_keep = DEFAULT_MAX_TO_KEEP;
        }
        Ok(Self {
            dir: dir.to_path_buf(),
            namespace: namespace.to_string(),
            index,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn max_to_keep(&self) -> usize {
        self.index.max_to_keep
    }

    /// Change the retention; extra checkpoints are evicted on the next save.
    pub fn set_max_to_keep(&mut self, max_to_keep: usize) {
        if max_to_keep > 0 {
            self.index.max_to_keep = max_to_keep;
        }
    }

    pub fn entries(&self) -> &[CheckpointEntry] {
        &self.index.checkpoints
    }

    /// Checkpoint directories, oldest first.
    pub fn checkpoints(&self) -> Vec<PathBuf> {
        self.index
            .checkpoints
            .iter()
            .map(|entry| self.dir.join(&entry.name))
            .collect()
    }

    pub fn latest(&self) -> Option<PathBuf> {
        self.checkpoints().pop()
    }

    pub fn save(
        &mut self,
        models: &[&dyn Checkpointable],
        optimizers: &[&dyn Checkpointable],
        trainer: Option<&TrainerSnapshot>,
    ) -> Result<PathBuf> {
        let id = self.index.next_id;
        let name = format!("{}-ckpt-{id}", self.namespace);
        let path = self.dir.join(&name);
        if path.exists() {
            fs::remove_dir_all(&path)?;
        }
        fs::create_dir_all(&path)?;
        for (i, model) in models.iter().enumerate() {
            model.save_to(&path.join(format!("model{i}")))?;
        }
        for (i, optimizer) in optimizers.iter().enumerate() {
            optimizer.save_to(&path.join(format!("optimizer{i}")))?;
        }
        if let Some(trainer) = trainer {
            fs::write(path.join(TRAINER_FILE), serde_json::to_string_pretty(trainer)?)?;
        }

        self.index.next_id += 1;
        self.index.checkpoints.push(CheckpointEntry {
            id,
            name,
            saved_at: Local::now().to_rfc3339(),
        });
        while self.index.checkpoints.len() > self.index.max_to_keep {
            let evicted = self.index.checkpoints.remove(0);
            let evicted_path = self.dir.join(&evicted.name);
            if let Err(e) = fs::remove_dir_all(&evicted_path) {
                warn!("Failed to evict checkpoint {:?}: {e}", evicted_path);
            } else {
                info!("Evicted checkpoint: {:?}", evicted_path);
            }
        }
        self.write_index()?;
        info!("Checkpoint saved: {:?}", path);
        Ok(path)
    }

    /// Restore checkpoint `index` (negative counts back from the newest).
    pub fn restore(
        &self,
        index: isize,
        models: &mut [&mut dyn Checkpointable],
        optimizers: &mut [&mut dyn Checkpointable],
    ) -> Result<Option<TrainerSnapshot>> {
        let n = self.index.checkpoints.len() as isize;
        let position = if index < 0 { n + index } else { index };
        if position < 0 || position >= n {
            return Err(ExpError::not_found(format!(
                "checkpoint index {index} of namespace '{}' ({n} saved) in {}",
                self.namespace,
                self.dir.display()
            )));
        }
        let path = self.dir.join(&self.index.checkpoints[position as usize].name);
        for (i, model) in models.iter_mut().enumerate() {
            model.load_from(&path.join(format!("model{i}")))?;
        }
        for (i, optimizer) in optimizers.iter_mut().enumerate() {
            optimizer.load_from(&path.join(format!("optimizer{i}")))?;
        }
        let trainer_path = path.join(TRAINER_FILE);
        let trainer = if trainer_path.is_file() {
            Some(serde_json::from_str(&fs::read_to_string(&trainer_path)?)?)
        } else {
            None
        };
        info!("Checkpoint restored: {:?}", path);
        Ok(trainer)
    }

    fn write_index(&self) -> Result<()> {
        let path = index_path(&self.dir, &self.namespace);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(&self.index)?)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }
}

fn index_path(dir: &Path, namespace: &str) -> PathBuf {
    dir.join(format!("{namespace}.index.json"))
}

type ManagerKey = (PathBuf, String);

/// Lookup-or-create of checkpoint managers, one per `(dir, namespace)`.
///
/// Owned by whoever drives training; two fits in one process that share a
/// registry and a key share a lineage.
#[derive(Debug, Default)]
pub struct CheckpointRegistry {
    managers: Mutex<HashMap<ManagerKey, Arc<Mutex<CheckpointManager>>>>,
}

impl CheckpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn manager(
        &self,
        dir: &Path,
        namespace: &str,
        max_to_keep: usize,
    ) -> Result<Arc<Mutex<CheckpointManager>>> {
        let mut managers = self.managers.lock().unwrap_or_else(PoisonError::into_inner);
        let key = (dir.to_path_buf(), namespace.to_string());
        if let Some(manager) = managers.get(&key) {
            if max_to_keep > 0 {
                let mut cached = manager.lock().unwrap_or_else(PoisonError::into_inner);
                if cached.max_to_keep() != max_to_keep {
                    warn!(
                        "Checkpoint namespace '{namespace}' in {}: max_to_keep changed from {} to {max_to_keep}",
                        dir.display(),
                        cached.max_to_keep()
                    );
                    cached.set_max_to_keep(max_to_keep);
                }
            }
            return Ok(Arc::clone(manager));
        }
        let manager = Arc::new(Mutex::new(CheckpointManager::open(dir, namespace, max_to_keep)?));
        managers.insert(key, Arc::clone(&manager));
        Ok(manager)
    }

    pub fn len(&self) -> usize {
        self.managers.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Save into the `(dir, namespace)` lineage, creating it on first use.
pub fn save_checkpoint(
    registry: &CheckpointRegistry,
    dir: &Path,
    namespace: &str,
    max_to_keep: usize,
    models: &[&dyn Checkpointable],
    optimizers: &[&dyn Checkpointable],
    trainer: Option<&TrainerSnapshot>,
) -> Result<PathBuf> {
    let manager = registry.manager(dir, namespace, max_to_keep)?;
    let mut manager = manager.lock().unwrap_or_else(PoisonError::into_inner);
    manager.save(models, optimizers, trainer)
}

/// Restore checkpoint `index` of the `(dir, namespace)` lineage.
pub fn restore_checkpoint(
    registry: &CheckpointRegistry,
    dir: &Path,
    namespace: &str,
    index: isize,
    models: &mut [&mut dyn Checkpointable],
    optimizers: &mut [&mut dyn Checkpointable],
) -> Result<Option<TrainerSnapshot>> {
    if !index_path(dir, namespace).is_file() {
        return Err(ExpError::not_found(format!(
            "no checkpoint of namespace '{namespace}' in {}",
            dir.display()
        )));
    }
    let manager = registry.manager(dir, namespace, 0)?;
    let manager = manager.lock().unwrap_or_else(PoisonError::into_inner);
    manager.restore(index, models, optimizers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::SerdeState;
    use std::thread;
    use tempfile::TempDir;

    #[test]
    fn rotation_keeps_most_recent() {
        let tmp = TempDir::new().unwrap();
        let registry = CheckpointRegistry::new();
        for step in 0..6u32 {
            let weights = SerdeState(vec![step; 3]);
            save_checkpoint(&registry, tmp.path(), "vae", 5, &[&weights], &[], None).unwrap();
        }
        let manager = registry.manager(tmp.path(), "vae", 5).unwrap();
        let manager = manager.lock().unwrap();
        let ids: Vec<u64> = manager.entries().iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
        assert!(!tmp.path().join("vae-ckpt-0").exists());
        assert!(tmp.path().join("vae-ckpt-5").is_dir());

        let mut oldest = SerdeState(Vec::<u32>::new());
        manager.restore(0, &mut [&mut oldest], &mut []).unwrap();
        assert_eq!(oldest.0, vec![1, 1, 1]);
        let mut newest = SerdeState(Vec::<u32>::new());
        manager.restore(-1, &mut [&mut newest], &mut []).unwrap();
        assert_eq!(newest.0, vec![5, 5, 5]);
        assert!(manager.restore(5, &mut [&mut newest], &mut []).is_err());
    }

    #[test]
    fn namespaces_are_independent_lineages() {
        let tmp = TempDir::new().unwrap();
        let registry = CheckpointRegistry::new();
        let a = SerdeState(1u8);
        let b = SerdeState(2u8);
        save_checkpoint(&registry, tmp.path(), "encoder", 2, &[&a], &[], None).unwrap();
        save_checkpoint(&registry, tmp.path(), "decoder", 2, &[&b], &[], None).unwrap();
        save_checkpoint(&registry, tmp.path(), "encoder", 2, &[&a], &[], None).unwrap();
        assert_eq!(registry.len(), 2);

        let encoder = registry.manager(tmp.path(), "encoder", 2).unwrap();
        assert_eq!(encoder.lock().unwrap().entries().len(), 2);
        let decoder = registry.manager(tmp.path(), "decoder", 2).unwrap();
        assert_eq!(decoder.lock().unwrap().entries().len(), 1);
    }

    #[test]
    fn fresh_registry_restores_from_index() {
        let tmp = TempDir::new().unwrap();
        let trainer = TrainerSnapshot {
            logdir: tmp.path().join("logs"),
            n_iter: 42,
        };
        {
            let registry = CheckpointRegistry::new();
            let model = SerdeState(vec![0.25f32, 0.5]);
            let optimizer = SerdeState(3u64);
            save_checkpoint(
                &registry,
                tmp.path(),
                "model",
                3,
                &[&model],
                &[&optimizer],
                Some(&trainer),
            )
            .unwrap();
        }

        let registry = CheckpointRegistry::new();
        let mut model = SerdeState(Vec::<f32>::new());
        let mut optimizer = SerdeState(0u64);
        let restored = restore_checkpoint(
            &registry,
            tmp.path(),
            "model",
            -1,
            &mut [&mut model],
            &mut [&mut optimizer],
        )
        .unwrap();
        assert_eq!(restored, Some(trainer));
        assert_eq!(model.0, vec![0.25, 0.5]);
        assert_eq!(optimizer.0, 3);
        assert_eq!(registry.manager(tmp.path(), "model", 0).unwrap().lock().unwrap().max_to_keep(), 3);

        assert!(matches!(
            restore_checkpoint(&registry, tmp.path(), "other", -1, &mut [], &mut []),
            Err(ExpError::NotFound(_))
        ));
    }

    #[test]
    fn later_lookup_updates_retention() {
        let tmp = TempDir::new().unwrap();
        let registry = CheckpointRegistry::new();
        let weights = SerdeState(0u8);
        for _ in 0..4 {
            save_checkpoint(&registry, tmp.path(), "decoder", 5, &[&weights], &[], None).unwrap();
        }
        save_checkpoint(&registry, tmp.path(), "decoder", 2, &[&weights], &[], None).unwrap();

        let manager = registry.manager(tmp.path(), "decoder", 0).unwrap();
        let manager = manager.lock().unwrap();
        assert_eq!(manager.max_to_keep(), 2);
        let ids: Vec<u64> = manager.entries().iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![3, 4]);
        assert!(!tmp.path().join("decoder-ckpt-2").exists());
    }

    #[test]
    fn concurrent_lookups_share_one_manager() {
        let tmp = TempDir::new().unwrap();
        let registry = CheckpointRegistry::new();
        let managers: Vec<_> = thread::scope(|scope| {
            let handles: Vec<_> = (0..4)
                .map(|_| scope.spawn(|| registry.manager(tmp.path(), "shared", 5).unwrap()))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert_eq!(registry.len(), 1);
        assert!(managers.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    }
}
