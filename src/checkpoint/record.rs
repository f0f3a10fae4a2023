use burn::module::Module;
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder};
use burn::tensor::backend::Backend;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{ExpError, Result};

/// State that can be written into, and read back from, a checkpoint slot.
///
/// `path` is a file stem inside the checkpoint directory; implementations
/// pick their own extension and must read back what they wrote.
pub trait Checkpointable {
    fn save_to(&self, path: &Path) -> Result<()>;
    fn load_from(&mut self, path: &Path) -> Result<()>;
}

/// Any serde value, persisted with bincode as `<stem>.bin`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SerdeState<T>(pub T);

impl<T> SerdeState<T> {
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T: Serialize + DeserializeOwned> Checkpointable for SerdeState<T> {
    fn save_to(&self, path: &Path) -> Result<()> {
        let file = File::create(path.with_extension("bin"))?;
        bincode::serialize_into(BufWriter::new(file), &self.0)?;
        Ok(())
    }

    fn load_from(&mut self, path: &Path) -> Result<()> {
        let file = File::open(path.with_extension("bin"))?;
        self.0 = bincode::deserialize_from(BufReader::new(file))?;
        Ok(())
    }
}

fn recorder() -> NamedMpkFileRecorder<FullPrecisionSettings> {
    NamedMpkFileRecorder::<FullPrecisionSettings>::new()
}

/// Path written by [`save_module`] for a stem.
pub fn module_file(path: &Path) -> PathBuf {
    path.with_extension("mpk")
}

/// Save burn module weights with the named MessagePack recorder.
pub fn save_module<B: Backend, M: Module<B>>(module: &M, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    module
        .clone()
        .save_file(module_file(path), &recorder())
        .map_err(|e| ExpError::checkpoint(format!("failed to save weights to {}: {e:?}", path.display())))?;
    debug!("Module weights saved to: {:?}", module_file(path));
    Ok(())
}

/// Load weights saved by [`save_module`] into `module`.
pub fn load_module<B: Backend, M: Module<B>>(module: M, path: &Path, device: &B::Device) -> Result<M> {
    let file = module_file(path);
    if !file.is_file() {
        return Err(ExpError::not_found(format!("module weights {}", file.display())));
    }
    module
        .load_file(file.clone(), &recorder(), device)
        .map_err(|e| ExpError::checkpoint(format!("failed to load weights from {}: {e:?}", file.display())))
}

/// A burn module together with the device its weights are loaded onto.
#[derive(Debug, Clone)]
pub struct ModuleState<B: Backend, M> {
    pub module: M,
    pub device: B::Device,
}

impl<B: Backend, M: Module<B>> ModuleState<B, M> {
    pub fn new(module: M, device: B::Device) -> Self {
        Self { module, device }
    }
}

impl<B: Backend, M: Module<B>> Checkpointable for ModuleState<B, M> {
    fn save_to(&self, path: &Path) -> Result<()> {
        save_module::<B, M>(&self.module, path)
    }

    fn load_from(&mut self, path: &Path) -> Result<()> {
        self.module = load_module::<B, M>(self.module.clone(), path, &self.device)?;
        Ok(())
    }
}
