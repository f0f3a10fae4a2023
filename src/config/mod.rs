mod overrides;
mod paths;

pub use overrides::{
    apply_overrides, is_multirun, load_configuration, overrides_from_map, parse_overrides,
    Override, OverrideSet,
};
pub use paths::resolve_path;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::path::Path;

use crate::error::{ExpError, Result};

/// An immutable-by-convention tree of scalars, mappings and sequences.
///
/// Mapping keys are kept sorted, so two equal trees always serialize to the
/// same bytes. In strict mode (the default) reading a key that is not in the
/// tree is an [`ExpError::UnknownKey`]; lenient configs report it as `None`.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    root: Value,
    strict: bool,
}

impl Config {
    pub fn new(root: Value) -> Self {
        Self { root, strict: true }
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let root: Value = serde_yaml::from_str(text)?;
        match root {
            Value::Object(_) => Ok(Self::new(root)),
            Value::Null => Ok(Self::new(Value::Object(Map::new()))),
            other => Err(ExpError::configuration(format!(
                "configuration root must be a mapping, got {other}"
            ))),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(ExpError::configuration(format!(
                "config file does not exist: {}",
                path.display()
            )));
        }
        let text = fs::read_to_string(path)?;
        Self::from_yaml_str(&text)
    }

    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn is_strict(&self) -> bool {
        self.strict
    }

    pub fn root(&self) -> &Value {
        &self.root
    }

    pub fn into_value(self) -> Value {
        self.root
    }

    /// Raw lookup of a dot-separated path; never fails.
    pub fn lookup(&self, path: &str) -> Option<&Value> {
        path.split('.')
            .try_fold(&self.root, |node, part| node.as_object()?.get(part))
    }

    pub fn contains(&self, path: &str) -> bool {
        self.lookup(path).is_some()
    }

    /// Deserialize the value at `path`, `Ok(None)` when absent in a lenient config.
    pub fn get_opt<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        match self.lookup(path) {
            Some(value) => Ok(Some(T::deserialize(value)?)),
            None if self.strict => Err(self.unknown_key(path)),
            None => Ok(None),
        }
    }

    /// Deserialize the value at `path`; a missing key is always an error.
    pub fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.get_opt(path)?.ok_or_else(|| self.unknown_key(path))
    }

    /// Deserialize an optional settings section, falling back to its defaults.
    pub fn section<T: DeserializeOwned + Default>(&self, key: &str) -> Result<T> {
        match self.lookup(key) {
            Some(value) => Ok(T::deserialize(value)?),
            None => Ok(T::default()),
        }
    }

    /// Set the value at `path`, creating intermediate mappings as needed.
    pub fn set(&mut self, path: &str, value: Value) -> Result<()> {
        let mut parts = path.split('.').peekable();
        let mut node = &mut self.root;
        while let Some(part) = parts.next() {
            let map = node.as_object_mut().ok_or_else(|| {
                ExpError::configuration(format!(
                    "cannot set '{path}': '{part}' is below a non-mapping value"
                ))
            })?;
            if parts.peek().is_none() {
                map.insert(part.to_string(), value);
                return Ok(());
            }
            node = map
                .entry(part.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
        }
        Err(ExpError::configuration("empty configuration key"))
    }

    /// Every key of the tree, dot-joined, including intermediate mappings.
    pub fn all_keys(&self) -> BTreeSet<String> {
        let mut keys = BTreeSet::new();
        collect_keys(&self.root, "", &mut keys);
        keys
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(&self.root)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        fs::write(path, self.to_yaml()?)?;
        Ok(())
    }

    fn unknown_key(&self, path: &str) -> ExpError {
        ExpError::UnknownKey {
            key: path.to_string(),
            valid: self.all_keys().into_iter().collect(),
        }
    }
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.root)
    }
}

fn collect_keys(node: &Value, base: &str, keys: &mut BTreeSet<String>) {
    if let Value::Object(map) = node {
        for (key, value) in map {
            let full = if base.is_empty() {
                key.clone()
            } else {
                format!("{base}.{key}")
            };
            collect_keys(value, &full, keys);
            keys.insert(full);
        }
    }
}

/// `trainer.*` section of a configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrainerSettings {
    #[serde(default = "default_valid_freq")]
    pub valid_freq: u64,
    #[serde(default)]
    pub valid_interval: f64,
    #[serde(default = "default_logging_interval")]
    pub logging_interval: f64,
    #[serde(default = "default_max_iter")]
    pub max_iter: i64,
    #[serde(default = "default_true")]
    pub terminate_on_nan: bool,
    #[serde(default = "default_true")]
    pub compile_graph: bool,
    #[serde(default)]
    pub log_tag: String,
}

impl Default for TrainerSettings {
    fn default() -> Self {
        Self {
            valid_freq: default_valid_freq(),
            valid_interval: 0.0,
            logging_interval: default_logging_interval(),
            max_iter: default_max_iter(),
            terminate_on_nan: true,
            compile_graph: true,
            log_tag: String::new(),
        }
    }
}

/// Where and how experiments are stored and dispatched.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExperimentSettings {
    pub save_path: String,
    #[serde(default = "default_ncpu")]
    pub ncpu: usize,
    #[serde(default)]
    pub exclude_keys: Vec<String>,
    #[serde(default = "default_true")]
    pub consistent_model: bool,
}

impl ExperimentSettings {
    pub fn new(save_path: impl Into<String>) -> Self {
        Self {
            save_path: save_path.into(),
            ncpu: default_ncpu(),
            exclude_keys: Vec::new(),
            consistent_model: true,
        }
    }

    pub fn with_exclude_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude_keys = keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_ncpu(mut self, ncpu: usize) -> Self {
        self.ncpu = ncpu;
        self
    }

    pub fn with_consistent_model(mut self, consistent: bool) -> Self {
        self.consistent_model = consistent;
        self
    }
}

fn default_valid_freq() -> u64 {
    1
}

fn default_logging_interval() -> f64 {
    3.0
}

fn default_max_iter() -> i64 {
    -1
}

fn default_ncpu() -> usize {
    1
}

fn default_true() -> bool {
    true
}
