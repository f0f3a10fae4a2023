use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ExpError>;

/// Errors raised while resolving, launching or training an experiment.
///
/// Configuration, corruption and restore-contract errors abort the job they
/// occur in. A non-finite loss is not an error: the fit loop reports it
/// through [`crate::training::StopReason::NonFinite`].
#[derive(Debug, Error)]
pub enum ExpError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("cannot find key='{key}' in default configs, possible keys are: {}", .valid.join(", "))]
    UnknownKey { key: String, valid: Vec<String> },

    #[error("environment variable error: {0}")]
    EnvVar(String),

    #[error("multiple values given for a single run (enable multirun): {}", .0.join(" "))]
    MultirunRequired(Vec<String>),

    #[error("MD5 of saved model at {path:?} mismatch (expected {expected}, found {actual}), probably files are corrupted")]
    Corruption {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("on_load_model must return the loaded model, got nothing for {0:?}")]
    RestoreContract(PathBuf),

    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("job #{index} panicked: {message}")]
    JobPanicked { index: usize, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("bincode error: {0}")]
    Bincode(#[from] bincode::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ExpError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn checkpoint(msg: impl Into<String>) -> Self {
        Self::Checkpoint(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Fatal errors abort the whole job and are never retried.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Configuration(_)
                | Self::UnknownKey { .. }
                | Self::EnvVar(_)
                | Self::MultirunRequired(_)
                | Self::Corruption { .. }
                | Self::RestoreContract(_)
        )
    }
}
