// Library exports for the binary and for experiments built on top of it

pub mod checkpoint;
pub mod config;
pub mod data;
pub mod error;
pub mod experiment;
pub mod fingerprint;
pub mod model;
pub mod training;

// Re-export commonly used types
pub use config::{Config, ExperimentSettings, TrainerSettings};
pub use error::{ExpError, Result};
pub use experiment::{ExperimentHooks, Experimenter};
pub use fingerprint::hash_config;
pub use training::{FitOptions, Trainer};
