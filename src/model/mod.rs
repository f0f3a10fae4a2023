mod experiment;
mod linear;
mod task;

pub use experiment::{CheckpointSettings, RegressionExperiment, RegressionReport};
pub use linear::{Regressor, RegressorConfig};
pub use task::{
    synthetic_data, AdamState, RegressionBatch, RegressionData, RegressionTask, SyntheticConfig, TaskState,
};
