use burn::tensor::backend::AutodiffBackend;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

use super::linear::RegressorConfig;
use super::task::{synthetic_data, RegressionData, RegressionTask, SyntheticConfig, TaskState};
use crate::checkpoint::{restore_checkpoint, save_checkpoint, CheckpointRegistry, WeightCache};
use crate::config::Config;
use crate::data::Repeat;
use crate::error::Result;
use crate::experiment::ExperimentHooks;
use crate::training::{
    early_stop, EarlySignal, EarlyStopConfig, FitOptions, Metrics, MetricValue, StopReason, Trainer,
};

const NAMESPACE: &str = "regression";
const LOG_DIR: &str = "logs";

/// `checkpoint.*` section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CheckpointSettings {
    #[serde(default = "default_max_to_keep")]
    pub max_to_keep: usize,
}

impl Default for CheckpointSettings {
    fn default() -> Self {
        Self {
            max_to_keep: default_max_to_keep(),
        }
    }
}

fn default_max_to_keep() -> usize {
    3
}

#[derive(Debug, Clone, PartialEq)]
pub struct RegressionReport {
    pub reason: StopReason,
    pub n_iter: u64,
    pub best_valid_loss: Option<f64>,
    pub final_train_loss: Option<f64>,
}

/// Trains a small MLP on synthetic data, early-stopping on the validation
/// loss and rolling back to the best weights before the final checkpoint.
///
/// The rollback restores the Adam moments captured with those weights. The
/// saved trainer state keeps the last iteration count.
pub struct RegressionExperiment<B: AutodiffBackend> {
    device: B::Device,
    registry: CheckpointRegistry,
    best: WeightCache<TaskState<B>>,
    show_progress: bool,
}

impl<B: AutodiffBackend> RegressionExperiment<B> {
    pub fn new(device: B::Device) -> Self {
        Self {
            device,
            registry: CheckpointRegistry::new(),
            best: WeightCache::new(),
            show_progress: true,
        }
    }

    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }
}

impl<B: AutodiffBackend> ExperimentHooks for RegressionExperiment<B> {
    type Data = RegressionData<B>;
    type Model = RegressionTask<B>;
    type Output = RegressionReport;

    fn on_load_data(&self, config: &Config) -> Result<RegressionData<B>> {
        let data = config.section::<SyntheticConfig>("data")?;
        let model = config.section::<RegressorConfig>("model")?;
        synthetic_data(&data, model.input_dim, &self.device)
    }

    fn on_create_model(&self, config: &Config, _data: &RegressionData<B>) -> Result<RegressionTask<B>> {
        RegressionTask::new(&config.section::<RegressorConfig>("model")?, &self.device)
    }

    fn on_load_model(&self, config: &Config, path: &Path) -> Result<Option<RegressionTask<B>>> {
        let mut task = RegressionTask::new(&config.section::<RegressorConfig>("model")?, &self.device)?;
        task.trainer = restore_checkpoint(
            &self.registry,
            path,
            NAMESPACE,
            -1,
            &mut [&mut task.model],
            &mut [&mut task.optimizer],
        )?;
        Ok(Some(task))
    }

    fn on_train(
        &self,
        config: &Config,
        data: RegressionData<B>,
        mut task: RegressionTask<B>,
        model_path: &Path,
    ) -> Result<RegressionReport> {
        let options = FitOptions::from_config(config)?.with_progress(self.show_progress);
        let stopping = config.section::<EarlyStopConfig>("early_stop")?;
        let checkpoint = config.section::<CheckpointSettings>("checkpoint")?;

        let mut trainer = match task.trainer.take() {
            Some(snapshot) => Trainer::from_snapshot(snapshot),
            None => Trainer::new(model_path.with_file_name(LOG_DIR)),
        };
        let key = model_path.display().to_string();
        let RegressionData {
            train,
            mut valid,
            epochs,
        } = data;
        let mut train = Repeat::new(train, epochs);

        let outcome = trainer.fit(
            &mut train,
            Some(&mut valid),
            &mut task,
            &options,
            |task, ctx| {
                if ctx.finished || ctx.valid_loss.is_empty() {
                    return None;
                }
                let signal = early_stop(ctx.valid_loss, &stopping);
                match signal {
                    Some(EarlySignal::Best) => self.best.save_weights(&key, &task.state()),
                    Some(EarlySignal::Terminate) => ctx.stop.stop(),
                    None => {}
                }
                let mut metrics = Metrics::new();
                metrics.insert(
                    "early_stop".to_string(),
                    MetricValue::Text(format!("{signal:?}")),
                );
                Some(metrics)
            },
        )?;

        if let Some(best) = self.best.remove(&key) {
            info!("Rolling back to best weights");
            task.load_state(best);
        }
        save_checkpoint(
            &self.registry,
            model_path,
            NAMESPACE,
            checkpoint.max_to_keep,
            &[&task.model],
            &[&task.optimizer],
            Some(&trainer.snapshot()),
        )?;

        Ok(RegressionReport {
            reason: outcome.reason,
            n_iter: outcome.n_iter,
            best_valid_loss: trainer
                .current_valid_loss()
                .iter()
                .copied()
                .fold(None, |best: Option<f64>, v| Some(best.map_or(v, |b| b.min(v)))),
            final_train_loss: outcome.last_train.map(|o| o.loss),
        })
    }
}
