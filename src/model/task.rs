use burn::nn::loss::{MseLoss, Reduction};
use burn::optim::adaptor::OptimizerAdaptor;
use burn::optim::{Adam, AdamConfig, GradientsParams, Optimizer};
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder, Recorder};
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::{ElementConversion, Tensor, TensorData};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::mem;
use std::path::Path;

use super::linear::{Regressor, RegressorConfig};
use crate::checkpoint::{module_file, Checkpointable, ModuleState};
use crate::data::VecSource;
use crate::error::{ExpError, Result};
use crate::training::{Optimize, StepContext, StepOutput, TrainerSnapshot};

/// `data.*` section: a noisy linear target `y = x.w + bias`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyntheticConfig {
    #[serde(default = "default_samples")]
    pub samples: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_valid_ratio")]
    pub valid_ratio: f64,
    #[serde(default = "default_noise")]
    pub noise: f64,
    #[serde(default = "default_epochs")]
    pub epochs: usize,
    #[serde(default)]
    pub seed: u64,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            samples: default_samples(),
            batch_size: default_batch_size(),
            valid_ratio: default_valid_ratio(),
            noise: default_noise(),
            epochs: default_epochs(),
            seed: 0,
        }
    }
}

fn default_samples() -> usize {
    512
}

fn default_batch_size() -> usize {
    32
}

fn default_valid_ratio() -> f64 {
    0.2
}

fn default_noise() -> f64 {
    0.05
}

fn default_epochs() -> usize {
    5
}

#[derive(Debug, Clone)]
pub struct RegressionBatch<B: Backend> {
    pub inputs: Tensor<B, 2>,
    pub targets: Tensor<B, 2>,
}

pub struct RegressionData<B: Backend> {
    pub train: VecSource<RegressionBatch<B>>,
    pub valid: VecSource<RegressionBatch<B>>,
    pub epochs: usize,
}

/// Deterministic for a given `seed`.
pub fn synthetic_data<B: Backend>(
    data: &SyntheticConfig,
    input_dim: usize,
    device: &B::Device,
) -> Result<RegressionData<B>> {
    if data.samples == 0 || data.batch_size == 0 {
        return Err(ExpError::configuration("data.samples and data.batch_size must be positive"));
    }
    if !(0.0..1.0).contains(&data.valid_ratio) {
        return Err(ExpError::configuration(format!(
            "data.valid_ratio must be in [0, 1), got {}",
            data.valid_ratio
        )));
    }
    let mut rng = StdRng::seed_from_u64(data.seed);
    let weights: Vec<f32> = (0..input_dim).map(|_| rng.gen_range(-1.0..1.0)).collect();
    let bias = 0.5f32;
    let noise = data.noise as f32;

    let mut inputs = Vec::with_capacity(data.samples * input_dim);
    let mut targets = Vec::with_capacity(data.samples);
    for _ in 0..data.samples {
        let x: Vec<f32> = (0..input_dim).map(|_| rng.gen_range(-1.0..1.0)).collect();
        let y = x.iter().zip(&weights).map(|(a, b)| a * b).sum::<f32>()
            + bias
            + noise * rng.gen_range(-1.0f32..1.0);
        inputs.extend(x);
        targets.push(y);
    }

    let n_valid = ((data.samples as f64) * data.valid_ratio).round() as usize;
    let n_train = data.samples - n_valid;
    let batches = |from: usize, to: usize| -> Vec<RegressionBatch<B>> {
        (from..to)
            .step_by(data.batch_size)
            .map(|start| {
                let end = (start + data.batch_size).min(to);
                let rows = end - start;
                RegressionBatch {
                    inputs: Tensor::from_data(
                        TensorData::new(inputs[start * input_dim..end * input_dim].to_vec(), [rows, input_dim]),
                        device,
                    ),
                    targets: Tensor::from_data(
                        TensorData::new(targets[start..end].to_vec(), [rows, 1]),
                        device,
                    ),
                }
            })
            .collect()
    };

    Ok(RegressionData {
        train: VecSource::new(batches(0, n_train)),
        valid: VecSource::new(batches(n_train, data.samples)),
        epochs: data.epochs.max(1),
    })
}

type AdamAdaptor<B> = OptimizerAdaptor<Adam, Regressor<B>, B>;

/// Adam moments, persisted with the same recorder as the weights.
#[derive(Clone)]
pub struct AdamState<B: AutodiffBackend> {
    optim: AdamAdaptor<B>,
    device: B::Device,
}

impl<B: AutodiffBackend> AdamState<B> {
    pub fn new(device: B::Device) -> Self {
        Self {
            optim: AdamConfig::new().init::<B, Regressor<B>>(),
            device,
        }
    }
}

impl<B: AutodiffBackend> Checkpointable for AdamState<B> {
    fn save_to(&self, path: &Path) -> Result<()> {
        let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
        Recorder::<B>::record(&recorder, self.optim.to_record(), module_file(path))
            .map_err(|e| ExpError::checkpoint(format!("failed to save optimizer state: {e:?}")))?;
        Ok(())
    }

    fn load_from(&mut self, path: &Path) -> Result<()> {
        let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
        let record = Recorder::<B>::load(&recorder, module_file(path), &self.device)
            .map_err(|e| ExpError::checkpoint(format!("failed to load optimizer state: {e:?}")))?;
        let optim = mem::replace(&mut self.optim, AdamConfig::new().init::<B, Regressor<B>>());
        self.optim = optim.load_record(record);
        Ok(())
    }
}

/// Model, optimizer and the trainer state they were last saved with.
pub struct RegressionTask<B: AutodiffBackend> {
    pub model: ModuleState<B, Regressor<B>>,
    pub optimizer: AdamState<B>,
    pub learning_rate: f64,
    pub trainer: Option<TrainerSnapshot>,
    loss: MseLoss,
}

impl<B: AutodiffBackend> RegressionTask<B> {
    pub fn new(config: &RegressorConfig, device: &B::Device) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            model: ModuleState::new(Regressor::new(config, device), device.clone()),
            optimizer: AdamState::new(device.clone()),
            learning_rate: config.learning_rate,
            trainer: None,
            loss: MseLoss::new(),
        })
    }

    /// Weights and optimizer moments as of now.
    pub fn state(&self) -> TaskState<B> {
        TaskState {
            model: self.model.module.clone(),
            optimizer: self.optimizer.clone(),
        }
    }

    pub fn load_state(&mut self, state: TaskState<B>) {
        self.model.module = state.model;
        self.optimizer = state.optimizer;
    }
}

/// Weights and Adam moments taken at the same iteration.
#[derive(Clone)]
pub struct TaskState<B: AutodiffBackend> {
    model: Regressor<B>,
    optimizer: AdamState<B>,
}

impl<B: AutodiffBackend> Optimize<RegressionBatch<B>> for RegressionTask<B> {
    fn optimize(&mut self, batch: RegressionBatch<B>, ctx: StepContext) -> Result<StepOutput> {
        let predictions = self.model.module.forward(batch.inputs);
        let loss = self
            .loss
            .forward(predictions.clone(), batch.targets.clone(), Reduction::Mean);
        let mae: f64 = (predictions - batch.targets)
            .abs()
            .mean()
            .into_scalar()
            .elem();
        let loss_value: f64 = loss.clone().into_scalar().elem();

        if ctx.training() {
            let grads = GradientsParams::from_grads(loss.backward(), &self.model.module);
            self.model.module = self
                .optimizer
                .optim
                .step(self.learning_rate, self.model.module.clone(), grads);
        }
        Ok(StepOutput::new(loss_value).with_metric("mae", mae))
    }
}
