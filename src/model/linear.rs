use burn::module::Module;
use burn::nn::{Linear, LinearConfig};
use burn::tensor::activation::relu;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use serde::{Deserialize, Serialize};

use crate::error::{ExpError, Result};

/// `model.*` section of the regression experiment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegressorConfig {
    #[serde(default = "default_input_dim")]
    pub input_dim: usize,
    #[serde(default = "default_hidden_dim")]
    pub hidden_dim: usize,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
}

impl Default for RegressorConfig {
    fn default() -> Self {
        Self {
            input_dim: default_input_dim(),
            hidden_dim: default_hidden_dim(),
            learning_rate: default_learning_rate(),
        }
    }
}

impl RegressorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.input_dim == 0 || self.hidden_dim == 0 {
            return Err(ExpError::configuration(
                "model.input_dim and model.hidden_dim must be positive",
            ));
        }
        if self.learning_rate.is_nan() || self.learning_rate <= 0.0 {
            return Err(ExpError::configuration(format!(
                "model.learning_rate must be positive, got {}",
                self.learning_rate
            )));
        }
        Ok(())
    }
}

fn default_input_dim() -> usize {
    4
}

fn default_hidden_dim() -> usize {
    16
}

fn default_learning_rate() -> f64 {
    1e-2
}

/// One hidden layer MLP with a scalar output.
#[derive(Module, Debug)]
pub struct Regressor<B: Backend> {
    hidden: Linear<B>,
    output: Linear<B>,
}

impl<B: Backend> Regressor<B> {
    pub fn new(config: &RegressorConfig, device: &B::Device) -> Self {
        Self {
            hidden: LinearConfig::new(config.input_dim, config.hidden_dim).init(device),
            output: LinearConfig::new(config.hidden_dim, 1).init(device),
        }
    }

    /// `[batch, input_dim] -> [batch, 1]`
    pub fn forward(&self, inputs: Tensor<B, 2>) -> Tensor<B, 2> {
        let hidden = relu(self.hidden.forward(inputs));
        self.output.forward(hidden)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    #[test]
    fn forward_shape() {
        let device = Default::default();
        let config = RegressorConfig::default();
        let model = Regressor::<NdArray<f32>>::new(&config, &device);
        let inputs = Tensor::<NdArray<f32>, 2>::zeros([3, config.input_dim], &device);
        assert_eq!(model.forward(inputs).dims(), [3, 1]);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = RegressorConfig {
            learning_rate: 0.0,
            ..RegressorConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
