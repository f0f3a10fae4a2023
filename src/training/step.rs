use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Train,
    Valid,
}

/// What the trainer tells `optimize` about the current call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepContext {
    /// Global iteration counter for training, batch index for validation.
    pub iteration: u64,
    pub phase: Phase,
}

impl StepContext {
    pub fn train(iteration: u64) -> Self {
        Self {
            iteration,
            phase: Phase::Train,
        }
    }

    pub fn valid(iteration: u64) -> Self {
        Self {
            iteration,
            phase: Phase::Valid,
        }
    }

    pub fn training(&self) -> bool {
        self.phase == Phase::Train
    }
}

/// A logged metric: scalar, vector or text.
///
/// Non-finite numbers serialize as `"NaN"`, `"inf"` and `"-inf"` so that they
/// survive a JSON round trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricValue {
    Scalar(#[serde(with = "lossless")] f64),
    Array(#[serde(with = "lossless::seq")] Vec<f64>),
    Text(String),
}

mod lossless {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Serialize, Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Number(f64),
        Named(String),
    }

    fn to_repr(v: f64) -> Repr {
        if v.is_nan() {
            Repr::Named("NaN".to_string())
        } else if v.is_infinite() {
            Repr::Named(if v > 0.0 { "inf" } else { "-inf" }.to_string())
        } else {
            Repr::Number(v)
        }
    }

    fn from_repr<E: Error>(repr: Repr) -> Result<f64, E> {
        match repr {
            Repr::Number(v) => Ok(v),
            Repr::Named(name) => match name.as_str() {
                "NaN" => Ok(f64::NAN),
                "inf" => Ok(f64::INFINITY),
                "-inf" => Ok(f64::NEG_INFINITY),
                other => Err(E::custom(format!("invalid number '{other}'"))),
            },
        }
    }

    pub fn serialize<S: Serializer>(v: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        to_repr(*v).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        from_repr(Repr::deserialize(deserializer)?)
    }

    pub mod seq {
        use super::{from_repr, to_repr, Repr};
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(vs: &[f64], serializer: S) -> Result<S::Ok, S::Error> {
            serializer.collect_seq(vs.iter().map(|v| to_repr(*v)))
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<f64>, D::Error> {
            Vec::<Repr>::deserialize(deserializer)?
                .into_iter()
                .map(from_repr)
                .collect()
        }
    }
}

pub type Metrics = BTreeMap<String, MetricValue>;

impl MetricValue {
    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            Self::Scalar(v) => Some(*v),
            _ => None,
        }
    }
}

impl From<f64> for MetricValue {
    fn from(v: f64) -> Self {
        Self::Scalar(v)
    }
}

impl From<f32> for MetricValue {
    fn from(v: f32) -> Self {
        Self::Scalar(f64::from(v))
    }
}

impl From<Vec<f64>> for MetricValue {
    fn from(v: Vec<f64>) -> Self {
        Self::Array(v)
    }
}

impl From<String> for MetricValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<&str> for MetricValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scalar(v) => write!(f, "{v:.4}"),
            Self::Array(vs) => {
                let items: Vec<String> = vs.iter().map(|v| format!("{v:.4}")).collect();
                write!(f, "[{}]", items.join(", "))
            }
            Self::Text(s) => f.write_str(s),
        }
    }
}

/// Loss and named metrics produced by one `optimize` call.
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutput {
    pub loss: f64,
    pub metrics: Metrics,
}

impl StepOutput {
    pub fn new(loss: f64) -> Self {
        Self {
            loss,
            metrics: Metrics::new(),
        }
    }

    pub fn with_metric(mut self, name: impl Into<String>, value: impl Into<MetricValue>) -> Self {
        self.metrics.insert(name.into(), value.into());
        self
    }
}

/// The caller's optimization step.
///
/// Called with `Phase::Train` for every training batch and `Phase::Valid` for
/// every validation batch. Plain closures `FnMut(B, StepContext) -> Result<StepOutput>`
/// implement it.
pub trait Optimize<B> {
    fn optimize(&mut self, batch: B, ctx: StepContext) -> Result<StepOutput>;

    /// Build a reusable execution plan before the first step. Must not change
    /// what `optimize` returns.
    fn compile(&mut self) -> Result<()> {
        Ok(())
    }
}

impl<B, F> Optimize<B> for F
where
    F: FnMut(B, StepContext) -> Result<StepOutput>,
{
    fn optimize(&mut self, batch: B, ctx: StepContext) -> Result<StepOutput> {
        self(batch, ctx)
    }
}

/// Arithmetic mean of the loss and of every metric across validation batches.
///
/// Arrays are averaged element-wise; text keeps the last value seen.
pub fn average_outputs(outputs: &[StepOutput]) -> StepOutput {
    if outputs.is_empty() {
        return StepOutput::new(f64::NAN);
    }
    let n = outputs.len() as f64;
    let loss = outputs.iter().map(|o| o.loss).sum::<f64>() / n;

    let mut grouped: BTreeMap<&str, Vec<&MetricValue>> = BTreeMap::new();
    for output in outputs {
        for (name, value) in &output.metrics {
            grouped.entry(name.as_str()).or_default().push(value);
        }
    }

    let metrics = grouped
        .into_iter()
        .filter_map(|(name, values)| mean_metric(&values).map(|v| (name.to_string(), v)))
        .collect();
    StepOutput { loss, metrics }
}

fn mean_metric(values: &[&MetricValue]) -> Option<MetricValue> {
    let last = values.last()?;
    match last {
        MetricValue::Scalar(_) => {
            let scalars: Vec<f64> = values.iter().filter_map(|v| v.as_scalar()).collect();
            Some(MetricValue::Scalar(
                scalars.iter().sum::<f64>() / scalars.len() as f64,
            ))
        }
        MetricValue::Array(reference) => {
            let arrays: Vec<&Vec<f64>> = values
                .iter()
                .filter_map(|v| match v {
                    MetricValue::Array(a) if a.len() == reference.len() => Some(a),
                    _ => None,
                })
                .collect();
            let mut sum = vec![0.0; reference.len()];
            for array in &arrays {
                for (acc, v) in sum.iter_mut().zip(array.iter()) {
                    *acc += v;
                }
            }
            let count = arrays.len() as f64;
            Some(MetricValue::Array(sum.into_iter().map(|v| v / count).collect()))
        }
        MetricValue::Text(_) => Some((*last).clone()),
    }
}
