mod early_stop;
mod options;
mod step;
mod summary;
mod trainer;

pub use early_stop::{early_stop, EarlySignal, EarlyStopConfig};
pub use options::FitOptions;
pub use step::{average_outputs, Metrics, MetricValue, Optimize, Phase, StepContext, StepOutput};
pub use summary::{
    prefixed_scalars, read_summaries, scalars, SummaryEvent, SummaryHistory, SummaryWriter,
};
pub use trainer::{
    FitContext, FitOutcome, StopHandle, StopReason, Trainer, TrainerSnapshot, TrainerState,
};
