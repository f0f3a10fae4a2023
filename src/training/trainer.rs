use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use std::cell::OnceCell;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use super::options::FitOptions;
use super::step::{average_outputs, Metrics, Optimize, StepContext, StepOutput};
use super::summary::{prefixed_scalars, read_summaries, scalars, SummaryHistory, SummaryWriter};
use crate::data::BatchSource;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    /// Budget reached or the training source ran dry.
    Normal,
    /// Loss became NaN or infinite with `terminate_on_nan` enabled.
    NonFinite,
    /// The stop handle was triggered.
    Signal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainerState {
    Idle,
    Running,
    Stopped(StopReason),
}

/// Cooperative cancellation token shared between the loop and its callers.
///
/// Observed at the top of every iteration and right after each
/// validation/callback tick. An in-flight `optimize` call is never interrupted.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// What a fit callback sees.
pub struct FitContext<'a> {
    pub n_iter: u64,
    /// Validation losses recorded by the running fit.
    pub valid_loss: &'a [f64],
    /// True only for the final call after the loop exits.
    pub finished: bool,
    pub stop: &'a StopHandle,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FitOutcome {
    pub reason: StopReason,
    /// Global iteration counter after the fit.
    pub n_iter: u64,
    /// Training iterations executed by this fit.
    pub iterations: u64,
    pub last_train: Option<StepOutput>,
    pub last_valid: Option<StepOutput>,
}

/// Durable part of a trainer; everything else is replayed from the event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainerSnapshot {
    pub logdir: PathBuf,
    pub n_iter: u64,
}

/// Generic fit-loop driver.
///
/// Drives an [`Optimize`] implementation over a [`BatchSource`], with
/// time-based logging, frequency/time-gated validation, NaN termination and a
/// callback after every validation tick. Metrics are appended to an event log
/// in `logdir`, which is the source of truth for the metric history.
pub struct Trainer {
    logdir: PathBuf,
    n_iter: u64,
    state: TrainerState,
    stop: StopHandle,
    valid_losses: Vec<f64>,
    history: OnceCell<SummaryHistory>,
}

impl Trainer {
    pub fn new(logdir: impl Into<PathBuf>) -> Self {
        Self {
            logdir: logdir.into(),
            n_iter: 0,
            state: TrainerState::Idle,
            stop: StopHandle::default(),
            valid_losses: Vec::new(),
            history: OnceCell::new(),
        }
    }

    pub fn from_snapshot(snapshot: TrainerSnapshot) -> Self {
        let mut trainer = Self::new(snapshot.logdir);
        trainer.n_iter = snapshot.n_iter;
        trainer
    }

    pub fn snapshot(&self) -> TrainerSnapshot {
        TrainerSnapshot {
            logdir: self.logdir.clone(),
            n_iter: self.n_iter,
        }
    }

    pub fn logdir(&self) -> &Path {
        &self.logdir
    }

    pub fn n_iter(&self) -> u64 {
        self.n_iter
    }

    pub fn state(&self) -> TrainerState {
        self.state
    }

    pub fn is_training(&self) -> bool {
        self.state == TrainerState::Running
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Validation losses of the running (or last) fit.
    pub fn current_valid_loss(&self) -> &[f64] {
        &self.valid_losses
    }

    pub fn train_loss(&self) -> Result<Vec<f64>> {
        Ok(scalars(self.history()?, "train/loss"))
    }

    pub fn valid_loss(&self) -> Result<Vec<f64>> {
        Ok(scalars(self.history()?, "valid/loss"))
    }

    pub fn train_metrics(&self) -> Result<BTreeMap<String, Vec<f64>>> {
        Ok(prefixed_scalars(self.history()?, "train/"))
    }

    pub fn valid_metrics(&self) -> Result<BTreeMap<String, Vec<f64>>> {
        Ok(prefixed_scalars(self.history()?, "valid/"))
    }

    fn history(&self) -> Result<&SummaryHistory> {
        if let Some(history) = self.history.get() {
            return Ok(history);
        }
        let history = read_summaries(&self.logdir)?;
        Ok(self.history.get_or_init(|| history))
    }

    /// Run the training loop until the budget is spent, the source is
    /// exhausted, the loss diverges or the stop handle fires.
    ///
    /// `callback` runs on every validation tick (even without a validation
    /// source) and once more with `finished = true` when the loop exits.
    /// Returned metrics are logged under `callback/`.
    pub fn fit<S, O, C>(
        &mut self,
        train: &mut S,
        mut valid: Option<&mut dyn BatchSource<Batch = S::Batch>>,
        optimize: &mut O,
        options: &FitOptions,
        mut callback: C,
    ) -> Result<FitOutcome>
    where
        S: BatchSource,
        O: Optimize<S::Batch>,
        C: FnMut(&mut O, &FitContext<'_>) -> Option<Metrics>,
    {
        let tag = if options.log_tag.is_empty() {
            String::new()
        } else {
            format!("{} ", options.log_tag)
        };
        let max_iter = options
            .max_iter
            .or_else(|| train.num_batches().map(|n| n as u64));
        let valid_freq = if options.valid_interval.is_zero() {
            options.valid_freq.max(1)
        } else {
            1
        };
        let mut writer = SummaryWriter::create(&self.logdir)?;
        if options.compile_graph {
            optimize.compile()?;
        }

        let progress = progress_bar(options.show_progress, max_iter)?;
        self.valid_losses.clear();
        self.stop.reset();
        self.state = TrainerState::Running;
        info!(
            "{tag}Training {} iterations, logdir {}",
            max_iter.map_or_else(|| "unbounded".to_string(), |n| n.to_string()),
            self.logdir.display()
        );

        let mut reason = StopReason::Normal;
        let mut iterations = 0u64;
        let mut last_train = None;
        let mut last_valid = None;
        let mut last_log: Option<Instant> = None;
        let mut last_valid_time = Instant::now();

        loop {
            if self.stop.is_stopped() {
                reason = StopReason::Signal;
                break;
            }
            if max_iter.is_some_and(|max| iterations >= max) {
                break;
            }
            let Some(batch) = train.next_batch()? else {
                break;
            };
            self.n_iter += 1;
            iterations += 1;
            self.history.take();
            progress.inc(1);

            let output = optimize.optimize(batch, StepContext::train(self.n_iter))?;
            if options.terminate_on_nan && !output.loss.is_finite() {
                warn!(
                    "{tag}Terminated on non-finite loss {} at iteration #{}",
                    output.loss, self.n_iter
                );
                for (name, value) in &output.metrics {
                    warn!("\t{name}: {value}");
                }
                progress.println(format!(
                    " *Terminated on NaN loss at iteration #{}",
                    self.n_iter
                ));
                reason = StopReason::NonFinite;
                last_train = Some(output);
                break;
            }

            if last_log.map_or(true, |t| t.elapsed() >= options.logging_interval) {
                writer.write_output("train/", self.n_iter, &output)?;
                writer.flush()?;
                let line = summary_line(&tag, self.n_iter, "Train", &output);
                debug!("{line}");
                progress.println(line);
                last_log = Some(Instant::now());
            }
            last_train = Some(output);

            if self.n_iter % valid_freq == 0
                && last_valid_time.elapsed() >= options.valid_interval
            {
                if let Some(source) = valid.as_deref_mut() {
                    if let Some(output) = validate(source, optimize)? {
                        self.valid_losses.push(output.loss);
                        writer.write_output("valid/", self.n_iter, &output)?;
                        writer.flush()?;
                        let line = summary_line(&tag, self.n_iter, "Valid", &output);
                        info!("{line}");
                        progress.println(line);
                        last_valid = Some(output);
                    }
                }
                let returned = callback(optimize, &self.fit_context(false));
                self.log_callback(&mut writer, &progress, &tag, returned)?;
                if self.stop.is_stopped() {
                    reason = StopReason::Signal;
                    break;
                }
                last_valid_time = Instant::now();
            }
        }

        let returned = callback(optimize, &self.fit_context(true));
        self.log_callback(&mut writer, &progress, &tag, returned)?;
        writer.flush()?;
        progress.finish_and_clear();
        self.history.take();
        self.state = TrainerState::Stopped(reason);
        info!(
            "{tag}Training stopped ({reason:?}) after {iterations} iterations, n_iter={}",
            self.n_iter
        );

        Ok(FitOutcome {
            reason,
            n_iter: self.n_iter,
            iterations,
            last_train,
            last_valid,
        })
    }

    fn fit_context(&self, finished: bool) -> FitContext<'_> {
        FitContext {
            n_iter: self.n_iter,
            valid_loss: &self.valid_losses,
            finished,
            stop: &self.stop,
        }
    }

    fn log_callback(
        &self,
        writer: &mut SummaryWriter,
        progress: &ProgressBar,
        tag: &str,
        returned: Option<Metrics>,
    ) -> Result<()> {
        let Some(metrics) = returned.filter(|m| !m.is_empty()) else {
            return Ok(());
        };
        let mut line = format!("{tag}#{} [Callback]", self.n_iter);
        for (name, value) in metrics {
            line.push_str(&format!(" {name}:{value}"));
            writer.write(&format!("callback/{name}"), self.n_iter, value)?;
        }
        writer.flush()?;
        info!("{line}");
        progress.println(line);
        Ok(())
    }
}

/// Consume the whole validation source once, averaging loss and metrics.
fn validate<B, O>(
    source: &mut dyn BatchSource<Batch = B>,
    optimize: &mut O,
) -> Result<Option<StepOutput>>
where
    O: Optimize<B>,
{
    source.reset()?;
    let mut outputs = Vec::new();
    let mut index = 0u64;
    while let Some(batch) = source.next_batch()? {
        outputs.push(optimize.optimize(batch, StepContext::valid(index))?);
        index += 1;
    }
    if outputs.is_empty() {
        warn!("Validation source produced no batches, skipped");
        return Ok(None);
    }
    Ok(Some(average_outputs(&outputs)))
}

fn progress_bar(show: bool, len: Option<u64>) -> Result<ProgressBar> {
    if !show {
        return Ok(ProgressBar::hidden());
    }
    let pb = match len {
        Some(n) => {
            let pb = ProgressBar::new(n);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos:>7}/{len:7} {msg}")
                    .map_err(anyhow::Error::from)?
                    .progress_chars("#>-"),
            );
            pb
        }
        None => ProgressBar::new_spinner(),
    };
    Ok(pb)
}

fn summary_line(tag: &str, n_iter: u64, phase: &str, output: &StepOutput) -> String {
    let mut line = format!("{tag}#{n_iter} [{phase}] loss:{:.4}", output.loss);
    for (name, value) in &output.metrics {
        line.push_str(&format!(" {name}:{value}"));
    }
    line
}
