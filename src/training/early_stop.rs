//! Early stopping on the generalization loss, after Prechelt (1998),
//! "Early Stopping | but when?".

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EarlySignal {
    /// Latest loss is the best so far, checkpoint it.
    Best,
    /// Generalization loss relative to progression passed the threshold.
    Terminate,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EarlyStopConfig {
    /// Stop once `generalization / progression >= -threshold`.
    pub threshold: f64,
    /// Look-back window for the progression term; `< 2` disables it.
    pub progress_length: usize,
    /// Never judge before this many losses have been recorded.
    pub min_epoch: usize,
}

impl Default for EarlyStopConfig {
    fn default() -> Self {
        Self {
            threshold: 0.001,
            progress_length: 0,
            min_epoch: 0,
        }
    }
}

/// Decide from a loss history (smaller is better).
///
/// * fewer than `max(2, min_epoch)` losses: `Some(Best)`
/// * `GL = loss[-1] / min(loss[..-1]) - 1`
/// * `PG = 10 * (mean(window) / min(window) - 1)` over the last
///   `progress_length` losses, or `1` without a window
/// * `GL / PG >= -threshold`: `Some(Terminate)`, else `GL < 0`: `Some(Best)`,
///   otherwise `None` (keep training).
///
/// A window longer than the history, or one whose minimum is not strictly
/// positive, falls back to `PG = 1` with a warning.
pub fn early_stop(losses: &[f64], config: &EarlyStopConfig) -> Option<EarlySignal> {
    if losses.len() < config.min_epoch.max(2) {
        debug!("[EarlyStop] Priming first {} warmup epochs.", config.min_epoch.max(2));
        return Some(EarlySignal::Best);
    }
    let (current, previous) = losses.split_last()?;
    let best = previous.iter().copied().fold(f64::INFINITY, f64::min);
    let generalization = current / best - 1.0;

    let progression = progression(losses, config.progress_length);
    let error = generalization / progression;
    let threshold = config.threshold.abs();

    if error >= -threshold {
        debug!(
            "[EarlyStop] improvement:{:.4} progression:{:.4} threshold:{:.4}",
            -generalization, progression, threshold
        );
        Some(EarlySignal::Terminate)
    } else if generalization < 0.0 {
        debug!(
            "[EarlyStop] Best model, improvement:{:.4}, threshold:{:.4}",
            best / current - 1.0,
            threshold
        );
        Some(EarlySignal::Best)
    } else {
        None
    }
}

fn progression(losses: &[f64], progress_length: usize) -> f64 {
    if progress_length <= 1 {
        return 1.0;
    }
    if progress_length > losses.len() {
        warn!(
            "[EarlyStop] progress_length={} exceeds {} recorded losses, progression disabled",
            progress_length,
            losses.len()
        );
        return 1.0;
    }
    let window = &losses[losses.len() - progress_length..];
    let min = window.iter().copied().fold(f64::INFINITY, f64::min);
    if min <= 0.0 || !min.is_finite() {
        warn!("[EarlyStop] window minimum {min} is not strictly positive, progression disabled");
        return 1.0;
    }
    let mean = window.iter().sum::<f64>() / window.len() as f64;
    let progression = 10.0 * (mean / min - 1.0);
    if progression == 0.0 {
        warn!("[EarlyStop] flat loss window, progression disabled");
        return 1.0;
    }
    progression
}
