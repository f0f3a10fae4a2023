use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

use super::step::{MetricValue, StepOutput};
use crate::error::Result;

pub const EVENTS_PREFIX: &str = "events.out.tfevents";

/// One logged value, one JSON line in the event file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryEvent {
    pub wall_time: f64,
    pub step: u64,
    pub tag: String,
    pub value: MetricValue,
}

/// tag -> [(wall_time, step, value)], sorted by step.
pub type SummaryHistory = BTreeMap<String, Vec<(f64, u64, MetricValue)>>;

/// Append-only writer for `<logdir>/events.out.tfevents.<unix_secs>.<pid>`.
///
/// A log directory must be written by one trainer at a time.
pub struct SummaryWriter {
    path: PathBuf,
    out: BufWriter<File>,
}

impl SummaryWriter {
    pub fn create(logdir: &Path) -> Result<Self> {
        fs::create_dir_all(logdir)?;
        let name = format!(
            "{EVENTS_PREFIX}.{}.{}",
            Utc::now().timestamp(),
            std::process::id()
        );
        let path = logdir.join(name);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            out: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write(&mut self, tag: &str, step: u64, value: MetricValue) -> Result<()> {
        let event = SummaryEvent {
            wall_time: Utc::now().timestamp_micros() as f64 / 1e6,
            step,
            tag: tag.to_string(),
            value,
        };
        serde_json::to_writer(&mut self.out, &event)?;
        self.out.write_all(b"\n")?;
        Ok(())
    }

    /// Write `<prefix>loss` and `<prefix><metric>` for one step output.
    pub fn write_output(&mut self, prefix: &str, step: u64, output: &StepOutput) -> Result<()> {
        self.write(&format!("{prefix}loss"), step, MetricValue::Scalar(output.loss))?;
        for (name, value) in &output.metrics {
            self.write(&format!("{prefix}{name}"), step, value.clone())?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.out.flush()?;
        Ok(())
    }
}

/// Replay every event file in `logdir`.
///
/// Files are read oldest first; a malformed line (e.g. a write cut short by a
/// crash) is skipped with a warning.
pub fn read_summaries(logdir: &Path) -> Result<SummaryHistory> {
    let mut history = SummaryHistory::new();
    if !logdir.is_dir() {
        return Ok(history);
    }
    let mut files: Vec<(i64, PathBuf)> = Vec::new();
    for entry in fs::read_dir(logdir)? {
        let path = entry?.path();
        let Some(name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
            continue;
        };
        if !name.starts_with(EVENTS_PREFIX) {
            continue;
        }
        let stamp = name
            .split('.')
            .nth(3)
            .and_then(|s| s.parse::<i64>().ok())
            .unwrap_or_default();
        files.push((stamp, path));
    }
    files.sort();

    for (_, path) in files {
        let reader = BufReader::new(File::open(&path)?);
        for (lineno, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<SummaryEvent>(&line) {
                Ok(event) => history.entry(event.tag).or_default().push((
                    event.wall_time,
                    event.step,
                    event.value,
                )),
                Err(e) => warn!("Skip malformed event {}:{}: {e}", path.display(), lineno + 1),
            }
        }
    }
    for values in history.values_mut() {
        values.sort_by_key(|(_, step, _)| *step);
    }
    Ok(history)
}

/// Scalars of one tag, in step order.
pub fn scalars(history: &SummaryHistory, tag: &str) -> Vec<f64> {
    history
        .get(tag)
        .map(|values| values.iter().filter_map(|(_, _, v)| v.as_scalar()).collect())
        .unwrap_or_default()
}

/// Every `<prefix><name>` tag except `<prefix>loss`, keyed by `<name>`.
pub fn prefixed_scalars(history: &SummaryHistory, prefix: &str) -> BTreeMap<String, Vec<f64>> {
    let loss = format!("{prefix}loss");
    history
        .keys()
        .filter(|tag| tag.starts_with(prefix) && **tag != loss)
        .map(|tag| (tag[prefix.len()..].to_string(), scalars(history, tag)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn written_events_replay_in_step_order() {
        let tmp = TempDir::new().unwrap();
        let mut writer = SummaryWriter::create(tmp.path()).unwrap();
        writer
            .write_output("train/", 2, &StepOutput::new(0.5).with_metric("acc", 0.9))
            .unwrap();
        writer
            .write_output("train/", 1, &StepOutput::new(0.7).with_metric("acc", 0.8))
            .unwrap();
        writer.write("note", 1, "hello".into()).unwrap();
        writer.flush().unwrap();

        let history = read_summaries(tmp.path()).unwrap();
        assert_eq!(scalars(&history, "train/loss"), vec![0.7, 0.5]);
        let metrics = prefixed_scalars(&history, "train/");
        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics["acc"], vec![0.8, 0.9]);
        assert_eq!(history["note"][0].2, MetricValue::Text("hello".into()));
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let tmp = TempDir::new().unwrap();
        {
            let mut writer = SummaryWriter::create(tmp.path()).unwrap();
            writer.write("valid/loss", 1, 1.5.into()).unwrap();
            writer.flush().unwrap();
        }
        let file = fs::read_dir(tmp.path()).unwrap().next().unwrap().unwrap().path();
        let mut text = fs::read_to_string(&file).unwrap();
        text.push_str("{\"wall_time\": 1.0, \"st");
        fs::write(&file, text).unwrap();

        let history = read_summaries(tmp.path()).unwrap();
        assert_eq!(scalars(&history, "valid/loss"), vec![1.5]);
    }

    #[test]
    fn non_finite_values_replay() {
        let tmp = TempDir::new().unwrap();
        let mut writer = SummaryWriter::create(tmp.path()).unwrap();
        writer.write("train/loss", 1, f64::NAN.into()).unwrap();
        writer.write("train/loss", 2, f64::INFINITY.into()).unwrap();
        writer.write("train/loss", 3, f64::NEG_INFINITY.into()).unwrap();
        writer
            .write("train/hist", 3, vec![1.0, f64::NAN, f64::INFINITY].into())
            .unwrap();
        writer.write("note", 3, "NaN".into()).unwrap();
        writer.flush().unwrap();

        let history = read_summaries(tmp.path()).unwrap();
        let losses = scalars(&history, "train/loss");
        assert_eq!(losses.len(), 3);
        assert!(losses[0].is_nan());
        assert_eq!(losses[1], f64::INFINITY);
        assert_eq!(losses[2], f64::NEG_INFINITY);
        let MetricValue::Array(hist) = &history["train/hist"][0].2 else {
            panic!("expected an array");
        };
        assert_eq!(hist[0], 1.0);
        assert!(hist[1].is_nan());
        assert_eq!(hist[2], f64::INFINITY);
        assert_eq!(history["note"][0].2, MetricValue::Text("NaN".into()));
    }

    #[test]
    fn missing_logdir_is_empty() {
        let tmp = TempDir::new().unwrap();
        assert!(read_summaries(&tmp.path().join("nope")).unwrap().is_empty());
    }
}
