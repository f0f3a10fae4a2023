use std::time::Duration;

use crate::config::{Config, TrainerSettings};
use crate::error::{ExpError, Result};

/// Cadences and budget of one `Trainer::fit` call.
#[derive(Debug, Clone, PartialEq)]
pub struct FitOptions {
    /// Validate every `valid_freq` iterations (forced to 1 when
    /// `valid_interval` is non-zero).
    pub valid_freq: u64,
    /// Minimum wall-clock time between two validations.
    pub valid_interval: Duration,
    /// Minimum wall-clock time between two log lines.
    pub logging_interval: Duration,
    /// `None` runs one pass over a source of known length, or forever.
    pub max_iter: Option<u64>,
    pub terminate_on_nan: bool,
    pub compile_graph: bool,
    /// Shown on the progress line, usually the experiment fingerprint.
    pub log_tag: String,
    pub show_progress: bool,
}

impl Default for FitOptions {
    fn default() -> Self {
        Self {
            valid_freq: 1,
            valid_interval: Duration::ZERO,
            logging_interval: Duration::from_secs(3),
            max_iter: None,
            terminate_on_nan: true,
            compile_graph: true,
            log_tag: String::new(),
            show_progress: true,
        }
    }
}

impl FitOptions {
    pub fn from_settings(settings: &TrainerSettings) -> Result<Self> {
        let valid_interval = seconds("valid_interval", settings.valid_interval)?;
        let logging_interval = seconds("logging_interval", settings.logging_interval)?;
        let valid_freq = if !valid_interval.is_zero() {
            1
        } else {
            settings.valid_freq.max(1)
        };
        Ok(Self {
            valid_freq,
            valid_interval,
            logging_interval,
            max_iter: u64::try_from(settings.max_iter).ok().filter(|n| *n > 0),
            terminate_on_nan: settings.terminate_on_nan,
            compile_graph: settings.compile_graph,
            log_tag: settings.log_tag.clone(),
            show_progress: true,
        })
    }

    /// Read the `trainer` section of a configuration.
    pub fn from_config(config: &Config) -> Result<Self> {
        Self::from_settings(&config.section::<TrainerSettings>("trainer")?)
    }

    pub fn with_valid_freq(mut self, valid_freq: u64) -> Self {
        self.valid_freq = valid_freq.max(1);
        self
    }

    pub fn with_valid_interval(mut self, interval: Duration) -> Self {
        self.valid_interval = interval;
        if !interval.is_zero() {
            self.valid_freq = 1;
        }
        self
    }

    pub fn with_logging_interval(mut self, interval: Duration) -> Self {
        self.logging_interval = interval;
        self
    }

    pub fn with_max_iter(mut self, max_iter: Option<u64>) -> Self {
        self.max_iter = max_iter.filter(|n| *n > 0);
        self
    }

    pub fn with_terminate_on_nan(mut self, terminate: bool) -> Self {
        self.terminate_on_nan = terminate;
        self
    }

    pub fn with_compile_graph(mut self, compile: bool) -> Self {
        self.compile_graph = compile;
        self
    }

    pub fn with_log_tag(mut self, tag: impl Into<String>) -> Self {
        self.log_tag = tag.into();
        self
    }

    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }
}

fn seconds(name: &str, value: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(value).map_err(|_| {
        ExpError::configuration(format!("trainer.{name} must be a non-negative number of seconds, got {value}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_trainer_settings() {
        let options = FitOptions::default();
        assert_eq!(options.valid_freq, 1);
        assert_eq!(options.valid_interval, Duration::ZERO);
        assert_eq!(options.logging_interval, Duration::from_secs(3));
        assert_eq!(options.max_iter, None);
        assert!(options.terminate_on_nan);
        assert!(options.compile_graph);
    }

    #[test]
    fn valid_interval_forces_every_iteration() {
        let settings = TrainerSettings {
            valid_freq: 10,
            valid_interval: 2.5,
            ..TrainerSettings::default()
        };
        let options = FitOptions::from_settings(&settings).unwrap();
        assert_eq!(options.valid_freq, 1);
        assert_eq!(options.valid_interval, Duration::from_millis(2500));

        let builder = FitOptions::default()
            .with_valid_freq(10)
            .with_valid_interval(Duration::from_secs(1));
        assert_eq!(builder.valid_freq, 1);
    }

    #[test]
    fn reads_trainer_section() {
        let config = Config::from_yaml_str("trainer:\n  valid_freq: 10\n  max_iter: 30\n").unwrap();
        let options = FitOptions::from_config(&config).unwrap();
        assert_eq!(options.valid_freq, 10);
        assert_eq!(options.max_iter, Some(30));

        let empty = Config::from_yaml_str("model: {}\n").unwrap();
        assert_eq!(FitOptions::from_config(&empty).unwrap(), FitOptions::default());
    }

    #[test]
    fn negative_interval_is_rejected() {
        let settings = TrainerSettings {
            logging_interval: -1.0,
            ..TrainerSettings::default()
        };
        assert!(matches!(
            FitOptions::from_settings(&settings),
            Err(ExpError::Configuration(_))
        ));
    }
}
