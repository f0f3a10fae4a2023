use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use burn::backend::Autodiff;
use burn_ndarray::NdArray;
use tempfile::TempDir;

use exp_harness::config::{Config, ExperimentSettings};
use exp_harness::error::{ExpError, Result};
use exp_harness::experiment::{manifest_path, ExperimentHooks, Experimenter, RunState};
use exp_harness::model::RegressionExperiment;
use exp_harness::training::StopReason;

/// Counts hook calls; the "model" is a counter persisted as a text file.
#[derive(Default)]
struct CountingHooks {
    created: AtomicUsize,
    loaded: AtomicUsize,
    trained: AtomicUsize,
    forget_model: bool,
}

impl ExperimentHooks for CountingHooks {
    type Data = u32;
    type Model = u32;
    type Output = u32;

    fn on_load_data(&self, config: &Config) -> Result<u32> {
        config.get("steps")
    }

    fn on_create_model(&self, _config: &Config, _data: &u32) -> Result<u32> {
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(0)
    }

    fn on_load_model(&self, _config: &Config, path: &Path) -> Result<Option<u32>> {
        self.loaded.fetch_add(1, Ordering::SeqCst);
        if self.forget_model {
            return Ok(None);
        }
        let text = fs::read_to_string(path.join("state.txt"))?;
        Ok(Some(text.trim().parse::<u32>().map_err(anyhow::Error::from)?))
    }

    fn on_train(&self, _config: &Config, steps: u32, model: u32, model_path: &Path) -> Result<u32> {
        self.trained.fetch_add(1, Ordering::SeqCst);
        let trained = model + steps;
        fs::create_dir_all(model_path)?;
        fs::write(model_path.join("state.txt"), trained.to_string())?;
        Ok(trained)
    }
}

fn experimenter(root: &Path, hooks: CountingHooks) -> Experimenter<CountingHooks> {
    let settings = ExperimentSettings::new(root.to_string_lossy()).with_exclude_keys(["seed"]);
    let base = Config::from_yaml_str("steps: 5\nseed: 0\n").unwrap();
    Experimenter::new(settings, base, hooks).unwrap()
}

fn run_once(exp: &Experimenter<CountingHooks>, overrides: &[&str]) -> Result<exp_harness::experiment::JobOutcome<u32>> {
    exp.run(overrides, false, None)?
        .into_iter()
        .next()
        .expect("one job")
}

#[test]
fn create_then_resume_then_reject_corruption() {
    let tmp = TempDir::new().unwrap();
    let exp = experimenter(tmp.path(), CountingHooks::default());

    let first = run_once(&exp, &[]).unwrap();
    assert_eq!(first.output, 5);
    assert!(!first.restored);
    assert!(first.states.contains(&RunState::ModelCreated));
    let model_dir = first.output_path.join("model");
    assert!(manifest_path(&model_dir).is_file());

    // a different seed is the same experiment, so training resumes
    let second = run_once(&exp, &["seed=7"]).unwrap();
    assert_eq!(second.fingerprint, first.fingerprint);
    assert!(second.restored);
    assert!(second.states.contains(&RunState::ModelRestored));
    assert_eq!(second.output, 10);
    assert_eq!(exp.hooks().created.load(Ordering::SeqCst), 1);
    assert_eq!(exp.hooks().loaded.load(Ordering::SeqCst), 1);

    fs::write(model_dir.join("state.txt"), "999").unwrap();
    let err = run_once(&exp, &[]).unwrap_err();
    assert!(matches!(err, ExpError::Corruption { .. }), "unexpected error: {err}");
    assert_eq!(exp.hooks().loaded.load(Ordering::SeqCst), 1);
    assert_eq!(exp.hooks().trained.load(Ordering::SeqCst), 2);
}

#[test]
fn consistency_check_can_be_disabled() {
    let tmp = TempDir::new().unwrap();
    let settings = ExperimentSettings::new(tmp.path().to_string_lossy()).with_consistent_model(false);
    let base = Config::from_yaml_str("steps: 1\nseed: 0\n").unwrap();
    let exp = Experimenter::new(settings, base, CountingHooks::default()).unwrap();

    let first = run_once(&exp, &[]).unwrap();
    fs::write(first.output_path.join("model").join("state.txt"), "41").unwrap();
    assert_eq!(run_once(&exp, &[]).unwrap().output, 42);
}

#[test]
fn restore_hook_must_return_a_model() {
    let tmp = TempDir::new().unwrap();
    let exp = experimenter(
        tmp.path(),
        CountingHooks {
            forget_model: true,
            ..CountingHooks::default()
        },
    );
    run_once(&exp, &[]).unwrap();
    assert!(matches!(run_once(&exp, &[]), Err(ExpError::RestoreContract(_))));
}

#[test]
fn sweep_results_follow_override_order() {
    let tmp = TempDir::new().unwrap();
    let exp = experimenter(tmp.path(), CountingHooks::default());
    let sequential: Vec<u32> = exp
        .run(&["steps=1,2,3,4"], true, Some(1))
        .unwrap()
        .into_iter()
        .map(|r| r.unwrap().output)
        .collect();

    let other = TempDir::new().unwrap();
    let exp = experimenter(other.path(), CountingHooks::default());
    let pooled: Vec<u32> = exp
        .run(&["steps=1,2,3,4"], true, Some(4))
        .unwrap()
        .into_iter()
        .map(|r| r.unwrap().output)
        .collect();

    assert_eq!(sequential, vec![1, 2, 3, 4]);
    assert_eq!(sequential, pooled);
}

#[test]
fn regression_experiment_trains_and_resumes() {
    let tmp = TempDir::new().unwrap();
    let settings = ExperimentSettings::new(tmp.path().to_string_lossy());
    let base = Config::from_yaml_str(
        "model:\n  input_dim: 2\n  hidden_dim: 4\n  learning_rate: 0.05\n\
         data:\n  samples: 40\n  batch_size: 10\n  valid_ratio: 0.25\n  epochs: 2\n  seed: 3\n\
         trainer:\n  valid_freq: 2\n  logging_interval: 0.0\n\
         early_stop:\n  threshold: 0.0\n  min_epoch: 100\n\
         checkpoint:\n  max_to_keep: 2\n",
    )
    .unwrap();
    let hooks = RegressionExperiment::<Autodiff<NdArray<f32>>>::new(Default::default()).with_progress(false);
    let exp = Experimenter::new(settings, base, hooks).unwrap();

    let first = exp.run::<&str>(&[], false, None).unwrap().remove(0).unwrap();
    // 3 train batches per epoch, 2 epochs
    assert_eq!(first.output.n_iter, 6);
    assert_eq!(first.output.reason, StopReason::Normal);
    assert!(first.output.best_valid_loss.is_some());

    let second = exp.run::<&str>(&[], false, None).unwrap().remove(0).unwrap();
    assert!(second.restored);
    assert_eq!(second.output.n_iter, 12);
    assert!(second.output_path.join("logs").is_dir());
}
