use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::launcher::Launcher;
use super::layout::{latest_config, ExperimentLayout, MODEL_DIR};
use super::manifest::{has_content, verify_manifest, write_manifest};
use crate::config::{self, apply_overrides, is_multirun, Config, ExperimentSettings, Override, OverrideSet};
use crate::error::{ExpError, Result};

/// The four collaborator operations an experiment plugs into the lifecycle.
///
/// Hooks are shared by every job of a sweep, possibly from several worker
/// threads, so they take `&self`.
pub trait ExperimentHooks: Sync {
    type Data;
    type Model;
    type Output: Send;

    fn on_load_data(&self, config: &Config) -> Result<Self::Data>;

    fn on_create_model(&self, config: &Config, data: &Self::Data) -> Result<Self::Model>;

    /// Restore a model from `path`. Returning `None` breaks the contract and
    /// aborts the job.
    fn on_load_model(&self, config: &Config, path: &Path) -> Result<Option<Self::Model>> {
        let _ = (config, path);
        Ok(None)
    }

    /// Train `model`, persisting its state into `model_path`.
    fn on_train(
        &self,
        config: &Config,
        data: Self::Data,
        model: Self::Model,
        model_path: &Path,
    ) -> Result<Self::Output>;
}

/// Stages of one job, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Init,
    Snapshot,
    DataLoaded,
    ModelCreated,
    ModelRestored,
    Trained,
    Manifested,
    Done,
}

#[derive(Debug)]
pub struct JobOutcome<T> {
    pub fingerprint: String,
    pub output_path: PathBuf,
    pub config_path: PathBuf,
    pub restored: bool,
    /// Every state the job went through, `Init` first.
    pub states: Vec<RunState>,
    pub output: T,
}

struct RunTrace<'a> {
    fingerprint: &'a str,
    states: Vec<RunState>,
}

impl<'a> RunTrace<'a> {
    fn new(fingerprint: &'a str) -> Self {
        Self {
            fingerprint,
            states: vec![RunState::Init],
        }
    }

    fn advance(&mut self, next: RunState) {
        if let Some(prev) = self.states.last() {
            debug!("[{}] {:?} -> {:?}", self.fingerprint, prev, next);
        }
        self.states.push(next);
    }
}

/// Resolves configurations, dispatches jobs and drives each one through
/// snapshot, data loading, model creation or restore, training and manifest.
pub struct Experimenter<H> {
    base: Config,
    layout: ExperimentLayout,
    settings: ExperimentSettings,
    hooks: H,
}

impl<H: ExperimentHooks> Experimenter<H> {
    pub fn new(settings: ExperimentSettings, base: Config, hooks: H) -> Result<Self> {
        let layout = ExperimentLayout::new(&settings.save_path, settings.exclude_keys.clone())?;
        info!("Experiment root: {}", layout.save_path().display());
        Ok(Self {
            base,
            layout,
            settings,
            hooks,
        })
    }

    pub fn configs(&self) -> &Config {
        &self.base
    }

    pub fn layout(&self) -> &ExperimentLayout {
        &self.layout
    }

    pub fn settings(&self) -> &ExperimentSettings {
        &self.settings
    }

    pub fn hooks(&self) -> &H {
        &self.hooks
    }

    pub fn parse_overrides<S: AsRef<str>>(&self, overrides: &[S]) -> Result<Vec<OverrideSet>> {
        config::parse_overrides(&self.base, overrides)
    }

    pub fn load_configuration<S: AsRef<str>>(&self, overrides: &[S]) -> Result<Vec<Config>> {
        config::load_configuration(&self.base, overrides)
    }

    /// Fingerprint of every configuration the overrides resolve to.
    pub fn hash<S: AsRef<str>>(&self, overrides: &[S]) -> Result<Vec<String>> {
        Ok(self
            .load_configuration(overrides)?
            .iter()
            .map(|cfg| self.layout.fingerprint(cfg))
            .collect())
    }

    /// Resolve the overrides and run one job per combination.
    ///
    /// Multi-valued overrides need `multirun`. `ncpu` falls back to the
    /// experiment settings. A failing job leaves its siblings running; its
    /// error is returned in its own slot.
    pub fn run<S: AsRef<str>>(
        &self,
        overrides: &[S],
        multirun: bool,
        ncpu: Option<usize>,
    ) -> Result<Vec<Result<JobOutcome<H::Output>>>> {
        if !multirun && is_multirun(overrides) {
            return Err(ExpError::MultirunRequired(
                overrides.iter().map(|o| o.as_ref().to_string()).collect(),
            ));
        }
        let sets = self.parse_overrides(overrides)?;
        let launcher = Launcher::new(ncpu.unwrap_or(self.settings.ncpu), self.layout.hydra_path()?);
        launcher.launch(sets, |job| {
            let cfg = apply_overrides(&self.base, &job.overrides)?;
            self.run_job(&cfg)
        })
    }

    /// Run a single resolved configuration through the lifecycle.
    pub fn run_job(&self, cfg: &Config) -> Result<JobOutcome<H::Output>> {
        let fingerprint = self.layout.fingerprint(cfg);
        let mut trace = RunTrace::new(&fingerprint);
        let output_path = self.layout.output_path(cfg)?;
        let model_path = output_path.join(MODEL_DIR);

        let config_path = self.layout.config_path(cfg, true)?;
        cfg.save(&config_path)?;
        info!("Save config: {}", config_path.display());
        trace.advance(RunState::Snapshot);

        let data = self.hooks.on_load_data(cfg)?;
        info!("Loaded data");
        trace.advance(RunState::DataLoaded);

        let restored = has_content(&model_path);
        let model = if restored {
            if self.settings.consistent_model {
                verify_manifest(&model_path)?;
            }
            let model = self
                .hooks
                .on_load_model(cfg, &model_path)?
                .ok_or_else(|| ExpError::RestoreContract(model_path.clone()))?;
            info!("Loaded model: {}", model_path.display());
            trace.advance(RunState::ModelRestored);
            model
        } else {
            let model = self.hooks.on_create_model(cfg, &data)?;
            info!("Create model: {}", model_path.display());
            trace.advance(RunState::ModelCreated);
            model
        };

        let output = self.hooks.on_train(cfg, data, model, &model_path)?;
        info!("Finish training");
        trace.advance(RunState::Trained);

        if has_content(&model_path) {
            let digest = write_manifest(&model_path)?;
            info!("Save model: {} (md5 {digest})", model_path.display());
            trace.advance(RunState::Manifested);
        }
        trace.advance(RunState::Done);

        let states = trace.states;
        Ok(JobOutcome {
            fingerprint,
            output_path,
            config_path,
            restored,
            states,
            output,
        })
    }

    /// Load every trained model whose newest config snapshot satisfies all
    /// `key=v1,v2` conditions.
    pub fn search<S: AsRef<str>>(&self, conditions: &[S]) -> Result<Vec<H::Model>> {
        let mut wanted: BTreeMap<String, Vec<Value>> = BTreeMap::new();
        for expr in conditions {
            let cond = Override::parse(expr.as_ref())?;
            let values = cond
                .value
                .split(',')
                .map(|v| Override::new(cond.key.clone(), v.trim()).parsed_value());
            wanted.entry(cond.key.clone()).or_default().extend(values);
        }

        let mut found = Vec::new();
        for exp_dir in self.layout.experiment_dirs()? {
            let model_path = exp_dir.join(MODEL_DIR);
            if !model_path.is_dir() {
                continue;
            }
            let Some(snapshot) = latest_config(&exp_dir)? else {
                continue;
            };
            let cfg = Config::from_file(&snapshot)?.with_strict(false);
            let matches = wanted.iter().all(|(key, values)| {
                cfg.lookup(key)
                    .is_some_and(|actual| values.iter().any(|v| same_value(actual, v)))
            });
            if matches {
                found.push((cfg, model_path));
            }
        }

        if found.is_empty() {
            let rendered: Vec<&str> = conditions.iter().map(AsRef::as_ref).collect();
            return Err(ExpError::not_found(format!(
                "no model satisfies conditions: {}",
                rendered.join(" ")
            )));
        }
        found
            .into_iter()
            .map(|(cfg, path)| {
                info!("Found model: {}", path.display());
                self.hooks
                    .on_load_model(&cfg, &path)?
                    .ok_or(ExpError::RestoreContract(path))
            })
            .collect()
    }

    /// Remove every experiment, dispatch record and stray file under the
    /// save root, once `confirm` agrees.
    pub fn clear_all_experiments<F>(&self, confirm: F) -> Result<Vec<PathBuf>>
    where
        F: FnOnce(&Path) -> bool,
    {
        self.layout.clear_all(confirm)
    }
}

fn same_value(actual: &Value, wanted: &Value) -> bool {
    if actual == wanted {
        return true;
    }
    match (actual.as_f64(), wanted.as_f64()) {
        (Some(a), Some(b)) => a == b,
        _ => render(actual) == render(wanted),
    }
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Writes `lr` into the model directory; restore reads it back.
    #[derive(Default)]
    struct FileHooks {
        loads: AtomicUsize,
    }

    impl ExperimentHooks for FileHooks {
        type Data = f64;
        type Model = String;
        type Output = String;

        fn on_load_data(&self, config: &Config) -> Result<f64> {
            config.get("lr")
        }

        fn on_create_model(&self, _config: &Config, data: &f64) -> Result<String> {
            Ok(format!("lr={data}"))
        }

        fn on_load_model(&self, _config: &Config, path: &Path) -> Result<Option<String>> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            Ok(Some(fs::read_to_string(path.join("weights.txt"))?))
        }

        fn on_train(&self, _config: &Config, _data: f64, model: String, model_path: &Path) -> Result<String> {
            fs::create_dir_all(model_path)?;
            fs::write(model_path.join("weights.txt"), &model)?;
            Ok(model)
        }
    }

    fn experimenter(tmp: &TempDir) -> Experimenter<FileHooks> {
        let settings = ExperimentSettings::new(tmp.path().join("runs").to_string_lossy())
            .with_exclude_keys(["seed"]);
        let base = Config::from_yaml_str("lr: 0.1\nseed: 1\nname: base\n").unwrap();
        Experimenter::new(settings, base, FileHooks::default()).unwrap()
    }

    #[test]
    fn single_value_overrides_need_no_multirun() {
        let tmp = TempDir::new().unwrap();
        let exp = experimenter(&tmp);
        let results = exp.run(&["lr=0.5"], false, None).unwrap();
        assert_eq!(results.len(), 1);
        let outcome = results.into_iter().next().unwrap().unwrap();
        assert_eq!(outcome.output, "lr=0.5");
        assert!(!outcome.restored);
        assert_eq!(
            outcome.states,
            vec![
                RunState::Init,
                RunState::Snapshot,
                RunState::DataLoaded,
                RunState::ModelCreated,
                RunState::Trained,
                RunState::Manifested,
                RunState::Done,
            ]
        );
        assert!(outcome.output_path.join("model.md5").is_file());
        assert!(outcome.config_path.is_file());
    }

    #[test]
    fn multi_value_requires_multirun() {
        let tmp = TempDir::new().unwrap();
        let exp = experimenter(&tmp);
        assert!(matches!(
            exp.run(&["lr=0.1,0.2"], false, None),
            Err(ExpError::MultirunRequired(_))
        ));
        let results = exp.run(&["lr=0.1,0.2"], true, Some(2)).unwrap();
        let outputs: Vec<String> = results.into_iter().map(|r| r.unwrap().output).collect();
        assert_eq!(outputs, vec!["lr=0.1", "lr=0.2"]);
    }

    #[test]
    fn hash_ignores_excluded_keys() {
        let tmp = TempDir::new().unwrap();
        let exp = experimenter(&tmp);
        let seeds = exp.hash(&["seed=1,2,3"]).unwrap();
        assert_eq!(seeds.len(), 3);
        assert!(seeds.iter().all(|h| h == &seeds[0]));
        let lrs = exp.hash(&["lr=0.1,0.2"]).unwrap();
        assert_ne!(lrs[0], lrs[1]);
        assert!(matches!(exp.hash(&["nope=1"]), Err(ExpError::UnknownKey { .. })));
    }

    #[test]
    fn search_filters_on_latest_snapshot() {
        let tmp = TempDir::new().unwrap();
        let exp = experimenter(&tmp);
        exp.run(&["lr=0.1,0.2,0.3"], true, None).unwrap();

        let found = exp.search(&["lr=0.2"]).unwrap();
        assert_eq!(found, vec!["lr=0.2".to_string()]);
        let found = exp.search(&["lr=0.1,0.3", "name=base"]).unwrap();
        assert_eq!(found.len(), 2);
        assert!(matches!(exp.search(&["lr=0.9"]), Err(ExpError::NotFound(_))));
    }

    #[test]
    fn clear_all_respects_confirmation() {
        let tmp = TempDir::new().unwrap();
        let exp = experimenter(&tmp);
        exp.run(&["lr=0.5"], false, None).unwrap();
        assert!(exp.clear_all_experiments(|_| false).unwrap().is_empty());
        assert!(!exp.layout().experiment_dirs().unwrap().is_empty());
        let removed = exp.clear_all_experiments(|_| true).unwrap();
        assert!(!removed.is_empty());
        assert!(exp.layout().experiment_dirs().unwrap().is_empty());
    }
}
