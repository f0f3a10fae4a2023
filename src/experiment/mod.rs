mod experimenter;
mod launcher;
mod layout;
mod manifest;

pub use experimenter::{ExperimentHooks, Experimenter, JobOutcome, RunState};
pub use launcher::{Job, Launcher};
pub use layout::{
    latest_config, timestamp, ExperimentLayout, CONFIG_PREFIX, DISPATCH_DIR, EXPERIMENT_PREFIX,
    MODEL_DIR,
};
pub use manifest::{
    has_content, manifest_path, md5_folder, read_manifest, verify_manifest, write_manifest,
};
