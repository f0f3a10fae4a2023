mod manager;
mod record;
mod weights;

pub use manager::{
    restore_checkpoint, save_checkpoint, CheckpointEntry, CheckpointManager, CheckpointRegistry,
    DEFAULT_MAX_TO_KEEP,
};
pub use record::{load_module, module_file, save_module, Checkpointable, ModuleState, SerdeState};
pub use weights::WeightCache;
