//! Persistence: checkpoints and run configs

mod checkpoint;
mod config_store;

pub use checkpoint::{
    epoch_checkpoint_name, Checkpoint, CheckpointStore, BEST_CHECKPOINT, FINAL_CHECKPOINT,
};
pub use config_store::{config_dump, load_run_config, save_run_config, ConfigFormat, CONFIG_FILE};
