/// Training infrastructure: optimizer, schedulers, SWA and checkpoints
pub mod checkpoint;
pub mod optimizer;
pub mod scheduler;
pub mod state;
pub mod swa;

pub use checkpoint::{StateDict, StateDictSource};
pub use optimizer::{AdamW, AdamWConfig, OptimizerState};
pub use scheduler::{LrPolicy, LrScheduler};
pub use state::TrainingState;
pub use swa::{SwaLr, SwaModel, SwaState};
