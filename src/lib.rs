//! GAN model lifecycle - Rust implementation
//!
//! The base contract for a trainable generator/discriminator pair:
//! checkpoint persistence, optimizer and scheduler state, per-iteration
//! learning-rate control with warmup and stochastic weight averaging, and
//! gradient-flow toggling for partial fine-tuning.
//!
//! # Components
//!
//! - **Checkpoints**: network weights and training-state snapshots, with
//!   rotation of the previous file and a standard-format fallback
//! - **LR control**: warmup ramp, regular schedulers, SWA regime switch
//! - **Gradient toggle**: freeze/unfreeze parameters by layer name
//! - **Hot reconfiguration**: change live scheduler parameters mid-run
//!
//! # Example
//!
//! ```ignore
//! use gan_lifecycle::{ModelBase, ModelOptions, Network};
//!
//! let opt = ModelOptions::from_json_file("train.json")?;
//! let mut base = ModelBase::new(opt, net_g, Some(net_d))?;
//! for step in 1..=niter {
//!     // forward / backward / optimizer step on the concrete model
//!     base.update_learning_rate(step, warmup_iter)?;
//! }
//! base.save_training_state(epoch, niter, true)?;
//! ```

pub mod config;
pub mod models;
pub mod training;
pub mod utils;

// Re-export commonly used items
pub use config::{ModelOptions, PathOptions, TrainOptions};
pub use models::base::{ModelBase, TrainableModel};
pub use models::{NetType, Network};

/// Library error types
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Model error: {0}")]
    Model(String),

    #[error("Training error: {0}")]
    Training(String),

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("Wrong lengths of {what}: expected {expected}, found {found}")]
    StateMismatch {
        what: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Safetensors error: {0}")]
    SafeTensors(#[from] safetensors::SafeTensorError),
}

pub type Result<T> = std::result::Result<T, LifecycleError>;
