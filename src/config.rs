/// Configuration for the model lifecycle
///
/// Mirrors the JSON option tree a training run is launched with. Only the
/// keys the lifecycle layer reads are modelled; anything else is ignored.
use std::path::{Path, PathBuf};

use candle_core::Device;
use serde::{Deserialize, Deserializer, Serialize};

use crate::{LifecycleError, Result};

/// Learning-rate scheme names as they appear in configuration files
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LrScheme {
    #[serde(rename = "StepLR")]
    Step,
    #[serde(rename = "StepLR_Restart")]
    StepRestart,
    #[serde(rename = "MultiStepLR")]
    MultiStep,
    #[serde(rename = "MultiStepLR_Restart")]
    MultiStepRestart,
    #[serde(rename = "CosineAnnealingLR_Restart")]
    CosineRestart,
}

impl std::fmt::Display for LrScheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Step => "StepLR",
            Self::StepRestart => "StepLR_Restart",
            Self::MultiStep => "MultiStepLR",
            Self::MultiStepRestart => "MultiStepLR_Restart",
            Self::CosineRestart => "CosineAnnealingLR_Restart",
        };
        f.write_str(name)
    }
}

/// Annealing curve used by the SWA scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnnealStrategy {
    #[default]
    Cos,
    Linear,
}

/// Training options (the `train` section)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainOptions {
    /// Scheduler kind, shared by every network
    pub lr_scheme: LrScheme,

    /// StepLR step size
    #[serde(default)]
    pub lr_step_size: Option<usize>,
    /// StepLR_Restart step size per segment
    #[serde(default)]
    pub lr_step_sizes: Option<Vec<usize>>,
    /// Multiplicative decay factor
    #[serde(default)]
    pub lr_gamma: Option<f64>,
    /// Milestones for the multi-step schemes
    #[serde(default)]
    pub lr_steps: Option<Vec<usize>>,
    /// Iterations at which the restart schemes reset the learning rate
    #[serde(default)]
    pub restarts: Option<Vec<usize>>,
    /// Weight applied to `initial_lr` at each restart
    #[serde(default)]
    pub restart_weights: Option<Vec<f64>>,
    /// Wipe optimizer moments on restart
    #[serde(default)]
    pub clear_state: Option<bool>,
    /// Cosine period per segment
    #[serde(default, rename = "T_period")]
    pub lr_periods: Option<Vec<usize>>,
    /// Cosine floor
    #[serde(default)]
    pub eta_min: Option<f64>,

    /// Warmup length in iterations; `-1` or absent disables warmup
    #[serde(default, deserialize_with = "negative_as_none")]
    pub warmup_iter: Option<usize>,
    /// Total training iterations
    #[serde(default)]
    pub niter: Option<usize>,

    /// Absolute SWA start iteration
    #[serde(default)]
    pub swa_start_iter: Option<usize>,
    /// SWA start as a fraction of `niter`, used when no absolute value is set
    #[serde(default)]
    pub swa_start_iter_rel: Option<f64>,
    /// Target learning rate of the SWA scheduler
    #[serde(default)]
    pub swa_lr: Option<f64>,
    /// Iterations over which the SWA scheduler anneals toward `swa_lr`
    #[serde(default = "default_swa_anneal_epochs")]
    pub swa_anneal_epochs: usize,
    #[serde(default)]
    pub swa_anneal_strategy: AnnealStrategy,

    #[serde(rename = "lr_G")]
    pub lr_g: f64,
    #[serde(default, rename = "weight_decay_G")]
    pub weight_decay_g: f64,
    #[serde(default = "default_beta1", rename = "beta1_G")]
    pub beta1_g: f64,
    #[serde(default = "default_beta2", rename = "beta2_G")]
    pub beta2_g: f64,

    #[serde(default, rename = "lr_D")]
    pub lr_d: Option<f64>,
    #[serde(default, rename = "weight_decay_D")]
    pub weight_decay_d: f64,
    #[serde(default = "default_beta1", rename = "beta1_D")]
    pub beta1_d: f64,
    #[serde(default = "default_beta2", rename = "beta2_D")]
    pub beta2_d: f64,
}

fn default_swa_anneal_epochs() -> usize {
    10
}

fn default_beta1() -> f64 {
    0.9
}

fn default_beta2() -> f64 {
    0.999
}

fn negative_as_none<'de, D>(deserializer: D) -> std::result::Result<Option<usize>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<i64>::deserialize(deserializer)?;
    Ok(value.and_then(|v| usize::try_from(v).ok()))
}

impl Default for TrainOptions {
    fn default() -> Self {
        Self {
            lr_scheme: LrScheme::MultiStep,
            lr_step_size: None,
            lr_step_sizes: None,
            lr_gamma: Some(0.5),
            lr_steps: Some(vec![50_000, 100_000, 200_000, 300_000]),
            restarts: None,
            restart_weights: None,
            clear_state: None,
            lr_periods: None,
            eta_min: None,
            warmup_iter: None,
            niter: Some(500_000),
            swa_start_iter: None,
            swa_start_iter_rel: None,
            swa_lr: None,
            swa_anneal_epochs: default_swa_anneal_epochs(),
            swa_anneal_strategy: AnnealStrategy::Cos,
            lr_g: 1e-4,
            weight_decay_g: 0.0,
            beta1_g: default_beta1(),
            beta2_g: default_beta2(),
            lr_d: Some(1e-4),
            weight_decay_d: 0.0,
            beta1_d: default_beta1(),
            beta2_d: default_beta2(),
        }
    }
}

impl TrainOptions {
    /// Resolve the SWA start iteration
    ///
    /// An absolute `swa_start_iter` wins; otherwise `swa_start_iter_rel`
    /// is scaled by `niter`.
    pub fn swa_start_iter(&self) -> Option<usize> {
        if let Some(iter) = self.swa_start_iter {
            return Some(iter);
        }
        match (self.swa_start_iter_rel, self.niter) {
            (Some(rel), Some(niter)) => Some((rel * niter as f64) as usize),
            _ => None,
        }
    }

    /// Validate the scheduler section for the configured scheme
    pub fn validate(&self) -> Result<()> {
        match self.lr_scheme {
            LrScheme::Step => {
                if self.lr_step_size.unwrap_or(0) == 0 {
                    return Err(LifecycleError::Config(
                        "StepLR requires lr_step_size > 0".to_string(),
                    ));
                }
            }
            LrScheme::StepRestart => {
                let sizes = self.lr_step_sizes.as_deref().unwrap_or_default();
                if sizes.is_empty() || sizes.contains(&0) {
                    return Err(LifecycleError::Config(
                        "StepLR_Restart requires non-empty, non-zero lr_step_sizes".to_string(),
                    ));
                }
            }
            LrScheme::MultiStep | LrScheme::MultiStepRestart => {
                let steps = self.lr_steps.as_deref().ok_or_else(|| {
                    LifecycleError::Config(format!("{} requires lr_steps", self.lr_scheme))
                })?;
                ensure_increasing("lr_steps", steps)?;
            }
            LrScheme::CosineRestart => {
                let periods = self.lr_periods.as_deref().unwrap_or_default();
                if periods.is_empty() || periods.contains(&0) {
                    return Err(LifecycleError::Config(
                        "CosineAnnealingLR_Restart requires non-empty, non-zero T_period"
                            .to_string(),
                    ));
                }
            }
        }

        if let Some(restarts) = self.restarts.as_deref() {
            ensure_increasing("restarts", restarts)?;
            if let Some(weights) = self.restart_weights.as_deref() {
                if weights.len() != restarts.len() {
                    return Err(LifecycleError::Config(format!(
                        "restart_weights has {} entries but restarts has {}",
                        weights.len(),
                        restarts.len()
                    )));
                }
            }
        }

        if let Some(gamma) = self.lr_gamma {
            if gamma <= 0.0 {
                return Err(LifecycleError::Config(format!(
                    "lr_gamma must be > 0, got {}",
                    gamma
                )));
            }
        }

        if let Some(rel) = self.swa_start_iter_rel {
            if !(0.0..=1.0).contains(&rel) {
                return Err(LifecycleError::Config(format!(
                    "swa_start_iter_rel must be within [0, 1], got {}",
                    rel
                )));
            }
        }

        Ok(())
    }
}

/// Fail unless `values` is strictly increasing
pub fn ensure_increasing(key: &str, values: &[usize]) -> Result<()> {
    if values.windows(2).all(|w| w[0] < w[1]) {
        Ok(())
    } else {
        Err(LifecycleError::Config(format!(
            "{} should be a list of increasing integers. Got {:?}",
            key, values
        )))
    }
}

/// Output directories
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathOptions {
    /// Network weight checkpoints
    pub models: PathBuf,
    /// Training-state snapshots
    pub training_state: PathBuf,
}

/// Top-level options consumed by the model base
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelOptions {
    /// Whether the model is being trained (enables optimizers and schedulers)
    pub is_train: bool,

    /// Enable stochastic weight averaging of the generator
    #[serde(default)]
    pub use_swa: bool,

    /// Accelerator ids; `None` keeps everything on the host
    #[serde(default)]
    pub gpu_ids: Option<Vec<usize>>,

    pub path: PathOptions,

    #[serde(default)]
    pub train: TrainOptions,
}

impl ModelOptions {
    /// Parse options from a JSON string
    pub fn from_json_str(json: &str) -> Result<Self> {
        let opt: Self = serde_json::from_str(json)?;
        opt.validate()?;
        Ok(opt)
    }

    /// Parse options from a JSON file
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let json = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&json)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.is_train {
            self.train.validate()?;
            if self.use_swa && self.train.swa_lr.is_none() {
                return Err(LifecycleError::Config(
                    "use_swa requires train.swa_lr".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Device to place networks on
    ///
    /// Falls back to the host when no accelerator is configured or available.
    pub fn device(&self) -> Result<Device> {
        match self.gpu_ids.as_deref() {
            Some([id, ..]) if candle_core::utils::cuda_is_available() => {
                Ok(Device::new_cuda(*id)?)
            }
            _ => Ok(Device::Cpu),
        }
    }
}
