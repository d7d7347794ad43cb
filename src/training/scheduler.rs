/// Per-iteration learning rate schedulers
///
/// Every scheduler counts iterations in `last_epoch` and derives each
/// group's learning rate from that group's `initial_lr` in closed form,
/// so a schedule can be resumed or reconfigured without replaying history.
use std::f64::consts::PI;
use std::fmt::Debug;

use serde::{Deserialize, Serialize};

use super::optimizer::AdamW;
use crate::config::{ensure_increasing, LrScheme, TrainOptions};
use crate::{LifecycleError, Result};

/// Fixed-interval decay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepLr {
    pub step_size: usize,
    pub gamma: f64,
}

/// Fixed-interval decay with warm restarts
///
/// Segment `k` (after the k-th restart) decays every `step_sizes[k]`
/// iterations, starting from `initial_lr * restart_weights[k - 1]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepLrRestart {
    pub step_sizes: Vec<usize>,
    pub restarts: Vec<usize>,
    pub restart_weights: Vec<f64>,
    pub gamma: f64,
    pub clear_state: bool,
}

/// Decay at fixed milestones
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiStepLr {
    pub milestones: Vec<usize>,
    pub gamma: f64,
}

/// Decay at fixed milestones with warm restarts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiStepLrRestart {
    pub milestones: Vec<usize>,
    pub restarts: Vec<usize>,
    pub restart_weights: Vec<f64>,
    pub gamma: f64,
    pub clear_state: bool,
}

/// Cosine annealing with warm restarts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CosineRestartLr {
    pub periods: Vec<usize>,
    pub restarts: Vec<usize>,
    pub restart_weights: Vec<f64>,
    pub eta_min: f64,
    pub clear_state: bool,
}

/// Learning rate policy of a scheduler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum LrPolicy {
    #[serde(rename = "StepLR")]
    Step(StepLr),
    #[serde(rename = "StepLR_Restart")]
    StepRestart(StepLrRestart),
    #[serde(rename = "MultiStepLR")]
    MultiStep(MultiStepLr),
    #[serde(rename = "MultiStepLR_Restart")]
    MultiStepRestart(MultiStepLrRestart),
    #[serde(rename = "CosineAnnealingLR_Restart")]
    CosineRestart(CosineRestartLr),
}

/// Segment index containing `epoch` and the epoch it started at
fn restart_segment(restarts: &[usize], epoch: usize) -> (usize, usize) {
    let segment = restarts.iter().take_while(|&&r| r <= epoch).count();
    let start = if segment == 0 { 0 } else { restarts[segment - 1] };
    (segment, start)
}

fn restart_weight(weights: &[f64], segment: usize) -> f64 {
    if segment == 0 {
        1.0
    } else {
        weights.get(segment - 1).copied().unwrap_or(1.0)
    }
}

/// Value for `segment`, repeating the last entry when the list runs out
fn per_segment(values: &[usize], segment: usize) -> usize {
    values
        .get(segment)
        .or_else(|| values.last())
        .copied()
        .unwrap_or(1)
        .max(1)
}

impl LrPolicy {
    /// Configuration name of this policy
    pub fn scheme(&self) -> LrScheme {
        match self {
            Self::Step(_) => LrScheme::Step,
            Self::StepRestart(_) => LrScheme::StepRestart,
            Self::MultiStep(_) => LrScheme::MultiStep,
            Self::MultiStepRestart(_) => LrScheme::MultiStepRestart,
            Self::CosineRestart(_) => LrScheme::CosineRestart,
        }
    }

    /// Learning rate for a group with `initial_lr` at `epoch`
    pub fn lr_at(&self, initial_lr: f64, epoch: usize) -> f64 {
        match self {
            Self::Step(p) => initial_lr * p.gamma.powi((epoch / p.step_size.max(1)) as i32),
            Self::StepRestart(p) => {
                let (segment, start) = restart_segment(&p.restarts, epoch);
                let step_size = per_segment(&p.step_sizes, segment);
                let decays = (epoch - start) / step_size;
                initial_lr * restart_weight(&p.restart_weights, segment) * p.gamma.powi(decays as i32)
            }
            Self::MultiStep(p) => {
                let passed = p.milestones.iter().filter(|&&m| m <= epoch).count();
                initial_lr * p.gamma.powi(passed as i32)
            }
            Self::MultiStepRestart(p) => {
                let (segment, start) = restart_segment(&p.restarts, epoch);
                let passed = p
                    .milestones
                    .iter()
                    .filter(|&&m| m <= epoch && (segment == 0 || m > start))
                    .count();
                initial_lr * restart_weight(&p.restart_weights, segment) * p.gamma.powi(passed as i32)
            }
            Self::CosineRestart(p) => {
                let (segment, start) = restart_segment(&p.restarts, epoch);
                let period = per_segment(&p.periods, segment);
                let t = (epoch - start).min(period) as f64;
                let peak = initial_lr * restart_weight(&p.restart_weights, segment);
                p.eta_min + (peak - p.eta_min) * (1.0 + (PI * t / period as f64).cos()) / 2.0
            }
        }
    }

    /// Whether `epoch` is a restart that wipes optimizer state
    fn clears_state_at(&self, epoch: usize) -> bool {
        let (restarts, clear_state) = match self {
            Self::Step(_) | Self::MultiStep(_) => return false,
            Self::StepRestart(p) => (&p.restarts, p.clear_state),
            Self::MultiStepRestart(p) => (&p.restarts, p.clear_state),
            Self::CosineRestart(p) => (&p.restarts, p.clear_state),
        };
        clear_state && restarts.contains(&epoch)
    }
}

/// Log and apply a changed, non-null option value
fn update_field<T: PartialEq + Clone + Debug>(name: &str, live: &mut T, new: Option<&T>) {
    if let Some(new) = new {
        if live != new {
            log::info!("Updating {} from {:?} to {:?}", name, live, new);
            *live = new.clone();
        }
    }
}

fn update_milestones(live: &mut Vec<usize>, new: Option<&Vec<usize>>) -> Result<()> {
    if let Some(new) = new {
        if live != new {
            ensure_increasing("lr_steps", new)?;
        }
    }
    update_field("lr_steps", live, new);
    Ok(())
}

/// Learning rate scheduler bound to one optimizer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LrScheduler {
    pub policy: LrPolicy,
    /// Iterations stepped so far
    pub last_epoch: usize,
    /// Group learning rates computed by the last step
    pub last_lr: Vec<f64>,
}

impl LrScheduler {
    /// Create a scheduler and apply epoch 0 to `optimizer`
    pub fn new(policy: LrPolicy, optimizer: &mut AdamW) -> Self {
        let mut scheduler = Self {
            policy,
            last_epoch: 0,
            last_lr: Vec::new(),
        };
        scheduler.apply(optimizer);
        scheduler
    }

    /// Build the scheduler named by `train.lr_scheme`
    pub fn from_options(train: &TrainOptions, optimizer: &mut AdamW) -> Result<Self> {
        train.validate()?;

        let gamma = train.lr_gamma.unwrap_or(0.5);
        let restarts = train.restarts.clone().unwrap_or_default();
        let restart_weights = train
            .restart_weights
            .clone()
            .unwrap_or_else(|| vec![1.0; restarts.len()]);
        let clear_state = train.clear_state.unwrap_or(false);
        let missing = |key: &str| LifecycleError::Config(format!("{} requires {}", train.lr_scheme, key));

        let policy = match train.lr_scheme {
            LrScheme::Step => LrPolicy::Step(StepLr {
                step_size: train.lr_step_size.ok_or_else(|| missing("lr_step_size"))?,
                gamma,
            }),
            LrScheme::StepRestart => LrPolicy::StepRestart(StepLrRestart {
                step_sizes: train.lr_step_sizes.clone().ok_or_else(|| missing("lr_step_sizes"))?,
                restarts,
                restart_weights,
                gamma,
                clear_state,
            }),
            LrScheme::MultiStep => LrPolicy::MultiStep(MultiStepLr {
                milestones: train.lr_steps.clone().ok_or_else(|| missing("lr_steps"))?,
                gamma,
            }),
            LrScheme::MultiStepRestart => LrPolicy::MultiStepRestart(MultiStepLrRestart {
                milestones: train.lr_steps.clone().ok_or_else(|| missing("lr_steps"))?,
                restarts,
                restart_weights,
                gamma,
                clear_state,
            }),
            LrScheme::CosineRestart => LrPolicy::CosineRestart(CosineRestartLr {
                periods: train.lr_periods.clone().ok_or_else(|| missing("T_period"))?,
                restarts,
                restart_weights,
                eta_min: train.eta_min.unwrap_or(1e-7),
                clear_state,
            }),
        };

        Ok(Self::new(policy, optimizer))
    }

    /// Advance one iteration and update `optimizer`'s group learning rates
    pub fn step(&mut self, optimizer: &mut AdamW) {
        self.last_epoch += 1;
        self.apply(optimizer);
    }

    fn apply(&mut self, optimizer: &mut AdamW) {
        if self.policy.clears_state_at(self.last_epoch) {
            log::debug!("Restart at iteration {}: clearing optimizer state", self.last_epoch);
            optimizer.clear_state();
        }

        let epoch = self.last_epoch;
        self.last_lr = optimizer
            .param_groups_mut()
            .iter_mut()
            .map(|group| {
                group.lr = self.policy.lr_at(group.initial_lr, epoch);
                group.lr
            })
            .collect();
    }

    /// Learning rates computed by the last step
    pub fn last_lr(&self) -> &[f64] {
        &self.last_lr
    }

    pub fn scheme(&self) -> LrScheme {
        self.policy.scheme()
    }

    /// Snapshot for a training state
    pub fn state_dict(&self) -> LrScheduler {
        self.clone()
    }

    /// Restore a snapshot of the same scheduler kind
    pub fn load_state_dict(&mut self, saved: &LrScheduler) -> Result<()> {
        if saved.scheme() != self.scheme() {
            return Err(LifecycleError::Training(format!(
                "cannot resume a {} scheduler from a {} state",
                self.scheme(),
                saved.scheme()
            )));
        }
        *self = saved.clone();
        Ok(())
    }

    /// Apply changed values from `train` to a live scheduler
    ///
    /// Only acts when `train.lr_scheme` names this scheduler's kind. Null
    /// options leave the live value alone. Takes effect from the next step.
    pub fn reconfigure(&mut self, train: &TrainOptions) -> Result<()> {
        if train.lr_scheme != self.scheme() {
            return Ok(());
        }

        match &mut self.policy {
            LrPolicy::Step(p) => {
                update_field("step_size", &mut p.step_size, train.lr_step_size.as_ref());
                update_field("lr_gamma", &mut p.gamma, train.lr_gamma.as_ref());
            }
            LrPolicy::StepRestart(p) => {
                update_field("step_sizes", &mut p.step_sizes, train.lr_step_sizes.as_ref());
                update_field("restarts", &mut p.restarts, train.restarts.as_ref());
                update_field("restart_weights", &mut p.restart_weights, train.restart_weights.as_ref());
                update_field("clear_state", &mut p.clear_state, train.clear_state.as_ref());
                update_field("lr_gamma", &mut p.gamma, train.lr_gamma.as_ref());
            }
            LrPolicy::MultiStep(p) => {
                update_milestones(&mut p.milestones, train.lr_steps.as_ref())?;
                update_field("lr_gamma", &mut p.gamma, train.lr_gamma.as_ref());
            }
            LrPolicy::MultiStepRestart(p) => {
                update_milestones(&mut p.milestones, train.lr_steps.as_ref())?;
                update_field("restarts", &mut p.restarts, train.restarts.as_ref());
                update_field("restart_weights", &mut p.restart_weights, train.restart_weights.as_ref());
                update_field("clear_state", &mut p.clear_state, train.clear_state.as_ref());
                update_field("lr_gamma", &mut p.gamma, train.lr_gamma.as_ref());
            }
            LrPolicy::CosineRestart(p) => {
                update_field("T_period", &mut p.periods, train.lr_periods.as_ref());
                update_field("restarts", &mut p.restarts, train.restarts.as_ref());
                update_field("restart_weights", &mut p.restart_weights, train.restart_weights.as_ref());
                update_field("clear_state", &mut p.clear_state, train.clear_state.as_ref());
                update_field("eta_min", &mut p.eta_min, train.eta_min.as_ref());
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::training::optimizer::AdamWConfig;
    use candle_core::{DType, Device, Var};

    fn optimizer(lr: f64) -> AdamW {
        let var = Var::zeros(4, DType::F32, &Device::Cpu).unwrap();
        AdamW::new(
            vec![("w".to_string(), var)],
            AdamWConfig {
                lr,
                ..Default::default()
            },
        )
    }

    fn run(scheduler: &mut LrScheduler, opt: &mut AdamW, steps: usize) -> Vec<f64> {
        (0..steps)
            .map(|_| {
                scheduler.step(opt);
                opt.learning_rates()[0]
            })
            .collect()
    }

    #[test]
    fn test_step_decay() {
        let mut opt = optimizer(1.0);
        let mut scheduler = LrScheduler::new(
            LrPolicy::Step(StepLr {
                step_size: 2,
                gamma: 0.5,
            }),
            &mut opt,
        );

        assert_eq!(opt.learning_rates(), vec![1.0]);
        assert_eq!(run(&mut scheduler, &mut opt, 5), vec![1.0, 0.5, 0.5, 0.25, 0.25]);
        assert_eq!(scheduler.last_epoch, 5);
        assert_eq!(scheduler.last_lr(), &[0.25]);
    }

    #[test]
    fn test_multistep_decay() {
        let mut opt = optimizer(1.0);
        let mut scheduler = LrScheduler::new(
            LrPolicy::MultiStep(MultiStepLr {
                milestones: vec![2, 4],
                gamma: 0.1,
            }),
            &mut opt,
        );

        let lrs = run(&mut scheduler, &mut opt, 5);
        let expected = [1.0, 0.1, 0.1, 0.01, 0.01];
        for (lr, want) in lrs.iter().zip(expected) {
            assert!((lr - want).abs() < 1e-12, "{} != {}", lr, want);
        }
    }

    #[test]
    fn test_multistep_restart() {
        let mut opt = optimizer(1.0);
        let mut scheduler = LrScheduler::new(
            LrPolicy::MultiStepRestart(MultiStepLrRestart {
                milestones: vec![2, 5, 6],
                restarts: vec![4],
                restart_weights: vec![0.5],
                gamma: 0.5,
                clear_state: false,
            }),
            &mut opt,
        );

        // 1: 1.0, 2: 0.5 (milestone), 3: 0.5, 4: 0.5 (restart, weight .5),
        // 5: 0.25, 6: 0.125
        assert_eq!(
            run(&mut scheduler, &mut opt, 6),
            vec![1.0, 0.5, 0.5, 0.5, 0.25, 0.125]
        );
    }

    #[test]
    fn test_step_restart_switches_step_size() {
        let mut opt = optimizer(1.0);
        let mut scheduler = LrScheduler::new(
            LrPolicy::StepRestart(StepLrRestart {
                step_sizes: vec![2, 3],
                restarts: vec![4],
                restart_weights: vec![1.0],
                gamma: 0.5,
                clear_state: false,
            }),
            &mut opt,
        );

        // segment 0 decays every 2; after restart at 4 decays every 3
        assert_eq!(
            run(&mut scheduler, &mut opt, 7),
            vec![1.0, 0.5, 0.5, 1.0, 1.0, 1.0, 0.5]
        );
    }

    #[test]
    fn test_cosine_restart() {
        let mut opt = optimizer(1.0);
        let mut scheduler = LrScheduler::new(
            LrPolicy::CosineRestart(CosineRestartLr {
                periods: vec![4],
                restarts: vec![4],
                restart_weights: vec![0.5],
                eta_min: 0.0,
                clear_state: false,
            }),
            &mut opt,
        );

        let lrs = run(&mut scheduler, &mut opt, 6);
        assert!((lrs[1] - 0.5).abs() < 1e-12);
        assert!((lrs[3] - 0.5).abs() < 1e-12);
        assert!(lrs[4] < lrs[3]);
        assert!(lrs.iter().all(|lr| *lr <= 1.0 + 1e-12));
    }

    #[test]
    fn test_restart_clears_optimizer_state() -> candle_core::Result<()> {
        let var = Var::ones(3, DType::F32, &Device::Cpu)?;
        let mut opt = AdamW::new(vec![("w".to_string(), var.clone())], AdamWConfig::default());
        let mut scheduler = LrScheduler::new(
            LrPolicy::MultiStepRestart(MultiStepLrRestart {
                milestones: vec![],
                restarts: vec![2],
                restart_weights: vec![1.0],
                gamma: 0.5,
                clear_state: true,
            }),
            &mut opt,
        );

        opt.backward_step(&var.as_tensor().sum_all()?)?;
        scheduler.step(&mut opt);
        assert!(opt.param_state("w").is_some());
        scheduler.step(&mut opt);
        assert!(opt.param_state("w").is_none());

        Ok(())
    }

    #[test]
    fn test_from_options() {
        let mut opt = optimizer(2e-4);
        let train = TrainOptions {
            lr_scheme: LrScheme::Step,
            lr_step_size: Some(10),
            lr_gamma: Some(0.1),
            ..Default::default()
        };

        let scheduler = LrScheduler::from_options(&train, &mut opt).unwrap();
        assert_eq!(
            scheduler.policy,
            LrPolicy::Step(StepLr {
                step_size: 10,
                gamma: 0.1
            })
        );
        assert_eq!(scheduler.last_lr(), &[2e-4]);
    }

    #[test]
    fn test_reconfigure_updates_changed_values() {
        let mut opt = optimizer(1.0);
        let mut scheduler = LrScheduler::new(
            LrPolicy::MultiStepRestart(MultiStepLrRestart {
                milestones: vec![10, 20],
                restarts: vec![],
                restart_weights: vec![],
                gamma: 0.5,
                clear_state: false,
            }),
            &mut opt,
        );

        let train = TrainOptions {
            lr_scheme: LrScheme::MultiStepRestart,
            lr_steps: Some(vec![5, 15, 25]),
            lr_gamma: None,
            restarts: Some(vec![12]),
            restart_weights: Some(vec![0.8]),
            ..Default::default()
        };
        scheduler.reconfigure(&train).unwrap();

        let LrPolicy::MultiStepRestart(p) = &scheduler.policy else {
            panic!("policy kind changed");
        };
        assert_eq!(p.milestones, vec![5, 15, 25]);
        assert_eq!(p.restarts, vec![12]);
        assert_eq!(p.restart_weights, vec![0.8]);
        assert_eq!(p.gamma, 0.5);
    }

    #[test]
    fn test_reconfigure_step() {
        let mut opt = optimizer(1.0);
        let mut scheduler = LrScheduler::new(
            LrPolicy::Step(StepLr {
                step_size: 10,
                gamma: 0.5,
            }),
            &mut opt,
        );

        let train = TrainOptions {
            lr_scheme: LrScheme::Step,
            lr_step_size: Some(2),
            lr_gamma: Some(0.1),
            ..Default::default()
        };
        scheduler.reconfigure(&train).unwrap();
        assert_eq!(
            scheduler.policy,
            LrPolicy::Step(StepLr {
                step_size: 2,
                gamma: 0.1
            })
        );

        let lrs = run(&mut scheduler, &mut opt, 2);
        assert!((lrs[1] - 0.1).abs() < 1e-12);
    }

    #[test]
    fn test_reconfigure_step_restart() {
        let mut opt = optimizer(1.0);
        let mut scheduler = LrScheduler::new(
            LrPolicy::StepRestart(StepLrRestart {
                step_sizes: vec![10],
                restarts: vec![],
                restart_weights: vec![],
                gamma: 0.5,
                clear_state: false,
            }),
            &mut opt,
        );

        let train = TrainOptions {
            lr_scheme: LrScheme::StepRestart,
            lr_step_sizes: Some(vec![4, 6]),
            restarts: Some(vec![8]),
            restart_weights: Some(vec![0.5]),
            clear_state: Some(true),
            lr_gamma: None,
            ..Default::default()
        };
        scheduler.reconfigure(&train).unwrap();
        assert_eq!(
            scheduler.policy,
            LrPolicy::StepRestart(StepLrRestart {
                step_sizes: vec![4, 6],
                restarts: vec![8],
                restart_weights: vec![0.5],
                gamma: 0.5,
                clear_state: true,
            })
        );
    }

    #[test]
    fn test_reconfigure_rejects_unsorted_milestones() {
        let mut opt = optimizer(1.0);
        let mut scheduler = LrScheduler::new(
            LrPolicy::MultiStep(MultiStepLr {
                milestones: vec![10, 20],
                gamma: 0.5,
            }),
            &mut opt,
        );

        let train = TrainOptions {
            lr_scheme: LrScheme::MultiStep,
            lr_steps: Some(vec![30, 10]),
            ..Default::default()
        };

        assert!(matches!(
            scheduler.reconfigure(&train),
            Err(LifecycleError::Config(_))
        ));
        let LrPolicy::MultiStep(p) = &scheduler.policy else {
            panic!("policy kind changed");
        };
        assert_eq!(p.milestones, vec![10, 20]);
    }

    #[test]
    fn test_reconfigure_ignores_other_scheme() {
        let mut opt = optimizer(1.0);
        let policy = LrPolicy::Step(StepLr {
            step_size: 3,
            gamma: 0.5,
        });
        let mut scheduler = LrScheduler::new(policy.clone(), &mut opt);

        let train = TrainOptions {
            lr_scheme: LrScheme::MultiStep,
            lr_gamma: Some(0.9),
            ..Default::default()
        };
        scheduler.reconfigure(&train).unwrap();
        assert_eq!(scheduler.policy, policy);
    }

    #[test]
    fn test_load_state_dict_checks_kind() {
        let mut opt = optimizer(1.0);
        let mut step = LrScheduler::new(
            LrPolicy::Step(StepLr {
                step_size: 3,
                gamma: 0.5,
            }),
            &mut opt,
        );
        let multi = LrScheduler::new(
            LrPolicy::MultiStep(MultiStepLr {
                milestones: vec![1],
                gamma: 0.5,
            }),
            &mut opt,
        );

        assert!(step.load_state_dict(&multi).is_err());

        let mut saved = step.state_dict();
        saved.last_epoch = 7;
        step.load_state_dict(&saved).unwrap();
        assert_eq!(step.last_epoch, 7);
    }

    #[test]
    fn test_policy_serde_tag() {
        let policy = LrPolicy::MultiStep(MultiStepLr {
            milestones: vec![1, 2],
            gamma: 0.5,
        });
        let json = serde_json::to_value(&policy).unwrap();
        assert_eq!(json["kind"], "MultiStepLR");

        let back: LrPolicy = serde_json::from_value(json).unwrap();
        assert_eq!(back, policy);
    }
}
