/// AdamW optimizer with parameter groups
///
/// Adam with decoupled weight decay. Each parameter group carries its own
/// hyperparameters plus the `initial_lr` schedulers and warmup scale from.
/// Moment state is keyed by parameter name so it survives a checkpoint
/// round-trip into a freshly built network.
use std::collections::BTreeMap;

use candle_core::backprop::GradStore;
use candle_core::{Tensor, Var};
use serde::{Deserialize, Serialize};

use crate::{LifecycleError, Result};

/// AdamW optimizer configuration
#[derive(Debug, Clone)]
pub struct AdamWConfig {
    /// Learning rate
    pub lr: f64,
    /// Coefficient for computing running averages of gradient (beta1)
    pub beta1: f64,
    /// Coefficient for computing running averages of squared gradient (beta2)
    pub beta2: f64,
    /// Term added to denominator for numerical stability
    pub eps: f64,
    /// Weight decay coefficient
    pub weight_decay: f64,
}

impl Default for AdamWConfig {
    fn default() -> Self {
        Self {
            lr: 1e-3,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 0.01,
        }
    }
}

/// A group of parameters sharing hyperparameters
#[derive(Debug, Clone)]
pub struct ParamGroup {
    pub params: Vec<(String, Var)>,
    /// Learning rate used by the next step
    pub lr: f64,
    /// Learning rate the group was created with
    pub initial_lr: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
    pub weight_decay: f64,
}

impl ParamGroup {
    fn new(params: Vec<(String, Var)>, config: &AdamWConfig) -> Self {
        Self {
            params,
            lr: config.lr,
            initial_lr: config.lr,
            beta1: config.beta1,
            beta2: config.beta2,
            eps: config.eps,
            weight_decay: config.weight_decay,
        }
    }

    fn to_state(&self) -> ParamGroupState {
        ParamGroupState {
            params: self.params.iter().map(|(name, _)| name.clone()).collect(),
            lr: self.lr,
            initial_lr: self.initial_lr,
            beta1: self.beta1,
            beta2: self.beta2,
            eps: self.eps,
            weight_decay: self.weight_decay,
        }
    }
}

/// Serializable view of a parameter group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamGroupState {
    pub params: Vec<String>,
    pub lr: f64,
    pub initial_lr: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
    pub weight_decay: f64,
}

/// Per-parameter moment state
#[derive(Debug, Clone)]
pub struct ParamState {
    /// Number of updates applied to this parameter
    pub step: usize,
    /// First moment estimate (exponential moving average of gradients)
    pub exp_avg: Tensor,
    /// Second moment estimate (exponential moving average of squared gradients)
    pub exp_avg_sq: Tensor,
}

/// Snapshot of an optimizer, as saved in a training state
#[derive(Debug, Clone)]
pub struct OptimizerState {
    pub param_groups: Vec<ParamGroupState>,
    pub state: BTreeMap<String, ParamState>,
}

/// AdamW optimizer
///
/// Implements Adam with decoupled weight decay as described in
/// "Decoupled Weight Decay Regularization" (Loshchilov & Hutter, 2019)
#[derive(Debug)]
pub struct AdamW {
    groups: Vec<ParamGroup>,
    states: BTreeMap<String, ParamState>,
}

impl AdamW {
    /// Create new AdamW optimizer with a single parameter group
    pub fn new(params: Vec<(String, Var)>, config: AdamWConfig) -> Self {
        Self {
            groups: vec![ParamGroup::new(params, &config)],
            states: BTreeMap::new(),
        }
    }

    /// Add another parameter group with its own hyperparameters
    pub fn add_param_group(&mut self, params: Vec<(String, Var)>, config: AdamWConfig) {
        self.groups.push(ParamGroup::new(params, &config));
    }

    /// Compute gradients of `loss` and apply one update
    pub fn backward_step(&mut self, loss: &Tensor) -> candle_core::Result<()> {
        let grads = loss.backward()?;
        self.step(&grads)
    }

    /// Perform a single optimization step
    ///
    /// Parameters without a gradient in `grads` are left untouched, which is
    /// how frozen parameters are skipped.
    pub fn step(&mut self, grads: &GradStore) -> candle_core::Result<()> {
        for group in &self.groups {
            for (name, var) in &group.params {
                let Some(grad) = grads.get(var.as_tensor()) else {
                    continue;
                };

                if !self.states.contains_key(name) {
                    let zeros = var.as_tensor().zeros_like()?;
                    self.states.insert(
                        name.clone(),
                        ParamState {
                            step: 0,
                            exp_avg: zeros.clone(),
                            exp_avg_sq: zeros,
                        },
                    );
                }
                let Some(state) = self.states.get_mut(name) else {
                    continue;
                };

                state.step += 1;

                // m = beta1 * m + (1 - beta1) * grad
                state.exp_avg = ((&state.exp_avg * group.beta1)? + (grad * (1.0 - group.beta1))?)?;

                // v = beta2 * v + (1 - beta2) * grad^2
                state.exp_avg_sq =
                    ((&state.exp_avg_sq * group.beta2)? + (grad.sqr()? * (1.0 - group.beta2))?)?;

                let beta1_t = group.beta1.powi(state.step as i32);
                let m_hat = (&state.exp_avg / (1.0 - beta1_t))?;

                let beta2_t = group.beta2.powi(state.step as i32);
                let v_hat = (&state.exp_avg_sq / (1.0 - beta2_t))?;

                let update = ((m_hat / (v_hat.sqrt()? + group.eps)?)? * group.lr)?;

                let decayed = if group.weight_decay > 0.0 {
                    (var.as_tensor() * (1.0 - group.lr * group.weight_decay))?
                } else {
                    var.as_tensor().clone()
                };

                var.set(&(decayed - update)?)?;
            }
        }

        Ok(())
    }

    /// Drop all moment state, as a restart with `clear_state` does
    pub fn clear_state(&mut self) {
        self.states.clear();
    }

    /// Parameter groups
    pub fn param_groups(&self) -> &[ParamGroup] {
        &self.groups
    }

    /// Mutable parameter groups
    pub fn param_groups_mut(&mut self) -> &mut [ParamGroup] {
        &mut self.groups
    }

    /// Learning rate of every group
    pub fn learning_rates(&self) -> Vec<f64> {
        self.groups.iter().map(|g| g.lr).collect()
    }

    /// Initial learning rate of every group
    pub fn initial_lrs(&self) -> Vec<f64> {
        self.groups.iter().map(|g| g.initial_lr).collect()
    }

    /// Overwrite group learning rates; extra values are ignored
    pub fn set_learning_rates(&mut self, lrs: &[f64]) {
        for (group, lr) in self.groups.iter_mut().zip(lrs) {
            group.lr = *lr;
        }
    }

    /// Moment state of one parameter, if it has been updated
    pub fn param_state(&self, name: &str) -> Option<&ParamState> {
        self.states.get(name)
    }

    /// Snapshot hyperparameters and moment state
    pub fn state_dict(&self) -> OptimizerState {
        OptimizerState {
            param_groups: self.groups.iter().map(ParamGroup::to_state).collect(),
            state: self.states.clone(),
        }
    }

    /// Restore a snapshot taken with [`AdamW::state_dict`]
    ///
    /// Group layout must match: same number of groups, same parameter
    /// names in each. Moments are moved onto the owning parameter's device
    /// and dtype.
    pub fn load_state_dict(&mut self, saved: &OptimizerState) -> Result<()> {
        if saved.param_groups.len() != self.groups.len() {
            return Err(LifecycleError::StateMismatch {
                what: "param_groups",
                expected: self.groups.len(),
                found: saved.param_groups.len(),
            });
        }

        for (group, saved_group) in self.groups.iter().zip(&saved.param_groups) {
            let names: Vec<&str> = group.params.iter().map(|(n, _)| n.as_str()).collect();
            if names != saved_group.params.iter().map(String::as_str).collect::<Vec<_>>() {
                return Err(LifecycleError::Training(format!(
                    "loaded state dict has a group with parameters {:?}, expected {:?}",
                    saved_group.params, names
                )));
            }
        }

        let mut states = BTreeMap::new();
        for (name, saved_state) in &saved.state {
            let var = self
                .groups
                .iter()
                .flat_map(|g| g.params.iter())
                .find(|(n, _)| n == name)
                .map(|(_, v)| v)
                .ok_or_else(|| {
                    LifecycleError::Training(format!(
                        "optimizer state references unknown parameter '{}'",
                        name
                    ))
                })?;
            let target = var.as_tensor();
            let place = |t: &Tensor| -> candle_core::Result<Tensor> {
                t.to_device(target.device())?.to_dtype(target.dtype())
            };
            states.insert(
                name.clone(),
                ParamState {
                    step: saved_state.step,
                    exp_avg: place(&saved_state.exp_avg)?,
                    exp_avg_sq: place(&saved_state.exp_avg_sq)?,
                },
            );
        }

        for (group, saved_group) in self.groups.iter_mut().zip(&saved.param_groups) {
            group.lr = saved_group.lr;
            group.initial_lr = saved_group.initial_lr;
            group.beta1 = saved_group.beta1;
            group.beta2 = saved_group.beta2;
            group.eps = saved_group.eps;
            group.weight_decay = saved_group.weight_decay;
        }
        self.states = states;

        Ok(())
    }
}
