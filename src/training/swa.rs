/// Stochastic Weight Averaging
///
/// Keeps an equal-weight running average of the generator's parameters once
/// training enters the SWA regime, together with the scheduler that anneals
/// the generator optimizer toward a constant SWA learning rate.
use std::collections::BTreeMap;
use std::f64::consts::PI;

use candle_core::Tensor;
use serde::{Deserialize, Serialize};

use super::checkpoint::{StateDict, StateDictSource};
use super::optimizer::AdamW;
use crate::config::AnnealStrategy;
use crate::models::Network;
use crate::{LifecycleError, Result};

/// Averaged copy of a network's parameters
///
/// After `n` updates each shadow tensor is the arithmetic mean of the `n`
/// parameter values it has seen.
#[derive(Debug, Default)]
pub struct SwaModel {
    averaged: BTreeMap<String, Tensor>,
    n_averaged: usize,
}

impl SwaModel {
    /// Create an empty average
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold the current parameters of `network` into the average
    pub fn update_parameters(&mut self, network: &Network) -> Result<()> {
        let n = self.n_averaged as f64;
        for (name, var) in network.named_parameters()? {
            let param = var.as_tensor().copy()?.detach();
            let updated = match self.averaged.get(&name) {
                // avg += (param - avg) / (n + 1)
                Some(avg) if self.n_averaged > 0 => (avg + ((param - avg)? / (n + 1.0))?)?,
                _ => param,
            };
            self.averaged.insert(name, updated);
        }
        self.n_averaged += 1;
        Ok(())
    }

    /// Number of parameter snapshots averaged so far
    pub fn n_averaged(&self) -> usize {
        self.n_averaged
    }

    /// Averaged value of one parameter
    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.averaged.get(name)
    }

    /// Copy the averaged parameters into `network`
    ///
    /// Parameters the average has not seen are left untouched.
    pub fn copy_to(&self, network: &Network) -> Result<()> {
        for (name, var) in network.named_parameters()? {
            if let Some(avg) = self.averaged.get(&name) {
                var.set(&avg.to_dtype(var.dtype())?.to_device(var.device())?)?;
            }
        }
        Ok(())
    }

    /// Restore an average written by [`StateDictSource::state_dict`]
    pub fn load_state_dict(&mut self, state: StateDict, n_averaged: usize) -> Result<()> {
        if n_averaged == 0 && !state.is_empty() {
            return Err(LifecycleError::Checkpoint(
                "averaged weights present but n_averaged is 0".to_string(),
            ));
        }
        self.averaged = state;
        self.n_averaged = n_averaged;
        Ok(())
    }
}

impl StateDictSource for SwaModel {
    fn state_dict(&self) -> Result<StateDict> {
        Ok(self.averaged.clone())
    }
}

/// Scheduler used while the generator is in the SWA regime
///
/// On its first step it records the generator optimizer's group rates,
/// then anneals each of them toward `swa_lr` over `anneal_epochs` steps
/// and holds `swa_lr` from then on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwaLr {
    pub swa_lr: f64,
    pub anneal_epochs: usize,
    pub strategy: AnnealStrategy,
    /// Steps taken since SWA started
    pub step_count: usize,
    /// Group learning rates when annealing began
    pub anneal_start: Vec<f64>,
    pub last_lr: Vec<f64>,
}

impl SwaLr {
    pub fn new(swa_lr: f64, anneal_epochs: usize, strategy: AnnealStrategy) -> Self {
        Self {
            swa_lr,
            anneal_epochs,
            strategy,
            step_count: 0,
            anneal_start: Vec::new(),
            last_lr: Vec::new(),
        }
    }

    fn alpha(&self) -> f64 {
        let t = if self.anneal_epochs == 0 {
            1.0
        } else {
            (self.step_count as f64 / self.anneal_epochs as f64).min(1.0)
        };
        match self.strategy {
            AnnealStrategy::Cos => (1.0 - (PI * t).cos()) / 2.0,
            AnnealStrategy::Linear => t,
        }
    }

    /// Advance one iteration and update `optimizer`'s group learning rates
    pub fn step(&mut self, optimizer: &mut AdamW) {
        if self.step_count == 0 || self.anneal_start.len() != optimizer.param_groups().len() {
            self.anneal_start = optimizer.learning_rates();
        }
        self.step_count += 1;

        let alpha = self.alpha();
        let lrs: Vec<f64> = self
            .anneal_start
            .iter()
            .map(|start| self.swa_lr * alpha + start * (1.0 - alpha))
            .collect();
        optimizer.set_learning_rates(&lrs);
        self.last_lr = lrs;
    }

    /// Learning rates computed by the last step
    pub fn last_lr(&self) -> &[f64] {
        &self.last_lr
    }

    pub fn state_dict(&self) -> SwaLr {
        self.clone()
    }

    pub fn load_state_dict(&mut self, saved: &SwaLr) {
        *self = saved.clone();
    }
}

/// SWA model and scheduler, present when SWA is enabled
#[derive(Debug)]
pub struct SwaState {
    pub model: SwaModel,
    pub scheduler: SwaLr,
}
