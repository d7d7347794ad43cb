/// Training-state snapshots for resuming a run
///
/// A snapshot bundles the epoch and iteration counters with every optimizer,
/// every scheduler and the SWA scheduler, and is written as a single file.
/// Optimizer moments travel as tensors named
/// `optimizers.{i}.{param}.exp_avg` / `.exp_avg_sq`; everything else is a
/// JSON header stored in the file's metadata.
use std::collections::BTreeMap;
use std::path::Path;

use candle_core::Device;
use serde::{Deserialize, Serialize};

use super::checkpoint::{self, Format, Metadata, StateDict};
use super::optimizer::{OptimizerState, ParamGroupState, ParamState};
use super::scheduler::LrScheduler;
use super::swa::SwaLr;
use crate::{LifecycleError, Result};

const HEADER_KEY: &str = "training_state";

/// Everything needed to resume optimizers and schedulers
#[derive(Debug, Clone)]
pub struct TrainingState {
    pub epoch: usize,
    pub iter: usize,
    pub optimizers: Vec<OptimizerState>,
    pub schedulers: Vec<LrScheduler>,
    /// `None` when the run does not use SWA; empty until SWA has started
    pub swa_scheduler: Option<Vec<SwaLr>>,
}

#[derive(Serialize, Deserialize)]
struct OptimizerHeader {
    param_groups: Vec<ParamGroupState>,
    steps: BTreeMap<String, usize>,
}

#[derive(Serialize, Deserialize)]
struct Header {
    epoch: usize,
    iter: usize,
    optimizers: Vec<OptimizerHeader>,
    schedulers: Vec<LrScheduler>,
    #[serde(default)]
    swa_scheduler: Option<Vec<SwaLr>>,
}

fn moment_key(index: usize, param: &str, moment: &str) -> String {
    format!("optimizers.{}.{}.{}", index, param, moment)
}

/// File name of a training-state snapshot
pub fn state_file_name(iter: usize, latest: bool) -> String {
    if latest {
        "latest.state".to_string()
    } else {
        format!("{}.state", iter)
    }
}

impl TrainingState {
    fn to_parts(&self) -> Result<(StateDict, Metadata)> {
        let mut tensors = StateDict::new();
        let mut optimizers = Vec::with_capacity(self.optimizers.len());

        for (i, optimizer) in self.optimizers.iter().enumerate() {
            let mut steps = BTreeMap::new();
            for (param, state) in &optimizer.state {
                steps.insert(param.clone(), state.step);
                tensors.insert(moment_key(i, param, "exp_avg"), state.exp_avg.clone());
                tensors.insert(moment_key(i, param, "exp_avg_sq"), state.exp_avg_sq.clone());
            }
            optimizers.push(OptimizerHeader {
                param_groups: optimizer.param_groups.clone(),
                steps,
            });
        }

        let header = Header {
            epoch: self.epoch,
            iter: self.iter,
            optimizers,
            schedulers: self.schedulers.clone(),
            swa_scheduler: self.swa_scheduler.clone(),
        };
        let mut metadata = Metadata::new();
        metadata.insert(HEADER_KEY.to_string(), serde_json::to_string(&header)?);

        Ok((tensors, metadata))
    }

    fn from_parts(mut tensors: StateDict, metadata: Option<Metadata>) -> Result<Self> {
        let header_json = metadata
            .as_ref()
            .and_then(|m| m.get(HEADER_KEY))
            .ok_or_else(|| LifecycleError::Checkpoint("training state header missing".to_string()))?;
        let header: Header = serde_json::from_str(header_json)?;

        let mut optimizers = Vec::with_capacity(header.optimizers.len());
        for (i, optimizer) in header.optimizers.into_iter().enumerate() {
            let mut state = BTreeMap::new();
            for (param, step) in optimizer.steps {
                let mut take = |moment: &str| {
                    let key = moment_key(i, &param, moment);
                    tensors.remove(&key).ok_or_else(|| {
                        LifecycleError::Checkpoint(format!("training state is missing tensor {}", key))
                    })
                };
                let exp_avg = take("exp_avg")?;
                let exp_avg_sq = take("exp_avg_sq")?;
                state.insert(
                    param,
                    ParamState {
                        step,
                        exp_avg,
                        exp_avg_sq,
                    },
                );
            }
            optimizers.push(OptimizerState {
                param_groups: optimizer.param_groups,
                state,
            });
        }

        Ok(Self {
            epoch: header.epoch,
            iter: header.iter,
            optimizers,
            schedulers: header.schedulers,
            swa_scheduler: header.swa_scheduler,
        })
    }

    /// Write the snapshot to `path`
    pub fn save(&self, path: &Path) -> Result<Format> {
        let (tensors, metadata) = self.to_parts()?;
        checkpoint::save_tensors(path, &tensors, Some(metadata))
    }

    /// Read a snapshot, placing optimizer moments on `device`
    pub fn load(path: &Path, device: &Device) -> Result<Self> {
        let (tensors, metadata) = checkpoint::load_tensors(path, device)?;
        let state = Self::from_parts(tensors, metadata)?;
        log::info!(
            "Loaded training state from {} (epoch {}, iter {})",
            path.display(),
            state.epoch,
            state.iter
        );
        Ok(state)
    }
}
