/// Weight loading from checkpoint files
use std::path::Path;

use candle_core::Device;

use super::{LoadReport, NetType, Network};
use crate::training::checkpoint::{self, StateDict};
use crate::{LifecycleError, Result};

/// Prefix added by distributed/data-parallel wrappers
const WRAPPER_PREFIX: &str = "module.";

/// Prefix of checkpoints that nest their weights under `state_dict`
const NESTED_PREFIX: &str = "state_dict.";

/// Model-specific validation or conversion of a loaded state dict
///
/// Runs after prefixes are stripped and before the weights are copied into
/// the network, e.g. to rename keys of an older architecture revision.
pub trait StateDictValidator {
    fn validate(&self, state: StateDict, model_type: NetType) -> Result<StateDict>;
}

/// How to load a checkpoint into a network
#[derive(Debug, Clone)]
pub struct LoadOptions<'a> {
    /// Require the checkpoint keys to match the target parameters exactly
    pub strict: bool,
    /// Load into the parameters under this prefix; `"none"` means the whole network
    pub submodule: Option<&'a str>,
    /// Run the validator for this model type
    pub model_type: Option<NetType>,
    /// Select the weights nested under this key
    pub param_key: Option<&'a str>,
}

impl Default for LoadOptions<'_> {
    fn default() -> Self {
        Self {
            strict: true,
            submodule: None,
            model_type: None,
            param_key: None,
        }
    }
}

fn strip_all(state: StateDict, prefix: &str) -> StateDict {
    state
        .into_iter()
        .map(|(key, value)| match key.strip_prefix(prefix) {
            Some(stripped) => (stripped.to_string(), value),
            None => (key, value),
        })
        .collect()
}

/// Normalize raw checkpoint keys before loading
///
/// Unwraps a `state_dict.` nesting, selects `param_key` if given, then strips
/// data-parallel `module.` prefixes.
pub fn prepare_state_dict(raw: StateDict, param_key: Option<&str>) -> Result<StateDict> {
    let mut state = raw;

    if !state.is_empty() && state.keys().all(|k| k.starts_with(NESTED_PREFIX)) {
        state = strip_all(state, NESTED_PREFIX);
    }

    if let Some(key) = param_key {
        let prefix = format!("{}.", key);
        let selected: StateDict = state
            .into_iter()
            .filter_map(|(k, v)| k.strip_prefix(&prefix).map(|s| (s.to_string(), v)))
            .collect();
        if selected.is_empty() {
            return Err(LifecycleError::Checkpoint(format!(
                "no weights under param key '{}'",
                key
            )));
        }
        state = selected;
    }

    Ok(strip_all(state, WRAPPER_PREFIX))
}

/// Load pretrained weights into an instantiated network
///
/// # Arguments
/// * `path` - Checkpoint file (compact or standard format)
/// * `network` - Target network
/// * `options` - Strictness, submodule, validation and key selection
/// * `validator` - Hook run when `options.model_type` is set
pub fn load_network<P: AsRef<Path>>(
    path: P,
    network: &Network,
    options: &LoadOptions<'_>,
    validator: Option<&dyn StateDictValidator>,
) -> Result<LoadReport> {
    let (raw, _) = checkpoint::load_tensors(path.as_ref(), &Device::Cpu)?;
    let mut state = prepare_state_dict(raw, options.param_key)?;

    match (options.model_type, validator) {
        (Some(model_type), Some(validator)) => {
            state = validator.validate(state, model_type)?;
        }
        (Some(model_type), None) => {
            log::warn!(
                "No state dict validator installed; loading {} weights for {} unchecked",
                model_type,
                network.label()
            );
        }
        (None, _) => {}
    }

    let report = network.load_state_dict(&state, options.submodule, options.strict)?;
    log::info!(
        "Loaded {} tensors into {} from {}",
        report.loaded.len(),
        network.label(),
        path.as_ref().display()
    );
    Ok(report)
}
