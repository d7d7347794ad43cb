/// Trainable networks and the model base built on top of them
///
/// A [`Network`] is the parameter container of one architecture: a candle
/// `VarMap` keyed by dotted parameter names, plus the set of parameters
/// currently frozen. Architectures themselves live outside this crate and
/// are built through [`Network::var_builder`].
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;

use candle_core::backprop::GradStore;
use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{VarBuilder, VarMap};

use crate::training::checkpoint::{StateDict, StateDictSource};
use crate::{LifecycleError, Result};

pub mod base;
pub mod loader;

/// Role of a network in the GAN pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetType {
    Generator,
    Discriminator,
}

impl std::fmt::Display for NetType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Generator => f.write_str("G"),
            Self::Discriminator => f.write_str("D"),
        }
    }
}

/// Outcome of loading a state dict into a network
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    /// Parameters that received a value
    pub loaded: Vec<String>,
    /// Network parameters with no entry in the state dict
    pub missing: Vec<String>,
    /// State dict entries with no matching parameter
    pub unexpected: Vec<String>,
}

/// Parameter container for one network
pub struct Network {
    label: String,
    net_type: NetType,
    varmap: VarMap,
    frozen: BTreeSet<String>,
}

impl std::fmt::Debug for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<String> = self
            .varmap
            .data()
            .lock()
            .map(|vars| vars.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        f.debug_struct("Network")
            .field("label", &self.label)
            .field("net_type", &self.net_type)
            .field("parameters", &names)
            .field("frozen", &self.frozen)
            .finish()
    }
}

impl Network {
    /// Wrap the variables of an already-built architecture
    pub fn new(label: impl Into<String>, net_type: NetType, varmap: VarMap) -> Self {
        Self {
            label: label.into(),
            net_type,
            varmap,
            frozen: BTreeSet::new(),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn net_type(&self) -> NetType {
        self.net_type
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    /// Builder that registers new parameters in this network
    pub fn var_builder(&self, dtype: DType, device: &Device) -> VarBuilder<'_> {
        VarBuilder::from_varmap(&self.varmap, dtype, device)
    }

    /// All parameters, sorted by name
    pub fn named_parameters(&self) -> Result<Vec<(String, Var)>> {
        let data = self
            .varmap
            .data()
            .lock()
            .map_err(|e| LifecycleError::Model(format!("parameter store poisoned: {}", e)))?;
        let mut params: Vec<(String, Var)> = data
            .iter()
            .map(|(name, var)| (name.clone(), var.clone()))
            .collect();
        params.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(params)
    }

    /// Parameters that currently receive gradient updates
    pub fn trainable_parameters(&self) -> Result<Vec<(String, Var)>> {
        Ok(self
            .named_parameters()?
            .into_iter()
            .filter(|(name, _)| !self.frozen.contains(name))
            .collect())
    }

    pub fn is_trainable(&self, name: &str) -> bool {
        !self.frozen.contains(name)
    }

    /// Name fragment selecting `target_layer` for a parameter called `name`
    ///
    /// Discriminator names follow one of three layouts: `features.N.` (VGG),
    /// `convN.` (VGG feature extractor) and `model.N.` (patch). Names in
    /// none of these layouts are never matched.
    fn layer_pattern(&self, name: &str, target_layer: &str) -> Option<String> {
        match self.net_type {
            NetType::Discriminator => {
                if name.contains("features.") {
                    Some(format!("features.{}.", target_layer))
                } else if name.contains("conv") {
                    Some(format!("conv{}.", target_layer))
                } else if name.contains("model.") {
                    Some(format!("model.{}.", target_layer))
                } else {
                    None
                }
            }
            NetType::Generator => Some(format!("{}.", target_layer)),
        }
    }

    /// Enable or disable gradient flow
    ///
    /// With no `target_layer` every parameter is toggled. Otherwise only
    /// parameters whose name contains the layer pattern are. Returns the
    /// names that were toggled.
    pub fn requires_grad(&mut self, flag: bool, target_layer: Option<&str>) -> Result<Vec<String>> {
        let mut toggled = Vec::new();
        for (name, _) in self.named_parameters()? {
            let selected = match target_layer {
                None => true,
                Some(layer) => self
                    .layer_pattern(&name, layer)
                    .is_some_and(|pattern| name.contains(&pattern)),
            };
            if !selected {
                continue;
            }
            if flag {
                self.frozen.remove(&name);
            } else {
                self.frozen.insert(name.clone());
            }
            toggled.push(name);
        }
        log::debug!(
            "{} requires_grad={} on {} parameters of {}",
            if flag { "Enabled" } else { "Disabled" },
            flag,
            toggled.len(),
            self.label
        );
        Ok(toggled)
    }

    /// Drop gradients of frozen parameters so the optimizer skips them
    pub fn filter_grads(&self, grads: &mut GradStore) -> Result<()> {
        for (name, var) in self.named_parameters()? {
            if self.frozen.contains(&name) {
                grads.remove(var.as_tensor());
            }
        }
        Ok(())
    }

    /// Total number of scalar parameters
    pub fn parameter_count(&self) -> Result<usize> {
        Ok(self
            .named_parameters()?
            .iter()
            .map(|(_, var)| crate::utils::count_parameters(var.as_tensor()))
            .sum())
    }

    /// Printable parameter listing and total parameter count
    pub fn description(&self) -> Result<(String, usize)> {
        let params = self.named_parameters()?;
        let mut text = format!("{} ({:?})\n", self.label, self.net_type);
        let mut total = 0;
        for (name, var) in &params {
            let count = crate::utils::count_parameters(var.as_tensor());
            total += count;
            let _ = writeln!(
                text,
                "  {}: {:?} {:?}{}",
                name,
                var.dims(),
                var.dtype(),
                if self.frozen.contains(name) { " (frozen)" } else { "" }
            );
        }
        Ok((text, total))
    }

    /// Copy `state` into the network or into one of its submodules
    ///
    /// `submodule` names a parameter prefix; `None` or `"none"` targets the
    /// whole network. Shapes must always agree. In strict mode the key sets
    /// must match exactly; otherwise the intersection is loaded and the rest
    /// is reported.
    pub fn load_state_dict(
        &self,
        state: &StateDict,
        submodule: Option<&str>,
        strict: bool,
    ) -> Result<LoadReport> {
        let prefix = match submodule {
            Some(name) if !name.eq_ignore_ascii_case("none") => format!("{}.", name),
            _ => String::new(),
        };

        let targets: BTreeMap<String, Var> = self
            .named_parameters()?
            .into_iter()
            .filter_map(|(name, var)| name.strip_prefix(&prefix).map(|key| (key.to_string(), var)))
            .collect();
        if targets.is_empty() {
            return Err(LifecycleError::Model(format!(
                "{} has no parameters under '{}'",
                self.label, prefix
            )));
        }

        let mut report = LoadReport::default();
        let mut pending = Vec::new();
        for (key, var) in &targets {
            match state.get(key) {
                Some(tensor) => {
                    if tensor.dims() != var.dims() {
                        return Err(LifecycleError::Model(format!(
                            "size mismatch for {}{}: checkpoint {:?}, network {:?}",
                            prefix,
                            key,
                            tensor.dims(),
                            var.dims()
                        )));
                    }
                    pending.push((key, var, tensor));
                }
                None => report.missing.push(key.clone()),
            }
        }
        report.unexpected = state
            .keys()
            .filter(|key| !targets.contains_key(*key))
            .cloned()
            .collect();

        if strict && (!report.missing.is_empty() || !report.unexpected.is_empty()) {
            return Err(LifecycleError::Model(format!(
                "error loading state dict into {}: missing keys {:?}, unexpected keys {:?}",
                self.label, report.missing, report.unexpected
            )));
        }
        if !report.missing.is_empty() {
            log::warn!("{}: no checkpoint value for {:?}", self.label, report.missing);
        }
        if !report.unexpected.is_empty() {
            log::warn!("{}: ignoring checkpoint keys {:?}", self.label, report.unexpected);
        }

        for (key, var, tensor) in pending {
            // copy: a Var refuses to be set from its own storage
            let value = tensor.to_dtype(var.dtype())?.to_device(var.device())?.copy()?;
            var.set(&value)?;
            report.loaded.push(key.clone());
        }

        Ok(report)
    }
}

impl StateDictSource for Network {
    fn state_dict(&self) -> Result<StateDict> {
        Ok(self
            .named_parameters()?
            .into_iter()
            // copy: the live tensor is overwritten in place by optimizer steps
            .map(|(name, var)| Ok((name, var.as_tensor().copy()?)))
            .collect::<candle_core::Result<StateDict>>()?)
    }
}

/// Build a network from explicit named tensors
///
/// Mostly useful for tests and adapters; architectures normally register
/// their parameters through [`Network::var_builder`].
pub fn network_from_tensors(
    label: &str,
    net_type: NetType,
    tensors: impl IntoIterator<Item = (String, Tensor)>,
) -> Result<Network> {
    let varmap = VarMap::new();
    {
        let mut data = varmap
            .data()
            .lock()
            .map_err(|e| LifecycleError::Model(format!("parameter store poisoned: {}", e)))?;
        for (name, tensor) in tensors {
            data.insert(name, Var::from_tensor(&tensor)?);
        }
    }
    Ok(Network::new(label, net_type, varmap))
}
