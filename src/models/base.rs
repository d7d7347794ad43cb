/// Lifecycle shared by every trainable GAN model
///
/// [`ModelBase`] owns the generator/discriminator networks, one optimizer and
/// one scheduler per network (index 0 is always the generator), and the
/// optional SWA state. Concrete models hold a `ModelBase` and implement
/// [`TrainableModel`] for their forward/backward logic.
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};

use super::loader::{self, LoadOptions, StateDictValidator};
use super::{LoadReport, Network};
use crate::config::{ModelOptions, TrainOptions};
use crate::training::checkpoint::{self, Metadata, StateDictSource};
use crate::training::optimizer::{AdamW, AdamWConfig};
use crate::training::scheduler::LrScheduler;
use crate::training::state::{state_file_name, TrainingState};
use crate::training::swa::{SwaLr, SwaModel, SwaState};
use crate::utils::warmup_lr;
use crate::{LifecycleError, Result};

const SWA_LABEL: &str = "swaG";
const N_AVERAGED_KEY: &str = "n_averaged";

/// Hooks a concrete model provides on top of [`ModelBase`]
pub trait TrainableModel {
    /// One training batch
    type Batch;

    fn base(&self) -> &ModelBase;
    fn base_mut(&mut self) -> &mut ModelBase;

    fn feed_data(&mut self, batch: Self::Batch) -> Result<()>;

    /// Forward, backward and optimizer steps for iteration `step`
    fn optimize_parameters(&mut self, step: usize) -> Result<()>;

    fn current_losses(&self) -> BTreeMap<String, f64>;

    fn current_visuals(&self) -> Result<BTreeMap<String, Tensor>>;

    /// Save generator, discriminator and SWA weights
    fn save(&self, iter: usize, latest: bool) -> Result<()> {
        let base = self.base();
        base.save_network(base.net_g(), "G", iter, latest)?;
        if let Some(net_d) = base.net_d() {
            base.save_network(net_d, "D", iter, latest)?;
        }
        base.save_swa_model(iter, latest)?;
        Ok(())
    }

    /// Load pretrained weights named in the options
    fn load(&mut self) -> Result<()>;
}

/// Networks, optimizers, schedulers and SWA state of a model
pub struct ModelBase {
    opt: ModelOptions,
    device: Device,
    is_train: bool,
    net_g: Network,
    net_d: Option<Network>,
    optimizers: Vec<AdamW>,
    schedulers: Vec<LrScheduler>,
    swa: Option<SwaState>,
    swa_start_iter: Option<usize>,
    validator: Option<Box<dyn StateDictValidator>>,
}

/// Parameters handed to an optimizer; frozen ones are reported and left out
fn optimizer_params(network: &Network) -> Result<Vec<(String, candle_core::Var)>> {
    let mut params = Vec::new();
    for (name, var) in network.named_parameters()? {
        if network.is_trainable(&name) {
            params.push((name, var));
        } else {
            log::warn!("Params [{}] will not be optimized.", name);
        }
    }
    Ok(params)
}

impl ModelBase {
    /// Create the base; in training mode this builds optimizers, schedulers
    /// and (if enabled) SWA from `opt.train`
    pub fn new(opt: ModelOptions, net_g: Network, net_d: Option<Network>) -> Result<Self> {
        opt.validate()?;
        let device = opt.device()?;
        let is_train = opt.is_train;

        let mut base = Self {
            opt,
            device,
            is_train,
            net_g,
            net_d,
            optimizers: Vec::new(),
            schedulers: Vec::new(),
            swa: None,
            swa_start_iter: None,
            validator: None,
        };
        if is_train {
            base.setup_training()?;
        }
        Ok(base)
    }

    fn setup_training(&mut self) -> Result<()> {
        let train = self.opt.train.clone();

        let mut opt_g = AdamW::new(
            optimizer_params(&self.net_g)?,
            AdamWConfig {
                lr: train.lr_g,
                beta1: train.beta1_g,
                beta2: train.beta2_g,
                eps: 1e-8,
                weight_decay: train.weight_decay_g,
            },
        );
        let sched_g = LrScheduler::from_options(&train, &mut opt_g)?;
        self.optimizers.push(opt_g);
        self.schedulers.push(sched_g);

        if let Some(net_d) = &self.net_d {
            let lr_d = train.lr_d.ok_or_else(|| {
                LifecycleError::Config("lr_D is required to train a discriminator".to_string())
            })?;
            let mut opt_d = AdamW::new(
                optimizer_params(net_d)?,
                AdamWConfig {
                    lr: lr_d,
                    beta1: train.beta1_d,
                    beta2: train.beta2_d,
                    eps: 1e-8,
                    weight_decay: train.weight_decay_d,
                },
            );
            let sched_d = LrScheduler::from_options(&train, &mut opt_d)?;
            self.optimizers.push(opt_d);
            self.schedulers.push(sched_d);
        }

        if self.opt.use_swa {
            let swa_lr = train
                .swa_lr
                .ok_or_else(|| LifecycleError::Config("use_swa requires swa_lr".to_string()))?;
            self.swa = Some(SwaState {
                model: SwaModel::new(),
                scheduler: SwaLr::new(swa_lr, train.swa_anneal_epochs, train.swa_anneal_strategy),
            });
            self.swa_start_iter = train.swa_start_iter();
            match self.swa_start_iter {
                Some(start) => log::info!("SWA enabled from iteration {}", start),
                None => log::warn!("SWA enabled without a start iteration; it will never activate"),
            }
        }

        Ok(())
    }

    pub fn options(&self) -> &ModelOptions {
        &self.opt
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn is_train(&self) -> bool {
        self.is_train
    }

    pub fn net_g(&self) -> &Network {
        &self.net_g
    }

    pub fn net_g_mut(&mut self) -> &mut Network {
        &mut self.net_g
    }

    pub fn net_d(&self) -> Option<&Network> {
        self.net_d.as_ref()
    }

    pub fn net_d_mut(&mut self) -> Option<&mut Network> {
        self.net_d.as_mut()
    }

    pub fn optimizers(&self) -> &[AdamW] {
        &self.optimizers
    }

    pub fn optimizers_mut(&mut self) -> &mut [AdamW] {
        &mut self.optimizers
    }

    pub fn schedulers(&self) -> &[LrScheduler] {
        &self.schedulers
    }

    pub fn swa(&self) -> Option<&SwaState> {
        self.swa.as_ref()
    }

    pub fn swa_start_iter(&self) -> Option<usize> {
        self.swa_start_iter
    }

    /// Install the hook run by [`ModelBase::load_network`] for typed loads
    pub fn set_validator(&mut self, validator: Box<dyn StateDictValidator>) {
        self.validator = Some(validator);
    }

    /// Whether iteration `current_step` runs in the SWA regime
    pub fn in_swa_regime(&self, current_step: usize) -> bool {
        current_step > 0
            && self.swa.is_some()
            && self.swa_start_iter.is_some_and(|start| current_step > start)
    }

    /// Initial learning rate of every group, per optimizer
    pub fn initial_lrs(&self) -> Vec<Vec<f64>> {
        self.optimizers.iter().map(AdamW::initial_lrs).collect()
    }

    /// Overwrite group learning rates, per optimizer
    pub fn set_lrs(&mut self, lr_groups: &[Vec<f64>]) {
        for (optimizer, lrs) in self.optimizers.iter_mut().zip(lr_groups) {
            optimizer.set_learning_rates(lrs);
        }
    }

    /// Advance learning-rate schedules after iteration `current_step`
    ///
    /// In the SWA regime the averaged model absorbs the generator, the SWA
    /// scheduler drives the generator optimizer and the generator's regular
    /// scheduler is skipped. Otherwise every scheduler steps, and during
    /// warmup each group is set to `initial_lr * current_step / warmup_iter`.
    pub fn update_learning_rate(&mut self, current_step: usize, warmup_iter: Option<usize>) -> Result<()> {
        if self.in_swa_regime(current_step) {
            return self.step_swa();
        }

        for (scheduler, optimizer) in self.schedulers.iter_mut().zip(self.optimizers.iter_mut()) {
            scheduler.step(optimizer);
        }

        if let Some(warmup_iter) = warmup_iter {
            if current_step < warmup_iter {
                let warm: Vec<Vec<f64>> = self
                    .initial_lrs()
                    .iter()
                    .map(|group| {
                        group
                            .iter()
                            .map(|lr| warmup_lr(*lr, current_step, warmup_iter))
                            .collect()
                    })
                    .collect();
                self.set_lrs(&warm);
            }
        }

        Ok(())
    }

    fn step_swa(&mut self) -> Result<()> {
        let Some(swa) = self.swa.as_mut() else {
            return Ok(());
        };
        swa.model.update_parameters(&self.net_g)?;

        let mut optimizers = self.optimizers.iter_mut();
        let opt_g = optimizers
            .next()
            .ok_or_else(|| LifecycleError::Training("SWA requires a generator optimizer".to_string()))?;
        swa.scheduler.step(opt_g);

        // the generator's own scheduler (index 0) is paused
        for (scheduler, optimizer) in self.schedulers.iter_mut().skip(1).zip(optimizers) {
            scheduler.step(optimizer);
        }
        Ok(())
    }

    /// Generator learning rate in effect for the next step
    pub fn current_learning_rate(&self, current_step: usize) -> Option<f64> {
        if self.in_swa_regime(current_step) {
            if let Some(lr) = self.swa.as_ref().and_then(|s| s.scheduler.last_lr().first()) {
                return Some(*lr);
            }
        }
        self.optimizers
            .first()
            .and_then(|o| o.param_groups().first())
            .map(|g| g.lr)
    }

    /// Printable parameter listing and total parameter count of `network`
    pub fn network_description(&self, network: &Network) -> Result<(String, usize)> {
        network.description()
    }

    /// Log the parameter listing and size of each network
    pub fn print_networks(&self) -> Result<()> {
        for network in std::iter::once(&self.net_g).chain(self.net_d.as_ref()) {
            let (description, count) = self.network_description(network)?;
            log::info!(
                "Network {} with parameters: {}\n{}",
                network.label(),
                count,
                description
            );
        }
        Ok(())
    }

    /// Write a weight checkpoint to the models directory
    pub fn save_network(
        &self,
        source: &dyn StateDictSource,
        label: &str,
        iter: usize,
        latest: bool,
    ) -> Result<PathBuf> {
        checkpoint::save_network(&self.opt.path.models, source, label, iter, latest)
    }

    /// Load pretrained weights into `network`
    pub fn load_network<P: AsRef<Path>>(
        &self,
        path: P,
        network: &Network,
        options: &LoadOptions<'_>,
    ) -> Result<LoadReport> {
        loader::load_network(path, network, options, self.validator.as_deref())
    }

    /// Write the SWA average, if SWA is enabled
    pub fn save_swa_model(&self, iter: usize, latest: bool) -> Result<Option<PathBuf>> {
        let Some(swa) = &self.swa else {
            return Ok(None);
        };
        if swa.model.n_averaged() == 0 {
            return Ok(None);
        }

        let dir = &self.opt.path.models;
        std::fs::create_dir_all(dir)?;
        let path = dir.join(checkpoint::network_file_name(SWA_LABEL, iter, latest));
        checkpoint::rotate_previous(&path, &dir.join(format!("previous_{}.safetensors", SWA_LABEL)))?;

        let mut metadata = Metadata::new();
        metadata.insert(N_AVERAGED_KEY.to_string(), swa.model.n_averaged().to_string());
        checkpoint::save_tensors(&path, &swa.model.state_dict()?, Some(metadata))?;
        log::info!("Saved SWA model ({} snapshots) to {}", swa.model.n_averaged(), path.display());
        Ok(Some(path))
    }

    /// Restore the SWA average written by [`ModelBase::save_swa_model`]
    pub fn load_swa_model<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let swa = self
            .swa
            .as_mut()
            .ok_or_else(|| LifecycleError::Training("SWA is not enabled".to_string()))?;
        let (tensors, metadata) = checkpoint::load_tensors(path.as_ref(), &self.device)?;
        let n_averaged = metadata
            .as_ref()
            .and_then(|m| m.get(N_AVERAGED_KEY))
            .and_then(|n| n.parse::<usize>().ok())
            .ok_or_else(|| {
                LifecycleError::Checkpoint(format!(
                    "{} has no {} entry",
                    path.as_ref().display(),
                    N_AVERAGED_KEY
                ))
            })?;
        swa.model.load_state_dict(tensors, n_averaged)
    }

    /// Snapshot of the optimizers and schedulers at `iter`
    pub fn training_state(&self, epoch: usize, iter: usize) -> TrainingState {
        let swa_scheduler = if self.is_train && self.opt.use_swa {
            Some(match &self.swa {
                Some(swa) if self.in_swa_regime(iter) => vec![swa.scheduler.state_dict()],
                _ => Vec::new(),
            })
        } else {
            None
        };

        TrainingState {
            epoch,
            iter,
            optimizers: self.optimizers.iter().map(AdamW::state_dict).collect(),
            schedulers: self.schedulers.iter().map(LrScheduler::state_dict).collect(),
            swa_scheduler,
        }
    }

    /// Save the training state used for resuming
    pub fn save_training_state(&self, epoch: usize, iter: usize, latest: bool) -> Result<PathBuf> {
        let dir = &self.opt.path.training_state;
        std::fs::create_dir_all(dir)?;
        let path = dir.join(state_file_name(iter, latest));
        checkpoint::rotate_previous(&path, &dir.join("previous.state"))?;

        let format = self.training_state(epoch, iter).save(&path)?;
        log::info!(
            "Saved training state (epoch {}, iter {}, {:?}) to {}",
            epoch,
            iter,
            format,
            path.display()
        );
        Ok(path)
    }

    /// Read a training state saved by [`ModelBase::save_training_state`]
    pub fn load_training_state<P: AsRef<Path>>(&self, path: P) -> Result<TrainingState> {
        TrainingState::load(path.as_ref(), &self.device)
    }

    /// Resume the optimizers and schedulers for training
    pub fn resume_training(&mut self, state: &TrainingState) -> Result<()> {
        if state.optimizers.len() != self.optimizers.len() {
            return Err(LifecycleError::StateMismatch {
                what: "optimizers",
                expected: self.optimizers.len(),
                found: state.optimizers.len(),
            });
        }
        if state.schedulers.len() != self.schedulers.len() {
            return Err(LifecycleError::StateMismatch {
                what: "schedulers",
                expected: self.schedulers.len(),
                found: state.schedulers.len(),
            });
        }

        for (optimizer, saved) in self.optimizers.iter_mut().zip(&state.optimizers) {
            optimizer.load_state_dict(saved)?;
        }
        for (scheduler, saved) in self.schedulers.iter_mut().zip(&state.schedulers) {
            scheduler.load_state_dict(saved)?;
        }

        if self.is_train && self.opt.use_swa {
            if let (Some(swa), Some(saved)) = (self.swa.as_mut(), state.swa_scheduler.as_ref()) {
                for s in saved {
                    swa.scheduler.load_state_dict(s);
                }
            }
        }

        log::info!("Resumed training from epoch {}, iter {}", state.epoch, state.iter);
        Ok(())
    }

    /// Apply changed scheduler options to the live schedulers
    pub fn update_schedulers(&mut self, train: &TrainOptions) -> Result<()> {
        for scheduler in &mut self.schedulers {
            scheduler.reconfigure(train)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AnnealStrategy, LrScheme, PathOptions};
    use crate::models::NetType;
    use candle_core::DType;
    use candle_nn::{linear, Linear, Module, VarBuilder, VarMap};

    fn options(dir: &Path, train: TrainOptions, use_swa: bool) -> ModelOptions {
        ModelOptions {
            is_train: true,
            use_swa,
            gpu_ids: None,
            path: PathOptions {
                models: dir.join("models"),
                training_state: dir.join("training_state"),
            },
            train,
        }
    }

    fn step_train(lr_g: f64, lr_d: f64) -> TrainOptions {
        TrainOptions {
            lr_scheme: LrScheme::Step,
            lr_step_size: Some(1),
            lr_gamma: Some(0.5),
            lr_g,
            lr_d: Some(lr_d),
            ..Default::default()
        }
    }

    fn build_networks() -> Result<(Network, Linear, Network, Linear, Linear)> {
        let dev = Device::Cpu;
        let g_map = VarMap::new();
        let g = linear(3, 3, VarBuilder::from_varmap(&g_map, DType::F32, &dev).pp("body.0"))?;

        let d_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&d_map, DType::F32, &dev);
        let d0 = linear(3, 4, vb.pp("features.0"))?;
        let d2 = linear(4, 1, vb.pp("features.2"))?;

        Ok((
            Network::new("G", NetType::Generator, g_map),
            g,
            Network::new("D", NetType::Discriminator, d_map),
            d0,
            d2,
        ))
    }

    struct ToyGan {
        base: ModelBase,
        g: Linear,
        d: (Linear, Linear),
        input: Option<Tensor>,
        losses: BTreeMap<String, f64>,
    }

    impl ToyGan {
        fn new(opt: ModelOptions) -> Result<Self> {
            let (net_g, g, net_d, d0, d2) = build_networks()?;
            Ok(Self {
                base: ModelBase::new(opt, net_g, Some(net_d))?,
                g,
                d: (d0, d2),
                input: None,
                losses: BTreeMap::new(),
            })
        }

        fn discriminate(&self, x: &Tensor) -> candle_core::Result<Tensor> {
            self.d.1.forward(&self.d.0.forward(x)?.relu()?)
        }
    }

    impl TrainableModel for ToyGan {
        type Batch = Tensor;

        fn base(&self) -> &ModelBase {
            &self.base
        }

        fn base_mut(&mut self) -> &mut ModelBase {
            &mut self.base
        }

        fn feed_data(&mut self, batch: Tensor) -> Result<()> {
            self.input = Some(batch);
            Ok(())
        }

        fn optimize_parameters(&mut self, step: usize) -> Result<()> {
            let input = self
                .input
                .clone()
                .ok_or_else(|| LifecycleError::Training("no batch fed".to_string()))?;

            // generator step with the discriminator frozen
            if let Some(net_d) = self.base.net_d_mut() {
                net_d.requires_grad(false, None)?;
            }
            let fake = self.g.forward(&input)?;
            let l_g = self.discriminate(&fake)?.mean_all()?.neg()?;
            let mut grads = l_g.backward()?;
            if let Some(net_d) = self.base.net_d() {
                net_d.filter_grads(&mut grads)?;
            }
            self.base.optimizers_mut()[0].step(&grads)?;

            // discriminator step
            if let Some(net_d) = self.base.net_d_mut() {
                net_d.requires_grad(true, None)?;
            }
            let fake = self.g.forward(&input)?.detach();
            let l_d = (self.discriminate(&fake)?.mean_all()? - self.discriminate(&input)?.mean_all()?)?;
            self.base.optimizers_mut()[1].backward_step(&l_d)?;

            self.losses.insert("l_g".to_string(), l_g.to_scalar::<f32>()? as f64);
            self.losses.insert("l_d".to_string(), l_d.to_scalar::<f32>()? as f64);

            let warmup = self.base.options().train.warmup_iter;
            self.base.update_learning_rate(step, warmup)
        }

        fn current_losses(&self) -> BTreeMap<String, f64> {
            self.losses.clone()
        }

        fn current_visuals(&self) -> Result<BTreeMap<String, Tensor>> {
            let mut visuals = BTreeMap::new();
            if let Some(input) = &self.input {
                visuals.insert("LR".to_string(), input.clone());
                visuals.insert("SR".to_string(), self.g.forward(input)?);
            }
            Ok(visuals)
        }

        fn load(&mut self) -> Result<()> {
            Ok(())
        }
    }

    fn batch() -> Result<Tensor> {
        Ok(Tensor::arange(0f32, 6f32, &Device::Cpu)?.reshape((2, 3))?)
    }

    fn assert_close(a: f64, b: f64) {
        assert!((a - b).abs() <= 1e-12 * b.abs().max(1.0), "{} != {}", a, b);
    }

    #[test]
    fn test_warmup_ramp() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let train = TrainOptions {
            lr_scheme: LrScheme::MultiStep,
            lr_steps: Some(vec![100]),
            lr_g: 1e-3,
            lr_d: Some(2e-3),
            ..Default::default()
        };
        let (net_g, _, net_d, _, _) = build_networks()?;
        let mut base = ModelBase::new(options(dir.path(), train, false), net_g, Some(net_d))?;

        for k in 1..10 {
            base.update_learning_rate(k, Some(10))?;
            assert_close(base.optimizers()[0].learning_rates()[0], 1e-3 * k as f64 / 10.0);
            assert_close(base.optimizers()[1].learning_rates()[0], 2e-3 * k as f64 / 10.0);
        }

        base.update_learning_rate(10, Some(10))?;
        assert_close(base.optimizers()[0].learning_rates()[0], 1e-3);
        assert_eq!(base.current_learning_rate(10), Some(1e-3));
        Ok(())
    }

    #[test]
    fn test_warmup_scales_every_param_group() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let train = TrainOptions {
            lr_scheme: LrScheme::MultiStep,
            lr_steps: Some(vec![100]),
            lr_g: 1e-3,
            lr_d: Some(1e-3),
            ..Default::default()
        };
        let (net_g, _, net_d, _, _) = build_networks()?;
        let mut base = ModelBase::new(options(dir.path(), train, false), net_g, Some(net_d))?;

        let extra = candle_core::Var::zeros(2, DType::F32, &Device::Cpu)?;
        base.optimizers_mut()[0].add_param_group(
            vec![("upsample.weight".to_string(), extra)],
            AdamWConfig {
                lr: 4e-3,
                ..Default::default()
            },
        );
        assert_eq!(base.initial_lrs()[0], vec![1e-3, 4e-3]);

        base.update_learning_rate(5, Some(10))?;
        let lrs = base.optimizers()[0].learning_rates();
        assert_close(lrs[0], 1e-3 * 0.5);
        assert_close(lrs[1], 4e-3 * 0.5);

        base.set_lrs(&[vec![1.0, 2.0], vec![3.0]]);
        assert_eq!(base.optimizers()[0].learning_rates(), vec![1.0, 2.0]);
        assert_eq!(base.optimizers()[1].learning_rates(), vec![3.0]);
        Ok(())
    }

    #[test]
    fn test_no_warmup_follows_schedule() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let (net_g, _, net_d, _, _) = build_networks()?;
        let mut base = ModelBase::new(options(dir.path(), step_train(1.0, 1.0), false), net_g, Some(net_d))?;

        base.update_learning_rate(1, None)?;
        base.update_learning_rate(2, None)?;
        assert_eq!(base.initial_lrs(), vec![vec![1.0], vec![1.0]]);
        assert_eq!(base.optimizers()[0].learning_rates(), vec![0.25]);
        Ok(())
    }

    #[test]
    fn test_swa_switch_skips_generator_scheduler() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let train = TrainOptions {
            swa_start_iter: Some(3),
            swa_lr: Some(1e-5),
            swa_anneal_epochs: 1,
            swa_anneal_strategy: AnnealStrategy::Linear,
            ..step_train(1e-3, 2e-3)
        };
        let (net_g, _, net_d, _, _) = build_networks()?;
        let mut base = ModelBase::new(options(dir.path(), train, true), net_g, Some(net_d))?;

        for step in 1..=3 {
            assert!(!base.in_swa_regime(step));
            base.update_learning_rate(step, None)?;
        }
        assert_eq!(base.schedulers()[0].last_epoch, 3);
        assert_eq!(base.schedulers()[1].last_epoch, 3);
        assert_close(base.optimizers()[0].learning_rates()[0], 1e-3 * 0.125);
        assert_eq!(base.swa().map(|s| s.model.n_averaged()), Some(0));

        for step in 4..=5 {
            assert!(base.in_swa_regime(step));
            base.update_learning_rate(step, None)?;
        }
        assert_eq!(base.schedulers()[0].last_epoch, 3);
        assert_eq!(base.schedulers()[1].last_epoch, 5);
        assert_close(base.optimizers()[0].learning_rates()[0], 1e-5);
        assert_close(base.optimizers()[1].learning_rates()[0], 2e-3 * 0.5f64.powi(5));
        assert_eq!(base.swa().map(|s| s.model.n_averaged()), Some(2));
        assert_eq!(base.current_learning_rate(5), Some(1e-5));
        Ok(())
    }

    #[test]
    fn test_resume_round_trip() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let train = TrainOptions {
            lr_scheme: LrScheme::MultiStepRestart,
            lr_steps: Some(vec![2, 4]),
            restarts: Some(vec![5]),
            restart_weights: Some(vec![0.5]),
            lr_gamma: Some(0.5),
            warmup_iter: Some(2),
            lr_g: 1e-3,
            lr_d: Some(1e-3),
            ..Default::default()
        };
        let opt = options(dir.path(), train, false);

        let mut model = ToyGan::new(opt.clone())?;
        model.feed_data(batch()?)?;
        for step in 1..=4 {
            model.optimize_parameters(step)?;
        }
        assert!(model.current_losses().contains_key("l_g"));
        let path = model.base().save_training_state(1, 4, false)?;
        assert!(path.ends_with("4.state"));

        let mut resumed = ToyGan::new(opt)?;
        let state = resumed.base().load_training_state(&path)?;
        assert_eq!((state.epoch, state.iter), (1, 4));
        resumed.base_mut().resume_training(&state)?;

        assert_eq!(resumed.base().schedulers(), model.base().schedulers());
        for (live, restored) in model.base().optimizers().iter().zip(resumed.base().optimizers()) {
            assert_eq!(restored.learning_rates(), live.learning_rates());
            assert_eq!(restored.initial_lrs(), live.initial_lrs());
            for (name, _) in &live.param_groups()[0].params {
                let a = live.param_state(name).unwrap();
                let b = restored.param_state(name).unwrap();
                assert_eq!(a.step, b.step);
                let diff = (&a.exp_avg - &b.exp_avg)?.abs()?.sum_all()?.to_scalar::<f32>()?;
                assert_eq!(diff, 0.0, "{}", name);
            }
        }

        // both continue on the same schedule
        for step in 5..=6 {
            model.base_mut().update_learning_rate(step, None)?;
            resumed.base_mut().update_learning_rate(step, None)?;
            assert_eq!(
                resumed.base().optimizers()[0].learning_rates(),
                model.base().optimizers()[0].learning_rates()
            );
        }
        Ok(())
    }

    #[test]
    fn test_resume_rejects_length_mismatch() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let (net_g, _, net_d, _, _) = build_networks()?;
        let mut base = ModelBase::new(options(dir.path(), step_train(1e-3, 1e-3), false), net_g, Some(net_d))?;

        let mut state = base.training_state(0, 0);
        state.optimizers.pop();
        assert!(matches!(
            base.resume_training(&state),
            Err(LifecycleError::StateMismatch { what: "optimizers", expected: 2, found: 1 })
        ));

        let mut state = base.training_state(0, 0);
        state.schedulers.push(state.schedulers[0].clone());
        assert!(matches!(
            base.resume_training(&state),
            Err(LifecycleError::StateMismatch { what: "schedulers", .. })
        ));
        Ok(())
    }

    #[test]
    fn test_swa_scheduler_saved_after_start() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let train = TrainOptions {
            swa_start_iter: Some(1),
            swa_lr: Some(1e-5),
            swa_anneal_epochs: 4,
            ..step_train(1e-3, 1e-3)
        };
        let opt = options(dir.path(), train, true);
        let (net_g, _, net_d, _, _) = build_networks()?;
        let mut base = ModelBase::new(opt.clone(), net_g, Some(net_d))?;

        base.update_learning_rate(1, None)?;
        assert_eq!(base.training_state(0, 1).swa_scheduler, Some(vec![]));

        base.update_learning_rate(2, None)?;
        base.update_learning_rate(3, None)?;
        let path = base.save_training_state(0, 3, true)?;
        let swa_path = base.save_swa_model(3, true)?.unwrap();

        let (net_g, _, net_d, _, _) = build_networks()?;
        let mut resumed = ModelBase::new(opt, net_g, Some(net_d))?;
        let state = resumed.load_training_state(&path)?;
        assert_eq!(state.swa_scheduler.as_ref().map(Vec::len), Some(1));
        resumed.resume_training(&state)?;
        resumed.load_swa_model(&swa_path)?;

        let (a, b) = (base.swa().unwrap(), resumed.swa().unwrap());
        assert_eq!(a.scheduler, b.scheduler);
        assert_eq!(b.model.n_averaged(), 2);
        assert_eq!(
            resumed.current_learning_rate(3),
            base.current_learning_rate(3)
        );
        Ok(())
    }

    #[test]
    fn test_training_state_rotation() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let (net_g, _, net_d, _, _) = build_networks()?;
        let mut base = ModelBase::new(options(dir.path(), step_train(1e-3, 1e-3), false), net_g, Some(net_d))?;

        base.save_training_state(0, 10, true)?;
        base.update_learning_rate(11, None)?;
        let latest = base.save_training_state(0, 11, true)?;

        let previous = base.load_training_state(dir.path().join("training_state/previous.state"))?;
        assert_eq!(previous.iter, 10);
        assert_eq!(base.load_training_state(latest)?.iter, 11);
        Ok(())
    }

    #[test]
    fn test_update_schedulers() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let train = TrainOptions {
            lr_scheme: LrScheme::MultiStep,
            lr_steps: Some(vec![10, 20]),
            lr_g: 1.0,
            lr_d: Some(1.0),
            ..Default::default()
        };
        let (net_g, _, net_d, _, _) = build_networks()?;
        let mut base = ModelBase::new(options(dir.path(), train.clone(), false), net_g, Some(net_d))?;

        let bad = TrainOptions {
            lr_steps: Some(vec![20, 10]),
            ..train.clone()
        };
        assert!(matches!(base.update_schedulers(&bad), Err(LifecycleError::Config(_))));

        let changed = TrainOptions {
            lr_steps: Some(vec![1]),
            lr_gamma: Some(0.1),
            ..train
        };
        base.update_schedulers(&changed)?;
        base.update_learning_rate(1, None)?;
        for optimizer in base.optimizers() {
            assert_close(optimizer.learning_rates()[0], 0.1);
        }
        Ok(())
    }

    #[test]
    fn test_partial_discriminator_freeze() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut model = ToyGan::new(options(dir.path(), step_train(1e-2, 1e-2), false))?;
        let net_d = model.base_mut().net_d_mut().unwrap();
        net_d.requires_grad(false, None)?;
        net_d.requires_grad(true, Some("2"))?;

        let before = model.base().net_d().unwrap().state_dict()?;
        let input = batch()?;
        let loss = model.discriminate(&input)?.mean_all()?;
        let mut grads = loss.backward()?;
        model.base().net_d().unwrap().filter_grads(&mut grads)?;
        model.base_mut().optimizers_mut()[1].step(&grads)?;

        let after = model.base().net_d().unwrap().state_dict()?;
        let moved = |name: &str| -> Result<f32> {
            Ok((&before[name] - &after[name])?.abs()?.sum_all()?.to_scalar::<f32>()?)
        };
        assert_eq!(moved("features.0.weight")?, 0.0);
        assert_eq!(moved("features.0.bias")?, 0.0);
        // d(mean)/d(bias) is 1 regardless of the activations
        assert!(moved("features.2.bias")? > 0.0);
        Ok(())
    }

    #[test]
    fn test_save_and_load_networks() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let opt = options(dir.path(), step_train(1e-3, 1e-3), false);
        let model = ToyGan::new(opt.clone())?;
        model.save(7, false)?;
        assert!(dir.path().join("models/7_G.safetensors").exists());
        assert!(dir.path().join("models/7_D.safetensors").exists());

        let other = ToyGan::new(opt)?;
        let report = other.base().load_network(
            dir.path().join("models/7_G.safetensors"),
            other.base().net_g(),
            &LoadOptions::default(),
        )?;
        assert_eq!(report.loaded.len(), 2);

        let input = batch()?;
        let a = model.g.forward(&input)?;
        let b = other.g.forward(&input)?;
        let diff = (a - b)?.abs()?.sum_all()?.to_scalar::<f32>()?;
        assert_eq!(diff, 0.0);
        assert_eq!(other.current_visuals()?.len(), 0);
        Ok(())
    }
}
