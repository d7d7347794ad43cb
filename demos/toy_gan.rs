/// Toy GAN run - exercises warmup, multi-step decay, SWA and resume end to end
use std::collections::BTreeMap;

use candle_core::{DType, Device, Tensor};
use candle_nn::{linear, Linear, Module, VarBuilder, VarMap};
use gan_lifecycle::{LifecycleError, ModelBase, ModelOptions, NetType, Network, TrainableModel};

const OPTIONS: &str = r#"{
    "is_train": true,
    "use_swa": true,
    "gpu_ids": null,
    "path": { "models": "toy_gan/models", "training_state": "toy_gan/training_state" },
    "train": {
        "lr_scheme": "MultiStepLR",
        "lr_steps": [40, 80],
        "lr_gamma": 0.5,
        "warmup_iter": 10,
        "niter": 120,
        "swa_start_iter_rel": 0.75,
        "swa_lr": 1e-4,
        "swa_anneal_epochs": 5,
        "lr_G": 1e-3,
        "lr_D": 1e-3
    }
}"#;

struct ToyGan {
    base: ModelBase,
    g: Linear,
    d: Linear,
    real: Option<Tensor>,
    losses: BTreeMap<String, f64>,
}

impl ToyGan {
    fn new(opt: ModelOptions) -> gan_lifecycle::Result<Self> {
        let dev = Device::Cpu;

        let g_map = VarMap::new();
        let g = linear(2, 2, VarBuilder::from_varmap(&g_map, DType::F32, &dev).pp("body.0"))?;
        let d_map = VarMap::new();
        let d = linear(2, 1, VarBuilder::from_varmap(&d_map, DType::F32, &dev).pp("features.0"))?;

        let base = ModelBase::new(
            opt,
            Network::new("G", NetType::Generator, g_map),
            Some(Network::new("D", NetType::Discriminator, d_map)),
        )?;
        Ok(Self {
            base,
            g,
            d,
            real: None,
            losses: BTreeMap::new(),
        })
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

    fn feed_data(&mut self, batch: Tensor) -> gan_lifecycle::Result<()> {
        self.real = Some(batch);
        Ok(())
    }

    fn optimize_parameters(&mut self, step: usize) -> gan_lifecycle::Result<()> {
        let real = self
            .real
            .clone()
            .ok_or_else(|| LifecycleError::Training("no batch fed".to_string()))?;
        let noise = real.randn_like(0.0, 1.0)?;

        // G
        if let Some(net_d) = self.base.net_d_mut() {
            net_d.requires_grad(false, None)?;
        }
        let fake = self.g.forward(&noise)?;
        let l_g = self.d.forward(&fake)?.mean_all()?.neg()?;
        let mut grads = l_g.backward()?;
        if let Some(net_d) = self.base.net_d() {
            net_d.filter_grads(&mut grads)?;
        }
        self.base.optimizers_mut()[0].step(&grads)?;

        // D
        if let Some(net_d) = self.base.net_d_mut() {
            net_d.requires_grad(true, None)?;
        }
        let fake = self.g.forward(&noise)?.detach();
        let l_d = (self.d.forward(&fake)?.mean_all()? - self.d.forward(&real)?.mean_all()?)?;
        self.base.optimizers_mut()[1].backward_step(&l_d)?;

        self.losses.insert("l_g".to_string(), l_g.to_scalar::<f32>()? as f64);
        self.losses.insert("l_d".to_string(), l_d.to_scalar::<f32>()? as f64);

        let warmup = self.base.options().train.warmup_iter;
        self.base.update_learning_rate(step, warmup)
    }

    fn current_losses(&self) -> BTreeMap<String, f64> {
        self.losses.clone()
    }

    fn current_visuals(&self) -> gan_lifecycle::Result<BTreeMap<String, Tensor>> {
        let mut visuals = BTreeMap::new();
        if let Some(real) = &self.real {
            visuals.insert("real".to_string(), real.clone());
            visuals.insert("fake".to_string(), self.g.forward(&real.randn_like(0.0, 1.0)?)?);
        }
        Ok(visuals)
    }

    fn load(&mut self) -> gan_lifecycle::Result<()> {
        Ok(())
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    log::info!("=== Toy GAN - lifecycle walkthrough ===");

    let opt = ModelOptions::from_json_str(OPTIONS)?;
    let niter = opt.train.niter.unwrap_or(120);
    let mut model = ToyGan::new(opt.clone())?;
    model.base().print_networks()?;
    log::info!("SWA starts after iteration {:?}", model.base().swa_start_iter());

    let real = Tensor::new(&[[1.0f32, 2.0], [1.5, 2.5], [0.5, 1.5], [1.0, 1.0]], &Device::Cpu)?;
    let half = niter / 2;

    for step in 1..=half {
        model.feed_data(real.clone())?;
        model.optimize_parameters(step)?;
        if step % 10 == 0 {
            log::info!(
                "iter {:>4} | lr {:.3e} | {:?}",
                step,
                model.base().current_learning_rate(step).unwrap_or_default(),
                model.current_losses()
            );
        }
    }

    model.save(half, true)?;
    let state_path = model.base().save_training_state(0, half, true)?;

    // resume into a fresh model and finish the run
    let mut resumed = ToyGan::new(opt)?;
    let state = resumed.base().load_training_state(&state_path)?;
    resumed.base_mut().resume_training(&state)?;
    log::info!("Resumed at iter {}", state.iter);

    for step in state.iter + 1..=niter {
        resumed.feed_data(real.clone())?;
        resumed.optimize_parameters(step)?;
        if step % 10 == 0 {
            log::info!(
                "iter {:>4} | lr {:.3e} | swa {} | {:?}",
                step,
                resumed.base().current_learning_rate(step).unwrap_or_default(),
                resumed.base().in_swa_regime(step),
                resumed.current_losses()
            );
        }
    }

    resumed.save(niter, true)?;
    resumed.base().save_training_state(0, niter, true)?;
    log::info!("=== Done ===");
    Ok(())
}
