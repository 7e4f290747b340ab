//! Top-level model: audio encoder + denoiser wired into the diffusion process.
//!
//! [`Model`] binds the encoded audio and position indices of one batch to the
//! denoising network, producing the `denoise(x, c_noise, y)` callable that
//! [`Diffusion`] trains and samples with. Optimisation is split into two
//! AdamW groups: state-space parameters (own learning rate, no weight decay)
//! and everything else. The fixed Fourier frequencies belong to neither.

use std::collections::{BTreeMap, HashSet};

use candle_core::{DType, Tensor, TensorId, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarBuilder, VarMap};

use crate::config::{ModelConfig, TrainingConfig};
use crate::diffusion::noise::NoiseSource;
use crate::diffusion::schedule::SamplerOptions;
use crate::diffusion::{Denoise, Diffusion};
use crate::model::denoiser::DenoisingNetwork;
use crate::model::encoder::ConditionEncoder;
use crate::{Error, Result};

/// Scalar metrics keyed by name (`loss`, or `train/loss` / `val/loss`).
pub type LogDict = BTreeMap<String, f32>;

/// One training example batch.
#[derive(Debug, Clone)]
pub struct Batch {
    /// `[B, A, L]` audio features.
    pub audio: Tensor,
    /// `[B, X, L]` clean signal.
    pub signal: Tensor,
    /// `[B, L]` u32 position indices.
    pub positions: Tensor,
}

/// Result of [`Model::validation_step`].
#[derive(Debug, Clone)]
pub struct ValidationOutput {
    pub log_dict: LogDict,
    /// `[1, X, L]` sample for the first element of batch 0, for plotting.
    pub reference: Option<Tensor>,
}

/// Trainable variables split by optimisation treatment.
#[derive(Debug, Clone, Default)]
pub struct ParamGroups {
    /// State-space parameters: `s4_lr`, no weight decay.
    pub ssm: Vec<Var>,
    /// Everything else: `lr`, `weight_decay`.
    pub rest: Vec<Var>,
}

/// The denoiser with one batch's audio embedding and positions bound.
struct BoundDenoiser<'a> {
    net: &'a DenoisingNetwork,
    cond: Tensor,
    positions: Tensor,
}

impl Denoise for BoundDenoiser<'_> {
    fn denoise(&self, x: &Tensor, c_noise: &Tensor, y: &Tensor) -> candle_core::Result<Tensor> {
        self.net.forward(&self.cond, &self.positions, y, x, c_noise)
    }
}

#[derive(Debug, Clone)]
pub struct Model {
    cfg: ModelConfig,
    diffusion: Diffusion,
    enc_a: ConditionEncoder,
    denoiser: DenoisingNetwork,
}

impl Model {
    pub fn new(cfg: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        cfg.validate()?;
        let enc_a = ConditionEncoder::new(cfg.a_dim, &cfg.encoder, vb.pp("enc_a"))?;
        let denoiser =
            DenoisingNetwork::new(cfg.encoder.h_dim, cfg.x_dim, &cfg.denoiser, vb.pp("denoiser"))?;
        tracing::info!(
            "model: A={} X={} encoder {}x{} denoiser h={} scales {:?} depth {}",
            cfg.a_dim,
            cfg.x_dim,
            cfg.encoder.num_layers,
            cfg.encoder.h_dim,
            cfg.denoiser.h_dim,
            cfg.denoiser.unet_scales,
            cfg.denoiser.seq_depth,
        );
        Ok(Self {
            cfg: cfg.clone(),
            diffusion: Diffusion::new(cfg.diffusion.clone())?,
            enc_a,
            denoiser,
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.cfg
    }

    pub fn diffusion(&self) -> &Diffusion {
        &self.diffusion
    }

    fn bind(&self, a: &Tensor, positions: &Tensor) -> Result<BoundDenoiser<'_>> {
        Ok(BoundDenoiser {
            net: &self.denoiser,
            cond: self.enc_a.forward(a, positions)?,
            positions: positions.clone(),
        })
    }

    /// Training loss for one batch.
    ///
    /// - `a`: `[B, A, L]` audio features
    /// - `x`: `[B, X, L]` clean signal
    /// - `p`: `[B, L]` u32 positions
    pub fn forward(
        &self,
        a: &Tensor,
        x: &Tensor,
        p: &Tensor,
        noise: &mut NoiseSource,
    ) -> Result<(LogDict, Tensor)> {
        self.check_batch(a, x, p)?;
        let model = self.bind(a, p)?;
        let loss = self.diffusion.loss(&model, x, noise)?;
        let mut log_dict = LogDict::new();
        log_dict.insert("loss".to_string(), loss.detach().to_scalar::<f32>()?);
        Ok((log_dict, loss))
    }

    /// Draw `num_samples` signals for one audio input `a: [A, L]`.
    ///
    /// `num_steps = 0` uses `training.val_steps`. Every sample gets its own
    /// noise; the audio embedding is shared.
    pub fn sample(
        &self,
        a: &Tensor,
        num_samples: usize,
        num_steps: usize,
        opts: &SamplerOptions,
        noise: &mut NoiseSource,
    ) -> Result<Tensor> {
        let (a_dim, len) = match a.dims() {
            &[a_dim, len] => (a_dim, len),
            dims => return Err(Error::Shape(format!("audio must be [A, L], got {dims:?}"))),
        };
        if a_dim != self.cfg.a_dim {
            return Err(Error::Shape(format!(
                "audio has {a_dim} channels, model expects {}",
                self.cfg.a_dim
            )));
        }
        if len == 0 {
            return Err(Error::Shape("audio sequence is empty".into()));
        }
        if num_samples == 0 {
            return Err(Error::InvalidArgument("num_samples must be positive".into()));
        }
        let num_steps = if num_steps > 0 {
            num_steps
        } else {
            self.cfg.training.val_steps
        };

        let device = a.device();
        let a = a.unsqueeze(0)?.repeat((num_samples, 1, 1))?;
        let p = Tensor::arange(0u32, len as u32, device)?
            .unsqueeze(0)?
            .repeat((num_samples, 1))?;
        let z = (noise.randn((num_samples, self.cfg.x_dim, len), device)? * opts.sigma_max)?;

        let mut model = self.bind(&a, &p)?;
        model.cond = model.cond.detach();

        tracing::debug!("sampling {num_samples}x{len} with {num_steps} steps");
        let x = self.diffusion.sample(&model, num_steps, &z, opts, noise)?;
        Ok(x.detach())
    }

    fn check_batch(&self, a: &Tensor, x: &Tensor, p: &Tensor) -> Result<()> {
        let (b, a_dim, len) = match a.dims() {
            &[b, a_dim, len] => (b, a_dim, len),
            dims => return Err(Error::Shape(format!("audio must be [B, A, L], got {dims:?}"))),
        };
        if a_dim != self.cfg.a_dim {
            return Err(Error::Shape(format!(
                "audio has {a_dim} channels, model expects {}",
                self.cfg.a_dim
            )));
        }
        if b == 0 || len == 0 {
            return Err(Error::Shape(format!("empty batch [{b}, {a_dim}, {len}]")));
        }
        if x.dims() != [b, self.cfg.x_dim, len] {
            return Err(Error::Shape(format!(
                "signal must be [{b}, {}, {len}], got {:?}",
                self.cfg.x_dim,
                x.dims()
            )));
        }
        if p.dims() != [b, len] {
            return Err(Error::Shape(format!(
                "positions must be [{b}, {len}], got {:?}",
                p.dims()
            )));
        }
        if p.dtype() != DType::U32 {
            return Err(Error::Shape(format!("positions must be u32, got {:?}", p.dtype())));
        }
        Ok(())
    }

    pub fn training_step(
        &self,
        batch: &Batch,
        noise: &mut NoiseSource,
    ) -> Result<(LogDict, Tensor)> {
        let (log_dict, loss) = self.forward(&batch.audio, &batch.signal, &batch.positions, noise)?;
        let log_dict = prefixed("train", log_dict);
        tracing::info!("{log_dict:?}");
        Ok((log_dict, loss))
    }

    /// Validation loss; batch 0 also yields a reference sample.
    pub fn validation_step(
        &self,
        batch: &Batch,
        batch_idx: usize,
        noise: &mut NoiseSource,
    ) -> Result<ValidationOutput> {
        let (log_dict, _) = self.forward(&batch.audio, &batch.signal, &batch.positions, noise)?;
        let reference = if batch_idx == 0 {
            let a = batch.audio.get(0)?;
            Some(self.sample(&a, 1, 0, &SamplerOptions::default(), noise)?)
        } else {
            None
        };
        let log_dict = prefixed("val", log_dict);
        tracing::info!("batch {batch_idx}: {log_dict:?}");
        Ok(ValidationOutput { log_dict, reference })
    }

    pub fn ssm_parameters(&self) -> Vec<Tensor> {
        let mut params = self.enc_a.ssm_parameters();
        params.extend(self.denoiser.ssm_parameters());
        params
    }

    pub fn frozen_parameters(&self) -> Vec<Tensor> {
        self.denoiser.frozen_parameters()
    }

    /// Split the variables of `varmap` (the one this model was built from).
    pub fn param_groups(&self, varmap: &VarMap) -> ParamGroups {
        let ids = |ts: Vec<Tensor>| ts.iter().map(Tensor::id).collect::<HashSet<TensorId>>();
        let ssm = ids(self.ssm_parameters());
        let frozen = ids(self.frozen_parameters());

        let mut groups = ParamGroups::default();
        for var in varmap.all_vars() {
            let id = var.as_tensor().id();
            if frozen.contains(&id) {
                continue;
            }
            if ssm.contains(&id) {
                groups.ssm.push(var);
            } else {
                groups.rest.push(var);
            }
        }
        tracing::info!(
            "param groups: {} ssm, {} rest, {} frozen",
            groups.ssm.len(),
            groups.rest.len(),
            frozen.len()
        );
        groups
    }
}

fn prefixed(prefix: &str, log_dict: LogDict) -> LogDict {
    log_dict
        .into_iter()
        .map(|(k, v)| (format!("{prefix}/{k}"), v))
        .collect()
}

/// Two AdamW optimizers sharing one backward pass.
pub struct Optimizers {
    rest: AdamW,
    ssm: AdamW,
}

impl Optimizers {
    pub fn new(groups: ParamGroups, cfg: &TrainingConfig) -> Result<Self> {
        let params = |lr, weight_decay| ParamsAdamW {
            lr,
            beta1: cfg.beta1,
            beta2: cfg.beta2,
            eps: cfg.eps,
            weight_decay,
        };
        Ok(Self {
            rest: AdamW::new(groups.rest, params(cfg.lr, cfg.weight_decay))?,
            ssm: AdamW::new(groups.ssm, params(cfg.s4_lr, 0.0))?,
        })
    }

    pub fn backward_step(&mut self, loss: &Tensor) -> Result<()> {
        let grads = loss.backward()?;
        self.rest.step(&grads)?;
        self.ssm.step(&grads)?;
        Ok(())
    }
}
