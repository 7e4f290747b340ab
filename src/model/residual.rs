//! Residual aggregation over a stack of sequence/channel mixers.
//!
//! Dual-residual scheme: every layer output is both folded into a post-norm
//! stream and added, un-normalised, to a running sum that is normalised once
//! at the end. Each layer's output reaches the result through that sum
//! directly, regardless of depth.
//!
//! ```text
//! x_d = 0
//! for (f_i, n_i):  y = f_i(x);  x_d += y;  x = n_i(x + y)
//! out = x + n_out(x_d)
//! ```

use candle_core::{Module, Result, Tensor};
use candle_nn::{self as nn, VarBuilder};

use super::modulation::ScaleShift;
use super::norm::channel_norm;
use super::ssm::S4Block;
use crate::config::SsmConfig;

/// What a mixer does to its (possibly modulated) input.
#[derive(Debug, Clone)]
pub enum MixerKind {
    /// Long-range mixing along the sequence.
    Sequence(S4Block),
    /// 1×1 convolution across channels.
    Channel(nn::Conv1d),
}

/// One layer of a [`ResiDual`] stack, optionally conditioned on the timestep.
#[derive(Debug, Clone)]
pub struct Mixer {
    kind: MixerKind,
    modulation: Option<ScaleShift>,
}

impl Mixer {
    pub fn sequence(
        dim: usize,
        ssm: &SsmConfig,
        t_dim: Option<usize>,
        vb: VarBuilder,
    ) -> Result<Self> {
        let kind = MixerKind::Sequence(S4Block::new(dim, ssm, vb.pp("s4"))?);
        Self::wrap(kind, dim, t_dim, vb)
    }

    pub fn channel(dim: usize, t_dim: Option<usize>, vb: VarBuilder) -> Result<Self> {
        let conv = nn::conv1d(dim, dim, 1, Default::default(), vb.pp("conv"))?;
        Self::wrap(MixerKind::Channel(conv), dim, t_dim, vb)
    }

    fn wrap(kind: MixerKind, dim: usize, t_dim: Option<usize>, vb: VarBuilder) -> Result<Self> {
        let modulation = match t_dim {
            Some(t_dim) => Some(ScaleShift::new(dim, t_dim, vb.pp("modulation"))?),
            None => None,
        };
        Ok(Self { kind, modulation })
    }

    pub fn forward(&self, x: &Tensor, positions: &Tensor, t: Option<&Tensor>) -> Result<Tensor> {
        let x = match (&self.modulation, t) {
            (Some(modulation), Some(t)) => modulation.forward(x, t)?,
            (None, _) => x.clone(),
            (Some(_), None) => candle_core::bail!("conditioned mixer called without a timestep"),
        };
        match &self.kind {
            MixerKind::Sequence(block) => block.forward(&x, positions),
            MixerKind::Channel(conv) => conv.forward(&x),
        }
    }

    pub fn ssm_parameters(&self) -> Vec<Tensor> {
        match &self.kind {
            MixerKind::Sequence(block) => block.ssm_parameters(),
            MixerKind::Channel(_) => Vec::new(),
        }
    }
}

/// Dual-residual stack of mixers on `[B, C, L]`.
#[derive(Debug, Clone)]
pub struct ResiDual {
    layers: Vec<(Mixer, nn::GroupNorm)>,
    out_norm: nn::GroupNorm,
}

impl ResiDual {
    pub fn new(dim: usize, mixers: Vec<Mixer>, vb: VarBuilder) -> Result<Self> {
        let layers = mixers
            .into_iter()
            .enumerate()
            .map(|(i, mixer)| Ok((mixer, channel_norm(dim, 1e-5, vb.pp(format!("norms.{i}")))?)))
            .collect::<Result<Vec<_>>>()?;
        let out_norm = channel_norm(dim, 1e-5, vb.pp("out_norm"))?;
        Ok(Self { layers, out_norm })
    }

    /// `depth` pairs of (S4 block, 1×1 conv), conditioned when `t_dim` is given.
    pub fn sequence_stack(
        dim: usize,
        depth: usize,
        ssm: &SsmConfig,
        t_dim: Option<usize>,
        vb: VarBuilder,
    ) -> Result<Self> {
        let mut mixers = Vec::with_capacity(2 * depth);
        for i in 0..depth {
            let layer_vb = vb.pp(format!("layers.{i}"));
            mixers.push(Mixer::sequence(dim, ssm, t_dim, layer_vb.pp("seq"))?);
            mixers.push(Mixer::channel(dim, t_dim, layer_vb.pp("chan"))?);
        }
        Self::new(dim, mixers, vb)
    }

    pub fn forward(&self, x: &Tensor, positions: &Tensor, t: Option<&Tensor>) -> Result<Tensor> {
        let mut x = x.clone();
        let mut x_d = x.zeros_like()?;
        for (mixer, norm) in &self.layers {
            let y = mixer.forward(&x, positions, t)?;
            x_d = (x_d + &y)?;
            x = norm.forward(&(x + y)?)?;
        }
        x + self.out_norm.forward(&x_d)?
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn ssm_parameters(&self) -> Vec<Tensor> {
        self.layers
            .iter()
            .flat_map(|(mixer, _)| mixer.ssm_parameters())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn small_ssm() -> SsmConfig {
        SsmConfig {
            state_dim: 4,
            ..Default::default()
        }
    }

    #[test]
    fn stack_layout() {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let stack = ResiDual::sequence_stack(8, 3, &small_ssm(), None, vb.pp("res")).unwrap();
        assert_eq!(stack.len(), 6);
        // 3 S4 blocks × (log_dt, log_a_real, a_imag)
        assert_eq!(stack.ssm_parameters().len(), 9);
    }

    #[test]
    fn conditioned_stack_preserves_shape() {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let stack = ResiDual::sequence_stack(8, 2, &small_ssm(), Some(4), vb.pp("res")).unwrap();
        let x = Tensor::randn(0f32, 1.0, (2, 8, 12), &dev).unwrap();
        let p = Tensor::arange(0u32, 12, &dev).unwrap().unsqueeze(0).unwrap().repeat((2, 1)).unwrap();
        let t = Tensor::randn(0f32, 1.0, (2, 4), &dev).unwrap();
        let y = stack.forward(&x, &p, Some(&t)).unwrap();
        assert_eq!(y.dims(), &[2, 8, 12]);
    }

    #[test]
    fn conditioned_mixer_requires_timestep() {
        let dev = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &dev);
        let mixer = Mixer::channel(4, Some(4), vb.pp("m")).unwrap();
        let x = Tensor::zeros((1, 4, 3), DType::F32, &dev).unwrap();
        let p = Tensor::arange(0u32, 3, &dev).unwrap().unsqueeze(0).unwrap();
        assert!(mixer.forward(&x, &p, None).is_err());
    }

    #[test]
    fn every_layer_receives_gradient() {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let mixers = (0..4)
            .map(|i| Mixer::channel(4, None, vb.pp(format!("m{i}"))).unwrap())
            .collect();
        let stack = ResiDual::new(4, mixers, vb.pp("res")).unwrap();
        let x = Tensor::randn(0f32, 1.0, (2, 4, 6), &dev).unwrap();
        let p = Tensor::arange(0u32, 6, &dev).unwrap().unsqueeze(0).unwrap();
        let target = Tensor::randn(0f32, 1.0, (2, 4, 6), &dev).unwrap();
        let loss = (stack.forward(&x, &p, None).unwrap() - target)
            .unwrap()
            .sqr()
            .unwrap()
            .sum_all()
            .unwrap();
        let grads = loss.backward().unwrap();
        for (mixer, _) in &stack.layers {
            let MixerKind::Channel(conv) = &mixer.kind else {
                unreachable!()
            };
            let g: f32 = grads
                .get(conv.weight())
                .unwrap()
                .abs()
                .unwrap()
                .sum_all()
                .unwrap()
                .to_scalar()
                .unwrap();
            assert!(g > 0.0);
        }
    }
}
