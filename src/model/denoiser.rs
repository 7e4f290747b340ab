//! Denoising network `F(c, p, y, x, t)`.
//!
//! ```text
//! [c; x; y] ─ 1×1 conv ─→ UNet(p, embed(t)) ─ 1×1 conv (zero init) ─→ [B, X, L]
//! ```
//!
//! The output projection starts at zero, so an untrained network contributes
//! nothing and the preconditioned estimate reduces to `c_skip · x_σ`.

use candle_core::{Module, Result, Tensor};
use candle_nn::{self as nn, Init, VarBuilder};

use super::timestep::TimestepEmbedding;
use super::unet::UNet;
use crate::config::DenoiserArgs;

#[derive(Debug, Clone)]
pub struct DenoisingNetwork {
    proj_t: TimestepEmbedding,
    proj_in: nn::Conv1d,
    unet: UNet,
    proj_out: nn::Conv1d,
}

impl DenoisingNetwork {
    /// - `c_dim`: width of the audio embedding
    /// - `x_dim`: signal channels
    pub fn new(c_dim: usize, x_dim: usize, args: &DenoiserArgs, vb: VarBuilder) -> Result<Self> {
        let h = args.h_dim;
        let proj_t = TimestepEmbedding::new(args.t_dim, args.fourier_scale, vb.pp("proj_t"))?;
        let proj_in = nn::conv1d(c_dim + 2 * x_dim, h, 1, Default::default(), vb.pp("proj_in"))?;
        let unet = UNet::new(args, vb.pp("unet"))?;

        let vb_out = vb.pp("proj_out");
        let weight = vb_out.get_with_hints((x_dim, h, 1), "weight", Init::Const(0.0))?;
        let bias = vb_out.get_with_hints(x_dim, "bias", Init::Const(0.0))?;
        let proj_out = nn::Conv1d::new(weight, Some(bias), Default::default());

        Ok(Self {
            proj_t,
            proj_in,
            unet,
            proj_out,
        })
    }

    /// - `c`: `[B, C, L]` audio embedding
    /// - `positions`: `[B, L]` u32
    /// - `y`: `[B, X, L]` self-conditioning estimate
    /// - `x`: `[B, X, L]` scaled noisy signal
    /// - `t`: `[B]` noise-level conditioning
    pub fn forward(
        &self,
        c: &Tensor,
        positions: &Tensor,
        y: &Tensor,
        x: &Tensor,
        t: &Tensor,
    ) -> Result<Tensor> {
        let t = self.proj_t.forward(t)?;
        let h = self.proj_in.forward(&Tensor::cat(&[c, x, y], 1)?)?;
        let h = self.unet.forward(&h, positions, &t)?;
        self.proj_out.forward(&h)
    }

    pub fn ssm_parameters(&self) -> Vec<Tensor> {
        self.unet.ssm_parameters()
    }

    pub fn frozen_parameters(&self) -> Vec<Tensor> {
        self.proj_t.frozen_parameters()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SsmConfig;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn args() -> DenoiserArgs {
        DenoiserArgs {
            t_dim: 8,
            h_dim: 16,
            unet_scales: vec![2, 2],
            seq_depth: 1,
            fourier_scale: 30.0,
            ssm: SsmConfig {
                state_dim: 4,
                ..Default::default()
            },
        }
    }

    #[test]
    fn untrained_output_is_zero() {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let net = DenoisingNetwork::new(6, 3, &args(), vb).unwrap();

        let (b, l) = (2, 11);
        let c = Tensor::randn(0f32, 1.0, (b, 6, l), &dev).unwrap();
        let x = Tensor::randn(0f32, 1.0, (b, 3, l), &dev).unwrap();
        let y = Tensor::randn(0f32, 1.0, (b, 3, l), &dev).unwrap();
        let t = Tensor::randn(0f32, 1.0, b, &dev).unwrap();
        let p = Tensor::arange(0u32, l as u32, &dev)
            .unwrap()
            .unsqueeze(0)
            .unwrap()
            .repeat((b, 1))
            .unwrap();

        let out = net.forward(&c, &p, &y, &x, &t).unwrap();
        assert_eq!(out.dims(), &[b, 3, l]);
        let max: f32 = out.abs().unwrap().max_all().unwrap().to_scalar().unwrap();
        assert_eq!(max, 0.0);
    }

    #[test]
    fn parameter_registries() {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let net = DenoisingNetwork::new(6, 3, &args(), vb).unwrap();
        assert_eq!(net.ssm_parameters().len(), 3);
        assert_eq!(net.frozen_parameters().len(), 1);
        assert_eq!(net.frozen_parameters()[0].dims(), &[4]);
    }
}
