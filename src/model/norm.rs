//! Differentiable normalization layers.
//!
//! Channel norms are single-group `candle_nn::GroupNorm`s over `[B, C, L]`
//! (statistics over C and L). The layer norm goes through
//! `candle_nn::ops::layer_norm_slow`, which is built from primitive ops and
//! so has a backward pass.

use candle_core::{DType, Device, Result, Tensor};
use candle_nn::{GroupNorm, VarBuilder};

/// Single-group norm with a per-channel affine transform initialised to 1/0.
pub fn channel_norm(channels: usize, eps: f64, vb: VarBuilder) -> Result<GroupNorm> {
    candle_nn::group_norm(1, channels, eps, vb)
}

/// Single-group norm without trainable parameters.
pub fn plain_channel_norm(channels: usize, eps: f64, device: &Device) -> Result<GroupNorm> {
    let weight = Tensor::ones(channels, DType::F32, device)?;
    let bias = Tensor::zeros(channels, DType::F32, device)?;
    GroupNorm::new(weight, bias, channels, 1, eps)
}

/// Layer normalization over the last dimension.
#[derive(Debug, Clone)]
pub struct LayerNorm {
    weight: Tensor,
    bias: Tensor,
    eps: f64,
}

impl LayerNorm {
    pub fn new(dim: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints(dim, "weight", candle_nn::Init::Const(1.0))?;
        let bias = vb.get_with_hints(dim, "bias", candle_nn::Init::Const(0.0))?;
        Ok(Self { weight, bias, eps })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        candle_nn::ops::layer_norm_slow(x, &self.weight, &self.bias, self.eps as f32)
    }
}
