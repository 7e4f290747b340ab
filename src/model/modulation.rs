//! Feature-wise affine modulation from the timestep embedding.
//!
//! `x' = norm(x) * (1 + scale) + shift`, with `(scale, shift)` projected from
//! the timestep embedding. The norm has no affine parameters of its own.

use candle_core::{Module, Result, Tensor};
use candle_nn::{self as nn, VarBuilder};

use super::norm::plain_channel_norm;

#[derive(Debug, Clone)]
pub struct ScaleShift {
    norm: nn::GroupNorm,
    to_scale_shift: nn::Linear,
}

impl ScaleShift {
    pub fn new(dim: usize, t_dim: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            norm: plain_channel_norm(dim, 1e-5, vb.device())?,
            to_scale_shift: nn::linear(t_dim, 2 * dim, vb.pp("to_scale_shift"))?,
        })
    }

    /// - `x`: `[B, C, L]`
    /// - `t`: `[B, T]` timestep embedding
    pub fn forward(&self, x: &Tensor, t: &Tensor) -> Result<Tensor> {
        // [B, 2C] → [B, 2C, 1] → (scale, shift) each [B, C, 1]
        let modulation = self.to_scale_shift.forward(t)?.unsqueeze(2)?;
        let chunks = modulation.chunk(2, 1)?;
        let scale_plus_one = (&chunks[0] + 1.0)?;
        self.norm
            .forward(x)?
            .broadcast_mul(&scale_plus_one)?
            .broadcast_add(&chunks[1])
    }
}
