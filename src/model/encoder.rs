//! Audio condition encoder: `[B, A, L]` features → `[B, H, L]` embedding.
//!
//! A 1×1 projection to the hidden width followed by an unconditioned
//! [`ResiDual`] stack of (S4 block, 1×1 conv) pairs. Length is preserved.

use candle_core::{Module, Result, Tensor};
use candle_nn::{self as nn, VarBuilder};

use super::residual::ResiDual;
use crate::config::EncoderArgs;

#[derive(Debug, Clone)]
pub struct ConditionEncoder {
    proj_in: nn::Conv1d,
    net: ResiDual,
}

impl ConditionEncoder {
    pub fn new(a_dim: usize, args: &EncoderArgs, vb: VarBuilder) -> Result<Self> {
        let proj_in = nn::conv1d(a_dim, args.h_dim, 1, Default::default(), vb.pp("proj_in"))?;
        let net = ResiDual::sequence_stack(args.h_dim, args.num_layers, &args.ssm, None, vb.pp("net"))?;
        Ok(Self { proj_in, net })
    }

    /// - `a`: `[B, A, L]` audio features
    /// - `positions`: `[B, L]` u32
    pub fn forward(&self, a: &Tensor, positions: &Tensor) -> Result<Tensor> {
        let h = self.proj_in.forward(a)?;
        self.net.forward(&h, positions, None)
    }

    pub fn ssm_parameters(&self) -> Vec<Tensor> {
        self.net.ssm_parameters()
    }
}
