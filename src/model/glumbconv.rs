//! GLUMBConv: gated depthwise-separable 1D conv block, timestep-conditioned.
//!
//! Used at every U-Net resolution for local mixing around the down/up
//! sampling steps:
//! ```text
//! x [B, C, L]
//!   → ScaleShift(t)
//!   → 1×1 conv (C → 2*hidden)
//!   → depthwise conv (groups=2*hidden, k=3)
//!   → chunk into (gate, value)
//!   → value * SiLU(gate)
//!   → 1×1 conv (hidden → C)
//!   → + x
//! ```

use candle_core::{Module, Result, Tensor};
use candle_nn::VarBuilder;

use super::modulation::ScaleShift;

/// Conditioned GLU Mobilenet-Block Convolution with a residual connection.
#[derive(Debug, Clone)]
pub struct GluMbConv {
    modulation: ScaleShift,
    /// 1×1 pointwise expansion: dim → 2 * hidden_features
    inverted_conv: candle_nn::Conv1d,
    /// Depthwise conv: groups = 2 * hidden_features, kernel_size = 3
    depth_conv: candle_nn::Conv1d,
    /// 1×1 pointwise projection: hidden_features → dim
    point_conv: candle_nn::Conv1d,
}

impl GluMbConv {
    pub fn new(dim: usize, hidden_features: usize, t_dim: usize, vb: VarBuilder) -> Result<Self> {
        let double_hidden = 2 * hidden_features;

        let inverted_conv = candle_nn::conv1d(
            dim,
            double_hidden,
            1,
            Default::default(),
            vb.pp("inverted_conv"),
        )?;

        let depth_cfg = candle_nn::Conv1dConfig {
            padding: 1,
            groups: double_hidden,
            ..Default::default()
        };
        let depth_conv = candle_nn::conv1d(
            double_hidden,
            double_hidden,
            3,
            depth_cfg,
            vb.pp("depth_conv"),
        )?;

        let point_conv = candle_nn::conv1d_no_bias(
            hidden_features,
            dim,
            1,
            Default::default(),
            vb.pp("point_conv"),
        )?;

        Ok(Self {
            modulation: ScaleShift::new(dim, t_dim, vb.pp("modulation"))?,
            inverted_conv,
            depth_conv,
            point_conv,
        })
    }

    /// `x`: `[B, C, L]`, `t`: `[B, T]` → `[B, C, L]`
    pub fn forward(&self, x: &Tensor, t: &Tensor) -> Result<Tensor> {
        let h = self.modulation.forward(x, t)?;
        let h = self.inverted_conv.forward(&h)?;
        let h = self.depth_conv.forward(&h)?;

        let chunks = h.chunk(2, 1)?;
        let gate = &chunks[0];
        let value = &chunks[1];
        let h = (value * candle_nn::Activation::Silu.forward(gate)?)?;

        x + self.point_conv.forward(&h)?
    }
}
