//! Multiscale (U-shaped) sequence backbone.
//!
//! ```text
//! [B, H, L] ─ pad to a multiple of Π scales
//!   ─→ for s in scales:  GLUMBConv(t) ─ skip ─→ ↓s (unshuffle + 1×1 conv)
//!   ─→ ResiDual middle: [ScaleShift(S4 block), ScaleShift(1×1 conv)] × depth
//!   ─→ for s in scales reversed:  ↑s (1×1 conv + shuffle) ─ + skip ─→ GLUMBConv(t)
//!   ─→ crop to L
//! ```
//!
//! Width stays at `H` on every level. The padding is zeros at the end of the
//! sequence; position indices are extended contiguously over it and
//! subsampled alongside the activations.

use candle_core::{Module, Result, Tensor};
use candle_nn::{self as nn, VarBuilder};

use super::glumbconv::GluMbConv;
use super::residual::ResiDual;
use crate::config::DenoiserArgs;

/// Smallest multiple of `multiple` that is `>= len`.
pub fn padded_len(len: usize, multiple: usize) -> usize {
    len.div_ceil(multiple) * multiple
}

/// `[B, C, L·s]` → `[B, C·s, L]`.
fn unshuffle(x: &Tensor, s: usize) -> Result<Tensor> {
    let (b, c, l) = x.dims3()?;
    x.reshape((b, c, l / s, s))?
        .permute((0, 1, 3, 2))?
        .contiguous()?
        .reshape((b, c * s, l / s))
}

/// `[B, C·s, L]` → `[B, C, L·s]`.
fn shuffle(x: &Tensor, s: usize) -> Result<Tensor> {
    let (b, cs, l) = x.dims3()?;
    let c = cs / s;
    x.reshape((b, c, s, l))?
        .permute((0, 1, 3, 2))?
        .contiguous()?
        .reshape((b, c, l * s))
}

/// Continue `positions: [B, L]` by `pad` contiguous indices.
fn extend_positions(positions: &Tensor, pad: usize) -> Result<Tensor> {
    if pad == 0 {
        return Ok(positions.clone());
    }
    let (_b, l) = positions.dims2()?;
    let last = positions.narrow(1, l - 1, 1)?;
    let offsets = Tensor::arange(1u32, pad as u32 + 1, positions.device())?.unsqueeze(0)?;
    let tail = offsets.broadcast_add(&last)?;
    Tensor::cat(&[positions, &tail], 1)
}

/// Keep every `s`-th position.
fn subsample_positions(positions: &Tensor, s: usize) -> Result<Tensor> {
    let (_b, l) = positions.dims2()?;
    let index = Tensor::arange_step(0u32, l as u32, s as u32, positions.device())?;
    positions.index_select(&index, 1)
}

#[derive(Debug, Clone)]
struct DownStage {
    block: GluMbConv,
    /// 1×1 conv on the unshuffled sequence: H·s → H
    down: nn::Conv1d,
    scale: usize,
}

#[derive(Debug, Clone)]
struct UpStage {
    /// 1×1 conv before shuffling: H → H·s
    up: nn::Conv1d,
    block: GluMbConv,
    scale: usize,
}

/// U-Net over `[B, H, L]`, conditioned on a timestep embedding `[B, T]`.
#[derive(Debug, Clone)]
pub struct UNet {
    down: Vec<DownStage>,
    middle: ResiDual,
    up: Vec<UpStage>,
    total_scale: usize,
}

impl UNet {
    pub fn new(args: &DenoiserArgs, vb: VarBuilder) -> Result<Self> {
        let h = args.h_dim;
        let mut down = Vec::with_capacity(args.unet_scales.len());
        let mut up = Vec::with_capacity(args.unet_scales.len());

        for (i, &scale) in args.unet_scales.iter().enumerate() {
            if scale < 2 {
                candle_core::bail!("unet scale must be at least 2, got {scale}");
            }
            let vb_down = vb.pp(format!("down.{i}"));
            down.push(DownStage {
                block: GluMbConv::new(h, h, args.t_dim, vb_down.pp("block"))?,
                down: nn::conv1d(h * scale, h, 1, Default::default(), vb_down.pp("down"))?,
                scale,
            });
            let vb_up = vb.pp(format!("up.{i}"));
            up.push(UpStage {
                up: nn::conv1d(h, h * scale, 1, Default::default(), vb_up.pp("up"))?,
                block: GluMbConv::new(h, h, args.t_dim, vb_up.pp("block"))?,
                scale,
            });
        }

        let middle = ResiDual::sequence_stack(
            h,
            args.seq_depth,
            &args.ssm,
            Some(args.t_dim),
            vb.pp("middle"),
        )?;

        Ok(Self {
            down,
            middle,
            up,
            total_scale: args.total_scale(),
        })
    }

    /// - `x`: `[B, H, L]`
    /// - `positions`: `[B, L]` u32
    /// - `t`: `[B, T]`
    pub fn forward(&self, x: &Tensor, positions: &Tensor, t: &Tensor) -> Result<Tensor> {
        let len = x.dim(2)?;
        if len == 0 {
            candle_core::bail!("unet input sequence is empty");
        }
        let pad = padded_len(len, self.total_scale) - len;

        let mut h = x.pad_with_zeros(2, 0, pad)?;
        let mut pos = extend_positions(positions, pad)?;

        let mut skips = Vec::with_capacity(self.down.len());
        for stage in &self.down {
            h = stage.block.forward(&h, t)?;
            skips.push(h.clone());
            h = stage.down.forward(&unshuffle(&h, stage.scale)?)?;
            pos = subsample_positions(&pos, stage.scale)?;
        }

        h = self.middle.forward(&h, &pos, Some(t))?;

        // `up[i]` mirrors `down[i]`, so walk both from the innermost level.
        for (stage, skip) in self.up.iter().rev().zip(skips.into_iter().rev()) {
            h = shuffle(&stage.up.forward(&h)?, stage.scale)?;
            h = (h + skip)?;
            h = stage.block.forward(&h, t)?;
        }

        h.narrow(2, 0, len)
    }

    pub fn ssm_parameters(&self) -> Vec<Tensor> {
        self.middle.ssm_parameters()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SsmConfig;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn args(scales: Vec<usize>) -> DenoiserArgs {
        DenoiserArgs {
            t_dim: 8,
            h_dim: 8,
            unet_scales: scales,
            seq_depth: 1,
            fourier_scale: 30.0,
            ssm: SsmConfig {
                state_dim: 4,
                ..Default::default()
            },
        }
    }

    fn positions(b: usize, l: usize, dev: &Device) -> Tensor {
        Tensor::arange(0u32, l as u32, dev)
            .unwrap()
            .unsqueeze(0)
            .unwrap()
            .repeat((b, 1))
            .unwrap()
    }

    #[test]
    fn padded_len_rounds_up() {
        assert_eq!(padded_len(8, 4), 8);
        assert_eq!(padded_len(9, 4), 12);
        assert_eq!(padded_len(1, 8), 8);
        assert_eq!(padded_len(5, 1), 5);
    }

    #[test]
    fn shuffle_inverts_unshuffle() {
        let dev = Device::Cpu;
        let x = Tensor::randn(0f32, 1.0, (2, 3, 12), &dev).unwrap();
        let y = shuffle(&unshuffle(&x, 3).unwrap(), 3).unwrap();
        let diff: f32 = (x - y).unwrap().abs().unwrap().max_all().unwrap().to_scalar().unwrap();
        assert_eq!(diff, 0.0);
    }

    #[test]
    fn positions_stay_contiguous() {
        let dev = Device::Cpu;
        let p = positions(2, 5, &dev);
        let ext = extend_positions(&p, 3).unwrap();
        assert_eq!(ext.to_vec2::<u32>().unwrap()[1], vec![0, 1, 2, 3, 4, 5, 6, 7]);
        let sub = subsample_positions(&ext, 2).unwrap();
        assert_eq!(sub.to_vec2::<u32>().unwrap()[0], vec![0, 2, 4, 6]);
    }

    #[test]
    fn unet_preserves_shape_for_any_length() {
        let dev = Device::Cpu;
        for scales in [vec![], vec![2], vec![2, 3], vec![2, 2, 2]] {
            let varmap = VarMap::new();
            let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
            let unet = UNet::new(&args(scales.clone()), vb.pp("unet")).unwrap();
            for l in [1usize, 7, 12, 16] {
                let x = Tensor::randn(0f32, 1.0, (2, 8, l), &dev).unwrap();
                let t = Tensor::randn(0f32, 1.0, (2, 8), &dev).unwrap();
                let y = unet.forward(&x, &positions(2, l, &dev), &t).unwrap();
                assert_eq!(y.dims(), &[2, 8, l], "scales {scales:?}, len {l}");
            }
        }
    }

    #[test]
    fn zero_weights_stay_finite_on_padded_input() {
        let dev = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &dev);
        let x = Tensor::randn(0f32, 1.0, (1, 8, 10), &dev).unwrap();
        let padded = x.pad_with_zeros(2, 0, 2).unwrap();
        let cropped = padded.narrow(2, 0, 10).unwrap();
        let diff: f32 = (&x - cropped).unwrap().abs().unwrap().max_all().unwrap().to_scalar().unwrap();
        assert_eq!(diff, 0.0);

        let unet = UNet::new(&args(vec![4]), vb.pp("unet")).unwrap();
        let t = Tensor::randn(0f32, 1.0, (1, 8), &dev).unwrap();
        let y = unet.forward(&x, &positions(1, 10, &dev), &t).unwrap();
        assert_eq!(y.dims(), &[1, 8, 10]);
        let values: Vec<f32> = y.flatten_all().unwrap().to_vec1().unwrap();
        assert!(values.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn empty_sequence_is_an_error() {
        let dev = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &dev);
        let unet = UNet::new(&args(vec![2]), vb).unwrap();
        let x = Tensor::zeros((1, 8, 0), DType::F32, &dev).unwrap();
        let p = Tensor::zeros((1, 0), DType::U32, &dev).unwrap();
        let t = Tensor::zeros((1, 8), DType::F32, &dev).unwrap();
        assert!(unet.forward(&x, &p, &t).is_err());
    }

    #[test]
    fn ssm_parameters_come_from_middle() {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let mut a = args(vec![2]);
        a.seq_depth = 2;
        let unet = UNet::new(&a, vb).unwrap();
        assert_eq!(unet.ssm_parameters().len(), 6);
    }
}
