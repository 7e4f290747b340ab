//! Diagonal state-space sequence mixing (S4D).
//!
//! Each channel h runs a complex diagonal linear recurrence with N/2
//! conjugate-pair modes. Unrolled, the recurrence is a convolution whose
//! kernel spans the whole sequence:
//!
//! ```text
//! K[l] = 2 · Re Σ_n  C_n · (exp(Δt·A_n) - 1) / A_n · exp(Δt·A_n · l)
//! y    = K * x + D ⊙ x
//! ```
//!
//! Init follows S4D-Lin: `A_n = -½ + iπn`, `log Δt ~ U[ln dt_min, ln dt_max]`,
//! `C ~ N(0, ½)` per real/imaginary part. The bidirectional variant adds an
//! anti-causal kernel with its own `C`, so every output step sees every
//! input step.
//!
//! The convolution is a depthwise `conv1d` with the `[H, 2L - 1]` kernel
//! padded by `L - 1` on both sides, so memory stays linear in `L`.

use candle_core::{DType, Device, Module, Result, Tensor};
use candle_nn::{self as nn, Init, VarBuilder};

use crate::config::SsmConfig;

/// S4D layer: `[B, H, L]` → `[B, H, L]`.
#[derive(Debug, Clone)]
pub struct S4d {
    log_dt: Tensor,       // [H]
    log_a_real: Tensor,   // [H, N/2]
    a_imag_delta: Tensor, // [H, N/2], offset from the fixed πn init
    a_imag_base: Tensor,  // [H, N/2]
    c_re: Tensor,         // [dirs, H, N/2]
    c_im: Tensor,         // [dirs, H, N/2]
    d: Tensor,            // [H]
    bidirectional: bool,
}

impl S4d {
    pub fn new(channels: usize, cfg: &SsmConfig, vb: VarBuilder) -> Result<Self> {
        let modes = cfg.state_dim / 2;
        let dirs = if cfg.bidirectional { 2 } else { 1 };
        let c_init = Init::Randn {
            mean: 0.0,
            stdev: 0.5f64.sqrt(),
        };

        let log_dt = vb.get_with_hints(
            channels,
            "log_dt",
            Init::Uniform {
                lo: cfg.dt_min.ln(),
                up: cfg.dt_max.ln(),
            },
        )?;
        let log_a_real =
            vb.get_with_hints((channels, modes), "log_a_real", Init::Const(0.5f64.ln()))?;
        let a_imag_delta = vb.get_with_hints((channels, modes), "a_imag", Init::Const(0.0))?;
        let c_re = vb.get_with_hints((dirs, channels, modes), "c_re", c_init)?;
        let c_im = vb.get_with_hints((dirs, channels, modes), "c_im", c_init)?;
        let d = vb.get_with_hints(channels, "d", Init::Randn { mean: 0.0, stdev: 1.0 })?;

        let a_imag_base = (Tensor::arange(0u32, modes as u32, vb.device())?
            .to_dtype(DType::F32)?
            * std::f64::consts::PI)?
            .unsqueeze(0)?
            .broadcast_as((channels, modes))?
            .contiguous()?;

        Ok(Self {
            log_dt,
            log_a_real,
            a_imag_delta,
            a_imag_base,
            c_re,
            c_im,
            d,
            bidirectional: cfg.bidirectional,
        })
    }

    /// Kernel of direction `dir` evaluated at `lags: [M]` → `[H, M]`.
    fn kernel(&self, dir: usize, lags: &Tensor) -> Result<Tensor> {
        let dt = self.log_dt.exp()?.unsqueeze(1)?; // [H, 1]
        let a_re = self.log_a_real.exp()?.neg()?; // [H, N]
        let a_im = (&self.a_imag_base + &self.a_imag_delta)?;

        let dta_re = a_re.broadcast_mul(&dt)?;
        let dta_im = a_im.broadcast_mul(&dt)?;

        // Zero-order-hold factor (exp(ΔtA) - 1) / A.
        let growth = dta_re.exp()?;
        let num_re = ((&growth * dta_im.cos()?)? - 1.0)?;
        let num_im = (&growth * dta_im.sin()?)?;
        let den = (a_re.sqr()? + a_im.sqr()?)?;
        let zoh_re = ((&num_re * &a_re)? + (&num_im * &a_im)?)?.div(&den)?;
        let zoh_im = ((&num_im * &a_re)? - (&num_re * &a_im)?)?.div(&den)?;

        let c_re = self.c_re.get(dir)?;
        let c_im = self.c_im.get(dir)?;
        let cb_re = ((&c_re * &zoh_re)? - (&c_im * &zoh_im)?)?;
        let cb_im = ((&c_re * &zoh_im)? + (&c_im * &zoh_re)?)?;

        // Vandermonde exp(ΔtA · l): [H, N, M]
        let lags = lags.reshape((1, 1, lags.elem_count()))?;
        let decay = dta_re.unsqueeze(2)?.broadcast_mul(&lags)?.exp()?;
        let phase = dta_im.unsqueeze(2)?.broadcast_mul(&lags)?;
        let v_re = (&decay * phase.cos()?)?;
        let v_im = (&decay * phase.sin()?)?;

        let k = (cb_re.unsqueeze(2)?.broadcast_mul(&v_re)?
            - cb_im.unsqueeze(2)?.broadcast_mul(&v_im)?)?;
        k.sum(1)? * 2.0
    }

    /// Kernel laid out by offset `t - s + L - 1` → `[H, 2L - 1]`.
    fn full_kernel(&self, len: usize, device: &Device) -> Result<Tensor> {
        let forward_lags = Tensor::arange(0u32, len as u32, device)?.to_dtype(DType::F32)?;
        let forward = self.kernel(0, &forward_lags)?;
        if len == 1 {
            return Ok(forward);
        }

        let backward = if self.bidirectional {
            let lags: Vec<f32> = (1..len).rev().map(|l| l as f32).collect();
            let lags = Tensor::from_vec(lags, len - 1, device)?;
            self.kernel(1, &lags)?
        } else {
            Tensor::zeros((forward.dim(0)?, len - 1), DType::F32, device)?
        };
        Tensor::cat(&[&backward, &forward], 1)
    }

    /// Long convolution `y[h, t] = Σ_s K[h, t - s + L - 1] · x[h, s]` over `[B, H, L]`.
    fn long_conv(&self, x: &Tensor) -> Result<Tensor> {
        let (_b, channels, len) = x.dims3()?;
        if len == 0 {
            candle_core::bail!("s4d input sequence is empty");
        }
        let kernel = self.full_kernel(len, x.device())?;
        // conv1d correlates, so the offset axis is reversed: [H, 1, 2L - 1]
        let width = 2 * len - 1;
        let reverse: Vec<u32> = (0..width as u32).rev().collect();
        let reverse = Tensor::from_vec(reverse, width, x.device())?;
        let kernel = kernel
            .index_select(&reverse, 1)?
            .reshape((channels, 1, width))?;
        x.contiguous()?.conv1d(&kernel, len - 1, 1, 1, channels)
    }

    /// Dense mixing matrix `M[h, t, s]` → `[H, L, L]`.
    #[cfg(test)]
    fn toeplitz(&self, len: usize, device: &Device) -> Result<Tensor> {
        let kernel = self.full_kernel(len, device)?;
        let channels = kernel.dim(0)?;
        let index: Vec<u32> = (0..len)
            .flat_map(|t| (0..len).map(move |s| (t + len - 1 - s) as u32))
            .collect();
        let index = Tensor::from_vec(index, len * len, device)?;
        kernel
            .index_select(&index, 1)?
            .reshape((channels, len, len))
    }

    /// Parameters that get their own learning rate and no weight decay.
    pub fn ssm_parameters(&self) -> Vec<Tensor> {
        vec![
            self.log_dt.clone(),
            self.log_a_real.clone(),
            self.a_imag_delta.clone(),
        ]
    }
}

impl Module for S4d {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let h = x.dim(1)?;
        self.long_conv(x)? + x.broadcast_mul(&self.d.reshape((1, h, 1))?)?
    }
}

/// S4D → GELU → 1×1 conv (H → 2H) → GLU.
#[derive(Debug, Clone)]
pub struct S4Block {
    ssm: S4d,
    output_linear: nn::Conv1d,
}

impl S4Block {
    pub fn new(channels: usize, cfg: &SsmConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            ssm: S4d::new(channels, cfg, vb.pp("ssm"))?,
            output_linear: nn::conv1d(
                channels,
                2 * channels,
                1,
                Default::default(),
                vb.pp("output_linear"),
            )?,
        })
    }

    /// `[B, H, L]` → `[B, H, L]`. Positions are not needed by this mixer.
    pub fn forward(&self, x: &Tensor, _positions: &Tensor) -> Result<Tensor> {
        let h = self.ssm.forward(x)?.gelu()?;
        let h = self.output_linear.forward(&h)?;
        glu(&h)
    }

    pub fn ssm_parameters(&self) -> Vec<Tensor> {
        self.ssm.ssm_parameters()
    }
}

/// Gated linear unit over the channel dimension: `a ⊙ σ(b)`.
pub fn glu(x: &Tensor) -> Result<Tensor> {
    let chunks = x.chunk(2, 1)?;
    &chunks[0] * nn::ops::sigmoid(&chunks[1])?
}
