//! EDM-style diffusion: noise-level distribution, preconditioning, training
//! loss and the reverse-time sampler.
//!
//! ## Formulation
//!
//! The forward process adds Gaussian noise: `x_σ = x_0 + σ · ε`.
//!
//! The raw network `F` is wrapped so its target has unit variance at every
//! noise level (σ_d = `sigma_data`):
//!
//! ```text
//! c_skip  = σ_d² / (σ² + σ_d²)
//! c_out   = σ · σ_d / √(σ² + σ_d²)
//! c_in    = 1 / √(σ² + σ_d²)
//! c_noise = ln(σ) / 4
//! D(x_σ, σ, y) = c_skip · x_σ + c_out · F(c_in · x_σ, c_noise, y)
//! ```
//!
//! Training draws `ln σ ~ N(P_mean, P_std²)` and weights the squared error by
//! `λ(σ) = (σ² + σ_d²) / (σ · σ_d)²`.
//!
//! - [`noise`] — seeded random draws
//! - [`schedule`] — sampling σ schedule and solver options

pub mod noise;
pub mod schedule;

use candle_core::{DType, Tensor};

use crate::config::DiffusionConfig;
use crate::{Error, Result};
use noise::NoiseSource;
use schedule::SamplerOptions;

/// The raw denoiser `F(c_in · x_σ, c_noise, y)`.
///
/// - `x`: `[B, X, L]` scaled noisy signal
/// - `c_noise`: `[B]` noise-level conditioning
/// - `y`: `[B, X, L]` self-conditioning estimate (zeros when absent)
pub trait Denoise {
    fn denoise(&self, x: &Tensor, c_noise: &Tensor, y: &Tensor) -> candle_core::Result<Tensor>;
}

impl<F> Denoise for F
where
    F: Fn(&Tensor, &Tensor, &Tensor) -> candle_core::Result<Tensor>,
{
    fn denoise(&self, x: &Tensor, c_noise: &Tensor, y: &Tensor) -> candle_core::Result<Tensor> {
        self(x, c_noise, y)
    }
}

/// Per-element preconditioning coefficients.
///
/// `c_skip`, `c_out`, `c_in` are `[B, 1, 1]`; `c_noise` is `[B]`.
#[derive(Debug, Clone)]
pub struct Precondition {
    pub c_skip: Tensor,
    pub c_out: Tensor,
    pub c_in: Tensor,
    pub c_noise: Tensor,
}

/// Noise-level distribution plus preconditioning, loss and sampler.
#[derive(Debug, Clone)]
pub struct Diffusion {
    cfg: DiffusionConfig,
}

impl Diffusion {
    pub fn new(cfg: DiffusionConfig) -> Result<Self> {
        cfg.validate()?;
        Ok(Self { cfg })
    }

    pub fn config(&self) -> &DiffusionConfig {
        &self.cfg
    }

    /// Coefficients for noise levels `sigma: [B]`.
    pub fn precondition(&self, sigma: &Tensor) -> Result<Precondition> {
        let b = sigma.dim(0)?;
        let sd = self.cfg.sigma_data;
        let sd2 = sd * sd;

        let total_var = (sigma.sqr()? + sd2)?;
        let total_std = total_var.sqrt()?;

        let c_skip = (total_var.recip()? * sd2)?;
        let c_out = ((sigma * sd)? / &total_std)?;
        let c_in = total_std.recip()?;
        let c_noise = (sigma.log()? / 4.0)?;

        Ok(Precondition {
            c_skip: c_skip.reshape((b, 1, 1))?,
            c_out: c_out.reshape((b, 1, 1))?,
            c_in: c_in.reshape((b, 1, 1))?,
            c_noise,
        })
    }

    /// Loss weight `λ(σ)` → `[B]`.
    pub fn loss_weight(&self, sigma: &Tensor) -> Result<Tensor> {
        let sd = self.cfg.sigma_data;
        let num = (sigma.sqr()? + sd * sd)?;
        let den = (sigma * sd)?.sqr()?;
        Ok((num / den)?)
    }

    /// Preconditioned clean-signal estimate `D(x_σ, σ, y)`.
    pub fn pred_x0(
        &self,
        model: &impl Denoise,
        x_t: &Tensor,
        sigma: &Tensor,
        y: &Tensor,
    ) -> Result<Tensor> {
        let p = self.precondition(sigma)?;
        let f = model.denoise(&x_t.broadcast_mul(&p.c_in)?, &p.c_noise, y)?;
        Ok((x_t.broadcast_mul(&p.c_skip)? + f.broadcast_mul(&p.c_out)?)?)
    }

    /// [`Self::pred_x0`] at one shared noise level.
    fn pred_x0_at(
        &self,
        model: &impl Denoise,
        x_t: &Tensor,
        sigma: f64,
        y: &Tensor,
    ) -> Result<Tensor> {
        let b = x_t.dim(0)?;
        let sigma = Tensor::full(sigma as f32, b, x_t.device())?;
        self.pred_x0(model, x_t, &sigma, y)
    }

    /// Weighted denoising loss for a clean batch `x0: [B, X, L]`.
    ///
    /// Every element draws its own σ, noise and self-conditioning branch. When
    /// the branch is taken, `y` is a detached first-pass estimate made with
    /// `y = 0`; otherwise `y` stays zero.
    pub fn loss(&self, model: &impl Denoise, x0: &Tensor, noise: &mut NoiseSource) -> Result<Tensor> {
        let (b, _, _) = x0.dims3()?;
        let device = x0.device();

        let sigma = noise.log_normal(b, self.cfg.p_mean, self.cfg.p_std, device)?;
        let eps = noise.randn(x0.shape(), device)?;
        let x_t = (x0 + eps.broadcast_mul(&sigma.reshape((b, 1, 1))?)?)?;

        let zeros = x0.zeros_like()?;
        let keep = noise.bernoulli(b, self.cfg.self_cond_prob);
        let y = if keep.iter().any(|&k| k) {
            let estimate = self.pred_x0(model, &x_t, &sigma, &zeros)?.detach();
            let mask: Vec<f32> = keep.iter().map(|&k| if k { 1.0 } else { 0.0 }).collect();
            let mask = Tensor::from_vec(mask, (b, 1, 1), device)?;
            estimate.broadcast_mul(&mask)?
        } else {
            zeros
        };

        let x0_hat = self.pred_x0(model, &x_t, &sigma, &y)?;
        let weight = self.loss_weight(&sigma)?.reshape((b, 1, 1))?;
        let loss = (x0_hat - x0)?.sqr()?.broadcast_mul(&weight)?.mean_all()?;
        Ok(loss)
    }

    /// Reverse-time Heun solve from `z` (already scaled by `opts.sigma_max`).
    ///
    /// The clean-signal estimate of every denoiser call becomes the
    /// self-conditioning input of the next one. The corrector is skipped on
    /// the final step into σ = 0. Every step is detached from the autograd
    /// graph, so the result carries no gradient back to the denoiser.
    pub fn sample(
        &self,
        model: &impl Denoise,
        num_steps: usize,
        z: &Tensor,
        opts: &SamplerOptions,
        noise: &mut NoiseSource,
    ) -> Result<Tensor> {
        if num_steps == 0 {
            return Err(Error::InvalidArgument("num_steps must be positive".into()));
        }
        if z.dtype() != DType::F32 {
            return Err(Error::InvalidArgument(format!(
                "initial latent must be f32, got {:?}",
                z.dtype()
            )));
        }

        let sigmas = opts.sigmas(num_steps);
        let mut x = z.detach();
        let mut y = x.zeros_like()?;

        for i in 0..num_steps {
            let t_cur = sigmas[i];
            let t_next = sigmas[i + 1];

            // Temporarily raise the noise level.
            let gamma = opts.churn_gamma(t_cur, num_steps);
            let t_hat = t_cur * (1.0 + gamma);
            let x_hat = if gamma > 0.0 {
                let extra = opts.s_noise * (t_hat * t_hat - t_cur * t_cur).sqrt();
                (&x + (noise.randn(x.shape(), x.device())? * extra)?)?
            } else {
                x.clone()
            };

            // Euler step.
            let denoised = self.pred_x0_at(model, &x_hat, t_hat, &y)?.detach();
            let d_cur = ((&x_hat - &denoised)? / t_hat)?;
            if opts.self_condition {
                y = denoised;
            }
            let mut x_next = (&x_hat + (&d_cur * (t_next - t_hat))?)?;

            // Second-order correction.
            if i + 1 < num_steps {
                let denoised = self.pred_x0_at(model, &x_next, t_next, &y)?.detach();
                let d_prime = ((&x_next - &denoised)? / t_next)?;
                if opts.self_condition {
                    y = denoised;
                }
                let d_avg = ((d_cur + d_prime)? * 0.5)?;
                x_next = (&x_hat + (d_avg * (t_next - t_hat))?)?;
            }

            tracing::debug!("sampler step {i}: sigma {t_hat:.4} -> {t_next:.4}");
            x = x_next.detach();
        }

        Ok(x)
    }
}
