//! Sampling-time noise-level schedule and solver options.
//!
//! Noise levels follow the Karras et al. spacing:
//!
//! ```text
//! σ_i = (σ_max^(1/ρ) + i / (N - 1) · (σ_min^(1/ρ) - σ_max^(1/ρ)))^ρ,   i = 0..N-1
//! σ_N = 0
//! ```
//!
//! Larger `rho` concentrates steps near σ_min.

use serde::{Deserialize, Serialize};

/// Tuning knobs for the reverse-time solver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplerOptions {
    #[serde(default = "default_sigma_min")]
    pub sigma_min: f64,

    /// Starting noise level; the initial latent must already be scaled by it.
    #[serde(default = "default_sigma_max")]
    pub sigma_max: f64,

    #[serde(default = "default_rho")]
    pub rho: f64,

    /// Total stochasticity. Zero gives a deterministic ODE solve.
    #[serde(default)]
    pub s_churn: f64,

    /// Churn is only applied for σ in `[s_tmin, s_tmax]`.
    #[serde(default)]
    pub s_tmin: f64,

    /// `None` leaves the churn window unbounded above.
    #[serde(default)]
    pub s_tmax: Option<f64>,

    /// Scale of the noise re-injected by churn.
    #[serde(default = "default_s_noise")]
    pub s_noise: f64,

    /// Feed each clean-signal estimate back into the next denoiser call.
    #[serde(default = "default_self_condition")]
    pub self_condition: bool,
}

impl Default for SamplerOptions {
    fn default() -> Self {
        Self {
            sigma_min: default_sigma_min(),
            sigma_max: default_sigma_max(),
            rho: default_rho(),
            s_churn: 0.0,
            s_tmin: 0.0,
            s_tmax: None,
            s_noise: default_s_noise(),
            self_condition: default_self_condition(),
        }
    }
}

impl SamplerOptions {
    /// Decreasing noise levels for `num_steps` steps, terminated by 0.
    ///
    /// Returns `num_steps + 1` values.
    pub fn sigmas(&self, num_steps: usize) -> Vec<f64> {
        let inv_rho = 1.0 / self.rho;
        let max_inv = self.sigma_max.powf(inv_rho);
        let min_inv = self.sigma_min.powf(inv_rho);
        let denom = (num_steps.max(2) - 1) as f64;

        let mut sigmas: Vec<f64> = (0..num_steps)
            .map(|i| (max_inv + i as f64 / denom * (min_inv - max_inv)).powf(self.rho))
            .collect();
        sigmas.push(0.0);
        sigmas
    }

    /// Churn factor γ for a step starting at `sigma`.
    pub fn churn_gamma(&self, sigma: f64, num_steps: usize) -> f64 {
        let in_window = sigma >= self.s_tmin && self.s_tmax.is_none_or(|max| sigma <= max);
        if self.s_churn > 0.0 && in_window {
            (self.s_churn / num_steps as f64).min(std::f64::consts::SQRT_2 - 1.0)
        } else {
            0.0
        }
    }
}

fn default_sigma_min() -> f64 {
    0.002
}

fn default_sigma_max() -> f64 {
    80.0
}

fn default_rho() -> f64 {
    7.0
}

fn default_s_noise() -> f64 {
    1.0
}

fn default_self_condition() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sigmas_setup() {
        let opts = SamplerOptions::default();
        let sigmas = opts.sigmas(32);

        assert_eq!(sigmas.len(), 33);
        assert!((sigmas[0] - 80.0).abs() < 1e-9, "first sigma = {}", sigmas[0]);
        assert!((sigmas[31] - 0.002).abs() < 1e-9, "last sigma = {}", sigmas[31]);
        assert_eq!(sigmas[32], 0.0);

        for i in 0..32 {
            assert!(
                sigmas[i] > sigmas[i + 1],
                "sigmas not decreasing at {i}: {} vs {}",
                sigmas[i],
                sigmas[i + 1]
            );
        }
    }

    #[test]
    fn single_step_goes_straight_to_zero() {
        let sigmas = SamplerOptions::default().sigmas(1);
        assert_eq!(sigmas, vec![80.0, 0.0]);
    }

    #[test]
    fn churn_disabled_by_default() {
        let opts = SamplerOptions::default();
        assert_eq!(opts.churn_gamma(10.0, 16), 0.0);
    }

    #[test]
    fn churn_is_clamped_and_windowed() {
        let opts = SamplerOptions {
            s_churn: 100.0,
            s_tmin: 0.05,
            s_tmax: Some(50.0),
            ..Default::default()
        };
        let gamma = opts.churn_gamma(1.0, 10);
        assert!((gamma - (std::f64::consts::SQRT_2 - 1.0)).abs() < 1e-12);
        assert_eq!(opts.churn_gamma(60.0, 10), 0.0);
        assert_eq!(opts.churn_gamma(0.01, 10), 0.0);
    }
}
