//! Reproducible random draws for training and sampling.
//!
//! Uses `ChaCha8Rng` so a seed fixes every σ draw, every noise tensor and
//! every self-conditioning coin flip. Each batch element gets its own draws.

use candle_core::{Device, Result, Shape, Tensor};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;

/// Seeded source of Gaussian, log-normal and Bernoulli tensors.
pub struct NoiseSource {
    rng: ChaCha8Rng,
}

impl NoiseSource {
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    /// Seed from the operating system.
    pub fn from_os_rng() -> Self {
        Self {
            rng: ChaCha8Rng::from_os_rng(),
        }
    }

    /// Standard normal tensor of the given shape.
    pub fn randn<S: Into<Shape>>(&mut self, shape: S, device: &Device) -> Result<Tensor> {
        let shape = shape.into();
        let data: Vec<f32> = (0..shape.elem_count())
            .map(|_| self.rng.sample::<f32, _>(StandardNormal))
            .collect();
        Tensor::from_vec(data, shape, device)
    }

    /// `n` independent draws of `exp(mean + std * N(0, 1))` → `[n]`.
    pub fn log_normal(&mut self, n: usize, mean: f64, std: f64, device: &Device) -> Result<Tensor> {
        let data: Vec<f32> = (0..n)
            .map(|_| {
                let z: f64 = self.rng.sample(StandardNormal);
                (mean + std * z).exp() as f32
            })
            .collect();
        Tensor::from_vec(data, n, device)
    }

    /// `n` independent coin flips with success probability `p`.
    pub fn bernoulli(&mut self, n: usize, p: f64) -> Vec<bool> {
        (0..n).map(|_| self.rng.random_bool(p)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_same_noise() {
        let dev = Device::Cpu;
        let a = NoiseSource::seeded(7).randn((2, 3, 4), &dev).unwrap();
        let b = NoiseSource::seeded(7).randn((2, 3, 4), &dev).unwrap();
        let diff: f32 = (a - b).unwrap().abs().unwrap().sum_all().unwrap().to_scalar().unwrap();
        assert_eq!(diff, 0.0);
    }

    #[test]
    fn randn_has_unit_scale() {
        let dev = Device::Cpu;
        let x = NoiseSource::seeded(1).randn(20_000, &dev).unwrap();
        let mean: f32 = x.mean_all().unwrap().to_scalar().unwrap();
        let var: f32 = x.sqr().unwrap().mean_all().unwrap().to_scalar().unwrap();
        assert!(mean.abs() < 0.05, "mean = {mean}");
        assert!((var - 1.0).abs() < 0.05, "var = {var}");
    }

    #[test]
    fn log_normal_is_positive_and_centered() {
        let dev = Device::Cpu;
        let sigma = NoiseSource::seeded(3)
            .log_normal(10_000, -1.2, 1.2, &dev)
            .unwrap();
        let values: Vec<f32> = sigma.to_vec1().unwrap();
        assert!(values.iter().all(|&s| s > 0.0));
        let log_mean = values.iter().map(|s| s.ln() as f64).sum::<f64>() / values.len() as f64;
        assert!((log_mean + 1.2).abs() < 0.05, "log mean = {log_mean}");
    }

    #[test]
    fn bernoulli_extremes() {
        let mut noise = NoiseSource::seeded(0);
        assert!(noise.bernoulli(64, 0.0).iter().all(|&b| !b));
        assert!(noise.bernoulli(64, 1.0).iter().all(|&b| b));
    }
}
