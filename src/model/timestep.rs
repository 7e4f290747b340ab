//! Gaussian Fourier timestep embedding for diffusion conditioning.
//!
//! Converts scalar noise-level values to fixed-width embeddings:
//! random Fourier features → Linear → LayerNorm → SiLU → Linear → LayerNorm → SiLU
//!
//! The Fourier frequencies are drawn once at init and never trained. They are
//! stored with the other weights so a checkpoint reproduces the embedding.

use candle_core::{Result, Tensor};
use candle_nn::{self as nn, Init, Module, VarBuilder};

use super::norm::LayerNorm;

/// Timestep embedding `[B]` → `[B, T]`.
#[derive(Debug, Clone)]
pub struct TimestepEmbedding {
    freqs: Tensor,
    linear_1: nn::Linear,
    norm_1: LayerNorm,
    linear_2: nn::Linear,
    norm_2: LayerNorm,
}

impl TimestepEmbedding {
    /// Create a new timestep embedding.
    ///
    /// - `t_dim`: embedding width, must be even (half sine, half cosine)
    /// - `scale`: standard deviation of the random frequencies
    pub fn new(t_dim: usize, scale: f64, vb: VarBuilder) -> Result<Self> {
        if t_dim % 2 != 0 {
            candle_core::bail!("timestep embedding width must be even, got {t_dim}");
        }
        let freqs = vb.get_with_hints(
            t_dim / 2,
            "fourier.weight",
            Init::Randn {
                mean: 0.0,
                stdev: scale,
            },
        )?;
        Ok(Self {
            freqs,
            linear_1: nn::linear(t_dim, t_dim, vb.pp("linear_1"))?,
            norm_1: LayerNorm::new(t_dim, 1e-5, vb.pp("norm_1"))?,
            linear_2: nn::linear(t_dim, t_dim, vb.pp("linear_2"))?,
            norm_2: LayerNorm::new(t_dim, 1e-5, vb.pp("norm_2"))?,
        })
    }

    /// `t`: `[B]` → `[B, T]` sin/cos features of `2π · t · W`.
    fn fourier_features(&self, t: &Tensor) -> Result<Tensor> {
        let freqs = self.freqs.detach().unsqueeze(0)?;
        let theta = (t.unsqueeze(1)?.broadcast_mul(&freqs)? * (2.0 * std::f64::consts::PI))?;
        Tensor::cat(&[&theta.sin()?, &theta.cos()?], 1)
    }

    /// Forward pass: t `[B]` → `[B, T]`.
    pub fn forward(&self, t: &Tensor) -> Result<Tensor> {
        let h = self.fourier_features(t)?;
        let h = self.norm_1.forward(&self.linear_1.forward(&h)?)?.silu()?;
        self.norm_2.forward(&self.linear_2.forward(&h)?)?.silu()
    }

    /// Stored but untrained tensors.
    pub fn frozen_parameters(&self) -> Vec<Tensor> {
        vec![self.freqs.clone()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn embedding(t_dim: usize) -> TimestepEmbedding {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        TimestepEmbedding::new(t_dim, 30.0, vb.pp("te")).unwrap()
    }

    #[test]
    fn test_timestep_embedding_shape() {
        let te = embedding(8);
        let t = Tensor::new(&[0.5f32, -0.8, 0.0], &Device::Cpu).unwrap();
        let emb = te.forward(&t).unwrap();
        assert_eq!(emb.dims(), &[3, 8]);
    }

    #[test]
    fn test_odd_width_rejected() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        assert!(TimestepEmbedding::new(7, 30.0, vb).is_err());
    }

    #[test]
    fn test_fourier_features_vary_with_timestep() {
        let te = embedding(16);
        let dev = Device::Cpu;
        let f1 = te.fourier_features(&Tensor::new(&[0.1f32], &dev).unwrap()).unwrap();
        let f2 = te.fourier_features(&Tensor::new(&[0.9f32], &dev).unwrap()).unwrap();
        let diff: f32 = (f1 - f2).unwrap().abs().unwrap().sum_all().unwrap().to_scalar().unwrap();
        assert!(diff > 0.1);
    }

    #[test]
    fn test_fourier_features_lie_on_unit_circle() {
        let te = embedding(16);
        let dev = Device::Cpu;
        let f = te.fourier_features(&Tensor::new(&[0.37f32], &dev).unwrap()).unwrap();
        let sin = f.narrow(1, 0, 8).unwrap();
        let cos = f.narrow(1, 8, 8).unwrap();
        let radius: Vec<f32> = (sin.sqr().unwrap() + cos.sqr().unwrap())
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        assert!(radius.iter().all(|r| (r - 1.0).abs() < 1e-4));
    }
}
