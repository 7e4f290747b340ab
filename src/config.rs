//! Configuration for the audio-to-beatmap diffusion model.
//!
//! Everything needed to rebuild the network shape and reproduce sampling
//! lives here: widths, depths, the U-Net scale list, the state-space layer
//! settings and the diffusion hyperparameters. Configs are stored as JSON next
//! to the safetensors checkpoint.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Diagonal state-space (S4D) layer settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SsmConfig {
    /// Complex state size N (N/2 conjugate pairs are stored).
    #[serde(default = "default_state_dim")]
    pub state_dim: usize,

    /// Lower bound of the log-uniform Δt initialisation.
    #[serde(default = "default_dt_min")]
    pub dt_min: f64,

    /// Upper bound of the log-uniform Δt initialisation.
    #[serde(default = "default_dt_max")]
    pub dt_max: f64,

    /// Add an anti-causal kernel so every step sees the whole sequence.
    #[serde(default = "default_bidirectional")]
    pub bidirectional: bool,
}

impl Default for SsmConfig {
    fn default() -> Self {
        Self {
            state_dim: default_state_dim(),
            dt_min: default_dt_min(),
            dt_max: default_dt_max(),
            bidirectional: default_bidirectional(),
        }
    }
}

/// Audio condition encoder shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncoderArgs {
    pub h_dim: usize,
    pub num_layers: usize,
    #[serde(default)]
    pub ssm: SsmConfig,
}

/// Denoiser shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DenoiserArgs {
    /// Timestep embedding width (must be even).
    pub t_dim: usize,
    /// Hidden width of the U-Net.
    pub h_dim: usize,
    /// Downsampling factor of each U-Net stage, outermost first.
    pub unet_scales: Vec<usize>,
    /// Number of (S4 block, 1×1 conv) pairs in the U-Net middle.
    pub seq_depth: usize,
    /// Standard deviation of the fixed Fourier frequencies.
    #[serde(default = "default_fourier_scale")]
    pub fourier_scale: f64,
    #[serde(default)]
    pub ssm: SsmConfig,
}

impl DenoiserArgs {
    /// Product of all scale factors: working lengths are padded to a multiple of this.
    pub fn total_scale(&self) -> usize {
        self.unet_scales.iter().product()
    }
}

/// Noise-level distribution and preconditioning hyperparameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffusionConfig {
    /// Mean of ln σ during training.
    #[serde(default = "default_p_mean")]
    pub p_mean: f64,

    /// Standard deviation of ln σ during training.
    #[serde(default = "default_p_std")]
    pub p_std: f64,

    /// Expected standard deviation of the clean signal.
    #[serde(default = "default_sigma_data")]
    pub sigma_data: f64,

    /// Probability that a training example receives a self-conditioning estimate.
    #[serde(default = "default_self_cond_prob")]
    pub self_cond_prob: f64,
}

impl Default for DiffusionConfig {
    fn default() -> Self {
        Self {
            p_mean: default_p_mean(),
            p_std: default_p_std(),
            sigma_data: default_sigma_data(),
            self_cond_prob: default_self_cond_prob(),
        }
    }
}

/// Optimizer and validation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Learning rate for every parameter outside the state-space layers.
    #[serde(default = "default_lr")]
    pub lr: f64,

    /// Learning rate for state-space parameters (trained without weight decay).
    #[serde(default = "default_s4_lr")]
    pub s4_lr: f64,

    #[serde(default = "default_weight_decay")]
    pub weight_decay: f64,

    #[serde(default = "default_beta1")]
    pub beta1: f64,

    #[serde(default = "default_beta2")]
    pub beta2: f64,

    #[serde(default = "default_eps")]
    pub eps: f64,

    /// Sampler steps used when a caller asks for `num_steps = 0`.
    #[serde(default = "default_val_steps")]
    pub val_steps: usize,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            lr: default_lr(),
            s4_lr: default_s4_lr(),
            weight_decay: default_weight_decay(),
            beta1: default_beta1(),
            beta2: default_beta2(),
            eps: default_eps(),
            val_steps: default_val_steps(),
        }
    }
}

/// Top-level model configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Audio feature channels A.
    pub a_dim: usize,
    /// Signal channels X.
    pub x_dim: usize,
    pub encoder: EncoderArgs,
    pub denoiser: DenoiserArgs,
    #[serde(default)]
    pub diffusion: DiffusionConfig,
    #[serde(default)]
    pub training: TrainingConfig,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            a_dim: 40,
            x_dim: 9,
            encoder: EncoderArgs {
                h_dim: 64,
                num_layers: 4,
                ssm: SsmConfig::default(),
            },
            denoiser: DenoiserArgs {
                t_dim: 64,
                h_dim: 128,
                unet_scales: vec![2, 2, 2],
                seq_depth: 4,
                fourier_scale: default_fourier_scale(),
                ssm: SsmConfig::default(),
            },
            diffusion: DiffusionConfig::default(),
            training: TrainingConfig::default(),
        }
    }
}

impl ModelConfig {
    /// Read and validate a JSON config.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let cfg: Self = serde_json::from_str(&text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn to_json_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path, text)?;
        Ok(())
    }

    /// Reject shapes and hyperparameters that cannot build a working model.
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("a_dim", self.a_dim),
            ("x_dim", self.x_dim),
            ("encoder.h_dim", self.encoder.h_dim),
            ("encoder.num_layers", self.encoder.num_layers),
            ("denoiser.t_dim", self.denoiser.t_dim),
            ("denoiser.h_dim", self.denoiser.h_dim),
            ("denoiser.seq_depth", self.denoiser.seq_depth),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(Error::Config(format!("{name} must be positive")));
            }
        }

        if self.denoiser.t_dim % 2 != 0 {
            return Err(Error::Config(format!(
                "denoiser.t_dim must be even for Fourier features, got {}",
                self.denoiser.t_dim
            )));
        }
        if let Some(&scale) = self.denoiser.unet_scales.iter().find(|&&s| s < 2) {
            return Err(Error::Config(format!(
                "every unet scale must be at least 2, got {scale}"
            )));
        }
        if self.denoiser.fourier_scale <= 0.0 {
            return Err(Error::Config("denoiser.fourier_scale must be positive".into()));
        }

        self.encoder.ssm.validate("encoder.ssm")?;
        self.denoiser.ssm.validate("denoiser.ssm")?;

        self.diffusion.validate()?;
        if self.training.val_steps == 0 {
            return Err(Error::Config("training.val_steps must be positive".into()));
        }
        Ok(())
    }
}

impl DiffusionConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.p_std > 0.0 && self.sigma_data > 0.0) {
            return Err(Error::Config(
                "diffusion.p_std and diffusion.sigma_data must be positive".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.self_cond_prob) {
            return Err(Error::Config(format!(
                "diffusion.self_cond_prob must lie in [0, 1], got {}",
                self.self_cond_prob
            )));
        }
        Ok(())
    }
}

impl SsmConfig {
    fn validate(&self, name: &str) -> Result<()> {
        if self.state_dim < 2 || self.state_dim % 2 != 0 {
            return Err(Error::Config(format!(
                "{name}.state_dim must be an even number >= 2, got {}",
                self.state_dim
            )));
        }
        if !(self.dt_min > 0.0 && self.dt_min <= self.dt_max) {
            return Err(Error::Config(format!(
                "{name}: need 0 < dt_min <= dt_max, got {} and {}",
                self.dt_min, self.dt_max
            )));
        }
        Ok(())
    }
}

fn default_state_dim() -> usize {
    64
}

fn default_dt_min() -> f64 {
    0.001
}

fn default_dt_max() -> f64 {
    0.1
}

fn default_bidirectional() -> bool {
    true
}

fn default_fourier_scale() -> f64 {
    30.0
}

fn default_p_mean() -> f64 {
    -1.2
}

fn default_p_std() -> f64 {
    1.2
}

fn default_sigma_data() -> f64 {
    0.5
}

fn default_self_cond_prob() -> f64 {
    0.5
}

fn default_lr() -> f64 {
    1e-4
}

fn default_s4_lr() -> f64 {
    1e-3
}

fn default_weight_decay() -> f64 {
    0.01
}

fn default_beta1() -> f64 {
    0.9
}

fn default_beta2() -> f64 {
    0.999
}

fn default_eps() -> f64 {
    1e-8
}

fn default_val_steps() -> usize {
    32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let cfg = ModelConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.denoiser.total_scale(), 8);
        assert_eq!(cfg.diffusion.sigma_data, 0.5);
    }

    #[test]
    fn odd_fourier_dim_rejected() {
        let mut cfg = ModelConfig::default();
        cfg.denoiser.t_dim = 7;
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn degenerate_scale_rejected() {
        let mut cfg = ModelConfig::default();
        cfg.denoiser.unet_scales = vec![2, 1];
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn empty_scale_list_is_allowed() {
        let mut cfg = ModelConfig::default();
        cfg.denoiser.unet_scales.clear();
        cfg.validate().unwrap();
        assert_eq!(cfg.denoiser.total_scale(), 1);
    }

    #[test]
    fn self_cond_prob_out_of_range_rejected() {
        let mut cfg = ModelConfig::default();
        cfg.diffusion.self_cond_prob = 1.5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn json_defaults_fill_missing_fields() {
        let json = r#"{
            "a_dim": 4,
            "x_dim": 2,
            "encoder": { "h_dim": 16, "num_layers": 1 },
            "denoiser": { "t_dim": 8, "h_dim": 16, "unet_scales": [2], "seq_depth": 1 }
        }"#;
        let cfg: ModelConfig = serde_json::from_str(json).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.encoder.ssm, SsmConfig::default());
        assert_eq!(cfg.diffusion.p_mean, -1.2);
        assert_eq!(cfg.training.val_steps, 32);
        assert_eq!(cfg.denoiser.fourier_scale, 30.0);
    }

    #[test]
    fn json_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.json");
        let cfg = ModelConfig::default();
        cfg.to_json_file(&path).unwrap();
        let loaded = ModelConfig::from_json_file(&path).unwrap();
        assert_eq!(loaded, cfg);
    }
}
