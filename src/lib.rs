//! Audio-conditioned diffusion for rhythm-game beatmap signals, in pure Rust.
//!
//! A candle-based denoising diffusion model that turns a sequence of audio
//! features into a sequence of continuous control signals of the same length.
//!
//! ## Architecture
//!
//! ```text
//! audio [B, A, L] ─→ ConditionEncoder (S4 ResiDual) ─→ c [B, H, L] ──┐
//!                                                                    │
//! σ ─→ preconditioning ─→ c_noise ─→ Fourier embedding ─┐            │
//!                                                       ↓            ↓
//! x_σ, y (self-conditioning) ─────────────→ DenoisingNetwork (U-Net, S4 middle)
//!                                                       ↓
//!                                      D(x_σ, σ, y) = c_skip·x_σ + c_out·F
//! ```
//!
//! Training minimises the σ-weighted error of `D` against the clean signal;
//! sampling integrates the reverse ODE with a Heun solver.
//!
//! ## Modules
//!
//! - [`config`] — model, diffusion and optimizer settings (JSON)
//! - [`diffusion`] — preconditioning, loss, σ schedule and sampler
//! - [`model`] — encoder, denoiser and their building blocks
//! - [`training`] — the top-level model, parameter groups and optimizers

pub mod config;
pub mod diffusion;
pub mod model;
pub mod training;

mod error;

pub use error::{Error, Result};
