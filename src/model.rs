//! Network components.
//!
//! ## Components
//!
//! - [`encoder`] — audio features → condition embedding (ResiDual S4 stack)
//! - [`denoiser`] — condition + noisy signal + self-conditioning → clean-signal residual
//! - [`unet`] — multiscale backbone of the denoiser
//! - [`residual`] — dual-residual aggregation over sequence/channel mixers
//! - [`ssm`] — diagonal state-space (S4D) long convolution
//! - [`glumbconv`], [`modulation`], [`timestep`], [`norm`] — building blocks

pub mod denoiser;
pub mod encoder;
pub mod glumbconv;
pub mod modulation;
pub mod norm;
pub mod residual;
pub mod ssm;
pub mod timestep;
pub mod unet;
