//! Diffusion schedule: named beta schedules, timestep respacing and the
//! closed-form reverse-process quantities built from a [`ModelConfig`](crate::config::ModelConfig).

pub mod beta_schedule;
pub mod gaussian;
pub mod respace;

pub use gaussian::{GaussianDiffusion, MeanVariance, ModelMeanType, ModelVarType};
pub use respace::space_timesteps;
