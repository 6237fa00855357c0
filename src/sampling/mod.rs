//! Energy-guided sampling.

pub mod guidance;
pub mod guided_sampler;
pub mod image_utils;
pub mod noise;

pub use guidance::{
    energy_gradient, normalize_per_sample, per_sample_norms, Energies, EnergyFunction,
    EnergyGradient, GuidancePolicy, GuidanceSettings, NoEnergy,
};
pub use guided_sampler::{GuidedSampleIter, SampleOptions, StepOutput, IMAGE_CHANNELS};
pub use image_utils::{save_batch, save_image};
pub use noise::NoiseSource;
