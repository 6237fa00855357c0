//! Seedable Gaussian noise for the reverse process.

use candle_core::{Device, Shape, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

use crate::error::Result;

/// Draws standard normal tensors from a host-side RNG so that a seed gives
/// the same noise on every device.
pub struct NoiseSource {
    rng: StdRng,
}

impl NoiseSource {
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn from_entropy() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    pub fn new(seed: Option<u64>) -> Self {
        match seed {
            Some(seed) => Self::seeded(seed),
            None => Self::from_entropy(),
        }
    }

    /// F32 tensor of i.i.d. N(0, 1) samples.
    pub fn randn<S: Into<Shape>>(&mut self, shape: S, device: &Device) -> Result<Tensor> {
        let shape = shape.into();
        let data: Vec<f32> = (0..shape.elem_count())
            .map(|_| self.rng.sample::<f32, _>(StandardNormal))
            .collect();
        Ok(Tensor::from_vec(data, shape, device)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_same_noise() -> Result<()> {
        let a = NoiseSource::seeded(7).randn((2, 3), &Device::Cpu)?;
        let b = NoiseSource::seeded(7).randn((2, 3), &Device::Cpu)?;
        assert_eq!(a.to_vec2::<f32>()?, b.to_vec2::<f32>()?);

        let c = NoiseSource::seeded(8).randn((2, 3), &Device::Cpu)?;
        assert_ne!(a.to_vec2::<f32>()?, c.to_vec2::<f32>()?);
        Ok(())
    }

    #[test]
    fn roughly_standard_normal() -> Result<()> {
        let samples = NoiseSource::seeded(0).randn(10_000, &Device::Cpu)?.to_vec1::<f32>()?;
        let mean = samples.iter().sum::<f32>() / samples.len() as f32;
        let var = samples.iter().map(|x| (x - mean).powi(2)).sum::<f32>() / samples.len() as f32;
        assert!(mean.abs() < 0.05);
        assert!((var - 1.0).abs() < 0.05);
        Ok(())
    }
}
