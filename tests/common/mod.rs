//! Tiny convolutional denoiser and checkpoint helpers shared by the
//! integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Module, Result, Tensor};
use candle_nn::{Conv2d, Conv2dConfig, VarBuilder};
use eggdiffusion::{DenoisingNetwork, ModelConfig};
use serde_yaml::{Mapping, Value};

pub const IMAGE_SIZE: usize = 8;
pub const NUM_STEPS: usize = 10;

/// Single 3x3 convolution predicting epsilon and the variance interpolation.
pub struct TinyDenoiser {
    conv: Conv2d,
}

impl TinyDenoiser {
    pub fn load(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let cfg = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let conv = candle_nn::conv2d(3, config.out_channels(), 3, cfg, vb.pp("conv"))?;
        Ok(Self { conv })
    }
}

impl DenoisingNetwork for TinyDenoiser {
    fn forward(
        &self,
        x: &Tensor,
        timesteps: &Tensor,
        _class_labels: Option<&Tensor>,
    ) -> Result<Tensor> {
        let batch = x.dim(0)?;
        let t = timesteps
            .to_dtype(x.dtype())?
            .affine(1e-4, 0.0)?
            .reshape((batch, 1, 1, 1))?;
        // bounded like a trained network: eps and the variance interpolation stay in [-1, 1]
        self.conv.forward(x)?.broadcast_add(&t)?.tanh()
    }
}

/// Deterministic small weights of the given shape.
fn weights(shape: &[usize], phase: f64) -> Result<Tensor> {
    let count: usize = shape.iter().product();
    Tensor::arange(0u32, count as u32, &Device::Cpu)?
        .to_dtype(DType::F32)?
        .affine(0.37, phase)?
        .sin()?
        .affine(0.05, 0.0)?
        .reshape(shape)
}

/// Writes a safetensors checkpoint for [`TinyDenoiser`] under `prefix`.
pub fn write_checkpoint_with_prefix(dir: &Path, out_channels: usize, prefix: &str) -> PathBuf {
    let path = dir.join("tiny.safetensors");
    let mut tensors = HashMap::new();
    tensors.insert(
        format!("{}conv.weight", prefix),
        weights(&[out_channels, 3, 3, 3], 0.0).unwrap(),
    );
    tensors.insert(
        format!("{}conv.bias", prefix),
        weights(&[out_channels], 1.3).unwrap(),
    );
    candle_core::safetensors::save(&tensors, &path).unwrap();
    path
}

pub fn write_checkpoint(dir: &Path) -> PathBuf {
    write_checkpoint_with_prefix(dir, 6, "")
}

/// Overrides that make the default config small and CPU-friendly.
pub fn small_overrides() -> Mapping {
    let mut overrides = Mapping::new();
    overrides.insert(Value::from("image_size"), Value::from(IMAGE_SIZE as u64));
    overrides.insert(Value::from("use_fp16"), Value::from(false));
    overrides
}

/// Per-sample squared distance to a constant grey level.
pub fn distance_to(target: f64) -> impl Fn(&Tensor) -> Result<eggdiffusion::Energies> {
    move |images: &Tensor| {
        let per_sample = images
            .affine(1.0, -target)?
            .sqr()?
            .flatten_from(1)?
            .mean(1)?;
        let mut energies = eggdiffusion::Energies::new();
        energies.insert("distance".to_string(), per_sample);
        Ok(energies)
    }
}

pub fn total_distance(images: &Tensor, target: f64) -> f32 {
    images
        .affine(1.0, -target)
        .unwrap()
        .sqr()
        .unwrap()
        .mean_all()
        .unwrap()
        .to_scalar::<f32>()
        .unwrap()
}

pub fn to_vec(t: &Tensor) -> Vec<f32> {
    t.flatten_all().unwrap().to_vec1::<f32>().unwrap()
}
