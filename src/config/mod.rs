//! Model and diffusion hyperparameters.
//!
//! `ModelConfig` carries everything the network provider and the diffusion
//! schedule are built from. It starts from the energy-guidance defaults
//! (256x256 unconditional model, 1000-step linear schedule respaced to 50
//! steps, learned sigma, fp16) and accepts caller overrides as a YAML mapping.
//! Overrides are merged key by key with the caller winning; keys that are not
//! fields of `ModelConfig` are rejected.

pub mod device;

pub use device::DeviceSelection;

use std::fs;
use std::path::Path;

use candle_core::DType;
use log::debug;
use serde::{Deserialize, Deserializer, Serialize};
use serde_yaml::{Mapping, Value};

use crate::diffusion::respace::space_timesteps;
use crate::error::{EggError, Result};

/// Named beta schedule used by the full-length training process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NoiseSchedule {
    /// Linear betas, scaled so that 1000 steps run from 1e-4 to 0.02.
    #[default]
    Linear,
    /// Squared-cosine alpha-bar curve.
    Cosine,
}

impl NoiseSchedule {
    pub fn as_str(&self) -> &'static str {
        match self {
            NoiseSchedule::Linear => "linear",
            NoiseSchedule::Cosine => "cosine",
        }
    }
}

impl std::fmt::Display for NoiseSchedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Hyperparameters of the denoising network and its diffusion schedule.
///
/// Architecture fields (`num_channels`, `attention_resolutions`, ...) are
/// consumed by the [`NetworkProvider`](crate::models::NetworkProvider);
/// `use_kl` and `rescale_learned_sigmas` only matter for training and are
/// carried so that configs written for the pretrained checkpoints load as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelConfig {
    pub image_size: usize,
    pub num_channels: usize,
    pub num_res_blocks: usize,
    pub num_heads: i64,
    pub num_heads_upsample: i64,
    pub num_head_channels: i64,
    #[serde(deserialize_with = "string_or_number")]
    pub attention_resolutions: String,
    #[serde(deserialize_with = "string_or_number")]
    pub channel_mult: String,
    pub dropout: f64,
    pub class_cond: bool,
    pub use_checkpoint: bool,
    pub use_scale_shift_norm: bool,
    pub resblock_updown: bool,
    pub use_fp16: bool,
    pub use_new_attention_order: bool,
    pub learn_sigma: bool,
    pub diffusion_steps: usize,
    pub noise_schedule: NoiseSchedule,
    #[serde(deserialize_with = "string_or_number")]
    pub timestep_respacing: String,
    pub use_kl: bool,
    pub predict_xstart: bool,
    pub rescale_timesteps: bool,
    pub rescale_learned_sigmas: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            image_size: 256,
            num_channels: 256,
            num_res_blocks: 2,
            num_heads: 4,
            num_heads_upsample: -1,
            num_head_channels: 64,
            attention_resolutions: "32,16,8".to_string(),
            channel_mult: String::new(),
            dropout: 0.0,
            class_cond: false,
            use_checkpoint: false,
            use_scale_shift_norm: true,
            resblock_updown: true,
            use_fp16: true,
            use_new_attention_order: false,
            learn_sigma: true,
            diffusion_steps: 1000,
            noise_schedule: NoiseSchedule::Linear,
            timestep_respacing: "50".to_string(),
            use_kl: false,
            predict_xstart: false,
            rescale_timesteps: true,
            rescale_learned_sigmas: false,
        }
    }
}

impl ModelConfig {
    /// Default configuration respaced to `num_steps` sampling steps.
    pub fn for_steps(num_steps: usize) -> Self {
        Self {
            timestep_respacing: num_steps.to_string(),
            ..Self::default()
        }
    }

    /// Builds the configuration used by a sampler: defaults, respacing set
    /// to `num_steps`, then `overrides` on top.
    pub fn resolve(num_steps: usize, overrides: Option<&Mapping>) -> Result<Self> {
        let base = Self::for_steps(num_steps);
        let config = match overrides {
            Some(overrides) => base.merge(overrides)?,
            None => base,
        };
        config.validate()?;
        Ok(config)
    }

    /// Returns a copy with `overrides` applied key by key.
    ///
    /// Fails with [`EggError::UnknownConfigKey`] for keys that are not
    /// fields of `ModelConfig` and [`EggError::InvalidConfig`] for values of
    /// the wrong type.
    pub fn merge(&self, overrides: &Mapping) -> Result<Self> {
        let Value::Mapping(mut merged) =
            serde_yaml::to_value(self).map_err(|e| EggError::InvalidConfig(e.to_string()))?
        else {
            return Err(EggError::InvalidConfig(
                "config did not serialize to a mapping".to_string(),
            ));
        };

        for (key, value) in overrides {
            let name = match key {
                Value::String(name) => name.clone(),
                other => {
                    return Err(EggError::InvalidConfig(format!(
                        "override keys must be strings, got {:?}",
                        other
                    )))
                }
            };
            if !merged.contains_key(key) {
                return Err(EggError::UnknownConfigKey(name));
            }
            debug!("config override: {} = {:?}", name, value);
            merged.insert(key.clone(), value.clone());
        }

        serde_yaml::from_value(Value::Mapping(merged))
            .map_err(|e| EggError::InvalidConfig(e.to_string()))
    }

    /// Checks the fields the schedule depends on.
    pub fn validate(&self) -> Result<()> {
        if self.image_size == 0 {
            return Err(EggError::InvalidConfig("image_size must be > 0".to_string()));
        }
        if self.diffusion_steps == 0 {
            return Err(EggError::InvalidConfig(
                "diffusion_steps must be > 0".to_string(),
            ));
        }
        space_timesteps(self.diffusion_steps, &self.timestep_respacing)?;
        self.attention_downsample_rates()?;
        Ok(())
    }

    /// Number of channels the network is expected to output: image channels,
    /// doubled when the network also predicts the variance interpolation.
    pub fn out_channels(&self) -> usize {
        if self.learn_sigma {
            6
        } else {
            3
        }
    }

    /// Weight dtype of the network after loading.
    pub fn dtype(&self) -> DType {
        if self.use_fp16 {
            DType::F16
        } else {
            DType::F32
        }
    }

    /// Channel multipliers per resolution level, explicit or derived from
    /// the image size.
    pub fn channel_mult(&self) -> Result<Vec<usize>> {
        if !self.channel_mult.trim().is_empty() {
            return parse_usize_list(&self.channel_mult, "channel_mult");
        }
        match self.image_size {
            512 => Ok(vec![1, 1, 2, 2, 4, 4]),
            256 => Ok(vec![1, 1, 2, 2, 4, 4]),
            128 => Ok(vec![1, 1, 2, 3, 4]),
            64 => Ok(vec![1, 2, 3, 4]),
            other => Err(EggError::InvalidConfig(format!(
                "no default channel_mult for image_size {}",
                other
            ))),
        }
    }

    /// Downsample rates at which attention is applied, i.e.
    /// `image_size / resolution` for each entry of `attention_resolutions`.
    pub fn attention_downsample_rates(&self) -> Result<Vec<usize>> {
        let resolutions = parse_usize_list(&self.attention_resolutions, "attention_resolutions")?;
        resolutions
            .into_iter()
            .map(|res| {
                if res == 0 {
                    Err(EggError::InvalidConfig(
                        "attention resolution must be > 0".to_string(),
                    ))
                } else {
                    Ok(self.image_size / res)
                }
            })
            .collect()
    }
}

/// Reads a YAML file of config overrides. An empty file yields no overrides.
pub fn load_overrides(path: &Path) -> Result<Mapping> {
    let text = fs::read_to_string(path)?;
    match serde_yaml::from_str::<Value>(&text) {
        Ok(Value::Mapping(mapping)) => Ok(mapping),
        Ok(Value::Null) => Ok(Mapping::new()),
        Ok(_) => Err(EggError::InvalidConfig(format!(
            "{} must contain a mapping of overrides",
            path.display()
        ))),
        Err(e) => Err(EggError::InvalidConfig(format!(
            "failed to parse {}: {}",
            path.display(),
            e
        ))),
    }
}

fn parse_usize_list(value: &str, field: &str) -> Result<Vec<usize>> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<usize>().map_err(|_| {
                EggError::InvalidConfig(format!("{}: `{}` is not an integer", field, s))
            })
        })
        .collect()
}

/// Accepts `"50"` as well as `50` for string-typed fields.
fn string_or_number<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrNumber {
        String(String),
        Int(i64),
    }

    match StringOrNumber::deserialize(deserializer)? {
        StringOrNumber::String(s) => Ok(s),
        StringOrNumber::Int(n) => Ok(n.to_string()),
    }
}
