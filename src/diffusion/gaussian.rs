//! Respaced Gaussian diffusion process.
//!
//! Holds the closed-form quantities of the reverse process for the respaced
//! trajectory and turns raw network outputs into the posterior mean and
//! variance of the next, less noisy sample.

use candle_core::Tensor;

use super::beta_schedule::named_beta_schedule;
use super::respace::space_timesteps;
use crate::config::ModelConfig;
use crate::error::{EggError, Result};

/// What the network's first `C` output channels predict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelMeanType {
    /// The noise that was added to the clean image.
    Epsilon,
    /// The clean image itself.
    StartX,
}

/// How the variance of each reverse step is obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelVarType {
    /// The network outputs `v` in `[-1, 1]` interpolating between the
    /// clipped posterior log variance and `log(beta_t)`.
    LearnedRange,
    /// `beta_t`, with the posterior variance at the first step.
    FixedLarge,
}

/// Mean and variance of `p(x_{t-1} | x_t)` for one step.
#[derive(Debug, Clone)]
pub struct MeanVariance {
    pub mean: Tensor,
    pub variance: Tensor,
    pub log_variance: Tensor,
    pub pred_xstart: Tensor,
}

#[derive(Debug, Clone)]
pub struct GaussianDiffusion {
    mean_type: ModelMeanType,
    var_type: ModelVarType,
    rescale_timesteps: bool,
    original_num_steps: usize,
    // respaced index -> training timestep
    timestep_map: Vec<usize>,

    betas: Vec<f64>,
    alphas_cumprod: Vec<f64>,
    alphas_cumprod_prev: Vec<f64>,
    sqrt_recip_alphas_cumprod: Vec<f64>,
    sqrt_recipm1_alphas_cumprod: Vec<f64>,
    posterior_variance: Vec<f64>,
    posterior_log_variance_clipped: Vec<f64>,
    posterior_mean_coef1: Vec<f64>,
    posterior_mean_coef2: Vec<f64>,
}

impl GaussianDiffusion {
    /// Builds the respaced process described by `config`.
    pub fn from_config(config: &ModelConfig) -> Result<Self> {
        let base_betas = named_beta_schedule(config.noise_schedule, config.diffusion_steps);
        let use_timesteps = space_timesteps(config.diffusion_steps, &config.timestep_respacing)?;
        if use_timesteps.is_empty() {
            return Err(EggError::InvalidRespacing {
                spacing: config.timestep_respacing.clone(),
                reason: "no timesteps selected".to_string(),
            });
        }

        // Re-derive betas so the kept steps reproduce the base alpha-bar curve.
        let base_alphas_cumprod = cumprod(base_betas.iter().map(|b| 1.0 - b));
        let mut last_alpha_cumprod = 1.0;
        let mut betas = Vec::with_capacity(use_timesteps.len());
        for &t in &use_timesteps {
            let alpha_cumprod = base_alphas_cumprod[t];
            betas.push(1.0 - alpha_cumprod / last_alpha_cumprod);
            last_alpha_cumprod = alpha_cumprod;
        }

        let mean_type = if config.predict_xstart {
            ModelMeanType::StartX
        } else {
            ModelMeanType::Epsilon
        };
        let var_type = if config.learn_sigma {
            ModelVarType::LearnedRange
        } else {
            ModelVarType::FixedLarge
        };

        Ok(Self::new(
            betas,
            use_timesteps,
            config.diffusion_steps,
            config.rescale_timesteps,
            mean_type,
            var_type,
        ))
    }

    fn new(
        betas: Vec<f64>,
        timestep_map: Vec<usize>,
        original_num_steps: usize,
        rescale_timesteps: bool,
        mean_type: ModelMeanType,
        var_type: ModelVarType,
    ) -> Self {
        let n = betas.len();
        let alphas: Vec<f64> = betas.iter().map(|b| 1.0 - b).collect();
        let alphas_cumprod = cumprod(alphas.iter().copied());
        let alphas_cumprod_prev: Vec<f64> = std::iter::once(1.0)
            .chain(alphas_cumprod[..n - 1].iter().copied())
            .collect();

        let sqrt_recip_alphas_cumprod = alphas_cumprod.iter().map(|a| (1.0 / a).sqrt()).collect();
        let sqrt_recipm1_alphas_cumprod =
            alphas_cumprod.iter().map(|a| (1.0 / a - 1.0).sqrt()).collect();

        let posterior_variance: Vec<f64> = (0..n)
            .map(|i| betas[i] * (1.0 - alphas_cumprod_prev[i]) / (1.0 - alphas_cumprod[i]))
            .collect();
        // The posterior variance is 0 at the first step; its log is clipped by
        // reusing the second entry.
        let first_nonzero = if n > 1 { posterior_variance[1] } else { betas[0] };
        let posterior_log_variance_clipped = (0..n)
            .map(|i| if i == 0 { first_nonzero.ln() } else { posterior_variance[i].ln() })
            .collect();
        let posterior_mean_coef1 = (0..n)
            .map(|i| betas[i] * alphas_cumprod_prev[i].sqrt() / (1.0 - alphas_cumprod[i]))
            .collect();
        let posterior_mean_coef2 = (0..n)
            .map(|i| (1.0 - alphas_cumprod_prev[i]) * alphas[i].sqrt() / (1.0 - alphas_cumprod[i]))
            .collect();

        Self {
            mean_type,
            var_type,
            rescale_timesteps,
            original_num_steps,
            timestep_map,
            betas,
            alphas_cumprod,
            alphas_cumprod_prev,
            sqrt_recip_alphas_cumprod,
            sqrt_recipm1_alphas_cumprod,
            posterior_variance,
            posterior_log_variance_clipped,
            posterior_mean_coef1,
            posterior_mean_coef2,
        }
    }

    /// Number of sampling steps.
    pub fn num_steps(&self) -> usize {
        self.betas.len()
    }

    pub fn mean_type(&self) -> ModelMeanType {
        self.mean_type
    }

    pub fn var_type(&self) -> ModelVarType {
        self.var_type
    }

    /// Training timestep each sampling index maps to, in increasing order.
    pub fn timestep_map(&self) -> &[usize] {
        &self.timestep_map
    }

    /// The timestep value passed to the network at sampling index `t`.
    pub fn model_timestep(&self, t: usize) -> f64 {
        let mapped = self.timestep_map[t] as f64;
        if self.rescale_timesteps {
            mapped * 1000.0 / self.original_num_steps as f64
        } else {
            mapped
        }
    }

    pub fn beta(&self, t: usize) -> f64 {
        self.betas[t]
    }

    /// Cumulative product of alphas up to and including index `t`.
    pub fn alpha_bar(&self, t: usize) -> f64 {
        self.alphas_cumprod[t]
    }

    pub fn alpha_bar_prev(&self, t: usize) -> f64 {
        self.alphas_cumprod_prev[t]
    }

    pub fn posterior_variance(&self, t: usize) -> f64 {
        self.posterior_variance[t]
    }

    /// Variance and log variance of the fixed variance at index `t`.
    fn fixed_variance(&self, t: usize) -> (f64, f64) {
        let variance = if t == 0 {
            self.posterior_variance.get(1).copied().unwrap_or(self.betas[0])
        } else {
            self.betas[t]
        };
        (variance, variance.ln())
    }

    /// Predicted clean image from a noise prediction.
    pub fn predict_xstart_from_eps(&self, x_t: &Tensor, t: usize, eps: &Tensor) -> Result<Tensor> {
        let scaled_x = x_t.affine(self.sqrt_recip_alphas_cumprod[t], 0.0)?;
        let scaled_eps = eps.affine(self.sqrt_recipm1_alphas_cumprod[t], 0.0)?;
        Ok((scaled_x - scaled_eps)?)
    }

    /// Mean of the forward-process posterior `q(x_{t-1} | x_t, x_0)`.
    pub fn q_posterior_mean(&self, x_start: &Tensor, x_t: &Tensor, t: usize) -> Result<Tensor> {
        let a = x_start.affine(self.posterior_mean_coef1[t], 0.0)?;
        let b = x_t.affine(self.posterior_mean_coef2[t], 0.0)?;
        Ok((a + b)?)
    }

    /// Interprets the raw network output for `x_t` at sampling index `t`.
    ///
    /// `model_output` has `C` channels, or `2C` when the variance is learned,
    /// where `C` is the channel count of `x_t`.
    pub fn p_mean_variance(
        &self,
        model_output: &Tensor,
        x_t: &Tensor,
        t: usize,
        clip_denoised: bool,
    ) -> Result<MeanVariance> {
        let channels = x_t.dim(1)?;
        let mut expected = x_t.dims().to_vec();
        if self.var_type == ModelVarType::LearnedRange {
            expected[1] = 2 * channels;
        }
        if model_output.dims() != expected.as_slice() {
            return Err(EggError::NetworkOutput {
                actual: model_output.dims().to_vec(),
                expected,
            });
        }

        let (model_output, variance, log_variance) = match self.var_type {
            ModelVarType::LearnedRange => {
                let output = model_output.narrow(1, 0, channels)?;
                let var_values = model_output.narrow(1, channels, channels)?;
                let min_log = self.posterior_log_variance_clipped[t];
                let max_log = self.betas[t].ln();
                // frac = (v + 1) / 2; log_var = frac * max_log + (1 - frac) * min_log
                let frac = var_values.affine(0.5, 0.5)?;
                let log_variance = frac.affine(max_log - min_log, min_log)?;
                let variance = log_variance.exp()?;
                (output, variance, log_variance)
            }
            ModelVarType::FixedLarge => {
                let (variance, log_variance) = self.fixed_variance(t);
                let ones = x_t.ones_like()?;
                (
                    model_output.clone(),
                    ones.affine(variance, 0.0)?,
                    ones.affine(log_variance, 0.0)?,
                )
            }
        };

        let pred_xstart = match self.mean_type {
            ModelMeanType::Epsilon => self.predict_xstart_from_eps(x_t, t, &model_output)?,
            ModelMeanType::StartX => model_output,
        };
        let pred_xstart = if clip_denoised {
            pred_xstart.clamp(-1f32, 1f32)?
        } else {
            pred_xstart
        };
        let mean = self.q_posterior_mean(&pred_xstart, x_t, t)?;

        Ok(MeanVariance {
            mean,
            variance,
            log_variance,
            pred_xstart,
        })
    }
}

fn cumprod(values: impl Iterator<Item = f64>) -> Vec<f64> {
    let mut acc = 1.0;
    values
        .map(|v| {
            acc *= v;
            acc
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use serde_yaml::Mapping;

    fn config(yaml: &str) -> ModelConfig {
        let overrides: Mapping = serde_yaml::from_str(yaml).unwrap();
        ModelConfig::default().merge(&overrides).unwrap()
    }

    #[test]
    fn respaced_alpha_bar_matches_base_schedule() {
        let full = GaussianDiffusion::from_config(&config("timestep_respacing: \"\"")).unwrap();
        let spaced = GaussianDiffusion::from_config(&ModelConfig::default()).unwrap();
        assert_eq!(full.num_steps(), 1000);
        assert_eq!(spaced.num_steps(), 50);
        for (i, &t) in spaced.timestep_map().iter().enumerate() {
            assert!((spaced.alpha_bar(i) - full.alpha_bar(t)).abs() < 1e-10);
        }
    }

    #[test]
    fn alpha_bar_decreases_with_noise_level() {
        let diffusion = GaussianDiffusion::from_config(&ModelConfig::default()).unwrap();
        let n = diffusion.num_steps();
        assert!(diffusion.alpha_bar(0) > 0.99);
        assert!(diffusion.alpha_bar(n - 1) < 1e-3);
        assert!((0..n - 1).all(|i| diffusion.alpha_bar(i) > diffusion.alpha_bar(i + 1)));
        assert_eq!(diffusion.posterior_variance(0), 0.0);
        assert_eq!(diffusion.alpha_bar_prev(0), 1.0);
    }

    #[test]
    fn model_timesteps_are_rescaled() {
        let diffusion =
            GaussianDiffusion::from_config(&config("diffusion_steps: 500\ntimestep_respacing: 5"))
                .unwrap();
        assert_eq!(diffusion.timestep_map(), &[0, 125, 250, 374, 499]);
        assert!((diffusion.model_timestep(4) - 998.0).abs() < 1e-9);

        let diffusion = GaussianDiffusion::from_config(&config(
            "diffusion_steps: 500\ntimestep_respacing: 5\nrescale_timesteps: false",
        ))
        .unwrap();
        assert_eq!(diffusion.model_timestep(4), 499.0);
    }

    #[test]
    fn variance_kinds() {
        let learned = GaussianDiffusion::from_config(&ModelConfig::default()).unwrap();
        assert_eq!(learned.var_type(), ModelVarType::LearnedRange);
        assert_eq!(learned.mean_type(), ModelMeanType::Epsilon);

        let fixed =
            GaussianDiffusion::from_config(&config("learn_sigma: false\npredict_xstart: true"))
                .unwrap();
        assert_eq!(fixed.var_type(), ModelVarType::FixedLarge);
        assert_eq!(fixed.mean_type(), ModelMeanType::StartX);
    }

    #[test]
    fn recovers_clean_image_from_true_noise() -> Result<()> {
        let device = Device::Cpu;
        let diffusion = GaussianDiffusion::from_config(&config("learn_sigma: false"))?;
        let t = 30;
        let x0 = Tensor::new(&[0.5f32, -0.25, 0.75, 0.0], &device)?.reshape((1, 1, 2, 2))?;
        let eps = Tensor::new(&[1.0f32, -1.0, 0.5, 2.0], &device)?.reshape((1, 1, 2, 2))?;
        let ab = diffusion.alpha_bar(t);
        let x_t = (x0.affine(ab.sqrt(), 0.0)? + eps.affine((1.0 - ab).sqrt(), 0.0)?)?;

        let out = diffusion.p_mean_variance(&eps, &x_t, t, false)?;
        let err = (out.pred_xstart - &x0)?.abs()?.max_all()?.to_scalar::<f32>()?;
        assert!(err < 1e-4);
        let var = out.variance.flatten_all()?.to_vec1::<f32>()?;
        assert!(var.iter().all(|&v| (v as f64 - diffusion.beta(t)).abs() < 1e-7));
        Ok(())
    }

    #[test]
    fn learned_range_interpolates_log_variance() -> Result<()> {
        let device = Device::Cpu;
        let diffusion = GaussianDiffusion::from_config(&ModelConfig::default())?;
        let t = 10;
        let x_t = Tensor::zeros((1, 1, 1, 1), DType::F32, &device)?;

        // v = 1 selects log(beta_t)
        let output = Tensor::new(&[0.0f32, 1.0], &device)?.reshape((1, 2, 1, 1))?;
        let out = diffusion.p_mean_variance(&output, &x_t, t, false)?;
        let log_var = out.log_variance.flatten_all()?.to_vec1::<f32>()?[0] as f64;
        assert!((log_var - diffusion.beta(t).ln()).abs() < 1e-4);

        // v = -1 selects the clipped posterior log variance
        let output = Tensor::new(&[0.0f32, -1.0], &device)?.reshape((1, 2, 1, 1))?;
        let out = diffusion.p_mean_variance(&output, &x_t, t, false)?;
        let var = out.variance.flatten_all()?.to_vec1::<f32>()?[0] as f64;
        let expected = diffusion.posterior_variance(t);
        assert!((var - expected).abs() / expected < 1e-4);
        Ok(())
    }

    #[test]
    fn rejects_wrong_output_channels() {
        let device = Device::Cpu;
        let diffusion = GaussianDiffusion::from_config(&ModelConfig::default()).unwrap();
        let x_t = Tensor::zeros((2, 3, 4, 4), DType::F32, &device).unwrap();
        let output = Tensor::zeros((2, 3, 4, 4), DType::F32, &device).unwrap();
        assert!(matches!(
            diffusion.p_mean_variance(&output, &x_t, 0, false),
            Err(EggError::NetworkOutput { .. })
        ));
    }
}
