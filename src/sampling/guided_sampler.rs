//! The energy-guided reverse diffusion loop.
//!
//! [`GuidedSampleIter`] runs one reverse step per call to `next`, so callers
//! see every intermediate batch without the whole trajectory being buffered.
//! Each step:
//!
//! 1. runs the denoiser on the current sample (no gradient is recorded),
//! 2. converts its output into the posterior mean and variance,
//! 3. differentiates the energy w.r.t. the current sample,
//! 4. adds the weighted, optionally normalised gradient correction to the mean,
//! 5. draws the next sample around the corrected mean (the last step is
//!    deterministic).

use std::collections::BTreeMap;

use candle_core::{DType, Device, Tensor};
use log::{debug, info};

use super::guidance::{energy_gradient, EnergyFunction, GuidancePolicy, GuidanceSettings};
use super::noise::NoiseSource;
use crate::config::ModelConfig;
use crate::diffusion::{GaussianDiffusion, MeanVariance};
use crate::error::{EggError, Result};
use crate::models::DenoisingNetwork;

/// Channels of the generated images.
pub const IMAGE_CHANNELS: usize = 3;

/// Per-call sampling options.
#[derive(Debug, Clone)]
pub struct SampleOptions {
    /// Multiplier of the energy gradient. `0.0` disables guidance.
    pub energy_scale: f64,
    pub num_samples: usize,
    /// Weight guidance by `1 - alpha_bar_t` instead of the step variance.
    pub use_alpha_bar: bool,
    /// Rescale each sample's energy gradient to unit norm before scaling.
    pub normalize_grad: bool,
    /// Clamp the predicted clean image to `[-1, 1]`.
    pub clip_denoised: bool,
    /// Seed for the initial and per-step noise. `None` draws from entropy.
    pub seed: Option<u64>,
    /// Starting sample instead of fresh noise, shape `(num_samples, 3, H, W)`.
    pub initial_noise: Option<Tensor>,
    /// Class labels `(num_samples,)` for class-conditional networks.
    pub class_labels: Option<Tensor>,
    /// Show a terminal progress bar (needs the `progress-bar` feature).
    pub progress: bool,
}

impl Default for SampleOptions {
    fn default() -> Self {
        Self {
            energy_scale: 1.0,
            num_samples: 1,
            use_alpha_bar: false,
            normalize_grad: true,
            clip_denoised: false,
            seed: None,
            initial_noise: None,
            class_labels: None,
            progress: false,
        }
    }
}

impl SampleOptions {
    pub fn guidance(&self) -> GuidanceSettings {
        GuidanceSettings {
            energy_scale: self.energy_scale,
            policy: GuidancePolicy::from_use_alpha_bar(self.use_alpha_bar),
            normalize_grad: self.normalize_grad,
        }
    }
}

/// One reverse step's result.
#[derive(Debug, Clone)]
pub struct StepOutput {
    /// 0 for the first (noisiest) step, `num_steps - 1` for the last.
    pub step: usize,
    /// Sampling index of the schedule this step denoised from.
    pub timestep: usize,
    /// The new, less noisy sample `(N, 3, H, W)`; the final image on the last step.
    pub sample: Tensor,
    /// The network's estimate of the clean image at this step.
    pub pred_xstart: Tensor,
    /// Summed value of every energy term at this step; empty when unguided.
    pub energies: BTreeMap<String, f32>,
}

/// Lazy, single-pass sequence of [`StepOutput`]s.
///
/// Yields exactly one item per schedule step. After an error item the
/// iterator is exhausted.
pub struct GuidedSampleIter<'a, N: ?Sized, E: ?Sized> {
    network: &'a N,
    diffusion: &'a GaussianDiffusion,
    device: &'a Device,
    network_dtype: DType,
    image_size: usize,
    class_cond: bool,
    energy_fn: Option<&'a E>,
    guidance: GuidanceSettings,
    options: SampleOptions,
    noise: NoiseSource,
    state: Option<Tensor>,
    steps_taken: usize,
    finished: bool,
    #[cfg(feature = "progress-bar")]
    progress: Option<indicatif::ProgressBar>,
}

impl<'a, N, E> GuidedSampleIter<'a, N, E>
where
    N: DenoisingNetwork + ?Sized,
    E: EnergyFunction + ?Sized,
{
    /// Sets up a sampling run. Nothing is computed until the first `next`.
    /// `energy_fn = None` runs plain reverse diffusion.
    pub fn new(
        network: &'a N,
        diffusion: &'a GaussianDiffusion,
        config: &ModelConfig,
        device: &'a Device,
        energy_fn: Option<&'a E>,
        options: SampleOptions,
    ) -> Self {
        #[cfg(feature = "progress-bar")]
        let progress = options.progress.then(|| {
            let bar = indicatif::ProgressBar::new(diffusion.num_steps() as u64);
            if let Ok(style) = indicatif::ProgressStyle::with_template(
                "{spinner} [{elapsed_precise}] {bar:40} {pos}/{len} steps",
            ) {
                bar.set_style(style);
            }
            bar
        });

        Self {
            network,
            diffusion,
            device,
            network_dtype: config.dtype(),
            image_size: config.image_size,
            class_cond: config.class_cond,
            energy_fn,
            guidance: options.guidance(),
            noise: NoiseSource::new(options.seed),
            options,
            state: None,
            steps_taken: 0,
            finished: false,
            #[cfg(feature = "progress-bar")]
            progress,
        }
    }

    /// Shape of the sample batch.
    pub fn sample_shape(&self) -> [usize; 4] {
        [
            self.options.num_samples,
            IMAGE_CHANNELS,
            self.image_size,
            self.image_size,
        ]
    }

    fn initial_state(&mut self) -> Result<Tensor> {
        if self.options.num_samples == 0 {
            return Err(EggError::InvalidConfig("num_samples must be > 0".to_string()));
        }
        if !self.options.energy_scale.is_finite() {
            return Err(EggError::InvalidConfig(format!(
                "energy_scale must be finite, got {}",
                self.options.energy_scale
            )));
        }
        if self.class_cond && self.options.class_labels.is_none() {
            return Err(EggError::InvalidConfig(
                "class-conditional model requires class_labels".to_string(),
            ));
        }

        let shape = self.sample_shape();
        info!(
            "sampling {} image(s) of {}x{} over {} steps (scale {}, {:?}, normalize_grad {})",
            shape[0],
            shape[2],
            shape[3],
            self.diffusion.num_steps(),
            self.guidance.energy_scale,
            self.guidance.policy,
            self.guidance.normalize_grad
        );
        match self.options.initial_noise.take() {
            Some(noise) => {
                if noise.dims() != shape {
                    return Err(EggError::InvalidConfig(format!(
                        "initial_noise has shape {:?}, expected {:?}",
                        noise.dims(),
                        shape
                    )));
                }
                Ok(noise.to_device(self.device)?.to_dtype(DType::F32)?)
            }
            None => self.noise.randn(shape.as_slice(), self.device),
        }
    }

    /// Denoiser prediction for `x` at sampling index `t`, outside any
    /// gradient computation.
    fn denoise(&self, x: &Tensor, t: usize) -> Result<MeanVariance> {
        let batch = x.dim(0)?;
        let timesteps = Tensor::full(self.diffusion.model_timestep(t) as f32, batch, self.device)?;
        let input = x.to_dtype(self.network_dtype)?;
        let output = self
            .network
            .forward(&input, &timesteps, self.options.class_labels.as_ref())?
            .to_dtype(DType::F32)?
            .detach();
        self.diffusion
            .p_mean_variance(&output, x, t, self.options.clip_denoised)
    }

    fn step(&mut self) -> Result<Option<StepOutput>> {
        let num_steps = self.diffusion.num_steps();
        if self.steps_taken >= num_steps {
            return Ok(None);
        }
        let x = match self.state.take() {
            Some(x) => x,
            None => self.initial_state()?,
        };
        let step = self.steps_taken;
        let t = num_steps - 1 - step;

        let out = self.denoise(&x, t)?;
        let (mean, energies) = match self.energy_fn {
            Some(energy_fn) => {
                let gradient = energy_gradient(energy_fn, &x, step)?;
                let correction = self.guidance.correction(
                    &gradient.grad,
                    self.diffusion,
                    t,
                    &out.variance,
                )?;
                ((&out.mean + correction)?, gradient.energies)
            }
            None => (out.mean, BTreeMap::new()),
        };

        let sample = if t == 0 {
            mean
        } else {
            let noise = self.noise.randn(x.dims(), self.device)?;
            let std = out.log_variance.affine(0.5, 0.0)?.exp()?;
            (mean + (std * noise)?)?
        };

        if log::log_enabled!(log::Level::Debug) {
            let total: f32 = energies.values().sum();
            debug!("step {}/{} (t={}): energy {:.6}", step + 1, num_steps, t, total);
        }
        self.tick();

        self.state = Some(sample.clone());
        self.steps_taken += 1;
        Ok(Some(StepOutput {
            step,
            timestep: t,
            sample,
            pred_xstart: out.pred_xstart,
            energies,
        }))
    }

    fn finish(&mut self) {
        self.finished = true;
        self.state = None;
        self.finish_progress();
    }

    #[cfg(feature = "progress-bar")]
    fn tick(&self) {
        if let Some(bar) = &self.progress {
            bar.inc(1);
        }
    }

    #[cfg(not(feature = "progress-bar"))]
    fn tick(&self) {}

    #[cfg(feature = "progress-bar")]
    fn finish_progress(&mut self) {
        if let Some(bar) = self.progress.take() {
            bar.finish();
        }
    }

    #[cfg(not(feature = "progress-bar"))]
    fn finish_progress(&mut self) {}
}

impl<'a, N, E> Iterator for GuidedSampleIter<'a, N, E>
where
    N: DenoisingNetwork + ?Sized,
    E: EnergyFunction + ?Sized,
{
    type Item = Result<StepOutput>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.step() {
            Ok(Some(output)) => Some(Ok(output)),
            Ok(None) => {
                info!("sampling finished after {} steps", self.steps_taken);
                self.finish();
                None
            }
            Err(e) => {
                self.finish();
                Some(Err(e))
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        if self.finished {
            return (0, Some(0));
        }
        let remaining = self.diffusion.num_steps() - self.steps_taken;
        // an error may cut the run short
        (0, Some(remaining))
    }
}
