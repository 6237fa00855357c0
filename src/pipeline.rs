//! Energy-guided diffusion wrapper around a pretrained denoiser.

use std::path::Path;

use candle_core::{DType, Device, Tensor};
use log::{info, warn};
use serde_yaml::Mapping;

use crate::config::{DeviceSelection, ModelConfig};
use crate::diffusion::GaussianDiffusion;
use crate::error::{EggError, Result};
use crate::loaders::load_network;
use crate::models::{DenoisingNetwork, NetworkProvider};
use crate::sampling::{EnergyFunction, GuidedSampleIter, NoEnergy, SampleOptions};

/// Sampling steps used when the caller does not choose.
pub const DEFAULT_NUM_STEPS: usize = 50;

/// A pretrained denoiser, its respaced schedule and the device they live on.
///
/// Built once; every sampling call borrows the network and the schedule
/// read-only. There is no internal locking: concurrent calls from several
/// threads are only safe when `N` is `Sync`.
pub struct EnergyGuidedDiffusion<N> {
    config: ModelConfig,
    network: N,
    diffusion: GaussianDiffusion,
    device: Device,
}

impl<N: DenoisingNetwork> EnergyGuidedDiffusion<N> {
    /// Loads the checkpoint at `checkpoint` on the device named by
    /// `EGG_DEVICE`, or the best available one when it is unset.
    ///
    /// The configuration is the default set respaced to `num_steps`, with
    /// `overrides` applied on top.
    pub fn new<P>(
        checkpoint: impl AsRef<Path>,
        overrides: Option<&Mapping>,
        num_steps: usize,
        provider: &P,
    ) -> Result<Self>
    where
        P: NetworkProvider<Network = N>,
    {
        Self::with_device(
            checkpoint,
            overrides,
            num_steps,
            provider,
            DeviceSelection::from_env(),
        )
    }

    /// Like [`new`](Self::new) on an explicitly selected device.
    pub fn with_device<P>(
        checkpoint: impl AsRef<Path>,
        overrides: Option<&Mapping>,
        num_steps: usize,
        provider: &P,
        device: DeviceSelection,
    ) -> Result<Self>
    where
        P: NetworkProvider<Network = N>,
    {
        let config = ModelConfig::resolve(num_steps, overrides)?;
        let device = device.resolve()?;
        if config.use_fp16 && device.is_cpu() {
            warn!("use_fp16 is set but running on CPU; half precision will be slow");
        }
        let network = load_network(provider, &config, checkpoint.as_ref(), &device)?;
        Self::from_parts(config, network, device)
    }

    /// Wraps an already built network. `network` must expect weights in
    /// `config.dtype()` and live on `device`.
    pub fn from_parts(config: ModelConfig, network: N, device: Device) -> Result<Self> {
        config.validate()?;
        let diffusion = GaussianDiffusion::from_config(&config)?;
        info!(
            "energy-guided diffusion ready: {}x{} images, {} sampling steps of {} ({} schedule)",
            config.image_size,
            config.image_size,
            diffusion.num_steps(),
            config.diffusion_steps,
            config.noise_schedule
        );
        Ok(Self {
            config,
            network,
            diffusion,
            device,
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn diffusion(&self) -> &GaussianDiffusion {
        &self.diffusion
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Weight dtype of the network.
    pub fn dtype(&self) -> DType {
        self.config.dtype()
    }

    pub fn num_steps(&self) -> usize {
        self.diffusion.num_steps()
    }

    pub fn image_size(&self) -> usize {
        self.config.image_size
    }

    pub fn network(&self) -> &N {
        &self.network
    }

    /// Energy-guided sampling. The returned iterator yields one
    /// [`StepOutput`](crate::sampling::StepOutput) per step; the last one
    /// holds the final `(num_samples, 3, H, W)` batch.
    pub fn sample<'a, E>(
        &'a self,
        energy_fn: &'a E,
        options: SampleOptions,
    ) -> GuidedSampleIter<'a, N, E>
    where
        E: EnergyFunction + ?Sized,
    {
        GuidedSampleIter::new(
            &self.network,
            &self.diffusion,
            &self.config,
            &self.device,
            Some(energy_fn),
            options,
        )
    }

    /// Plain reverse diffusion with the same noise stream as [`sample`](Self::sample).
    /// The energy options in `options` are ignored.
    pub fn sample_unguided(&self, options: SampleOptions) -> GuidedSampleIter<'_, N, NoEnergy> {
        GuidedSampleIter::new(
            &self.network,
            &self.diffusion,
            &self.config,
            &self.device,
            None,
            options,
        )
    }

    /// Runs guided sampling to the end and returns the final batch.
    pub fn sample_final<E>(&self, energy_fn: &E, options: SampleOptions) -> Result<Tensor>
    where
        E: EnergyFunction + ?Sized,
    {
        let mut last = None;
        for step in self.sample(energy_fn, options) {
            last = Some(step?.sample);
        }
        last.ok_or_else(|| EggError::InvalidConfig("schedule has no sampling steps".to_string()))
    }
}
