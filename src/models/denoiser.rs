//! Traits for pretrained denoising networks and the providers that build them.

use candle_core::{Result, Tensor};
use candle_nn::VarBuilder;

use crate::config::ModelConfig;

/// A pretrained denoiser.
///
/// `x` is a `(N, C, H, W)` batch in the network's weight dtype and
/// `timesteps` a `(N,)` F32 tensor holding the (possibly rescaled) timestep
/// of every sample. The output is `(N, C, H, W)`, or `(N, 2C, H, W)` when the
/// network also predicts the variance interpolation (`learn_sigma`).
/// `class_labels` is `Some` only for class-conditional networks.
///
/// Implementations must not hold trainable variables: the sampler relies on
/// the forward pass not recording gradients.
pub trait DenoisingNetwork: Send + Sync {
    fn forward(
        &self,
        x: &Tensor,
        timesteps: &Tensor,
        class_labels: Option<&Tensor>,
    ) -> Result<Tensor>;
}

impl<T: DenoisingNetwork + ?Sized> DenoisingNetwork for Box<T> {
    fn forward(
        &self,
        x: &Tensor,
        timesteps: &Tensor,
        class_labels: Option<&Tensor>,
    ) -> Result<Tensor> {
        (**self).forward(x, timesteps, class_labels)
    }
}

/// Builds the network described by a [`ModelConfig`] from checkpoint weights.
///
/// Weight lookups through `vb` fail on missing tensors and shape mismatches,
/// which the loader reports as a checkpoint load error.
pub trait NetworkProvider {
    type Network: DenoisingNetwork;

    fn build(&self, config: &ModelConfig, vb: VarBuilder) -> Result<Self::Network>;
}

impl<F, N> NetworkProvider for F
where
    F: Fn(&ModelConfig, VarBuilder) -> Result<N>,
    N: DenoisingNetwork,
{
    type Network = N;

    fn build(&self, config: &ModelConfig, vb: VarBuilder) -> Result<N> {
        self(config, vb)
    }
}
