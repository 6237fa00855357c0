//! Denoising network contract.
//!
//! The network architecture lives outside this crate: a [`NetworkProvider`]
//! builds a [`DenoisingNetwork`] from the configuration and the checkpoint
//! weights, and the sampler only ever calls its forward pass.

pub mod denoiser;

pub use denoiser::{DenoisingNetwork, NetworkProvider};
