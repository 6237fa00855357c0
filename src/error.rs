//! Error types for eggdiffusion.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while building a sampler or running a guided sampling call.
#[derive(Debug, Error)]
pub enum EggError {
    /// The checkpoint file does not exist.
    #[error("checkpoint not found: {}", .0.display())]
    CheckpointNotFound(PathBuf),

    /// The checkpoint exists but could not be read into the network,
    /// e.g. a corrupt file or a parameter shape mismatch.
    #[error("failed to load checkpoint {}: {source}", .path.display())]
    Load {
        path: PathBuf,
        #[source]
        source: candle_core::Error,
    },

    /// The requested compute device is not available in this build or on this host.
    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),

    /// A configuration override names a key `ModelConfig` does not have.
    #[error("unknown config key `{0}`")]
    UnknownConfigKey(String),

    /// A configuration value has the wrong type or an unusable value.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// The timestep respacing string cannot be satisfied.
    #[error("invalid timestep respacing `{spacing}`: {reason}")]
    InvalidRespacing { spacing: String, reason: String },

    /// An energy term produced NaN or infinity.
    #[error("non-finite energy in term `{term}` at step {step}")]
    NonFiniteEnergy { step: usize, term: String },

    /// An energy term is neither a scalar nor one value per sample.
    #[error("energy term `{term}` has shape {shape:?}, expected [] or [{batch}]")]
    EnergyShape {
        term: String,
        shape: Vec<usize>,
        batch: usize,
    },

    /// The energy gradient w.r.t. the image contains NaN or infinity.
    #[error("non-finite energy gradient at step {0}")]
    NonFiniteGradient(usize),

    /// The denoising network returned a tensor of the wrong shape.
    #[error("network output has shape {actual:?}, expected {expected:?}")]
    NetworkOutput {
        actual: Vec<usize>,
        expected: Vec<usize>,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("image encoding failed: {0}")]
    Image(#[from] image::ImageError),

    #[error(transparent)]
    Candle(#[from] candle_core::Error),
}

/// Result type alias using EggError.
pub type Result<T> = std::result::Result<T, EggError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_context() {
        let err = EggError::NonFiniteEnergy {
            step: 7,
            term: "mse".to_string(),
        };
        assert_eq!(err.to_string(), "non-finite energy in term `mse` at step 7");

        let err = EggError::CheckpointNotFound(PathBuf::from("/tmp/missing.pt"));
        assert!(err.to_string().contains("/tmp/missing.pt"));
    }

    #[test]
    fn energy_shape_message() {
        let err = EggError::EnergyShape {
            term: "clip".to_string(),
            shape: vec![2, 3],
            batch: 2,
        };
        assert!(err.to_string().contains("[2, 3]"));
        assert!(err.to_string().contains("[2]"));
    }
}
