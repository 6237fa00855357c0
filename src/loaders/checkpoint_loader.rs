//! Checkpoint loader that handles safetensors and PyTorch pickle files.

use std::path::Path;

use candle_core::{DType, Device};
use candle_nn::VarBuilder;
use log::{debug, info};

use crate::config::ModelConfig;
use crate::error::{EggError, Result};
use crate::models::NetworkProvider;

/// Prefix used by checkpoints that wrap the denoiser in a larger model.
const WRAPPED_PREFIX: &str = "model.diffusion_model";

fn is_pickle(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|s| s.to_str()),
        Some("pt") | Some("pth") | Some("bin") | Some("ckpt")
    )
}

/// Opens `path` as a `VarBuilder` whose tensors are converted to `dtype` on `device`.
///
/// `.pt`, `.pth`, `.bin` and `.ckpt` files are read as PyTorch pickles,
/// everything else as safetensors. Checkpoints whose tensor names all live
/// under `model.diffusion_model.` are unwrapped.
pub fn load_var_builder(path: &Path, dtype: DType, device: &Device) -> Result<VarBuilder<'static>> {
    if !path.exists() {
        return Err(EggError::CheckpointNotFound(path.to_path_buf()));
    }
    let load_err = |source| EggError::Load {
        path: path.to_path_buf(),
        source,
    };

    let (vb, names) = if is_pickle(path) {
        debug!("reading pickle checkpoint {}", path.display());
        let names: Vec<String> = candle_core::pickle::PthTensors::new(path, None)
            .map_err(load_err)?
            .tensor_infos()
            .keys()
            .cloned()
            .collect();
        let vb = VarBuilder::from_pth(path, dtype, device).map_err(load_err)?;
        (vb, names)
    } else {
        debug!("memory-mapping safetensors checkpoint {}", path.display());
        let names: Vec<String> = unsafe { candle_core::safetensors::MmapedSafetensors::new(path) }
            .map_err(load_err)?
            .tensors()
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[path], dtype, device) }
            .map_err(load_err)?;
        (vb, names)
    };

    let prefix = format!("{}.", WRAPPED_PREFIX);
    if !names.is_empty() && names.iter().all(|name| name.starts_with(&prefix)) {
        info!("detected {} prefix, unwrapping", WRAPPED_PREFIX);
        return Ok(vb.pp(WRAPPED_PREFIX));
    }
    Ok(vb)
}

/// Loads the checkpoint at `path` and hands the weights to `provider`.
///
/// Weights are converted to `config.dtype()` while loading, so an fp16
/// config yields a half-precision network.
pub fn load_network<P: NetworkProvider>(
    provider: &P,
    config: &ModelConfig,
    path: &Path,
    device: &Device,
) -> Result<P::Network> {
    info!(
        "loading denoiser from {} ({:?} on {:?})",
        path.display(),
        config.dtype(),
        device
    );
    let vb = load_var_builder(path, config.dtype(), device)?;
    provider.build(config, vb).map_err(|source| EggError::Load {
        path: path.to_path_buf(),
        source,
    })
}
