//! Saving sampled batches as image files.

use std::fs;
use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};

use crate::error::{EggError, Result};

/// Saves a `(3, H, W)` tensor with values in `[-1, 1]` as an image.
/// JPEG for `.jpg`/`.jpeg`, PNG otherwise.
pub fn save_image<P: AsRef<Path>>(tensor: &Tensor, path: P) -> Result<()> {
    let (channel, height, width) = tensor.dims3()?;
    if channel != 3 {
        return Err(EggError::InvalidConfig(format!(
            "expected 3 channels (RGB), got {}",
            channel
        )));
    }

    // [-1, 1] -> [0, 255]
    let tensor = tensor.to_device(&Device::Cpu)?.to_dtype(DType::F32)?;
    let tensor = ((tensor.clamp(-1f32, 1f32)? + 1.0)? * 127.5)?;
    let tensor = tensor.round()?.to_dtype(DType::U8)?;

    // CHW -> HWC
    let data = tensor.permute((1, 2, 0))?.flatten_all()?.to_vec1::<u8>()?;
    let img =
        image::ImageBuffer::<image::Rgb<u8>, Vec<u8>>::from_raw(width as u32, height as u32, data)
            .ok_or_else(|| EggError::InvalidConfig("failed to create image buffer".to_string()))?;

    let path = path.as_ref();
    let format = match path.extension().and_then(|s| s.to_str()) {
        Some("jpg") | Some("jpeg") => image::ImageFormat::Jpeg,
        _ => image::ImageFormat::Png,
    };
    img.save_with_format(path, format)?;
    Ok(())
}

/// Saves every sample of a `(N, 3, H, W)` batch as `dir/prefix_XX.png`.
pub fn save_batch(images: &Tensor, dir: &Path, prefix: &str) -> Result<Vec<PathBuf>> {
    fs::create_dir_all(dir)?;
    let (batch, _, _, _) = images.dims4()?;
    let mut paths = Vec::with_capacity(batch);
    for idx in 0..batch {
        let path = dir.join(format!("{}_{:02}.png", prefix, idx));
        save_image(&images.get(idx)?, &path)?;
        paths.push(path);
    }
    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn saves_batch_as_pngs() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let images = Tensor::zeros((2, 3, 4, 5), DType::F32, &Device::Cpu)?;
        let paths = save_batch(&images, &dir.path().join("out"), "sample")?;
        assert_eq!(paths.len(), 2);
        assert!(paths[1].ends_with("sample_01.png"));

        let img = image::open(&paths[0])?.to_rgb8();
        assert_eq!(img.dimensions(), (5, 4));
        // 0.0 maps to mid-grey
        assert_eq!(img.get_pixel(0, 0).0, [128, 128, 128]);
        Ok(())
    }

    #[test]
    fn clamps_out_of_range_values() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("clamped.png");
        let image = Tensor::new(&[[[-3.0f32]], [[1.0]], [[7.0]]], &Device::Cpu)?;
        save_image(&image, &path)?;
        let img = image::open(&path)?.to_rgb8();
        assert_eq!(img.get_pixel(0, 0).0, [0, 255, 255]);
        Ok(())
    }

    #[test]
    fn rejects_non_rgb() {
        let image = Tensor::zeros((1, 2, 2), DType::F32, &Device::Cpu).unwrap();
        assert!(save_image(&image, "unused.png").is_err());
    }
}
