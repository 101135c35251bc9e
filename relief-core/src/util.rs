use anyhow::Result;
use candle_core::utils::{cuda_is_available, metal_is_available};
use candle_core::{DType, Device, Shape, Tensor};
use image::{DynamicImage, GrayImage, RgbImage};
use rand::Rng;
use rand_distr::StandardNormal;
use tracing::warn;

use crate::DeviceMap;

pub fn select_best_device(device_map: DeviceMap) -> Result<Device> {
    match device_map {
        DeviceMap::ForceCpu => Ok(Device::Cpu),
        DeviceMap::Ordinal(ordinal) if cuda_is_available() => Ok(Device::new_cuda(ordinal)?),
        DeviceMap::Ordinal(ordinal) if metal_is_available() => Ok(Device::new_metal(ordinal)?),
        DeviceMap::Ordinal(_) => {
            #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
            {
                warn!("Running on CPU, to run on GPU(metal), build with `--features metal`");
            }
            #[cfg(not(all(target_os = "macos", target_arch = "aarch64")))]
            {
                warn!("Running on CPU, to run on GPU, build with `--features cuda`");
            }
            Ok(Device::Cpu)
        }
    }
}

/// Half precision on accelerators, f32 on the CPU.
pub fn inference_dtype(device: &Device) -> DType {
    if device.is_cpu() {
        DType::F32
    } else {
        DType::F16
    }
}

/// Gaussian f32 noise drawn from a host RNG, so a seed means the same noise on every device.
pub fn seeded_noise<R: Rng, S: Into<Shape>>(
    rng: &mut R,
    shape: S,
    device: &Device,
) -> Result<Tensor> {
    let shape = shape.into();
    let values: Vec<f32> = (0..shape.elem_count())
        .map(|_| rng.sample(StandardNormal))
        .collect();
    Ok(Tensor::from_vec(values, shape, device)?)
}

/// Converts a u8 tensor with shape (3, height, width) into an RGB image.
pub fn tensor_to_image(img: &Tensor) -> Result<DynamicImage> {
    let (channels, height, width) = img.dims3()?;
    if channels != 3 {
        anyhow::bail!("tensor_to_image expects an image with 3 channels, got {channels}");
    }
    let img = img.permute((1, 2, 0))?.flatten_all()?;
    let pixels = img.to_vec1::<u8>()?;
    let buffer = RgbImage::from_raw(width as u32, height as u32, pixels)
        .ok_or_else(|| candle_core::Error::msg("error converting tensor to image buffer"))?;
    Ok(DynamicImage::ImageRgb8(buffer))
}

/// Converts an RGB image into a u8 tensor with shape (3, height, width).
pub fn image_to_tensor(img: &RgbImage, device: &Device) -> Result<Tensor> {
    let (width, height) = img.dimensions();
    let data = img.as_raw().clone();
    let tensor = Tensor::from_vec(data, (height as usize, width as usize, 3), device)?
        .permute((2, 0, 1))?;
    Ok(tensor)
}

/// Copies a single-channel map into all three channels of an RGB image.
pub fn replicate_channels(gray: &GrayImage) -> DynamicImage {
    DynamicImage::ImageRgb8(DynamicImage::ImageLuma8(gray.clone()).to_rgb8())
}
