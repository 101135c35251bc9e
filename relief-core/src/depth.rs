//! Monocular depth estimation with Depth Anything V2.
//!
//! The network predicts relative inverse depth (near is large), which is the
//! convention depth ControlNets were trained on.

use std::sync::Arc;

use anyhow::{Context, Result};
use candle_core::{DType, Device, Module, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::depth_anything_v2::{DepthAnythingV2, DepthAnythingV2Config};
use candle_transformers::models::dinov2;
use hf_hub::api::sync::Api;
use image::{imageops::FilterType, DynamicImage, GrayImage};
use tracing::{debug, info};

use crate::{image_to_tensor, select_best_device, DeviceMap};

const DINOV2_REPO: &str = "lmz/candle-dino-v2";
const DINOV2_FILE: &str = "dinov2_vits14.safetensors";
const DEPTH_ANYTHING_REPO: &str = "jeroenvlek/depth-anything-v2-safetensors";
const DEPTH_ANYTHING_FILE: &str = "depth_anything_v2_vits.safetensors";

// ImageNet statistics used by the DINOv2 backbone.
const IMAGE_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const IMAGE_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Side length the backbone expects (37 patches of 14 pixels).
const DINO_IMG_SIZE: u32 = 518;

/// Produces a single-channel depth map with the same size as the input.
pub trait DepthEstimator {
    fn estimate(&mut self, image: &DynamicImage) -> Result<GrayImage>;
}

struct DepthModel {
    device: Device,
    model: DepthAnythingV2,
}

/// Depth Anything V2 (ViT-S), fetched from the hub on first use.
pub struct DepthAnything {
    device_map: DeviceMap,
    model: Option<DepthModel>,
}

impl DepthAnything {
    pub fn new(device_map: DeviceMap) -> Self {
        Self {
            device_map,
            model: None,
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.model.is_some()
    }

    /// Loads the weights now instead of on the first estimate.
    pub fn preload(&mut self) -> Result<()> {
        if self.model.is_none() {
            self.model = Some(load_model(self.device_map)?);
        }
        Ok(())
    }
}

fn load_model(device_map: DeviceMap) -> Result<DepthModel> {
    let device = select_best_device(device_map).context("failed to set up device")?;
    let api = Api::new().context("failed to create hf hub API")?;

    info!(repo = DINOV2_REPO, "Loading DINOv2 backbone");
    let dinov2_file = api
        .model(DINOV2_REPO.to_string())
        .get(DINOV2_FILE)
        .context("failed to get DINOv2 weights")?;
    let vb = unsafe {
        VarBuilder::from_mmaped_safetensors(&[dinov2_file], DType::F32, &device)
            .context("failed to build DINOv2 var builder")?
    };
    let dinov2 = dinov2::vit_small(vb).context("failed to load DINOv2")?;

    info!(repo = DEPTH_ANYTHING_REPO, "Loading Depth Anything V2");
    let depth_file = api
        .model(DEPTH_ANYTHING_REPO.to_string())
        .get(DEPTH_ANYTHING_FILE)
        .context("failed to get Depth Anything weights")?;
    let vb = unsafe {
        VarBuilder::from_mmaped_safetensors(&[depth_file], DType::F32, &device)
            .context("failed to build Depth Anything var builder")?
    };
    let model = DepthAnythingV2::new(Arc::new(dinov2), DepthAnythingV2Config::vit_small(), vb)
        .context("failed to load Depth Anything")?;

    Ok(DepthModel { device, model })
}

impl DepthEstimator for DepthAnything {
    fn estimate(&mut self, image: &DynamicImage) -> Result<GrayImage> {
        self.preload()?;
        let Some(depth_model) = self.model.as_ref() else {
            anyhow::bail!("depth model is not loaded");
        };

        let (width, height) = (image.width(), image.height());
        let input = prepare_image(image, &depth_model.device)?;
        let depth = depth_model.model.forward(&input)?;
        debug!(shape = ?depth.dims(), "depth prediction");

        let depth = depth.interpolate2d(height as usize, width as usize)?;
        let values = depth.flatten_all()?.to_vec1::<f32>()?;
        GrayImage::from_raw(width, height, normalize_depth(&values))
            .context("depth map does not match the input size")
    }
}

/// Resizes to the backbone resolution and applies ImageNet normalization.
fn prepare_image(image: &DynamicImage, device: &Device) -> Result<Tensor> {
    let resized = image
        .resize_exact(DINO_IMG_SIZE, DINO_IMG_SIZE, FilterType::Triangle)
        .to_rgb8();
    let pixels = (image_to_tensor(&resized, device)?.to_dtype(DType::F32)? / 255.0)?;

    let mean = Tensor::new(&IMAGE_MEAN, device)?.reshape((3, 1, 1))?;
    let std = Tensor::new(&IMAGE_STD, device)?.reshape((3, 1, 1))?;
    let normalized = pixels.broadcast_sub(&mean)?.broadcast_div(&std)?;
    Ok(normalized.unsqueeze(0)?)
}

/// Scales raw predictions by their maximum into `u8`, truncating.
///
/// Nearest surfaces come out white; the zero point of the prediction stays black.
fn normalize_depth(values: &[f32]) -> Vec<u8> {
    let max = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if !max.is_finite() || max <= f32::EPSILON {
        return vec![0; values.len()];
    }
    values
        .iter()
        .map(|&v| (v * 255.0 / max).clamp(0.0, 255.0) as u8)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    #[test]
    fn normalize_scales_by_maximum() {
        // The farthest plane keeps its contrast instead of being pushed to zero.
        assert_eq!(normalize_depth(&[2.0, 4.0, 3.0]), vec![127, 255, 191]);
        assert_eq!(normalize_depth(&[1.5; 4]), vec![255; 4]);
    }

    #[test]
    fn empty_or_nonpositive_depth_maps_to_black() {
        assert_eq!(normalize_depth(&[0.0, 0.0]), vec![0, 0]);
        assert_eq!(normalize_depth(&[-1.0, -0.5]), vec![0, 0]);
        assert!(normalize_depth(&[]).is_empty());
    }

    #[test]
    fn prepared_image_has_backbone_shape() -> Result<()> {
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(64, 32, Rgb([255, 0, 128])));
        let tensor = prepare_image(&image, &Device::Cpu)?;
        assert_eq!(tensor.dims4()?, (1, 3, 518, 518));

        // White red channel normalizes to (1 - mean) / std.
        let red = tensor.get(0)?.get(0)?.get(0)?.get(0)?.to_scalar::<f32>()?;
        assert!((red - (1.0 - 0.485) / 0.229).abs() < 1e-4);
        Ok(())
    }
}
