#[cfg(feature = "accelerate")]
extern crate accelerate_src;
#[cfg(feature = "mkl")]
extern crate intel_mkl_src;

pub mod depth;
pub mod device_map;
pub mod generator;
pub mod loader;
pub mod models;
pub mod scheduler;
mod util;

mod controlnet_sd;

pub use controlnet_sd::{ControlNetLoader, PipelineOptions, StableDiffusionControlNet};
pub use depth::{DepthAnything, DepthEstimator};
pub use device_map::*;
pub use generator::{Generator, MAX_SEED};
pub use loader::*;
pub use models::{CONTROLNET_DEPTH_MODEL_LIST, STABLE_MODEL_LIST};
pub use scheduler::SchedulerKind;
pub(crate) use util::*;
pub use util::{replicate_channels, tensor_to_image};

use image::DynamicImage;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const DEFAULT_GUIDANCE_SCALE: f64 = 7.5;
pub const DEFAULT_STEPS: usize = 50;
pub const DEFAULT_NUM_IMAGES: usize = 1;
pub const DEFAULT_CONTROLNET_SCALE: f64 = 1.0;

/// Everything needed for one depth-conditioned generation.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub image_path: PathBuf,
    pub stable_model_id: String,
    pub depth_model_id: String,
    pub prompt: String,
    #[serde(default)]
    pub negative_prompt: String,
    pub num_images: usize,
    pub guidance_scale: f64,
    pub steps: usize,
    pub scheduler: SchedulerKind,
    /// Zero picks a random seed.
    pub seed: u64,
    /// Output size; defaults to the input image size rounded down to a multiple of 8.
    #[serde(default)]
    pub width: Option<usize>,
    #[serde(default)]
    pub height: Option<usize>,
    #[serde(default)]
    pub controlnet_scale: Option<f64>,
}

impl GenerationRequest {
    /// A request using the default models, scheduler and sampling parameters.
    pub fn new(image_path: impl Into<PathBuf>, prompt: impl Into<String>) -> Self {
        Self {
            image_path: image_path.into(),
            stable_model_id: models::default_stable_model().to_string(),
            depth_model_id: models::default_depth_model().to_string(),
            prompt: prompt.into(),
            negative_prompt: String::new(),
            num_images: DEFAULT_NUM_IMAGES,
            guidance_scale: DEFAULT_GUIDANCE_SCALE,
            steps: DEFAULT_STEPS,
            scheduler: SchedulerKind::default(),
            seed: 0,
            width: None,
            height: None,
            controlnet_scale: None,
        }
    }

    pub fn model_ids(&self) -> ModelIds {
        ModelIds::new(&self.stable_model_id, &self.depth_model_id)
    }
}

/// Resolved parameters handed to a loaded pipeline.
#[derive(Debug, Clone)]
pub struct PipelineInput<'a> {
    pub control_image: &'a DynamicImage,
    pub prompt: &'a str,
    pub negative_prompt: &'a str,
    pub num_images: usize,
    pub guidance_scale: f64,
    pub steps: usize,
    pub seed: u64,
    pub width: usize,
    pub height: usize,
    pub controlnet_scale: f64,
}

/// Images in generation order, plus the seed that produced them.
#[derive(Debug, Clone)]
pub struct GenerationOutput {
    pub seed: u64,
    pub images: Vec<DynamicImage>,
}
