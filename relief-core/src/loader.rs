use anyhow::Result;
use image::DynamicImage;
use serde::{Deserialize, Serialize};

use crate::{DeviceMap, PipelineInput, SchedulerKind};

/// The pair of hub repositories a conditioned pipeline is built from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelIds {
    pub stable_model_id: String,
    pub depth_model_id: String,
}

impl ModelIds {
    pub fn new(stable_model_id: impl Into<String>, depth_model_id: impl Into<String>) -> Self {
        Self {
            stable_model_id: stable_model_id.into(),
            depth_model_id: depth_model_id.into(),
        }
    }
}

/// A constructed, device-resident conditioned pipeline.
pub trait ModelLike {
    /// Swaps the sampler used by subsequent runs.
    fn set_scheduler(&mut self, scheduler: SchedulerKind) -> Result<()>;

    fn scheduler(&self) -> SchedulerKind;

    /// Produces exactly `input.num_images` images.
    fn run(&mut self, input: &PipelineInput<'_>) -> Result<Vec<DynamicImage>>;
}

pub trait Loader {
    type Model: ModelLike;

    fn load(&self, ids: &ModelIds, device_map: DeviceMap) -> Result<Self::Model>;
}
