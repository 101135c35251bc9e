use std::path::Path;

use anyhow::{Context, Result};
use image::{imageops::FilterType, DynamicImage};
use rand::Rng;
use tracing::info;

use crate::{
    replicate_channels, ControlNetLoader, DepthAnything, DepthEstimator, DeviceMap,
    GenerationOutput, GenerationRequest, Loader, ModelIds, ModelLike, PipelineInput,
    PipelineOptions, SchedulerKind, DEFAULT_CONTROLNET_SCALE,
};

/// Upper bound (inclusive) for randomly drawn seeds.
pub const MAX_SEED: u64 = 1_000_000;

struct LoadedPipeline<M> {
    ids: ModelIds,
    model: M,
}

/// Depth-conditioned image generator.
///
/// The pipeline is built on the first [`Generator::load_model`] and reused
/// while the requested model ids stay the same.
pub struct Generator<L: Loader = ControlNetLoader, D: DepthEstimator = DepthAnything> {
    loader: L,
    depth: D,
    device_map: DeviceMap,
    pipeline: Option<LoadedPipeline<L::Model>>,
}

impl Generator {
    pub fn new(device_map: DeviceMap, options: PipelineOptions) -> Self {
        Self::with_parts(
            ControlNetLoader::new(options),
            DepthAnything::new(device_map),
            device_map,
        )
    }
}

impl<L: Loader, D: DepthEstimator> Generator<L, D> {
    pub fn with_parts(loader: L, depth: D, device_map: DeviceMap) -> Self {
        Self {
            loader,
            depth,
            device_map,
            pipeline: None,
        }
    }

    /// Ids of the currently constructed pipeline, if any.
    pub fn loaded_ids(&self) -> Option<&ModelIds> {
        self.pipeline.as_ref().map(|p| &p.ids)
    }

    /// Drops the cached pipeline; the next request loads it again.
    pub fn unload_model(&mut self) {
        if let Some(previous) = self.pipeline.take() {
            info!(stable_model = %previous.ids.stable_model_id, "Unloading pipeline");
        }
    }

    pub fn depth_estimator_mut(&mut self) -> &mut D {
        &mut self.depth
    }

    /// Returns the pipeline for these models with `scheduler` selected.
    ///
    /// Weights are loaded only when no pipeline exists or the model ids changed.
    pub fn load_model(
        &mut self,
        stable_model_id: &str,
        depth_model_id: &str,
        scheduler: SchedulerKind,
    ) -> Result<&mut L::Model> {
        let ids = ModelIds::new(stable_model_id, depth_model_id);
        let loaded = match self.pipeline.take() {
            Some(loaded) if loaded.ids == ids => loaded,
            previous => {
                if let Some(previous) = previous {
                    info!(
                        from = %previous.ids.stable_model_id,
                        to = %ids.stable_model_id,
                        "Model ids changed, dropping cached pipeline"
                    );
                }
                let model = self.loader.load(&ids, self.device_map)?;
                LoadedPipeline { ids, model }
            }
        };
        let loaded = self.pipeline.insert(loaded);
        loaded.model.set_scheduler(scheduler)?;
        Ok(&mut loaded.model)
    }

    /// Depth map of the image at `image_path`, replicated into three channels.
    pub fn estimate_depth(&mut self, image_path: impl AsRef<Path>) -> Result<DynamicImage> {
        let image_path = image_path.as_ref();
        let image = image::open(image_path)
            .with_context(|| format!("failed to open image {}", image_path.display()))?;
        self.depth_image(&image)
    }

    /// Depth map of an already decoded image, replicated into three channels.
    pub fn depth_image(&mut self, image: &DynamicImage) -> Result<DynamicImage> {
        let depth = self.depth.estimate(image)?;
        let depth = if depth.dimensions() == (image.width(), image.height()) {
            depth
        } else {
            image::imageops::resize(&depth, image.width(), image.height(), FilterType::Triangle)
        };
        Ok(replicate_channels(&depth))
    }

    pub fn generate(&mut self, request: &GenerationRequest) -> Result<GenerationOutput> {
        if request.num_images == 0 {
            anyhow::bail!("num_images must be at least 1");
        }
        if request.steps == 0 {
            anyhow::bail!("steps must be at least 1");
        }

        let control_image = self.estimate_depth(&request.image_path)?;
        let (width, height) = output_size(&control_image, request.width, request.height)?;

        let pipeline = self.load_model(
            &request.stable_model_id,
            &request.depth_model_id,
            request.scheduler,
        )?;

        let seed = resolve_seed(request.seed, &mut rand::thread_rng());
        info!(
            seed,
            width,
            height,
            num_images = request.num_images,
            scheduler = %request.scheduler,
            "Generating"
        );

        let input = PipelineInput {
            control_image: &control_image,
            prompt: &request.prompt,
            negative_prompt: &request.negative_prompt,
            num_images: request.num_images,
            guidance_scale: request.guidance_scale,
            steps: request.steps,
            seed,
            width,
            height,
            controlnet_scale: request.controlnet_scale.unwrap_or(DEFAULT_CONTROLNET_SCALE),
        };
        let images = pipeline.run(&input)?;
        Ok(GenerationOutput { seed, images })
    }
}

/// Zero asks for a random seed in `1..=MAX_SEED`.
pub fn resolve_seed<R: Rng>(seed: u64, rng: &mut R) -> u64 {
    if seed == 0 {
        rng.gen_range(1..=MAX_SEED)
    } else {
        seed
    }
}

/// Requested or input size, rounded down to the latent grid (multiples of 8).
fn output_size(
    control_image: &DynamicImage,
    width: Option<usize>,
    height: Option<usize>,
) -> Result<(usize, usize)> {
    let width = width.unwrap_or(control_image.width() as usize) / 8 * 8;
    let height = height.unwrap_or(control_image.height() as usize) / 8 * 8;
    if width == 0 || height == 0 {
        anyhow::bail!("output size must be at least 8x8, got {width}x{height}");
    }
    Ok((width, height))
}
