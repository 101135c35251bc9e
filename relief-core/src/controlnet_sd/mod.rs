use anyhow::{Context, Error, Result};
use candle_core::{DType, Device, Module, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::stable_diffusion::{
    self, clip, unet_2d::UNet2DConditionModel, vae::AutoEncoderKL, StableDiffusionConfig,
};
use hf_hub::api::sync::Api;
use image::{imageops::FilterType, DynamicImage};
use rand::{rngs::StdRng, SeedableRng};
use tokenizers::Tokenizer;
use tracing::{debug, info, warn};

mod controlnet;
mod sampling;

pub use controlnet::ControlNet;

use crate::{
    image_to_tensor, inference_dtype, models::CLIP_TOKENIZER_REPO, select_best_device, DeviceMap,
    Loader, ModelIds, ModelLike, PipelineInput, SchedulerKind,
};

const UNET_FILE: &str = "unet/diffusion_pytorch_model.safetensors";
const VAE_FILE: &str = "vae/diffusion_pytorch_model.safetensors";
const CLIP_FILE: &str = "text_encoder/model.safetensors";
const CONTROLNET_FILE: &str = "diffusion_pytorch_model.safetensors";

/// Latent scaling factor of the SD 1.x autoencoder.
const VAE_SCALE: f64 = 0.18215;
const LATENT_CHANNELS: usize = 4;
const END_OF_TEXT: &str = "<|endoftext|>";

/// Knobs that affect how weights are placed and executed, not what is generated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineOptions {
    /// Attention slice size; `Some(0)` picks half the head dim.
    pub sliced_attention_size: Option<usize>,
    pub use_flash_attn: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            sliced_attention_size: None,
            use_flash_attn: cfg!(feature = "flash-attn"),
        }
    }
}

/// Stable Diffusion 1.5 UNet/VAE/CLIP plus a depth ControlNet, resident on one device.
pub struct StableDiffusionControlNet {
    device: Device,
    dtype: DType,
    clip_config: clip::Config,
    tokenizer: Tokenizer,
    text_model: clip::ClipTextTransformer,
    vae: AutoEncoderKL,
    unet: UNet2DConditionModel,
    controlnet: ControlNet,
    scheduler: SchedulerKind,
}

impl ModelLike for StableDiffusionControlNet {
    fn set_scheduler(&mut self, scheduler: SchedulerKind) -> Result<()> {
        if self.scheduler != scheduler {
            debug!(from = %self.scheduler, to = %scheduler, "Swapping scheduler");
            self.scheduler = scheduler;
        }
        Ok(())
    }

    fn scheduler(&self) -> SchedulerKind {
        self.scheduler
    }

    fn run(&mut self, input: &PipelineInput<'_>) -> Result<Vec<DynamicImage>> {
        let use_guidance = input.guidance_scale > 1.0;
        let text_embeddings =
            self.encode_prompts(input.prompt, input.negative_prompt, use_guidance)?;
        debug!(shape = ?text_embeddings.dims(), "Text embeddings");
        let control = self.prepare_control_image(input, use_guidance)?;

        let mut rng = StdRng::seed_from_u64(input.seed);

        let mut images = Vec::with_capacity(input.num_images);
        for index in 0..input.num_images {
            info!(
                image = index + 1,
                total = input.num_images,
                steps = input.steps,
                "Denoising"
            );
            let latents = self.denoise(&mut rng, input, &text_embeddings, &control, use_guidance)?;
            let decoded = self.vae.decode(&(latents / VAE_SCALE)?)?;
            images.push(sampling::decoded_to_image(&decoded)?);
        }
        Ok(images)
    }
}

impl StableDiffusionControlNet {
    /// Embeddings batched as `[negative, prompt]` under guidance, `[prompt]` otherwise.
    fn encode_prompts(&self, prompt: &str, negative: &str, use_guidance: bool) -> Result<Tensor> {
        let text = self.encode_text(prompt)?;
        let embeddings = if use_guidance {
            let uncond = self.encode_text(negative)?;
            Tensor::cat(&[uncond, text], 0)?
        } else {
            text
        };
        Ok(embeddings.to_dtype(self.dtype)?)
    }

    fn encode_text(&self, text: &str) -> Result<Tensor> {
        let vocab = self.tokenizer.get_vocab(true);
        let token_id = |token: &str| {
            vocab
                .get(token)
                .copied()
                .with_context(|| format!("tokenizer has no {token} token"))
        };
        let pad_id = token_id(self.clip_config.pad_with.as_deref().unwrap_or(END_OF_TEXT))?;
        let eos_id = token_id(END_OF_TEXT)?;
        let tokens = self
            .tokenizer
            .encode(text, true)
            .map_err(Error::msg)?
            .get_ids()
            .to_vec();
        let max_len = self.clip_config.max_position_embeddings;
        if tokens.len() > max_len {
            warn!(tokens = tokens.len(), max_len, "Prompt truncated");
        }
        let tokens = sampling::pad_tokens(tokens, max_len, pad_id, eos_id);
        let tokens = Tensor::new(tokens.as_slice(), &self.device)?.unsqueeze(0)?;
        Ok(self.text_model.forward(&tokens)?)
    }

    /// The depth map at output resolution, scaled to `[0, 1]` and batched like the latents.
    fn prepare_control_image(&self, input: &PipelineInput<'_>, use_guidance: bool) -> Result<Tensor> {
        let resized = input
            .control_image
            .resize_exact(input.width as u32, input.height as u32, FilterType::Triangle)
            .to_rgb8();
        let control = (image_to_tensor(&resized, &self.device)?.to_dtype(DType::F32)? / 255.)?
            .unsqueeze(0)?
            .to_dtype(self.dtype)?;
        if use_guidance {
            Ok(Tensor::cat(&[&control, &control], 0)?)
        } else {
            Ok(control)
        }
    }

    fn denoise(
        &self,
        rng: &mut StdRng,
        input: &PipelineInput<'_>,
        text_embeddings: &Tensor,
        control: &Tensor,
        use_guidance: bool,
    ) -> Result<Tensor> {
        let shape = (1, LATENT_CHANNELS, input.height / 8, input.width / 8);
        sampling::sample_latents(
            self.scheduler,
            input.steps,
            rng,
            shape,
            &self.device,
            self.dtype,
            |model_input, timestep| {
                let model_input = if use_guidance {
                    Tensor::cat(&[model_input, model_input], 0)?
                } else {
                    model_input.clone()
                };
                let (down_residuals, mid_residual) = self.controlnet.forward(
                    &model_input,
                    timestep as f64,
                    text_embeddings,
                    control,
                    input.controlnet_scale,
                )?;
                let noise_pred = self.unet.forward_with_additional_residuals(
                    &model_input,
                    timestep as f64,
                    text_embeddings,
                    Some(down_residuals.as_slice()),
                    Some(&mid_residual),
                )?;
                if use_guidance {
                    sampling::apply_guidance(&noise_pred, input.guidance_scale)
                } else {
                    Ok(noise_pred)
                }
            },
        )
    }
}

/// Builds [`StableDiffusionControlNet`] pipelines from hub repositories.
#[derive(Debug, Clone, Default)]
pub struct ControlNetLoader {
    options: PipelineOptions,
}

impl ControlNetLoader {
    pub fn new(options: PipelineOptions) -> Self {
        Self { options }
    }
}

impl Loader for ControlNetLoader {
    type Model = StableDiffusionControlNet;

    fn load(&self, ids: &ModelIds, device_map: DeviceMap) -> Result<Self::Model> {
        let device = select_best_device(device_map).context("failed to set up device")?;
        let dtype = inference_dtype(&device);
        let use_flash_attn = self.options.use_flash_attn;
        info!(
            stable_model = %ids.stable_model_id,
            controlnet = %ids.depth_model_id,
            ?device,
            ?dtype,
            use_flash_attn,
            "Loading depth ControlNet pipeline"
        );

        let api = Api::new().context("failed to create hf hub API")?;
        let sd_config = StableDiffusionConfig::v1_5(self.options.sliced_attention_size, None, None);
        let sd_repo = api.model(ids.stable_model_id.clone());

        // --- CLIP text encoder and tokenizer ---
        let tokenizer_file = api
            .model(CLIP_TOKENIZER_REPO.to_string())
            .get("tokenizer.json")
            .context("failed to get CLIP tokenizer")?;
        let tokenizer = Tokenizer::from_file(tokenizer_file)
            .map_err(Error::msg)
            .context("failed to load CLIP tokenizer")?;
        let clip_file = sd_repo
            .get(CLIP_FILE)
            .with_context(|| format!("failed to get text encoder from {}", ids.stable_model_id))?;
        let text_model =
            stable_diffusion::build_clip_transformer(&sd_config.clip, clip_file, &device, DType::F32)
                .context("failed to load CLIP text encoder")?;

        // --- Autoencoder ---
        let vae_file = sd_repo
            .get(VAE_FILE)
            .with_context(|| format!("failed to get VAE from {}", ids.stable_model_id))?;
        let vae = sd_config
            .build_vae(vae_file, &device, dtype)
            .context("failed to load VAE")?;

        // --- UNet ---
        let unet_file = sd_repo
            .get(UNET_FILE)
            .with_context(|| format!("failed to get UNet from {}", ids.stable_model_id))?;
        let unet = sd_config
            .build_unet(unet_file, &device, LATENT_CHANNELS, use_flash_attn, dtype)
            .context("failed to load UNet")?;

        // --- ControlNet ---
        let controlnet_file = api
            .model(ids.depth_model_id.clone())
            .get(CONTROLNET_FILE)
            .with_context(|| format!("failed to get ControlNet from {}", ids.depth_model_id))?;
        let controlnet_vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[controlnet_file], dtype, &device)
                .context("failed to build ControlNet var builder")?
        };
        let unet_config = controlnet::unet_config_v1_5(self.options.sliced_attention_size);
        let controlnet =
            ControlNet::new(controlnet_vb, LATENT_CHANNELS, use_flash_attn, &unet_config)
                .context("failed to load ControlNet")?;

        info!("Pipeline loaded");
        Ok(StableDiffusionControlNet {
            device,
            dtype,
            clip_config: sd_config.clip.clone(),
            tokenizer,
            text_model,
            vae,
            unet,
            controlnet,
            scheduler: SchedulerKind::default(),
        })
    }
}
