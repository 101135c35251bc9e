use anyhow::Result;
use candle_core::{DType, Device, IndexOp, Tensor};
use image::DynamicImage;
use rand::{rngs::StdRng, Rng};
use tracing::debug;

use crate::{seeded_noise, tensor_to_image, SchedulerKind};

/// Runs one full denoising trajectory.
///
/// Initial latents and the scheduler's step noise both come from `rng`, so
/// the result depends only on the rng state and what `predict_noise` returns.
/// `predict_noise` gets the scaled model input and the timestep.
pub fn sample_latents<F>(
    scheduler_kind: SchedulerKind,
    steps: usize,
    rng: &mut StdRng,
    shape: (usize, usize, usize, usize),
    device: &Device,
    dtype: DType,
    mut predict_noise: F,
) -> Result<Tensor>
where
    F: FnMut(&Tensor, usize) -> Result<Tensor>,
{
    let noise = seeded_noise(rng, shape, device)?;
    let mut scheduler = scheduler_kind.build(steps, rng.gen())?;
    let mut latents = (noise * scheduler.init_noise_sigma())?.to_dtype(dtype)?;

    let timesteps = scheduler.timesteps().to_vec();
    for (step, &timestep) in timesteps.iter().enumerate() {
        let model_input = scheduler.scale_model_input(latents.clone(), timestep)?;
        let noise_pred = predict_noise(&model_input, timestep)?;
        latents = scheduler.step(&noise_pred, timestep, &latents)?;
        debug!(step = step + 1, total = timesteps.len(), timestep, "Denoising step");
    }
    Ok(latents)
}

/// Fits CLIP token ids to the encoder's fixed context length.
///
/// Long prompts are cut to leave room for `eos_id`, which always ends the
/// sequence; short ones are padded with `pad_id`.
pub fn pad_tokens(mut tokens: Vec<u32>, max_len: usize, pad_id: u32, eos_id: u32) -> Vec<u32> {
    if tokens.len() > max_len {
        tokens.truncate(max_len.saturating_sub(1));
        tokens.push(eos_id);
    }
    tokens.resize(max_len, pad_id);
    tokens
}

/// Classifier-free guidance over a batch laid out as `[unconditional, text]`.
pub fn apply_guidance(noise_pred: &Tensor, guidance_scale: f64) -> Result<Tensor> {
    let chunks = noise_pred.chunk(2, 0)?;
    let (uncond, text) = (&chunks[0], &chunks[1]);
    Ok((uncond + ((text - uncond)? * guidance_scale)?)?)
}

/// Maps a decoded VAE sample in `[-1, 1]` to an RGB image.
pub fn decoded_to_image(decoded: &Tensor) -> Result<DynamicImage> {
    let img = ((decoded.to_dtype(DType::F32)? / 2.)? + 0.5)?;
    let img = (img.clamp(0f32, 1f32)? * 255.)?.to_dtype(DType::U8)?;
    tensor_to_image(&img.i(0)?)
}
