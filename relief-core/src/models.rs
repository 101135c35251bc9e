//! Hub repositories offered for selection.
//!
//! Every base model listed here shares the Stable Diffusion 1.5 UNet layout,
//! which is what the depth ControlNets below were trained against.

/// Base Stable Diffusion checkpoints, default first.
pub const STABLE_MODEL_LIST: &[&str] = &[
    "stable-diffusion-v1-5/stable-diffusion-v1-5",
    "benjamin-paine/stable-diffusion-v1-5",
    "Lykon/dreamshaper-8",
];

/// Depth ControlNets for SD 1.5, default first.
pub const CONTROLNET_DEPTH_MODEL_LIST: &[&str] = &[
    "lllyasviel/sd-controlnet-depth",
    "lllyasviel/control_v11f1p_sd15_depth",
];

/// Tokenizer shared by every SD 1.x text encoder.
pub const CLIP_TOKENIZER_REPO: &str = "openai/clip-vit-base-patch32";

pub fn default_stable_model() -> &'static str {
    STABLE_MODEL_LIST[0]
}

pub fn default_depth_model() -> &'static str {
    CONTROLNET_DEPTH_MODEL_LIST[0]
}
