//! ControlNet for the Stable Diffusion UNet.
//!
//! A copy of the UNet encoder (down blocks and mid block) that also sees a
//! conditioning image. Its outputs go through zero-initialized 1x1
//! convolutions and are added to the UNet skip connections. Weight names follow
//! the diffusers `ControlNetModel` layout.

use candle_core::{Module, Result, Tensor};
use candle_nn as nn;
use candle_transformers::models::stable_diffusion::{
    embeddings::{TimestepEmbedding, Timesteps},
    unet_2d::{BlockConfig, UNet2DConditionModelConfig},
    unet_2d_blocks::{
        CrossAttnDownBlock2D, CrossAttnDownBlock2DConfig, DownBlock2D, DownBlock2DConfig,
        UNetMidBlock2DCrossAttn, UNetMidBlock2DCrossAttnConfig,
    },
};

/// Channels of the conditioning-image encoder, which downsamples by 8.
const CONDITIONING_CHANNELS: [usize; 4] = [16, 32, 96, 256];

#[derive(Debug)]
struct ConditioningEmbedding {
    conv_in: nn::Conv2d,
    blocks: Vec<(nn::Conv2d, nn::Conv2d)>,
    conv_out: nn::Conv2d,
}

impl ConditioningEmbedding {
    fn new(vs: nn::VarBuilder, in_channels: usize, out_channels: usize) -> Result<Self> {
        let same = nn::Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let strided = nn::Conv2dConfig {
            padding: 1,
            stride: 2,
            ..Default::default()
        };
        let conv_in = nn::conv2d(in_channels, CONDITIONING_CHANNELS[0], 3, same, vs.pp("conv_in"))?;
        let vs_b = vs.pp("blocks");
        let blocks = CONDITIONING_CHANNELS
            .windows(2)
            .enumerate()
            .map(|(i, pair)| {
                let keep = nn::conv2d(pair[0], pair[0], 3, same, vs_b.pp(2 * i))?;
                let down = nn::conv2d(pair[0], pair[1], 3, strided, vs_b.pp(2 * i + 1))?;
                Ok((keep, down))
            })
            .collect::<Result<Vec<_>>>()?;
        let conv_out = nn::conv2d(
            CONDITIONING_CHANNELS[3],
            out_channels,
            3,
            same,
            vs.pp("conv_out"),
        )?;
        Ok(Self {
            conv_in,
            blocks,
            conv_out,
        })
    }
}

impl Module for ConditioningEmbedding {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let mut xs = xs.apply(&self.conv_in)?.silu()?;
        for (keep, down) in self.blocks.iter() {
            xs = xs.apply(keep)?.silu()?;
            xs = xs.apply(down)?.silu()?;
        }
        xs.apply(&self.conv_out)
    }
}

/// The UNet layout shared by SD 1.5 checkpoints and their ControlNets.
pub fn unet_config_v1_5(sliced_attention_size: Option<usize>) -> UNet2DConditionModelConfig {
    let block = |out_channels, use_cross_attn, attention_head_dim| BlockConfig {
        out_channels,
        use_cross_attn,
        attention_head_dim,
    };
    UNet2DConditionModelConfig {
        blocks: vec![
            block(320, Some(1), 8),
            block(640, Some(1), 8),
            block(1280, Some(1), 8),
            block(1280, None, 8),
        ],
        center_input_sample: false,
        cross_attention_dim: 768,
        downsample_padding: 1,
        flip_sin_to_cos: true,
        freq_shift: 0.,
        layers_per_block: 2,
        mid_block_scale_factor: 1.,
        norm_eps: 1e-5,
        norm_num_groups: 32,
        sliced_attention_size,
        use_linear_projection: false,
    }
}

/// Channels of every UNet skip connection: conv_in, each resnet, each downsampler.
fn skip_channels(config: &UNet2DConditionModelConfig) -> Vec<usize> {
    let n_blocks = config.blocks.len();
    let mut channels = Vec::new();
    if let Some(first) = config.blocks.first() {
        channels.push(first.out_channels);
    }
    for (i, block) in config.blocks.iter().enumerate() {
        let per_block = config.layers_per_block + usize::from(i < n_blocks - 1);
        channels.extend(std::iter::repeat(block.out_channels).take(per_block));
    }
    channels
}

/// `Some(0)` asks for automatic slicing at half the head dimension.
fn attention_slice_size(
    config: &UNet2DConditionModelConfig,
    attention_head_dim: usize,
) -> Option<usize> {
    match config.sliced_attention_size {
        Some(0) => Some(attention_head_dim / 2),
        size => size,
    }
}

#[derive(Debug)]
enum DownBlock {
    Basic(DownBlock2D),
    CrossAttn(CrossAttnDownBlock2D),
}

#[derive(Debug)]
pub struct ControlNet {
    conv_in: nn::Conv2d,
    time_proj: Timesteps,
    time_embedding: TimestepEmbedding,
    cond_embedding: ConditioningEmbedding,
    down_blocks: Vec<DownBlock>,
    mid_block: UNetMidBlock2DCrossAttn,
    zero_convs: Vec<nn::Conv2d>,
    mid_zero_conv: nn::Conv2d,
}

impl ControlNet {
    /// Builds the encoder half of a UNet with `config`, plus the control branches.
    pub fn new(
        vs: nn::VarBuilder,
        in_channels: usize,
        use_flash_attn: bool,
        config: &UNet2DConditionModelConfig,
    ) -> Result<Self> {
        let n_blocks = config.blocks.len();
        let Some(last_block) = config.blocks.last() else {
            candle_core::bail!("controlnet config has no blocks");
        };
        let b_channels = config.blocks[0].out_channels;
        let time_embed_dim = b_channels * 4;
        let conv_cfg = nn::Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let conv_in = nn::conv2d(in_channels, b_channels, 3, conv_cfg, vs.pp("conv_in"))?;

        let time_proj = Timesteps::new(b_channels, config.flip_sin_to_cos, config.freq_shift);
        let time_embedding =
            TimestepEmbedding::new(vs.pp("time_embedding"), b_channels, time_embed_dim)?;
        let cond_embedding =
            ConditioningEmbedding::new(vs.pp("controlnet_cond_embedding"), 3, b_channels)?;

        let vs_db = vs.pp("down_blocks");
        let down_blocks = (0..n_blocks)
            .map(|i| {
                let BlockConfig {
                    out_channels,
                    use_cross_attn,
                    attention_head_dim,
                } = config.blocks[i];
                let sliced_attention_size = attention_slice_size(config, attention_head_dim);
                let in_channels = if i > 0 {
                    config.blocks[i - 1].out_channels
                } else {
                    b_channels
                };
                let db_cfg = DownBlock2DConfig {
                    num_layers: config.layers_per_block,
                    resnet_eps: config.norm_eps,
                    resnet_groups: config.norm_num_groups,
                    add_downsample: i < n_blocks - 1,
                    downsample_padding: config.downsample_padding,
                    ..Default::default()
                };
                if let Some(transformer_layers_per_block) = use_cross_attn {
                    let cfg = CrossAttnDownBlock2DConfig {
                        downblock: db_cfg,
                        attn_num_head_channels: attention_head_dim,
                        cross_attention_dim: config.cross_attention_dim,
                        sliced_attention_size,
                        use_linear_projection: config.use_linear_projection,
                        transformer_layers_per_block,
                    };
                    let block = CrossAttnDownBlock2D::new(
                        vs_db.pp(i),
                        in_channels,
                        out_channels,
                        Some(time_embed_dim),
                        use_flash_attn,
                        cfg,
                    )?;
                    Ok(DownBlock::CrossAttn(block))
                } else {
                    let block = DownBlock2D::new(
                        vs_db.pp(i),
                        in_channels,
                        out_channels,
                        Some(time_embed_dim),
                        db_cfg,
                    )?;
                    Ok(DownBlock::Basic(block))
                }
            })
            .collect::<Result<Vec<_>>>()?;

        let mid_cfg = UNetMidBlock2DCrossAttnConfig {
            resnet_eps: config.norm_eps,
            output_scale_factor: config.mid_block_scale_factor,
            cross_attn_dim: config.cross_attention_dim,
            attn_num_head_channels: last_block.attention_head_dim,
            sliced_attention_size: attention_slice_size(config, last_block.attention_head_dim),
            resnet_groups: Some(config.norm_num_groups),
            use_linear_projection: config.use_linear_projection,
            transformer_layers_per_block: last_block.use_cross_attn.unwrap_or(1),
            ..Default::default()
        };
        let mid_block = UNetMidBlock2DCrossAttn::new(
            vs.pp("mid_block"),
            last_block.out_channels,
            Some(time_embed_dim),
            use_flash_attn,
            mid_cfg,
        )?;

        let vs_zero = vs.pp("controlnet_down_blocks");
        let zero_convs = skip_channels(config)
            .iter()
            .enumerate()
            .map(|(i, &channels)| {
                nn::conv2d(channels, channels, 1, Default::default(), vs_zero.pp(i))
            })
            .collect::<Result<Vec<_>>>()?;
        let mid_zero_conv = nn::conv2d(
            last_block.out_channels,
            last_block.out_channels,
            1,
            Default::default(),
            vs.pp("controlnet_mid_block"),
        )?;

        Ok(Self {
            conv_in,
            time_proj,
            time_embedding,
            cond_embedding,
            down_blocks,
            mid_block,
            zero_convs,
            mid_zero_conv,
        })
    }

    /// Number of down residuals `forward` returns.
    pub fn num_down_residuals(&self) -> usize {
        self.zero_convs.len()
    }

    /// Returns the scaled down-block residuals and the mid-block residual.
    ///
    /// `cond` must be eight times the latent resolution with the same batch
    /// size as `xs`.
    pub fn forward(
        &self,
        xs: &Tensor,
        timestep: f64,
        encoder_hidden_states: &Tensor,
        cond: &Tensor,
        conditioning_scale: f64,
    ) -> Result<(Vec<Tensor>, Tensor)> {
        let (bsize, _channels, _height, _width) = xs.dims4()?;
        let emb = (Tensor::ones(bsize, xs.dtype(), xs.device())? * timestep)?;
        let emb = self.time_proj.forward(&emb)?;
        let emb = self.time_embedding.forward(&emb)?;

        let xs = self.conv_in.forward(xs)?;
        let cond = self.cond_embedding.forward(cond)?;
        let mut xs = (xs + cond)?;

        let mut residuals = vec![xs.clone()];
        for block in self.down_blocks.iter() {
            let (next, block_residuals) = match block {
                DownBlock::Basic(b) => b.forward(&xs, Some(&emb))?,
                DownBlock::CrossAttn(b) => {
                    b.forward(&xs, Some(&emb), Some(encoder_hidden_states))?
                }
            };
            residuals.extend(block_residuals);
            xs = next;
        }
        let xs = self
            .mid_block
            .forward(&xs, Some(&emb), Some(encoder_hidden_states))?;

        let down = residuals
            .iter()
            .zip(self.zero_convs.iter())
            .map(|(residual, conv)| conv.forward(residual)? * conditioning_scale)
            .collect::<Result<Vec<_>>>()?;
        let mid = (self.mid_zero_conv.forward(&xs)? * conditioning_scale)?;
        Ok((down, mid))
    }
}
