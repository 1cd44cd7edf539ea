use std::path::Path;

use anyhow::{Context, Error, Result};
use candle_core::{DType, Device, IndexOp, Tensor, D};
use candle_nn::Module;
use candle_transformers::models::stable_diffusion::{
    self, clip, schedulers::Scheduler, unet_2d::UNet2DConditionModel, vae::AutoEncoderKL,
};
use image::DynamicImage;
use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::StandardNormal;
use tokenizers::Tokenizer;
use tracing::debug;

use crate::{
    loader::{LocalWeights, PipelineOptions},
    tensor_to_image, GenerationParams, ModelLike, ModelVariant,
};

const UNET_IN_CHANNELS: usize = 4;
const LATENT_CHANNELS: usize = 4;

struct TextEncoder {
    tokenizer: Tokenizer,
    model: clip::ClipTextTransformer,
    pad_id: u32,
    max_len: usize,
}

impl TextEncoder {
    fn load(
        config: &clip::Config,
        weights: &Path,
        tokenizer: &Path,
        device: &Device,
    ) -> Result<Self> {
        let tokenizer = Tokenizer::from_file(tokenizer)
            .map_err(Error::msg)
            .context("failed to load tokenizer")?;
        let pad_token = config.pad_with.as_deref().unwrap_or("<|endoftext|>");
        let pad_id = tokenizer
            .token_to_id(pad_token)
            .with_context(|| format!("tokenizer has no {pad_token:?} token"))?;
        let model = stable_diffusion::build_clip_transformer(config, weights, device, DType::F32)
            .context("failed to load CLIP text encoder")?;
        Ok(Self {
            tokenizer,
            model,
            pad_id,
            max_len: config.max_position_embeddings,
        })
    }

    fn encode(&self, prompt: &str, device: &Device) -> Result<Tensor> {
        let mut tokens = self
            .tokenizer
            .encode(prompt, true)
            .map_err(Error::msg)?
            .get_ids()
            .to_vec();
        if tokens.len() > self.max_len {
            debug!(tokens = tokens.len(), max = self.max_len, "truncating prompt");
            tokens.truncate(self.max_len);
        }
        tokens.resize(self.max_len, self.pad_id);
        let tokens = Tensor::new(tokens.as_slice(), device)?.unsqueeze(0)?;
        Ok(self.model.forward(&tokens)?)
    }
}

pub struct StableDiffusionModel {
    variant: ModelVariant,
    device: Device,
    dtype: DType,
    sliced_attention_size: Option<usize>,
    encoders: Vec<TextEncoder>,
    unet: UNet2DConditionModel,
    vae: AutoEncoderKL,
}

impl StableDiffusionModel {
    pub fn load(
        variant: ModelVariant,
        weights: &LocalWeights,
        device: &Device,
        options: &PipelineOptions,
    ) -> Result<Self> {
        let dtype = device.bf16_default_to_f32();
        let config = variant.config(options.sliced_attention_size, None, None);

        let mut encoders = vec![TextEncoder::load(
            &config.clip,
            &weights.clip,
            &weights.tokenizer,
            device,
        )?];
        if let (Some(clip2), Some(clip2_weights), Some(tokenizer2)) =
            (&config.clip2, &weights.clip2, &weights.tokenizer2)
        {
            encoders.push(
                TextEncoder::load(clip2, clip2_weights, tokenizer2, device)
                    .context("failed to load second text encoder")?,
            );
        }

        let use_flash_attn = cfg!(feature = "flash-attn") && options.use_flash_attn;
        let unet = config
            .build_unet(&weights.unet, device, UNET_IN_CHANNELS, use_flash_attn, dtype)
            .context("failed to load UNet")?;
        // Decoding in half precision produces NaNs with some autoencoders.
        let vae = config
            .build_vae(&weights.vae, device, DType::F32)
            .context("failed to load autoencoder")?;

        Ok(Self {
            variant,
            device: device.clone(),
            dtype,
            sliced_attention_size: options.sliced_attention_size,
            encoders,
            unet,
            vae,
        })
    }

    /// Hidden states for the prompt, with the unconditional embedding stacked
    /// in front when classifier-free guidance is on.
    fn text_embeddings(&self, prompt: &str, use_guidance: bool) -> Result<Tensor> {
        let mut embeddings = Vec::with_capacity(self.encoders.len());
        for encoder in &self.encoders {
            let cond = encoder.encode(prompt, &self.device)?;
            let embedding = if use_guidance {
                let uncond = encoder.encode("", &self.device)?;
                Tensor::cat(&[uncond, cond], 0)?
            } else {
                cond
            };
            embeddings.push(embedding);
        }
        Ok(Tensor::cat(&embeddings, D::Minus1)?.to_dtype(self.dtype)?)
    }
}

/// Standard normal noise drawn from a seeded CPU generator, so a seed gives
/// the same starting latents on every device.
fn initial_noise(seed: u64, height: usize, width: usize) -> Result<Tensor> {
    let shape = (1, LATENT_CHANNELS, height / 8, width / 8);
    let len = LATENT_CHANNELS * (height / 8) * (width / 8);
    let mut rng = StdRng::seed_from_u64(seed);
    let data: Vec<f32> = (0..len).map(|_| rng.sample(StandardNormal)).collect();
    Ok(Tensor::from_vec(data, shape, &Device::Cpu)?)
}

impl ModelLike for StableDiffusionModel {
    fn run(&mut self, params: &GenerationParams, seed: u64) -> Result<DynamicImage> {
        let config = self.variant.config(
            self.sliced_attention_size,
            Some(params.height),
            Some(params.width),
        );
        let use_guidance = params.guidance > 1.0;

        // --- Compute text embeddings ---
        let text_embeddings = self.text_embeddings(&params.prompt, use_guidance)?;

        // --- Create scheduler and starting latents ---
        let mut scheduler = config.build_scheduler(params.steps)?;
        let timesteps = scheduler.timesteps().to_vec();
        let latents = initial_noise(seed, params.height, params.width)?.to_device(&self.device)?;
        let mut latents = (latents * scheduler.init_noise_sigma())?.to_dtype(self.dtype)?;

        // --- Denoise ---
        for (index, &timestep) in timesteps.iter().enumerate() {
            let model_input = if use_guidance {
                Tensor::cat(&[&latents, &latents], 0)?
            } else {
                latents.clone()
            };
            let model_input = scheduler.scale_model_input(model_input, timestep)?;
            let noise_pred = self
                .unet
                .forward(&model_input, timestep as f64, &text_embeddings)?;
            let noise_pred = if use_guidance {
                let chunks = noise_pred.chunk(2, 0)?;
                let (uncond, text) = (&chunks[0], &chunks[1]);
                (uncond + ((text - uncond)? * params.guidance)?)?
            } else {
                noise_pred
            };
            latents = scheduler.step(&noise_pred, timestep, &latents)?;
            debug!(step = index + 1, total = timesteps.len(), "denoising");
        }

        // --- Decode and postprocess ---
        let latents = (latents.to_dtype(DType::F32)? / self.variant.vae_scale())?;
        let decoded = self.vae.decode(&latents)?;
        let img = ((decoded / 2.)? + 0.5)?.to_device(&Device::Cpu)?;
        let img = (img.clamp(0f32, 1f32)? * 255.)?.to_dtype(DType::U8)?;

        tensor_to_image(&img.i(0)?)
    }
}
