use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use candle_core::Device;
use hf_hub::api::tokio::{Api, ApiBuilder};
use tracing::{debug, info};

use crate::{
    model_variant::HubFile, stable_diffusion::StableDiffusionModel, ModelLike, ModelVariant,
};

/// Builds ready-to-run pipelines for a model variant.
#[async_trait]
pub trait Loader: Send + Sync {
    async fn load(&self, variant: ModelVariant, device: &Device) -> Result<Box<dyn ModelLike>>;
}

/// Knobs applied to every pipeline a [`HubLoader`] builds.
#[derive(Debug, Clone, Default)]
pub struct PipelineOptions {
    pub sliced_attention_size: Option<usize>,
    /// Only honoured when built with the `flash-attn` feature.
    pub use_flash_attn: bool,
}

/// Local paths of every file a variant needs.
#[derive(Debug, Clone)]
pub struct LocalWeights {
    pub unet: PathBuf,
    pub vae: PathBuf,
    pub clip: PathBuf,
    pub tokenizer: PathBuf,
    pub clip2: Option<PathBuf>,
    pub tokenizer2: Option<PathBuf>,
}

/// Loads Stable Diffusion pipelines from weights cached from the Hugging Face hub.
pub struct HubLoader {
    api: Api,
    options: PipelineOptions,
}

impl HubLoader {
    pub fn new(api: Api, options: PipelineOptions) -> Self {
        Self { api, options }
    }

    /// Creates a loader that keeps downloaded weights under `cache_dir`.
    pub fn with_cache_dir(
        cache_dir: impl Into<PathBuf>,
        token: Option<String>,
        options: PipelineOptions,
    ) -> Result<Self> {
        let mut builder = ApiBuilder::new()
            .with_cache_dir(cache_dir.into())
            .with_progress(false);
        if token.is_some() {
            builder = builder.with_token(token);
        }
        let api = builder.build().context("failed to create hf hub API")?;
        Ok(Self::new(api, options))
    }

    async fn fetch_file(&self, file: HubFile) -> Result<PathBuf> {
        debug!(repo = file.repo, path = file.path, "fetching weights");
        self.api
            .model(file.repo.to_string())
            .get(file.path)
            .await
            .with_context(|| format!("failed to fetch {}/{}", file.repo, file.path))
    }

    /// Makes sure every file of `variant` is in the local cache.
    pub async fn fetch(&self, variant: ModelVariant) -> Result<LocalWeights> {
        let weights = variant.weights();
        let tokenizer = self.fetch_file(weights.tokenizer).await?;
        let clip = self.fetch_file(weights.clip).await?;
        let unet = self.fetch_file(weights.unet).await?;
        let vae = self.fetch_file(weights.vae).await?;
        let tokenizer2 = match weights.tokenizer2 {
            Some(file) => Some(self.fetch_file(file).await?),
            None => None,
        };
        let clip2 = match weights.clip2 {
            Some(file) => Some(self.fetch_file(file).await?),
            None => None,
        };
        Ok(LocalWeights {
            unet,
            vae,
            clip,
            tokenizer,
            clip2,
            tokenizer2,
        })
    }
}

#[async_trait]
impl Loader for HubLoader {
    async fn load(&self, variant: ModelVariant, device: &Device) -> Result<Box<dyn ModelLike>> {
        info!(model = %variant, "loading {}", variant.description());
        let weights = self.fetch(variant).await?;

        let options = self.options.clone();
        let device = device.clone();
        let model = tokio::task::spawn_blocking(move || {
            StableDiffusionModel::load(variant, &weights, &device, &options)
        })
        .await
        .context("model loading task failed")??;

        info!(model = %variant, "model loaded");
        Ok(Box::new(model))
    }
}
