use std::{fmt, str::FromStr};

use candle_transformers::models::stable_diffusion::StableDiffusionConfig;
use serde::{Deserialize, Serialize};

use crate::Error;

/// A file inside a Hugging Face hub repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HubFile {
    pub repo: &'static str,
    pub path: &'static str,
}

impl HubFile {
    const fn new(repo: &'static str, path: &'static str) -> Self {
        Self { repo, path }
    }
}

/// Where the weights and tokenizers of a variant live on the hub.
#[derive(Debug, Clone, Copy)]
pub struct VariantWeights {
    pub unet: HubFile,
    pub vae: HubFile,
    pub clip: HubFile,
    pub tokenizer: HubFile,
    /// Second text encoder, SDXL only.
    pub clip2: Option<HubFile>,
    pub tokenizer2: Option<HubFile>,
}

impl VariantWeights {
    /// Every file the variant needs, in download order.
    pub fn files(&self) -> Vec<HubFile> {
        let mut files = vec![self.tokenizer, self.clip, self.unet, self.vae];
        files.extend(self.tokenizer2);
        files.extend(self.clip2);
        files
    }
}

const SD15_REPO: &str = "stable-diffusion-v1-5/stable-diffusion-v1-5";
const SDXL_REPO: &str = "stabilityai/stable-diffusion-xl-base-1.0";

/// Stable Diffusion variants the generator can switch between.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelVariant {
    Sd15,
    Sdxl,
}

impl ModelVariant {
    pub const ALL: [ModelVariant; 2] = [ModelVariant::Sd15, ModelVariant::Sdxl];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sd15 => "sd15",
            Self::Sdxl => "sdxl",
        }
    }

    /// Look a variant up by its identifier. Matching is exact apart from
    /// surrounding whitespace and ASCII case.
    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.trim();
        Self::ALL
            .into_iter()
            .find(|variant| variant.as_str().eq_ignore_ascii_case(name))
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::Sd15 => "Stable Diffusion 1.5",
            Self::Sdxl => "Stable Diffusion XL base 1.0",
        }
    }

    pub fn weights(&self) -> VariantWeights {
        match self {
            Self::Sd15 => VariantWeights {
                unet: HubFile::new(SD15_REPO, "unet/diffusion_pytorch_model.safetensors"),
                vae: HubFile::new(SD15_REPO, "vae/diffusion_pytorch_model.safetensors"),
                clip: HubFile::new(SD15_REPO, "text_encoder/model.safetensors"),
                tokenizer: HubFile::new("openai/clip-vit-base-patch32", "tokenizer.json"),
                clip2: None,
                tokenizer2: None,
            },
            Self::Sdxl => VariantWeights {
                unet: HubFile::new(SDXL_REPO, "unet/diffusion_pytorch_model.safetensors"),
                vae: HubFile::new(SDXL_REPO, "vae/diffusion_pytorch_model.safetensors"),
                clip: HubFile::new(SDXL_REPO, "text_encoder/model.safetensors"),
                tokenizer: HubFile::new("openai/clip-vit-large-patch14", "tokenizer.json"),
                clip2: Some(HubFile::new(SDXL_REPO, "text_encoder_2/model.safetensors")),
                tokenizer2: Some(HubFile::new(
                    "laion/CLIP-ViT-bigG-14-laion2B-39B-b160k",
                    "tokenizer.json",
                )),
            },
        }
    }

    /// candle configuration for this variant. `height` and `width` must be
    /// multiples of 8, candle asserts on it.
    pub fn config(
        &self,
        sliced_attention_size: Option<usize>,
        height: Option<usize>,
        width: Option<usize>,
    ) -> StableDiffusionConfig {
        match self {
            Self::Sd15 => StableDiffusionConfig::v1_5(sliced_attention_size, height, width),
            Self::Sdxl => StableDiffusionConfig::sdxl(sliced_attention_size, height, width),
        }
    }

    /// Latent scaling factor of the variant's autoencoder.
    pub fn vae_scale(&self) -> f64 {
        match self {
            Self::Sd15 => 0.18215,
            Self::Sdxl => 0.13025,
        }
    }
}

impl fmt::Display for ModelVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelVariant {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_name(s).ok_or_else(|| Error::unknown_model(s))
    }
}
