use std::path::PathBuf;

use clap::{Parser, Subcommand};
use prompt2pixel_core::{DeviceMap, ModelVariant, PipelineOptions};

// Define command line arguments
#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Local Stable Diffusion image generation server")]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Host address to bind the server to
    #[arg(long, env = "P2P_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Port to bind the server to
    #[arg(long, env = "P2P_PORT", default_value_t = 5000)]
    pub port: u16,

    /// Model variant loaded at startup (sd15, sdxl)
    #[arg(long, env = "P2P_MODEL", default_value = "sd15")]
    pub model: ModelVariant,

    /// Compute device: auto, cpu, cuda:N or N
    #[arg(long, env = "P2P_DEVICE", default_value = "auto")]
    pub device: DeviceMap,

    /// Use CPU instead of GPU, overrides --device
    #[arg(long)]
    pub cpu: bool,

    /// Directory generated images are written to and served from
    #[arg(long, env = "P2P_OUTPUT_DIR", default_value = "generated_images")]
    pub output_dir: PathBuf,

    /// Directory holding downloaded model weights
    #[arg(long, env = "P2P_MODELS_DIR", default_value = "models", global = true)]
    pub models_dir: PathBuf,

    /// Compute attention in slices of this size to lower peak memory
    #[arg(long, env = "P2P_SLICED_ATTENTION_SIZE")]
    pub sliced_attention_size: Option<usize>,

    /// Use flash attention in the UNet (requires the `flash-attn` feature)
    #[arg(long)]
    pub use_flash_attn: bool,

    /// Hugging Face token for gated or rate limited downloads
    #[arg(long, env = "HF_TOKEN", hide_env_values = true, global = true)]
    pub hf_token: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Run the HTTP server (the default)
    Serve,
    /// Download model weights into the models directory
    Download {
        /// Models to fetch, all of them when empty
        models: Vec<ModelVariant>,
    },
}

impl Args {
    pub fn device_map(&self) -> DeviceMap {
        if self.cpu {
            DeviceMap::ForceCpu
        } else {
            self.device
        }
    }

    pub fn pipeline_options(&self) -> PipelineOptions {
        PipelineOptions {
            sliced_attention_size: self.sliced_attention_size,
            use_flash_attn: self.use_flash_attn,
        }
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
