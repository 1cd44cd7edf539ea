#[cfg(feature = "accelerate")]
extern crate accelerate_src;
#[cfg(feature = "mkl")]
extern crate intel_mkl_src;

pub mod device_map;
pub mod error;
pub mod generator;
pub mod loader;
pub mod model_variant;
pub mod params;
pub mod store;
mod util;

mod stable_diffusion;

pub use device_map::*;
pub use error::{Error, Result};
pub use generator::{GeneratedImage, LocalImageGenerator};
use image::DynamicImage;
pub use loader::*;
pub use model_variant::ModelVariant;
pub use params::{GenerationParams, GenerationRequest, MAX_PROMPT_CHARS};
pub use stable_diffusion::StableDiffusionModel;
pub use store::ImageStore;
pub use util::{device_label, select_best_device};
pub(crate) use util::*;

/// A loaded pipeline that turns validated parameters into an image.
///
/// Implementations are driven by one caller at a time; the generator keeps
/// them behind a lock.
pub trait ModelLike: Send {
    fn run(&mut self, params: &GenerationParams, seed: u64) -> anyhow::Result<DynamicImage>;
}
