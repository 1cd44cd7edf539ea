use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Instant,
};

use candle_core::Device;
use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{error, info};

use crate::{
    device_label, select_best_device, DeviceMap, Error, GenerationParams, ImageStore, Loader,
    ModelLike, ModelVariant, Result,
};

/// Outcome of a successful generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GeneratedImage {
    pub filename: String,
    pub seed: u64,
    pub model: ModelVariant,
}

const SAVE_FAILED: &str = "Failed to save generated image";

/// Where a generation failed. Pipeline messages reach clients verbatim,
/// storage errors do not.
enum Failure {
    Pipeline(anyhow::Error),
    Save(anyhow::Error),
}

struct ActivePipeline {
    variant: ModelVariant,
    model: Box<dyn ModelLike>,
}

/// Holds the loaded pipeline and the registry state around it.
///
/// The pipeline lock is held for a whole generation and a whole model switch,
/// so generations never see a half switched model and run one at a time.
/// `current` mirrors the active variant for readers that must not wait on a
/// running generation; it is only written while the pipeline lock is held.
pub struct LocalImageGenerator {
    loader: Arc<dyn Loader>,
    device: Device,
    device_label: String,
    store: ImageStore,
    pipeline: Arc<AsyncMutex<ActivePipeline>>,
    current: Mutex<ModelVariant>,
}

impl LocalImageGenerator {
    /// Resolves the device and loads the initial pipeline.
    pub async fn new(
        variant: ModelVariant,
        device_map: DeviceMap,
        loader: Arc<dyn Loader>,
        store: ImageStore,
    ) -> Result<Self> {
        let device =
            select_best_device(device_map).map_err(|err| Error::Device(format!("{err:#}")))?;
        let device_label = device_label(&device);
        info!(device = %device_label, model = %variant, "initializing image generator");

        let model = loader
            .load(variant, &device)
            .await
            .map_err(|err| load_error(variant, err))?;

        Ok(Self {
            loader,
            device,
            device_label,
            store,
            pipeline: Arc::new(AsyncMutex::new(ActivePipeline { variant, model })),
            current: Mutex::new(variant),
        })
    }

    pub fn available_models(&self) -> Vec<ModelVariant> {
        ModelVariant::ALL.to_vec()
    }

    pub fn current_model(&self) -> ModelVariant {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn device(&self) -> &str {
        &self.device_label
    }

    pub fn store(&self) -> &ImageStore {
        &self.store
    }

    /// Runs the active pipeline and stores the result.
    ///
    /// Never panics across this boundary: pipeline errors, save failures and
    /// a panicking worker all come back as [`Error::Generation`].
    pub async fn generate_image(&self, params: GenerationParams) -> Result<GeneratedImage> {
        let seed = params.seed.unwrap_or_else(rand::random);
        let prompt_len = params.prompt_len();
        let store = self.store.clone();

        let mut active = self.pipeline.clone().lock_owned().await;
        let model = active.variant;
        info!(
            %model,
            prompt_len,
            steps = params.steps,
            width = params.width,
            height = params.height,
            seed,
            "generating image"
        );

        let started = Instant::now();
        let outcome = tokio::task::spawn_blocking(move || -> Result<String, Failure> {
            let image = active.model.run(&params, seed).map_err(Failure::Pipeline)?;
            store.save(&image).map_err(Failure::Save)
        })
        .await;

        match outcome {
            Ok(Ok(filename)) => {
                info!(
                    %model,
                    %filename,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "image generated"
                );
                Ok(GeneratedImage {
                    filename,
                    seed,
                    model,
                })
            }
            Ok(Err(Failure::Pipeline(err))) => {
                error!(%model, prompt_len, error = %format!("{err:#}"), "image generation failed");
                Err(Error::Generation(err.to_string()))
            }
            Ok(Err(Failure::Save(err))) => {
                error!(%model, error = %format!("{err:#}"), "failed to save generated image");
                Err(Error::Generation(SAVE_FAILED.to_string()))
            }
            Err(err) => {
                error!(%model, prompt_len, error = %err, "image generation worker panicked");
                Err(Error::Generation("Image generation aborted".to_string()))
            }
        }
    }

    /// Switches the active pipeline to `name`.
    ///
    /// Unknown names fail before anything is touched. The new pipeline is
    /// loaded before the old one is dropped, so a failed load leaves the
    /// current model in service.
    pub async fn switch_model(&self, name: &str) -> Result<ModelVariant> {
        let variant: ModelVariant = name.parse()?;

        let mut active = self.pipeline.lock().await;
        if active.variant == variant {
            info!(model = %variant, "model already active");
            return Ok(variant);
        }

        info!(from = %active.variant, to = %variant, "switching model");
        let model = self
            .loader
            .load(variant, &self.device)
            .await
            .map_err(|err| load_error(variant, err))?;

        active.model = model;
        active.variant = variant;
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = variant;
        info!(model = %variant, "model switched");
        Ok(variant)
    }
}

fn load_error(variant: ModelVariant, err: anyhow::Error) -> Error {
    error!(model = %variant, error = %format!("{err:#}"), "failed to load model");
    Error::ModelLoad {
        variant,
        reason: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use anyhow::anyhow;
    use async_trait::async_trait;
    use image::DynamicImage;

    use super::*;

    struct SolidModel {
        fail_with: Option<&'static str>,
        panic: bool,
        delay: Duration,
    }

    impl ModelLike for SolidModel {
        fn run(&mut self, params: &GenerationParams, _seed: u64) -> anyhow::Result<DynamicImage> {
            if self.panic {
                panic!("device lost");
            }
            std::thread::sleep(self.delay);
            match self.fail_with {
                Some(message) => Err(anyhow!(message)),
                None => Ok(DynamicImage::new_rgb8(
                    params.width as u32 / 8,
                    params.height as u32 / 8,
                )),
            }
        }
    }

    #[derive(Default)]
    struct FakeLoader {
        fail_with: Option<&'static str>,
        panic: bool,
        refuse: Vec<ModelVariant>,
        delay: Duration,
        loads: AtomicUsize,
    }

    #[async_trait]
    impl Loader for FakeLoader {
        async fn load(
            &self,
            variant: ModelVariant,
            _device: &Device,
        ) -> anyhow::Result<Box<dyn ModelLike>> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            if self.refuse.contains(&variant) {
                anyhow::bail!("weights for {variant} are missing");
            }
            Ok(Box::new(SolidModel {
                fail_with: self.fail_with,
                panic: self.panic,
                delay: self.delay,
            }))
        }
    }

    async fn setup(
        loader: FakeLoader,
    ) -> (tempfile::TempDir, Arc<FakeLoader>, LocalImageGenerator) {
        let dir = tempfile::tempdir().unwrap();
        let store = ImageStore::open(dir.path()).unwrap();
        let loader = Arc::new(loader);
        let generator =
            LocalImageGenerator::new(ModelVariant::Sd15, DeviceMap::ForceCpu, loader.clone(), store)
                .await
                .unwrap();
        (dir, loader, generator)
    }

    #[tokio::test]
    async fn generates_and_stores_images() {
        let (_dir, _loader, generator) = setup(FakeLoader::default()).await;
        assert_eq!(generator.device(), "cpu");

        let mut params = GenerationParams::new("a red bicycle");
        params.seed = Some(1234);
        let generated = generator.generate_image(params).await.unwrap();

        assert_eq!(generated.seed, 1234);
        assert_eq!(generated.model, ModelVariant::Sd15);
        assert!(ImageStore::is_generated_name(&generated.filename));
        let (bytes, _) = generator.store().read(&generated.filename).await.unwrap();
        let image = image::load_from_memory(&bytes).unwrap();
        assert_eq!((image.width(), image.height()), (64, 64));
    }

    #[tokio::test]
    async fn random_seed_is_reported() {
        let (_dir, _loader, generator) = setup(FakeLoader::default()).await;
        let first = generator
            .generate_image(GenerationParams::new("moon"))
            .await
            .unwrap();
        let second = generator
            .generate_image(GenerationParams::new("moon"))
            .await
            .unwrap();
        assert_ne!(first.filename, second.filename);
        assert_ne!(first.seed, second.seed);
    }

    #[tokio::test]
    async fn pipeline_errors_become_results() {
        let loader = FakeLoader {
            fail_with: Some("CUDA out of memory"),
            ..Default::default()
        };
        let (_dir, _loader, generator) = setup(loader).await;
        let err = generator
            .generate_image(GenerationParams::new("castle"))
            .await
            .unwrap_err();
        assert!(matches!(&err, Error::Generation(message) if message == "CUDA out of memory"));
    }

    #[tokio::test]
    async fn worker_panics_become_results() {
        let loader = FakeLoader {
            panic: true,
            ..Default::default()
        };
        let (_dir, _loader, generator) = setup(loader).await;
        let err = generator
            .generate_image(GenerationParams::new("castle"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Generation(_)));

        // The pipeline lock is released again.
        assert_eq!(
            generator.switch_model("sdxl").await.unwrap(),
            ModelVariant::Sdxl
        );
    }

    #[tokio::test]
    async fn save_failures_do_not_leak_paths() {
        let (dir, _loader, generator) = setup(FakeLoader::default()).await;
        std::fs::remove_dir_all(dir.path()).unwrap();

        let err = generator
            .generate_image(GenerationParams::new("castle"))
            .await
            .unwrap_err();
        assert!(matches!(&err, Error::Generation(message) if message == SAVE_FAILED));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn switch_waits_for_running_generation() {
        let loader = FakeLoader {
            delay: Duration::from_millis(300),
            ..Default::default()
        };
        let (_dir, _loader, generator) = setup(loader).await;
        let generator = Arc::new(generator);

        let running = tokio::spawn({
            let generator = generator.clone();
            async move {
                generator
                    .generate_image(GenerationParams::new("lighthouse"))
                    .await
            }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        // Readers are not blocked by the running generation.
        assert_eq!(generator.current_model(), ModelVariant::Sd15);

        let started = Instant::now();
        assert_eq!(
            generator.switch_model("sdxl").await.unwrap(),
            ModelVariant::Sdxl
        );
        let waited = started.elapsed();

        let generated = running.await.unwrap().unwrap();
        assert_eq!(generated.model, ModelVariant::Sd15);
        assert!(
            waited >= Duration::from_millis(150),
            "switch returned after {waited:?}"
        );
        assert_eq!(generator.current_model(), ModelVariant::Sdxl);
    }

    #[tokio::test]
    async fn switches_between_available_models() {
        let (_dir, loader, generator) = setup(FakeLoader::default()).await;
        assert_eq!(
            generator.available_models(),
            vec![ModelVariant::Sd15, ModelVariant::Sdxl]
        );

        assert_eq!(generator.switch_model("sdxl").await.unwrap(), ModelVariant::Sdxl);
        assert_eq!(generator.current_model(), ModelVariant::Sdxl);
        assert_eq!(loader.loads.load(Ordering::SeqCst), 2);

        // Switching to the active model does not reload it.
        generator.switch_model("sdxl").await.unwrap();
        assert_eq!(loader.loads.load(Ordering::SeqCst), 2);

        let generated = generator
            .generate_image(GenerationParams::new("forest"))
            .await
            .unwrap();
        assert_eq!(generated.model, ModelVariant::Sdxl);
    }

    #[tokio::test]
    async fn unknown_model_leaves_state_untouched() {
        let (_dir, loader, generator) = setup(FakeLoader::default()).await;
        let err = generator.switch_model("midjourney").await.unwrap_err();
        assert!(matches!(err, Error::UnknownModel { ref name, .. } if name == "midjourney"));
        assert_eq!(generator.current_model(), ModelVariant::Sd15);
        assert_eq!(loader.loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_load_keeps_previous_model() {
        let loader = FakeLoader {
            refuse: vec![ModelVariant::Sdxl],
            ..Default::default()
        };
        let (_dir, _loader, generator) = setup(loader).await;
        let err = generator.switch_model("sdxl").await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "Failed to load model sdxl: weights for sdxl are missing"
        );
        assert_eq!(generator.current_model(), ModelVariant::Sd15);
        assert!(generator
            .generate_image(GenerationParams::new("river"))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn initial_load_failure_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let loader = Arc::new(FakeLoader {
            refuse: vec![ModelVariant::Sd15],
            ..Default::default()
        });
        let result = LocalImageGenerator::new(
            ModelVariant::Sd15,
            DeviceMap::ForceCpu,
            loader,
            ImageStore::open(dir.path()).unwrap(),
        )
        .await;
        assert!(matches!(result, Err(Error::ModelLoad { .. })));
    }
}
