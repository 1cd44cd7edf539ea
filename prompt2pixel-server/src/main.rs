use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use prompt2pixel_core::{HubLoader, ImageStore, LocalImageGenerator, ModelVariant};
use prompt2pixel_server::{
    build_router,
    config::{Args, Command},
    logging::init_tracing,
    AppState, ENDPOINTS,
};
use tokio::{self, net::TcpListener};
use tracing::{error, info};

async fn build_generator(args: &Args, store: ImageStore) -> Result<LocalImageGenerator> {
    let loader = HubLoader::with_cache_dir(
        args.models_dir.clone(),
        args.hf_token.clone(),
        args.pipeline_options(),
    )?;
    let generator =
        LocalImageGenerator::new(args.model, args.device_map(), Arc::new(loader), store).await?;
    Ok(generator)
}

async fn serve(args: Args) -> Result<()> {
    let store = ImageStore::open(&args.output_dir)
        .with_context(|| format!("failed to create {}", args.output_dir.display()))?;
    std::fs::create_dir_all(&args.models_dir)
        .with_context(|| format!("failed to create {}", args.models_dir.display()))?;

    // A generator that fails to come up leaves the API running in degraded mode.
    let state = match build_generator(&args, store.clone()).await {
        Ok(generator) => {
            info!("image generator initialized successfully");
            AppState::ready(Arc::new(generator))
        }
        Err(err) => {
            error!(error = %format!("{err:#}"), "failed to initialize image generator");
            AppState::degraded(store)
        }
    };

    // --- Build axum router with shared state ---
    let app = build_router(state);

    // --- Start the server ---
    let bind_address = args.bind_address();
    let listener = TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("failed to bind {bind_address}"))?;
    info!(address = %listener.local_addr()?, "started server");
    for (_, route) in ENDPOINTS {
        info!("  {route}");
    }

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("server stopped");
    Ok(())
}

async fn download(args: &Args, models: Vec<ModelVariant>) -> Result<()> {
    let models = if models.is_empty() {
        ModelVariant::ALL.to_vec()
    } else {
        models
    };
    let loader = HubLoader::with_cache_dir(
        args.models_dir.clone(),
        args.hf_token.clone(),
        args.pipeline_options(),
    )?;

    let mut failed = Vec::new();
    for variant in models {
        info!(model = %variant, "downloading {}", variant.description());
        match loader.fetch(variant).await {
            Ok(_) => info!(model = %variant, "downloaded successfully"),
            Err(err) => {
                error!(model = %variant, error = %format!("{err:#}"), "download failed");
                failed.push(variant.as_str());
            }
        }
    }

    if !failed.is_empty() {
        anyhow::bail!("failed to download: {}", failed.join(", "));
    }
    info!(dir = %args.models_dir.display(), "model download completed");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    match args.command.clone().unwrap_or(Command::Serve) {
        Command::Serve => serve(args).await,
        Command::Download { models } => download(&args, models).await,
    }
}
