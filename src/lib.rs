//! Zarr Recipes
//!
//! Subset and rechunk remote OPeNDAP (DAP2) datasets into a Zarr v3 store.
//!
//! # Architecture
//!
//! - **Patterns**: which inputs exist and where each lands in the output
//! - **I/O**: DAP2 reading over HTTP and Zarr writing through object_store
//! - **Transform**: per-fragment preprocessing and schema combination
//! - **Pipeline**: the recipe's open → preprocess → write stages, with metrics
//!
//! # Usage
//!
//! ```no_run
//! use zarr_recipes::{run_recipe, Config};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_file(&"recipe.yaml".into())?;
//!     run_recipe(config).await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod dataset;
pub mod io;
pub mod patterns;
pub mod pipeline;
pub mod transform;

pub use config::Config;
pub use dataset::Dataset;
pub use io::{DapReader, DatasetOpener, ZarrWriter};
pub use patterns::{narr_air_url, FilePattern};
pub use pipeline::{Metrics, Recipe, RecipeStats};
pub use transform::PromoteToCoordinate;

use anyhow::Result;
use pipeline::{MetricsReporter, StageConfig, ZarrTarget};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Assemble the recipe a configuration describes, reading through `opener`.
pub fn recipe_from_config(config: &Config, opener: Arc<dyn DatasetOpener>, metrics: Arc<Metrics>) -> Result<Recipe> {
    let store = io::create_output_store(&config.output)?;
    let target = ZarrTarget::new(store, io::output_target(&config.output))
        .with_target_chunks(config.output.target_chunks.clone())
        .with_compression_level(config.output.compression_level);

    Ok(Recipe::new(config.input.file_pattern())
        .open_with(opener)
        .subset(config.input.subset.clone())
        .preprocess(config.preprocess.chain())
        .store_to_zarr(target)
        .with_config(StageConfig::from_processing(&config.processing))
        .with_metrics(metrics))
}

/// Run the recipe a configuration describes against its DAP2 server.
pub async fn run_recipe(config: Config) -> Result<RecipeStats> {
    config.validate()?;

    let metrics = Metrics::new();
    let reader = Arc::new(DapReader::new(&config.processing, Some(metrics.clone()))?);
    run_recipe_with(config, reader, metrics).await
}

/// Run a configured recipe with any opener, reporting progress and metrics.
pub async fn run_recipe_with(
    config: Config,
    opener: Arc<dyn DatasetOpener>,
    metrics: Arc<Metrics>,
) -> Result<RecipeStats> {
    config.validate()?;
    tracing::info!("Starting recipe");
    tracing::info!("Writing Zarr output to: {}", config.output.path_display());

    let recipe = recipe_from_config(&config, opener, metrics.clone())?;
    let total = recipe.pattern().len() as u64;

    let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
    let reporter_handle = if config.processing.enable_metrics {
        let reporter = MetricsReporter::new(metrics.clone(), config.processing.metrics_interval_secs, total);
        Some(tokio::spawn(reporter.run(shutdown_rx)))
    } else {
        drop(shutdown_rx);
        None
    };

    let result = recipe.run().await;

    let _ = shutdown_tx.send(()).await;
    if let Some(handle) = reporter_handle {
        let _ = handle.await;
    }

    if config.processing.enable_metrics {
        MetricsReporter::new(metrics.clone(), config.processing.metrics_interval_secs, total).print_summary();

        if let Some(ref path) = config.processing.metrics_output_path {
            if let Err(e) = metrics.snapshot().save_to_file(path) {
                tracing::warn!("Failed to save metrics to {}: {}", path, e);
            }
        }
    }

    let stats = result?;
    tracing::info!("Recipe complete: {}", stats);
    Ok(stats)
}

/// Build a Tokio runtime with the specified configuration.
pub fn build_runtime(worker_threads: Option<usize>) -> Result<tokio::runtime::Runtime> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();

    if let Some(threads) = worker_threads {
        builder.worker_threads(threads);
    }

    builder.enable_all();

    Ok(builder.build()?)
}

/// Initialize the Rayon thread pool used for XDR decoding.
pub fn init_rayon(threads: Option<usize>) -> Result<()> {
    if let Some(threads) = threads {
        rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build_global()?;
    }
    Ok(())
}
