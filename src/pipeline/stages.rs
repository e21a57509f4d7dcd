//! Recipe execution: a schema pass followed by three decoupled stages.
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │    Open     │────▶│ Preprocess  │────▶│ Zarr Writer │
//! │   Stage     │     │   Stage     │     │   Stage     │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!        │                   │                   │
//!    work queue        preprocess_rx         write_rx
//! ```
//!
//! Opening is network bound, preprocessing runs on the blocking pool and
//! writing is storage bound; bounded channels between them keep at most a
//! few decoded fragments in memory.

use crate::config::{ProcessingConfig, RetryConfig};
use crate::dataset::Dataset;
use crate::io::dap::DapError;
use crate::io::{DatasetOpener, Subset, ZarrWriter};
use crate::patterns::{FilePattern, Index};
use crate::pipeline::Metrics;
use crate::transform::{determine_target_chunks, CombinedSchema, DatasetSchema, PreprocessChain, SchemaAccumulator};
use anyhow::{bail, Context, Result};
use futures::stream::{self, StreamExt};
use object_store::ObjectStore;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Where and how a recipe writes its output.
#[derive(Clone)]
pub struct ZarrTarget {
    pub store: Arc<dyn ObjectStore>,
    /// Path of the Zarr group inside `store`
    pub path: String,
    /// Chunk size per dimension; unlisted dimensions are one chunk
    pub target_chunks: BTreeMap<String, usize>,
    pub compression_level: i32,
}

impl ZarrTarget {
    pub fn new(store: Arc<dyn ObjectStore>, path: impl Into<String>) -> Self {
        Self {
            store,
            path: path.into(),
            target_chunks: BTreeMap::new(),
            compression_level: 3,
        }
    }

    pub fn with_target_chunks(mut self, target_chunks: BTreeMap<String, usize>) -> Self {
        self.target_chunks = target_chunks;
        self
    }

    pub fn with_compression_level(mut self, level: i32) -> Self {
        self.compression_level = level;
        self
    }
}

/// Stage concurrency and retry policy.
#[derive(Debug, Clone)]
pub struct StageConfig {
    /// Concurrent opens, in both the schema pass and the open stage
    pub open_concurrency: usize,
    /// Concurrent preprocess tasks (CPU-bound, uses spawn_blocking)
    pub preprocess_concurrency: usize,
    /// Concurrent fragment writes
    pub write_concurrency: usize,
    /// Channel buffer between stages
    pub channel_buffer: usize,
    pub retry: RetryConfig,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            open_concurrency: 4,
            preprocess_concurrency: 4,
            write_concurrency: 4,
            channel_buffer: 8,
            retry: RetryConfig::default(),
        }
    }
}

impl StageConfig {
    pub fn from_processing(processing: &ProcessingConfig) -> Self {
        let concurrency = processing.concurrency.max(1);
        Self {
            open_concurrency: concurrency,
            preprocess_concurrency: concurrency,
            write_concurrency: concurrency,
            channel_buffer: concurrency * 2,
            retry: processing.retry.clone(),
        }
    }
}

/// A fragment moving between stages. The index carries element offsets.
struct Fragment {
    index: Index,
    url: String,
    ds: Dataset,
}

/// Whether an error carries a DAP failure that retrying cannot fix, such as
/// a 404 or an unparseable response.
fn is_permanent(e: &anyhow::Error) -> bool {
    e.chain()
        .find_map(|cause| cause.downcast_ref::<DapError>())
        .is_some_and(|dap| !dap.is_transient())
}

/// Run `op` until it succeeds, fails permanently, or `retry.max_retries`
/// attempts have failed, doubling the backoff after each failure.
async fn with_retry<T, F, Fut>(retry: &RetryConfig, metrics: &Metrics, what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    let mut backoff = retry.initial_backoff_ms;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                attempt += 1;
                if is_permanent(&e) {
                    tracing::error!("{} failed permanently: {:#}", what, e);
                    return Err(e);
                }
                if attempt >= retry.max_retries {
                    tracing::error!("{} failed after {} attempts: {:#}", what, attempt, e);
                    return Err(e);
                }

                tracing::warn!(
                    "{} attempt {} failed: {:#}, retrying in {}ms",
                    what,
                    attempt,
                    e,
                    backoff
                );
                metrics.add_retry();
                tokio::time::sleep(Duration::from_millis(backoff)).await;
                backoff = (backoff * 2).min(retry.max_backoff_ms);
            }
        }
    }
}

/// Open each input of a file pattern, preprocess it and write it into one
/// Zarr store.
///
/// ```no_run
/// # use std::collections::BTreeMap;
/// # use std::sync::Arc;
/// # use zarr_recipes::io::DapReader;
/// # use zarr_recipes::patterns::{ConcatDim, FilePattern, UrlTemplate};
/// # use zarr_recipes::pipeline::{Recipe, ZarrTarget};
/// # use zarr_recipes::transform::{PreprocessChain, PromoteToCoordinate};
/// # async fn run(reader: DapReader, store: Arc<dyn object_store::ObjectStore>) -> anyhow::Result<()> {
/// let pattern = FilePattern::from_template(
///     UrlTemplate::new("https://psl.noaa.gov/thredds/dodsC/Datasets/NARR/pressure/air.{time}.nc"),
///     vec![ConcatDim::new("time", vec!["197901".into()]).into()],
/// );
/// let mut chain = PreprocessChain::new();
/// chain.push(Arc::new(PromoteToCoordinate::new(["Lambert_Conformal"])));
///
/// let target = ZarrTarget::new(store, "narr-air.zarr")
///     .with_target_chunks(BTreeMap::from([("time".to_string(), 1)]));
/// let stats = Recipe::new(pattern)
///     .open_with(Arc::new(reader))
///     .preprocess(chain)
///     .store_to_zarr(target)
///     .run()
///     .await?;
/// println!("{}", stats);
/// # Ok(())
/// # }
/// ```
pub struct Recipe {
    pattern: FilePattern,
    opener: Option<Arc<dyn DatasetOpener>>,
    subset: Arc<Subset>,
    preprocess: PreprocessChain,
    target: Option<ZarrTarget>,
    config: StageConfig,
    metrics: Arc<Metrics>,
}

impl Recipe {
    pub fn new(pattern: FilePattern) -> Self {
        Self {
            pattern,
            opener: None,
            subset: Arc::new(Subset::new()),
            preprocess: PreprocessChain::new(),
            target: None,
            config: StageConfig::default(),
            metrics: Metrics::new(),
        }
    }

    pub fn open_with(mut self, opener: Arc<dyn DatasetOpener>) -> Self {
        self.opener = Some(opener);
        self
    }

    /// Server-side subset applied to every input.
    pub fn subset(mut self, subset: Subset) -> Self {
        self.subset = Arc::new(subset);
        self
    }

    pub fn preprocess(mut self, chain: PreprocessChain) -> Self {
        self.preprocess = chain;
        self
    }

    pub fn store_to_zarr(mut self, target: ZarrTarget) -> Self {
        self.target = Some(target);
        self
    }

    pub fn with_config(mut self, config: StageConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn pattern(&self) -> &FilePattern {
        &self.pattern
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Run the recipe to completion.
    ///
    /// Fails if any fragment could not be opened, preprocessed or written,
    /// after the remaining fragments have been processed.
    pub async fn run(&self) -> Result<RecipeStats> {
        let opener = self.opener.clone().context("Recipe has no opener (call open_with)")?;
        let target = self.target.as_ref().context("Recipe has no target (call store_to_zarr)")?;

        let items = self.pattern.items();
        if items.is_empty() {
            bail!("File pattern {:?} has no inputs", self.pattern);
        }
        let total = items.len();
        tracing::info!("Running recipe over {} inputs", total);

        let combined = self.combine_schemas(&opener, &items).await?;
        let chunks = determine_target_chunks(&combined.schema, &target.target_chunks)?;
        combined.check_chunk_alignment(&chunks)?;
        let writer = Arc::new(
            ZarrWriter::create(
                target.store.clone(),
                &target.path,
                &combined.schema,
                &chunks,
                target.compression_level,
                Some(self.metrics.clone()),
            )
            .await
            .with_context(|| format!("Failed to create Zarr store at {:?}", target.path))?,
        );

        let work = items
            .into_iter()
            .map(|(index, url)| Ok((combined.index_to_offsets(&index)?, url)))
            .collect::<Result<Vec<_>>>()?;

        let failures_before = self.metrics.failures.load(Ordering::Relaxed);
        let written_before = self.metrics.fragments_written.load(Ordering::Relaxed);

        let (preprocess_tx, preprocess_rx) = mpsc::channel::<Fragment>(self.config.channel_buffer.max(1));
        let (write_tx, write_rx) = mpsc::channel::<Fragment>(self.config.channel_buffer.max(1));

        let preprocess_handle = self.spawn_preprocess_stage(preprocess_rx, write_tx);
        let write_handle = self.spawn_write_stage(writer.clone(), write_rx);

        self.run_open_stage(opener, work, preprocess_tx).await;

        preprocess_handle.await.context("Preprocess stage panicked")?;
        write_handle.await.context("Write stage panicked")?;
        writer.finalize()?;

        let stats = RecipeStats {
            total,
            written: (self.metrics.fragments_written.load(Ordering::Relaxed) - written_before) as usize,
            failed: (self.metrics.failures.load(Ordering::Relaxed) - failures_before) as usize,
        };
        tracing::info!("Recipe finished: {}", stats);

        if stats.failed > 0 || stats.written != stats.total {
            bail!("Recipe incomplete: {}", stats);
        }
        Ok(stats)
    }

    /// Open every input's schema, preprocess it and combine the results.
    async fn combine_schemas(
        &self,
        opener: &Arc<dyn DatasetOpener>,
        items: &[(Index, String)],
    ) -> Result<CombinedSchema> {
        let start = Instant::now();

        let schemas: Vec<Result<(Index, DatasetSchema)>> = stream::iter(items.iter().cloned())
            .map(|(index, url)| async move {
                let schema = with_retry(&self.config.retry, &self.metrics, &url, || {
                    opener.open_schema(&url, &self.subset)
                })
                .await
                .with_context(|| format!("Failed to open schema of {}", url))?;
                let schema = self
                    .preprocess
                    .apply_schema(schema)
                    .with_context(|| format!("Failed to preprocess schema of {}", url))?;
                Ok((index, schema))
            })
            .buffer_unordered(self.config.open_concurrency.max(1))
            .collect()
            .await;

        let mut acc = SchemaAccumulator::new();
        for result in schemas {
            let (index, schema) = result?;
            acc.add_input(&index, schema)?;
        }
        let combined = acc.finish(&self.pattern)?;

        tracing::info!(
            "Combined {} schemas in {:.1}s: dims {:?}, {} variables",
            items.len(),
            start.elapsed().as_secs_f64(),
            combined.schema.dims,
            combined.schema.variables.len()
        );
        Ok(combined)
    }

    /// Open stage: `open_concurrency` workers pulling from a shared queue.
    async fn run_open_stage(
        &self,
        opener: Arc<dyn DatasetOpener>,
        work: Vec<(Index, String)>,
        preprocess_tx: mpsc::Sender<Fragment>,
    ) {
        let (work_tx, work_rx) = async_channel::bounded::<(Index, String)>(work.len().max(1));
        for item in work {
            let _ = work_tx.send(item).await;
        }
        work_tx.close();

        let mut handles = Vec::with_capacity(self.config.open_concurrency);
        for _ in 0..self.config.open_concurrency.max(1) {
            let opener = opener.clone();
            let subset = self.subset.clone();
            let retry = self.config.retry.clone();
            let metrics = self.metrics.clone();
            let preprocess_tx = preprocess_tx.clone();
            let work_rx = work_rx.clone();

            handles.push(tokio::spawn(async move {
                while let Ok((index, url)) = work_rx.recv().await {
                    let opened = with_retry(&retry, &metrics, &url, || opener.open_dataset(&url, &subset)).await;
                    match opened {
                        Ok(ds) => {
                            metrics.add_fragment_opened();
                            tracing::debug!("Opened {} for {}", url, index);
                            if preprocess_tx.send(Fragment { index, url, ds }).await.is_err() {
                                tracing::debug!("Preprocess receiver dropped, stopping open worker");
                                break;
                            }
                        }
                        Err(e) => {
                            tracing::error!("Giving up on {}: {:#}", url, e);
                            metrics.add_failure();
                        }
                    }
                }
            }));
        }

        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!("Open worker panicked: {}", e);
            }
        }
    }

    /// Preprocess stage: runs the chain on the blocking pool.
    fn spawn_preprocess_stage(
        &self,
        mut preprocess_rx: mpsc::Receiver<Fragment>,
        write_tx: mpsc::Sender<Fragment>,
    ) -> tokio::task::JoinHandle<()> {
        let chain = self.preprocess.clone();
        let metrics = self.metrics.clone();
        let concurrency = self.config.preprocess_concurrency.max(1);

        tokio::spawn(async move {
            let mut pending = Vec::new();

            while let Some(fragment) = preprocess_rx.recv().await {
                let chain = chain.clone();
                let metrics = metrics.clone();
                let write_tx = write_tx.clone();

                pending.push(tokio::spawn(async move {
                    let Fragment { index, url, ds } = fragment;
                    let task_metrics = metrics.clone();
                    let result = tokio::task::spawn_blocking(move || {
                        let start = Instant::now();
                        let result = chain.apply((index, ds));
                        task_metrics.add_preprocess_time(start.elapsed());
                        result
                    })
                    .await;

                    match result {
                        Ok(Ok((index, ds))) => {
                            let _ = write_tx.send(Fragment { index, url, ds }).await;
                        }
                        Ok(Err(e)) => {
                            tracing::error!("Preprocessing {} failed: {:#}", url, e);
                            metrics.add_failure();
                        }
                        Err(e) => {
                            tracing::error!("Preprocess task for {} panicked: {}", url, e);
                            metrics.add_failure();
                        }
                    }
                }));

                while pending.len() >= concurrency {
                    let (_, _, remaining) = futures::future::select_all(pending).await;
                    pending = remaining;
                }
            }

            for handle in pending {
                let _ = handle.await;
            }
        })
    }

    /// Write stage: stores fragments into their regions of the target.
    fn spawn_write_stage(
        &self,
        writer: Arc<ZarrWriter>,
        mut write_rx: mpsc::Receiver<Fragment>,
    ) -> tokio::task::JoinHandle<()> {
        let metrics = self.metrics.clone();
        let concurrency = self.config.write_concurrency.max(1);

        tokio::spawn(async move {
            let mut pending = Vec::new();

            while let Some(fragment) = write_rx.recv().await {
                let writer = writer.clone();
                let metrics = metrics.clone();

                pending.push(tokio::spawn(async move {
                    match writer.store_fragment(&fragment.index, &fragment.ds).await {
                        Ok(variables) => {
                            tracing::debug!("Wrote {} variables of {}", variables, fragment.url);
                            metrics.add_fragment_written();
                        }
                        Err(e) => {
                            tracing::error!("Writing {} failed: {:#}", fragment.url, e);
                            metrics.add_failure();
                        }
                    }
                }));

                while pending.len() >= concurrency {
                    let (_, _, remaining) = futures::future::select_all(pending).await;
                    pending = remaining;
                }
            }

            for handle in pending {
                let _ = handle.await;
            }
        })
    }
}

/// Outcome of a recipe run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecipeStats {
    pub total: usize,
    pub written: usize,
    pub failed: usize,
}

impl std::fmt::Display for RecipeStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Written: {}, Failed: {}, Total: {}",
            self.written, self.failed, self.total
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::fixtures::narr_fragment;
    use crate::io::inspect_store;
    use crate::io::opener::memory::MemoryOpener;
    use crate::patterns::{ConcatDim, UrlTemplate};
    use crate::transform::PromoteToCoordinate;
    use object_store::local::LocalFileSystem;
    use tempfile::TempDir;

    fn pattern(keys: &[&str]) -> FilePattern {
        FilePattern::from_template(
            UrlTemplate::new("memory://air.{time}.nc"),
            vec![ConcatDim::new("time", keys.iter().map(|k| k.to_string()).collect()).into()],
        )
    }

    fn opener(pattern: &FilePattern) -> MemoryOpener {
        let mut opener = MemoryOpener::new();
        for (i, (_, url)) in pattern.items().into_iter().enumerate() {
            opener.insert(url, narr_fragment(i));
        }
        opener
    }

    fn promote_chain() -> PreprocessChain {
        let mut chain = PreprocessChain::new();
        chain.push(Arc::new(PromoteToCoordinate::new(["Lambert_Conformal"])));
        chain
    }

    fn fast_retry(max_retries: usize) -> StageConfig {
        StageConfig {
            retry: RetryConfig {
                max_retries,
                initial_backoff_ms: 1,
                max_backoff_ms: 2,
            },
            ..StageConfig::default()
        }
    }

    fn target(dir: &TempDir) -> ZarrTarget {
        let store: Arc<dyn ObjectStore> = Arc::new(LocalFileSystem::new_with_prefix(dir.path()).unwrap());
        ZarrTarget::new(store, "narr-air.zarr").with_target_chunks(BTreeMap::from([("time".to_string(), 1)]))
    }

    fn chunk_shape(dir: &TempDir, array: &str) -> serde_json::Value {
        let path = dir.path().join("narr-air.zarr").join(array).join("zarr.json");
        let metadata: serde_json::Value = serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap();
        metadata["chunk_grid"]["configuration"]["chunk_shape"].clone()
    }

    #[tokio::test]
    async fn test_single_input_is_chunked_by_time() {
        let dir = TempDir::new().unwrap();
        let pattern = pattern(&["197901"]);
        let opener = Arc::new(opener(&pattern));

        let stats = Recipe::new(pattern)
            .open_with(opener)
            .preprocess(promote_chain())
            .store_to_zarr(target(&dir))
            .run()
            .await
            .unwrap();

        assert_eq!(stats, RecipeStats { total: 1, written: 1, failed: 0 });
        assert_eq!(chunk_shape(&dir, "air"), serde_json::json!([1, 3, 4]));
        assert_eq!(chunk_shape(&dir, "time"), serde_json::json!([1]));
    }

    #[tokio::test]
    async fn test_recipe_end_to_end() {
        let dir = TempDir::new().unwrap();
        let pattern = pattern(&["197901", "197902", "197903"]);
        let opener = Arc::new(opener(&pattern));

        let recipe = Recipe::new(pattern)
            .open_with(opener.clone())
            .preprocess(promote_chain())
            .store_to_zarr(target(&dir));
        let stats = recipe.run().await.unwrap();
        assert_eq!(stats.written, 3);
        assert_eq!(opener.opens.load(Ordering::SeqCst), 3);

        let snapshot = recipe.metrics().snapshot();
        assert_eq!(snapshot.fragments_opened, 3);
        assert_eq!(snapshot.fragments_written, 3);
        // y, x and the promoted Lambert_Conformal are written by the first fragment only.
        assert_eq!(snapshot.variables_skipped, 6);

        let store: Arc<dyn ObjectStore> = Arc::new(LocalFileSystem::new_with_prefix(dir.path()).unwrap());
        let arrays = inspect_store(store, "narr-air.zarr").await.unwrap();
        let air = arrays.iter().find(|a| a.name == "air").unwrap();
        assert_eq!(air.shape, vec![3, 3, 4]);
        assert_eq!(air.chunk_shape[0], 1);

        let group: serde_json::Value =
            serde_json::from_slice(&std::fs::read(dir.path().join("narr-air.zarr").join("zarr.json")).unwrap())
                .unwrap();
        let coords = group["attributes"]["coordinates"].as_array().unwrap();
        assert!(coords.contains(&serde_json::json!("Lambert_Conformal")));
    }

    #[tokio::test]
    async fn test_misaligned_chunks_fail_before_opening() {
        let dir = TempDir::new().unwrap();
        let previous = dir.path().join("narr-air.zarr").join("zarr.json");
        std::fs::create_dir_all(previous.parent().unwrap()).unwrap();
        std::fs::write(&previous, b"{}").unwrap();

        let pattern = pattern(&["197901", "197902"]);
        let opener = Arc::new(opener(&pattern));
        let target = target(&dir).with_target_chunks(BTreeMap::from([("time".to_string(), 2)]));

        let err = Recipe::new(pattern)
            .open_with(opener.clone())
            .store_to_zarr(target)
            .run()
            .await
            .unwrap_err();

        assert!(err.to_string().contains("does not align with chunk size 2"), "{}", err);
        assert_eq!(opener.opens.load(Ordering::SeqCst), 0);
        assert!(previous.exists());
    }

    #[tokio::test]
    async fn test_open_retries_transient_failures() {
        let dir = TempDir::new().unwrap();
        let pattern = pattern(&["197901", "197902"]);
        let opener = opener(&pattern);
        opener.fail_times("memory://air.197902.nc", 2);
        let opener = Arc::new(opener);

        let recipe = Recipe::new(pattern)
            .open_with(opener.clone())
            .store_to_zarr(target(&dir))
            .with_config(fast_retry(3));
        let stats = recipe.run().await.unwrap();

        assert_eq!(stats.written, 2);
        assert_eq!(recipe.metrics().snapshot().retries, 2);
        assert_eq!(opener.opens.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_exhausted_retries_fail_the_run() {
        let dir = TempDir::new().unwrap();
        let pattern = pattern(&["197901", "197902"]);
        let opener = opener(&pattern);
        opener.fail_times("memory://air.197901.nc", 5);

        let recipe = Recipe::new(pattern)
            .open_with(Arc::new(opener))
            .store_to_zarr(target(&dir))
            .with_config(fast_retry(2));
        let err = recipe.run().await.unwrap_err();
        assert!(err.to_string().contains("Failed: 1"), "{}", err);

        let snapshot = recipe.metrics().snapshot();
        assert_eq!(snapshot.failures, 1);
        assert_eq!(snapshot.fragments_written, 1);
    }

    #[tokio::test]
    async fn test_not_found_is_not_retried() {
        let dir = TempDir::new().unwrap();
        let pattern = pattern(&["197901", "197902"]);
        let opener = opener(&pattern);
        opener.not_found("memory://air.197902.nc");
        let opener = Arc::new(opener);

        let recipe = Recipe::new(pattern)
            .open_with(opener.clone())
            .store_to_zarr(target(&dir))
            .with_config(fast_retry(3));
        let err = recipe.run().await.unwrap_err();
        assert!(err.to_string().contains("Failed: 1"), "{}", err);

        let snapshot = recipe.metrics().snapshot();
        assert_eq!(snapshot.retries, 0);
        assert_eq!(snapshot.failures, 1);
        // One open per input: the 404 is attempted once.
        assert_eq!(opener.opens.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_is_permanent() {
        let not_found = anyhow::Error::from(DapError::Status {
            url: "http://server/a.dods".into(),
            status: 404,
        })
        .context("Failed to open http://server/a");
        assert!(is_permanent(&not_found));

        let unavailable = anyhow::Error::from(DapError::Status {
            url: "http://server/a.dods".into(),
            status: 503,
        });
        assert!(!is_permanent(&unavailable));
        assert!(!is_permanent(&anyhow::anyhow!("connection reset")));
    }

    #[tokio::test]
    async fn test_missing_promoted_variable_fails_schema_pass() {
        let dir = TempDir::new().unwrap();
        let pattern = pattern(&["197901"]);
        let opener = Arc::new(opener(&pattern));
        let mut chain = PreprocessChain::new();
        chain.push(Arc::new(PromoteToCoordinate::new(["crs"])));

        let err = Recipe::new(pattern)
            .open_with(opener.clone())
            .preprocess(chain)
            .store_to_zarr(target(&dir))
            .run()
            .await
            .unwrap_err();
        assert!(format!("{:#}", err).contains("crs"), "{:#}", err);
        assert_eq!(opener.opens.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_recipe_requires_opener_and_target() {
        let dir = TempDir::new().unwrap();
        let pattern = pattern(&["197901"]);
        assert!(Recipe::new(pattern.clone()).store_to_zarr(target(&dir)).run().await.is_err());

        let opener = Arc::new(opener(&pattern));
        assert!(Recipe::new(pattern).open_with(opener).run().await.is_err());
    }

    #[test]
    fn test_stage_config_from_processing() {
        let processing = ProcessingConfig {
            concurrency: 6,
            ..ProcessingConfig::default()
        };
        let config = StageConfig::from_processing(&processing);
        assert_eq!(config.open_concurrency, 6);
        assert_eq!(config.channel_buffer, 12);
        assert_eq!(config.retry.max_retries, processing.retry.max_retries);
    }

    #[test]
    fn test_recipe_stats_display() {
        let stats = RecipeStats {
            total: 3,
            written: 2,
            failed: 1,
        };
        assert_eq!(stats.to_string(), "Written: 2, Failed: 1, Total: 3");
    }
}
