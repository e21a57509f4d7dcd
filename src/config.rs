//! Configuration for a Zarr recipe run.

use crate::io::dap::Subset;
use crate::patterns::{
    prune_pattern, CombineDim, ConcatDim, FilePattern, MergeDim, UrlTemplate, NARR_AIR_URL_TEMPLATE,
};
use crate::transform::{PreprocessChain, PromoteToCoordinate};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;

/// Main configuration for a recipe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Input configuration
    pub input: InputConfig,

    /// Per-fragment preprocessing
    #[serde(default)]
    pub preprocess: PreprocessConfig,

    /// Output configuration
    pub output: OutputConfig,

    /// Processing configuration
    #[serde(default)]
    pub processing: ProcessingConfig,
}

/// Input dataset configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputConfig {
    /// URL template; `{name}` is replaced by the key of dimension `name`
    #[serde(default = "default_url_template")]
    pub url_template: UrlTemplate,

    /// Dimension the inputs are concatenated along
    pub concat_dim: ConcatDim,

    /// Dimensions whose inputs are merged into one dataset
    #[serde(default)]
    pub merge_dims: Vec<MergeDim>,

    /// Server-side subset applied to every input
    #[serde(default)]
    pub subset: Subset,

    /// Keep only the first N keys of the concat dimension (for test runs)
    #[serde(default)]
    pub prune: Option<usize>,
}

fn default_url_template() -> UrlTemplate {
    UrlTemplate::new(NARR_AIR_URL_TEMPLATE)
}

impl InputConfig {
    /// The file pattern described by this configuration, pruned if requested.
    pub fn file_pattern(&self) -> FilePattern {
        let mut dims: Vec<CombineDim> = vec![self.concat_dim.clone().into()];
        dims.extend(self.merge_dims.iter().cloned().map(Into::into));

        let pattern = FilePattern::from_template(self.url_template.clone(), dims);
        match self.prune {
            Some(nkeep) => prune_pattern(&pattern, nkeep),
            None => pattern,
        }
    }
}

/// Preprocessing steps applied to every fragment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PreprocessConfig {
    /// Data variables to reclassify as coordinates
    #[serde(default)]
    pub promote_to_coords: Vec<String>,
}

impl PreprocessConfig {
    pub fn chain(&self) -> PreprocessChain {
        let mut chain = PreprocessChain::new();
        if !self.promote_to_coords.is_empty() {
            chain.push(Arc::new(PromoteToCoordinate::new(self.promote_to_coords.clone())));
        }
        chain
    }
}

/// Output Zarr configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Local filesystem root for output stores.
    /// Mutually exclusive with bucket/prefix.
    #[serde(default)]
    pub local_path: Option<String>,

    /// Output S3 bucket (required if local_path is not set)
    #[serde(default)]
    pub bucket: Option<String>,

    /// Output S3 path prefix (required if local_path is not set)
    #[serde(default)]
    pub prefix: Option<String>,

    /// Name of the store under the root
    #[serde(default = "default_store_name")]
    pub store_name: String,

    /// Chunk size per dimension; unlisted dimensions are a single chunk
    #[serde(default)]
    pub target_chunks: BTreeMap<String, usize>,

    /// Compression level (0-22 for zstd)
    #[serde(default = "default_compression_level")]
    pub compression_level: i32,
}

impl OutputConfig {
    pub fn is_local(&self) -> bool {
        self.local_path.is_some()
    }

    /// The target as a display string (local path or s3:// URI).
    pub fn path_display(&self) -> String {
        if let Some(path) = &self.local_path {
            format!("{}/{}", path.trim_end_matches('/'), self.store_name)
        } else {
            let prefix = self.prefix.as_deref().unwrap_or("").trim_matches('/');
            let root = if prefix.is_empty() {
                self.bucket.as_deref().unwrap_or("").to_string()
            } else {
                format!("{}/{}", self.bucket.as_deref().unwrap_or(""), prefix)
            };
            format!("s3://{}/{}", root, self.store_name)
        }
    }

    pub fn local_path(&self) -> Option<&str> {
        self.local_path.as_deref()
    }

    pub fn bucket(&self) -> Option<&str> {
        self.bucket.as_deref()
    }

    pub fn prefix(&self) -> Option<&str> {
        self.prefix.as_deref()
    }
}

/// Processing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingConfig {
    /// Number of concurrent fragment fetches
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Number of Tokio worker threads
    #[serde(default)]
    pub worker_threads: Option<usize>,

    /// Rayon thread pool size for CPU-bound decoding
    #[serde(default)]
    pub rayon_threads: Option<usize>,

    /// Enable metrics reporting
    #[serde(default = "default_true")]
    pub enable_metrics: bool,

    /// Metrics reporting interval in seconds
    #[serde(default = "default_metrics_interval")]
    pub metrics_interval_secs: u64,

    /// Optional path to save metrics JSON after the run completes
    #[serde(default)]
    pub metrics_output_path: Option<String>,

    /// Timeout for a single HTTP request in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Maximum entries in the DDS/DAS metadata cache
    #[serde(default = "default_metadata_cache_entries")]
    pub metadata_cache_entries: usize,

    /// Retry configuration for failed fetches
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            worker_threads: None,
            rayon_threads: None,
            enable_metrics: true,
            metrics_interval_secs: default_metrics_interval(),
            metrics_output_path: None,
            request_timeout_secs: default_request_timeout(),
            metadata_cache_entries: default_metadata_cache_entries(),
            retry: RetryConfig::default(),
        }
    }
}

/// Retry configuration for transient failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum attempts, the first one included
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,

    /// Initial backoff in milliseconds
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Maximum backoff in milliseconds
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl Config {
    /// Load configuration from a YAML or JSON file.
    /// Format is auto-detected from file extension (.yaml, .yml, or .json).
    pub fn from_file(path: &PathBuf) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        let config: Config = match ext {
            "json" => serde_json::from_str(&contents)?,
            // YAML is a superset of JSON
            _ => serde_yaml::from_str(&contents)?,
        };
        Ok(config)
    }

    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn to_yaml(&self) -> anyhow::Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// The NARR monthly air temperature recipe.
    pub fn example() -> Self {
        Self {
            input: InputConfig {
                url_template: default_url_template(),
                concat_dim: ConcatDim::new("time", vec!["197901".to_string(), "197902".to_string()]),
                merge_dims: Vec::new(),
                subset: Subset::new(),
                prune: None,
            },
            preprocess: PreprocessConfig {
                promote_to_coords: vec!["Lambert_Conformal".to_string()],
            },
            output: OutputConfig {
                local_path: Some("./output".to_string()),
                bucket: None,
                prefix: None,
                store_name: "narr-air.zarr".to_string(),
                target_chunks: BTreeMap::from([("time".to_string(), 1)]),
                compression_level: default_compression_level(),
            },
            processing: ProcessingConfig::default(),
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        match (&self.output.local_path, &self.output.bucket, &self.output.prefix) {
            (Some(_), Some(_), _) | (Some(_), _, Some(_)) => {
                anyhow::bail!("Cannot specify both local_path and bucket/prefix");
            }
            (None, None, _) | (None, _, None) => {
                anyhow::bail!("Must specify either local_path or both bucket and prefix");
            }
            _ => {}
        }
        if self.output.store_name.trim_matches('/').is_empty() {
            anyhow::bail!("store_name must not be empty");
        }

        if self.input.url_template.as_str().is_empty() {
            anyhow::bail!("url_template must not be empty");
        }
        if self.input.concat_dim.keys.is_empty() {
            anyhow::bail!("Concat dimension {:?} has no keys", self.input.concat_dim.name);
        }
        if self.input.concat_dim.nitems_per_file == Some(0) {
            anyhow::bail!("nitems_per_file must be > 0");
        }

        let mut names = BTreeSet::from([self.input.concat_dim.name.as_str()]);
        for merge in &self.input.merge_dims {
            if merge.keys.is_empty() {
                anyhow::bail!("Merge dimension {:?} has no keys", merge.name);
            }
            if !names.insert(merge.name.as_str()) {
                anyhow::bail!("Dimension {:?} is declared more than once", merge.name);
            }
        }
        for name in self.input.url_template.placeholders() {
            if !names.contains(name) {
                anyhow::bail!("url_template uses {{{}}}, which is not a declared dimension", name);
            }
        }

        for (dim, slice) in &self.input.subset {
            if slice.step == 0 {
                anyhow::bail!("Subset step for {:?} must be > 0", dim);
            }
            if let Some(stop) = slice.stop {
                if slice.start > stop {
                    anyhow::bail!("Subset start for {:?} must be <= stop", dim);
                }
            }
        }
        if self.input.prune == Some(0) {
            anyhow::bail!("prune must be > 0");
        }

        if let Some((dim, _)) = self.output.target_chunks.iter().find(|(_, &size)| size == 0) {
            anyhow::bail!("Target chunk size for {:?} must be > 0", dim);
        }
        if self.processing.concurrency == 0 {
            anyhow::bail!("Concurrency must be > 0");
        }
        if self.processing.retry.max_retries == 0 {
            anyhow::bail!("max_retries must be > 0");
        }
        if self.output.compression_level < 0 || self.output.compression_level > 22 {
            anyhow::bail!("Compression level must be 0-22 for zstd");
        }
        Ok(())
    }
}

// Default value functions for serde
fn default_store_name() -> String { "output.zarr".to_string() }
fn default_concurrency() -> usize { 4 }
fn default_true() -> bool { true }
fn default_metrics_interval() -> u64 { 10 }
fn default_request_timeout() -> u64 { 300 }
fn default_metadata_cache_entries() -> usize { 1024 }
fn default_max_retries() -> usize { 3 }
fn default_initial_backoff_ms() -> u64 { 500 }
fn default_max_backoff_ms() -> u64 { 30_000 }
fn default_compression_level() -> i32 { 3 }
