//! Object store configuration for the Zarr output (S3 or local filesystem).

use crate::config::OutputConfig;
use anyhow::{Context, Result};
use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::{ClientOptions, ObjectStore, RetryConfig};
use std::sync::Arc;
use std::time::Duration;

/// Parse an S3 URI into bucket and key components.
///
/// Accepts URIs in the format `s3://bucket/key/path`.
pub fn parse_s3_uri(uri: &str) -> Result<(&str, &str)> {
    let without_scheme = uri
        .strip_prefix("s3://")
        .with_context(|| format!("Invalid S3 URI: expected 's3://' prefix in '{}'", uri))?;

    without_scheme
        .split_once('/')
        .with_context(|| format!("Invalid S3 URI: expected 's3://bucket/key' format in '{}'", uri))
}

fn create_client_options() -> ClientOptions {
    ClientOptions::new()
        .with_connect_timeout(Duration::from_secs(5))
        .with_timeout(Duration::from_secs(60))
        .with_pool_idle_timeout(Duration::from_secs(90))
        .with_pool_max_idle_per_host(64)
}

/// Retry 429 and 5xx responses with exponential backoff.
fn create_retry_config() -> RetryConfig {
    RetryConfig {
        max_retries: 5,
        backoff: object_store::BackoffConfig {
            init_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            base: 2.0,
        },
        retry_timeout: Duration::from_secs(120),
    }
}

/// Create an authenticated S3 client.
///
/// Credentials and region are loaded from the environment
/// (AWS_ACCESS_KEY_ID, AWS_SECRET_ACCESS_KEY, AWS_REGION), AWS config files
/// or the instance profile.
fn create_s3_store(bucket: &str) -> Result<Arc<dyn ObjectStore>> {
    tracing::info!("Creating S3 client for bucket: {}", bucket);

    let builder = AmazonS3Builder::from_env()
        .with_bucket_name(bucket)
        .with_client_options(create_client_options())
        .with_retry(create_retry_config());

    Ok(Arc::new(builder.build()?))
}

fn create_local_store(root: &str) -> Result<Arc<dyn ObjectStore>> {
    let path = std::path::Path::new(root);
    if !path.exists() {
        std::fs::create_dir_all(path).with_context(|| format!("Failed to create {}", path.display()))?;
    }
    tracing::info!("Creating LocalFileSystem store at: {}", path.display());
    Ok(Arc::new(LocalFileSystem::new_with_prefix(path)?))
}

/// Create the store the Zarr output is written to: a local directory when
/// `local_path` is set, otherwise the S3 bucket.
pub fn create_output_store(output: &OutputConfig) -> Result<Arc<dyn ObjectStore>> {
    match (output.local_path(), output.bucket()) {
        (Some(local_path), _) => create_local_store(local_path),
        (_, Some(bucket)) => create_s3_store(bucket),
        _ => anyhow::bail!("Invalid config: no output destination"),
    }
}

/// Path of the Zarr store inside the output store: the S3 prefix (if any)
/// joined with `store_name`. Local roots are baked into the store itself.
pub fn output_target(output: &OutputConfig) -> String {
    let prefix = if output.is_local() { None } else { output.prefix() };
    match prefix.map(|p| p.trim_matches('/')).filter(|p| !p.is_empty()) {
        Some(prefix) => format!("{}/{}", prefix, output.store_name.trim_matches('/')),
        None => output.store_name.trim_matches('/').to_string(),
    }
}

/// Open an existing store from a local path or `s3://bucket/key` URI.
///
/// Returns the store and the Zarr path inside it.
pub fn open_store_uri(uri: &str) -> Result<(Arc<dyn ObjectStore>, String)> {
    if uri.starts_with("s3://") {
        let (bucket, key) = parse_s3_uri(uri)?;
        return Ok((create_s3_store(bucket)?, key.trim_matches('/').to_string()));
    }

    let path = std::path::Path::new(uri);
    if !path.exists() {
        anyhow::bail!("Store {} does not exist", path.display());
    }
    Ok((Arc::new(LocalFileSystem::new_with_prefix(path)?), String::new()))
}
