//! HTTP reader for DAP2 servers.

use super::constraint::{build_constraint, subset_shape, Subset};
use super::das::parse_das;
use super::dds::parse_dds;
use super::metadata_cache::{DapMetadata, MetadataCache};
use super::xdr::{decode_values, split_dods};
use super::DapError;
use crate::config::ProcessingConfig;
use crate::dataset::{Dataset, Variable};
use crate::io::DatasetOpener;
use crate::pipeline::Metrics;
use crate::transform::{DatasetSchema, VariableSchema};
use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Reads DAP2 datasets over HTTP.
///
/// Metadata (`.dds` and `.das`) is cached per dataset URL; data (`.dods`)
/// is fetched per request with the subset applied server-side.
pub struct DapReader {
    client: reqwest::Client,
    cache: MetadataCache,
    metrics: Option<Arc<Metrics>>,
}

impl DapReader {
    pub fn new(config: &ProcessingConfig, metrics: Option<Arc<Metrics>>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            cache: MetadataCache::new(config.metadata_cache_entries, metrics.clone()),
            metrics,
        })
    }

    /// Parsed DDS and DAS of a dataset.
    pub async fn metadata(&self, url: &str) -> Result<Arc<DapMetadata>> {
        self.cache
            .get_or_load(url, || async {
                let dds_url = format!("{}.dds", url);
                let das_url = format!("{}.das", url);
                let (dds, das) = tokio::try_join!(self.get_text(&dds_url), self.get_text(&das_url))?;
                Ok(DapMetadata {
                    dds: parse_dds(&dds).with_context(|| format!("Invalid DDS from {}", dds_url))?,
                    das: parse_das(&das).with_context(|| format!("Invalid DAS from {}", das_url))?,
                })
            })
            .await
    }

    async fn get_text(&self, url: &str) -> Result<String> {
        let body = self.get(url).await?;
        let text = String::from_utf8_lossy(&body).into_owned();
        check_server_error(url, &text)?;
        Ok(text)
    }

    /// One GET. Retrying is left to the caller, which can tell transient
    /// failures apart with [`DapError::is_transient`].
    async fn get(&self, url: &str) -> Result<Bytes, DapError> {
        let request_error = |source| DapError::Request {
            url: url.to_string(),
            source,
        };

        let response = self.client.get(url).send().await.map_err(request_error)?;
        let status = response.status();
        if !status.is_success() {
            return Err(DapError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        let body = response.bytes().await.map_err(request_error)?;

        if let Some(ref m) = self.metrics {
            m.add_bytes_read(body.len() as u64);
        }
        tracing::debug!("GET {} ({} bytes)", url, body.len());
        Ok(body)
    }
}

#[async_trait]
impl DatasetOpener for DapReader {
    async fn open_schema(&self, url: &str, subset: &Subset) -> Result<DatasetSchema> {
        let metadata = self.metadata(url).await?;
        schema_from_metadata(&metadata, subset).with_context(|| format!("Failed to build schema for {}", url))
    }

    async fn open_dataset(&self, url: &str, subset: &Subset) -> Result<Dataset> {
        let metadata = self.metadata(url).await?;
        let variables = metadata.dds.variables()?;
        let constraint = build_constraint(&variables, subset)?;

        let dods_url = if constraint.is_empty() {
            format!("{}.dods", url)
        } else {
            format!("{}.dods?{}", url, encode_constraint(&constraint))
        };

        let start = Instant::now();
        let body = self.get(&dods_url).await?;
        if body.starts_with(b"Error") {
            check_server_error(&dods_url, &String::from_utf8_lossy(&body))?;
        }

        let ds = tokio::task::spawn_blocking(move || dataset_from_dods(&metadata, body))
            .await
            .context("Decode task panicked")?
            .with_context(|| format!("Failed to decode {}", dods_url))?;

        if let Some(ref m) = self.metrics {
            m.add_open_time(start.elapsed());
        }
        Ok(ds)
    }
}

/// Percent-encode the characters servlet containers reject in query strings.
fn encode_constraint(constraint: &str) -> String {
    constraint.replace('[', "%5B").replace(']', "%5D")
}

/// DAP2 servers report failures as an `Error { code = ...; message = ...; }` body.
fn check_server_error(url: &str, body: &str) -> Result<(), DapError> {
    let trimmed = body.trim_start();
    if !trimmed.starts_with("Error") {
        return Ok(());
    }
    let message = trimmed
        .split_once("message")
        .and_then(|(_, rest)| rest.split_once('"'))
        .and_then(|(_, rest)| rest.split_once("\";"))
        .map(|(msg, _)| msg.to_string())
        .unwrap_or_else(|| trimmed.chars().take(200).collect());
    Err(DapError::Server {
        url: url.to_string(),
        message,
    })
}

/// Schema of a DAP dataset after subsetting.
pub fn schema_from_metadata(metadata: &DapMetadata, subset: &Subset) -> Result<DatasetSchema> {
    let mut variables = BTreeMap::new();
    for var in metadata.dds.variables()? {
        let shape = subset_shape(&var, subset)?;
        variables.insert(
            var.name.clone(),
            VariableSchema {
                dims: var.dims,
                shape,
                data_type: var.atomic.data_type(),
                attrs: metadata.das.attributes(&var.name),
                is_coord: false,
            },
        );
    }
    Ok(DatasetSchema::from_variables(variables, metadata.das.global())?)
}

/// Assemble a dataset from a `.dods` body and the dataset's attributes.
pub fn dataset_from_dods(metadata: &DapMetadata, body: Bytes) -> Result<Dataset> {
    let (dds, data) = split_dods(body)?;
    let mut values = decode_values(&dds, data)?;

    let mut ds = Dataset::new();
    for var in dds.variables()? {
        let data = values
            .remove(&var.name)
            .with_context(|| format!("No values decoded for {:?}", var.name))?;
        let mut variable = Variable::new(var.dims, data)?;
        variable.attrs = metadata.das.attributes(&var.name);
        ds.insert_variable(var.name, variable);
    }
    ds.attrs = metadata.das.global();
    ds.infer_coords();
    Ok(ds)
}
