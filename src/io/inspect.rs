//! Read back the array metadata of a Zarr v3 store.

use anyhow::{Context, Result};
use futures::TryStreamExt;
use object_store::path::Path;
use object_store::{ObjectStore, ObjectStoreExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Layout of one array as recorded in its `zarr.json`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArrayInfo {
    /// Path relative to the store root, e.g. `air`
    pub name: String,
    pub shape: Vec<u64>,
    pub chunk_shape: Vec<u64>,
    pub data_type: String,
    pub dimension_names: Vec<Option<String>>,
}

impl fmt::Display for ArrayInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dims: Vec<&str> = self
            .dimension_names
            .iter()
            .map(|d| d.as_deref().unwrap_or("?"))
            .collect();
        write!(
            f,
            "{} ({}) {} shape={:?} chunks={:?}",
            self.name,
            dims.join(", "),
            self.data_type,
            self.shape,
            self.chunk_shape
        )
    }
}

#[derive(Deserialize)]
struct NodeMetadata {
    node_type: String,
    #[serde(default)]
    shape: Vec<u64>,
    #[serde(default)]
    data_type: serde_json::Value,
    #[serde(default)]
    chunk_grid: Option<ChunkGridMetadata>,
    #[serde(default)]
    dimension_names: Option<Vec<Option<String>>>,
}

#[derive(Deserialize)]
struct ChunkGridMetadata {
    configuration: ChunkGridConfiguration,
}

#[derive(Deserialize)]
struct ChunkGridConfiguration {
    chunk_shape: Vec<u64>,
}

/// Arrays stored under `path`, sorted by name.
pub async fn inspect_store(store: Arc<dyn ObjectStore>, path: &str) -> Result<Vec<ArrayInfo>> {
    let root = path.trim_matches('/');
    let prefix = Path::from(root);
    let listing: Vec<_> = store
        .list(if root.is_empty() { None } else { Some(&prefix) })
        .try_collect()
        .await
        .with_context(|| format!("Failed to list {:?}", path))?;

    let mut arrays = Vec::new();
    for meta in listing {
        let key = meta.location.as_ref();
        let Some(node) = key.strip_suffix("zarr.json") else {
            continue;
        };

        let bytes = store.get(&meta.location).await?.bytes().await?;
        let metadata: NodeMetadata =
            serde_json::from_slice(&bytes).with_context(|| format!("Invalid Zarr metadata in {}", key))?;
        if metadata.node_type != "array" {
            continue;
        }

        let name = node
            .strip_prefix(root)
            .unwrap_or(node)
            .trim_matches('/')
            .to_string();
        let data_type = match metadata.data_type {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        };
        let rank = metadata.shape.len();

        arrays.push(ArrayInfo {
            name,
            chunk_shape: metadata
                .chunk_grid
                .map(|g| g.configuration.chunk_shape)
                .unwrap_or_default(),
            data_type,
            dimension_names: metadata.dimension_names.unwrap_or_else(|| vec![None; rank]),
            shape: metadata.shape,
        });
    }

    arrays.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(arrays)
}
