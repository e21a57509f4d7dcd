//! Async Zarr writing using zarrs.

use crate::dataset::{attributes_to_json, with_array, Attributes, DataType, Dataset, VariableData};
use crate::patterns::Index;
use crate::pipeline::Metrics;
use crate::transform::DatasetSchema;
use anyhow::{bail, Context, Result};
use futures::StreamExt;
use object_store::{ObjectStore, ObjectStoreExt};
use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::Arc;
use std::time::Instant;
use zarrs::array::codec::ZstdCodec;
use zarrs::array::{Array, ArrayBuilder, ArraySubset, FillValue};
use zarrs::group::GroupBuilder;
use zarrs_object_store::AsyncObjectStore;

type ZarrArray = Array<AsyncObjectStore<Arc<dyn ObjectStore>>>;

/// One output array and the layout it was created with.
struct TargetArray {
    array: ZarrArray,
    dims: Vec<String>,
    data_type: DataType,
    shape: Vec<u64>,
    chunks: Vec<u64>,
}

/// Writes dataset fragments into a Zarr v3 hierarchy: one group holding one
/// array per variable.
///
/// Fragments land in disjoint, chunk-aligned regions, so concurrent
/// `store_fragment` calls never touch the same chunk.
pub struct ZarrWriter {
    path: String,
    arrays: BTreeMap<String, TargetArray>,
    metrics: Option<Arc<Metrics>>,
}

/// Node path of `name` under the hierarchy rooted at `path`.
fn node_path(path: &str, name: &str) -> String {
    let path = path.trim_matches('/');
    match (path.is_empty(), name.is_empty()) {
        (true, true) => "/".to_string(),
        (true, false) => format!("/{}", name),
        (false, true) => format!("/{}", path),
        (false, false) => format!("/{}/{}", path, name),
    }
}

/// Remove every object under `path`, so a rerun starts from an empty target.
async fn clear_prefix(store: &Arc<dyn ObjectStore>, path: &str) -> Result<()> {
    let prefix = object_store::path::Path::from(path.trim_matches('/'));
    let prefix = if path.trim_matches('/').is_empty() { None } else { Some(&prefix) };

    let existing: Vec<_> = store.list(prefix).collect::<Vec<_>>().await;
    if existing.is_empty() {
        return Ok(());
    }

    tracing::info!("Deleting {} existing objects under {:?}", existing.len(), path);
    let deleted: Vec<_> = futures::stream::iter(existing)
        .filter_map(|result| async move { result.ok() })
        .map(|meta| async move {
            store.delete(&meta.location).await.map_err(|e| {
                tracing::warn!("Failed to delete {:?}: {}", meta.location, e);
                e
            })
        })
        .buffer_unordered(64)
        .collect()
        .await;

    let failed = deleted.iter().filter(|r| r.is_err()).count();
    if failed > 0 {
        bail!("Failed to delete {} existing objects under {:?}", failed, path);
    }
    tracing::debug!("Deleted {} objects", deleted.len());
    Ok(())
}

/// Fill value for a variable, from `_FillValue` or `missing_value` when set.
///
/// Otherwise NaN for floats, zero for integers and the empty string.
fn fill_value(data_type: DataType, attrs: &Attributes) -> FillValue {
    let declared = attrs
        .get("_FillValue")
        .or_else(|| attrs.get("missing_value"));
    let number = declared.and_then(|v| v.as_f64());

    match data_type {
        DataType::UInt8 => FillValue::from(number.unwrap_or(0.0) as u8),
        DataType::Int16 => FillValue::from(number.unwrap_or(0.0) as i16),
        DataType::UInt16 => FillValue::from(number.unwrap_or(0.0) as u16),
        DataType::Int32 => FillValue::from(number.unwrap_or(0.0) as i32),
        DataType::UInt32 => FillValue::from(number.unwrap_or(0.0) as u32),
        DataType::Float32 => FillValue::from(number.map(|v| v as f32).unwrap_or(f32::NAN)),
        DataType::Float64 => FillValue::from(number.unwrap_or(f64::NAN)),
        DataType::String => FillValue::from(declared.and_then(|v| v.as_str()).unwrap_or("")),
    }
}

/// Check that `region` covers whole chunks of an array.
///
/// Each range must start on a chunk boundary and stop on one, or at the end
/// of the array.
pub fn check_alignment(name: &str, region: &[Range<u64>], chunks: &[u64], shape: &[u64]) -> Result<()> {
    let aligned = region
        .iter()
        .zip(chunks)
        .zip(shape)
        .all(|((range, &chunk), &len)| {
            chunk > 0 && range.start % chunk == 0 && (range.end % chunk == 0 || range.end == len)
        });

    if !aligned {
        bail!(
            "Region {:?} of {:?} does not align with Zarr chunks {:?} (array shape {:?})",
            region,
            name,
            chunks,
            shape
        );
    }
    Ok(())
}

impl ZarrWriter {
    /// Create the Zarr hierarchy for `schema` at `path`, replacing anything
    /// already stored there.
    pub async fn create(
        store: Arc<dyn ObjectStore>,
        path: &str,
        schema: &DatasetSchema,
        chunks: &BTreeMap<String, Vec<u64>>,
        compression_level: i32,
        metrics: Option<Arc<Metrics>>,
    ) -> Result<Self> {
        clear_prefix(&store, path).await?;

        let zarr_store = Arc::new(AsyncObjectStore::new(store.clone()));

        let mut group_attrs = attributes_to_json(&schema.attrs);
        group_attrs.insert(
            "coordinates".to_string(),
            serde_json::json!(schema.coord_names()),
        );
        let mut group_builder = GroupBuilder::new();
        group_builder.attributes(group_attrs);
        let group = group_builder.build(zarr_store.clone(), &node_path(path, ""))?;
        group.async_store_metadata().await?;

        let mut arrays = BTreeMap::new();
        for (name, var) in &schema.variables {
            let shape: Vec<u64> = var.shape.iter().map(|&n| n as u64).collect();
            let chunk_shape = chunks
                .get(name)
                .cloned()
                .with_context(|| format!("No chunk shape determined for {:?}", name))?;

            let mut builder = ArrayBuilder::new(
                shape.clone(),
                chunk_shape.clone(),
                var.data_type.zarr_name(),
                fill_value(var.data_type, &var.attrs),
            );
            builder.dimension_names(Some(var.dims.iter().cloned().map(Some).collect::<Vec<_>>()));
            builder.bytes_to_bytes_codecs(vec![Arc::new(ZstdCodec::new(compression_level, false))]);
            builder.attributes(attributes_to_json(&var.attrs));

            let array_path = node_path(path, name);
            let array = builder
                .build(zarr_store.clone(), &array_path)
                .with_context(|| format!("Failed to build array {}", array_path))?;
            array.async_store_metadata().await?;

            tracing::debug!(
                "Created array {} {} shape={:?} chunks={:?}",
                array_path,
                var.data_type,
                shape,
                chunk_shape
            );

            arrays.insert(
                name.clone(),
                TargetArray {
                    array,
                    dims: var.dims.clone(),
                    data_type: var.data_type,
                    shape,
                    chunks: chunk_shape,
                },
            );
        }

        tracing::info!(
            "Created Zarr group at {} with {} arrays",
            node_path(path, ""),
            arrays.len()
        );

        Ok(Self {
            path: path.to_string(),
            arrays,
            metrics,
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Region of the target array that a fragment variable occupies.
    ///
    /// `index` must carry element offsets (see `CombinedSchema::index_to_offsets`).
    fn region(&self, name: &str, target: &TargetArray, index: &Index, shape: &[usize]) -> Result<Vec<Range<u64>>> {
        target
            .dims
            .iter()
            .zip(shape)
            .zip(&target.shape)
            .map(|((dim, &len), &full)| {
                let len = len as u64;
                let range = match index.concat_position(dim) {
                    Some(position) if !position.indexed => {
                        bail!("Index {} has no element offset for {:?}", index, dim)
                    }
                    Some(position) => position.value as u64..position.value as u64 + len,
                    None => 0..len,
                };
                if range.end > full || (index.concat_position(dim).is_none() && len != full) {
                    bail!(
                        "Fragment {} variable {:?} spans {:?} along {:?}, outside 0..{}",
                        index,
                        name,
                        range,
                        dim,
                        full
                    );
                }
                Ok(range)
            })
            .collect()
    }

    /// Write one indexed fragment into its region of the target arrays.
    ///
    /// Coordinates are written by the first fragment along every merge
    /// dimension only, and only if they vary along a concat dimension or the
    /// fragment is the very first one. Data variables are always written.
    /// Returns the number of variables written.
    pub async fn store_fragment(&self, index: &Index, ds: &Dataset) -> Result<usize> {
        let start = Instant::now();
        let first_in_merge_dims = index.is_first_in_merge_dims();
        let first_item = index.is_first_item();

        let mut written = 0;
        let mut skipped = 0;
        let mut bytes = 0;

        for (name, var) in ds.variables() {
            let target = self
                .arrays
                .get(name)
                .with_context(|| format!("Fragment {} has variable {:?}, which is not in the target", index, name))?;

            if ds.is_coord(name) {
                let spans_concat = var.dims.iter().any(|d| index.concat_position(d).is_some());
                if !first_in_merge_dims || !(spans_concat || first_item) {
                    skipped += 1;
                    continue;
                }
            }

            if var.dims != target.dims {
                bail!(
                    "Variable {:?} has dimensions {:?} in fragment {} but {:?} in the target",
                    name,
                    var.dims,
                    index,
                    target.dims
                );
            }
            if var.data_type() != target.data_type {
                bail!(
                    "Variable {:?} is {} in fragment {} but {} in the target",
                    name,
                    var.data_type(),
                    index,
                    target.data_type
                );
            }

            let region = self.region(name, target, index, var.shape())?;
            check_alignment(name, &region, &target.chunks, &target.shape)?;

            let subset = ArraySubset::new_with_ranges(&region);
            with_array!(&var.data, a => {
                let values: Vec<_> = a.iter().cloned().collect();
                target.array.async_store_array_subset(&subset, values).await
            })
            .with_context(|| format!("Failed to write {:?} region {:?}", name, region))?;

            tracing::debug!("Wrote {} {:?} for {}", name, region, index);
            bytes += var.data.nbytes() as u64;
            written += 1;
        }

        if let Some(ref m) = self.metrics {
            m.add_bytes_written(bytes);
            m.add_variables_skipped(skipped);
            m.add_zarr_write_time(start.elapsed());
        }
        Ok(written)
    }

    /// Log completion. Metadata is complete from `create`, so there is
    /// nothing left to flush.
    pub fn finalize(&self) -> Result<()> {
        tracing::info!("Zarr store {} finalized", node_path(&self.path, ""));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::AttrValue;

    #[test]
    fn test_node_path() {
        assert_eq!(node_path("", ""), "/");
        assert_eq!(node_path("", "air"), "/air");
        assert_eq!(node_path("narr.zarr", ""), "/narr.zarr");
        assert_eq!(node_path("out/narr.zarr/", "air"), "/out/narr.zarr/air");
    }

    #[test]
    fn test_alignment() {
        // time chunked by 1, full y/x
        assert!(check_alignment("air", &[3..4, 0..3, 0..4], &[1, 3, 4], &[10, 3, 4]).is_ok());
        // last partial chunk ends at the array end
        assert!(check_alignment("air", &[8..10], &[4], &[10]).is_ok());

        let err = check_alignment("air", &[2..4], &[4], &[10]).unwrap_err();
        assert!(err.to_string().contains("does not align with Zarr chunks"));
        assert!(check_alignment("air", &[0..2], &[4], &[10]).is_err());
    }

    #[test]
    fn test_fill_value() {
        let attrs = Attributes::from([("_FillValue".to_string(), AttrValue::float(-9.96921e36))]);
        assert_eq!(
            fill_value(DataType::Float32, &attrs),
            FillValue::from(-9.96921e36f64 as f32)
        );

        let attrs = Attributes::from([("missing_value".to_string(), AttrValue::int(-32767))]);
        assert_eq!(fill_value(DataType::Int16, &attrs), FillValue::from(-32767i16));

        assert_eq!(fill_value(DataType::Int32, &Attributes::new()), FillValue::from(0i32));
        assert_eq!(fill_value(DataType::String, &Attributes::new()), FillValue::from(""));
    }
}
