//! Integration tests for ZarrWriter against a local filesystem store.
//!
//! Fragments are NARR-shaped single time steps combined along `time`.

use crate::dataset::fixtures::narr_fragment;
use crate::io::{inspect_store, ZarrWriter};
use crate::patterns::{ConcatDim, FilePattern, Index, UrlTemplate};
use crate::pipeline::Metrics;
use crate::transform::{determine_target_chunks, CombinedSchema, DatasetSchema, SchemaAccumulator};
use futures::stream::{self, StreamExt};
use object_store::local::LocalFileSystem;
use object_store::ObjectStore;
use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tempfile::TempDir;
use zarrs::array::{Array, ArraySubset};
use zarrs_object_store::AsyncObjectStore;

const STORE: &str = "narr-air.zarr";

fn time_pattern(steps: usize) -> FilePattern {
    let keys = (0..steps).map(|i| format!("1979{:02}", i + 1)).collect();
    FilePattern::from_template(
        UrlTemplate::new("memory://air.{time}.nc"),
        vec![ConcatDim::new("time", keys).into()],
    )
}

fn combine(pattern: &FilePattern) -> CombinedSchema {
    let mut acc = SchemaAccumulator::new();
    for (i, (index, _)) in pattern.items().into_iter().enumerate() {
        acc.add_input(&index, DatasetSchema::from_dataset(&narr_fragment(i)).unwrap())
            .unwrap();
    }
    acc.finish(pattern).unwrap()
}

fn local_store(dir: &TempDir) -> Arc<dyn ObjectStore> {
    Arc::new(LocalFileSystem::new_with_prefix(dir.path()).unwrap())
}

async fn create_writer(
    dir: &TempDir,
    combined: &CombinedSchema,
    target_chunks: &[(&str, usize)],
    metrics: Option<Arc<Metrics>>,
) -> anyhow::Result<ZarrWriter> {
    let targets: BTreeMap<String, usize> = target_chunks
        .iter()
        .map(|(d, n)| (d.to_string(), *n))
        .collect();
    let chunks = determine_target_chunks(&combined.schema, &targets)?;
    ZarrWriter::create(local_store(dir), STORE, &combined.schema, &chunks, 3, metrics).await
}

fn indexed_items(pattern: &FilePattern, combined: &CombinedSchema) -> Vec<Index> {
    pattern
        .items()
        .iter()
        .map(|(index, _)| combined.index_to_offsets(index).unwrap())
        .collect()
}

#[tokio::test]
async fn test_create_writes_group_and_array_metadata() {
    let dir = TempDir::new().unwrap();
    let pattern = time_pattern(2);
    let combined = combine(&pattern);

    let writer = create_writer(&dir, &combined, &[("time", 1)], None).await.unwrap();
    writer.finalize().unwrap();

    let root = dir.path().join(STORE);
    let group: serde_json::Value =
        serde_json::from_slice(&std::fs::read(root.join("zarr.json")).unwrap()).unwrap();
    assert_eq!(group["node_type"], "group");
    assert_eq!(group["attributes"]["Conventions"], "CF-1.2");
    assert_eq!(
        group["attributes"]["coordinates"],
        serde_json::json!(["time", "x", "y"])
    );

    let air: serde_json::Value =
        serde_json::from_slice(&std::fs::read(root.join("air").join("zarr.json")).unwrap()).unwrap();
    assert_eq!(air["shape"], serde_json::json!([2, 3, 4]));
    assert_eq!(air["chunk_grid"]["configuration"]["chunk_shape"], serde_json::json!([1, 3, 4]));
    assert_eq!(air["dimension_names"], serde_json::json!(["time", "y", "x"]));
    assert_eq!(air["attributes"]["units"], "degK");
    assert_eq!(air["fill_value"], "NaN");
}

#[tokio::test]
async fn test_inspect_store_reports_layout() {
    let dir = TempDir::new().unwrap();
    let pattern = time_pattern(3);
    let combined = combine(&pattern);
    create_writer(&dir, &combined, &[("time", 1)], None).await.unwrap();

    let arrays = inspect_store(local_store(&dir), STORE).await.unwrap();
    let names: Vec<&str> = arrays.iter().map(|a| a.name.as_str()).collect();
    assert_eq!(names, vec!["Lambert_Conformal", "air", "time", "x", "y"]);

    let air = &arrays[1];
    assert_eq!(air.shape, vec![3, 3, 4]);
    assert_eq!(air.chunk_shape, vec![1, 3, 4]);
    assert_eq!(air.data_type, "float32");
    assert_eq!(
        air.dimension_names,
        vec![Some("time".to_string()), Some("y".to_string()), Some("x".to_string())]
    );

    let scalar = &arrays[0];
    assert!(scalar.shape.is_empty());
    assert_eq!(scalar.data_type, "int32");
}

#[tokio::test]
async fn test_store_fragments_and_read_back() {
    let dir = TempDir::new().unwrap();
    let pattern = time_pattern(2);
    let combined = combine(&pattern);
    let writer = create_writer(&dir, &combined, &[("time", 1)], None).await.unwrap();

    let indices = indexed_items(&pattern, &combined);
    // y and x do not vary along time, so only the first fragment writes them.
    assert_eq!(writer.store_fragment(&indices[0], &narr_fragment(0)).await.unwrap(), 5);
    assert_eq!(writer.store_fragment(&indices[1], &narr_fragment(1)).await.unwrap(), 3);
    writer.finalize().unwrap();

    let store = Arc::new(AsyncObjectStore::new(local_store(&dir)));
    let air = Array::async_open(store.clone(), &format!("/{}/air", STORE)).await.unwrap();
    let second: Vec<f32> = air
        .async_retrieve_array_subset(&ArraySubset::new_with_ranges(&[1..2, 0..3, 0..4]))
        .await
        .unwrap();
    let expected: Vec<f32> = (0..12).map(|i| (100 + i) as f32).collect();
    assert_eq!(second, expected);

    let time = Array::async_open(store.clone(), &format!("/{}/time", STORE)).await.unwrap();
    let values: Vec<f64> = time
        .async_retrieve_array_subset(&ArraySubset::new_with_ranges(&[0..2]))
        .await
        .unwrap();
    assert_eq!(values, vec![0.0, 3.0]);

    let x = Array::async_open(store, &format!("/{}/x", STORE)).await.unwrap();
    let values: Vec<f32> = x
        .async_retrieve_array_subset(&ArraySubset::new_with_ranges(&[0..4]))
        .await
        .unwrap();
    assert_eq!(values, vec![0.0, 32.0, 64.0, 96.0]);
}

#[tokio::test]
async fn test_concurrent_fragment_writes() {
    let dir = TempDir::new().unwrap();
    let pattern = time_pattern(6);
    let combined = combine(&pattern);
    let metrics = Metrics::new();
    let writer = Arc::new(
        create_writer(&dir, &combined, &[("time", 2)], Some(metrics.clone()))
            .await
            .unwrap(),
    );

    // Pairs of steps share a chunk; write each pair as one two-step fragment.
    let results: Vec<_> = stream::iter(indexed_items(&pattern, &combined).into_iter().step_by(2).enumerate())
        .map(|(pair, index)| {
            let writer = writer.clone();
            async move {
                let mut ds = narr_fragment(pair * 2);
                let next = narr_fragment(pair * 2 + 1);
                for name in ["time", "air"] {
                    let (a, b) = (ds.variable(name).unwrap(), next.variable(name).unwrap());
                    let joined = match (&a.data, &b.data) {
                        (crate::dataset::VariableData::Float64(a), crate::dataset::VariableData::Float64(b)) => {
                            ndarray::concatenate(ndarray::Axis(0), &[a.view(), b.view()]).unwrap().into()
                        }
                        (crate::dataset::VariableData::Float32(a), crate::dataset::VariableData::Float32(b)) => {
                            ndarray::concatenate(ndarray::Axis(0), &[a.view(), b.view()]).unwrap().into()
                        }
                        _ => unreachable!(),
                    };
                    let var = crate::dataset::Variable::new(a.dims.clone(), joined).unwrap();
                    let is_coord = ds.is_coord(name);
                    if is_coord {
                        ds.insert_coord(name, var);
                    } else {
                        ds.insert_variable(name, var);
                    }
                }
                writer.store_fragment(&index, &ds).await
            }
        })
        .buffer_unordered(3)
        .collect()
        .await;

    for result in &results {
        assert!(result.is_ok(), "{:?}", result);
    }
    assert_eq!(metrics.variables_skipped.load(Ordering::Relaxed), 4);
    assert!(metrics.bytes_written.load(Ordering::Relaxed) > 0);

    let store = Arc::new(AsyncObjectStore::new(local_store(&dir)));
    let time = Array::async_open(store, &format!("/{}/time", STORE)).await.unwrap();
    let values: Vec<f64> = time
        .async_retrieve_array_subset(&ArraySubset::new_with_ranges(&[0..6]))
        .await
        .unwrap();
    assert_eq!(values, vec![0.0, 3.0, 6.0, 9.0, 12.0, 15.0]);
}

#[tokio::test]
async fn test_misaligned_fragment_is_rejected() {
    let dir = TempDir::new().unwrap();
    let pattern = time_pattern(2);
    let combined = combine(&pattern);
    // One step per fragment cannot fill a chunk of two.
    let writer = create_writer(&dir, &combined, &[("time", 2)], None).await.unwrap();

    let indices = indexed_items(&pattern, &combined);
    let err = writer
        .store_fragment(&indices[0], &narr_fragment(0))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("does not align with Zarr chunks"), "{}", err);
}

#[tokio::test]
async fn test_unknown_variable_is_rejected() {
    let dir = TempDir::new().unwrap();
    let pattern = time_pattern(1);
    let combined = combine(&pattern);
    let writer = create_writer(&dir, &combined, &[], None).await.unwrap();

    let mut ds = narr_fragment(0);
    ds.insert_variable("extra", ds.variable("x").unwrap().clone());
    let indices = indexed_items(&pattern, &combined);
    assert!(writer.store_fragment(&indices[0], &ds).await.is_err());
}

#[tokio::test]
async fn test_create_replaces_existing_store() {
    let dir = TempDir::new().unwrap();
    let stale = dir.path().join(STORE).join("stale").join("zarr.json");
    std::fs::create_dir_all(stale.parent().unwrap()).unwrap();
    std::fs::write(&stale, b"{}").unwrap();
    let sibling = dir.path().join("other.txt");
    std::fs::write(&sibling, b"keep").unwrap();

    let pattern = time_pattern(1);
    create_writer(&dir, &combine(&pattern), &[("time", 1)], None)
        .await
        .unwrap();

    assert!(!stale.exists());
    assert!(sibling.exists());
    assert!(dir.path().join(STORE).join("air").join("zarr.json").exists());
}
