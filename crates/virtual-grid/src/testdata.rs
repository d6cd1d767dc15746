//! Test data generation utilities.
//!
//! Helpers for writing small source files with known values, used by unit and
//! integration tests here and in downstream crates.

use std::path::Path;
use std::sync::Arc;

use zarrs::array::{ArrayBuilder, DataType, FillValue};
use zarrs::array_subset::ArraySubset;
use zarrs_filesystem::FilesystemStore;

use crate::source::write_raw;

/// Write a single-chunk float64 Zarr V3 array at `path` (node `/`).
///
/// `values` are row-major over `shape`.
pub fn write_zarr_source(
    path: &Path,
    shape: &[usize],
    values: &[f64],
) -> Result<(), Box<dyn std::error::Error>> {
    std::fs::create_dir_all(path)?;
    let store = Arc::new(FilesystemStore::new(path)?);

    let array_shape: Vec<u64> = shape.iter().map(|&n| n as u64).collect();
    let chunk_shape: Vec<u64> = shape.iter().map(|&n| n.max(1) as u64).collect();

    let array = ArrayBuilder::new(
        array_shape.clone(),
        DataType::Float64,
        chunk_shape.try_into()?,
        FillValue::from(f64::NAN),
    )
    .build(store.clone(), "/")?;

    array.store_metadata()?;

    let subset = ArraySubset::new_with_start_shape(vec![0; shape.len()], array_shape)?;
    array.store_array_subset_elements(&subset, values)?;

    Ok(())
}

/// Write a float32 Zarr V3 array, chunked along the first axis.
pub fn write_zarr_source_f32(
    path: &Path,
    shape: &[usize],
    values: &[f32],
    leading_chunk: usize,
) -> Result<(), Box<dyn std::error::Error>> {
    std::fs::create_dir_all(path)?;
    let store = Arc::new(FilesystemStore::new(path)?);

    let array_shape: Vec<u64> = shape.iter().map(|&n| n as u64).collect();
    let chunk_shape: Vec<u64> = shape
        .iter()
        .enumerate()
        .map(|(axis, &n)| (if axis == 0 { leading_chunk.max(1) } else { n.max(1) }) as u64)
        .collect();

    let array = ArrayBuilder::new(
        array_shape.clone(),
        DataType::Float32,
        chunk_shape.try_into()?,
        FillValue::from(f32::NAN),
    )
    .build(store.clone(), "/")?;

    array.store_metadata()?;

    let subset = ArraySubset::new_with_start_shape(vec![0; shape.len()], array_shape)?;
    array.store_array_subset_elements(&subset, values)?;

    Ok(())
}

/// Write a raw float32 source file.
pub fn write_raw_source(path: &Path, values: &[f64]) -> Result<(), Box<dyn std::error::Error>> {
    let values: Vec<f32> = values.iter().map(|&v| v as f32).collect();
    write_raw(path, &values)?;
    Ok(())
}
