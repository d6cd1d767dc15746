//! Test data generators for N-dimensional arrays.
//!
//! Values are chosen so that a loaded element identifies the grid cell it
//! came from, which makes index bookkeeping bugs visible in assertions.

use chrono::{DateTime, TimeZone, Utc};

/// Encodes a multi-index as a single number.
///
/// Each axis contributes `index * 1000^(rank - 1 - axis)`, so `[3, 7, 42]`
/// encodes as `3_007_042`. Indices must stay below 1000.
///
/// # Example
///
/// ```
/// use test_utils::encode_index;
///
/// assert_eq!(encode_index(&[3, 7, 42]), 3_007_042.0);
/// assert_eq!(encode_index(&[]), 0.0);
/// ```
pub fn encode_index(index: &[usize]) -> f64 {
    index
        .iter()
        .fold(0.0, |acc, &i| acc * 1000.0 + i as f64)
}

/// Creates a row-major array whose values encode their own index.
///
/// # Example
///
/// ```
/// use test_utils::create_test_array;
///
/// let data = create_test_array(&[2, 3]);
/// assert_eq!(data.len(), 6);
/// assert_eq!(data[0], 0.0);    // [0, 0]
/// assert_eq!(data[1], 1.0);    // [0, 1]
/// assert_eq!(data[3], 1000.0); // [1, 0]
/// ```
pub fn create_test_array(shape: &[usize]) -> Vec<f64> {
    create_block_values(shape, &vec![0; shape.len()])
}

/// Creates values for a block of a larger array.
///
/// The block has `shape` and starts at `start` in the larger array; values
/// encode the index in the larger array, not the local one. Useful when one
/// source file holds only part of a virtual grid.
pub fn create_block_values(shape: &[usize], start: &[usize]) -> Vec<f64> {
    assert_eq!(shape.len(), start.len(), "shape and start rank differ");
    let total: usize = shape.iter().product();
    let mut data = Vec::with_capacity(total);
    let mut index = start.to_vec();

    for _ in 0..total {
        data.push(encode_index(&index));
        // odometer over the block, last axis fastest
        for axis in (0..shape.len()).rev() {
            index[axis] += 1;
            if index[axis] < start[axis] + shape[axis] {
                break;
            }
            index[axis] = start[axis];
        }
    }
    data
}

/// Creates an array of `len` copies of `value`.
pub fn create_constant_array(len: usize, value: f64) -> Vec<f64> {
    vec![value; len]
}

/// Creates an encoded test array with NaN at the given multi-indices.
pub fn create_array_with_nans(shape: &[usize], nan_at: &[&[usize]]) -> Vec<f64> {
    let mut data = create_test_array(shape);
    for index in nan_at {
        let flat = index
            .iter()
            .zip(shape.iter())
            .fold(0, |acc, (&i, &n)| acc * n + i);
        data[flat] = f64::NAN;
    }
    data
}

/// Evenly spaced values starting at `start`.
pub fn linspace(start: f64, step: f64, n: usize) -> Vec<f64> {
    (0..n).map(|i| start + step * i as f64).collect()
}

/// First-of-month timestamps starting January of `start_year`.
pub fn monthly_times(start_year: i32, n: usize) -> Vec<DateTime<Utc>> {
    (0..n)
        .filter_map(|i| {
            let year = start_year + (i / 12) as i32;
            let month = (i % 12) as u32 + 1;
            Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0).single()
        })
        .collect()
}
