//! Headerless float32 data source.

use std::path::Path;

use ndarray::{ArrayViewD, ArrayD, IxDyn};

use crate::error::{GridError, Result};

use super::{bounds, check_indices, select_from_block, DataSource};

/// A flat little-endian float32 file, row-major in native dimension order.
///
/// The whole file is read on open; the shape comes from the catalog.
pub struct RawSource {
    values: Vec<f32>,
    id: String,
    dims: Vec<String>,
    shape: Vec<usize>,
}

impl RawSource {
    pub fn open(path: &Path, dims: &[String], shape: &[usize]) -> Result<Self> {
        let id = path.display().to_string();
        let bytes = std::fs::read(path)
            .map_err(|e| GridError::source_unreadable(&id, "open", e.to_string()))?;

        let expected = shape.iter().product::<usize>() * std::mem::size_of::<f32>();
        if bytes.len() != expected {
            return Err(GridError::source_unreadable(
                &id,
                "open",
                format!(
                    "file holds {} bytes, shape {:?} needs {}",
                    bytes.len(),
                    shape,
                    expected
                ),
            ));
        }

        let values = bytes
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();

        Ok(Self {
            values,
            id,
            dims: dims.to_vec(),
            shape: shape.to_vec(),
        })
    }
}

impl DataSource for RawSource {
    fn dims(&self) -> &[String] {
        &self.dims
    }

    fn shape(&self) -> &[usize] {
        &self.shape
    }

    fn read(&self, indices: &[Vec<usize>]) -> Result<ArrayD<f64>> {
        check_indices(&self.id, &self.shape, indices)?;

        let view = ArrayViewD::from_shape(IxDyn(&self.shape), &self.values).map_err(|e| {
            GridError::source_unreadable(&self.id, format!("{:?}", indices), e.to_string())
        })?;

        let bounds = bounds(indices);
        let block = view
            .slice_each_axis(|ax| {
                let (min, max) = bounds[ax.axis.index()];
                ndarray::Slice::from(min..max + 1)
            })
            .mapv(f64::from);

        Ok(select_from_block(block, &bounds, indices))
    }
}

/// Write values as a raw float32 file.
pub fn write_raw(path: &Path, values: &[f32]) -> Result<()> {
    let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
    std::fs::write(path, bytes)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_roundtrip_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("block.bin");
        let values: Vec<f32> = (0..12).map(|v| v as f32).collect();
        write_raw(&path, &values).unwrap();

        let dims = vec!["lat".to_string(), "lon".to_string()];
        let source = RawSource::open(&path, &dims, &[3, 4]).unwrap();
        let block = source.read(&[vec![2, 0], vec![1, 3]]).unwrap();

        assert_eq!(block.shape(), &[2, 2]);
        assert_eq!(block[[0, 0]], 9.0);
        assert_eq!(block[[0, 1]], 11.0);
        assert_eq!(block[[1, 0]], 1.0);
        assert_eq!(block[[1, 1]], 3.0);
    }

    #[test]
    fn test_raw_size_mismatch_is_unreadable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.bin");
        write_raw(&path, &[1.0, 2.0]).unwrap();

        let dims = vec!["time".to_string()];
        let err = RawSource::open(&path, &dims, &[3]).err().unwrap();
        assert!(matches!(err, GridError::SourceUnreadable { .. }));
    }

    #[test]
    fn test_missing_file_is_unreadable() {
        let dims = vec!["time".to_string()];
        let err = RawSource::open(Path::new("/nonexistent/x.bin"), &dims, &[3]).err().unwrap();
        assert!(matches!(err, GridError::SourceUnreadable { .. }));
    }
}
