//! Common test fixtures shared across crates.

/// A lat/lon/time grid split across two files at a time boundary.
///
/// The first file holds months `0..SPLIT`, the second `SPLIT..TIME`.
pub mod scenario {
    use chrono::{DateTime, Utc};

    pub const LAT: usize = 10;
    pub const LON: usize = 20;
    pub const TIME: usize = 120;
    pub const SPLIT: usize = 60;
    pub const START_YEAR: i32 = 1900;

    /// Dimension order used by the scenario source files.
    pub const DIMS: [&str; 3] = ["lat", "lon", "time"];

    /// Latitude centers, south to north.
    pub fn lat_values() -> Vec<f64> {
        crate::linspace(-85.5, 19.0, LAT)
    }

    /// Longitude centers, 0 to 342.
    pub fn lon_values() -> Vec<f64> {
        crate::linspace(0.0, 18.0, LON)
    }

    /// Monthly timestamps starting at `START_YEAR`.
    pub fn times() -> Vec<DateTime<Utc>> {
        crate::monthly_times(START_YEAR, TIME)
    }

    /// Shape of the two source files.
    pub fn source_shapes() -> [[usize; 3]; 2] {
        [[LAT, LON, SPLIT], [LAT, LON, TIME - SPLIT]]
    }

    /// Encoded values for source file `part` (0 or 1).
    pub fn source_values(part: usize) -> Vec<f64> {
        let shape = source_shapes()[part];
        let start = [0, 0, if part == 0 { 0 } else { SPLIT }];
        crate::create_block_values(&shape, &start)
    }
}

/// Creates a temporary directory that is removed on drop.
pub fn scratch_dir() -> tempfile::TempDir {
    match tempfile::tempdir() {
        Ok(dir) => dir,
        Err(e) => panic!("failed to create scratch dir: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scenario_coordinates() {
        assert_eq!(scenario::lat_values().len(), scenario::LAT);
        assert_eq!(scenario::lon_values().len(), scenario::LON);
        assert_eq!(scenario::times().len(), scenario::TIME);
    }

    #[test]
    fn test_scenario_source_values() {
        let first = scenario::source_values(0);
        let second = scenario::source_values(1);
        assert_eq!(first.len(), scenario::LAT * scenario::LON * scenario::SPLIT);
        assert_eq!(second.len(), scenario::LAT * scenario::LON * 60);
        assert_eq!(first[0], 0.0);
        assert_eq!(second[0], 60.0);
    }

    #[test]
    fn test_scratch_dir_exists() {
        let dir = scratch_dir();
        assert!(dir.path().exists());
    }
}
