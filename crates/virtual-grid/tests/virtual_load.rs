//! Integration test: catalog source files into a virtual grid and load from it.
//!
//! The scenario grid is lat(10) x lon(20) x time(120), with months 0..60 in
//! one Zarr store and 60..120 in another. Stored values encode their grid
//! index, so every loaded element can be checked against where it came from.

use std::path::Path;

use test_utils::{assert_slice_approx_eq, encode_index, scenario, scratch_dir};
use virtual_grid::testdata::{write_raw_source, write_zarr_source, write_zarr_source_f32};
use virtual_grid::{
    Coordinates, Dimension, GridConfig, GridError, GridFile, LoadRequest, SourceFormat,
    SourceSpec,
};

fn scenario_dims() -> Vec<Dimension> {
    vec![
        Dimension::new("lat", Coordinates::Numeric(scenario::lat_values())),
        Dimension::new("lon", Coordinates::Numeric(scenario::lon_values())),
        Dimension::new("time", Coordinates::Time(scenario::times())),
    ]
}

/// Write the two scenario stores and catalog them.
fn build_scenario(dir: &Path) -> GridFile {
    let shapes = scenario::source_shapes();
    write_zarr_source(&dir.join("early.zarr"), &shapes[0], &scenario::source_values(0)).unwrap();
    write_zarr_source(&dir.join("late.zarr"), &shapes[1], &scenario::source_values(1)).unwrap();

    let mut grid = GridFile::new(scenario_dims()).unwrap();
    let last = scenario::TIME - 1;
    grid.add_source(
        SourceSpec::new(dir.join("early.zarr"), "/", SourceFormat::Zarr, &scenario::DIMS),
        &[("time", [0, scenario::SPLIT - 1])],
    )
    .unwrap();
    grid.add_source(
        SourceSpec::new(dir.join("late.zarr"), "/", SourceFormat::Zarr, &scenario::DIMS),
        &[("time", [scenario::SPLIT, last])],
    )
    .unwrap();
    grid
}

#[test]
fn test_load_across_source_boundary() {
    let dir = scratch_dir();
    let grid = build_scenario(dir.path());

    let request = LoadRequest::new(&["time", "lat", "lon"]).with_indices("time", vec![0, 60, 119]);
    let region = grid.load(&request).unwrap();

    assert_eq!(region.data.shape(), &[3, 10, 20]);
    assert_eq!(region.dims, vec!["time", "lat", "lon"]);
    assert_eq!(region.missing_count(), 0);

    for (t, &time) in [0usize, 60, 119].iter().enumerate() {
        for lat in [0usize, 4, 9] {
            for lon in [0usize, 13, 19] {
                assert_eq!(region.data[[t, lat, lon]], encode_index(&[lat, lon, time]));
            }
        }
    }

    let times = region.coordinates_of("time").unwrap();
    assert_eq!(times.len(), 3);
    let all = scenario::times();
    assert_eq!(times, &Coordinates::Time(vec![all[0], all[60], all[119]]));
}

#[test]
fn test_index_order_is_preserved() {
    let dir = scratch_dir();
    let grid = build_scenario(dir.path());

    let forward = grid
        .load(&LoadRequest::new(&["time"]).with_indices("time", vec![5, 70, 61]))
        .unwrap();
    let reversed = grid
        .load(&LoadRequest::new(&["time"]).with_indices("time", vec![61, 70, 5]))
        .unwrap();

    assert_eq!(forward.data.shape(), &[3, 10, 20]);
    for k in 0..3 {
        let f = forward.data.index_axis(ndarray::Axis(0), k);
        let r = reversed.data.index_axis(ndarray::Axis(0), 2 - k);
        assert_eq!(f, r);
    }
    assert_eq!(forward.data[[1, 2, 3]], encode_index(&[2, 3, 70]));
}

#[test]
fn test_repeated_load_reuses_handles() {
    let dir = scratch_dir();
    let grid = build_scenario(dir.path());
    let cache = grid.source_cache();

    for time in [0usize, 30, 60, 90, 119, 59] {
        let request = LoadRequest::new(&["lat"])
            .with_indices("time", vec![time])
            .with_indices("lat", vec![2]);
        let region = grid.repeated_load(&request, &cache).unwrap();
        assert_eq!(region.data.shape(), &[1, 20, 1]);
        assert_eq!(region.data[[0, 7, 0]], encode_index(&[2, 7, time]));
    }

    let stats = cache.stats();
    assert_eq!(stats.builds, 2, "each source should be opened exactly once");
    assert_eq!(stats.entries, 2);
    assert_eq!(stats.hits, 4);
}

#[test]
fn test_repeated_load_rejects_foreign_cache() {
    let dir = scratch_dir();
    let grid = build_scenario(dir.path());
    let cache = virtual_grid::SourceCache::new(5);

    let result = grid.repeated_load(&LoadRequest::all(), &cache);
    assert!(matches!(result, Err(GridError::Validation(_))));
}

#[test]
fn test_uncovered_elements_are_nan() {
    let dir = scratch_dir();
    let shapes = scenario::source_shapes();
    write_zarr_source(&dir.path().join("early.zarr"), &shapes[0], &scenario::source_values(0)).unwrap();

    let mut grid = GridFile::new(scenario_dims()).unwrap();
    grid.add_source(
        SourceSpec::new(dir.path().join("early.zarr"), "/", SourceFormat::Zarr, &scenario::DIMS),
        &[("time", [0, scenario::SPLIT - 1])],
    )
    .unwrap();
    assert_eq!(grid.coverage_gaps()[0].1.len(), scenario::TIME - scenario::SPLIT);

    let request = LoadRequest::new(&["time"])
        .with_indices("time", vec![59, 60])
        .with_indices("lat", vec![0])
        .with_indices("lon", vec![0]);
    let region = grid.load(&request).unwrap();
    assert_eq!(region.data.shape(), &[2, 1, 1]);
    assert_eq!(region.data[[0, 0, 0]], 59.0);
    assert!(region.data[[1, 0, 0]].is_nan());
    assert_eq!(region.missing_count(), 1);

    // No candidate source at all: the whole request is missing
    let request = LoadRequest::new(&["time"]).with_indices("time", vec![100]);
    let region = grid.load(&request).unwrap();
    assert_eq!(region.missing_count(), 200);
}

#[test]
fn test_overlapping_sources_first_wins() {
    let dir = scratch_dir();
    let dims = vec![
        Dimension::new("x", Coordinates::Numeric(vec![0.0, 1.0, 2.0, 3.0])),
    ];
    write_zarr_source(&dir.path().join("a.zarr"), &[3], &[10.0, 11.0, 12.0]).unwrap();
    write_zarr_source(&dir.path().join("b.zarr"), &[3], &[21.0, 22.0, 23.0]).unwrap();

    let mut grid = GridFile::new(dims).unwrap();
    grid.add_source(
        SourceSpec::new(dir.path().join("a.zarr"), "/", SourceFormat::Zarr, &["x"]),
        &[("x", [0, 2])],
    )
    .unwrap();
    grid.add_source(
        SourceSpec::new(dir.path().join("b.zarr"), "/", SourceFormat::Zarr, &["x"]),
        &[("x", [1, 3])],
    )
    .unwrap();

    let region = grid.load(&LoadRequest::all()).unwrap();
    assert_slice_approx_eq!(region.data.as_slice().unwrap(), &[10.0, 11.0, 12.0, 23.0], 0.0);
}

#[test]
fn test_undeclared_dimension_is_broadcast() {
    let dir = scratch_dir();
    let dims = vec![
        Dimension::new("site", Coordinates::Text(vec!["a".into(), "b".into()])),
        Dimension::new("run", Coordinates::Numeric(vec![1.0, 2.0, 3.0])),
    ];
    write_zarr_source(&dir.path().join("sites.zarr"), &[2], &[5.0, 6.0]).unwrap();

    let mut grid = GridFile::new(dims).unwrap();
    grid.add_source(
        SourceSpec::new(dir.path().join("sites.zarr"), "/", SourceFormat::Zarr, &["site"]),
        &[],
    )
    .unwrap();

    let region = grid
        .load(&LoadRequest::new(&["run", "site"]).with_indices("run", vec![2, 0]))
        .unwrap();
    assert_eq!(region.data.shape(), &[2, 2]);
    assert_eq!(region.data[[0, 0]], 5.0);
    assert_eq!(region.data[[1, 1]], 6.0);
}

#[test]
fn test_undefined_dimension_dropped_unless_requested() {
    let dir = scratch_dir();
    let dims = vec![
        Dimension::new("x", Coordinates::Numeric(vec![0.0, 1.0])),
        Dimension::undefined("ens"),
    ];
    write_zarr_source(&dir.path().join("x.zarr"), &[2], &[1.5, 2.5]).unwrap();

    let mut grid = GridFile::new(dims).unwrap();
    grid.add_source(
        SourceSpec::new(dir.path().join("x.zarr"), "/", SourceFormat::Zarr, &["x"]),
        &[],
    )
    .unwrap();
    assert_eq!(grid.defined_dims(), vec!["x".to_string()]);

    let implicit = grid.load(&LoadRequest::all()).unwrap();
    assert_eq!(implicit.data.shape(), &[2]);
    assert_eq!(implicit.dims, vec!["x"]);

    let explicit = grid.load(&LoadRequest::new(&["x", "ens"])).unwrap();
    assert_eq!(explicit.data.shape(), &[2, 1]);
    assert_eq!(explicit.data[[1, 0]], 2.5);
}

#[test]
fn test_raw_source_with_conversion() {
    let dir = scratch_dir();
    let dims = vec![
        Dimension::new("y", Coordinates::Numeric(vec![0.0, 1.0])),
        Dimension::new("x", Coordinates::Numeric(vec![0.0, 1.0, 2.0])),
    ];
    // stored transposed: native order is (x, y)
    write_raw_source(&dir.path().join("packed.bin"), &[1.0, 4.0, -999.0, 5.0, 3.0, 6.0]).unwrap();

    let mut grid = GridFile::new(dims).unwrap();
    grid.add_source(
        SourceSpec::new(dir.path().join("packed.bin"), "values", SourceFormat::Raw, &["x", "y"])
            .with_fill_value(-999.0)
            .with_transform(0.5, 10.0),
        &[],
    )
    .unwrap();

    let region = grid.load(&LoadRequest::all()).unwrap();
    assert_eq!(region.dims, vec!["y", "x"]);
    assert_slice_approx_eq!(
        region.data.as_slice().unwrap(),
        &[10.5, f64::NAN, 11.5, 12.0, 12.5, 13.0],
        1e-9
    );
}

#[test]
fn test_float32_chunked_store() {
    let dir = scratch_dir();
    let dims = vec![
        Dimension::new("t", Coordinates::Numeric((0..6).map(f64::from).collect())),
        Dimension::new("k", Coordinates::Numeric(vec![0.0, 1.0])),
    ];
    let values: Vec<f32> = (0..12).map(|v| v as f32).collect();
    write_zarr_source_f32(&dir.path().join("f32.zarr"), &[6, 2], &values, 4).unwrap();

    let mut grid = GridFile::new(dims).unwrap();
    grid.add_source(
        SourceSpec::new(dir.path().join("f32.zarr"), "/", SourceFormat::Zarr, &["t", "k"]),
        &[],
    )
    .unwrap();

    let region = grid
        .load(&LoadRequest::new(&["t"]).with_indices("t", vec![5, 1]).with_indices("k", vec![1]))
        .unwrap();
    assert_eq!(region.data.as_slice().unwrap(), &[11.0, 3.0]);
}

#[test]
fn test_catalog_roundtrip_with_relative_paths() {
    let dir = scratch_dir();
    let shapes = scenario::source_shapes();
    write_zarr_source(&dir.path().join("early.zarr"), &shapes[0], &scenario::source_values(0)).unwrap();

    let mut grid = GridFile::new(scenario_dims()).unwrap().with_config(GridConfig {
        verify_sources: false,
        ..GridConfig::default()
    });
    grid.add_source(
        SourceSpec::new("early.zarr", "/", SourceFormat::Zarr, &scenario::DIMS),
        &[("time", [0, scenario::SPLIT - 1])],
    )
    .unwrap();
    grid.save(dir.path().join("tas.grid.json")).unwrap();

    let reopened = GridFile::open(dir.path().join("tas.grid.json")).unwrap();
    let region = reopened
        .load(&LoadRequest::new(&["time"]).with_indices("time", vec![12]))
        .unwrap();
    assert_eq!(region.data[[0, 9, 19]], encode_index(&[9, 19, 12]));
}

#[test]
fn test_invalid_requests() {
    let dir = scratch_dir();
    let grid = build_scenario(dir.path());

    let unknown = grid.load(&LoadRequest::new(&["depth"]));
    assert!(matches!(unknown, Err(GridError::Validation(_))));

    let out_of_range = grid.load(&LoadRequest::all().with_indices("time", vec![120]));
    assert!(matches!(out_of_range, Err(GridError::Validation(_))));

    let repeated = grid.load(&LoadRequest::new(&["lat", "lat"]));
    assert!(matches!(repeated, Err(GridError::Validation(_))));
}

#[test]
fn test_sequential_reads_match_parallel() {
    let dir = scratch_dir();
    let parallel = build_scenario(dir.path());
    let sequential = parallel.clone().with_config(GridConfig {
        parallel_reads: false,
        ..GridConfig::default()
    });

    let request = LoadRequest::new(&["time"]).with_indices("time", vec![3, 100, 59, 60]);
    let a = parallel.load(&request).unwrap();
    let b = sequential.load(&request).unwrap();
    assert_eq!(a.data, b.data);
}

#[test]
fn test_bracketing_source_is_opened_but_not_read() {
    let dir = scratch_dir();
    let values: Vec<f64> = (0..9).map(f64::from).collect();
    let mut grid = GridFile::new(vec![Dimension::new(
        "time",
        Coordinates::Numeric(values.clone()),
    )])
    .unwrap();
    for part in 0..3 {
        let path = dir.path().join(format!("part{}.bin", part));
        write_raw_source(&path, &values[part * 3..part * 3 + 3]).unwrap();
        grid.add_source(
            SourceSpec::new(&path, "values", SourceFormat::Raw, &["time"]),
            &[("time", [part * 3, part * 3 + 2])],
        )
        .unwrap();
    }

    // the middle source lies inside [0, 8] but holds neither index
    let cache = grid.source_cache();
    let request = LoadRequest::new(&["time"]).with_indices("time", vec![0, 8]);
    let region = grid.repeated_load(&request, &cache).unwrap();

    assert_slice_approx_eq!(region.data.as_slice().unwrap(), &[0.0, 8.0], 1e-9);
    assert_eq!(cache.stats().builds, 3);
}

#[test]
fn test_removed_source_is_unreadable() {
    let dir = scratch_dir();
    let grid = build_scenario(dir.path());
    std::fs::remove_dir_all(dir.path().join("late.zarr")).unwrap();

    // the early store still loads
    let early = LoadRequest::new(&["time"]).with_indices("time", vec![10]);
    assert!(grid.load(&early).is_ok());

    let late = LoadRequest::new(&["time"]).with_indices("time", vec![70]);
    match grid.load(&late) {
        Err(GridError::SourceUnreadable { source_id, range, .. }) => {
            assert!(source_id.contains("late.zarr"), "unexpected source {}", source_id);
            assert_eq!(range, "[[0, 9], [0, 19], [70, 70]]");
        }
        other => panic!("expected SourceUnreadable, got {:?}", other.map(|r| r.data.shape().to_vec())),
    }
}
