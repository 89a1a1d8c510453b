mod common;

use std::fs;

use common::*;
use footprint_core::{
    config::PipelineConfig,
    csv_writer::write_points_to_file,
    excel::{create_summary_xlsx, write_summary_to_file, SummaryData},
    model::{Point, StayStrategy},
    pipeline::Pipeline,
    point_reader::read_points_from_file,
    runner::RunMode,
    store::{MemoryStore, PointStore},
    task::RecordingSink,
};
use tempfile::tempdir;

const INPUT: &str = "\
id,timestamp,longitude,latitude,heading,accuracy,speed,distance,altitude,province,city,county,town,village
1,1704326400,116.4,39.9,,5,0.0,,40,Beijing,Beijing,Chaoyang,,
2,1704327000,116.4,39.9,,5,,,40,Beijing,Beijing,Chaoyang,,
3,1704327600,,,,,,,,,,,,
,1704328200,116.4,39.9,,,,,,,,,,
";

#[test]
fn test_read_points_from_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("points.csv");
    fs::write(&path, INPUT).unwrap();

    let points = read_points_from_file(&path).unwrap();
    assert_eq!(points.len(), 3);
    assert_eq!(points[0].admin.county.as_deref(), Some("Chaoyang"));
    assert_eq!(points[0].admin.town, None);
    assert_eq!(points[1].speed, None);
    assert!(!points[2].has_valid_coordinates());
}

#[test]
fn test_missing_input_file_is_an_error() {
    let dir = tempdir().unwrap();
    assert!(read_points_from_file(dir.path().join("absent.csv")).is_err());
}

#[test]
fn test_snapshot_round_trip_keeps_derived_data() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("state.json");

    let mut points: Vec<Point> = (0..30).map(|i| point_at(i + 1, T0 + i as i64 * 600, 0.0, 0.0)).collect();
    points.push(Point::new(99, T0 + 7, f64::NAN, f64::NAN));
    let mut store = MemoryStore::new(points).unwrap();
    Pipeline::new(PipelineConfig::default())
        .unwrap()
        .run(&mut store, &mut RecordingSink::default(), RunMode::Incremental)
        .unwrap();
    store.save(&path).unwrap();

    let loaded = MemoryStore::load(&path).unwrap();
    assert_eq!(loaded.len(), store.len());
    assert!(loaded.point(99).unwrap().lat.is_nan());
    assert_eq!(loaded.point(5), store.point(5));
    assert_eq!(loaded.segments().unwrap().len(), store.segments().unwrap().len());

    let stays = loaded.stays(StayStrategy::Spatial).unwrap();
    assert_eq!(stays.len(), 1);
    assert_eq!(stays[0].point_count, 30);
    assert_eq!(stays[0].start_time, T0);
    assert!(stays[0].activity.is_some());
    assert!(approx_eq(stays[0].center_lat, BASE_LAT, 1e-9));
}

#[test]
fn test_merge_skips_known_ids() {
    let mut store = MemoryStore::new(vec![point_at(1, T0, 0.0, 0.0)]).unwrap();
    let added = store
        .merge_points(vec![point_at(1, T0, 50.0, 0.0), point_at(2, T0 + 60, 0.0, 0.0)])
        .unwrap();
    assert_eq!(added, 1);
    assert_eq!(store.len(), 2);
    assert_eq!(store.point(1).unwrap().lat, BASE_LAT);
}

#[test]
fn test_write_points_and_summary() {
    let dir = tempdir().unwrap();
    let points: Vec<Point> = (0..3).map(|i| clean(point_at(i + 1, T0 + i as i64 * 60, 0.0, 0.0))).collect();

    let csv_path = dir.path().join("points.csv");
    write_points_to_file(&csv_path, &points).unwrap();
    let text = fs::read_to_string(&csv_path).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 4);
    assert!(lines[0].starts_with("id,timestamp,time_utc,longitude,latitude"));
    assert!(lines[1].starts_with("1,1704326400,2024-01-04T00:00:00Z,"));

    let xlsx_path = dir.path().join("summary.xlsx");
    let workbook = create_summary_xlsx(&SummaryData {
        points: &points,
        segments: &[],
        stays: &[],
        trips: &[],
    })
    .unwrap();
    write_summary_to_file(&xlsx_path, workbook).unwrap();
    assert!(fs::metadata(&xlsx_path).unwrap().len() > 0);
}
