mod common;

use common::*;
use footprint_core::{
    config::{ModeConfig, PipelineConfig},
    model::{ModeReason, Point, TransportMode},
    runner::RunMode,
    store::{MemoryStore, PointStore},
    task::RecordingSink,
    transport::{self, ModeClassifier},
};

fn classifier() -> ModeClassifier {
    ModeClassifier::new(ModeConfig::default())
}

fn kmh_to_mps(kmh: f64) -> f64 {
    kmh / 3.6
}

#[test]
fn test_flight_at_altitude() {
    let c = classifier().classify_speed(700.0, 9000.0, false);
    assert_eq!(c.mode, TransportMode::Flight);
    assert_eq!(c.confidence, 0.95);
    assert!(c.reasons.contains(&ModeReason::HighAltitude));
    assert!(c.reasons.contains(&ModeReason::FlightSpeedRange));
}

#[test]
fn test_flight_speed_on_the_ground_is_not_flight() {
    // 300 km/h at ground level falls through to the train range.
    let c = classifier().classify_speed(300.0, 0.0, false);
    assert_eq!(c.mode, TransportMode::Car);
    assert_eq!(c.reasons, vec![ModeReason::HighSpeed]);
}

#[test]
fn test_province_crossing_separates_train_from_car() {
    let cls = classifier();
    let speed = kmh_to_mps(150.0);

    let prev = point_at(1, T0, 0.0, 0.0).with_admin(admin("Hebei", "Baoding", "Lianchi"));
    let crossing = point_at(2, T0 + 60, 0.0, 0.0)
        .with_speed(speed)
        .with_admin(admin("Beijing", "Beijing", "Fengtai"));
    let staying = point_at(3, T0 + 60, 0.0, 0.0)
        .with_speed(speed)
        .with_admin(admin("Hebei", "Baoding", "Jingxiu"));

    let train = cls.classify(Some(&prev), &crossing);
    assert_eq!(train.mode, TransportMode::Train);
    assert_eq!(train.confidence, 0.85);

    let car = cls.classify(Some(&prev), &staying);
    assert_eq!(car.mode, TransportMode::Car);
    assert_eq!(car.confidence, 0.70);
}

#[test]
fn test_missing_province_is_not_a_crossing() {
    let prev = point_at(1, T0, 0.0, 0.0);
    let next = point_at(2, T0 + 60, 0.0, 0.0).with_admin(admin("Beijing", "Beijing", "Fengtai"));
    assert!(!ModeClassifier::crosses_province(Some(&prev), &next));
    assert!(!ModeClassifier::crosses_province(None, &next));
}

#[test]
fn test_cascade_boundaries() {
    let cls = classifier();
    assert_eq!(cls.classify_speed(120.0, 0.0, false).mode, TransportMode::Car);
    assert_eq!(cls.classify_speed(50.0, 0.0, false).confidence, 0.75);
    assert_eq!(cls.classify_speed(20.0, 0.0, false).mode, TransportMode::Car);
    assert_eq!(cls.classify_speed(10.0, 0.0, false).mode, TransportMode::Unknown);
    assert_eq!(cls.classify_speed(5.0, 0.0, false).mode, TransportMode::Walk);
    assert_eq!(cls.classify_speed(0.5, 0.0, false).mode, TransportMode::Stay);
    assert_eq!(cls.classify_speed(1500.0, 0.0, false).mode, TransportMode::Unknown);
}

#[test]
fn test_speed_is_max_of_recorded_and_computed() {
    let prev = point_at(1, T0, 0.0, 0.0);
    // 1 km in 60 s is 60 km/h; the device says 36 km/h.
    let p = point_at(2, T0 + 60, 1000.0, 0.0).with_speed(10.0);
    assert!(approx_eq(ModeClassifier::point_speed_kmh(Some(&prev), &p), 60.0, 0.1));

    let fast = point_at(3, T0 + 60, 1000.0, 0.0).with_speed(30.0);
    assert!(approx_eq(ModeClassifier::point_speed_kmh(Some(&prev), &fast), 108.0, 0.01));
}

#[test]
fn test_segments_cover_every_point_once() {
    // STAY STAY WALK WALK CAR CAR STAY
    let speeds = [0.0, 0.0, 1.0, 1.0, 10.0, 10.0, 0.0];
    let points: Vec<Point> = speeds
        .iter()
        .enumerate()
        .map(|(i, s)| point_at(i as u64 + 1, T0 + i as i64 * 60, 0.0, 0.0).with_speed(*s))
        .collect();

    let (segments, skipped) = classifier().segment_batch(None, &points);
    assert_eq!(skipped, 0);

    let modes: Vec<TransportMode> = segments.iter().map(|s| s.segment.mode).collect();
    assert_eq!(
        modes,
        vec![TransportMode::Stay, TransportMode::Walk, TransportMode::Car, TransportMode::Stay]
    );

    let members: Vec<u64> = segments.iter().flat_map(|s| s.members.iter().map(|(id, _)| *id)).collect();
    assert_eq!(members, vec![1, 2, 3, 4, 5, 6, 7]);

    for s in &segments {
        assert_eq!(s.segment.point_count, s.members.len());
        assert_eq!(s.segment.start_point_id, s.members[0].0);
        assert_eq!(s.segment.end_point_id, s.members[s.members.len() - 1].0);
    }
}

#[test]
fn test_segment_aggregates() {
    // 100 m a minute is 6 km/h. The first point has no predecessor so it is a STAY.
    let points: Vec<Point> = (0..5).map(|i| point_at(i + 1, T0 + i as i64 * 60, i as f64 * 100.0, 0.0)).collect();
    let (segments, _) = classifier().segment_batch(None, &points);
    assert_eq!(segments.len(), 2);

    let walk = &segments[1].segment;
    assert_eq!(walk.mode, TransportMode::Walk);
    assert_eq!(walk.point_count, 4);
    assert_eq!(walk.duration_s, 180);
    assert!(approx_eq(walk.distance_m, 300.0, 0.5), "distance {}", walk.distance_m);
    assert!(approx_eq(walk.avg_speed_kmh, 6.0, 0.01));
    assert!(approx_eq(walk.max_speed_kmh, 6.0, 0.01));
    assert_eq!(walk.confidence, 0.80);
    assert_eq!(walk.reasons, vec![ModeReason::WalkingSpeed]);
}

#[test]
fn test_invalid_points_are_skipped() {
    let points = vec![
        point_at(1, T0, 0.0, 0.0),
        Point::new(2, T0 + 60, f64::NAN, f64::NAN),
        point_at(3, T0 + 120, 0.0, 0.0),
    ];
    let (segments, skipped) = classifier().segment_batch(None, &points);
    assert_eq!(skipped, 1);
    assert_eq!(segments.len(), 1);
    assert_eq!(segments[0].members.len(), 2);
}

#[test]
fn test_run_writes_modes_and_segments_for_clean_points_only() {
    let mut points: Vec<Point> = (0..12)
        .map(|i| clean(point_at(i + 1, T0 + i as i64 * 60, 0.0, 0.0).with_speed(if i < 6 { 0.0 } else { 10.0 })))
        .collect();
    // Not yet through outlier detection, so not eligible.
    points.push(point_at(50, T0 + 30, 0.0, 0.0));

    let mut store = MemoryStore::new(points).unwrap();
    let mut sink = RecordingSink::default();
    let config = PipelineConfig {
        batch_size: 5,
        ..Default::default()
    };

    let summary = transport::run(&mut store, &mut sink, &config, RunMode::Incremental).unwrap();
    assert_eq!(summary.processed, 12);
    assert_eq!(summary.failed, 0);
    assert!(store.point(50).unwrap().mode.is_none());

    let segments = store.segments().unwrap();
    let total: usize = segments.iter().map(|s| s.point_count).sum();
    assert_eq!(total, 12);
    for p in store.points().iter().filter(|p| p.id != 50) {
        let annotation = p.mode.as_ref().unwrap();
        let segment = segments.iter().find(|s| s.id == annotation.segment_id).unwrap();
        assert!(segment.start_time <= p.timestamp && p.timestamp <= segment.end_time);
        assert_eq!(segment.mode, annotation.mode);
    }

    // A full recompute rebuilds the same segments.
    transport::run(&mut store, &mut sink, &config, RunMode::FullRecompute).unwrap();
    assert_eq!(store.segments().unwrap(), segments);
}
