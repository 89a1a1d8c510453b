mod common;

use common::*;
use footprint_core::{
    config::{PipelineConfig, StayConfig, StayInput},
    model::{
        ActivityType, AdminLabels, AdminLevel, Point, StayMembership, StaySegment, StayStrategy,
        Timestamp,
    },
    runner::RunMode,
    stay::{
        self,
        activity::{annotate_stays, importance, infer_activity, label},
        density::{dbscan, split_visits},
        StayDetector,
    },
    store::{Eligibility, MemoryStore, PointStore},
    task::RecordingSink,
};
use time::UtcOffset;

/// Ten points within 50 m of each other, 20 minutes apart (3 hours in
/// all), then one point 500 m away.
fn dwell_then_leave() -> Vec<Point> {
    let mut points: Vec<Point> = (0..10)
        .map(|i| {
            point_at(
                i + 1,
                T0 + i as i64 * 20 * MINUTE,
                (i % 3) as f64 * 10.0,
                (i % 2) as f64 * 10.0,
            )
        })
        .collect();
    points.push(point_at(11, T0 + 200 * MINUTE, 500.0, 0.0));
    points
}

/// The same points with a two hour silence after the fifth.
fn dwell_with_gap() -> Vec<Point> {
    dwell_then_leave()
        .into_iter()
        .map(|mut p| {
            if p.id > 5 {
                p.timestamp += 2 * HOUR;
            }
            p
        })
        .collect()
}

fn config(strategy: StayStrategy) -> StayConfig {
    StayConfig {
        strategy,
        ..Default::default()
    }
}

#[test]
fn test_spatial_finds_one_stay() {
    let detection = StayDetector::new(config(StayStrategy::Spatial)).detect(&dwell_then_leave());
    assert_eq!(detection.stays.len(), 1);

    let stay = &detection.stays[0];
    assert_eq!(stay.members, (1..=10).collect::<Vec<u64>>());
    assert_eq!(stay.stay.duration_s, 3 * HOUR);
    assert_eq!(stay.stay.start_time, T0);
    assert_eq!(stay.stay.point_count, 10);
    assert_eq!(stay.stay.confidence, 1.0);
    assert!(stay.stay.radius_m < 50.0);
    assert_eq!(detection.unassigned, vec![11]);
}

#[test]
fn test_short_groups_are_not_stays() {
    let cfg = StayConfig {
        min_duration_s: 4 * HOUR,
        ..config(StayStrategy::Spatial)
    };
    let detection = StayDetector::new(cfg).detect(&dwell_then_leave());
    assert!(detection.stays.is_empty());
    assert_eq!(detection.unassigned.len(), 11);
}

#[test]
fn test_density_covers_the_dwell() {
    let cfg = StayConfig {
        eps_m: 200.0,
        min_points: 3,
        ..config(StayStrategy::Density)
    };
    let detection = StayDetector::new(cfg).detect(&dwell_then_leave());
    assert_eq!(detection.stays.len(), 1);
    assert_eq!(detection.stays[0].members.len(), 10);
    assert_eq!(detection.stays[0].stay.strategy, StayStrategy::Density);
    assert_eq!(detection.unassigned, vec![11]);
}

#[test]
fn test_density_splits_separate_visits() {
    let cfg = StayConfig {
        eps_m: 200.0,
        min_points: 3,
        min_duration_s: HOUR,
        ..config(StayStrategy::Density)
    };
    let detection = StayDetector::new(cfg).detect(&dwell_with_gap());
    assert_eq!(detection.stays.len(), 2);
    assert_eq!(detection.stays[0].members, vec![1, 2, 3, 4, 5]);
    assert_eq!(detection.stays[1].members, vec![6, 7, 8, 9, 10]);
    assert!(detection.stays[0].stay.end_time < detection.stays[1].stay.start_time);
}

#[test]
fn test_dbscan_labels_noise() {
    let points = dwell_then_leave();
    let labels = dbscan(&points, 200.0, 3);
    assert!(labels[..10].iter().all(|l| *l == Some(0)));
    assert_eq!(labels[10], None);
}

#[test]
fn test_dbscan_finds_two_places() {
    let mut points: Vec<Point> = (0..4).map(|i| point_at(i + 1, T0 + i as i64 * 60, 0.0, i as f64)).collect();
    points.extend((0..4).map(|i| point_at(i + 5, T0 + 600 + i as i64 * 60, 5000.0, i as f64)));
    let labels = dbscan(&points, 100.0, 3);
    assert!(labels[..4].iter().all(|l| *l == Some(0)));
    assert!(labels[4..].iter().all(|l| *l == Some(1)));
}

#[test]
fn test_split_visits_breaks_on_interleaved_clusters() {
    let points: Vec<Point> = (0..6).map(|i| point_at(i + 1, T0 + i as i64 * 60, 0.0, 0.0)).collect();
    let labels = vec![Some(0), Some(0), None, Some(1), Some(0), Some(0)];
    let visits = split_visits(&points, &labels, HOUR);
    assert_eq!(visits, vec![vec![0, 1], vec![3], vec![4, 5]]);
}

#[test]
fn test_admin_groups_by_label() {
    let town = |name: &str| AdminLabels {
        town: Some(name.to_string()),
        ..Default::default()
    };
    let mut points = Vec::new();
    for i in 0..4 {
        points.push(point_at(i + 1, T0 + i as i64 * 20 * MINUTE, i as f64 * 300.0, 0.0).with_admin(town("Alpha")));
    }
    for i in 4..7 {
        points.push(point_at(i + 1, T0 + i as i64 * 20 * MINUTE, i as f64 * 300.0, 0.0).with_admin(town("Beta")));
    }
    points.push(point_at(8, T0 + 7 * 20 * MINUTE, 0.0, 0.0));

    let cfg = StayConfig {
        min_duration_s: 30 * MINUTE,
        ..config(StayStrategy::Admin(AdminLevel::Town))
    };
    let detection = StayDetector::new(cfg).detect(&points);
    assert_eq!(detection.stays.len(), 2);
    assert_eq!(detection.stays[0].members, vec![1, 2, 3, 4]);
    assert_eq!(detection.stays[1].members, vec![5, 6, 7]);
    assert_eq!(detection.stays[1].stay.admin.town.as_deref(), Some("Beta"));
    assert_eq!(detection.unassigned, vec![8]);
}

#[test]
fn test_run_spatial_over_store() {
    let points: Vec<Point> = dwell_then_leave().into_iter().map(clean).collect();
    let mut store = MemoryStore::new(points).unwrap();
    let mut sink = RecordingSink::default();
    let config = PipelineConfig {
        batch_size: 3,
        ..Default::default()
    };

    let summary = stay::run(&mut store, &mut sink, &config, RunMode::Incremental).unwrap();
    assert_eq!(summary.processed, 11);

    let stays = store.stays(StayStrategy::Spatial).unwrap();
    assert_eq!(stays.len(), 1);
    assert_eq!(stays[0].duration_s, 3 * HOUR);
    assert!(stays[0].activity.is_some());
    for p in store.points() {
        let expected = if p.id == 11 {
            StayMembership::Unassigned
        } else {
            StayMembership::Member(stays[0].id)
        };
        assert_eq!(p.stay, Some(expected));
    }
}

#[test]
fn test_run_stationary_input_uses_only_stay_points() {
    let points: Vec<Point> = dwell_then_leave().into_iter().map(clean).collect();
    let mut store = MemoryStore::new(points).unwrap();
    let mut sink = RecordingSink::default();
    let mut config = PipelineConfig::default();
    config.stays.input = StayInput::Stationary;

    // No modes yet, so nothing is eligible.
    let summary = stay::run(&mut store, &mut sink, &config, RunMode::Incremental).unwrap();
    assert_eq!(summary.processed, 0);
    assert!(store.stays(StayStrategy::Spatial).unwrap().is_empty());
}

#[test]
fn test_run_density_stays_do_not_overlap() {
    let mut points: Vec<Point> = dwell_with_gap().into_iter().map(clean).collect();
    points.extend((0..8).map(|i| clean(point_at(100 + i, T0 + 12 * HOUR + i as i64 * 30 * MINUTE, 3000.0, 0.0))));
    let mut store = MemoryStore::new(points).unwrap();
    let mut sink = RecordingSink::default();
    let mut config = PipelineConfig::default();
    config.stays.strategy = StayStrategy::Density;
    config.stays.min_duration_s = HOUR;

    stay::run(&mut store, &mut sink, &config, RunMode::Incremental).unwrap();
    let stays = store.stays(StayStrategy::Density).unwrap();
    assert_eq!(stays.len(), 3);
    for pair in stays.windows(2) {
        assert!(pair[0].end_time < pair[1].start_time);
    }
    assert!(stays.iter().all(|s| s.duration_s >= HOUR));
}

fn stay_at(start: Timestamp, duration: i64) -> StaySegment {
    StaySegment {
        id: 1,
        strategy: StayStrategy::Spatial,
        start_time: start,
        end_time: start + duration,
        duration_s: duration,
        center_lat: BASE_LAT,
        center_lon: BASE_LON,
        radius_m: 20.0,
        point_count: 10,
        admin: admin("Beijing", "Beijing", "Dongcheng"),
        confidence: 1.0,
        activity: None,
        outgoing_trip: None,
    }
}

#[test]
fn test_activity_rules() {
    let utc = UtcOffset::UTC;
    let infer = |start: Timestamp, duration: i64, freq: usize| infer_activity(&stay_at(start, duration), freq, utc).unwrap();

    // Thursday 23:00 for 8 hours.
    assert_eq!(infer(T0 + 23 * HOUR, 8 * HOUR, 11), (ActivityType::Home, 0.9));
    assert_eq!(infer(T0 + 23 * HOUR, 8 * HOUR, 10), (ActivityType::Unknown, 0.3));

    // Thursday 09:00 for 8 hours.
    assert_eq!(infer(T0 + 9 * HOUR, 8 * HOUR, 6), (ActivityType::Work, 0.8));

    assert_eq!(infer(T0 + 12 * HOUR, 90 * MINUTE, 1), (ActivityType::MealLunch, 0.7));
    assert_eq!(infer(T0 + 7 * HOUR, 30 * MINUTE, 1), (ActivityType::MealBreakfast, 0.7));
    assert_eq!(infer(T0 + 15 * HOUR, 30 * MINUTE, 1), (ActivityType::Transit, 0.6));

    // Saturday afternoon.
    assert_eq!(infer(T0 + 2 * 24 * HOUR + 14 * HOUR, 2 * HOUR, 1), (ActivityType::Visit, 0.5));
}

#[test]
fn test_activity_uses_local_time() {
    // 14:00 UTC is 22:00 at UTC+8.
    let offset = UtcOffset::from_hms(8, 0, 0).unwrap();
    let (activity, _) = infer_activity(&stay_at(T0 + 14 * HOUR, 8 * HOUR), 20, offset).unwrap();
    assert_eq!(activity, ActivityType::Home);
}

#[test]
fn test_importance_and_label() {
    let stay = stay_at(T0, 24 * HOUR);
    assert_eq!(importance(&stay, 20, stay.end_time), 95);
    // A year later nothing is left of the recency score.
    assert_eq!(importance(&stay, 20, stay.end_time + 366 * 24 * HOUR), 75);

    assert_eq!(label(&stay, ActivityType::Home), "Home in Dongcheng");
    assert_eq!(label(&stay, ActivityType::MealLunch), "Lunch in Dongcheng");

    let mut nowhere = stay.clone();
    nowhere.admin = AdminLabels::default();
    assert_eq!(label(&nowhere, ActivityType::Unknown), "Stay in Unknown");
}

#[test]
fn test_annotate_counts_visits_to_the_same_place() {
    let stays: Vec<StaySegment> = (0..3)
        .map(|d| {
            let mut s = stay_at(T0 + d * 24 * HOUR + 12 * HOUR, HOUR);
            s.id = d as u64 + 1;
            s
        })
        .chain(std::iter::once({
            let mut s = stay_at(T0 + 4 * 24 * HOUR, HOUR);
            s.id = 9;
            s.center_lat += 0.01;
            s
        }))
        .collect();

    let annotations = annotate_stays(&stays, 4, UtcOffset::UTC).unwrap();
    let freq: Vec<(u64, usize)> = annotations.iter().map(|(id, a)| (*id, a.frequency)).collect();
    assert_eq!(freq, vec![(1, 3), (2, 3), (3, 3), (9, 1)]);
}

fn spans(stays: &[StaySegment]) -> Vec<(Timestamp, Timestamp, usize)> {
    stays.iter().map(|s| (s.start_time, s.end_time, s.point_count)).collect()
}

/// Runs stay detection over `first`, then again after `second` arrives, and
/// returns the stays of both the incremental runs and a full recompute.
fn split_runs(first: Vec<Point>, second: Vec<Point>) -> (MemoryStore, Vec<StaySegment>, Vec<StaySegment>) {
    let mut store = MemoryStore::new(first).unwrap();
    let mut sink = RecordingSink::default();
    let config = PipelineConfig::default();

    stay::run(&mut store, &mut sink, &config, RunMode::Incremental).unwrap();
    store.merge_points(second).unwrap();
    stay::run(&mut store, &mut sink, &config, RunMode::Incremental).unwrap();
    let incremental = store.stays(StayStrategy::Spatial).unwrap();

    stay::run(&mut store, &mut sink, &config, RunMode::FullRecompute).unwrap();
    let full = store.stays(StayStrategy::Spatial).unwrap();
    (store, incremental, full)
}

#[test]
fn test_stay_continues_into_the_next_run() {
    // Four hours in one place, the last 80 minutes arriving later.
    let mut points: Vec<Point> = (0..13)
        .map(|i| clean(point_at(i + 1, T0 + i as i64 * 20 * MINUTE, (i % 3) as f64 * 10.0, 0.0)))
        .collect();
    let later = points.split_off(8);

    let (store, incremental, full) = split_runs(points, later);
    assert_eq!(spans(&full), vec![(T0, T0 + 4 * HOUR, 13)]);
    assert_eq!(spans(&incremental), spans(&full));
    assert_eq!(incremental[0].center_lat, full[0].center_lat);
    assert!(store.points().iter().all(|p| p.stay == Some(StayMembership::Member(full[0].id))));
}

#[test]
fn test_short_group_at_the_end_can_still_become_a_stay() {
    // Home for three hours, then 40 minutes somewhere else: too short so far.
    let mut first: Vec<Point> = (0..10)
        .map(|i| clean(point_at(i + 1, T0 + i as i64 * 20 * MINUTE, 0.0, 0.0)))
        .collect();
    first.extend((0..3).map(|i| clean(point_at(i + 11, T0 + (200 + i as i64 * 20) * MINUTE, 2000.0, 0.0))));
    // Another 100 minutes there.
    let second: Vec<Point> = (0..6)
        .map(|i| clean(point_at(i + 14, T0 + (260 + i as i64 * 20) * MINUTE, 2000.0, 0.0)))
        .collect();

    let (store, incremental, full) = split_runs(first, second);
    assert_eq!(spans(&full), vec![(T0, T0 + 3 * HOUR, 10), (T0 + 200 * MINUTE, T0 + 6 * HOUR, 9)]);
    assert_eq!(spans(&incremental), spans(&full));
    assert!(store.points().iter().all(|p| matches!(p.stay, Some(StayMembership::Member(_)))));
}

#[test]
fn test_nothing_is_reopened_without_new_points() {
    let points: Vec<Point> = dwell_then_leave().into_iter().map(clean).collect();
    let mut store = MemoryStore::new(points).unwrap();
    let mut sink = RecordingSink::default();
    let config = PipelineConfig::default();
    stay::run(&mut store, &mut sink, &config, RunMode::Incremental).unwrap();
    let before = store.stays(StayStrategy::Spatial).unwrap();

    let commit = stay::reopen_open_group(&store, StayStrategy::Spatial, Eligibility::Clean).unwrap();
    assert!(commit.is_empty());

    let again = stay::run(&mut store, &mut sink, &config, RunMode::Incremental).unwrap();
    assert_eq!(again.processed, 0);
    assert_eq!(store.stays(StayStrategy::Spatial).unwrap(), before);
}
