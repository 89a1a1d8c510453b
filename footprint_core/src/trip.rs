use std::collections::{BTreeMap, HashMap};

use anyhow::Result;
use log::{debug, warn};
use logging_timer::time;
use time::UtcOffset;

use crate::{
    config::{PipelineConfig, TripConfig},
    formatting::{is_weekend, local_date, to_local},
    geo_utils::haversine_metres,
    model::{
        ActivityType, Segment, StayId, StaySegment, Timestamp, TransportMode, Trip, TripId, TripPurpose,
        TripType,
    },
    runner::{run_stage, BatchOutcome, RunMode},
    store::{Commit, PointStore, StageKind},
    task::{RunSummary, TaskSink},
};

/// The values the purpose rules look at.
#[derive(Debug, Clone, PartialEq)]
pub struct TripFeatures {
    /// Local hour of the trip start.
    pub hour: u8,
    pub weekend: bool,
    pub distance_km: f64,
    pub duration_hours: f64,
    pub same_city: bool,
}

pub struct TripConstructor {
    config: TripConfig,
    offset: UtcOffset,
}

impl TripConstructor {
    pub fn new(config: TripConfig, offset: UtcOffset) -> Self {
        Self { config, offset }
    }

    /// Builds the trip from `origin` to `dest`. `segments` should be those
    /// lying within the gap between the stays; any outside it are ignored.
    pub fn construct(
        &self,
        origin: &StaySegment,
        dest: &StaySegment,
        segments: &[Segment],
        trip_number: u32,
    ) -> Result<Trip> {
        let start_time = origin.end_time;
        let end_time = dest.start_time;
        let inside: Vec<&Segment> = segments
            .iter()
            .filter(|s| s.start_time >= start_time && s.end_time <= end_time)
            .collect();

        let distance_m = if inside.is_empty() {
            haversine_metres(origin.center_lat, origin.center_lon, dest.center_lat, dest.center_lon)
        } else {
            inside.iter().map(|s| s.distance_m).sum()
        };
        let duration_s = end_time - start_time;

        let start = to_local(start_time, self.offset)?;
        let features = TripFeatures {
            hour: start.hour(),
            weekend: is_weekend(&start),
            distance_km: distance_m / 1000.0,
            duration_hours: duration_s as f64 / 3600.0,
            same_city: origin.admin.city == dest.admin.city,
        };
        let (purpose, purpose_confidence) = infer_purpose(&features);

        Ok(Trip {
            id: 0,
            origin_stay_id: origin.id,
            dest_stay_id: dest.id,
            date: start.date().to_string(),
            trip_number,
            start_time,
            end_time,
            duration_s,
            distance_m,
            segment_count: inside.len(),
            modes: inside.iter().map(|s| s.mode).collect(),
            primary_mode: primary_mode(&inside),
            trip_type: self.trip_type(origin, dest),
            purpose,
            purpose_confidence,
        })
    }

    /// COMMUTE between home and work in either direction, ROUND_TRIP when
    /// both ends share an area at the configured level, otherwise ONE_WAY.
    pub fn trip_type(&self, origin: &StaySegment, dest: &StaySegment) -> TripType {
        let activity = |s: &StaySegment| s.activity.as_ref().map(|a| a.activity_type);
        match (activity(origin), activity(dest)) {
            (Some(ActivityType::Home), Some(ActivityType::Work))
            | (Some(ActivityType::Work), Some(ActivityType::Home)) => return TripType::Commute,
            _ => {}
        }

        let level = self.config.round_trip_level;
        match (origin.admin.at(level), dest.admin.at(level)) {
            (Some(a), Some(b)) if a == b => TripType::RoundTrip,
            _ => TripType::OneWay,
        }
    }
}

/// Stored trips whose type no longer follows from the current activities
/// of their stays, with the type they should have.
pub fn stale_trip_types(
    constructor: &TripConstructor,
    stays: &[StaySegment],
    trips: &[Trip],
) -> Vec<(TripId, TripType)> {
    let by_id: HashMap<StayId, &StaySegment> = stays.iter().map(|s| (s.id, s)).collect();
    trips
        .iter()
        .filter_map(|trip| {
            let origin = by_id.get(&trip.origin_stay_id)?;
            let dest = by_id.get(&trip.dest_stay_id)?;
            let trip_type = constructor.trip_type(origin, dest);
            (trip_type != trip.trip_type).then_some((trip.id, trip_type))
        })
        .collect()
}

/// The purpose rules, tried in order.
pub fn infer_purpose(f: &TripFeatures) -> (TripPurpose, f64) {
    let hour = f.hour;

    if !f.weekend && f.same_city && f.distance_km < 20.0 && ((7..=9).contains(&hour) || (17..=19).contains(&hour)) {
        return (TripPurpose::Commute, 0.8);
    }

    if !f.weekend && (9..=17).contains(&hour) && f.duration_hours > 2.0 {
        return (TripPurpose::Work, 0.7);
    }

    if (f.weekend || hour >= 19 || hour <= 7) && f.distance_km < 50.0 {
        return (TripPurpose::Leisure, 0.7);
    }

    if f.same_city && f.distance_km < 10.0 && f.duration_hours < 2.0 && (10..=20).contains(&hour) {
        return (TripPurpose::Shopping, 0.6);
    }

    if f.distance_km > 100.0 || !f.same_city {
        return (TripPurpose::Travel, 0.8);
    }

    (TripPurpose::Other, 0.4)
}

/// The mode covering the greatest distance. Ties go to the mode that
/// sorts first.
pub fn primary_mode(segments: &[&Segment]) -> Option<TransportMode> {
    let mut by_mode: BTreeMap<TransportMode, f64> = BTreeMap::new();
    for s in segments {
        *by_mode.entry(s.mode).or_insert(0.0) += s.distance_m;
    }

    let mut best: Option<(TransportMode, f64)> = None;
    for (mode, distance) in by_mode {
        if best.map_or(true, |(_, d)| distance > d) {
            best = Some((mode, distance));
        }
    }
    best.map(|(mode, _)| mode)
}

/// The highest trip number used on each date.
fn trips_per_date(trips: &[Trip]) -> HashMap<String, u32> {
    let mut counts = HashMap::new();
    for trip in trips {
        let n = counts.entry(trip.date.clone()).or_insert(0);
        *n = (*n).max(trip.trip_number);
    }
    counts
}

/// Consecutive stay pairs whose origin has no trip yet, after the cursor.
fn pending_pairs(stays: &[StaySegment], after: Option<(Timestamp, u64)>) -> Vec<(usize, usize)> {
    stays
        .windows(2)
        .enumerate()
        .filter(|(_, w)| w[0].outgoing_trip.is_none())
        .filter(|(_, w)| after.map_or(true, |key| (w[0].start_time, w[0].id) > key))
        .map(|(i, _)| (i, i + 1))
        .collect()
}

/// Brings the types of stored trips up to date with the latest activities,
/// then links every consecutive pair of stays of the configured strategy
/// that has no trip yet.
#[time]
pub fn run<S: PointStore + ?Sized>(
    store: &mut S,
    sink: &mut dyn TaskSink,
    config: &PipelineConfig,
    mode: RunMode,
) -> Result<RunSummary> {
    let constructor = TripConstructor::new(config.trips.clone(), config.utc_offset()?);
    let strategy = config.stays.strategy;
    let batch_size = config.batch_size;
    let mut cursor: Option<(Timestamp, u64)> = None;
    let mut per_date: Option<HashMap<String, u32>> = None;
    let mut retyped = false;

    run_stage(
        StageKind::Trips,
        store,
        sink,
        mode,
        |s| Ok(pending_pairs(&s.stays(strategy)?, None).len()),
        |s| {
            if !retyped {
                retyped = true;
                let trip_types = stale_trip_types(&constructor, &s.stays(strategy)?, &s.trips()?);
                if !trip_types.is_empty() {
                    debug!("Updating the type of {} trips", trip_types.len());
                    return Ok(Some(BatchOutcome {
                        commit: Commit {
                            trip_types,
                            ..Default::default()
                        },
                        ..Default::default()
                    }));
                }
            }

            let mut counts = match per_date.take() {
                Some(counts) => counts,
                None => trips_per_date(&s.trips()?),
            };

            let stays = s.stays(strategy)?;
            let pairs = pending_pairs(&stays, cursor);
            if pairs.is_empty() {
                return Ok(None);
            }

            let mut trips = Vec::new();
            let mut failed = 0;
            for &(o, d) in pairs.iter().take(batch_size) {
                let (origin, dest) = (&stays[o], &stays[d]);
                cursor = Some((origin.start_time, origin.id));

                let segments = s.segments_within(origin.end_time, dest.start_time)?;
                let date = match local_date(origin.end_time, constructor.offset) {
                    Ok(date) => date,
                    Err(e) => {
                        warn!("{}: skipping stay {}: {e:#}", StageKind::Trips, origin.id);
                        failed += 1;
                        continue;
                    }
                };
                let number = counts.entry(date).or_insert(0);
                *number += 1;

                match constructor.construct(origin, dest, &segments, *number) {
                    Ok(trip) => trips.push(trip),
                    Err(e) => {
                        warn!("{}: skipping stay {}: {e:#}", StageKind::Trips, origin.id);
                        failed += 1;
                    }
                }
            }

            per_date = Some(counts);
            Ok(Some(BatchOutcome {
                processed: trips.len(),
                failed,
                commit: Commit {
                    trips,
                    ..Default::default()
                },
            }))
        },
    )
}
