use anyhow::Result;
use log::warn;
use logging_timer::time;

use crate::{
    config::{ModeConfig, PipelineConfig},
    geo_utils::{haversine_metres, mps_to_kmh, speed_kmh},
    model::{ModeAnnotation, ModeReason, Point, PointId, Segment, Timestamp, TransportMode},
    runner::{run_stage, BatchOutcome, RunMode},
    store::{Commit, Eligibility, NewSegment, PointQuery, PointStore, SortKey, StageKind},
    task::{RunSummary, TaskSink},
};

/// The result of classifying one point.
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub mode: TransportMode,
    pub confidence: f64,
    pub reasons: Vec<ModeReason>,
    pub speed_kmh: f64,
}

pub struct ModeClassifier {
    config: ModeConfig,
}

impl ModeClassifier {
    pub fn new(config: ModeConfig) -> Self {
        Self { config }
    }

    /// The larger of the recorded speed and the speed implied by the
    /// distance from the previous point, in kmh.
    pub fn point_speed_kmh(prev: Option<&Point>, point: &Point) -> f64 {
        let recorded = point
            .speed
            .filter(|s| s.is_finite() && *s > 0.0)
            .map_or(0.0, mps_to_kmh);

        let computed = prev.map_or(0.0, |prev| {
            let metres = haversine_metres(prev.lat, prev.lon, point.lat, point.lon);
            speed_kmh(metres, (point.timestamp - prev.timestamp) as f64)
        });

        recorded.max(computed)
    }

    /// True only when both points carry a province and they differ.
    pub fn crosses_province(prev: Option<&Point>, point: &Point) -> bool {
        match (prev.and_then(|p| p.admin.province.as_deref()), point.admin.province.as_deref()) {
            (Some(a), Some(b)) => !a.is_empty() && !b.is_empty() && a != b,
            _ => false,
        }
    }

    pub fn classify(&self, prev: Option<&Point>, point: &Point) -> Classification {
        let speed = Self::point_speed_kmh(prev, point);
        let altitude = point.altitude.unwrap_or(0.0);
        self.classify_speed(speed, altitude, Self::crosses_province(prev, point))
    }

    /// The rule cascade. The first matching rule wins; the speed ranges
    /// overlap, so the order matters.
    pub fn classify_speed(&self, speed_kmh: f64, altitude_m: f64, crosses_province: bool) -> Classification {
        let c = &self.config;
        let (mode, confidence, reasons) = if altitude_m > c.flight_min_altitude_m
            && c.flight_speed_kmh.contains(speed_kmh)
        {
            (
                TransportMode::Flight,
                0.95,
                vec![ModeReason::HighAltitude, ModeReason::FlightSpeedRange],
            )
        } else if c.train_speed_kmh.contains(speed_kmh) {
            if crosses_province {
                (
                    TransportMode::Train,
                    0.85,
                    vec![ModeReason::TrainSpeedRange, ModeReason::CrossesProvince],
                )
            } else {
                (TransportMode::Car, 0.70, vec![ModeReason::HighSpeed])
            }
        } else if c.car_speed_kmh.contains_half_open(speed_kmh) {
            (TransportMode::Car, 0.75, vec![ModeReason::CarSpeedRange])
        } else if c.walk_speed_kmh.contains_half_open(speed_kmh) {
            (TransportMode::Walk, 0.80, vec![ModeReason::WalkingSpeed])
        } else if speed_kmh < c.stay_max_speed_kmh {
            (TransportMode::Stay, 0.90, vec![ModeReason::Stationary])
        } else {
            (TransportMode::Unknown, 0.50, vec![ModeReason::NoMatchingRule])
        };

        Classification {
            mode,
            confidence,
            reasons,
            speed_kmh,
        }
    }

    /// Classifies the points in order and groups them into segments. `prev`
    /// is the clean point immediately before the batch, if any. The last
    /// segment is closed at the end of the batch. Returns the segments and
    /// the number of points skipped for unusable coordinates.
    pub fn segment_batch(&self, prev: Option<&Point>, points: &[Point]) -> (Vec<NewSegment>, usize) {
        let mut builder = SegmentBuilder::default();
        let mut prev = prev.filter(|p| p.has_valid_coordinates());
        let mut skipped = 0;

        for point in points {
            if !point.has_valid_coordinates() {
                warn!("{}: skipping point {}: missing or invalid coordinates", StageKind::TransportModes, point.id);
                skipped += 1;
                continue;
            }

            let classification = self.classify(prev, point);
            builder.push(point, classification);
            prev = Some(point);
        }

        (builder.finish(), skipped)
    }
}

/// The segment currently being accumulated.
#[derive(Debug)]
struct OpenSegment {
    mode: TransportMode,
    start_point_id: PointId,
    start_time: Timestamp,
    end_point_id: PointId,
    end_time: Timestamp,
    last_position: (f64, f64),
    distance_m: f64,
    max_speed_kmh: f64,
    confidence: f64,
    reasons: Vec<ModeReason>,
    members: Vec<(PointId, ModeAnnotation)>,
}

impl OpenSegment {
    fn open(point: &Point, classification: Classification) -> Self {
        let mut segment = Self {
            mode: classification.mode,
            start_point_id: point.id,
            start_time: point.timestamp,
            end_point_id: point.id,
            end_time: point.timestamp,
            last_position: (point.lat, point.lon),
            distance_m: 0.0,
            max_speed_kmh: 0.0,
            confidence: 0.0,
            reasons: Vec::new(),
            members: Vec::new(),
        };
        segment.add(point, classification, 0.0);
        segment
    }

    fn extend(&mut self, point: &Point, classification: Classification) {
        let (lat, lon) = self.last_position;
        let metres = haversine_metres(lat, lon, point.lat, point.lon);
        self.add(point, classification, metres);
    }

    fn add(&mut self, point: &Point, classification: Classification, metres: f64) {
        self.end_point_id = point.id;
        self.end_time = point.timestamp;
        self.last_position = (point.lat, point.lon);
        self.distance_m += metres;
        self.max_speed_kmh = self.max_speed_kmh.max(classification.speed_kmh);
        self.confidence = classification.confidence;
        self.reasons = classification.reasons.clone();
        self.members.push((
            point.id,
            ModeAnnotation {
                mode: classification.mode,
                confidence: classification.confidence,
                reasons: classification.reasons,
                speed_kmh: classification.speed_kmh,
                segment_id: 0,
            },
        ));
    }

    fn close(self) -> NewSegment {
        let duration_s = self.end_time - self.start_time;
        NewSegment {
            segment: Segment {
                id: 0,
                mode: self.mode,
                start_point_id: self.start_point_id,
                end_point_id: self.end_point_id,
                start_time: self.start_time,
                end_time: self.end_time,
                point_count: self.members.len(),
                distance_m: self.distance_m,
                duration_s,
                avg_speed_kmh: speed_kmh(self.distance_m, duration_s as f64),
                max_speed_kmh: self.max_speed_kmh,
                confidence: self.confidence,
                reasons: self.reasons,
            },
            members: self.members,
        }
    }
}

/// The segmentation state machine: either no segment is open, or one is
/// accumulating points of a single mode.
#[derive(Debug, Default)]
pub struct SegmentBuilder {
    current: Option<OpenSegment>,
    finished: Vec<NewSegment>,
}

impl SegmentBuilder {
    pub fn push(&mut self, point: &Point, classification: Classification) {
        match self.current.as_mut() {
            Some(open) if open.mode == classification.mode => open.extend(point, classification),
            _ => {
                if let Some(open) = self.current.take() {
                    self.finished.push(open.close());
                }
                self.current = Some(OpenSegment::open(point, classification));
            }
        }
    }

    /// Closes any open segment and returns everything built so far.
    pub fn finish(mut self) -> Vec<NewSegment> {
        if let Some(open) = self.current.take() {
            self.finished.push(open.close());
        }
        self.finished
    }
}

/// Classifies every clean point without a mode and writes the segments.
#[time]
pub fn run<S: PointStore + ?Sized>(
    store: &mut S,
    sink: &mut dyn TaskSink,
    config: &PipelineConfig,
    mode: RunMode,
) -> Result<RunSummary> {
    let classifier = ModeClassifier::new(config.modes.clone());
    let query = PointQuery::pending(Eligibility::Clean, StageKind::TransportModes);
    let batch_size = config.batch_size;
    let mut cursor: Option<SortKey> = None;

    run_stage(
        StageKind::TransportModes,
        store,
        sink,
        mode,
        |s| s.count(&query),
        |s| {
            let batch = s.scan(&query, cursor, batch_size)?;
            let (Some(first), Some(last)) = (batch.first(), batch.last()) else {
                return Ok(None);
            };
            cursor = Some(last.sort_key());

            let prev = s.preceding(Eligibility::Clean, first.sort_key(), 1)?;
            let (segments, skipped) = classifier.segment_batch(prev.last(), &batch);

            Ok(Some(BatchOutcome {
                processed: batch.len() - skipped,
                failed: skipped,
                commit: Commit {
                    segments,
                    ..Default::default()
                },
            }))
        },
    )
}
