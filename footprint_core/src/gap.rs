use std::{collections::BTreeSet, ops::Range};

use anyhow::Result;
use log::debug;
use logging_timer::time;

use crate::{
    config::{GapConfig, PipelineConfig},
    geo_utils::{distance_between, speed_kmh},
    model::{Point, Provenance, SyntheticOrigin, SyntheticSource},
    runner::{partition_outcomes, run_stage, BatchOutcome, Outcome, RunMode, SkipReason},
    store::{Commit, Eligibility, PointQuery, PointStore, PointWrite, SortKey, StageKind},
    task::{RunSummary, TaskSink},
};

// A long silence crossed at speed is filled with synthetic points when the
// points around it look like a flight or a train journey.
pub struct GapCompleter {
    config: GapConfig,
}

impl GapCompleter {
    pub fn new(config: GapConfig) -> Self {
        Self { config }
    }

    fn pair_speed_kmh(a: &Point, b: &Point) -> f64 {
        speed_kmh(distance_between(a.position(), b.position()), (b.timestamp - a.timestamp) as f64)
    }

    /// A long silence covered at high speed.
    pub fn is_gap(&self, a: &Point, b: &Point) -> bool {
        b.timestamp - a.timestamp > self.config.gap_threshold_s
            && Self::pair_speed_kmh(a, b) > self.config.high_speed_kmh
    }

    /// Decides how a gap was travelled from the points around it. Returns
    /// `None` when neither flight nor train is evident.
    pub fn classify(&self, window: &[&Point]) -> Option<SyntheticSource> {
        if window.len() < 2 {
            return None;
        }

        let speeds: Vec<f64> = window.windows(2).map(|w| Self::pair_speed_kmh(w[0], w[1])).collect();
        let avg_speed = speeds.iter().sum::<f64>() / speeds.len() as f64;
        // Altitude is taken at the arriving end of each pair.
        let avg_altitude =
            window[1..].iter().map(|p| p.altitude.unwrap_or(0.0)).sum::<f64>() / speeds.len() as f64;
        let provinces: BTreeSet<&str> = window
            .iter()
            .filter_map(|p| p.admin.province.as_deref())
            .filter(|s| !s.is_empty())
            .collect();

        if avg_altitude > self.config.flight_min_altitude_m && self.config.flight_speed_kmh.contains(avg_speed) {
            Some(SyntheticSource::FlightInterpolation)
        } else if self.config.train_speed_kmh.contains(avg_speed) && provinces.len() > 1 {
            Some(SyntheticSource::TrainInterpolation)
        } else {
            None
        }
    }

    /// Altitude of a flight at `ratio` of the way through the gap: a climb,
    /// a cruise and a descent.
    pub fn flight_altitude(&self, ratio: f64) -> f64 {
        let cruise = self.config.cruise_altitude_m;
        let phase = self.config.climb_fraction;
        if ratio < phase {
            cruise * ratio / phase
        } else if ratio > 1.0 - phase {
            cruise * (1.0 - ratio) / phase
        } else {
            cruise
        }
    }

    /// Synthetic points spread evenly between `start` and `end`, one per
    /// cadence interval of the gap and at least one.
    pub fn interpolate(&self, start: &Point, end: &Point, source: SyntheticSource) -> Vec<Point> {
        let elapsed = end.timestamp - start.timestamp;
        let count = (elapsed / self.config.cadence_s).max(1);

        (1..=count)
            .map(|i| {
                let ratio = i as f64 / (count + 1) as f64;
                let mut point = Point::new(
                    0,
                    start.timestamp + elapsed * i / (count + 1),
                    start.lon + (end.lon - start.lon) * ratio,
                    start.lat + (end.lat - start.lat) * ratio,
                );
                point.altitude = match source {
                    SyntheticSource::FlightInterpolation => Some(self.flight_altitude(ratio)),
                    SyntheticSource::TrainInterpolation => match (start.altitude, end.altitude) {
                        (Some(a), Some(b)) => Some(a + (b - a) * ratio),
                        _ => None,
                    },
                };
                point.provenance = Some(Provenance::Synthetic(SyntheticOrigin {
                    source,
                    start_id: start.id,
                    end_id: end.id,
                    ratio,
                }));
                point
            })
            .collect()
    }

    /// Fills the gaps ending at the points with indices in `ends`, i.e. the
    /// pairs (i - 1, i). Points outside that range only serve as context
    /// for classification.
    pub fn complete(&self, points: &[&Point], ends: Range<usize>) -> Vec<Point> {
        let context = self.config.context_points;
        let mut synthetic = Vec::new();

        for i in ends.start.max(1)..ends.end.min(points.len()) {
            let (a, b) = (points[i - 1], points[i]);
            if !self.is_gap(a, b) {
                continue;
            }

            let lo = (i - 1).saturating_sub(context);
            let hi = (i + context).min(points.len() - 1);
            match self.classify(&points[lo..=hi]) {
                Some(source) => {
                    let filled = self.interpolate(a, b, source);
                    debug!(
                        "Filling {}s gap between points {} and {} with {} {source} points",
                        b.timestamp - a.timestamp,
                        a.id,
                        b.id,
                        filled.len()
                    );
                    synthetic.extend(filled);
                }
                None => debug!("Gap between points {} and {} left unfilled", a.id, b.id),
            }
        }

        synthetic
    }
}

/// Marks every observed point not yet seen as observed, and fills the gaps
/// that end at those points.
#[time]
pub fn run<S: PointStore + ?Sized>(
    store: &mut S,
    sink: &mut dyn TaskSink,
    config: &PipelineConfig,
    mode: RunMode,
) -> Result<RunSummary> {
    let completer = GapCompleter::new(config.gaps.clone());
    let context = config.gaps.context_points;
    let query = PointQuery::pending(Eligibility::Observed, StageKind::GapCompletion);
    let batch_size = config.batch_size;
    let mut cursor: Option<SortKey> = None;

    run_stage(
        StageKind::GapCompletion,
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

            let valid_tail = |points: Vec<Point>, n: usize, from_end: bool| -> Vec<Point> {
                let valid: Vec<Point> = points.into_iter().filter(Point::has_valid_coordinates).collect();
                if from_end {
                    valid[valid.len().saturating_sub(n)..].to_vec()
                } else {
                    valid.into_iter().take(n).collect()
                }
            };
            // Fetch extra in case some neighbours are unusable.
            let history = valid_tail(
                s.preceding(Eligibility::Observed, first.sort_key(), (context + 1) * 2)?,
                context + 1,
                true,
            );
            let lookahead = valid_tail(
                s.following(Eligibility::Observed, last.sort_key(), context * 2)?,
                context,
                false,
            );

            let outcomes: Vec<_> = batch
                .iter()
                .map(|p| {
                    let outcome = if p.has_valid_coordinates() {
                        Outcome::Done(Provenance::Observed)
                    } else {
                        Outcome::Skipped(SkipReason::InvalidCoordinates)
                    };
                    (p.id, outcome)
                })
                .collect();
            let (marked, failed) = partition_outcomes(StageKind::GapCompletion, outcomes);

            let sequence: Vec<&Point> = history
                .iter()
                .chain(batch.iter().filter(|p| p.has_valid_coordinates()))
                .chain(lookahead.iter())
                .collect();
            let batch_end = sequence.len() - lookahead.len();
            let synthetic = completer.complete(&sequence, history.len()..batch_end);

            Ok(Some(BatchOutcome {
                processed: marked.len(),
                failed,
                commit: Commit {
                    writes: marked
                        .into_iter()
                        .map(|(id, provenance)| PointWrite::Provenance(id, provenance))
                        .collect(),
                    synthetic,
                    ..Default::default()
                },
            }))
        },
    )
}
