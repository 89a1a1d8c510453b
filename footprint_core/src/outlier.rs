use anyhow::Result;
use logging_timer::time;

use crate::{
    config::{OutlierConfig, PipelineConfig},
    geo_utils::{centroid, distance_between, speed_kmh},
    model::{OutlierAnnotation, OutlierReason, Point, PointId},
    runner::{partition_outcomes, run_stage, BatchOutcome, Outcome, RunMode, SkipReason},
    store::{Commit, Eligibility, PointQuery, PointStore, PointWrite, SortKey, StageKind},
    task::{RunSummary, TaskSink},
};

pub struct OutlierDetector {
    config: OutlierConfig,
}

impl OutlierDetector {
    pub fn new(config: OutlierConfig) -> Self {
        Self { config }
    }

    /// Number of preceding points the rules can make use of.
    pub fn history_len(&self) -> usize {
        self.config.static_drift_window.saturating_sub(1).max(2)
    }

    /// Annotates a batch of points. `history` holds the points immediately
    /// before the batch, oldest first. Points without usable coordinates are
    /// skipped and do not take part in any other point's window.
    pub fn annotate_batch(
        &self,
        history: &[Point],
        batch: &[Point],
    ) -> Vec<(PointId, Outcome<OutlierAnnotation>)> {
        let keep = self.history_len();
        let mut window: Vec<&Point> = history.iter().filter(|p| p.has_valid_coordinates()).collect();
        if window.len() > keep {
            window.drain(..window.len() - keep);
        }

        let mut results = Vec::with_capacity(batch.len());
        for point in batch {
            if !point.has_valid_coordinates() {
                results.push((point.id, Outcome::Skipped(SkipReason::InvalidCoordinates)));
                continue;
            }
            if !point.has_valid_timestamp() {
                results.push((point.id, Outcome::Skipped(SkipReason::InvalidTimestamp)));
                continue;
            }

            results.push((point.id, Outcome::Done(self.evaluate(&window, point))));

            window.push(point);
            if window.len() > keep {
                window.remove(0);
            }
        }

        results
    }

    /// Evaluates every rule for `point`, given the points before it (oldest
    /// first). Rules that need more history than is available are not evaluated.
    pub fn evaluate(&self, history: &[&Point], point: &Point) -> OutlierAnnotation {
        let mut annotation = OutlierAnnotation::default();

        if self.is_low_accuracy(point) {
            annotation.reasons.insert(OutlierReason::LowAccuracy);
        }

        if let Some(prev) = history.last() {
            if self.is_jump(prev, point) {
                annotation.reasons.insert(OutlierReason::Jump);
            }
        }

        if history.len() >= 2 {
            let a = history[history.len() - 2];
            let b = history[history.len() - 1];
            if self.is_backtrack(a, b, point) {
                annotation.reasons.insert(OutlierReason::Backtrack);
            }
        }

        let window_len = self.config.static_drift_window;
        if history.len() + 1 >= self.config.static_drift_min_points {
            let start = (history.len() + 1).saturating_sub(window_len);
            let mut window: Vec<&Point> = history[start..].to_vec();
            window.push(point);
            if self.is_static_drift(&window) {
                annotation.reasons.insert(OutlierReason::StaticDrift);
            }
        }

        annotation
    }

    pub fn is_low_accuracy(&self, point: &Point) -> bool {
        point
            .accuracy
            .map_or(false, |accuracy| accuracy > self.config.accuracy_threshold_m)
    }

    /// An implausible speed from `prev` to `point`. Pairs separated by a long
    /// data gap, and pairs that are both at flying altitude, are not checked.
    pub fn is_jump(&self, prev: &Point, point: &Point) -> bool {
        let elapsed = point.timestamp - prev.timestamp;
        if elapsed > self.config.jump_max_gap_s {
            return false;
        }

        let flying = |p: &Point| p.altitude.map_or(false, |alt| alt > self.config.jump_exempt_altitude_m);
        if flying(prev) && flying(point) {
            return false;
        }

        let metres = distance_between(prev.position(), point.position());
        speed_kmh(metres, elapsed as f64) > self.config.max_speed_kmh
    }

    /// The A -> B -> A' pattern: a quick return to where we just were via a
    /// point that is genuinely somewhere else.
    pub fn is_backtrack(&self, a: &Point, b: &Point, a_prime: &Point) -> bool {
        let dist_aa = distance_between(a.position(), a_prime.position());
        if dist_aa > self.config.backtrack_distance_m {
            return false;
        }

        if a_prime.timestamp - a.timestamp > self.config.backtrack_time_s {
            return false;
        }

        let dist_ab = distance_between(a.position(), b.position());
        let dist_ba = distance_between(b.position(), a_prime.position());
        dist_ab > self.config.backtrack_min_leg_m && dist_ba > self.config.backtrack_min_leg_m
    }

    /// Every point close to the window's centroid, yet not all at exactly
    /// the same coordinates.
    pub fn is_static_drift(&self, window: &[&Point]) -> bool {
        if window.len() < self.config.static_drift_min_points {
            return false;
        }

        let positions: Vec<_> = window.iter().map(|p| p.position()).collect();
        let Some(center) = centroid(&positions) else {
            return false;
        };

        let all_close = positions
            .iter()
            .all(|p| distance_between(center, *p) < self.config.static_drift_distance_m);

        let first = positions[0];
        let coords_vary = positions.iter().any(|p| *p != first);

        all_close && coords_vary
    }
}

/// Runs outlier detection over every observed point not yet annotated
/// (or over all observed points for a full recompute).
#[time]
pub fn run<S: PointStore + ?Sized>(
    store: &mut S,
    sink: &mut dyn TaskSink,
    config: &PipelineConfig,
    mode: RunMode,
) -> Result<RunSummary> {
    let detector = OutlierDetector::new(config.outliers.clone());
    let query = PointQuery::pending(Eligibility::Observed, StageKind::Outliers);
    let batch_size = config.batch_size;
    let mut cursor: Option<SortKey> = None;

    run_stage(
        StageKind::Outliers,
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

            // Fetch extra in case some of the preceding points are unusable.
            let history = s.preceding(Eligibility::Observed, first.sort_key(), detector.history_len() * 2)?;

            let outcomes = detector.annotate_batch(&history, &batch);
            let (done, failed) = partition_outcomes(StageKind::Outliers, outcomes);

            Ok(Some(BatchOutcome {
                processed: done.len(),
                failed,
                commit: Commit {
                    writes: done
                        .into_iter()
                        .map(|(id, annotation)| PointWrite::Outlier(id, annotation))
                        .collect(),
                    ..Default::default()
                },
            }))
        },
    )
}
