pub mod activity;
pub mod density;
pub mod grouping;

use anyhow::Result;
use log::{debug, info};
use logging_timer::time;

use crate::{
    config::{PipelineConfig, StayConfig, StayInput},
    geo_utils::{centroid, max_distance_from},
    model::{Point, PointId, StayMembership, StaySegment, StayStrategy},
    runner::{run_stage, BatchOutcome, RunMode},
    store::{Commit, Eligibility, NewStay, PointQuery, PointStore, PointWrite, SortKey, StageKind},
    task::{RunSummary, TaskSink},
};

use self::{
    activity::annotate_stays,
    density::{dbscan, split_visits},
    grouping::{GroupRule, Grouper},
};

/// Stays found so far, and the points that were looked at but belong to none.
#[derive(Debug, Default)]
pub struct StayDetection {
    pub stays: Vec<NewStay>,
    pub unassigned: Vec<PointId>,
}

impl StayDetection {
    /// Number of points this detection will write to.
    pub fn point_count(&self) -> usize {
        self.unassigned.len() + self.stays.iter().map(|s| s.members.len()).sum::<usize>()
    }

    pub fn into_commit(self) -> Commit {
        Commit {
            writes: self
                .unassigned
                .into_iter()
                .map(|id| PointWrite::Stay(id, StayMembership::Unassigned))
                .collect(),
            stays: self.stays,
            ..Default::default()
        }
    }
}

// SPATIAL and ADMIN group points one after another, DENSITY clusters them
// with DBSCAN and then splits each cluster into separate visits.
pub struct StayDetector {
    config: StayConfig,
}

impl StayDetector {
    pub fn new(config: StayConfig) -> Self {
        Self { config }
    }

    pub fn strategy(&self) -> StayStrategy {
        self.config.strategy
    }

    /// The sequential grouper for SPATIAL and ADMIN, `None` for DENSITY.
    pub fn grouper(&self) -> Option<Grouper> {
        match self.config.strategy {
            StayStrategy::Spatial => Some(Grouper::new(GroupRule::Radius(self.config.spatial_radius_m))),
            StayStrategy::Admin(level) => Some(Grouper::new(GroupRule::Admin(level))),
            StayStrategy::Density => None,
        }
    }

    /// Builds the stay for a group of points in time order. The group
    /// must contain at least one point.
    pub fn build_stay(&self, members: &[&Point]) -> StaySegment {
        let positions: Vec<_> = members.iter().map(|p| p.position()).collect();
        let first = members[0];
        let last = members[members.len() - 1];
        let center = centroid(&positions).unwrap_or_else(|| first.position());
        let confidence = (members.len() as f64 / self.config.confidence_saturation as f64).min(1.0);

        StaySegment {
            id: 0,
            strategy: self.config.strategy,
            start_time: first.timestamp,
            end_time: last.timestamp,
            duration_s: last.timestamp - first.timestamp,
            center_lat: center.y(),
            center_lon: center.x(),
            radius_m: max_distance_from(center, &positions),
            point_count: members.len(),
            admin: first.admin.clone(),
            confidence,
            activity: None,
            outgoing_trip: None,
        }
    }

    /// A group becomes a stay when it has at least two points and spans at
    /// least the minimum duration.
    pub fn qualifies(&self, members: &[&Point]) -> bool {
        match (members.first(), members.last()) {
            (Some(first), Some(last)) => {
                members.len() >= 2 && last.timestamp - first.timestamp >= self.config.min_duration_s
            }
            _ => false,
        }
    }

    /// Records a closed group as a stay, or its points as unassigned.
    pub fn absorb(&self, detection: &mut StayDetection, members: &[&Point]) {
        if self.qualifies(members) {
            detection.stays.push(NewStay {
                stay: self.build_stay(members),
                members: members.iter().map(|p| p.id).collect(),
            });
        } else {
            detection.unassigned.extend(members.iter().map(|p| p.id));
        }
    }

    /// Detects stays over a complete, time-ordered set of points.
    pub fn detect(&self, points: &[Point]) -> StayDetection {
        let mut detection = StayDetection::default();

        match self.grouper() {
            Some(mut grouper) => {
                for point in points {
                    if let Some(group) = grouper.push(point.clone()) {
                        self.absorb(&mut detection, &group.iter().collect::<Vec<_>>());
                    }
                }
                if let Some(group) = grouper.finish() {
                    self.absorb(&mut detection, &group.iter().collect::<Vec<_>>());
                }
            }
            None => {
                let labels = dbscan(points, self.config.eps_m, self.config.min_points);
                let mut in_visit = vec![false; points.len()];
                for visit in split_visits(points, &labels, self.config.max_time_gap_s) {
                    visit.iter().for_each(|&i| in_visit[i] = true);
                    let members: Vec<&Point> = visit.iter().map(|&i| &points[i]).collect();
                    self.absorb(&mut detection, &members);
                }
                detection.unassigned.extend(
                    points
                        .iter()
                        .zip(in_visit)
                        .filter(|(_, assigned)| !assigned)
                        .map(|(p, _)| p.id),
                );
                // Keep writes in time order for readability of the store.
                detection.stays.sort_by_key(|s| s.stay.start_time);
            }
        }

        detection
    }
}

/// The group the previous run left open: the points after the last stay
/// when it was closed, otherwise the last stay itself. It is only reopened
/// when newer points are waiting that may extend it. Regrouping starts at a
/// group boundary, so the groups it closes come out as they did before.
pub fn reopen_open_group<S: PointStore + ?Sized>(
    store: &S,
    strategy: StayStrategy,
    eligibility: Eligibility,
) -> Result<Commit> {
    let stays = store.stays(strategy)?;
    let last = stays.last();
    let from = last.map(|stay| (stay.start_time - 1, PointId::MAX));
    let tail = store.scan(&PointQuery::all(eligibility), from, usize::MAX)?;

    let Some(last_done) = tail.iter().rposition(|p| p.stay.is_some()) else {
        return Ok(Commit::default());
    };
    if !tail[last_done + 1..].iter().any(Point::has_valid_coordinates) {
        return Ok(Commit::default());
    }

    let after_stay = last
        .and_then(|stay| {
            let member = Some(StayMembership::Member(stay.id));
            tail.iter().rposition(|p| p.stay == member)
        })
        .map_or(0, |i| i + 1);
    let released: Vec<PointWrite> = tail[after_stay..last_done + 1]
        .iter()
        .filter(|p| p.stay.is_some())
        .map(|p| PointWrite::ReleaseStay(p.id))
        .collect();

    let mut commit = Commit::default();
    if !released.is_empty() {
        debug!("Reopening {} unassigned points at the end of the track", released.len());
        commit.writes = released;
    } else if let Some(stay) = last {
        debug!("Reopening stay {} at the end of the track", stay.id);
        commit.reopened_stays.push(stay.id);
    }
    Ok(commit)
}

enum Phase {
    Reopen,
    Points,
    Annotate,
    Done,
}

/// Runs stay detection with the configured strategy, then re-annotates
/// every stay of that strategy. The group still open when the points run
/// out is written like any other; the next run reopens it if new points
/// arrive after it.
#[time]
pub fn run<S: PointStore + ?Sized>(
    store: &mut S,
    sink: &mut dyn TaskSink,
    config: &PipelineConfig,
    mode: RunMode,
) -> Result<RunSummary> {
    let detector = StayDetector::new(config.stays.clone());
    let strategy = detector.strategy();
    let offset = config.utc_offset()?;
    let precision = config.stays.frequency_precision;
    let eligibility = match config.stays.input {
        StayInput::Clean => Eligibility::Clean,
        StayInput::Stationary => Eligibility::Stationary,
    };
    let query = PointQuery::pending(eligibility, StageKind::Stays);
    let batch_size = config.batch_size;

    let mut grouper = detector.grouper();
    let mut cursor: Option<SortKey> = None;
    let mut phase = Phase::Reopen;

    info!("Detecting stays with strategy {strategy}");

    run_stage(
        StageKind::Stays,
        store,
        sink,
        mode,
        |s| s.count(&query),
        |s| match phase {
            Phase::Reopen => {
                phase = Phase::Points;
                let commit = if grouper.is_some() {
                    reopen_open_group(s, strategy, eligibility)?
                } else {
                    Commit::default()
                };
                Ok(Some(BatchOutcome {
                    commit,
                    ..Default::default()
                }))
            }
            Phase::Points => {
                let mut detection = StayDetection::default();
                let mut skipped = 0;

                let Some(grouper) = grouper.as_mut() else {
                    // DENSITY clusters everything pending in one pass.
                    let points = s.scan(&query, None, usize::MAX)?;
                    let (valid, invalid): (Vec<Point>, Vec<Point>) =
                        points.into_iter().partition(|p| p.has_valid_coordinates());
                    phase = Phase::Annotate;
                    let detection = detector.detect(&valid);
                    debug!("DENSITY found {} stays among {} points", detection.stays.len(), valid.len());
                    return Ok(Some(BatchOutcome {
                        processed: detection.point_count(),
                        failed: invalid.len(),
                        commit: detection.into_commit(),
                    }));
                };

                let batch = s.scan(&query, cursor, batch_size)?;
                if batch.is_empty() {
                    if let Some(group) = grouper.finish() {
                        detector.absorb(&mut detection, &group.iter().collect::<Vec<_>>());
                    }
                    phase = Phase::Annotate;
                } else {
                    cursor = batch.last().map(Point::sort_key);
                    for point in batch {
                        if !point.has_valid_coordinates() {
                            skipped += 1;
                            continue;
                        }
                        if let Some(group) = grouper.push(point) {
                            detector.absorb(&mut detection, &group.iter().collect::<Vec<_>>());
                        }
                    }
                    debug!("{} points held in the open group", grouper.open_len());
                }

                Ok(Some(BatchOutcome {
                    processed: detection.point_count(),
                    failed: skipped,
                    commit: detection.into_commit(),
                }))
            }
            Phase::Annotate => {
                phase = Phase::Done;
                let stays = s.stays(strategy)?;
                let activities = annotate_stays(&stays, precision, offset)?;
                Ok(Some(BatchOutcome {
                    processed: 0,
                    failed: 0,
                    commit: Commit {
                        activities,
                        ..Default::default()
                    },
                }))
            }
            Phase::Done => Ok(None),
        },
    )
}
