use core::fmt;
use std::{collections::HashMap, fs::File, io::BufReader, io::BufWriter, path::Path};

use anyhow::{bail, Context, Result};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::model::{
    ActivityAnnotation, ModeAnnotation, OutlierAnnotation, Point, PointId, Provenance, Segment,
    SegmentId, StayId, StayMembership, StaySegment, StayStrategy, Timestamp, TransportMode, Trip,
    TripId, TripType,
};

/// Synthetic points are numbered from here so they can never collide with
/// the ids handed out by the point source.
pub const SYNTHETIC_ID_BASE: PointId = 1 << 48;

/// Position of a point in the store's ordering.
pub type SortKey = (Timestamp, PointId);

/// The stages of the pipeline, in the order they run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    Outliers,
    TransportModes,
    Stays,
    Trips,
    GapCompletion,
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageKind::Outliers => write!(f, "outlier_detection"),
            StageKind::TransportModes => write!(f, "transport_mode"),
            StageKind::Stays => write!(f, "stay_detection"),
            StageKind::Trips => write!(f, "trip_construction"),
            StageKind::GapCompletion => write!(f, "gap_completion"),
        }
    }
}

/// Which points a stage is allowed to see.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eligibility {
    /// Every point that is not synthetic.
    Observed,
    /// Observed points that have passed outlier detection.
    Clean,
    /// Clean points classified as STAY.
    Stationary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PointQuery {
    pub eligibility: Eligibility,
    /// Restrict to points this stage has not yet written to.
    pub unset: Option<StageKind>,
}

impl PointQuery {
    pub fn pending(eligibility: Eligibility, stage: StageKind) -> Self {
        Self {
            eligibility,
            unset: Some(stage),
        }
    }

    pub fn all(eligibility: Eligibility) -> Self {
        Self {
            eligibility,
            unset: None,
        }
    }

    pub fn matches(&self, point: &Point) -> bool {
        let eligible = match self.eligibility {
            Eligibility::Observed => !point.is_synthetic(),
            Eligibility::Clean => !point.is_synthetic() && point.is_clean(),
            Eligibility::Stationary => {
                !point.is_synthetic()
                    && point.is_clean()
                    && point.mode.as_ref().map(|m| m.mode) == Some(TransportMode::Stay)
            }
        };

        let unset = match self.unset {
            None => true,
            Some(StageKind::Outliers) => point.outlier.is_none(),
            Some(StageKind::TransportModes) => point.mode.is_none(),
            Some(StageKind::Stays) => point.stay.is_none(),
            Some(StageKind::GapCompletion) => point.provenance.is_none(),
            Some(StageKind::Trips) => true,
        };

        eligible && unset
    }
}

/// A single annotation written back to an existing point.
#[derive(Debug, Clone, PartialEq)]
pub enum PointWrite {
    Outlier(PointId, OutlierAnnotation),
    Stay(PointId, StayMembership),
    /// Withdraws the point's stay membership so stay detection sees it again.
    ReleaseStay(PointId),
    Provenance(PointId, Provenance),
}

/// A new segment and the annotation for each of its points. The store
/// assigns the segment id and fills it in on every member.
#[derive(Debug, Clone, PartialEq)]
pub struct NewSegment {
    pub segment: Segment,
    pub members: Vec<(PointId, ModeAnnotation)>,
}

/// A new stay and the points that belong to it.
#[derive(Debug, Clone, PartialEq)]
pub struct NewStay {
    pub stay: StaySegment,
    pub members: Vec<PointId>,
}

/// Everything one batch derived, written as one unit.
#[derive(Debug, Clone, Default)]
pub struct Commit {
    /// Stays to withdraw before anything else is written. Their members
    /// become pending again and the trips that touch them are dropped.
    pub reopened_stays: Vec<StayId>,
    pub writes: Vec<PointWrite>,
    pub segments: Vec<NewSegment>,
    pub stays: Vec<NewStay>,
    pub activities: Vec<(StayId, ActivityAnnotation)>,
    pub trips: Vec<Trip>,
    /// Corrected types for trips already stored.
    pub trip_types: Vec<(TripId, TripType)>,
    /// New synthetic points. Their ids are assigned by the store.
    pub synthetic: Vec<Point>,
}

impl Commit {
    pub fn is_empty(&self) -> bool {
        self.reopened_stays.is_empty()
            && self.writes.is_empty()
            && self.segments.is_empty()
            && self.stays.is_empty()
            && self.activities.is_empty()
            && self.trips.is_empty()
            && self.trip_types.is_empty()
            && self.synthetic.is_empty()
    }
}

/// How many individual writes of a commit succeeded and failed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitReport {
    pub written: usize,
    pub failed: usize,
}

/// An ordered, randomly-updatable collection of points plus the derived
/// records. Reads are ordered by (timestamp, id).
pub trait PointStore {
    fn count(&self, query: &PointQuery) -> Result<usize>;

    /// Up to `limit` matching points strictly after `after`, in order.
    fn scan(&self, query: &PointQuery, after: Option<SortKey>, limit: usize) -> Result<Vec<Point>>;

    /// Up to `n` points of the given eligibility strictly before `before`, in order.
    fn preceding(&self, eligibility: Eligibility, before: SortKey, n: usize) -> Result<Vec<Point>>;

    /// Up to `n` points of the given eligibility strictly after `after`, in order.
    fn following(&self, eligibility: Eligibility, after: SortKey, n: usize) -> Result<Vec<Point>>;

    fn segments(&self) -> Result<Vec<Segment>>;

    /// Segments whose time range lies within [start, end].
    fn segments_within(&self, start: Timestamp, end: Timestamp) -> Result<Vec<Segment>>;

    /// Stays of one strategy, ordered by start time.
    fn stays(&self, strategy: StayStrategy) -> Result<Vec<StaySegment>>;

    fn trips(&self) -> Result<Vec<Trip>>;

    fn commit(&mut self, commit: Commit) -> Result<CommitReport>;

    /// Removes everything the stage has derived so it can run from scratch.
    fn clear(&mut self, stage: StageKind) -> Result<()>;
}

/// A `PointStore` held entirely in memory.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct MemoryStore {
    points: Vec<Point>,
    segments: Vec<Segment>,
    stays: Vec<StaySegment>,
    trips: Vec<Trip>,
    next_segment_id: SegmentId,
    next_stay_id: StayId,
    next_trip_id: TripId,
    next_synthetic_id: PointId,
    #[serde(skip)]
    index: HashMap<PointId, usize>,
}

impl MemoryStore {
    /// Creates a store holding the given points. Fails on duplicate ids.
    pub fn new(points: Vec<Point>) -> Result<Self> {
        let mut store = Self {
            next_segment_id: 1,
            next_stay_id: 1,
            next_trip_id: 1,
            next_synthetic_id: SYNTHETIC_ID_BASE,
            ..Default::default()
        };
        store.points = points;
        store.reindex()?;
        Ok(store)
    }

    /// Loads a store previously written by `save`.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).with_context(|| format!("Failed to open snapshot {:?}", path))?;
        let mut store: Self = serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("Failed to parse snapshot {:?}", path))?;
        store.reindex()?;
        info!("Loaded {} points from snapshot {:?}", store.points.len(), path);
        Ok(store)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let file =
            File::create(path).with_context(|| format!("Failed to create snapshot {:?}", path))?;
        serde_json::to_writer(BufWriter::new(file), self)
            .with_context(|| format!("Failed to write snapshot {:?}", path))?;
        info!("Saved {} points to snapshot {:?}", self.points.len(), path);
        Ok(())
    }

    /// Adds points whose ids are not already present. Returns how many were added.
    pub fn merge_points(&mut self, points: Vec<Point>) -> Result<usize> {
        let before = self.points.len();
        for p in points {
            if !self.index.contains_key(&p.id) {
                self.index.insert(p.id, usize::MAX);
                self.points.push(p);
            }
        }
        self.reindex()?;
        Ok(self.points.len() - before)
    }

    pub fn points(&self) -> &[Point] {
        &self.points
    }

    pub fn point(&self, id: PointId) -> Option<&Point> {
        self.index.get(&id).map(|&idx| &self.points[idx])
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    fn reindex(&mut self) -> Result<()> {
        self.points.sort_by_key(|p| p.sort_key());
        self.index.clear();
        for (idx, p) in self.points.iter().enumerate() {
            if self.index.insert(p.id, idx).is_some() {
                bail!("Duplicate point id {}", p.id);
            }
        }
        Ok(())
    }

    fn point_mut(&mut self, id: PointId) -> Option<&mut Point> {
        match self.index.get(&id) {
            Some(&idx) => self.points.get_mut(idx),
            None => None,
        }
    }

    fn first_after(&self, after: Option<SortKey>) -> usize {
        match after {
            Some(key) => self.points.partition_point(|p| p.sort_key() <= key),
            None => 0,
        }
    }

    fn apply_write(&mut self, write: PointWrite) -> bool {
        let id = match &write {
            PointWrite::Outlier(id, _)
            | PointWrite::Stay(id, _)
            | PointWrite::ReleaseStay(id)
            | PointWrite::Provenance(id, _) => *id,
        };

        let Some(point) = self.point_mut(id) else {
            warn!("Cannot write to unknown point {id}");
            return false;
        };

        match write {
            PointWrite::Outlier(_, annotation) => point.outlier = Some(annotation),
            PointWrite::Stay(_, membership) => point.stay = Some(membership),
            PointWrite::ReleaseStay(_) => point.stay = None,
            PointWrite::Provenance(_, provenance) => point.provenance = Some(provenance),
        }

        true
    }

    /// Removes a stay and the trips into and out of it, and returns its
    /// members to the pending state.
    fn reopen_stay(&mut self, stay_id: StayId) -> bool {
        let Some(idx) = self.stays.iter().position(|s| s.id == stay_id) else {
            warn!("Cannot reopen unknown stay {stay_id}");
            return false;
        };
        self.stays.remove(idx);

        let dropped: Vec<TripId> = self
            .trips
            .iter()
            .filter(|t| t.origin_stay_id == stay_id || t.dest_stay_id == stay_id)
            .map(|t| t.id)
            .collect();
        self.trips.retain(|t| !dropped.contains(&t.id));
        for stay in &mut self.stays {
            if stay.outgoing_trip.is_some_and(|id| dropped.contains(&id)) {
                stay.outgoing_trip = None;
            }
        }

        let member = Some(StayMembership::Member(stay_id));
        self.points
            .iter_mut()
            .filter(|p| p.stay == member)
            .for_each(|p| p.stay = None);
        debug!("Reopened stay {stay_id}, dropping {} trips", dropped.len());
        true
    }
}

impl PointStore for MemoryStore {
    fn count(&self, query: &PointQuery) -> Result<usize> {
        Ok(self.points.iter().filter(|p| query.matches(p)).count())
    }

    fn scan(&self, query: &PointQuery, after: Option<SortKey>, limit: usize) -> Result<Vec<Point>> {
        let start = self.first_after(after);
        Ok(self.points[start..]
            .iter()
            .filter(|p| query.matches(p))
            .take(limit)
            .cloned()
            .collect())
    }

    fn preceding(&self, eligibility: Eligibility, before: SortKey, n: usize) -> Result<Vec<Point>> {
        let query = PointQuery::all(eligibility);
        let end = self.points.partition_point(|p| p.sort_key() < before);
        let mut found: Vec<Point> = self.points[..end]
            .iter()
            .rev()
            .filter(|p| query.matches(p))
            .take(n)
            .cloned()
            .collect();
        found.reverse();
        Ok(found)
    }

    fn following(&self, eligibility: Eligibility, after: SortKey, n: usize) -> Result<Vec<Point>> {
        let query = PointQuery::all(eligibility);
        self.scan(&query, Some(after), n)
    }

    fn segments(&self) -> Result<Vec<Segment>> {
        Ok(self.segments.clone())
    }

    fn segments_within(&self, start: Timestamp, end: Timestamp) -> Result<Vec<Segment>> {
        Ok(self
            .segments
            .iter()
            .filter(|s| s.start_time >= start && s.end_time <= end)
            .cloned()
            .collect())
    }

    fn stays(&self, strategy: StayStrategy) -> Result<Vec<StaySegment>> {
        let mut stays: Vec<StaySegment> = self
            .stays
            .iter()
            .filter(|s| s.strategy == strategy)
            .cloned()
            .collect();
        stays.sort_by_key(|s| (s.start_time, s.id));
        Ok(stays)
    }

    fn trips(&self) -> Result<Vec<Trip>> {
        Ok(self.trips.clone())
    }

    fn commit(&mut self, commit: Commit) -> Result<CommitReport> {
        let mut report = CommitReport::default();
        let mut tally = |ok: bool| {
            if ok {
                report.written += 1;
            } else {
                report.failed += 1;
            }
        };

        for stay_id in commit.reopened_stays {
            tally(self.reopen_stay(stay_id));
        }

        for write in commit.writes {
            tally(self.apply_write(write));
        }

        for new_segment in commit.segments {
            let id = self.next_segment_id;
            self.next_segment_id += 1;
            for (point_id, mut annotation) in new_segment.members {
                annotation.segment_id = id;
                match self.point_mut(point_id) {
                    Some(point) => {
                        point.mode = Some(annotation);
                        tally(true);
                    }
                    None => {
                        warn!("Cannot write mode to unknown point {point_id}");
                        tally(false);
                    }
                }
            }
            let mut segment = new_segment.segment;
            segment.id = id;
            self.segments.push(segment);
        }

        for new_stay in commit.stays {
            let id = self.next_stay_id;
            self.next_stay_id += 1;
            for point_id in new_stay.members {
                tally(self.apply_write(PointWrite::Stay(point_id, StayMembership::Member(id))));
            }
            let mut stay = new_stay.stay;
            stay.id = id;
            self.stays.push(stay);
        }

        for (stay_id, activity) in commit.activities {
            match self.stays.iter_mut().find(|s| s.id == stay_id) {
                Some(stay) => {
                    stay.activity = Some(activity);
                    tally(true);
                }
                None => {
                    warn!("Cannot annotate unknown stay {stay_id}");
                    tally(false);
                }
            }
        }

        for mut trip in commit.trips {
            let Some(origin) = self.stays.iter_mut().find(|s| s.id == trip.origin_stay_id) else {
                warn!("Cannot link trip from unknown stay {}", trip.origin_stay_id);
                tally(false);
                continue;
            };
            trip.id = self.next_trip_id;
            self.next_trip_id += 1;
            origin.outgoing_trip = Some(trip.id);
            self.trips.push(trip);
            tally(true);
        }

        for (trip_id, trip_type) in commit.trip_types {
            match self.trips.iter_mut().find(|t| t.id == trip_id) {
                Some(trip) => {
                    trip.trip_type = trip_type;
                    tally(true);
                }
                None => {
                    warn!("Cannot retype unknown trip {trip_id}");
                    tally(false);
                }
            }
        }

        if !commit.synthetic.is_empty() {
            for mut point in commit.synthetic {
                point.id = self.next_synthetic_id;
                self.next_synthetic_id += 1;
                self.points.push(point);
                tally(true);
            }
            self.reindex()?;
        }

        debug!("Commit wrote {} records, {} failed", report.written, report.failed);
        Ok(report)
    }

    fn clear(&mut self, stage: StageKind) -> Result<()> {
        match stage {
            StageKind::Outliers => {
                self.points.iter_mut().for_each(|p| p.outlier = None);
            }
            StageKind::TransportModes => {
                self.points.iter_mut().for_each(|p| p.mode = None);
                self.segments.clear();
                self.next_segment_id = 1;
            }
            StageKind::Stays => {
                self.points.iter_mut().for_each(|p| p.stay = None);
                self.stays.clear();
                self.next_stay_id = 1;
                // Trips refer to stays, so they go too.
                self.trips.clear();
                self.next_trip_id = 1;
            }
            StageKind::Trips => {
                self.stays.iter_mut().for_each(|s| s.outgoing_trip = None);
                self.trips.clear();
                self.next_trip_id = 1;
            }
            StageKind::GapCompletion => {
                self.points.retain(|p| !p.is_synthetic());
                self.points.iter_mut().for_each(|p| p.provenance = None);
                self.next_synthetic_id = SYNTHETIC_ID_BASE;
                self.reindex()?;
            }
        }

        info!("Cleared derived data for {stage}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> MemoryStore {
        MemoryStore::new(vec![
            Point::new(3, 300, 0.0, 0.0),
            Point::new(1, 100, 0.0, 0.0),
            Point::new(2, 200, 0.0, 0.0),
        ])
        .unwrap()
    }

    #[test]
    fn points_are_ordered_by_time() {
        let store = store();
        let ids: Vec<_> = store.points().iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let result = MemoryStore::new(vec![Point::new(1, 1, 0.0, 0.0), Point::new(1, 2, 0.0, 0.0)]);
        assert!(result.is_err());
    }

    #[test]
    fn scan_resumes_after_key() {
        let store = store();
        let query = PointQuery::all(Eligibility::Observed);
        let page = store.scan(&query, Some((100, 1)), 10).unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].id, 2);

        let before = store.preceding(Eligibility::Observed, (300, 3), 5).unwrap();
        assert_eq!(before.iter().map(|p| p.id).collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn write_to_unknown_point_is_counted_as_failed() {
        let mut store = store();
        let commit = Commit {
            writes: vec![
                PointWrite::Outlier(1, OutlierAnnotation::default()),
                PointWrite::Outlier(99, OutlierAnnotation::default()),
            ],
            ..Default::default()
        };
        let report = store.commit(commit).unwrap();
        assert_eq!(report, CommitReport { written: 1, failed: 1 });
        assert!(store.point(1).unwrap().outlier.is_some());
    }

    #[test]
    fn merge_skips_known_ids() {
        let mut store = store();
        let added = store
            .merge_points(vec![Point::new(2, 200, 0.0, 0.0), Point::new(4, 50, 0.0, 0.0)])
            .unwrap();
        assert_eq!(added, 1);
        assert_eq!(store.points()[0].id, 4);
        assert_eq!(store.point(3).unwrap().timestamp, 300);
    }
}
