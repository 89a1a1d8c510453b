use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

pub type PointId = u64;
pub type SegmentId = u64;
pub type StayId = u64;
pub type TripId = u64;

/// Unix timestamp, in seconds.
pub type Timestamp = i64;

/// Administrative labels supplied by the external geocoder.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AdminLabels {
    pub province: Option<String>,
    pub city: Option<String>,
    pub county: Option<String>,
    pub town: Option<String>,
    pub village: Option<String>,
}

/// Granularity of an administrative label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AdminLevel {
    Province,
    City,
    County,
    Town,
    Village,
}

/// A GPS fix. The observed fields never change once ingested; the
/// pipeline only writes the derived annotation fields at the bottom.
/// A derived field of `None` means "not yet processed by that stage".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub id: PointId,
    pub timestamp: Timestamp,
    /// Degrees. NaN when the source row had no usable coordinate.
    #[serde(with = "nan_as_null")]
    pub lon: f64,
    #[serde(with = "nan_as_null")]
    pub lat: f64,
    pub heading: Option<f64>,
    /// Metres.
    pub accuracy: Option<f64>,
    /// Metres per second, as recorded by the device.
    pub speed: Option<f64>,
    pub distance: Option<f64>,
    /// Metres above sea level.
    pub altitude: Option<f64>,
    pub admin: AdminLabels,

    pub outlier: Option<OutlierAnnotation>,
    pub mode: Option<ModeAnnotation>,
    pub stay: Option<StayMembership>,
    pub provenance: Option<Provenance>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutlierReason {
    LowAccuracy,
    Jump,
    Backtrack,
    StaticDrift,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QaStatus {
    Pass,
    Warning,
    Fail,
}

/// The outcome of outlier detection for one point. The flag and the
/// QA status are derived from the reasons, see `model_impls.rs`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutlierAnnotation {
    pub reasons: BTreeSet<OutlierReason>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransportMode {
    Stay,
    Walk,
    Car,
    Train,
    Flight,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ModeReason {
    HighAltitude,
    FlightSpeedRange,
    TrainSpeedRange,
    CrossesProvince,
    HighSpeed,
    CarSpeedRange,
    WalkingSpeed,
    Stationary,
    NoMatchingRule,
}

/// The mode written back to a point, together with the segment it belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModeAnnotation {
    pub mode: TransportMode,
    pub confidence: f64,
    pub reasons: Vec<ModeReason>,
    pub speed_kmh: f64,
    pub segment_id: SegmentId,
}

/// A maximal contiguous run of clean points sharing one transport mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub id: SegmentId,
    pub mode: TransportMode,
    pub start_point_id: PointId,
    pub end_point_id: PointId,
    pub start_time: Timestamp,
    pub end_time: Timestamp,
    pub point_count: usize,
    pub distance_m: f64,
    pub duration_s: i64,
    pub avg_speed_kmh: f64,
    pub max_speed_kmh: f64,
    pub confidence: f64,
    pub reasons: Vec<ModeReason>,
}

/// Which grouping produced a stay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StayStrategy {
    Spatial,
    Admin(AdminLevel),
    Density,
}

/// Written to every point the stay stage has looked at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StayMembership {
    /// The point belongs to the stay with this id.
    Member(StayId),
    /// The point was considered but is not part of any stay.
    Unassigned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActivityType {
    Home,
    Work,
    MealBreakfast,
    MealLunch,
    MealDinner,
    Transit,
    Visit,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityAnnotation {
    pub activity_type: ActivityType,
    /// Confidence in the activity type, 0-1.
    pub confidence: f64,
    /// Number of stays sharing this stay's rounded centre and area.
    pub frequency: usize,
    /// 0-100.
    pub importance: u8,
    pub label: String,
}

/// A dwell episode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StaySegment {
    pub id: StayId,
    pub strategy: StayStrategy,
    pub start_time: Timestamp,
    pub end_time: Timestamp,
    pub duration_s: i64,
    pub center_lat: f64,
    pub center_lon: f64,
    pub radius_m: f64,
    pub point_count: usize,
    /// Labels of the first contributing point.
    pub admin: AdminLabels,
    pub confidence: f64,
    pub activity: Option<ActivityAnnotation>,
    /// The trip leaving this stay, once the trip stage has linked it.
    pub outgoing_trip: Option<TripId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TripType {
    Commute,
    RoundTrip,
    OneWay,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TripPurpose {
    Commute,
    Work,
    Leisure,
    Shopping,
    Travel,
    Other,
}

/// Movement between two temporally adjacent stays.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trip {
    pub id: TripId,
    pub origin_stay_id: StayId,
    pub dest_stay_id: StayId,
    /// Local calendar date of the trip start, YYYY-MM-DD.
    pub date: String,
    /// 1-based ordinal of the trip within its date.
    pub trip_number: u32,
    pub start_time: Timestamp,
    pub end_time: Timestamp,
    pub duration_s: i64,
    pub distance_m: f64,
    pub segment_count: usize,
    pub modes: BTreeSet<TransportMode>,
    pub primary_mode: Option<TransportMode>,
    pub trip_type: TripType,
    pub purpose: TripPurpose,
    pub purpose_confidence: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyntheticSource {
    TrainInterpolation,
    FlightInterpolation,
}

/// Back-reference from a synthetic point to the observed points it
/// was interpolated between.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyntheticOrigin {
    pub source: SyntheticSource,
    pub start_id: PointId,
    pub end_id: PointId,
    /// Position between start (0) and end (1).
    pub ratio: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Provenance {
    Observed,
    Synthetic(SyntheticOrigin),
}

/// JSON has no NaN, so a missing coordinate is written as `null` and read
/// back as NaN.
mod nan_as_null {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_nan() {
            serializer.serialize_none()
        } else {
            serializer.serialize_some(value)
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(f64::NAN))
    }
}
