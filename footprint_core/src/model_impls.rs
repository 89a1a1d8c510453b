use core::fmt;

use geo::{point, Point as GeoPoint};
use time::OffsetDateTime;

use crate::model::{
    ActivityType, AdminLabels, AdminLevel, ModeReason, OutlierAnnotation, OutlierReason, Point,
    PointId, Provenance, QaStatus, StayMembership, StayStrategy, SyntheticSource, Timestamp,
    TransportMode, TripPurpose, TripType,
};

impl Point {
    /// Creates an observed point with only the mandatory fields set.
    pub fn new(id: PointId, timestamp: Timestamp, lon: f64, lat: f64) -> Self {
        Self {
            id,
            timestamp,
            lon,
            lat,
            heading: None,
            accuracy: None,
            speed: None,
            distance: None,
            altitude: None,
            admin: AdminLabels::default(),
            outlier: None,
            mode: None,
            stay: None,
            provenance: None,
        }
    }

    pub fn with_accuracy(mut self, metres: f64) -> Self {
        self.accuracy = Some(metres);
        self
    }

    pub fn with_speed(mut self, mps: f64) -> Self {
        self.speed = Some(mps);
        self
    }

    pub fn with_altitude(mut self, metres: f64) -> Self {
        self.altitude = Some(metres);
        self
    }

    pub fn with_admin(mut self, admin: AdminLabels) -> Self {
        self.admin = admin;
        self
    }

    /// The position as a `geo::Point` (n.b. x=lon, y=lat).
    pub fn position(&self) -> GeoPoint {
        point!(x: self.lon, y: self.lat)
    }

    /// True if both coordinates are usable numbers within range.
    pub fn has_valid_coordinates(&self) -> bool {
        self.lat.is_finite()
            && self.lon.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lon)
    }

    /// True if the timestamp can be turned into a calendar date.
    pub fn has_valid_timestamp(&self) -> bool {
        OffsetDateTime::from_unix_timestamp(self.timestamp).is_ok()
    }

    /// Key used to order points: timestamp first, then id.
    pub fn sort_key(&self) -> (Timestamp, PointId) {
        (self.timestamp, self.id)
    }

    pub fn is_synthetic(&self) -> bool {
        matches!(self.provenance, Some(Provenance::Synthetic(_)))
    }

    /// True once outlier detection has run on the point and found no reason
    /// to flag it.
    pub fn is_clean(&self) -> bool {
        match &self.outlier {
            Some(annotation) => !annotation.is_outlier(),
            None => false,
        }
    }

    pub fn stay_id(&self) -> Option<u64> {
        match self.stay {
            Some(StayMembership::Member(id)) => Some(id),
            _ => None,
        }
    }
}

impl AdminLabels {
    /// Returns the label at the given level, if present and non-empty.
    pub fn at(&self, level: AdminLevel) -> Option<&str> {
        let label = match level {
            AdminLevel::Province => &self.province,
            AdminLevel::City => &self.city,
            AdminLevel::County => &self.county,
            AdminLevel::Town => &self.town,
            AdminLevel::Village => &self.village,
        };

        label.as_deref().filter(|s| !s.is_empty())
    }

    /// The most specific of county, city, province. Used to name an area.
    pub fn area_name(&self) -> Option<&str> {
        self.at(AdminLevel::County)
            .or_else(|| self.at(AdminLevel::City))
            .or_else(|| self.at(AdminLevel::Province))
    }
}

impl OutlierAnnotation {
    pub fn new<I: IntoIterator<Item = OutlierReason>>(reasons: I) -> Self {
        Self {
            reasons: reasons.into_iter().collect(),
        }
    }

    /// The outlier flag. Any reason sets it, LOW_ACCURACY included; the
    /// QA status is what separates a warning from a failure.
    pub fn is_outlier(&self) -> bool {
        !self.reasons.is_empty()
    }

    pub fn qa_status(&self) -> QaStatus {
        if self.reasons.is_empty() {
            QaStatus::Pass
        } else if self.reasons.len() == 1 && self.reasons.contains(&OutlierReason::LowAccuracy) {
            QaStatus::Warning
        } else {
            QaStatus::Fail
        }
    }
}

impl StayStrategy {
    /// The administrative level a stay of this strategy is scored at.
    pub fn admin_level(&self) -> AdminLevel {
        match self {
            StayStrategy::Admin(level) => *level,
            StayStrategy::Spatial | StayStrategy::Density => AdminLevel::County,
        }
    }
}

impl AdminLevel {
    pub fn importance_weight(&self) -> f64 {
        match self {
            AdminLevel::Province => 10.0,
            AdminLevel::City => 7.0,
            AdminLevel::County => 5.0,
            AdminLevel::Town => 3.0,
            AdminLevel::Village => 5.0,
        }
    }
}

impl ActivityType {
    /// Used in labels, e.g. "Lunch in X".
    pub fn meal_name(&self) -> Option<&'static str> {
        match self {
            ActivityType::MealBreakfast => Some("Breakfast"),
            ActivityType::MealLunch => Some("Lunch"),
            ActivityType::MealDinner => Some("Dinner"),
            _ => None,
        }
    }
}

impl fmt::Display for AdminLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdminLevel::Province => write!(f, "PROVINCE"),
            AdminLevel::City => write!(f, "CITY"),
            AdminLevel::County => write!(f, "COUNTY"),
            AdminLevel::Town => write!(f, "TOWN"),
            AdminLevel::Village => write!(f, "VILLAGE"),
        }
    }
}

impl fmt::Display for StayStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StayStrategy::Spatial => write!(f, "SPATIAL"),
            StayStrategy::Admin(level) => write!(f, "ADMIN_{level}"),
            StayStrategy::Density => write!(f, "DENSITY"),
        }
    }
}

impl fmt::Display for OutlierReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutlierReason::LowAccuracy => write!(f, "LOW_ACCURACY"),
            OutlierReason::Jump => write!(f, "JUMP"),
            OutlierReason::Backtrack => write!(f, "BACKTRACK"),
            OutlierReason::StaticDrift => write!(f, "STATIC_DRIFT"),
        }
    }
}

impl fmt::Display for QaStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QaStatus::Pass => write!(f, "PASS"),
            QaStatus::Warning => write!(f, "WARNING"),
            QaStatus::Fail => write!(f, "FAIL"),
        }
    }
}

impl fmt::Display for TransportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportMode::Stay => write!(f, "STAY"),
            TransportMode::Walk => write!(f, "WALK"),
            TransportMode::Car => write!(f, "CAR"),
            TransportMode::Train => write!(f, "TRAIN"),
            TransportMode::Flight => write!(f, "FLIGHT"),
            TransportMode::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

impl fmt::Display for ModeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ModeReason::HighAltitude => "HIGH_ALTITUDE",
            ModeReason::FlightSpeedRange => "FLIGHT_SPEED_RANGE",
            ModeReason::TrainSpeedRange => "TRAIN_SPEED_RANGE",
            ModeReason::CrossesProvince => "CROSSES_PROVINCE",
            ModeReason::HighSpeed => "HIGH_SPEED",
            ModeReason::CarSpeedRange => "CAR_SPEED_RANGE",
            ModeReason::WalkingSpeed => "WALKING_SPEED",
            ModeReason::Stationary => "STATIONARY",
            ModeReason::NoMatchingRule => "NO_MATCHING_RULE",
        };
        write!(f, "{s}")
    }
}

impl fmt::Display for ActivityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ActivityType::Home => "HOME",
            ActivityType::Work => "WORK",
            ActivityType::MealBreakfast => "MEAL_BREAKFAST",
            ActivityType::MealLunch => "MEAL_LUNCH",
            ActivityType::MealDinner => "MEAL_DINNER",
            ActivityType::Transit => "TRANSIT",
            ActivityType::Visit => "VISIT",
            ActivityType::Unknown => "UNKNOWN",
        };
        write!(f, "{s}")
    }
}

impl fmt::Display for TripType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TripType::Commute => write!(f, "COMMUTE"),
            TripType::RoundTrip => write!(f, "ROUND_TRIP"),
            TripType::OneWay => write!(f, "ONE_WAY"),
        }
    }
}

impl fmt::Display for TripPurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TripPurpose::Commute => "COMMUTE",
            TripPurpose::Work => "WORK",
            TripPurpose::Leisure => "LEISURE",
            TripPurpose::Shopping => "SHOPPING",
            TripPurpose::Travel => "TRAVEL",
            TripPurpose::Other => "OTHER",
        };
        write!(f, "{s}")
    }
}

impl fmt::Display for SyntheticSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyntheticSource::TrainInterpolation => write!(f, "TRAIN_INTERPOLATION"),
            SyntheticSource::FlightInterpolation => write!(f, "FLIGHT_INTERPOLATION"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qa_status_follows_reasons() {
        assert_eq!(OutlierAnnotation::default().qa_status(), QaStatus::Pass);

        let low = OutlierAnnotation::new([OutlierReason::LowAccuracy]);
        assert_eq!(low.qa_status(), QaStatus::Warning);
        assert!(low.is_outlier());
        assert!(!OutlierAnnotation::default().is_outlier());

        let both = OutlierAnnotation::new([OutlierReason::LowAccuracy, OutlierReason::Jump]);
        assert_eq!(both.qa_status(), QaStatus::Fail);
        assert!(both.is_outlier());
    }

    #[test]
    fn strategy_tags() {
        assert_eq!(StayStrategy::Spatial.to_string(), "SPATIAL");
        assert_eq!(StayStrategy::Admin(AdminLevel::County).to_string(), "ADMIN_COUNTY");
        assert_eq!(StayStrategy::Density.to_string(), "DENSITY");
    }

    #[test]
    fn empty_labels_are_ignored() {
        let admin = AdminLabels {
            county: Some(String::new()),
            city: Some("Leeds".into()),
            ..Default::default()
        };
        assert_eq!(admin.at(AdminLevel::County), None);
        assert_eq!(admin.area_name(), Some("Leeds"));
    }
}
