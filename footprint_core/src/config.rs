use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use time::UtcOffset;

use crate::model::{AdminLevel, StayStrategy};

/// An inclusive speed range in kmh.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpeedRange {
    pub min: f64,
    pub max: f64,
}

impl SpeedRange {
    pub const fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    /// min <= speed <= max.
    pub fn contains(&self, speed: f64) -> bool {
        speed >= self.min && speed <= self.max
    }

    /// min <= speed < max.
    pub fn contains_half_open(&self, speed: f64) -> bool {
        speed >= self.min && speed < self.max
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Number of points fetched and committed together.
    pub batch_size: usize,
    /// Offset from UTC used for every hour-of-day, weekday and date rule.
    pub utc_offset_seconds: i32,
    pub outliers: OutlierConfig,
    pub modes: ModeConfig,
    pub stays: StayConfig,
    pub trips: TripConfig,
    pub gaps: GapConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            utc_offset_seconds: 0,
            outliers: OutlierConfig::default(),
            modes: ModeConfig::default(),
            stays: StayConfig::default(),
            trips: TripConfig::default(),
            gaps: GapConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutlierConfig {
    pub accuracy_threshold_m: f64,
    /// Maximum plausible ground speed. Faster implied speeds are a JUMP.
    pub max_speed_kmh: f64,
    /// Pairs further apart in time than this are a data gap, not a jump.
    pub jump_max_gap_s: i64,
    /// Pairs where both points are above this altitude are flying and
    /// exempt from the JUMP check.
    pub jump_exempt_altitude_m: f64,
    pub backtrack_distance_m: f64,
    pub backtrack_time_s: i64,
    /// Both legs of a backtrack must be longer than this.
    pub backtrack_min_leg_m: f64,
    pub static_drift_distance_m: f64,
    pub static_drift_min_points: usize,
    /// Most recent points considered for STATIC_DRIFT.
    pub static_drift_window: usize,
}

impl Default for OutlierConfig {
    fn default() -> Self {
        Self {
            accuracy_threshold_m: 100.0,
            max_speed_kmh: 300.0,
            jump_max_gap_s: 3600,
            jump_exempt_altitude_m: 1000.0,
            backtrack_distance_m: 50.0,
            backtrack_time_s: 300,
            backtrack_min_leg_m: 10.0,
            static_drift_distance_m: 20.0,
            static_drift_min_points: 3,
            static_drift_window: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModeConfig {
    pub flight_min_altitude_m: f64,
    pub flight_speed_kmh: SpeedRange,
    pub train_speed_kmh: SpeedRange,
    /// Half-open: the upper bound is excluded.
    pub car_speed_kmh: SpeedRange,
    /// Half-open: the upper bound is excluded.
    pub walk_speed_kmh: SpeedRange,
    /// Below this a point is stationary.
    pub stay_max_speed_kmh: f64,
}

impl Default for ModeConfig {
    fn default() -> Self {
        Self {
            flight_min_altitude_m: 1000.0,
            flight_speed_kmh: SpeedRange::new(200.0, 1000.0),
            train_speed_kmh: SpeedRange::new(80.0, 350.0),
            car_speed_kmh: SpeedRange::new(20.0, 120.0),
            walk_speed_kmh: SpeedRange::new(1.0, 10.0),
            stay_max_speed_kmh: 1.0,
        }
    }
}

/// Which points the stay detector looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StayInput {
    /// Every point that passed outlier detection.
    Clean,
    /// Only clean points classified as STAY.
    Stationary,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StayConfig {
    pub strategy: StayStrategy,
    pub input: StayInput,
    pub min_duration_s: i64,
    pub spatial_radius_m: f64,
    /// DBSCAN neighbourhood radius.
    pub eps_m: f64,
    /// DBSCAN core point threshold, the point itself included.
    pub min_points: usize,
    /// Members of one cluster further apart in time than this are separate visits.
    pub max_time_gap_s: i64,
    /// Point count at which stay confidence reaches 1.0.
    pub confidence_saturation: usize,
    /// Decimal places of the centre used when counting visit frequency.
    pub frequency_precision: u32,
}

impl Default for StayConfig {
    fn default() -> Self {
        Self {
            strategy: StayStrategy::Spatial,
            input: StayInput::Clean,
            min_duration_s: 7200,
            spatial_radius_m: 100.0,
            eps_m: 200.0,
            min_points: 3,
            max_time_gap_s: 3600,
            confidence_saturation: 10,
            frequency_precision: 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TripConfig {
    /// Stays sharing a label at this level make a ROUND_TRIP.
    pub round_trip_level: AdminLevel,
}

impl Default for TripConfig {
    fn default() -> Self {
        Self {
            round_trip_level: AdminLevel::County,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GapConfig {
    pub enabled: bool,
    pub gap_threshold_s: i64,
    pub high_speed_kmh: f64,
    /// Seconds between synthetic points.
    pub cadence_s: i64,
    pub flight_min_altitude_m: f64,
    pub flight_speed_kmh: SpeedRange,
    pub train_speed_kmh: SpeedRange,
    pub cruise_altitude_m: f64,
    /// Fraction of the gap spent climbing, and again descending.
    pub climb_fraction: f64,
    /// Observed points either side of a gap used to classify it.
    pub context_points: usize,
}

impl Default for GapConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            gap_threshold_s: 3600,
            high_speed_kmh: 80.0,
            cadence_s: 600,
            flight_min_altitude_m: 1000.0,
            flight_speed_kmh: SpeedRange::new(200.0, 1000.0),
            train_speed_kmh: SpeedRange::new(80.0, 350.0),
            cruise_altitude_m: 10_000.0,
            climb_fraction: 0.2,
            context_points: 2,
        }
    }
}

impl PipelineConfig {
    /// Reads a configuration from a JSON file. Keys not present keep their defaults.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration file {:?}", path))?;
        Self::from_json_str(&text).with_context(|| format!("Invalid configuration in {:?}", path))
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// The offset used to turn timestamps into local calendar values.
    pub fn utc_offset(&self) -> Result<UtcOffset> {
        UtcOffset::from_whole_seconds(self.utc_offset_seconds)
            .with_context(|| format!("utc_offset_seconds {} is out of range", self.utc_offset_seconds))
    }

    /// Rejects values no stage can work with.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            bail!("batch_size must be greater than zero");
        }
        self.utc_offset()?;

        let o = &self.outliers;
        if o.accuracy_threshold_m <= 0.0 || o.max_speed_kmh <= 0.0 {
            bail!("outlier thresholds must be positive");
        }
        if o.static_drift_min_points < 2 || o.static_drift_window < o.static_drift_min_points {
            bail!(
                "static drift window ({}) must hold at least the minimum of {} points, and the minimum must be at least 2",
                o.static_drift_window,
                o.static_drift_min_points
            );
        }

        let m = &self.modes;
        for (name, range) in [
            ("flight", m.flight_speed_kmh),
            ("train", m.train_speed_kmh),
            ("car", m.car_speed_kmh),
            ("walk", m.walk_speed_kmh),
            ("gap flight", self.gaps.flight_speed_kmh),
            ("gap train", self.gaps.train_speed_kmh),
        ] {
            if range.min > range.max {
                bail!("{name} speed range is inverted: {} > {}", range.min, range.max);
            }
        }

        let s = &self.stays;
        if s.min_duration_s < 0 || s.spatial_radius_m <= 0.0 || s.eps_m <= 0.0 {
            bail!("stay thresholds must be positive");
        }
        if s.min_points == 0 || s.confidence_saturation == 0 {
            bail!("stay point counts must be greater than zero");
        }

        let g = &self.gaps;
        if g.cadence_s <= 0 || g.gap_threshold_s <= 0 {
            bail!("gap cadence and threshold must be positive");
        }
        if !(0.0..=0.5).contains(&g.climb_fraction) {
            bail!("climb_fraction must be between 0 and 0.5");
        }

        Ok(())
    }
}
