#![allow(dead_code)]

use footprint_core::{
    geo_utils::METRES_PER_DEGREE,
    model::{AdminLabels, OutlierAnnotation, Point, PointId, Timestamp},
};

pub const BASE_LAT: f64 = 39.9;
pub const BASE_LON: f64 = 116.4;

/// 2024-01-04 00:00:00 UTC, a Thursday.
pub const T0: Timestamp = 1_704_326_400;

pub const MINUTE: i64 = 60;
pub const HOUR: i64 = 3600;

/// (lon, lat) of the position `north_m` north and `east_m` east of the base.
pub fn offset(north_m: f64, east_m: f64) -> (f64, f64) {
    let lat = BASE_LAT + north_m / METRES_PER_DEGREE;
    let lon = BASE_LON + east_m / (METRES_PER_DEGREE * BASE_LAT.to_radians().cos());
    (lon, lat)
}

/// An observed point relative to the base position.
pub fn point_at(id: PointId, timestamp: Timestamp, north_m: f64, east_m: f64) -> Point {
    let (lon, lat) = offset(north_m, east_m);
    Point::new(id, timestamp, lon, lat)
}

/// Marks a point as having passed outlier detection.
pub fn clean(mut point: Point) -> Point {
    point.outlier = Some(OutlierAnnotation::default());
    point
}

pub fn admin(province: &str, city: &str, county: &str) -> AdminLabels {
    AdminLabels {
        province: Some(province.to_string()),
        city: Some(city.to_string()),
        county: Some(county.to_string()),
        town: None,
        village: None,
    }
}

pub fn approx_eq(a: f64, b: f64, tolerance: f64) -> bool {
    (a - b).abs() <= tolerance
}
