use geo::{Centroid, MultiPoint, Point};

/// Mean Earth radius in metres used for every great-circle calculation.
pub const EARTH_RADIUS_METRES: f64 = 6_371_000.0;

/// Metres per degree of latitude on the haversine sphere.
pub const METRES_PER_DEGREE: f64 = EARTH_RADIUS_METRES * std::f64::consts::PI / 180.0;

/// Calculates the haversine (great-circle) distance in metres between
/// two positions given as (lat, lon) in degrees.
pub fn haversine_metres(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let d_phi = (lat2 - lat1).to_radians();
    let d_lambda = (lon2 - lon1).to_radians();

    let a = (d_phi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS_METRES * c
}

/// Haversine distance between two `geo::Point`s (n.b. x=lon, y=lat).
pub fn distance_between(a: Point, b: Point) -> f64 {
    haversine_metres(a.y(), a.x(), b.y(), b.x())
}

/// Calculates speed in kmh from metres and seconds. Returns 0 when
/// no time has elapsed, rather than infinity.
pub fn speed_kmh(metres: f64, seconds: f64) -> f64 {
    if seconds <= 0.0 {
        0.0
    } else {
        (metres / seconds) * 3.6
    }
}

/// Converts a speed recorded in metres per second into kmh.
pub fn mps_to_kmh(mps: f64) -> f64 {
    mps * 3.6
}

/// Returns the arithmetic centroid of the points, or None if
/// there are no points.
pub fn centroid(points: &[Point]) -> Option<Point> {
    MultiPoint::from(points.to_vec()).centroid()
}

/// Returns the largest distance in metres from `center` to any of the points.
pub fn max_distance_from(center: Point, points: &[Point]) -> f64 {
    points
        .iter()
        .map(|p| distance_between(center, *p))
        .fold(0.0, f64::max)
}

/// Returns the half-widths, in degrees of (lat, lon), of a box that
/// contains every position within `metres` of a point at latitude `lat`.
/// The box is a little larger than it strictly needs to be; callers
/// filter candidates by exact distance.
pub fn degree_envelope(metres: f64, lat: f64) -> (f64, f64) {
    let metres = metres * 1.01;
    let dlat = metres / METRES_PER_DEGREE;
    // Meridians converge, so use the latitude nearest the pole.
    let widest = (lat.abs() + dlat).min(90.0);
    let cos_lat = widest.to_radians().cos().max(1e-6);
    let dlon = (metres / (METRES_PER_DEGREE * cos_lat)).min(180.0);
    (dlat, dlon)
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::point;

    #[test]
    fn haversine_of_same_point_is_zero() {
        assert_eq!(haversine_metres(51.5, -0.12, 51.5, -0.12), 0.0);
    }

    #[test]
    fn haversine_one_degree_of_latitude() {
        let d = haversine_metres(0.0, 0.0, 1.0, 0.0);
        assert!((d - 111_195.0).abs() < 10.0, "got {d}");
    }

    #[test]
    fn speed_with_no_elapsed_time_is_zero() {
        assert_eq!(speed_kmh(100.0, 0.0), 0.0);
        assert_eq!(speed_kmh(1000.0, 3600.0), 1.0);
    }

    #[test]
    fn centroid_is_mean_of_coordinates() {
        let pts = vec![point!(x: 0.0, y: 0.0), point!(x: 2.0, y: 4.0)];
        let c = centroid(&pts).unwrap();
        assert_eq!(c.x(), 1.0);
        assert_eq!(c.y(), 2.0);
        assert!(centroid(&[]).is_none());
    }

    #[test]
    fn envelope_covers_requested_distance() {
        let (dlat, dlon) = degree_envelope(200.0, 60.0);
        assert!(haversine_metres(60.0, 10.0, 60.0 + dlat, 10.0) >= 200.0);
        assert!(haversine_metres(60.0, 10.0, 60.0, 10.0 + dlon) >= 200.0);
    }
}
