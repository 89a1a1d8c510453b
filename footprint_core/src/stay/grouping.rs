use crate::{
    geo_utils::haversine_metres,
    model::{AdminLevel, Point},
};

/// What decides whether a point belongs with the open group.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GroupRule {
    /// Within this many metres of the group's running centroid.
    Radius(f64),
    /// The same label at this administrative level. Points without a
    /// label never join a group.
    Admin(AdminLevel),
}

#[derive(Debug)]
pub struct Grouper {
    rule: GroupRule,
    group: Vec<Point>,
    lat_sum: f64,
    lon_sum: f64,
}

impl Grouper {
    pub fn new(rule: GroupRule) -> Self {
        Self {
            rule,
            group: Vec::new(),
            lat_sum: 0.0,
            lon_sum: 0.0,
        }
    }

    /// Adds the next point. If it does not belong with the open group, the
    /// open group is closed and returned, and the point starts a new one.
    pub fn push(&mut self, point: Point) -> Option<Vec<Point>> {
        if self.group.is_empty() || self.admits(&point) {
            self.add(point);
            return None;
        }

        let closed = self.take();
        self.add(point);
        Some(closed)
    }

    /// Closes and returns the open group, if there is one.
    pub fn finish(&mut self) -> Option<Vec<Point>> {
        if self.group.is_empty() {
            None
        } else {
            Some(self.take())
        }
    }

    /// Number of points in the open group.
    pub fn open_len(&self) -> usize {
        self.group.len()
    }

    /// The running centroid as (lat, lon).
    fn centroid(&self) -> (f64, f64) {
        let n = self.group.len() as f64;
        (self.lat_sum / n, self.lon_sum / n)
    }

    fn admits(&self, point: &Point) -> bool {
        match self.rule {
            GroupRule::Radius(radius_m) => {
                let (lat, lon) = self.centroid();
                haversine_metres(lat, lon, point.lat, point.lon) <= radius_m
            }
            GroupRule::Admin(level) => {
                match (self.group[0].admin.at(level), point.admin.at(level)) {
                    (Some(a), Some(b)) => a == b,
                    _ => false,
                }
            }
        }
    }

    fn add(&mut self, point: Point) {
        self.lat_sum += point.lat;
        self.lon_sum += point.lon;
        self.group.push(point);
    }

    fn take(&mut self) -> Vec<Point> {
        self.lat_sum = 0.0;
        self.lon_sum = 0.0;
        std::mem::take(&mut self.group)
    }
}
