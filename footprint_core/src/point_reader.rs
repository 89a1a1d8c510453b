use std::{fs::File, io::Read, path::Path};

use anyhow::{Context, Result};
use log::{info, warn};
use logging_timer::time;
use serde::Deserialize;

use crate::model::{AdminLabels, Point, PointId, Timestamp};

/*
The input is a CSV file with a header row:

id,timestamp,longitude,latitude,heading,accuracy,speed,distance,altitude,province,city,county,town,village

timestamp is unix seconds, speed is m/s, the admin labels may be empty.
Unparsable numeric cells become missing values rather than failing the
whole file. Rows without an id or a timestamp cannot be placed in the
store and are dropped with a warning.
*/

#[derive(Debug, Deserialize)]
struct PointRecord {
    #[serde(deserialize_with = "csv::invalid_option")]
    id: Option<PointId>,
    #[serde(deserialize_with = "csv::invalid_option")]
    timestamp: Option<Timestamp>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    longitude: Option<f64>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    latitude: Option<f64>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    heading: Option<f64>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    accuracy: Option<f64>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    speed: Option<f64>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    distance: Option<f64>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    altitude: Option<f64>,
    #[serde(default)]
    province: Option<String>,
    #[serde(default)]
    city: Option<String>,
    #[serde(default)]
    county: Option<String>,
    #[serde(default)]
    town: Option<String>,
    #[serde(default)]
    village: Option<String>,
}

fn label(value: Option<String>) -> Option<String> {
    value.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

impl PointRecord {
    fn into_point(self) -> Option<Point> {
        let (Some(id), Some(timestamp)) = (self.id, self.timestamp) else {
            return None;
        };

        let mut point = Point::new(
            id,
            timestamp,
            self.longitude.unwrap_or(f64::NAN),
            self.latitude.unwrap_or(f64::NAN),
        );
        point.heading = self.heading;
        point.accuracy = self.accuracy;
        point.speed = self.speed;
        point.distance = self.distance;
        point.altitude = self.altitude;
        point.admin = AdminLabels {
            province: label(self.province),
            city: label(self.city),
            county: label(self.county),
            town: label(self.town),
            village: label(self.village),
        };
        Some(point)
    }
}

#[time]
pub fn read_points_from_reader<R: Read>(input: R) -> Result<Vec<Point>> {
    let mut reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(input);
    let mut points = Vec::new();

    for (idx, result) in reader.deserialize::<PointRecord>().enumerate() {
        // Header is line 1.
        let line = idx + 2;
        let record = result.with_context(|| format!("Failed to read line {line}"))?;
        match record.into_point() {
            Some(point) => points.push(point),
            None => warn!("Dropping line {line}: missing id or timestamp"),
        }
    }

    Ok(points)
}

pub fn read_points_from_file<P: AsRef<Path>>(input_file: P) -> Result<Vec<Point>> {
    let input_file = input_file.as_ref();
    let file = File::open(input_file).with_context(|| format!("Failed to open {:?}", input_file))?;
    let points = read_points_from_reader(file)
        .with_context(|| format!("Failed to read points from {:?}", input_file))?;
    info!("Read {} points from {:?}", points.len(), input_file);
    Ok(points)
}
