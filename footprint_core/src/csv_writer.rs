use std::{fs::File, io::Write, path::Path};

use anyhow::{Context, Result};
use log::info;
use logging_timer::time;
use serde::Serialize;

use crate::{
    formatting::format_utc,
    model::{Point, Provenance},
};

/// One point flattened for export, with every annotation as plain text.
#[derive(Debug, Clone, Serialize)]
pub struct AnnotatedRow {
    pub id: u64,
    pub timestamp: i64,
    pub time_utc: String,
    pub longitude: Option<f64>,
    pub latitude: Option<f64>,
    pub altitude: Option<f64>,
    pub outlier_flag: Option<bool>,
    pub outlier_reasons: String,
    pub qa_status: String,
    pub mode: String,
    pub mode_confidence: Option<f64>,
    pub speed_kmh: Option<f64>,
    pub segment_id: Option<u64>,
    pub stay_id: Option<u64>,
    pub synthetic: bool,
    pub synthetic_source: String,
}

impl From<&Point> for AnnotatedRow {
    fn from(p: &Point) -> Self {
        let finite = |v: f64| Some(v).filter(|v| v.is_finite());
        let reasons = p
            .outlier
            .as_ref()
            .map(|o| o.reasons.iter().map(|r| r.to_string()).collect::<Vec<_>>().join(";"))
            .unwrap_or_default();
        let synthetic_source = match &p.provenance {
            Some(Provenance::Synthetic(origin)) => origin.source.to_string(),
            _ => String::new(),
        };

        Self {
            id: p.id,
            timestamp: p.timestamp,
            time_utc: format_utc(p.timestamp),
            longitude: finite(p.lon),
            latitude: finite(p.lat),
            altitude: p.altitude,
            outlier_flag: p.outlier.as_ref().map(|o| o.is_outlier()),
            outlier_reasons: reasons,
            qa_status: p.outlier.as_ref().map(|o| o.qa_status().to_string()).unwrap_or_default(),
            mode: p.mode.as_ref().map(|m| m.mode.to_string()).unwrap_or_default(),
            mode_confidence: p.mode.as_ref().map(|m| m.confidence),
            speed_kmh: p.mode.as_ref().map(|m| m.speed_kmh),
            segment_id: p.mode.as_ref().map(|m| m.segment_id),
            stay_id: p.stay_id(),
            synthetic: p.is_synthetic(),
            synthetic_source,
        }
    }
}

pub fn write_points<W: Write>(output: W, points: &[Point]) -> Result<()> {
    let mut writer = csv::Writer::from_writer(output);
    for p in points {
        writer.serialize(AnnotatedRow::from(p))?;
    }
    writer.flush()?;
    Ok(())
}

/// Writes every point, with its annotations, to a CSV file.
#[time]
pub fn write_points_to_file<P: AsRef<Path>>(output_file: P, points: &[Point]) -> Result<()> {
    let output_file = output_file.as_ref();
    let file = File::create(output_file).with_context(|| format!("Failed to create {:?}", output_file))?;
    write_points(file, points).with_context(|| format!("Failed to write points to {:?}", output_file))?;
    info!("Wrote {} points to {:?}", points.len(), output_file);
    Ok(())
}
