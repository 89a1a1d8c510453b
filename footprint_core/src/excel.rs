use std::path::Path;

use anyhow::{Context, Result};
use log::info;
use logging_timer::time;
use rust_xlsxwriter::{Format, Workbook, Worksheet};

use crate::{
    csv_writer::AnnotatedRow,
    formatting::format_utc,
    model::{Point, Segment, StaySegment, Trip},
};

/// Everything that goes into the summary workbook.
pub struct SummaryData<'a> {
    pub points: &'a [Point],
    pub segments: &'a [Segment],
    pub stays: &'a [StaySegment],
    pub trips: &'a [Trip],
}

/// Builds a workbook with one sheet per record type.
#[time]
pub fn create_summary_xlsx(data: &SummaryData) -> Result<Workbook> {
    let mut workbook = Workbook::new();
    let header = Format::new().set_bold();

    write_points(workbook.add_worksheet(), &header, data.points)?;
    write_segments(workbook.add_worksheet(), &header, data.segments)?;
    write_stays(workbook.add_worksheet(), &header, data.stays)?;
    write_trips(workbook.add_worksheet(), &header, data.trips)?;

    Ok(workbook)
}

pub fn write_summary_to_file<P: AsRef<Path>>(summary_file: P, mut workbook: Workbook) -> Result<()> {
    let summary_file = summary_file.as_ref();
    workbook
        .save(summary_file)
        .with_context(|| format!("Failed to save workbook {:?}", summary_file))?;
    let metadata = std::fs::metadata(summary_file)?;
    info!("Wrote {:?}, {} Kb", summary_file, metadata.len() / 1024);
    Ok(())
}

fn write_headers(ws: &mut Worksheet, format: &Format, headers: &[&str]) -> Result<()> {
    for (col, h) in headers.iter().enumerate() {
        ws.write_string_with_format(0, col as u16, *h, format)?;
    }
    ws.set_freeze_panes(1, 0)?;
    Ok(())
}

fn write_opt_number(ws: &mut Worksheet, row: u32, col: u16, value: Option<f64>) -> Result<()> {
    if let Some(v) = value {
        ws.write_number(row, col, v)?;
    }
    Ok(())
}

#[rustfmt::skip]
fn write_points(ws: &mut Worksheet, header: &Format, points: &[Point]) -> Result<()> {
    ws.set_name("Points")?;
    write_headers(ws, header, &[
        "Id", "Time (UTC)", "Lon", "Lat", "Altitude", "Outlier", "Reasons", "QA",
        "Mode", "Confidence", "Speed (km/h)", "Segment", "Stay", "Synthetic Source",
    ])?;

    for (idx, p) in points.iter().enumerate() {
        let row = idx as u32 + 1;
        let r = AnnotatedRow::from(p);
        ws.write_number(row, 0, r.id as f64)?;
        ws.write_string(row, 1, &r.time_utc)?;
        write_opt_number(ws, row, 2, r.longitude)?;
        write_opt_number(ws, row, 3, r.latitude)?;
        write_opt_number(ws, row, 4, r.altitude)?;
        if let Some(flag) = r.outlier_flag {
            ws.write_boolean(row, 5, flag)?;
        }
        ws.write_string(row, 6, &r.outlier_reasons)?;
        ws.write_string(row, 7, &r.qa_status)?;
        ws.write_string(row, 8, &r.mode)?;
        write_opt_number(ws, row, 9, r.mode_confidence)?;
        write_opt_number(ws, row, 10, r.speed_kmh)?;
        write_opt_number(ws, row, 11, r.segment_id.map(|id| id as f64))?;
        write_opt_number(ws, row, 12, r.stay_id.map(|id| id as f64))?;
        ws.write_string(row, 13, &r.synthetic_source)?;
    }

    Ok(())
}

#[rustfmt::skip]
fn write_segments(ws: &mut Worksheet, header: &Format, segments: &[Segment]) -> Result<()> {
    ws.set_name("Segments")?;
    write_headers(ws, header, &[
        "Id", "Mode", "Start", "End", "Points", "Distance (m)", "Duration (s)",
        "Avg Speed (km/h)", "Max Speed (km/h)", "Confidence", "Reasons",
    ])?;

    for (idx, s) in segments.iter().enumerate() {
        let row = idx as u32 + 1;
        let reasons: Vec<String> = s.reasons.iter().map(|r| r.to_string()).collect();
        ws.write_number(row, 0, s.id as f64)?;
        ws.write_string(row, 1, s.mode.to_string())?;
        ws.write_string(row, 2, format_utc(s.start_time))?;
        ws.write_string(row, 3, format_utc(s.end_time))?;
        ws.write_number(row, 4, s.point_count as f64)?;
        ws.write_number(row, 5, s.distance_m)?;
        ws.write_number(row, 6, s.duration_s as f64)?;
        ws.write_number(row, 7, s.avg_speed_kmh)?;
        ws.write_number(row, 8, s.max_speed_kmh)?;
        ws.write_number(row, 9, s.confidence)?;
        ws.write_string(row, 10, reasons.join(";"))?;
    }

    Ok(())
}

#[rustfmt::skip]
fn write_stays(ws: &mut Worksheet, header: &Format, stays: &[StaySegment]) -> Result<()> {
    ws.set_name("Stays")?;
    write_headers(ws, header, &[
        "Id", "Strategy", "Start", "End", "Duration (s)", "Lat", "Lon", "Radius (m)",
        "Points", "Area", "Confidence", "Activity", "Frequency", "Importance", "Label",
    ])?;

    for (idx, s) in stays.iter().enumerate() {
        let row = idx as u32 + 1;
        ws.write_number(row, 0, s.id as f64)?;
        ws.write_string(row, 1, s.strategy.to_string())?;
        ws.write_string(row, 2, format_utc(s.start_time))?;
        ws.write_string(row, 3, format_utc(s.end_time))?;
        ws.write_number(row, 4, s.duration_s as f64)?;
        ws.write_number(row, 5, s.center_lat)?;
        ws.write_number(row, 6, s.center_lon)?;
        ws.write_number(row, 7, s.radius_m)?;
        ws.write_number(row, 8, s.point_count as f64)?;
        ws.write_string(row, 9, s.admin.area_name().unwrap_or(""))?;
        ws.write_number(row, 10, s.confidence)?;
        if let Some(a) = &s.activity {
            ws.write_string(row, 11, a.activity_type.to_string())?;
            ws.write_number(row, 12, a.frequency as f64)?;
            ws.write_number(row, 13, a.importance)?;
            ws.write_string(row, 14, &a.label)?;
        }
    }

    Ok(())
}

#[rustfmt::skip]
fn write_trips(ws: &mut Worksheet, header: &Format, trips: &[Trip]) -> Result<()> {
    ws.set_name("Trips")?;
    write_headers(ws, header, &[
        "Id", "Date", "Number", "Origin Stay", "Destination Stay", "Start", "End",
        "Duration (s)", "Distance (m)", "Segments", "Modes", "Primary Mode", "Type",
        "Purpose", "Purpose Confidence",
    ])?;

    for (idx, t) in trips.iter().enumerate() {
        let row = idx as u32 + 1;
        let modes: Vec<String> = t.modes.iter().map(|m| m.to_string()).collect();
        ws.write_number(row, 0, t.id as f64)?;
        ws.write_string(row, 1, &t.date)?;
        ws.write_number(row, 2, t.trip_number)?;
        ws.write_number(row, 3, t.origin_stay_id as f64)?;
        ws.write_number(row, 4, t.dest_stay_id as f64)?;
        ws.write_string(row, 5, format_utc(t.start_time))?;
        ws.write_string(row, 6, format_utc(t.end_time))?;
        ws.write_number(row, 7, t.duration_s as f64)?;
        ws.write_number(row, 8, t.distance_m)?;
        ws.write_number(row, 9, t.segment_count as f64)?;
        ws.write_string(row, 10, modes.join(";"))?;
        ws.write_string(row, 11, t.primary_mode.map(|m| m.to_string()).unwrap_or_default())?;
        ws.write_string(row, 12, t.trip_type.to_string())?;
        ws.write_string(row, 13, t.purpose.to_string())?;
        ws.write_number(row, 14, t.purpose_confidence)?;
    }

    Ok(())
}
