use std::io::Write;

use anyhow::{bail, Result};
use args::{parse_args, Args};
use clap::builder::styling::AnsiColor;
use env_logger::Builder;
use footprint_core::{
    config::PipelineConfig,
    csv_writer::write_points_to_file,
    excel::{create_summary_xlsx, write_summary_to_file, SummaryData},
    model::StayStrategy,
    pipeline::Pipeline,
    point_reader::read_points_from_file,
    runner::RunMode,
    store::{MemoryStore, PointStore},
    task::LogSink,
};
use log::{debug, info, warn};
use logging_timer::time;

mod args;

pub const PROGRAM_NAME: &str = env!("CARGO_PKG_NAME");

#[time]
fn main() -> Result<()> {
    configure_logging();
    info!("Starting {PROGRAM_NAME}");

    let args = parse_args();
    debug!("{:?}", &args);

    let config = match &args.config {
        Some(path) => PipelineConfig::from_json_file(path)?,
        None => PipelineConfig::default(),
    };
    let pipeline = Pipeline::new(config)?;

    let mut store = open_store(&args)?;
    if store.is_empty() {
        warn!("No points to process, exiting");
        return Ok(());
    }

    let mode = if args.full {
        info!("'--full' specified, every stage will be recomputed from scratch");
        RunMode::FullRecompute
    } else {
        RunMode::Incremental
    };

    let mut sink = LogSink;
    let outcome = pipeline.run(&mut store, &mut sink, mode);

    // Committed batches survive a failed stage, so save before reporting it.
    if let Some(state) = &args.state {
        store.save(state)?;
    }
    let report = outcome?;

    write_outputs(&args, &store, pipeline.config().stays.strategy)?;

    if args.report {
        println!("{}", serde_json::to_string_pretty(&report)?);
    }

    Ok(())
}

/// The snapshot named by `--state` if it exists, otherwise an empty store,
/// with the points of every input file merged in.
fn open_store(args: &Args) -> Result<MemoryStore> {
    let mut store = match &args.state {
        Some(path) if path.exists() => MemoryStore::load(path)?,
        _ => MemoryStore::new(Vec::new())?,
    };

    for f in &args.files {
        if !f.exists() {
            bail!("Input file {:?} does not exist", f);
        }
        let points = read_points_from_file(f)?;
        let added = store.merge_points(points)?;
        info!("Added {added} new points from {:?}", f);
    }

    Ok(store)
}

fn write_outputs(args: &Args, store: &MemoryStore, strategy: StayStrategy) -> Result<()> {
    if let Some(points_csv) = &args.points_csv {
        write_points_to_file(points_csv, store.points())?;
    }

    if let Some(xlsx) = &args.xlsx {
        let segments = store.segments()?;
        let trips = store.trips()?;
        let stays = store.stays(strategy)?;
        let data = SummaryData {
            points: store.points(),
            segments: &segments,
            stays: &stays,
            trips: &trips,
        };
        let workbook = create_summary_xlsx(&data)?;
        write_summary_to_file(xlsx, workbook)?;
    }

    Ok(())
}

fn configure_logging() {
    let mut builder = Builder::from_default_env();

    builder.format(|buf, record| {
        let level_style = buf.default_level_style(record.level());
        let level_style = match record.level() {
            log::Level::Error => level_style.fg_color(Some(AnsiColor::Red.into())),
            log::Level::Warn => level_style.fg_color(Some(AnsiColor::Yellow.into())),
            log::Level::Info => level_style.fg_color(Some(AnsiColor::Green.into())),
            log::Level::Debug => level_style.fg_color(Some(AnsiColor::Blue.into())),
            log::Level::Trace => level_style.fg_color(Some(AnsiColor::Magenta.into())),
        };

        let target_style = buf
            .default_level_style(record.level())
            .fg_color(Some(AnsiColor::Cyan.into()));

        match record.line() {
            Some(line) => writeln!(
                buf,
                "[{} {level_style}{}{level_style:#} {target_style}{}:{}{target_style:#}] {}",
                buf.timestamp(),
                record.level(),
                record.target(),
                line,
                record.args()
            ),
            None => writeln!(
                buf,
                "[{} {level_style}{}{level_style:#} {target_style}{}{target_style:#}] {}",
                buf.timestamp(),
                record.level(),
                record.target(),
                record.args()
            ),
        }
    });

    builder.init();
}
