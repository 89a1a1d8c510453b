use std::path::PathBuf;

use clap::Parser;

/*
 footprint POINTS.csv                              incremental run, nothing persisted
 footprint --state state.json POINTS.csv           merge into the snapshot, run, save it
 footprint --state state.json                      resume an interrupted run
 footprint --full --config cfg.json POINTS.csv     recompute every stage from scratch
 footprint --xlsx out.xlsx --points-csv out.csv    also write the outputs
*/

/// Returns the parsed command line options.
pub fn parse_args() -> Args {
    Args::parse()
}

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
pub struct Args {
    #[arg(
        short,
        long,
        help = "JSON file of pipeline settings. Settings not named keep their defaults"
    )]
    pub config: Option<PathBuf>,

    #[arg(
        short,
        long,
        default_value = "false",
        help = "Clear everything previously derived and recompute all stages (FULL_RECOMPUTE). \
                Without this only unprocessed points are handled (INCREMENTAL)"
    )]
    pub full: bool,

    #[arg(
        short,
        long,
        help = "Snapshot file holding the store between runs. Loaded if it exists, \
                the input points are merged into it, and it is saved after the run"
    )]
    pub state: Option<PathBuf>,

    #[arg(short, long, help = "Write a summary workbook in .xlsx format")]
    pub xlsx: Option<PathBuf>,

    #[arg(long, help = "Write every point with its annotations to a CSV file")]
    pub points_csv: Option<PathBuf>,

    #[arg(
        long,
        default_value = "false",
        help = "Print the run report as JSON on stdout"
    )]
    pub report: bool,

    #[arg(help = "CSV files of GPS points to add before running")]
    pub files: Vec<PathBuf>,
}
