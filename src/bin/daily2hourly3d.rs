// USAGE  cargo run --release --bin daily2hourly3d -- -d 2020-08-01 out/finn_2020.nc 'hourly/%Y/FINN_%Y-%m-%d.nc'

use std::path::PathBuf;

use anyhow::Result;
use chrono::NaiveDate;
use clap::Parser;
use tracing::info;

use finn_to_cmaq::{
    hourly::{daily2hourly3d, HourlyConfig},
    init_logging,
};

/// Convert a daily FINN file to hourly, layered, CMAQ-ready files
#[derive(Parser, Debug)]
#[command(name = "daily2hourly3d", version, about, long_about = None)]
struct Args {
    /// Increase log verbosity (repeatable)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Layer fraction file
    #[arg(short, long, default_value = "aux/layerfrac.csv")]
    layerpath: PathBuf,

    /// Hourly temporal profile path
    #[arg(short, long, default_value = "aux/tpro.txt")]
    tpropath: PathBuf,

    /// Speciation conversion script path
    #[arg(short, long, default_value = "aux/gc12_to_cb6r3_ae7.txt")]
    exprpath: PathBuf,

    /// Process only this date YYYY-MM-DD (use multiple times)
    #[arg(short = 'd', long = "date", value_parser = parse_date)]
    dates: Vec<NaiveDate>,

    /// Variable to leave out of the output (use multiple times)
    #[arg(short = 'x', long, default_values_t = [String::from("AREA")])]
    exclude: Vec<String>,

    /// Deflate level for the output (0 disables compression)
    #[arg(long, default_value_t = 1)]
    complevel: i32,

    /// Daily IOAPI-like file written by txt2daily
    inpath: PathBuf,

    /// strftime template for hourly output (e.g. FINN_v1.5_%Y-%m-%d.nc)
    outtmp: String,
}

fn parse_date(s: &str) -> Result<NaiveDate, chrono::ParseError> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let cfg = HourlyConfig {
        tpropath:  args.tpropath,
        layerpath: args.layerpath,
        exprpath:  args.exprpath,
        dates:     args.dates,
        exclude:   args.exclude,
        complevel: args.complevel,
        ..HourlyConfig::new(args.inpath, args.outtmp)
    };
    let report = daily2hourly3d(&cfg)?;
    info!(
        "Finished OK: {} written, {} kept, {} skipped",
        report.written.len(),
        report.kept.len(),
        report.skipped.len()
    );
    Ok(())
}
