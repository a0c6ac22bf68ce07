// USAGE  cargo run --release --bin txt2daily -- GRIDDESC 12US2 2020 'GLOB_GEOSchem_2020*.txt.gz' out/finn_2020.nc

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::info;

use finn_to_cmaq::{daily, griddesc::Grid, init_logging, inventory, timeit};

/// Grid raw FINN fire detections into a daily IOAPI-like NetCDF file
#[derive(Parser, Debug)]
#[command(name = "txt2daily", version, about, long_about = None)]
struct Args {
    /// Increase log verbosity (repeatable)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Deflate level for the output (0 disables compression)
    #[arg(long, default_value_t = 1)]
    complevel: i32,

    /// GRIDDESC file describing the target grid
    griddesc: PathBuf,

    /// Grid name within GRIDDESC
    gdnam: String,

    /// Inventory year; DAY columns are days of this year
    year: i32,

    /// FINN text, .gz or .tar.gz file (a glob pattern merges several)
    finnpath: String,

    /// Output NetCDF path
    outpath: PathBuf,
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    if args.outpath.exists() {
        info!("Keeping cached {}", args.outpath.display());
        return Ok(());
    }

    let grid = Grid::from_griddesc(&args.griddesc, &args.gdnam)?;
    let table = timeit("read_inventory", || inventory::read_inventory(&args.finnpath))?;
    let mut outf = timeit("grid_daily", || daily::grid_daily(&grid, args.year, &table))?;
    daily::set_history(&mut outf, args.finnpath.as_ref());

    timeit("save", || daily::save(&mut outf, &args.outpath, args.complevel))?;
    info!("Finished OK, wrote {} days → {}", outf.nsteps(), args.outpath.display());
    Ok(())
}
