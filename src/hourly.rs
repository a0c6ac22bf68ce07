//! Daily gridded totals → hourly, layered, re-speciated files (one per day).

use std::{
    fmt::Write as _,
    fs,
    path::{Path, PathBuf},
};

use anyhow::{anyhow, bail, Context, Result};
use chrono::{NaiveDate, NaiveDateTime};
use ndarray::{Array4, Axis};
use rayon::prelude::*;
use tracing::{debug, info};

use crate::{
    griddesc::Grid,
    ioapi::{date_to_yyyyddd, partial_path, IoapiFile, IoapiHeader, IoapiWriter, VarMeta, WriteOptions},
    projection::CoordSys,
    speciation::Script,
    temporal::{TemporalProfile, NSTEPS},
    timeit,
    vertical::LayerFractions,
};

// Memory allowed for output variables computed concurrently before each
// sequential write.
const BATCH_BYTES: usize = 1 << 30;

const FILEDESC: &str =
    "FINN emissions as 3d hourly files with species and units converted for use with CMAQ.";

#[derive(Debug, Clone)]
pub struct HourlyConfig {
    pub inpath:    PathBuf,
    /// strftime template for output paths, e.g. `out/FINN_%Y-%m-%d.nc`
    pub outtmp:    String,
    pub tpropath:  PathBuf,
    pub layerpath: PathBuf,
    pub exprpath:  PathBuf,
    /// only these days, when non-empty
    pub dates:     Vec<NaiveDate>,
    /// speciated variables not carried to the output
    pub exclude:   Vec<String>,
    pub complevel: i32,
}

impl HourlyConfig {
    pub fn new(inpath: impl Into<PathBuf>, outtmp: impl Into<String>) -> Self {
        HourlyConfig {
            inpath:    inpath.into(),
            outtmp:    outtmp.into(),
            tpropath:  PathBuf::from("aux/tpro.txt"),
            layerpath: PathBuf::from("aux/layerfrac.csv"),
            exprpath:  PathBuf::from("aux/gc12_to_cb6r3_ae7.txt"),
            dates:     Vec::new(),
            exclude:   vec!["AREA".to_string()],
            complevel: 1,
        }
    }
}

/// What happened to each day of the input.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct HourlyReport {
    pub written: Vec<PathBuf>,
    pub kept:    Vec<PathBuf>,
    pub skipped: Vec<NaiveDate>,
}

/// Reject templates that cannot format a timezone-less date-time.
pub fn check_template(tmpl: &str) -> Result<()> {
    let sample = NaiveDate::from_ymd_opt(2000, 1, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .ok_or_else(|| anyhow!("bad sample date"))?;
    output_path(tmpl, sample).map(|_| ())
}

pub fn output_path(tmpl: &str, time: NaiveDateTime) -> Result<PathBuf> {
    let mut path = String::new();
    write!(path, "{}", time.format(tmpl))
        .map_err(|_| anyhow!("invalid strftime template {tmpl:?}"))?;
    Ok(PathBuf::from(path))
}

/// Variables per parallel batch, each holding `values_per_var` floats.
pub fn batch_size(values_per_var: usize) -> usize {
    let bytes = values_per_var.saturating_mul(std::mem::size_of::<f32>()).max(1);
    (BATCH_BYTES / bytes).max(1)
}

/// Rebuild the grid a daily file sits on, for cell-centre longitudes.
pub fn grid_of(header: &IoapiHeader) -> Result<Grid> {
    let coord = CoordSys {
        gdtyp: header.gdtyp,
        p_alp: header.p_alp,
        p_bet: header.p_bet,
        p_gam: header.p_gam,
        xcent: header.xcent,
        ycent: header.ycent,
    };
    Grid::new(
        &header.gdnam,
        coord,
        (header.xorig, header.yorig),
        (header.xcell, header.ycell),
        (header.ncols, header.nrows),
        header.nthik,
    )
}

/// `factor[t, z, r, c] = tfactor[t, 0, r, c] * frac[z] / 3600`: daily total
/// → per-second rate in layer `z` at instant `t`.
pub fn reallocation_factors(tfactor: &Array4<f32>, layers: &LayerFractions) -> Array4<f32> {
    let (nt, _, nr, nc) = tfactor.dim();
    let nz = layers.nlays();
    let mut out = Array4::<f32>::zeros((nt, nz, nr, nc));
    for (z, frac) in layers.frac.iter().enumerate() {
        let scale = (*frac / 3600.0) as f32;
        out.index_axis_mut(Axis(1), z)
            .assign(&tfactor.index_axis(Axis(1), 0).mapv(|f| f * scale));
    }
    out
}

/// One day of one variable: `(1, R, C)` daily slice broadcast over `factor`.
pub fn hourly_values(daily: &Array4<f32>, step: usize, factor: &Array4<f32>) -> Array4<f32> {
    let slice = daily.index_axis(Axis(0), step);
    factor * &slice
}

fn hourly_meta(meta: &VarMeta) -> VarMeta {
    VarMeta { units: meta.units.replace("/day", "/s"), ..meta.clone() }
}

fn hourly_header(daily: &IoapiHeader, date: NaiveDate, layers: &LayerFractions, inpath: &Path) -> IoapiHeader {
    let mut h = daily.clone();
    h.sdate = date_to_yyyyddd(date);
    h.stime = 0;
    h.tstep = 10000;
    h.nlays = layers.nlays();
    h.vglvls = layers.vglvls.clone();
    h.upnam = "daily2hourly3d".to_string();
    h.filedesc = FILEDESC.to_string();
    h.history = format!(
        "{}; Converted to hourly 3D IOAPI-like file from {} using daily2hourly3d (v{})",
        daily.history.trim(),
        inpath.display(),
        crate::VERSION
    );
    h.stamp();
    h
}

// ─────────────────────────────────────────────────────────────────────
// Driver
// ─────────────────────────────────────────────────────────────────────
pub fn daily2hourly3d(cfg: &HourlyConfig) -> Result<HourlyReport> {
    check_template(&cfg.outtmp)?;
    info!("Preparing inputs and factors");

    let mut spcf = timeit("read_daily", || IoapiFile::read(&cfg.inpath))?;
    let grid = grid_of(&spcf.header)?;
    let tfactor = TemporalProfile::from_path(&cfg.tpropath)?.grid_factors(&grid)?;
    let layers = LayerFractions::from_path(&cfg.layerpath)?;
    let script = Script::from_path(&cfg.exprpath)?;

    let assigned = timeit("speciate", || script.apply(&mut spcf))?;
    let factor = reallocation_factors(&tfactor, &layers);

    let outkeys: Vec<usize> = assigned
        .iter()
        .filter(|name| name.as_str() != "TFLAG" && !cfg.exclude.contains(*name))
        .filter_map(|name| spcf.vars.iter().position(|v| &v.meta.name == name))
        .collect();
    if outkeys.is_empty() {
        bail!("speciation assigns no variables to write (after exclusions)");
    }
    let metas: Vec<VarMeta> = outkeys.iter().map(|&k| hourly_meta(&spcf.vars[k].meta)).collect();
    debug!("output variables: {:?}", metas.iter().map(|m| &m.name).collect::<Vec<_>>());

    let times = spcf.times()?;
    if let Some(want) = cfg.dates.iter().find(|d| !times.iter().any(|t| t.date() == **d)) {
        return Err(anyhow!("requested date {want} is not in {}", cfg.inpath.display()));
    }

    let batch = batch_size(factor.len());
    debug!("computing {batch} variables per batch");
    let opts = WriteOptions { complevel: cfg.complevel, unlimited: false };
    let mut report = HourlyReport::default();

    info!("Processing days");
    for (ti, time) in times.into_iter().enumerate() {
        let date = time.date();
        if !cfg.dates.is_empty() && !cfg.dates.contains(&date) {
            debug!("Skipping {date}");
            report.skipped.push(date);
            continue;
        }
        let outpath = output_path(&cfg.outtmp, time)?;
        if let Some(dir) = outpath.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
        }
        if outpath.exists() {
            info!("Keeping {}", outpath.display());
            report.kept.push(outpath);
            continue;
        }

        info!("Processing {date}");
        let header = hourly_header(&spcf.header, date, &layers, &cfg.inpath);
        let partial = partial_path(&outpath);
        let mut w = IoapiWriter::create(&partial, &header, &metas, NSTEPS, opts)?;

        let keyed: Vec<(usize, &VarMeta)> = outkeys.iter().copied().zip(&metas).collect();
        for chunk in keyed.chunks(batch) {
            let computed: Vec<(&str, Array4<f32>)> = chunk
                .par_iter()
                .map(|&(k, meta)| (meta.name.as_str(), hourly_values(&spcf.vars[k].data, ti, &factor)))
                .collect();
            for (name, values) in &computed {
                debug!("{name}");
                w.put(name, values.view())?;
            }
        }
        w.finish();
        fs::rename(&partial, &outpath)
            .with_context(|| format!("moving {} into place", partial.display()))?;
        info!("Saved {}", outpath.display());
        report.written.push(outpath);
    }

    Ok(report)
}
