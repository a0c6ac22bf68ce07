//! IOAPI-like NetCDF files: header metadata, TFLAG bookkeeping, reading and writing.
//!
//! Layout follows the Models-3 I/O API conventions CMAQ expects: every data
//! variable is `(TSTEP, LAY, ROW, COL)` float, `TFLAG(TSTEP, VAR, DATE-TIME)`
//! comes first, and grid/time metadata live in global attributes.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, Timelike, Utc};
use ndarray::{Array4, ArrayView4};
use netcdf::AttributeValue;
use tracing::debug;

use crate::griddesc::Grid;

// ─────────────────────────────────────────────────────────────────────
// Constants
// ─────────────────────────────────────────────────────────────────────
pub const NAMLEN:  usize = 16;
pub const DESCLEN: usize = 80;
pub const MXDLEN:  usize = 60 * 80;
pub const GRDDED3: i32   = 1;
pub const IMISS:   i32   = -9999;

const IOAPI_VERSION: &str = "ioapi-3.2 (finn_to_cmaq)";

/// Left-justify `s` in a field of `n` characters (never truncates).
pub fn pad(s: &str, n: usize) -> String {
    format!("{s:<n$}")
}

/// Left-justify and cut to exactly `n` characters.
pub fn pad_trunc(s: &str, n: usize) -> String {
    pad(s, n).chars().take(n).collect()
}

/// Name a file is written under until it is complete.
pub fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    path.with_file_name(name)
}

// ─────────────────────────────────────────────────────────────────────
// Date helpers
// ─────────────────────────────────────────────────────────────────────
pub fn yyyyddd_to_date(yyyyddd: i32) -> Result<NaiveDate> {
    NaiveDate::from_yo_opt(yyyyddd / 1000, (yyyyddd % 1000) as u32)
        .ok_or_else(|| anyhow!("invalid YYYYDDD date {yyyyddd}"))
}

pub fn date_to_yyyyddd(date: NaiveDate) -> i32 {
    date.year() * 1000 + date.ordinal() as i32
}

/// HHMMSS (hours may exceed 24, sign applies to the whole value) → duration.
pub fn hhmmss_to_duration(hhmmss: i32) -> Duration {
    let sign = if hhmmss < 0 { -1 } else { 1 };
    let v = i64::from(hhmmss.unsigned_abs());
    let secs = (v / 10000) * 3600 + (v / 100 % 100) * 60 + v % 100;
    Duration::seconds(sign * secs)
}

pub fn hhmmss(time: NaiveTime) -> i32 {
    (time.hour() * 10000 + time.minute() * 100 + time.second()) as i32
}

pub fn tflag_pair(t: NaiveDateTime) -> [i32; 2] {
    [date_to_yyyyddd(t.date()), hhmmss(t.time())]
}

// ─────────────────────────────────────────────────────────────────────
// Metadata
// ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct VarMeta {
    pub name:      String,
    pub units:     String,
    pub long_name: String,
    pub var_desc:  String,
}

impl VarMeta {
    pub fn new(name: &str, units: &str) -> Self {
        VarMeta {
            name:      name.to_string(),
            units:     units.to_string(),
            long_name: name.to_string(),
            var_desc:  name.to_string(),
        }
    }
}

/// Global attributes of an IOAPI gridded file. Strings are held unpadded.
#[derive(Debug, Clone, PartialEq)]
pub struct IoapiHeader {
    pub ftype:    i32,
    pub cdate:    i32,
    pub ctime:    i32,
    pub wdate:    i32,
    pub wtime:    i32,
    pub sdate:    i32,
    pub stime:    i32,
    pub tstep:    i32,
    pub nthik:    i32,
    pub ncols:    usize,
    pub nrows:    usize,
    pub nlays:    usize,
    pub gdtyp:    i32,
    pub p_alp:    f64,
    pub p_bet:    f64,
    pub p_gam:    f64,
    pub xcent:    f64,
    pub ycent:    f64,
    pub xorig:    f64,
    pub yorig:    f64,
    pub xcell:    f64,
    pub ycell:    f64,
    pub vgtyp:    i32,
    pub vgtop:    f32,
    pub vglvls:   Vec<f32>,
    pub gdnam:    String,
    pub upnam:    String,
    pub execid:   String,
    pub filedesc: String,
    pub history:  String,
}

impl IoapiHeader {
    /// Single-layer header on `grid`, starting at `sdate` 00Z.
    pub fn for_grid(grid: &Grid, sdate: i32, tstep: i32) -> Self {
        IoapiHeader {
            ftype:    GRDDED3,
            cdate:    0,
            ctime:    0,
            wdate:    0,
            wtime:    0,
            sdate,
            stime:    0,
            tstep,
            nthik:    grid.nthik,
            ncols:    grid.ncols,
            nrows:    grid.nrows,
            nlays:    1,
            gdtyp:    grid.coord.gdtyp,
            p_alp:    grid.coord.p_alp,
            p_bet:    grid.coord.p_bet,
            p_gam:    grid.coord.p_gam,
            xcent:    grid.coord.xcent,
            ycent:    grid.coord.ycent,
            xorig:    grid.xorig,
            yorig:    grid.yorig,
            xcell:    grid.xcell,
            ycell:    grid.ycell,
            vgtyp:    IMISS,
            vgtop:    0.0,
            vglvls:   vec![0.0, 0.0],
            gdnam:    grid.gdnam.clone(),
            upnam:    String::new(),
            execid:   String::new(),
            filedesc: String::new(),
            history:  String::new(),
        }
    }

    /// Set creation/write stamps to now (UTC).
    pub fn stamp(&mut self) {
        let now = Utc::now().naive_utc();
        let [d, t] = tflag_pair(now);
        self.cdate = d;
        self.ctime = t;
        self.wdate = d;
        self.wtime = t;
    }

    pub fn start(&self) -> Result<NaiveDateTime> {
        let midnight = yyyyddd_to_date(self.sdate)?
            .and_hms_opt(0, 0, 0)
            .ok_or_else(|| anyhow!("bad SDATE {}", self.sdate))?;
        Ok(midnight + hhmmss_to_duration(self.stime))
    }

    /// Start of each of `nsteps` time steps.
    pub fn step_times(&self, nsteps: usize) -> Result<Vec<NaiveDateTime>> {
        let t0 = self.start()?;
        let dt = hhmmss_to_duration(self.tstep);
        Ok((0..nsteps).map(|s| t0 + dt * s as i32).collect())
    }

    /// Flattened `TFLAG(TSTEP, VAR, DATE-TIME)`.
    pub fn tflag(&self, nsteps: usize, nvars: usize) -> Result<Vec<i32>> {
        let mut out = Vec::with_capacity(nsteps * nvars * 2);
        for t in self.step_times(nsteps)? {
            let pair = tflag_pair(t);
            for _ in 0..nvars {
                out.extend_from_slice(&pair);
            }
        }
        Ok(out)
    }
}

// ─────────────────────────────────────────────────────────────────────
// Streaming writer
// ─────────────────────────────────────────────────────────────────────

/// Options controlling the on-disk representation.
#[derive(Debug, Clone, Copy)]
pub struct WriteOptions {
    /// deflate level 0-9; 0 disables compression
    pub complevel: i32,
    /// make TSTEP the unlimited dimension
    pub unlimited: bool,
}

impl Default for WriteOptions {
    fn default() -> Self {
        WriteOptions { complevel: 1, unlimited: false }
    }
}

/// Defines an IOAPI file up front, then accepts variable data one at a time.
pub struct IoapiWriter {
    nc:    netcdf::FileMut,
    shape: [usize; 4],
}

impl IoapiWriter {
    pub fn create(
        path:   &Path,
        header: &IoapiHeader,
        vars:   &[VarMeta],
        nsteps: usize,
        opts:   WriteOptions,
    ) -> Result<Self> {
        if vars.is_empty() {
            bail!("{}: refusing to write an IOAPI file with no variables", path.display());
        }
        if let Some(v) = vars.iter().find(|v| v.name.chars().count() > NAMLEN) {
            bail!("variable name {:?} exceeds {NAMLEN} characters", v.name);
        }
        if header.vglvls.len() != header.nlays + 1 {
            bail!("VGLVLS has {} levels for {} layers", header.vglvls.len(), header.nlays);
        }

        let mut nc = netcdf::create_with(path, netcdf::Options::NETCDF4 | netcdf::Options::CLASSIC)
            .with_context(|| format!("creating {}", path.display()))?;

        if opts.unlimited {
            nc.add_unlimited_dimension("TSTEP")?;
        } else {
            nc.add_dimension("TSTEP", nsteps)?;
        }
        nc.add_dimension("DATE-TIME", 2)?;
        nc.add_dimension("LAY",       header.nlays)?;
        nc.add_dimension("VAR",       vars.len())?;
        nc.add_dimension("ROW",       header.nrows)?;
        nc.add_dimension("COL",       header.ncols)?;

        {
            let mut v = nc.add_variable::<i32>("TFLAG", &["TSTEP", "VAR", "DATE-TIME"])?;
            v.put_attribute("units",     pad("<YYYYDDD,HHMMSS>", NAMLEN))?;
            v.put_attribute("long_name", pad("TFLAG", NAMLEN))?;
            v.put_attribute("var_desc",  pad("Timestep-valid flags:  (1) YYYYDDD or (2) HHMMSS", DESCLEN))?;
        }
        for meta in vars {
            let mut v = nc.add_variable::<f32>(&meta.name, &["TSTEP", "LAY", "ROW", "COL"])?;
            v.set_chunking(&[1, header.nlays, header.nrows, header.ncols])?;
            if opts.complevel > 0 {
                v.set_compression(opts.complevel, false)?;
            }
            v.put_attribute("long_name", pad_trunc(&meta.long_name, NAMLEN))?;
            v.put_attribute("units",     pad_trunc(&meta.units, NAMLEN))?;
            v.put_attribute("var_desc",  pad_trunc(&meta.var_desc, DESCLEN))?;
        }

        let var_list: String = vars.iter().map(|v| pad(&v.name, NAMLEN)).collect();
        nc.add_attribute("IOAPI_VERSION", pad(IOAPI_VERSION, DESCLEN))?;
        nc.add_attribute("EXEC_ID",       pad(&header.execid, DESCLEN))?;
        nc.add_attribute("FTYPE",         header.ftype)?;
        nc.add_attribute("CDATE",         header.cdate)?;
        nc.add_attribute("CTIME",         header.ctime)?;
        nc.add_attribute("WDATE",         header.wdate)?;
        nc.add_attribute("WTIME",         header.wtime)?;
        nc.add_attribute("SDATE",         header.sdate)?;
        nc.add_attribute("STIME",         header.stime)?;
        nc.add_attribute("TSTEP",         header.tstep)?;
        nc.add_attribute("NTHIK",         header.nthik)?;
        nc.add_attribute("NCOLS",         header.ncols as i32)?;
        nc.add_attribute("NROWS",         header.nrows as i32)?;
        nc.add_attribute("NLAYS",         header.nlays as i32)?;
        nc.add_attribute("NVARS",         vars.len() as i32)?;
        nc.add_attribute("GDTYP",         header.gdtyp)?;
        nc.add_attribute("P_ALP",         header.p_alp)?;
        nc.add_attribute("P_BET",         header.p_bet)?;
        nc.add_attribute("P_GAM",         header.p_gam)?;
        nc.add_attribute("XCENT",         header.xcent)?;
        nc.add_attribute("YCENT",         header.ycent)?;
        nc.add_attribute("XORIG",         header.xorig)?;
        nc.add_attribute("YORIG",         header.yorig)?;
        nc.add_attribute("XCELL",         header.xcell)?;
        nc.add_attribute("YCELL",         header.ycell)?;
        nc.add_attribute("VGTYP",         header.vgtyp)?;
        nc.add_attribute("VGTOP",         header.vgtop)?;
        nc.add_attribute("VGLVLS",        header.vglvls.clone())?;
        nc.add_attribute("GDNAM",         pad(&header.gdnam, NAMLEN))?;
        nc.add_attribute("UPNAM",         pad(&header.upnam, NAMLEN))?;
        nc.add_attribute("VAR-LIST",      var_list)?;
        nc.add_attribute("FILEDESC",      pad_trunc(&header.filedesc, MXDLEN))?;
        nc.add_attribute("HISTORY",       pad_trunc(&header.history, MXDLEN))?;

        let tflag = header.tflag(nsteps, vars.len())?;
        nc.variable_mut("TFLAG")
            .ok_or_else(|| anyhow!("TFLAG vanished"))?
            .put_values(&tflag, (&[0usize; 3], &[nsteps, vars.len(), 2]))?;

        Ok(IoapiWriter { nc, shape: [nsteps, header.nlays, header.nrows, header.ncols] })
    }

    /// Write all steps of one variable.
    pub fn put(&mut self, name: &str, data: ArrayView4<f32>) -> Result<()> {
        if data.shape() != self.shape {
            bail!("{name}: data shape {:?} does not match file shape {:?}", data.shape(), self.shape);
        }
        let data = data.as_standard_layout();
        let flat = data.as_slice().ok_or_else(|| anyhow!("{name}: non-contiguous data"))?;
        self.nc
            .variable_mut(name)
            .ok_or_else(|| anyhow!("variable {name} was not defined"))?
            .put_values(flat, (&[0usize; 4], &self.shape))?;
        Ok(())
    }

    /// Flush and close.
    pub fn finish(self) {
        drop(self.nc);
    }
}

// ─────────────────────────────────────────────────────────────────────
// In-memory file
// ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct IoapiVar {
    pub meta: VarMeta,
    pub data: Array4<f32>,
}

#[derive(Debug, Clone)]
pub struct IoapiFile {
    pub header: IoapiHeader,
    pub vars:   Vec<IoapiVar>,
}

impl IoapiFile {
    pub fn new(header: IoapiHeader) -> Self {
        IoapiFile { header, vars: Vec::new() }
    }

    pub fn nsteps(&self) -> usize {
        self.vars.first().map_or(0, |v| v.data.shape()[0])
    }

    pub fn var(&self, name: &str) -> Option<&IoapiVar> {
        self.vars.iter().find(|v| v.meta.name == name)
    }

    pub fn var_mut(&mut self, name: &str) -> Option<&mut IoapiVar> {
        self.vars.iter_mut().find(|v| v.meta.name == name)
    }

    /// Insert or replace by name, keeping the original position on replace.
    pub fn set_var(&mut self, var: IoapiVar) {
        match self.vars.iter_mut().find(|v| v.meta.name == var.meta.name) {
            Some(slot) => *slot = var,
            None => self.vars.push(var),
        }
    }

    pub fn remove_var(&mut self, name: &str) -> Option<IoapiVar> {
        let idx = self.vars.iter().position(|v| v.meta.name == name)?;
        Some(self.vars.remove(idx))
    }

    pub fn var_names(&self) -> Vec<&str> {
        self.vars.iter().map(|v| v.meta.name.as_str()).collect()
    }

    /// Bring header dimensions in line with the variables.
    pub fn update_meta(&mut self) -> Result<()> {
        let Some(first) = self.vars.first() else { return Ok(()) };
        let shape = first.data.shape().to_vec();
        if let Some(bad) = self.vars.iter().find(|v| v.data.shape() != shape.as_slice()) {
            bail!("variable {} has shape {:?}, expected {:?}", bad.meta.name, bad.data.shape(), shape);
        }
        self.header.nlays = shape[1];
        self.header.nrows = shape[2];
        self.header.ncols = shape[3];
        if self.header.vglvls.len() != self.header.nlays + 1 {
            self.header.vglvls.resize(self.header.nlays + 1, 0.0);
        }
        Ok(())
    }

    pub fn times(&self) -> Result<Vec<NaiveDateTime>> {
        self.header.step_times(self.nsteps())
    }

    pub fn write(&mut self, path: &Path, opts: WriteOptions) -> Result<()> {
        self.update_meta()?;
        self.header.stamp();
        let metas: Vec<VarMeta> = self.vars.iter().map(|v| v.meta.clone()).collect();
        let mut w = IoapiWriter::create(path, &self.header, &metas, self.nsteps(), opts)?;
        for v in &self.vars {
            w.put(&v.meta.name, v.data.view())?;
        }
        w.finish();
        debug!("wrote {} variables to {}", metas.len(), path.display());
        Ok(())
    }

    pub fn read(path: &Path) -> Result<Self> {
        let nc = netcdf::open(path).with_context(|| format!("opening {}", path.display()))?;
        let header = read_header(&nc).with_context(|| format!("reading header of {}", path.display()))?;

        let mut vars = Vec::new();
        for var in nc.variables() {
            let name = var.name();
            if name == "TFLAG" { continue }
            let dims: Vec<usize> = var.dimensions().iter().map(|d| d.len()).collect();
            if dims.len() != 4 {
                debug!("skipping {name}: {} dimensions", dims.len());
                continue;
            }
            let values: Vec<f32> = var.get_values::<f32, _>(..)
                .with_context(|| format!("reading {name} from {}", path.display()))?;
            let data = Array4::from_shape_vec((dims[0], dims[1], dims[2], dims[3]), values)?;
            let text = |key: &str| {
                var.attribute_value(key)
                    .and_then(|r| r.ok())
                    .and_then(|v| match v {
                        AttributeValue::Str(s) => Some(s.trim().to_string()),
                        _ => None,
                    })
                    .unwrap_or_default()
            };
            let meta = VarMeta {
                units:     text("units"),
                long_name: text("long_name"),
                var_desc:  text("var_desc"),
                name,
            };
            vars.push(IoapiVar { meta, data });
        }
        Ok(IoapiFile { header, vars })
    }
}

// ─────────────────────────────────────────────────────────────────────
// Global attribute access
// ─────────────────────────────────────────────────────────────────────
fn global(nc: &netcdf::File, name: &str) -> Result<AttributeValue> {
    nc.attribute(name)
        .ok_or_else(|| anyhow!("missing global attribute {name}"))?
        .value()
        .map_err(Into::into)
}

fn global_i32(nc: &netcdf::File, name: &str) -> Result<i32> {
    match global(nc, name)? {
        AttributeValue::Int(v)              => Ok(v),
        AttributeValue::Ints(v) if !v.is_empty() => Ok(v[0]),
        AttributeValue::Short(v)            => Ok(v.into()),
        AttributeValue::Longlong(v)         => Ok(v as i32),
        other => bail!("{name}: expected an integer, got {other:?}"),
    }
}

fn global_f64(nc: &netcdf::File, name: &str) -> Result<f64> {
    match global(nc, name)? {
        AttributeValue::Double(v)  => Ok(v),
        AttributeValue::Float(v)   => Ok(v.into()),
        AttributeValue::Doubles(v) if !v.is_empty() => Ok(v[0]),
        AttributeValue::Floats(v)  if !v.is_empty() => Ok(v[0].into()),
        AttributeValue::Int(v)     => Ok(v.into()),
        other => bail!("{name}: expected a number, got {other:?}"),
    }
}

fn global_f32s(nc: &netcdf::File, name: &str) -> Result<Vec<f32>> {
    match global(nc, name)? {
        AttributeValue::Floats(v)  => Ok(v),
        AttributeValue::Float(v)   => Ok(vec![v]),
        AttributeValue::Doubles(v) => Ok(v.into_iter().map(|x| x as f32).collect()),
        AttributeValue::Double(v)  => Ok(vec![v as f32]),
        other => bail!("{name}: expected floats, got {other:?}"),
    }
}

fn global_str(nc: &netcdf::File, name: &str) -> String {
    match global(nc, name) {
        Ok(AttributeValue::Str(s)) => s.trim().to_string(),
        _ => String::new(),
    }
}

fn read_header(nc: &netcdf::File) -> Result<IoapiHeader> {
    let optional = |name: &str| global_i32(nc, name).unwrap_or_default();
    Ok(IoapiHeader {
        ftype:    global_i32(nc, "FTYPE").unwrap_or(GRDDED3),
        cdate:    optional("CDATE"),
        ctime:    optional("CTIME"),
        wdate:    optional("WDATE"),
        wtime:    optional("WTIME"),
        sdate:    global_i32(nc, "SDATE")?,
        stime:    global_i32(nc, "STIME")?,
        tstep:    global_i32(nc, "TSTEP")?,
        nthik:    optional("NTHIK"),
        ncols:    global_i32(nc, "NCOLS")? as usize,
        nrows:    global_i32(nc, "NROWS")? as usize,
        nlays:    global_i32(nc, "NLAYS")? as usize,
        gdtyp:    global_i32(nc, "GDTYP")?,
        p_alp:    global_f64(nc, "P_ALP")?,
        p_bet:    global_f64(nc, "P_BET")?,
        p_gam:    global_f64(nc, "P_GAM")?,
        xcent:    global_f64(nc, "XCENT")?,
        ycent:    global_f64(nc, "YCENT")?,
        xorig:    global_f64(nc, "XORIG")?,
        yorig:    global_f64(nc, "YORIG")?,
        xcell:    global_f64(nc, "XCELL")?,
        ycell:    global_f64(nc, "YCELL")?,
        vgtyp:    global_i32(nc, "VGTYP").unwrap_or(IMISS),
        vgtop:    global_f64(nc, "VGTOP").unwrap_or_default() as f32,
        vglvls:   global_f32s(nc, "VGLVLS").unwrap_or_else(|_| vec![0.0, 0.0]),
        gdnam:    global_str(nc, "GDNAM"),
        upnam:    global_str(nc, "UPNAM"),
        execid:   global_str(nc, "EXEC_ID"),
        filedesc: global_str(nc, "FILEDESC"),
        history:  global_str(nc, "HISTORY"),
    })
}
