use std::{fs::File, io::Write, path::Path};

use approx::assert_abs_diff_eq;
use chrono::NaiveDate;
use flate2::{write::GzEncoder, Compression};

use netcdf::AttributeValue;

use finn_to_cmaq::{
    daily,
    griddesc::{Grid, GridDesc},
    hourly::{daily2hourly3d, HourlyConfig},
    inventory,
    ioapi::IoapiFile,
    temporal::TemporalProfile,
};

const GRIDDESC: &str = "tests/data/GRIDDESC";

fn gzip_fixture(dir: &Path) -> String {
    let target = dir.join("GLOB_GEOSchem_2020214.txt.gz");
    let text = std::fs::read("tests/data/finn_sample.txt").unwrap();
    let mut enc = GzEncoder::new(File::create(&target).unwrap(), Compression::default());
    enc.write_all(&text).unwrap();
    enc.finish().unwrap();
    target.to_string_lossy().into_owned()
}

fn make_daily(dir: &Path) -> std::path::PathBuf {
    let grid = Grid::from_griddesc(GRIDDESC.as_ref(), "TEST4X3").unwrap();
    let finn = gzip_fixture(dir);
    let table = inventory::read_inventory(&finn).unwrap();
    let mut f = daily::grid_daily(&grid, 2020, &table).unwrap();
    daily::set_history(&mut f, finn.as_ref());
    let out = dir.join("daily").join("finn_2020.nc");
    daily::save(&mut f, &out, 1).unwrap();
    out
}

fn text(value: AttributeValue) -> String {
    match value {
        AttributeValue::Str(s) => s,
        other => panic!("expected text, got {other:?}"),
    }
}

fn global(nc: &netcdf::File, name: &str) -> AttributeValue {
    nc.attribute(name).unwrap().value().unwrap()
}

fn config(inpath: &Path, outtmp: String) -> HourlyConfig {
    HourlyConfig {
        tpropath:  "tests/data/tpro_flat.txt".into(),
        layerpath: "tests/data/layerfrac.csv".into(),
        exprpath:  "tests/data/speciation.txt".into(),
        ..HourlyConfig::new(inpath, outtmp)
    }
}

#[test]
fn test_griddesc_fixture() {
    let desc = GridDesc::from_path(GRIDDESC.as_ref()).unwrap();
    let g = desc.grid("12US2").unwrap();
    assert_eq!((g.ncols, g.nrows), (396, 246));
    assert_eq!(g.ll2ij(-97.0, 40.0), Some((201, 135)));
}

#[test]
fn test_daily_roundtrip_through_netcdf() {
    let dir = tempfile::tempdir().unwrap();
    let path = make_daily(dir.path());
    assert!(!dir.path().join("daily").join("finn_2020.nc.part").exists());

    let f = IoapiFile::read(&path).unwrap();
    assert_eq!(f.header.sdate, 2020214);
    assert_eq!(f.header.tstep, 240000);
    assert_eq!(f.header.gdnam, "TEST4X3");
    assert_eq!(f.header.upnam, "txt2daily");
    assert!(f.header.history.contains("GLOB_GEOSchem_2020214.txt.gz"));
    assert_eq!(f.nsteps(), 3);
    assert_eq!(
        f.var_names(),
        ["DAY", "I", "J", "TIME", "GENVEG", "latitude", "longitude", "AREA", "CO2", "CO", "OC", "BC"]
    );

    let co = f.var("CO").unwrap();
    assert_eq!(co.meta.units, "moles/day");
    assert_abs_diff_eq!(co.data[[0, 0, 0, 0]], 72.0);
    assert_abs_diff_eq!(co.data[[2, 0, 2, 3]], 96.0);
    assert_abs_diff_eq!(co.data.sum(), 168.0);
    assert_eq!(f.var("BC").unwrap().meta.units, "kg/day");
}

#[test]
fn test_hourly_files_carry_reallocated_rates() {
    let dir = tempfile::tempdir().unwrap();
    let daily_path = make_daily(dir.path());
    let tmpl = format!("{}/hourly/%Y/FINN_%Y-%m-%d.nc", dir.path().display());

    let report = daily2hourly3d(&config(&daily_path, tmpl.clone())).unwrap();
    assert_eq!(report.written.len(), 3);
    assert!(report.kept.is_empty() && report.skipped.is_empty());

    let first = dir.path().join("hourly/2020/FINN_2020-08-01.nc");
    assert_eq!(report.written[0], first);
    let h = IoapiFile::read(&first).unwrap();
    assert_eq!(h.header.sdate, 2020214);
    assert_eq!(h.header.tstep, 10000);
    assert_eq!(h.header.nlays, 3);
    assert_eq!(h.header.vglvls, vec![1.0, 0.995, 0.99, 0.98]);
    assert_eq!(h.header.upnam, "daily2hourly3d");
    assert!(h.header.history.contains("Converted to hourly 3D"));
    assert_eq!(h.var_names(), ["CO2", "CO", "POC", "PEC"]);

    // flat profile: 72 moles/day → 72/24 per hour, half in layer 0, per second
    let co = h.var("CO").unwrap();
    assert_eq!(co.meta.units, "moles/s");
    assert_eq!(co.data.dim(), (25, 3, 3, 4));
    assert_abs_diff_eq!(co.data[[0, 0, 0, 0]], 72.0 / 24.0 * 0.5 / 3600.0, epsilon = 1e-9);
    assert_abs_diff_eq!(co.data[[24, 2, 0, 0]], 72.0 / 24.0 * 0.2 / 3600.0, epsilon = 1e-9);
    assert_eq!(co.data[[12, 0, 1, 1]], 0.0);

    let poc = h.var("POC").unwrap();
    assert_eq!(poc.meta.units, "kg/s");
    assert_abs_diff_eq!(poc.data[[5, 1, 0, 0]], 1.8 / 24.0 * 0.3 / 3600.0, epsilon = 1e-9);

    let nc = netcdf::open(&first).unwrap();
    let tflag: Vec<i32> = nc.variable("TFLAG").unwrap().get_values(..).unwrap();
    assert_eq!(tflag.len(), 25 * 4 * 2);
    assert_eq!(&tflag[tflag.len() - 2..], &[2020215, 0]);

    // second pass keeps everything
    let again = daily2hourly3d(&config(&daily_path, tmpl)).unwrap();
    assert!(again.written.is_empty());
    assert_eq!(again.kept.len(), 3);
}

#[test]
fn test_hourly_attributes_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let daily_path = make_daily(dir.path());
    let mut cfg = config(&daily_path, format!("{}/h/FINN_%Y%j.nc", dir.path().display()));
    cfg.dates = vec![NaiveDate::from_ymd_opt(2020, 8, 1).unwrap()];
    let report = daily2hourly3d(&cfg).unwrap();

    let nc = netcdf::open(&report.written[0]).unwrap();
    assert!(matches!(global(&nc, "NVARS"), AttributeValue::Int(4)));
    assert!(matches!(global(&nc, "NLAYS"), AttributeValue::Int(3)));
    assert_eq!(
        text(global(&nc, "VAR-LIST")),
        format!("{:<16}{:<16}{:<16}{:<16}", "CO2", "CO", "POC", "PEC")
    );
    assert_eq!(text(global(&nc, "GDNAM")), format!("{:<16}", "TEST4X3"));
    assert_eq!(text(global(&nc, "FILEDESC")).len(), 4800);
    let history = text(global(&nc, "HISTORY"));
    assert_eq!(history.len(), 4800);
    assert!(history.starts_with("Gridded FINN daily emissions from "));

    let poc = nc.variable("POC").unwrap();
    let attr = |key: &str| text(poc.attribute_value(key).unwrap().unwrap());
    assert_eq!(attr("long_name"), format!("{:<16}", "POC"));
    assert_eq!(attr("units"), format!("{:<16}", "kg/s"));
    assert_eq!(attr("var_desc").len(), 80);
    assert!(attr("var_desc").starts_with("POC "));
}

#[test]
fn test_date_subset() {
    let dir = tempfile::tempdir().unwrap();
    let daily_path = make_daily(dir.path());
    let tmpl = format!("{}/subset/FINN_%Y%j.nc", dir.path().display());

    let mut cfg = config(&daily_path, tmpl.clone());
    cfg.dates = vec![NaiveDate::from_ymd_opt(2020, 8, 3).unwrap()];
    let report = daily2hourly3d(&cfg).unwrap();
    assert_eq!(report.written, vec![dir.path().join("subset/FINN_2020216.nc")]);
    assert_eq!(report.skipped.len(), 2);

    cfg.dates = vec![NaiveDate::from_ymd_opt(2021, 1, 1).unwrap()];
    assert!(daily2hourly3d(&cfg).is_err());
}

#[test]
fn test_timezone_shift_on_lambert_grid() {
    let grid = Grid::from_griddesc(GRIDDESC.as_ref(), "12US2").unwrap();
    let mut raw = [0.0; 24];
    raw[12] = 1.0; // local 12-13h
    let f = TemporalProfile::new(raw).unwrap().grid_factors(&grid).unwrap();
    let (i, j) = grid.ll2ij(-97.0, 40.0).unwrap();
    // UTC-6: the local-noon peak lands at 18Z and 19Z
    assert_abs_diff_eq!(f[[18, 0, j, i]], 0.5);
    assert_abs_diff_eq!(f[[19, 0, j, i]], 0.5);
    assert_abs_diff_eq!(f[[12, 0, j, i]], 0.0);
}
