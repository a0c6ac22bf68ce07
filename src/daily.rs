//! Grid raw fire detections into a daily IOAPI file.

use std::{collections::BTreeMap, fs, path::Path};

use anyhow::{anyhow, bail, Context, Result};
use ndarray::Array4;
use tracing::{debug, info};

use crate::{
    griddesc::Grid,
    inventory::FireTable,
    ioapi::{partial_path, IoapiFile, IoapiHeader, IoapiVar, VarMeta, WriteOptions},
};

/// Detections smaller than this (m²) are treated as false positives.
pub const MIN_AREA: f64 = 50.0;

// Largest DAY range (last - first) one inventory year can cover.
const MAX_SPAN: i64 = 366;

/// Units by variable name; everything else is an emission rate.
pub fn units(key: &str) -> &'static str {
    match key {
        "OC" | "BC" | "PM25" => "kg/day",
        "AREA"               => "m**2",
        "longitude"          => "degrees_east",
        "latitude"           => "degrees_north",
        "DAY"                => "day_of_year",
        "HOUR"               => "<HHMM>",
        _                    => "moles/day",
    }
}

fn required<'a>(table: &'a FireTable, name: &str) -> Result<&'a [f64]> {
    table.column(name).ok_or_else(|| anyhow!("inventory has no {name} column"))
}

/// Sum detections per (DAY, I, J) on `grid` and lay them out as daily steps.
pub fn grid_daily(grid: &Grid, year: i32, table: &FireTable) -> Result<IoapiFile> {
    let lon  = required(table, "longitude")?;
    let lat  = required(table, "latitude")?;
    let area = required(table, "AREA")?;
    let day  = required(table, "DAY")?;

    let others: Vec<usize> = table
        .columns
        .iter()
        .enumerate()
        .filter(|(_, c)| c.as_str() != "DAY")
        .map(|(i, _)| i)
        .collect();

    // (day, j, i) → column sums in `others` order
    let mut sums: BTreeMap<(i64, usize, usize), Vec<f64>> = BTreeMap::new();
    let (mut outside, mut small) = (0usize, 0usize);
    for r in 0..table.len() {
        let Some((i, j)) = grid.ll2ij(lon[r], lat[r]) else {
            outside += 1;
            continue;
        };
        if area[r].is_nan() || area[r] < MIN_AREA {
            small += 1;
            continue;
        }
        if day[r].fract() != 0.0 {
            bail!("row {}: DAY {} is not a whole day", r + 2, day[r]);
        }
        let acc = sums
            .entry((day[r] as i64, j, i))
            .or_insert_with(|| vec![0.0; others.len()]);
        for (slot, &c) in acc.iter_mut().zip(&others) {
            *slot += table.values[c][r];
        }
    }
    info!(
        "{} fires: {} outside {}, {} under {MIN_AREA} m², {} grid-day cells",
        table.len(), outside, grid.gdnam, small, sums.len()
    );

    let (Some(&(first, _, _)), Some(&(last, _, _))) = (sums.keys().next(), sums.keys().next_back()) else {
        bail!("no fires inside {} with AREA >= {MIN_AREA}", grid.gdnam);
    };
    if last - first > MAX_SPAN {
        bail!("DAY values span {first}..={last}, more than one year");
    }
    let ndays = (last - first + 1) as usize;
    let sdate = year * 1000 + first as i32;
    debug!("days {first}..={last} → SDATE {sdate}");

    let mut header = IoapiHeader::for_grid(grid, sdate, 240000);
    // validates the start date
    header.start()?;
    header.upnam = "txt2daily".to_string();
    header.filedesc = "FINN fire emissions gridded to daily totals".to_string();

    let shape = (ndays, 1, grid.nrows, grid.ncols);
    let mut keys: Vec<String> = vec!["DAY".into(), "I".into(), "J".into()];
    keys.extend(others.iter().map(|&c| table.columns[c].clone()));
    let mut data: Vec<Array4<f32>> = keys.iter().map(|_| Array4::zeros(shape)).collect();

    for (&(d, j, i), acc) in &sums {
        let t = (d - first) as usize;
        data[0][[t, 0, j, i]] = d as f32;
        data[1][[t, 0, j, i]] = i as f32;
        data[2][[t, 0, j, i]] = j as f32;
        for (k, v) in acc.iter().enumerate() {
            data[3 + k][[t, 0, j, i]] = *v as f32;
        }
    }

    let mut file = IoapiFile::new(header);
    for (key, data) in keys.iter().zip(data) {
        file.set_var(IoapiVar { meta: VarMeta::new(key, units(key)), data });
    }
    file.update_meta()?;
    Ok(file)
}

/// Write with TSTEP unlimited, creating the parent directory first.
pub fn save(file: &mut IoapiFile, outpath: &Path, complevel: i32) -> Result<()> {
    if let Some(dir) = outpath.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    }
    let partial = partial_path(outpath);
    file.write(&partial, WriteOptions { complevel, unlimited: true })?;
    fs::rename(&partial, outpath)
        .with_context(|| format!("moving {} into place", partial.display()))?;
    Ok(())
}

/// Annotate provenance on a freshly gridded file.
pub fn set_history(file: &mut IoapiFile, source: &Path) {
    file.header.history = format!(
        "Gridded FINN daily emissions from {} using txt2daily (v{})",
        source.display(),
        crate::VERSION
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{griddesc::GridDesc, inventory::parse_table};

    fn grid() -> Grid {
        let text = "' '\n'LL'\n1 0 0 0 0 0\n' '\n'G'\n'LL' -100.0 30.0 1.0 1.0 4 3 1\n' '\n";
        GridDesc::parse(text).unwrap().grid("G").unwrap()
    }

    const FIRES: &str = "DAY,LATI,LONGI,AREA,CO,OC\n\
                         10,30.5,-99.5,100,1.0,0.5\n\
                         10,30.6,-99.4,60,2.0,0.25\n\
                         10,30.6,-99.4,10,9.0,9.0\n\
                         12,32.5,-96.5,200,4.0,1.0\n\
                         12,50.0,-96.5,200,8.0,8.0\n";

    #[test]
    fn sums_per_cell_and_day() {
        let table = parse_table(FIRES, "fires").unwrap();
        let f = grid_daily(&grid(), 2020, &table).unwrap();

        assert_eq!(f.header.sdate, 2020010);
        assert_eq!(f.header.tstep, 240000);
        assert_eq!(f.nsteps(), 3);
        assert_eq!(f.var_names(), ["DAY", "I", "J", "latitude", "longitude", "AREA", "CO", "OC"]);

        let co = &f.var("CO").unwrap().data;
        assert_eq!(co[[0, 0, 0, 0]], 3.0);
        assert_eq!(co[[1, 0, 0, 0]], 0.0);
        assert_eq!(co[[2, 0, 2, 3]], 4.0);
        assert_eq!(co.sum(), 7.0);

        let area = f.var("AREA").unwrap();
        assert_eq!(area.meta.units, "m**2");
        assert_eq!(area.data[[0, 0, 0, 0]], 160.0);
        assert_eq!(f.var("OC").unwrap().meta.units, "kg/day");
        assert_eq!(f.var("I").unwrap().data[[2, 0, 2, 3]], 3.0);
        assert_eq!(f.var("DAY").unwrap().data[[2, 0, 2, 3]], 12.0);
    }

    #[test]
    fn nothing_in_domain_is_an_error() {
        let table = parse_table("DAY,LATI,LONGI,AREA\n1,0.0,0.0,100\n", "fires").unwrap();
        assert!(grid_daily(&grid(), 2020, &table).is_err());
    }

    #[test]
    fn stray_day_is_rejected() {
        let text = "DAY,LATI,LONGI,AREA\n1,30.5,-99.5,100\n99999,30.5,-99.5,100\n";
        let table = parse_table(text, "fires").unwrap();
        let err = grid_daily(&grid(), 2020, &table).unwrap_err().to_string();
        assert!(err.contains("99999"), "{err}");

        let text = "DAY,LATI,LONGI,AREA\n1,30.5,-99.5,100\n367,30.5,-99.5,100\n";
        let f = grid_daily(&grid(), 2020, &parse_table(text, "fires").unwrap()).unwrap();
        assert_eq!(f.nsteps(), 367);
    }

    #[test]
    fn missing_area_is_an_error() {
        let table = parse_table("DAY,LATI,LONGI\n1,30.5,-99.5\n", "fires").unwrap();
        let err = grid_daily(&grid(), 2020, &table).unwrap_err().to_string();
        assert!(err.contains("AREA"), "{err}");
    }
}
