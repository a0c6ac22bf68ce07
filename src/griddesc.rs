//! GRIDDESC parsing and grid index ↔ lon/lat mapping.

use std::{collections::HashMap, fs, path::Path};

use anyhow::{anyhow, bail, Context, Result};

use crate::projection::{CoordSys, Projection};

/// One named IOAPI grid with its coordinate system resolved.
#[derive(Debug, Clone)]
pub struct Grid {
    pub gdnam:  String,
    pub coord:  CoordSys,
    pub xorig:  f64,
    pub yorig:  f64,
    pub xcell:  f64,
    pub ycell:  f64,
    pub ncols:  usize,
    pub nrows:  usize,
    pub nthik:  i32,
    proj:       Projection,
}

/// Everything declared in a GRIDDESC file.
#[derive(Debug, Default)]
pub struct GridDesc {
    pub coords: HashMap<String, CoordSys>,
    pub grids:  HashMap<String, GridEntry>,
}

#[derive(Debug, Clone)]
pub struct GridEntry {
    pub coord_name: String,
    pub xorig:      f64,
    pub yorig:      f64,
    pub xcell:      f64,
    pub ycell:      f64,
    pub ncols:      usize,
    pub nrows:      usize,
    pub nthik:      i32,
}

// ─────────────────────────────────────────────────────────────────────
// Parsing
// ─────────────────────────────────────────────────────────────────────

/// Split a GRIDDESC line into tokens; quoted names keep their spaces.
fn tokens(line: &str) -> Vec<String> {
    let line = line.split('!').next().unwrap_or_default();
    let mut out = Vec::new();
    let mut chars = line.chars().peekable();
    while let Some(&c) = chars.peek() {
        if c.is_whitespace() || c == ',' {
            chars.next();
        } else if c == '\'' || c == '"' {
            chars.next();
            let tok: String = chars.by_ref().take_while(|&q| q != c).collect();
            out.push(tok.trim().to_string());
        } else {
            let mut tok = String::new();
            while let Some(&d) = chars.peek() {
                if d.is_whitespace() || d == ',' { break; }
                tok.push(d);
                chars.next();
            }
            out.push(tok);
        }
    }
    out
}

fn num(tok: &str) -> Result<f64> {
    tok.replace(['D', 'd'], "e")
        .parse()
        .map_err(|e| anyhow!("bad number {tok:?}: {e}"))
}

fn field<'a>(toks: &'a [String], i: usize, lineno: usize) -> Result<&'a str> {
    toks.get(i)
        .map(String::as_str)
        .ok_or_else(|| anyhow!("line {lineno}: expected at least {} fields", i + 1))
}

impl GridDesc {
    pub fn parse(text: &str) -> Result<Self> {
        let mut desc = GridDesc::default();
        let mut segment = 0;
        // (name, line number) of an entry whose parameter line comes next
        let mut pending: Option<(String, usize)> = None;

        for (n, raw) in text.lines().enumerate() {
            let lineno = n + 1;
            if raw.trim().is_empty() { continue }
            let toks = tokens(raw);

            if let Some((name, _)) = pending.take() {
                if segment == 1 {
                    let cs = CoordSys {
                        gdtyp: num(field(&toks, 0, lineno)?)? as i32,
                        p_alp: num(field(&toks, 1, lineno)?)?,
                        p_bet: num(field(&toks, 2, lineno)?)?,
                        p_gam: num(field(&toks, 3, lineno)?)?,
                        xcent: num(field(&toks, 4, lineno)?)?,
                        ycent: num(field(&toks, 5, lineno)?)?,
                    };
                    desc.coords.insert(name, cs);
                } else {
                    let entry = GridEntry {
                        coord_name: field(&toks, 0, lineno)?.to_string(),
                        xorig:      num(field(&toks, 1, lineno)?)?,
                        yorig:      num(field(&toks, 2, lineno)?)?,
                        xcell:      num(field(&toks, 3, lineno)?)?,
                        ycell:      num(field(&toks, 4, lineno)?)?,
                        ncols:      num(field(&toks, 5, lineno)?)? as usize,
                        nrows:      num(field(&toks, 6, lineno)?)? as usize,
                        nthik:      num(field(&toks, 7, lineno)?)? as i32,
                    };
                    desc.grids.insert(name, entry);
                }
                continue;
            }

            let name = toks.first().cloned().unwrap_or_default();
            if name.is_empty() {
                // blank name closes a segment
                segment += 1;
                if segment > 2 { break }
                continue;
            }
            if segment == 0 {
                bail!("line {lineno}: GRIDDESC must start with a blank ' ' header line");
            }
            pending = Some((name, lineno));
        }

        if let Some((name, lineno)) = pending {
            bail!("line {lineno}: entry {name:?} has no parameter line");
        }
        Ok(desc)
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading GRIDDESC {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("parsing GRIDDESC {}", path.display()))
    }

    pub fn grid(&self, gdnam: &str) -> Result<Grid> {
        let g = self.grids
            .get(gdnam)
            .ok_or_else(|| anyhow!("grid {gdnam:?} not found in GRIDDESC"))?;
        let coord = *self.coords
            .get(&g.coord_name)
            .ok_or_else(|| anyhow!("coordinate system {:?} for grid {gdnam:?} not found", g.coord_name))?;
        Grid::new(
            gdnam,
            coord,
            (g.xorig, g.yorig),
            (g.xcell, g.ycell),
            (g.ncols, g.nrows),
            g.nthik,
        )
    }
}

// ─────────────────────────────────────────────────────────────────────
// Grid
// ─────────────────────────────────────────────────────────────────────
impl Grid {
    pub fn new(
        gdnam:  &str,
        coord:  CoordSys,
        origin: (f64, f64),
        cell:   (f64, f64),
        size:   (usize, usize),
        nthik:  i32,
    ) -> Result<Self> {
        if size.0 == 0 || size.1 == 0 {
            bail!("grid {gdnam:?} has no cells");
        }
        if !(cell.0 > 0.0 && cell.1 > 0.0) {
            bail!("grid {gdnam:?} has non-positive cell size {cell:?}");
        }
        Ok(Grid {
            gdnam: gdnam.to_string(),
            coord,
            xorig: origin.0,
            yorig: origin.1,
            xcell: cell.0,
            ycell: cell.1,
            ncols: size.0,
            nrows: size.1,
            nthik,
            proj:  Projection::new(&coord)?,
        })
    }

    pub fn from_griddesc(path: &Path, gdnam: &str) -> Result<Self> {
        GridDesc::from_path(path)?.grid(gdnam)
    }

    /// Cell containing (lon, lat), or `None` outside the domain.
    pub fn ll2ij(&self, lon: f64, lat: f64) -> Option<(usize, usize)> {
        if !lon.is_finite() || !lat.is_finite() { return None }
        let (x, y) = self.proj.forward(lon, lat).ok()?;
        let fi = ((x - self.xorig) / self.xcell).floor();
        let fj = ((y - self.yorig) / self.ycell).floor();
        if fi < 0.0 || fj < 0.0 || fi >= self.ncols as f64 || fj >= self.nrows as f64 {
            return None;
        }
        Some((fi as usize, fj as usize))
    }

    /// Centre of cell (i, j).
    pub fn ij2ll(&self, i: usize, j: usize) -> Result<(f64, f64)> {
        let x = self.xorig + (i as f64 + 0.5) * self.xcell;
        let y = self.yorig + (j as f64 + 0.5) * self.ycell;
        self.proj.inverse(x, y)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    const GRIDDESC: &str = "' '
'LAM_40N97W'
  2 33.000 45.000 -97.000 -97.000 40.000
'LATLON'
  1 0.0D0 0.0D0 0.0D0 0.0D0 0.0D0
' '
'12US2'
'LAM_40N97W' -2412000.0 -1620000.0 12000.0 12000.0 396 246 1
'GLOBAL1'  ! one-degree
'LATLON' -180.0 -90.0 1.0 1.0 360 180 1
' '
";

    #[test]
    fn parses_both_segments() {
        let desc = GridDesc::parse(GRIDDESC).unwrap();
        assert_eq!(desc.coords.len(), 2);
        assert_eq!(desc.grids.len(), 2);
        let g = &desc.grids["12US2"];
        assert_eq!(g.coord_name, "LAM_40N97W");
        assert_eq!((g.ncols, g.nrows, g.nthik), (396, 246, 1));
    }

    #[test]
    fn missing_grid_is_an_error() {
        let desc = GridDesc::parse(GRIDDESC).unwrap();
        let err = desc.grid("36US3").unwrap_err().to_string();
        assert!(err.contains("36US3"));
    }

    #[test]
    fn ll2ij_finds_origin_cell() {
        let g = GridDesc::parse(GRIDDESC).unwrap().grid("12US2").unwrap();
        assert_eq!(g.ll2ij(-97.0, 40.0), Some((201, 135)));
        assert_eq!(g.ll2ij(0.0, 0.0), None);
        assert_eq!(g.ll2ij(f64::NAN, 40.0), None);
    }

    #[test]
    fn ij2ll_returns_cell_centre() {
        let g = GridDesc::parse(GRIDDESC).unwrap().grid("GLOBAL1").unwrap();
        let (lon, lat) = g.ij2ll(0, 0).unwrap();
        assert_abs_diff_eq!(lon, -179.5, epsilon = 1e-9);
        assert_abs_diff_eq!(lat, -89.5, epsilon = 1e-9);
        assert_eq!(g.ll2ij(lon, lat), Some((0, 0)));
    }
}
