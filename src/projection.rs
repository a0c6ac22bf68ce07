//! Map projections for the IOAPI grid types we support, built on PROJ.
//!
//! Projected coordinates are metres (degrees for lat-lon) relative to the
//! projection of the grid's (XCENT, YCENT) origin.

use std::{fmt, sync::Arc};

use anyhow::{bail, Context, Result};
use proj::Proj;

/// IOAPI / CMAQ earth radius (m).
pub const EARTH_RADIUS: f64 = 6_370_000.0;

pub const LATGRD3: i32 = 1;
pub const LAMGRD3: i32 = 2;
pub const POLGRD3: i32 = 6;
pub const EQMGRD3: i32 = 7;

/// IOAPI coordinate system parameters, as found in a GRIDDESC file.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CoordSys {
    pub gdtyp: i32,
    pub p_alp: f64,
    pub p_bet: f64,
    pub p_gam: f64,
    pub xcent: f64,
    pub ycent: f64,
}

impl CoordSys {
    /// PROJ definition on the IOAPI sphere; `None` for lat-lon grids.
    pub fn proj_string(&self) -> Result<Option<String>> {
        let r = EARTH_RADIUS;
        let def = match self.gdtyp {
            LATGRD3 => return Ok(None),
            LAMGRD3 => format!(
                "+proj=lcc +lat_1={} +lat_2={} +lon_0={} +lat_0={} +R={r} +units=m +no_defs",
                self.p_alp, self.p_bet, self.p_gam, self.ycent
            ),
            POLGRD3 => {
                if self.p_alp.abs() != 1.0 {
                    bail!("polar stereographic P_ALP must be ±1, got {}", self.p_alp);
                }
                format!(
                    "+proj=stere +lat_0={} +lat_ts={} +lon_0={} +R={r} +units=m +no_defs",
                    90.0 * self.p_alp, self.p_bet, self.p_gam
                )
            }
            EQMGRD3 => format!(
                "+proj=merc +lat_ts={} +lon_0={} +R={r} +units=m +no_defs",
                self.p_alp, self.p_gam
            ),
            other => bail!("unsupported GDTYP {other}"),
        };
        Ok(Some(def))
    }
}

const LONGLAT: &str = "+proj=longlat +R=6370000 +no_defs";

#[derive(Clone)]
struct Transforms {
    def:     String,
    to_xy:   Arc<Proj>,
    from_xy: Arc<Proj>,
}

#[derive(Clone)]
pub struct Projection {
    transforms: Option<Transforms>,
    x0:         f64,
    y0:         f64,
}

impl fmt::Debug for Projection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let def = self.transforms.as_ref().map_or(LONGLAT, |t| t.def.as_str());
        f.debug_struct("Projection")
            .field("def", &def)
            .field("x0", &self.x0)
            .field("y0", &self.y0)
            .finish()
    }
}

impl Projection {
    pub fn new(cs: &CoordSys) -> Result<Self> {
        let Some(def) = cs.proj_string()? else {
            return Ok(Projection { transforms: None, x0: 0.0, y0: 0.0 });
        };
        let to_xy = Proj::new_known_crs(LONGLAT, &def, None)
            .with_context(|| format!("creating projection {def:?}"))?;
        let from_xy = Proj::new_known_crs(&def, LONGLAT, None)
            .with_context(|| format!("creating inverse projection {def:?}"))?;

        let mut proj = Projection {
            transforms: Some(Transforms { def, to_xy: Arc::new(to_xy), from_xy: Arc::new(from_xy) }),
            x0: 0.0,
            y0: 0.0,
        };
        let (x0, y0) = proj.forward(cs.xcent, cs.ycent)?;
        proj.x0 = x0;
        proj.y0 = y0;
        Ok(proj)
    }

    /// (lon, lat) degrees → (x, y) grid coordinates.
    pub fn forward(&self, lon: f64, lat: f64) -> Result<(f64, f64)> {
        let Some(t) = &self.transforms else { return Ok((lon, lat)) };
        let (x, y) = t.to_xy
            .convert((lon, lat))
            .with_context(|| format!("projecting ({lon}, {lat})"))?;
        Ok((x - self.x0, y - self.y0))
    }

    /// (x, y) grid coordinates → (lon, lat) degrees.
    pub fn inverse(&self, x: f64, y: f64) -> Result<(f64, f64)> {
        let Some(t) = &self.transforms else { return Ok((x, y)) };
        let (lon, lat) = t.from_xy
            .convert((x + self.x0, y + self.y0))
            .with_context(|| format!("unprojecting ({x}, {y})"))?;
        Ok((lon, lat))
    }
}
