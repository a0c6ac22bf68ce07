//! Vertical allocation: per-layer fractions and the matching sigma edges.

use std::path::Path;

use anyhow::{bail, Context, Result};
use tracing::warn;

/// One row of the layer fraction table.
#[derive(Debug, Clone, Copy)]
pub struct LayerRow {
    pub frac:         f64,
    pub sigma_bottom: f64,
    pub sigma_top:    f64,
}

/// `frac[z]` of each daily total goes to layer `z`, bounded by
/// `vglvls[z]` (bottom) and `vglvls[z + 1]` (top).
#[derive(Debug, Clone, PartialEq)]
pub struct LayerFractions {
    pub vglvls: Vec<f32>,
    pub frac:   Vec<f64>,
}

impl LayerFractions {
    pub fn nlays(&self) -> usize {
        self.frac.len()
    }

    pub fn from_rows(rows: &[LayerRow]) -> Result<Self> {
        let Some(last) = rows.last() else { bail!("no layers defined") };
        let mut vglvls: Vec<f32> = rows.iter().map(|r| r.sigma_bottom as f32).collect();
        vglvls.push(last.sigma_top as f32);
        let frac: Vec<f64> = rows.iter().map(|r| r.frac).collect();

        if frac.iter().any(|f| !f.is_finite() || *f < 0.0) {
            bail!("layer fractions must be finite and non-negative");
        }
        let total: f64 = frac.iter().sum();
        if (total - 1.0).abs() > 1e-3 {
            warn!("layer fractions sum to {total:.6}, not 1; emissions will be scaled accordingly");
        }
        Ok(LayerFractions { vglvls, frac })
    }

    /// Read a CSV with `frac`, `sigma_bottom`, `sigma_top` columns.
    pub fn from_path(path: &Path) -> Result<Self> {
        let mut rdr = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_path(path)
            .with_context(|| format!("opening layer fractions {}", path.display()))?;
        let headers = rdr.headers()?.clone();
        let col = |key: &str| {
            headers
                .iter()
                .position(|k| k == key)
                .with_context(|| format!("{}: missing column {key}", path.display()))
        };
        let (ci, bi, ti) = (col("frac")?, col("sigma_bottom")?, col("sigma_top")?);

        let mut rows = Vec::new();
        for (n, rec) in rdr.records().enumerate() {
            let rec = rec?;
            let num = |c: usize| -> Result<f64> {
                rec[c].parse().with_context(|| {
                    format!("{}: row {}: {:?} is not a number", path.display(), n + 2, &rec[c])
                })
            };
            rows.push(LayerRow { frac: num(ci)?, sigma_bottom: num(bi)?, sigma_top: num(ti)? });
        }
        Self::from_rows(&rows).with_context(|| format!("layer fractions {}", path.display()))
    }
}
