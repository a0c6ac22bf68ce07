//! Diurnal (hour-of-day) allocation of daily totals, shifted to local time.

use std::path::Path;

use anyhow::{bail, Context, Result};
use ndarray::Array4;
use tracing::debug;

use crate::griddesc::Grid;

/// Number of instantaneous output times per day (00Z through 24Z).
pub const NSTEPS: usize = 25;

/// 24 local-time hourly fractions, normalised to sum to 1.
#[derive(Debug, Clone, PartialEq)]
pub struct TemporalProfile {
    pub hourly: [f64; 24],
}

impl TemporalProfile {
    pub fn new(raw: [f64; 24]) -> Result<Self> {
        if raw.iter().any(|v| !v.is_finite() || *v < 0.0) {
            bail!("hourly factors must be finite and non-negative");
        }
        let total: f64 = raw.iter().sum();
        if total <= 0.0 {
            bail!("hourly factors sum to {total}; need a positive total");
        }
        Ok(TemporalProfile { hourly: raw.map(|v| v / total) })
    }

    /// Read `hour1`..`hour24` from the first data row of a CSV file.
    pub fn from_path(path: &Path) -> Result<Self> {
        let mut rdr = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_path(path)
            .with_context(|| format!("opening temporal profile {}", path.display()))?;
        let headers = rdr.headers()?.clone();
        let rec = rdr
            .records()
            .next()
            .transpose()?
            .with_context(|| format!("{}: no data rows", path.display()))?;

        let mut raw = [0.0; 24];
        for (h, slot) in raw.iter_mut().enumerate() {
            let key = format!("hour{}", h + 1);
            let col = headers
                .iter()
                .position(|k| k == key)
                .with_context(|| format!("{}: missing column {key}", path.display()))?;
            *slot = rec[col]
                .parse()
                .with_context(|| format!("{}: {key} is not a number", path.display()))?;
        }
        Self::new(raw).with_context(|| format!("temporal profile {}", path.display()))
    }

    /// Factors at the 25 hour boundaries: periodic pad, then linear
    /// interpolation halfway between hourly centres.
    pub fn instantaneous(&self) -> [f64; NSTEPS] {
        let mut padded = [0.0; 26];
        padded[0] = self.hourly[23];
        padded[1..25].copy_from_slice(&self.hourly);
        padded[25] = self.hourly[0];

        let mut out = [0.0; NSTEPS];
        for (k, f) in out.iter_mut().enumerate() {
            *f = 0.5 * (padded[k] + padded[k + 1]);
        }
        out
    }

    /// Instantaneous factors rolled left by `tzoff` hours (UTC → local).
    pub fn shifted(&self, tzoff: i32) -> [f64; NSTEPS] {
        let base = self.instantaneous();
        let n = NSTEPS as i32;
        std::array::from_fn(|t| base[(t as i32 + tzoff).rem_euclid(n) as usize])
    }

    /// `(25, 1, NROWS, NCOLS)` factor array for `grid`, each cell shifted by
    /// the timezone of its centre longitude.
    pub fn grid_factors(&self, grid: &Grid) -> Result<Array4<f32>> {
        let mut out = Array4::<f32>::zeros((NSTEPS, 1, grid.nrows, grid.ncols));
        let mut cache: Vec<(i32, [f64; NSTEPS])> = Vec::new();
        for j in 0..grid.nrows {
            for i in 0..grid.ncols {
                let (lon, _) = grid.ij2ll(i, j)?;
                let tz = timezone_offset(lon);
                let factors = match cache.iter().find(|(z, _)| *z == tz) {
                    Some((_, f)) => *f,
                    None => {
                        let f = self.shifted(tz);
                        cache.push((tz, f));
                        f
                    }
                };
                for (t, f) in factors.iter().enumerate() {
                    out[[t, 0, j, i]] = *f as f32;
                }
            }
        }
        debug!("temporal factors built for {} timezones", cache.len());
        Ok(out)
    }
}

/// Whole-hour offset from UTC implied by longitude (half-way rounds to even).
pub fn timezone_offset(lon: f64) -> i32 {
    (lon / 15.0).round_ties_even() as i32
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn midnight_spike() -> TemporalProfile {
        let mut raw = [0.0; 24];
        raw[0] = 3.0;
        TemporalProfile::new(raw).unwrap()
    }

    #[test]
    fn flat_profile_is_flat() {
        let p = TemporalProfile::new([2.0; 24]).unwrap();
        for f in p.instantaneous() {
            assert_abs_diff_eq!(f, 1.0 / 24.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn interpolates_between_hour_centres() {
        let f = midnight_spike().instantaneous();
        assert_abs_diff_eq!(f[0], 0.5);
        assert_abs_diff_eq!(f[1], 0.5);
        assert_abs_diff_eq!(f[2], 0.0);
        assert_abs_diff_eq!(f[24], 0.5);
    }

    #[test]
    fn rolls_into_local_time() {
        // UTC-6: local midnight is 06Z
        let f = midnight_spike().shifted(-6);
        assert_abs_diff_eq!(f[6], 0.5);
        assert_abs_diff_eq!(f[7], 0.5);
        assert_abs_diff_eq!(f[0], 0.0);
        assert_eq!(midnight_spike().shifted(0), midnight_spike().instantaneous());
    }

    #[test]
    fn timezone_rounding() {
        assert_eq!(timezone_offset(-97.0), -6);
        assert_eq!(timezone_offset(7.5), 0);
        assert_eq!(timezone_offset(22.5), 2);
        assert_eq!(timezone_offset(179.9), 12);
    }

    #[test]
    fn rejects_degenerate_profiles() {
        assert!(TemporalProfile::new([0.0; 24]).is_err());
        let mut raw = [1.0; 24];
        raw[3] = -1.0;
        assert!(TemporalProfile::new(raw).is_err());
    }

    #[test]
    fn reads_hour_columns_in_any_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tpro.txt");
        let mut header: Vec<String> = (1..=24).rev().map(|h| format!("hour{h}")).collect();
        header.insert(0, "name".into());
        let mut row: Vec<String> = (1..=24).rev().map(|h| h.to_string()).collect();
        row.insert(0, "fire".into());
        std::fs::write(&path, format!("{}\n{}\n", header.join(","), row.join(","))).unwrap();

        let p = TemporalProfile::from_path(&path).unwrap();
        assert_abs_diff_eq!(p.hourly[0], 1.0 / 300.0, epsilon = 1e-12);
        assert_abs_diff_eq!(p.hourly[23], 24.0 / 300.0, epsilon = 1e-12);
    }
}
