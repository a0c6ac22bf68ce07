//! Raw FINN inventory reader: plain text, gzip, tar.gz, or a glob of any of those.

use std::{
    fs::File,
    io::Read,
    path::{Path, PathBuf},
};

use anyhow::{anyhow, bail, Context, Result};
use flate2::read::GzDecoder;
use glob::glob;
use tar::Archive;
use tracing::{debug, warn};

/// Column-major table of fire detections.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FireTable {
    pub columns: Vec<String>,
    pub values:  Vec<Vec<f64>>,
}

impl FireTable {
    pub fn len(&self) -> usize {
        self.values.first().map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn column(&self, name: &str) -> Option<&[f64]> {
        self.columns
            .iter()
            .position(|c| c == name)
            .map(|i| self.values[i].as_slice())
    }

    fn append(&mut self, other: FireTable, origin: &Path) -> Result<()> {
        if self.columns.is_empty() {
            *self = other;
            return Ok(());
        }
        if self.columns != other.columns {
            bail!(
                "{}: columns {:?} differ from earlier files {:?}",
                origin.display(), other.columns, self.columns
            );
        }
        for (dst, src) in self.values.iter_mut().zip(other.values) {
            dst.extend(src);
        }
        Ok(())
    }
}

fn renamer(k: &str) -> String {
    match k {
        "LONGI" => "longitude".to_string(),
        "LATI"  => "latitude".to_string(),
        other   => other.to_string(),
    }
}

/// Fortran double-precision exponents → Rust-parsable ones.
pub fn fix_fortran_exponents(text: &str) -> String {
    text.replace("D+", "e+")
        .replace("D-", "e-")
        .replace("d+", "e+")
        .replace("d-", "e-")
}

fn latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

// ─────────────────────────────────────────────────────────────────────
// CSV → table
// ─────────────────────────────────────────────────────────────────────

/// Parse CSV text with a header row. Non-numeric columns are dropped.
pub fn parse_table(text: &str, origin: &str) -> Result<FireTable> {
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .flexible(false)
        .from_reader(text.as_bytes());

    let header: Vec<String> = rdr.headers()?.iter().map(renamer).collect();
    let records = rdr
        .records()
        .collect::<std::result::Result<Vec<_>, _>>()
        .with_context(|| format!("reading {origin}"))?;

    let mut table = FireTable::default();
    for (c, name) in header.iter().enumerate() {
        let parsed: std::result::Result<Vec<f64>, _> =
            records.iter().map(|r| r[c].parse::<f64>()).collect();
        match parsed {
            Ok(col) => {
                table.columns.push(name.clone());
                table.values.push(col);
            }
            Err(_) if records.iter().all(|r| r[c].parse::<f64>().is_err()) => {
                warn!("{origin}: dropping non-numeric column {name:?}");
            }
            Err(_) => {
                let row = records
                    .iter()
                    .position(|r| r[c].parse::<f64>().is_err())
                    .unwrap_or_default();
                bail!("{origin}: row {}: column {name:?} value {:?} is not a number", row + 2, &records[row][c]);
            }
        }
    }
    Ok(table)
}

// ─────────────────────────────────────────────────────────────────────
// Format dispatch
// ─────────────────────────────────────────────────────────────────────
fn read_tar_gz(path: &Path) -> Result<String> {
    let mut archive = Archive::new(GzDecoder::new(File::open(path)?));
    for entry in archive.entries()? {
        let mut entry = entry?;
        let name = entry.path()?.to_string_lossy().into_owned();
        if name.ends_with(".pdf") || !entry.header().entry_type().is_file() {
            debug!("skipping archive member {name}");
            continue;
        }
        debug!("reading archive member {name}");
        let mut bytes = Vec::new();
        entry.read_to_end(&mut bytes)?;
        return Ok(latin1(&bytes));
    }
    Err(anyhow!("{}: archive holds no data member", path.display()))
}

fn read_gz(path: &Path) -> Result<String> {
    let mut bytes = Vec::new();
    GzDecoder::new(File::open(path)?).read_to_end(&mut bytes)?;
    Ok(latin1(&bytes))
}

/// Read one inventory file, choosing the decoder by suffix.
pub fn read_file(path: &Path) -> Result<FireTable> {
    let name = path.to_string_lossy();
    let text = if name.ends_with(".tar.gz") {
        read_tar_gz(path)
    } else if name.ends_with(".gz") {
        read_gz(path)
    } else {
        std::fs::read(path).map(|b| latin1(&b)).map_err(Into::into)
    }
    .with_context(|| format!("reading inventory {}", path.display()))?;
    parse_table(&fix_fortran_exponents(&text), &name)
}

/// Expand `pattern` (a path or glob) to sorted, existing files.
pub fn list_inputs(pattern: &str) -> Result<Vec<PathBuf>> {
    let mut v: Vec<_> = glob(pattern)?.filter_map(Result::ok).collect();
    v.sort();
    if v.is_empty() {
        bail!("no inventory files match {pattern:?}");
    }
    Ok(v)
}

/// Read and concatenate every file matching `pattern`.
pub fn read_inventory(pattern: &str) -> Result<FireTable> {
    let mut table = FireTable::default();
    for path in list_inputs(pattern)? {
        let part = read_file(&path)?;
        debug!("{}: {} fires", path.display(), part.len());
        table.append(part, &path)?;
    }
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    use flate2::{write::GzEncoder, Compression};

    const TEXT: &str = "DAY,TIME,GENVEG,LATI,LONGI,AREA,CO2,CO\n\
                        5, 1200, 4, 40.0, -97.0, 1.0D+02, 2.5D+03, 1.5d-01\n\
                        6, 1300, 4, 41.0, -96.0, 4.0D+01, 1.0D+03, 2.0d-01\n";

    #[test]
    fn fortran_exponents_are_rewritten() {
        assert_eq!(fix_fortran_exponents("1.0D+02,3d-1"), "1.0e+02,3e-1");
    }

    #[test]
    fn renames_coordinates_and_trims() {
        let t = parse_table(&fix_fortran_exponents(TEXT), "test").unwrap();
        assert_eq!(t.columns, ["DAY", "TIME", "GENVEG", "latitude", "longitude", "AREA", "CO2", "CO"]);
        assert_eq!(t.len(), 2);
        assert_eq!(t.column("AREA").unwrap(), &[100.0, 40.0]);
        assert_eq!(t.column("CO").unwrap(), &[0.15, 0.2]);
    }

    #[test]
    fn drops_text_columns_rejects_bad_numbers() {
        let t = parse_table("DAY,NAME,AREA\n1,a,3\n2,b,4\n", "t").unwrap();
        assert_eq!(t.columns, ["DAY", "AREA"]);
        let err = parse_table("DAY,AREA\n1,3\n2,x\n", "t").unwrap_err().to_string();
        assert!(err.contains("row 3"), "{err}");
    }

    #[test]
    fn reads_gzip_and_tar_and_globs() {
        let dir = tempfile::tempdir().unwrap();

        let gz_path = dir.path().join("GLOB_GEOSchem_2020005.txt.gz");
        let mut enc = GzEncoder::new(File::create(&gz_path).unwrap(), Compression::default());
        enc.write_all(TEXT.as_bytes()).unwrap();
        enc.finish().unwrap();
        let gz = read_file(&gz_path).unwrap();
        assert_eq!(gz.column("CO2").unwrap(), &[2500.0, 1000.0]);

        let tgz_path = dir.path().join("FINNv1.5_2020.GEOSCHEM.tar.gz");
        let enc = GzEncoder::new(File::create(&tgz_path).unwrap(), Compression::default());
        let mut builder = tar::Builder::new(enc);
        let plain = "DAY,LATI,LONGI,AREA\n5,40.0,-97.0,100\n";
        for (name, body) in [("README.pdf", "%PDF"), ("finn.txt", plain)] {
            let mut header = tar::Header::new_gnu();
            header.set_size(body.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, body.as_bytes()).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();
        let tgz = read_file(&tgz_path).unwrap();
        assert_eq!(tgz.columns, ["DAY", "latitude", "longitude", "AREA"]);

        let second = dir.path().join("GLOB_GEOSchem_2020006.txt.gz");
        std::fs::copy(&gz_path, &second).unwrap();
        let pattern = format!("{}/GLOB_GEOSchem_*.txt.gz", dir.path().display());
        assert_eq!(read_inventory(&pattern).unwrap().len(), 4);
    }

    #[test]
    fn tar_skips_leading_directory() {
        let dir = tempfile::tempdir().unwrap();
        let tgz_path = dir.path().join("FINNv1.5_2019.GEOSCHEM.tar.gz");
        let enc = GzEncoder::new(File::create(&tgz_path).unwrap(), Compression::default());
        let mut builder = tar::Builder::new(enc);

        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Directory);
        header.set_size(0);
        header.set_mode(0o755);
        header.set_cksum();
        builder.append_data(&mut header, "FINNv1.5_2019/", std::io::empty()).unwrap();

        let body = "DAY,LATI,LONGI,AREA\n7,40.0,-97.0,1.5D+02\n";
        let mut header = tar::Header::new_gnu();
        header.set_size(body.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, "FINNv1.5_2019/finn.txt", body.as_bytes()).unwrap();
        builder.into_inner().unwrap().finish().unwrap();

        let t = read_file(&tgz_path).unwrap();
        assert_eq!(t.column("AREA").unwrap(), &[150.0]);
    }

    #[test]
    fn empty_glob_is_an_error() {
        assert!(read_inventory("/nonexistent/dir/*.txt.gz").is_err());
    }
}
