//! Plain CSV star lists used to build quad indices.
//!
//! One star per row with a header line and the columns
//! `id, ra_deg, dec_deg, mag`. RA/Dec are ICRS degrees.

use std::path::Path;

use anyhow::{anyhow, Context};

use crate::star::Star;

fn field<T: std::str::FromStr>(record: &csv::StringRecord, col: usize, name: &str) -> anyhow::Result<T> {
    let raw = record
        .get(col)
        .ok_or_else(|| anyhow!("missing column `{name}`"))?;
    raw.trim()
        .parse()
        .map_err(|_| anyhow!("bad `{name}` value {raw:?}"))
}

/// Read a star list. Rows that fail to parse abort the read with the line number.
pub fn read_star_csv<P: AsRef<Path>>(path: P) -> anyhow::Result<Vec<Star>> {
    let path = path.as_ref();
    let mut rdr = csv::Reader::from_path(path)
        .with_context(|| format!("opening star catalog {}", path.display()))?;

    let parse = |record: csv::StringRecord| -> anyhow::Result<Star> {
        Ok(Star::new(
            field(&record, 0, "id")?,
            field(&record, 1, "ra_deg")?,
            field(&record, 2, "dec_deg")?,
            field(&record, 3, "mag")?,
        ))
    };

    rdr.records()
        .enumerate()
        .map(|(row, result)| {
            // header is line 1
            result
                .map_err(anyhow::Error::from)
                .and_then(parse)
                .with_context(|| format!("{} line {}", path.display(), row + 2))
        })
        .collect()
}

/// Write stars in the format [`read_star_csv`] reads.
pub fn write_star_csv<P: AsRef<Path>>(path: P, stars: &[Star]) -> anyhow::Result<()> {
    let path = path.as_ref();
    let mut wtr = csv::Writer::from_path(path)
        .with_context(|| format!("creating star catalog {}", path.display()))?;
    wtr.write_record(["id", "ra_deg", "dec_deg", "mag"])?;
    for s in stars {
        wtr.write_record(&[
            s.id.to_string(),
            s.ra_deg.to_string(),
            s.dec_deg.to_string(),
            s.mag.to_string(),
        ])?;
    }
    wtr.flush()?;
    Ok(())
}
