//! Equal-area sky grid for cone searches over catalog stars.
//!
//! Latitude is split into `3 * nside` bands in `z = sin(dec)` and longitude
//! into `4 * nside` bins, `12 * nside^2` cells in total. Each cell owns a
//! contiguous run of star indices, so a cone query scans only the stars in
//! the cells the cone touches and then filters by exact angular distance.
//!
//! The grid stores indices only; the stars themselves live with the owner
//! (the quad index) and are passed to each query.

use std::f64::consts::{PI, TAU};

use anyhow::{bail, ensure};
use nalgebra::Vector3;
use rkyv::{Archive, Deserialize, Serialize};

use crate::star::{radec_to_uvec, Star};

#[derive(Debug, Clone, Archive, Serialize, Deserialize)]
pub struct SkyCells {
    nside: u32,
    n_lat: u32,
    n_lon: u32,
    cell_offsets: Vec<u32>,
    star_indices: Vec<u32>,
}

impl SkyCells {
    /// Bin `stars` into a grid of resolution `nside` (clamped to >= 1).
    pub fn new(nside: u32, stars: &[Star]) -> Self {
        let nside = nside.max(1);
        let n_lat = 3 * nside;
        let n_lon = 4 * nside;
        let n_cells = (n_lat * n_lon) as usize;

        let mut bins: Vec<Vec<u32>> = vec![Vec::new(); n_cells];
        for (i, star) in stars.iter().enumerate() {
            bins[cell_for(n_lat, n_lon, star.ra_deg, star.dec_deg)].push(i as u32);
        }

        let mut cell_offsets = Vec::with_capacity(n_cells + 1);
        let mut star_indices = Vec::with_capacity(stars.len());
        cell_offsets.push(0);
        for bin in bins {
            star_indices.extend(bin);
            cell_offsets.push(star_indices.len() as u32);
        }

        Self {
            nside,
            n_lat,
            n_lon,
            cell_offsets,
            star_indices,
        }
    }

    pub fn nside(&self) -> u32 {
        self.nside
    }

    /// Check that a decoded grid is consistent with a list of `num_stars` stars.
    pub fn validate(&self, num_stars: usize) -> anyhow::Result<()> {
        ensure!(self.nside >= 1, "sky grid nside is zero");
        let nside = self.nside as u64;
        ensure!(
            self.n_lat as u64 == 3 * nside && self.n_lon as u64 == 4 * nside,
            "sky grid shape {}x{} does not match nside {}",
            self.n_lat,
            self.n_lon,
            self.nside
        );
        let n_cells = (self.n_lat as u64 * self.n_lon as u64) as usize;
        ensure!(
            self.cell_offsets.len() == n_cells + 1,
            "sky grid has {} cell offsets, expected {}",
            self.cell_offsets.len(),
            n_cells + 1
        );
        ensure!(self.cell_offsets[0] == 0, "sky grid offsets do not start at 0");
        ensure!(
            self.cell_offsets.windows(2).all(|w| w[0] <= w[1]),
            "sky grid offsets are not monotone"
        );
        ensure!(
            self.cell_offsets[n_cells] as usize == self.star_indices.len(),
            "sky grid offsets end at {}, but {} star indices are stored",
            self.cell_offsets[n_cells],
            self.star_indices.len()
        );
        if let Some(&bad) = self.star_indices.iter().find(|&&i| i as usize >= num_stars) {
            bail!("sky grid references star {bad} of {num_stars}");
        }
        Ok(())
    }

    /// Indices of `stars` within `radius_deg` of (`ra_deg`, `dec_deg`), ascending.
    ///
    /// `stars` must be the slice the grid was built from.
    pub fn query(&self, stars: &[Star], ra_deg: f64, dec_deg: f64, radius_deg: f64) -> Vec<usize> {
        self.query_uvec(stars, &radec_to_uvec(ra_deg, dec_deg), radius_deg)
    }

    /// Same as [`SkyCells::query`], around a unit direction.
    pub fn query_uvec(&self, stars: &[Star], dir: &Vector3<f64>, radius_deg: f64) -> Vec<usize> {
        if stars.is_empty() || self.star_indices.is_empty() {
            return Vec::new();
        }
        let radius = radius_deg.to_radians().clamp(0.0, PI);
        let cos_radius = radius.cos();
        let z_step = 2.0 / self.n_lat as f64;
        let lon_step = TAU / self.n_lon as f64;

        let z_center = dir.z.clamp(-1.0, 1.0);
        let dec_center = z_center.asin();
        // z range of the cone: dec +- radius, clamped at the poles
        let z_min = (dec_center - radius).max(-PI / 2.0).sin();
        let z_max = (dec_center + radius).min(PI / 2.0).sin();
        let phi = dir.y.atan2(dir.x).rem_euclid(TAU);

        let mut out = Vec::new();
        for lat in z_to_lat(self.n_lat, z_min)..=z_to_lat(self.n_lat, z_max) {
            let band_lo = (-1.0 + lat as f64 * z_step).clamp(-1.0, 1.0);
            let band_hi = (-1.0 + (lat + 1) as f64 * z_step).clamp(-1.0, 1.0);
            // longitude span bounded by the cone center and the band's poleward edge
            let band_cos = band_lo.abs().max(band_hi.abs()).min(1.0).acos().sin();
            let cos_dec = band_cos.min(dec_center.cos());
            let half_span = if dec_center.abs() + radius >= PI / 2.0 || cos_dec < 1e-9 {
                PI
            } else {
                (radius.sin() / cos_dec).min(1.0).asin() + lon_step
            };

            if 2.0 * half_span >= TAU {
                for lon in 0..self.n_lon {
                    self.collect(stars, lat, lon, dir, cos_radius, &mut out);
                }
                continue;
            }
            let start = phi_to_lon(self.n_lon, (phi - half_span).rem_euclid(TAU));
            let end = phi_to_lon(self.n_lon, (phi + half_span).rem_euclid(TAU));
            if start <= end {
                for lon in start..=end {
                    self.collect(stars, lat, lon, dir, cos_radius, &mut out);
                }
            } else {
                for lon in (start..self.n_lon).chain(0..=end) {
                    self.collect(stars, lat, lon, dir, cos_radius, &mut out);
                }
            }
        }

        out.sort_unstable();
        out.dedup();
        out
    }

    fn collect(
        &self,
        stars: &[Star],
        lat: u32,
        lon: u32,
        dir: &Vector3<f64>,
        cos_radius: f64,
        out: &mut Vec<usize>,
    ) {
        let cell = (lat * self.n_lon + lon) as usize;
        let (start, end) = (
            self.cell_offsets[cell] as usize,
            self.cell_offsets[cell + 1] as usize,
        );
        out.extend(
            self.star_indices[start..end]
                .iter()
                .map(|&i| i as usize)
                .filter(|&i| dir.dot(&stars[i].uvec()) >= cos_radius),
        );
    }
}

fn cell_for(n_lat: u32, n_lon: u32, ra_deg: f64, dec_deg: f64) -> usize {
    let phi = ra_deg.to_radians().rem_euclid(TAU);
    let z = dec_deg.to_radians().sin();
    (z_to_lat(n_lat, z) * n_lon + phi_to_lon(n_lon, phi)) as usize
}

fn z_to_lat(n_lat: u32, z: f64) -> u32 {
    let u = (z.clamp(-1.0, 1.0) + 1.0) * 0.5;
    ((u * n_lat as f64).floor() as u32).min(n_lat - 1)
}

fn phi_to_lon(n_lon: u32, phi: f64) -> u32 {
    let u = phi / TAU;
    ((u * n_lon as f64).floor() as u32).min(n_lon - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::star::angular_separation_deg;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn star(id: u64, ra: f64, dec: f64) -> Star {
        Star::new(id, ra, dec, 5.0)
    }

    fn ids(stars: &[Star], idx: &[usize]) -> Vec<u64> {
        let mut v: Vec<u64> = idx.iter().map(|&i| stars[i].id).collect();
        v.sort_unstable();
        v
    }

    #[test]
    fn test_validate_rejects_inconsistent_grid() {
        let stars = vec![star(1, 0.0, 0.0), star(2, 2.0, 1.0), star(3, 40.0, -10.0)];
        let cells = SkyCells::new(4, &stars);
        assert!(cells.validate(stars.len()).is_ok());
        // built for three stars, checked against two
        assert!(cells.validate(2).is_err());

        let mut short = cells.clone();
        short.cell_offsets.pop();
        assert!(short.validate(stars.len()).is_err());

        let mut unordered = cells.clone();
        unordered.cell_offsets[1] = 3;
        unordered.cell_offsets[2] = 0;
        assert!(unordered.validate(stars.len()).is_err());

        let mut misshaped = cells.clone();
        misshaped.n_lon += 1;
        assert!(misshaped.validate(stars.len()).is_err());

        let mut zero = cells;
        zero.nside = 0;
        assert!(zero.validate(stars.len()).is_err());
    }

    #[test]
    fn test_cone_query_finds_nearby_stars() {
        let stars = vec![star(1, 0.0, 0.0), star(2, 2.0, 1.0), star(3, 40.0, -10.0)];
        let cells = SkyCells::new(8, &stars);
        let hits = cells.query(&stars, 0.5, 0.25, 3.0);
        assert_eq!(ids(&stars, &hits), vec![1, 2]);
    }

    #[test]
    fn test_cone_query_handles_ra_wraparound() {
        let stars = vec![star(10, 359.0, 0.0), star(11, 1.0, 0.0), star(12, 180.0, 0.0)];
        let cells = SkyCells::new(8, &stars);
        let hits = cells.query(&stars, 0.0, 0.0, 3.0);
        assert_eq!(ids(&stars, &hits), vec![10, 11]);
    }

    #[test]
    fn test_cone_query_near_pole() {
        let stars = vec![star(1, 0.0, 89.5), star(2, 180.0, 89.5), star(3, 90.0, 80.0)];
        let cells = SkyCells::new(16, &stars);
        let hits = cells.query(&stars, 37.0, 90.0, 1.0);
        assert_eq!(ids(&stars, &hits), vec![1, 2]);
    }

    #[test]
    fn test_cone_query_matches_brute_force() {
        let mut rng = StdRng::seed_from_u64(3);
        let stars: Vec<Star> = (0..5000)
            .map(|i| {
                let ra = rng.random_range(0.0..360.0);
                let z: f64 = rng.random_range(-1.0..1.0);
                star(i, ra, z.asin().to_degrees())
            })
            .collect();
        let cells = SkyCells::new(16, &stars);

        for &(ra, dec, radius) in &[(120.0, 30.0, 5.0), (359.0, -60.0, 12.0), (10.0, 85.0, 8.0)] {
            let hits = cells.query(&stars, ra, dec, radius);
            let expected: Vec<usize> = (0..stars.len())
                .filter(|&i| angular_separation_deg(ra, dec, stars[i].ra_deg, stars[i].dec_deg) <= radius - 1e-9)
                .collect();
            for e in &expected {
                assert!(hits.contains(e), "missing star {e} for query ({ra}, {dec})");
            }
            assert!(hits.len() <= expected.len() + 2);
        }
    }
}
