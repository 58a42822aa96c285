//! Catalog quad indices.
//!
//! The matcher only sees the [`CatalogIndex`] trait. [`QuadIndex`] is the
//! crate's implementation, built offline from a star list:
//!
//! 1. Apply the magnitude cut (and optional sky region) and sort stars
//!    brightest first, so star index order equals brightness order.
//! 2. Bin the stars into [`SkyCells`] for cone searches.
//! 3. For a geometric ladder of quad scales, spread fields over the sky on a
//!    Fibonacci lattice. In each field take the brightest stars and walk
//!    their 4-combinations brightest first, keeping quads whose widest pair
//!    lies within the index's scale range and whose other two stars fall
//!    inside the circle on that pair.
//! 4. Sort the quads by their first code coordinate so that tolerance
//!    lookups are a binary search plus a short scan.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, bail, ensure, Context};
use nalgebra::Vector3;
use rayon::prelude::*;
use rkyv::{Archive, Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::combinations::BreadthFirstCombinations;
use super::quad::{code_distance_sq, inside_backbone_circle, sky_code, Code, QUAD_SIZE};
use crate::catalog::read_star_csv;
use crate::skycells::SkyCells;
use crate::star::{radec_to_uvec, Star};

/// Read-only lookup interface over a set of catalog quads.
///
/// Stars are addressed by index; lower indices are brighter.
pub trait CatalogIndex: Send + Sync {
    /// Range of quad backbone (AB) lengths covered, degrees.
    fn scale_range_deg(&self) -> (f64, f64);

    fn num_stars(&self) -> usize;

    fn num_quads(&self) -> usize;

    /// Push onto `out` every quad whose code lies within `tolerance` (L2) of `code`.
    fn find_codes(&self, code: &Code, tolerance: f64, out: &mut Vec<usize>);

    /// Star indices of a quad in canonical A, B, C, D order.
    fn quad_stars(&self, quad: usize) -> [usize; QUAD_SIZE];

    /// RA/Dec of a star, degrees.
    fn star_radec(&self, star: usize) -> (f64, f64);

    /// Stars within `radius_deg` of a sky position, brightest first.
    fn stars_in_cone(&self, ra_deg: f64, dec_deg: f64, radius_deg: f64) -> Vec<usize>;
}

/// Shared handle to a loaded index.
pub type IndexHandle = Arc<dyn CatalogIndex>;

/// Circular patch of sky, degrees.
#[derive(Debug, Clone, Copy, PartialEq, Archive, Serialize, Deserialize)]
pub struct SkyRegion {
    pub ra_deg: f64,
    pub dec_deg: f64,
    pub radius_deg: f64,
}

/// Parameters for [`QuadIndex::build`].
#[derive(Debug, Clone)]
pub struct IndexBuildConfig {
    /// Smallest quad backbone length, degrees. Default: 0.5.
    pub scale_lower_deg: f64,
    /// Largest quad backbone length, degrees. Default: 2.0.
    pub scale_upper_deg: f64,
    /// Faintest magnitude kept. Default: None (keep all).
    pub max_magnitude: Option<f32>,
    /// Brightest stars per lattice field used to form quads. Default: 10.
    pub stars_per_field: usize,
    /// Quads accepted per lattice field. Default: 25.
    pub quads_per_field: usize,
    /// Lattice fields per field-sized area of sky. Default: 2.
    pub lattice_oversampling: usize,
    /// Ratio between consecutive quad scales. Default: 1.5.
    pub multiscale_step: f64,
    /// Sky grid resolution for cone searches. Default: 16.
    pub cells_nside: u32,
    /// Only index this patch of sky. Default: None (whole sky).
    pub region: Option<SkyRegion>,
}

impl Default for IndexBuildConfig {
    fn default() -> Self {
        Self {
            scale_lower_deg: 0.5,
            scale_upper_deg: 2.0,
            max_magnitude: None,
            stars_per_field: 10,
            quads_per_field: 25,
            lattice_oversampling: 2,
            multiscale_step: 1.5,
            cells_nside: 16,
            region: None,
        }
    }
}

/// How an index was built.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub struct IndexProperties {
    pub scale_lower_deg: f64,
    pub scale_upper_deg: f64,
    /// Faintest magnitude kept; infinite when there was no cut.
    pub max_magnitude: f32,
    pub num_stars: u32,
    pub num_quads: u32,
    pub stars_per_field: u32,
    pub quads_per_field: u32,
    pub region: Option<SkyRegion>,
}

/// A serializable quad index over a brightness-sorted star list.
#[derive(Debug, Clone, Archive, Serialize, Deserialize)]
pub struct QuadIndex {
    /// Index stars, brightest first.
    pub stars: Vec<Star>,
    pub cells: SkyCells,
    /// Quads as star indices, canonical A, B, C, D order, sorted by `codes[i][0]`.
    pub quads: Vec<[u32; QUAD_SIZE]>,
    pub codes: Vec<Code>,
    pub props: IndexProperties,
}

/// Fraction of the current quad scale used as the lattice field radius.
const FIELD_RADIUS_FACTOR: f64 = 0.6;

/// Approximate number of cones of the given half-angle needed to tile the sky.
fn num_fields_for_sky(radius_rad: f64) -> usize {
    let cone = std::f64::consts::TAU * (1.0 - radius_rad.cos());
    if cone <= 0.0 {
        return 1;
    }
    ((4.0 * std::f64::consts::PI / cone).ceil() as usize).max(1)
}

/// `n` near-uniform unit vectors (golden spiral).
fn fibonacci_lattice(n: usize) -> Vec<Vector3<f64>> {
    let golden = (1.0 + 5.0f64.sqrt()) / 2.0;
    (0..n)
        .map(|i| {
            let z = 1.0 - (2.0 * i as f64 + 1.0) / n as f64;
            let r = (1.0 - z * z).sqrt();
            let theta = std::f64::consts::TAU * i as f64 / golden;
            Vector3::new(r * theta.cos(), r * theta.sin(), z)
        })
        .collect()
}

/// Geometric ladder of scales from `lower` to `upper`.
fn quad_scales(lower: f64, upper: f64, step: f64) -> Vec<f64> {
    let ratio = upper / lower;
    let step = step.max(1.01);
    if ratio < step.sqrt() {
        return vec![upper];
    }
    let divisions = (ratio.ln() / step.ln()).ceil() as usize + 1;
    (0..divisions)
        .map(|i| {
            let t = i as f64 / (divisions - 1) as f64;
            (lower.ln() + t * (upper.ln() - lower.ln())).exp()
        })
        .collect()
}

/// Canonical quad and code for four stars, if they form a valid quad in range.
fn make_quad(stars: &[Star], combo: [usize; QUAD_SIZE], lower: f64, upper: f64) -> Option<([u32; QUAD_SIZE], Code)> {
    let dirs: [Vector3<f64>; QUAD_SIZE] = std::array::from_fn(|i| stars[combo[i]].uvec());

    // backbone = widest pair = smallest dot product
    let mut best = (0, 1, f64::INFINITY);
    for i in 0..QUAD_SIZE {
        for j in (i + 1)..QUAD_SIZE {
            let d = dirs[i].dot(&dirs[j]);
            if d < best.2 {
                best = (i, j, d);
            }
        }
    }
    let (a, b, _) = best;
    let ab_deg = dirs[a].cross(&dirs[b]).norm().atan2(dirs[a].dot(&dirs[b])).to_degrees();
    if ab_deg < lower || ab_deg > upper {
        return None;
    }

    let mut order = [a, b, 0, 0];
    let mut k = 2;
    for i in 0..QUAD_SIZE {
        if i != a && i != b {
            order[k] = i;
            k += 1;
        }
    }
    let radec: [(f64, f64); QUAD_SIZE] = std::array::from_fn(|i| {
        let s = &stars[combo[order[i]]];
        (s.ra_deg, s.dec_deg)
    });
    let (code, perm) = sky_code(&radec)?;
    if !inside_backbone_circle(&code) {
        return None;
    }
    Some((std::array::from_fn(|i| combo[order[perm[i]]] as u32), code))
}

impl QuadIndex {
    /// Build an index from a star list.
    pub fn build(stars: &[Star], config: &IndexBuildConfig) -> Self {
        let lower = config.scale_lower_deg.min(config.scale_upper_deg).max(1e-6);
        let upper = config.scale_upper_deg.max(lower);
        let max_mag = config.max_magnitude.unwrap_or(f32::INFINITY);

        let region = config.region.map(|r| (radec_to_uvec(r.ra_deg, r.dec_deg), r));
        // keep a margin of one quad scale around the region
        let in_region = |dir: &Vector3<f64>, margin_deg: f64| match &region {
            Some((center, r)) => {
                center.dot(dir) >= (r.radius_deg + margin_deg).min(180.0).to_radians().cos()
            }
            None => true,
        };

        let mut kept: Vec<Star> = stars
            .iter()
            .filter(|s| s.mag <= max_mag && in_region(&s.uvec(), upper))
            .cloned()
            .collect();
        kept.sort_by(|a, b| a.mag.total_cmp(&b.mag));
        info!(
            "Building quad index from {} of {} stars, scales {:.3}..{:.3} deg",
            kept.len(),
            stars.len(),
            lower,
            upper
        );

        let cells = SkyCells::new(config.cells_nside, &kept);

        let mut seen: HashSet<[u32; QUAD_SIZE]> = HashSet::new();
        let mut entries: Vec<([u32; QUAD_SIZE], Code)> = Vec::new();

        for &scale in quad_scales(lower, upper, config.multiscale_step).iter().rev() {
            let radius_deg = FIELD_RADIUS_FACTOR * scale;
            let n_fields = num_fields_for_sky(radius_deg.to_radians()) * config.lattice_oversampling.max(1);
            let before = entries.len();

            for center in fibonacci_lattice(n_fields) {
                if !in_region(&center, radius_deg) {
                    continue;
                }
                let field = cells.query_uvec(&kept, &center, radius_deg);
                if field.len() < QUAD_SIZE {
                    continue;
                }
                let field = &field[..field.len().min(config.stars_per_field)];

                let mut accepted = 0;
                for combo in BreadthFirstCombinations::<QUAD_SIZE>::new(field) {
                    let Some((quad, code)) = make_quad(&kept, combo, lower, upper) else {
                        continue;
                    };
                    let mut key = quad;
                    key.sort_unstable();
                    if seen.insert(key) {
                        entries.push((quad, code));
                    }
                    accepted += 1;
                    if accepted >= config.quads_per_field {
                        break;
                    }
                }
            }
            debug!(
                "scale {:.3} deg: {} fields, {} new quads",
                scale,
                n_fields,
                entries.len() - before
            );
        }

        entries.sort_by(|a, b| a.1[0].total_cmp(&b.1[0]));
        let (quads, codes): (Vec<_>, Vec<_>) = entries.into_iter().unzip();
        info!("Quad index built: {} stars, {} quads", kept.len(), quads.len());

        let props = IndexProperties {
            scale_lower_deg: lower,
            scale_upper_deg: upper,
            max_magnitude: max_mag,
            num_stars: kept.len() as u32,
            num_quads: quads.len() as u32,
            stars_per_field: config.stars_per_field as u32,
            quads_per_field: config.quads_per_field as u32,
            region: config.region,
        };
        Self {
            stars: kept,
            cells,
            quads,
            codes,
            props,
        }
    }

    /// Build an index from a CSV star list (see [`crate::catalog`]).
    pub fn build_from_csv<P: AsRef<Path>>(path: P, config: &IndexBuildConfig) -> anyhow::Result<Self> {
        let stars = read_star_csv(path)?;
        Ok(Self::build(&stars, config))
    }

    pub fn to_bytes(&self) -> anyhow::Result<Vec<u8>> {
        let bytes = rkyv::to_bytes::<rkyv::rancor::Error>(self)
            .map_err(|e| anyhow!("index serialization failed: {e}"))?;
        Ok(bytes.to_vec())
    }

    /// Decode an index and check it with [`QuadIndex::validate`].
    pub fn from_bytes(bytes: &[u8]) -> anyhow::Result<Self> {
        let index = rkyv::from_bytes::<Self, rkyv::rancor::Error>(bytes)
            .map_err(|e| anyhow!("index deserialization failed: {e}"))?;
        index.validate()?;
        Ok(index)
    }

    /// Check the internal consistency of an index, so that lookups on it
    /// cannot go out of bounds.
    pub fn validate(&self) -> anyhow::Result<()> {
        let n_stars = self.stars.len();
        ensure!(
            self.quads.len() == self.codes.len(),
            "index has {} quads but {} codes",
            self.quads.len(),
            self.codes.len()
        );
        ensure!(
            self.props.num_stars as usize == n_stars && self.props.num_quads as usize == self.quads.len(),
            "index header says {} stars and {} quads, found {} and {}",
            self.props.num_stars,
            self.props.num_quads,
            n_stars,
            self.quads.len()
        );
        ensure!(
            self.props.scale_lower_deg.is_finite()
                && self.props.scale_upper_deg.is_finite()
                && self.props.scale_lower_deg <= self.props.scale_upper_deg,
            "index scale range {}..{} is invalid",
            self.props.scale_lower_deg,
            self.props.scale_upper_deg
        );
        if let Some((q, quad)) = self
            .quads
            .iter()
            .enumerate()
            .find(|(_, quad)| quad.iter().any(|&s| s as usize >= n_stars))
        {
            bail!("quad {q} references star {quad:?} of {n_stars}");
        }
        ensure!(
            self.codes.iter().flatten().all(|v| v.is_finite()),
            "index contains non-finite codes"
        );
        ensure!(
            self.codes.windows(2).all(|w| w[0][0] <= w[1][0]),
            "index codes are not sorted"
        );
        self.cells.validate(n_stars)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let path = path.as_ref();
        let bytes = self.to_bytes()?;
        std::fs::write(path, &bytes).with_context(|| format!("writing index {}", path.display()))?;
        info!("Saved quad index to {} ({} bytes)", path.display(), bytes.len());
        Ok(())
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).with_context(|| format!("reading index {}", path.display()))?;
        let index = Self::from_bytes(&bytes).with_context(|| format!("decoding index {}", path.display()))?;
        info!(
            "Loaded quad index {}: {} stars, {} quads",
            path.display(),
            index.stars.len(),
            index.quads.len()
        );
        Ok(index)
    }
}

impl CatalogIndex for QuadIndex {
    fn scale_range_deg(&self) -> (f64, f64) {
        (self.props.scale_lower_deg, self.props.scale_upper_deg)
    }

    fn num_stars(&self) -> usize {
        self.stars.len()
    }

    fn num_quads(&self) -> usize {
        self.quads.len()
    }

    fn find_codes(&self, code: &Code, tolerance: f64, out: &mut Vec<usize>) {
        let lo = self.codes.partition_point(|c| c[0] < code[0] - tolerance);
        let hi = self.codes.partition_point(|c| c[0] <= code[0] + tolerance);
        let tol_sq = tolerance * tolerance;
        out.extend((lo..hi).filter(|&i| code_distance_sq(&self.codes[i], code) <= tol_sq));
    }

    fn quad_stars(&self, quad: usize) -> [usize; QUAD_SIZE] {
        self.quads[quad].map(|s| s as usize)
    }

    fn star_radec(&self, star: usize) -> (f64, f64) {
        let s = &self.stars[star];
        (s.ra_deg, s.dec_deg)
    }

    fn stars_in_cone(&self, ra_deg: f64, dec_deg: f64, radius_deg: f64) -> Vec<usize> {
        self.cells.query(&self.stars, ra_deg, dec_deg, radius_deg)
    }
}

/// Load index files in parallel.
///
/// Files that fail to load are logged and skipped; the rest come back in
/// input order.
pub fn load_indices<P: AsRef<Path> + Sync>(paths: &[P]) -> Vec<IndexHandle> {
    let loaded: Vec<Option<IndexHandle>> = paths
        .par_iter()
        .map(|p| match QuadIndex::load_from_file(p) {
            Ok(index) => Some(Arc::new(index) as IndexHandle),
            Err(e) => {
                warn!("skipping index {}: {e:#}", p.as_ref().display());
                None
            }
        })
        .collect();
    let loaded: Vec<IndexHandle> = loaded.into_iter().flatten().collect();
    info!("{} of {} index file(s) loaded", loaded.len(), paths.len());
    loaded
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::star::angular_separation_deg;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_patch(seed: u64, n: usize, center: (f64, f64), radius: f64) -> Vec<Star> {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut out = Vec::with_capacity(n);
        while out.len() < n {
            let ra = center.0 + rng.random_range(-radius..radius);
            let dec = center.1 + rng.random_range(-radius..radius);
            if angular_separation_deg(ra, dec, center.0, center.1) <= radius {
                out.push(Star::new(out.len() as u64, ra, dec, rng.random_range(2.0..9.0)));
            }
        }
        out
    }

    fn small_config() -> IndexBuildConfig {
        IndexBuildConfig {
            scale_lower_deg: 1.0,
            scale_upper_deg: 3.0,
            region: Some(SkyRegion {
                ra_deg: 120.0,
                dec_deg: 20.0,
                radius_deg: 5.0,
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_quad_scales() {
        assert_eq!(quad_scales(1.0, 1.1, 1.5), vec![1.1]);
        let s = quad_scales(1.0, 4.0, 2.0);
        assert_eq!(s.len(), 3);
        assert!((s[0] - 1.0).abs() < 1e-12 && (s[1] - 2.0).abs() < 1e-12 && (s[2] - 4.0).abs() < 1e-12);
    }

    #[test]
    fn test_lattice_is_unit_and_spread() {
        let pts = fibonacci_lattice(500);
        assert!(pts.iter().all(|p| (p.norm() - 1.0).abs() < 1e-12));
        let north = pts.iter().filter(|p| p.z > 0.0).count();
        assert!((north as i64 - 250).abs() <= 1);
        assert_eq!(num_fields_for_sky(std::f64::consts::PI), 1);
    }

    #[test]
    fn test_build_produces_valid_sorted_quads() {
        let stars = random_patch(5, 600, (120.0, 20.0), 8.0);
        let index = QuadIndex::build(&stars, &small_config());
        assert!(index.num_quads() > 50, "only {} quads", index.num_quads());
        assert_eq!(index.quads.len(), index.codes.len());
        assert!(index.codes.windows(2).all(|w| w[0][0] <= w[1][0]));
        // brightest first
        assert!(index.stars.windows(2).all(|w| w[0].mag <= w[1].mag));

        let mut keys = HashSet::new();
        for (q, code) in index.quads.iter().zip(&index.codes) {
            let mut key = *q;
            key.sort_unstable();
            assert!(keys.insert(key), "duplicate quad {q:?}");
            assert!(code[0] <= code[2] + 1e-12);
            assert!((code[0] + code[2]) / 2.0 <= 0.5 + 1e-12);
            assert!(inside_backbone_circle(code));

            let (ra_a, dec_a) = index.star_radec(q[0] as usize);
            let (ra_b, dec_b) = index.star_radec(q[1] as usize);
            let ab = angular_separation_deg(ra_a, dec_a, ra_b, dec_b);
            assert!((1.0 - 1e-9..=3.0 + 1e-9).contains(&ab), "backbone {ab}");
        }
    }

    #[test]
    fn test_stored_code_matches_recomputed_code() {
        let stars = random_patch(6, 400, (120.0, 20.0), 8.0);
        let index = QuadIndex::build(&stars, &small_config());
        for q in 0..index.num_quads().min(40) {
            let ids = index.quad_stars(q);
            let radec: [(f64, f64); 4] = std::array::from_fn(|i| index.star_radec(ids[i]));
            let (code, perm) = sky_code(&radec).unwrap();
            assert_eq!(perm, [0, 1, 2, 3]);
            assert!(code_distance_sq(&code, &index.codes[q]) < 1e-20);
        }
    }

    #[test]
    fn test_find_codes() {
        let stars = random_patch(7, 400, (120.0, 20.0), 8.0);
        let index = QuadIndex::build(&stars, &small_config());
        let mut out = Vec::new();
        for q in (0..index.num_quads()).step_by(7) {
            out.clear();
            index.find_codes(&index.codes[q], 1e-9, &mut out);
            assert!(out.contains(&q));
        }
        out.clear();
        index.find_codes(&[5.0, 5.0, 5.0, 5.0], 0.02, &mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn test_save_load_roundtrip() {
        let stars = random_patch(8, 300, (120.0, 20.0), 8.0);
        let index = QuadIndex::build(&stars, &small_config());
        let path = std::env::temp_dir().join(format!("quadsolve_index_{}.qidx", std::process::id()));
        index.save_to_file(&path).unwrap();
        let back = QuadIndex::load_from_file(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(back.stars, index.stars);
        assert_eq!(back.quads, index.quads);
        assert_eq!(back.codes, index.codes);
        assert_eq!(back.props, index.props);
        assert_eq!(
            back.stars_in_cone(120.0, 20.0, 2.0),
            index.stars_in_cone(120.0, 20.0, 2.0)
        );
    }

    #[test]
    fn test_load_indices_skips_bad_files() {
        let stars = random_patch(9, 300, (120.0, 20.0), 8.0);
        let index = QuadIndex::build(&stars, &small_config());
        let dir = std::env::temp_dir();
        let good = dir.join(format!("quadsolve_good_{}.qidx", std::process::id()));
        let bad = dir.join(format!("quadsolve_bad_{}.qidx", std::process::id()));
        let missing = dir.join("quadsolve_missing_index.qidx");
        index.save_to_file(&good).unwrap();
        std::fs::write(&bad, b"not an index").unwrap();

        let loaded = load_indices(&[bad.clone(), good.clone(), missing]);
        std::fs::remove_file(&good).ok();
        std::fs::remove_file(&bad).ok();

        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].num_quads(), index.num_quads());
        assert!(load_indices::<&str>(&[]).is_empty());
    }

    #[test]
    fn test_inconsistent_index_is_rejected() {
        let stars = random_patch(10, 300, (120.0, 20.0), 8.0);
        let index = QuadIndex::build(&stars, &small_config());
        assert!(index.validate().is_ok());

        // a lone star with a quad pointing past the end of the star list
        let mut dangling = index.clone();
        dangling.stars.truncate(1);
        dangling.cells = SkyCells::new(4, &dangling.stars);
        dangling.quads = vec![[0, 1, 2, 999]];
        dangling.codes = vec![[0.1, 0.2, 0.3, 0.4]];
        dangling.props.num_stars = 1;
        dangling.props.num_quads = 1;
        let bytes = dangling.to_bytes().unwrap();
        assert!(QuadIndex::from_bytes(&bytes).is_err());

        let mut unsorted = index.clone();
        unsorted.codes.reverse();
        assert!(unsorted.validate().is_err());

        let mut short = index.clone();
        short.codes.pop();
        assert!(short.validate().is_err());

        let mut header = index.clone();
        header.props.num_quads += 1;
        assert!(header.validate().is_err());

        let mut nan = index.clone();
        nan.codes[0][1] = f64::NAN;
        assert!(nan.validate().is_err());

        // cells built over more stars than the index holds
        let mut doubled = index.stars.clone();
        doubled.extend(index.stars.iter().cloned());
        let mut cells = index.clone();
        cells.cells = SkyCells::new(16, &doubled);
        assert!(cells.validate().is_err());

        let dir = std::env::temp_dir();
        let good = dir.join(format!("quadsolve_valid_{}.qidx", std::process::id()));
        let corrupt = dir.join(format!("quadsolve_dangling_{}.qidx", std::process::id()));
        index.save_to_file(&good).unwrap();
        dangling.save_to_file(&corrupt).unwrap();
        let loaded = load_indices(&[corrupt.clone(), good.clone()]);
        std::fs::remove_file(&good).ok();
        std::fs::remove_file(&corrupt).ok();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].num_quads(), index.num_quads());
    }
}
