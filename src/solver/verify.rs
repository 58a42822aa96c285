//! Log-odds verification of a candidate WCS.
//!
//! Index stars around the candidate field are projected into the image. Each
//! test star (a detected star not used by the quad) then either claims the
//! nearest unclaimed projected star within the match radius or counts as a
//! distractor:
//!
//! ```text
//! match:  ln(d + (1 − d) · g(r) / p_bg)     g = N(0, σ² = R²/4) in 2-D, p_bg = 1/(W·H)
//! miss:   ln(d)
//! ```
//!
//! where `d` is the distractor fraction and `R` the match radius. The sum
//! compares "this WCS is right" against "the stars are where they are by
//! chance".

use std::f64::consts::PI;

use super::index::CatalogIndex;
use super::quad::QUAD_SIZE;
use super::wcs::TanWcs;
use crate::detected_star::StarList;

/// Reference stars considered per test star, brightest first.
const REFERENCES_PER_TEST_STAR: usize = 2;

#[derive(Debug, Clone)]
pub struct VerifyConfig {
    /// Match radius in pixels. Default: 5.0.
    pub match_radius_px: f64,
    /// Expected fraction of detections with no catalog counterpart. Default: 0.25.
    pub distractor_fraction: f64,
    /// Detected stars scored per candidate, in search order. Default: 150.
    pub max_test_stars: usize,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            match_radius_px: 5.0,
            distractor_fraction: 0.25,
            max_test_stars: 150,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct VerifyResult {
    pub log_odds: f64,
    pub n_tested: usize,
    pub n_matched: usize,
    pub n_distractor: usize,
    /// `(detected star, index star)` pairs.
    pub matches: Vec<(usize, usize)>,
}

/// What the verifier needs to know about the candidate beyond its WCS.
pub struct Candidate<'a> {
    pub wcs: &'a TanWcs,
    /// Detected stars forming the quad.
    pub field_quad: [usize; QUAD_SIZE],
    /// Index stars forming the quad.
    pub index_quad: [usize; QUAD_SIZE],
}

/// Score a candidate against the detected stars.
pub fn verify_candidate(
    candidate: &Candidate<'_>,
    stars: &StarList,
    index: &dyn CatalogIndex,
    image_size: (f64, f64),
    config: &VerifyConfig,
) -> VerifyResult {
    let (width, height) = image_size;
    let wcs = candidate.wcs;
    let radius = config.match_radius_px;

    let tests: Vec<usize> = (0..stars.len())
        .filter(|i| !candidate.field_quad.contains(i))
        .take(config.max_test_stars)
        .collect();
    if tests.is_empty() {
        return VerifyResult::default();
    }

    // reference stars projected into the image, brightest first
    let (ra_c, dec_c) = wcs.pixel_to_radec(width / 2.0, height / 2.0);
    let half_diag_px = 0.5 * (width * width + height * height).sqrt() + radius;
    let cone_deg = half_diag_px * wcs.pixel_scale_arcsec() / 3600.0 * 1.05;
    let max_refs = tests.len() * REFERENCES_PER_TEST_STAR;
    let refs: Vec<(usize, f64, f64)> = index
        .stars_in_cone(ra_c.to_degrees(), dec_c.to_degrees(), cone_deg)
        .into_iter()
        .filter(|i| !candidate.index_quad.contains(i))
        .filter_map(|i| {
            let (ra, dec) = index.star_radec(i);
            let (x, y) = wcs.radec_to_pixel(ra.to_radians(), dec.to_radians())?;
            let inside = x >= -radius && x <= width + radius && y >= -radius && y <= height + radius;
            inside.then_some((i, x, y))
        })
        .take(max_refs)
        .collect();

    let d = config.distractor_fraction.clamp(1e-6, 1.0 - 1e-6);
    let sigma_sq = radius * radius / 4.0;
    let p_bg = 1.0 / (width * height).max(1.0);
    let radius_sq = radius * radius;

    let mut claimed = vec![false; refs.len()];
    let mut result = VerifyResult {
        n_tested: tests.len(),
        ..Default::default()
    };

    for &t in &tests {
        let (sx, sy) = (stars[t].x as f64, stars[t].y as f64);
        let nearest = refs
            .iter()
            .enumerate()
            .filter(|(k, _)| !claimed[*k])
            .map(|(k, &(_, x, y))| (k, (x - sx).powi(2) + (y - sy).powi(2)))
            .filter(|&(_, r2)| r2 <= radius_sq)
            .min_by(|a, b| a.1.total_cmp(&b.1));

        match nearest {
            Some((k, r2)) => {
                claimed[k] = true;
                let g = (-r2 / (2.0 * sigma_sq)).exp() / (2.0 * PI * sigma_sq);
                result.log_odds += (d + (1.0 - d) * g / p_bg).ln();
                result.n_matched += 1;
                result.matches.push((t, refs[k].0));
            }
            None => {
                result.log_odds += d.ln();
                result.n_distractor += 1;
            }
        }
    }
    result
}
