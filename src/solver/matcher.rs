//! Iterative quad matcher.
//!
//! Stars are considered in search order, one depth window at a time. When
//! star `n` enters the pool, every quad whose newest member is `n` is tried:
//!
//! * `n` on the backbone: `B = n`, `A < n`, and C, D from the older stars
//!   inside the AB circle;
//! * `n` off the backbone: `C = n` inside the circle of an older pair
//!   `A < B`, and D any other older star inside it.
//!
//! Each quad is therefore tried exactly once over the whole search. Its codes
//! (both parities) are looked up in every index whose scale range is
//! compatible with the backbone length; each hit gets a four-star TAN fit,
//! a pixel-scale check, a quad residual check and finally a log-odds
//! verification. The best candidate is tracked across all windows; the
//! search stops at the first candidate reaching the acceptance threshold.

use std::time::Instant;

use tracing::{debug, info};

use super::depth::SearchState;
use super::index::IndexHandle;
use super::quad::{field_codes, QUAD_SIZE};
use super::tweak::tweak;
use super::verify::{verify_candidate, Candidate, VerifyResult};
use super::wcs::{fit_tan_wcs, TanWcs};
use super::{SolveConfig, SolveReport, SolveStatus, WcsResult};
use crate::detected_star::StarList;

/// Slack on the backbone circle radius, relative.
const CIRCLE_SLACK: f64 = 1.0 + 1e-9;

/// Acceptance is inclusive.
pub fn accepts(log_odds: f64, threshold: f64) -> bool {
    log_odds >= threshold
}

/// The best-scoring candidate seen so far.
#[derive(Debug, Clone)]
pub struct MatchCandidate {
    pub wcs: TanWcs,
    pub log_odds: f64,
    /// Position of the index in the caller's list.
    pub index: usize,
    pub field_quad: [usize; QUAD_SIZE],
    pub index_quad: [usize; QUAD_SIZE],
    pub verify: VerifyResult,
}

struct QuadMatcher<'a> {
    stars: &'a StarList,
    positions: Vec<(f64, f64)>,
    indices: &'a [IndexHandle],
    config: &'a SolveConfig,
    width: f64,
    height: f64,
    crpix: [f64; 2],
    min_ab_px: f64,
    max_ab_px: f64,
    quads_tried: u64,
    candidates_verified: u64,
    best: Option<MatchCandidate>,
    lookup: Vec<usize>,
}

impl<'a> QuadMatcher<'a> {
    fn new(stars: &'a StarList, width: u32, height: u32, indices: &'a [IndexHandle], config: &'a SolveConfig) -> Self {
        let (w, h) = (width as f64, height as f64);
        Self {
            stars,
            positions: stars.iter().map(|s| (s.x as f64, s.y as f64)).collect(),
            indices,
            config,
            width: w,
            height: h,
            crpix: [w / 2.0, h / 2.0],
            min_ab_px: config.quad_size_min_fraction * w.min(h),
            max_ab_px: config.quad_size_max_fraction * (w * w + h * h).sqrt(),
            quads_tried: 0,
            candidates_verified: 0,
            best: None,
            lookup: Vec::new(),
        }
    }

    fn dist_sq(&self, i: usize, j: usize) -> f64 {
        let (a, b) = (self.positions[i], self.positions[j]);
        (a.0 - b.0).powi(2) + (a.1 - b.1).powi(2)
    }

    /// Older stars (`< n`, excluding `skip`) inside the circle on backbone `a`-`b`.
    fn inside_circle(&self, a: usize, b: usize, n: usize, skip: &[usize]) -> Vec<usize> {
        let (pa, pb) = (self.positions[a], self.positions[b]);
        let mid = ((pa.0 + pb.0) / 2.0, (pa.1 + pb.1) / 2.0);
        let r_sq = self.dist_sq(a, b) / 4.0 * CIRCLE_SLACK;
        (0..n)
            .filter(|i| !skip.contains(i))
            .filter(|&i| {
                let p = self.positions[i];
                (p.0 - mid.0).powi(2) + (p.1 - mid.1).powi(2) <= r_sq
            })
            .collect()
    }

    fn backbone_ok(&self, a: usize, b: usize) -> bool {
        let ab = self.dist_sq(a, b).sqrt();
        ab >= self.min_ab_px && ab <= self.max_ab_px
    }

    /// Try every quad whose newest star is `n`.
    fn add_star(&mut self, n: usize) -> Option<MatchCandidate> {
        // n on the backbone
        for a in 0..n {
            if !self.backbone_ok(a, n) {
                continue;
            }
            let inside = self.inside_circle(a, n, n, &[a]);
            for (k, &c) in inside.iter().enumerate() {
                for &d in &inside[k + 1..] {
                    if let Some(hit) = self.try_quad([a, n, c, d]) {
                        return Some(hit);
                    }
                }
            }
        }
        // n off the backbone
        for b in 1..n {
            for a in 0..b {
                if !self.backbone_ok(a, b) {
                    continue;
                }
                let inside = self.inside_circle(a, b, n + 1, &[a, b]);
                if !inside.contains(&n) {
                    continue;
                }
                for &d in inside.iter().filter(|&&d| d != n) {
                    if let Some(hit) = self.try_quad([a, b, n, d]) {
                        return Some(hit);
                    }
                }
            }
        }
        None
    }

    /// Look up a quad (A, B first) and return an accepted candidate, if any.
    fn try_quad(&mut self, quad: [usize; QUAD_SIZE]) -> Option<MatchCandidate> {
        self.quads_tried += 1;
        let pts: [(f64, f64); QUAD_SIZE] = std::array::from_fn(|i| self.positions[quad[i]]);
        let codes = field_codes(&pts)?;
        let ab_px = self.dist_sq(quad[0], quad[1]).sqrt();
        let ab_lo_deg = ab_px * self.config.scale_low_arcsec / 3600.0;
        let ab_hi_deg = ab_px * self.config.scale_high_arcsec / 3600.0;

        let indices = self.indices;
        for (ii, index) in indices.iter().enumerate() {
            let (lo, hi) = index.scale_range_deg();
            if ab_hi_deg < lo || ab_lo_deg > hi {
                continue;
            }
            for (code, perm) in &codes {
                let mut hits = std::mem::take(&mut self.lookup);
                hits.clear();
                index.find_codes(code, self.config.code_tolerance, &mut hits);
                let field_quad: [usize; QUAD_SIZE] = std::array::from_fn(|k| quad[perm[k]]);
                let mut accepted = None;
                for &q in &hits {
                    let index_quad = index.quad_stars(q);
                    if let Some(c) = self.evaluate(ii, field_quad, index_quad) {
                        accepted = Some(c);
                        break;
                    }
                }
                self.lookup = hits;
                if accepted.is_some() {
                    return accepted;
                }
            }
        }
        None
    }

    /// Fit, check and verify one correspondence. Returns it when accepted.
    fn evaluate(
        &mut self,
        index_pos: usize,
        field_quad: [usize; QUAD_SIZE],
        index_quad: [usize; QUAD_SIZE],
    ) -> Option<MatchCandidate> {
        let indices = self.indices;
        let index = &indices[index_pos];
        let sky: Vec<(f64, f64)> = index_quad
            .iter()
            .map(|&s| {
                let (ra, dec) = index.star_radec(s);
                (ra.to_radians(), dec.to_radians())
            })
            .collect();
        let pix: Vec<(f64, f64)> = field_quad.iter().map(|&f| self.positions[f]).collect();
        let wcs = fit_tan_wcs(&sky, &pix, self.crpix)?;

        let scale = wcs.pixel_scale_arcsec();
        if scale < self.config.scale_low_arcsec || scale > self.config.scale_high_arcsec {
            return None;
        }
        let max_residual = 2.0 * self.config.verify.match_radius_px;
        for (&(ra, dec), &(x, y)) in sky.iter().zip(&pix) {
            let (px, py) = wcs.radec_to_pixel(ra, dec)?;
            if (px - x).powi(2) + (py - y).powi(2) > max_residual * max_residual {
                return None;
            }
        }

        let candidate = Candidate {
            wcs: &wcs,
            field_quad,
            index_quad,
        };
        let verify = verify_candidate(
            &candidate,
            self.stars,
            &**index,
            (self.width, self.height),
            &self.config.verify,
        );
        self.candidates_verified += 1;
        debug!(
            "candidate {:?} -> index {} quad {:?}: log-odds {:.2} ({} matched / {} tested), scale {:.2}\"/px",
            field_quad, index_pos, index_quad, verify.log_odds, verify.n_matched, verify.n_tested, scale
        );

        let log_odds = verify.log_odds;
        let candidate = MatchCandidate {
            wcs,
            log_odds,
            index: index_pos,
            field_quad,
            index_quad,
            verify,
        };
        let better = self.best.as_ref().map_or(true, |b| log_odds > b.log_odds);
        if accepts(log_odds, self.config.log_odds_threshold) {
            self.best = Some(candidate.clone());
            return Some(candidate);
        }
        if better {
            self.best = Some(candidate);
        }
        None
    }
}

fn is_cancelled(config: &SolveConfig) -> bool {
    config
        .cancel
        .as_ref()
        .is_some_and(|flag| flag.load(std::sync::atomic::Ordering::Relaxed))
}

/// Run the depth-iterated search and assemble the report.
pub(crate) fn run(
    stars: &StarList,
    width: u32,
    height: u32,
    indices: &[IndexHandle],
    config: &SolveConfig,
) -> SolveReport {
    let started = Instant::now();
    let mut report = SolveReport::new(SolveStatus::Exhausted);
    report.num_stars = stars.len();

    if stars.len() < QUAD_SIZE {
        info!("solve skipped: {} stars, need at least {}", stars.len(), QUAD_SIZE);
        report.status = SolveStatus::InsufficientStars;
        report.solve_time_ms = started.elapsed().as_secs_f64() * 1e3;
        return report;
    }
    let usable: Vec<IndexHandle> = indices.iter().filter(|i| i.num_quads() > 0).cloned().collect();
    if usable.is_empty() {
        info!("solve skipped: no usable index among {}", indices.len());
        report.status = SolveStatus::NoIndexLoaded;
        report.solve_time_ms = started.elapsed().as_secs_f64() * 1e3;
        return report;
    }

    let mut matcher = QuadMatcher::new(stars, width, height, &usable, config);
    let total = stars.len();
    let mut state = SearchState::NotStarted;
    let mut accepted: Option<MatchCandidate> = None;

    for (start, end) in config.depth.windows(total) {
        if is_cancelled(config) {
            report.status = SolveStatus::Cancelled;
            break;
        }
        if config
            .timeout_ms
            .is_some_and(|ms| started.elapsed().as_millis() >= ms as u128)
        {
            report.status = SolveStatus::Timeout;
            break;
        }

        state = SearchState::Searching { depth: end };
        report.checkpoints_attempted += 1;
        report.last_window = Some((start, end));
        debug!("depth window [{start}, {end}) of {total} stars");

        for n in start.max(QUAD_SIZE - 1)..end {
            if let Some(hit) = matcher.add_star(n) {
                accepted = Some(hit);
                break;
            }
        }
        if accepted.is_some() {
            state = SearchState::Solved { depth: end };
            break;
        }
    }
    if !state.is_terminal() && report.status == SolveStatus::Exhausted {
        state = SearchState::Exhausted;
    }

    report.quads_tried = matcher.quads_tried;
    report.candidates_verified = matcher.candidates_verified;
    report.best_log_odds = matcher.best.as_ref().map(|b| b.log_odds);

    match (state, accepted) {
        (SearchState::Solved { depth }, Some(hit)) => {
            let index = &usable[hit.index];
            let mut seed: Vec<(usize, usize)> = hit.field_quad.iter().copied().zip(hit.index_quad).collect();
            seed.extend_from_slice(&hit.verify.matches);
            let refined = tweak(
                &hit.wcs,
                &seed,
                stars,
                &**index,
                (width as f64, height as f64),
                config.verify.match_radius_px,
                &config.tweak,
            );
            report.wcs = WcsResult::from_solution(&refined.wcs, refined.sip, hit.log_odds);
            report.status = SolveStatus::Solved;
            report.accepted_depth = Some(depth);
            report.num_matches = refined.matches.len();
            info!(
                "solved at depth {}: RA {:.4} Dec {:.4}, {:.2}\"/px, log-odds {:.1}, {} matches, rms {:.2} px",
                depth,
                report.wcs.ra,
                report.wcs.dec,
                report.wcs.pixel_scale,
                hit.log_odds,
                report.num_matches,
                refined.rms_px
            );
        }
        _ => {
            info!(
                "not solved ({:?}) after {} checkpoint(s), {} quads, best log-odds {:?}",
                report.status, report.checkpoints_attempted, report.quads_tried, report.best_log_odds
            );
        }
    }
    report.solve_time_ms = started.elapsed().as_secs_f64() * 1e3;
    report
}
