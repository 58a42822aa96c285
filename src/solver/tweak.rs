//! Refinement of an accepted solution.
//!
//! The accepted candidate's WCS was fitted to four stars only. Tweaking
//! re-fits CD and CRVAL to every matched star, clips outliers by MAD,
//! re-associates detections with the projected index stars and repeats until
//! the match set settles. A SIP polynomial is then fitted to the final
//! matches when there are enough of them.

use std::collections::HashSet;

use tracing::debug;

use super::index::CatalogIndex;
use super::sip::{SipPolynomial, SipSample};
use super::wcs::{cd_inverse, refit_tan_wcs, tan_project, TanWcs};
use crate::detected_star::StarList;

const MAD_SCALE: f64 = 1.4826;
const CLIP_NSIGMA: f64 = 3.0;
/// Residuals below this are never clipped.
const CLIP_FLOOR_PX: f64 = 0.5;
/// Alternating linear / SIP fits after the linear refinement.
const SIP_ROUNDS: usize = 10;

#[derive(Debug, Clone)]
pub struct TweakConfig {
    /// SIP order fitted after the linear refinement; below 2 disables SIP. Default: 2.
    pub sip_order: u32,
    /// Maximum re-fit / re-associate rounds. Default: 5.
    pub iterations: usize,
    /// Matches required before a SIP fit is attempted. Default: 10.
    pub min_matches_for_sip: usize,
}

impl Default for TweakConfig {
    fn default() -> Self {
        Self {
            sip_order: 2,
            iterations: 5,
            min_matches_for_sip: 10,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TweakResult {
    pub wcs: TanWcs,
    pub sip: Option<SipPolynomial>,
    /// `(detected star, index star)` pairs used by the final fit.
    pub matches: Vec<(usize, usize)>,
    /// RMS pixel residual of the final model over `matches`.
    pub rms_px: f64,
}

/// Greedy one-to-one pairing, closest pairs first.
fn find_pixel_matches(
    detected: &[(f64, f64)],
    predicted: &[(usize, f64, f64)],
    radius_px: f64,
) -> Vec<(usize, usize)> {
    let radius_sq = radius_px * radius_px;
    let mut pairs: Vec<(f64, usize, usize)> = Vec::new();
    for (di, &(dx, dy)) in detected.iter().enumerate() {
        for &(si, px, py) in predicted {
            let d2 = (dx - px).powi(2) + (dy - py).powi(2);
            if d2 <= radius_sq {
                pairs.push((d2, di, si));
            }
        }
    }
    pairs.sort_by(|a, b| a.0.total_cmp(&b.0));

    let mut used_det = vec![false; detected.len()];
    let mut used_star = HashSet::new();
    let mut out = Vec::new();
    for (_, di, si) in pairs {
        if !used_det[di] && !used_star.contains(&si) {
            used_det[di] = true;
            used_star.insert(si);
            out.push((di, si));
        }
    }
    out.sort_unstable();
    out
}

fn star_radians(index: &dyn CatalogIndex, star: usize) -> (f64, f64) {
    let (ra, dec) = index.star_radec(star);
    (ra.to_radians(), dec.to_radians())
}

/// Pixel residual of each match under a linear WCS; `None` for stars that
/// cannot be projected.
fn residuals(
    wcs: &TanWcs,
    matches: &[(usize, usize)],
    detected: &[(f64, f64)],
    index: &dyn CatalogIndex,
) -> Vec<Option<f64>> {
    matches
        .iter()
        .map(|&(di, si)| {
            let (ra, dec) = star_radians(index, si);
            let (px, py) = wcs.radec_to_pixel(ra, dec)?;
            let (dx, dy) = detected[di];
            Some(((px - dx).powi(2) + (py - dy).powi(2)).sqrt())
        })
        .collect()
}

fn median(sorted: &[f64]) -> f64 {
    sorted[sorted.len() / 2]
}

/// Drop matches more than `median + 3σ` (σ from the MAD) from the fit.
fn mad_clip(matches: &[(usize, usize)], res: &[Option<f64>]) -> Option<Vec<(usize, usize)>> {
    let mut vals: Vec<f64> = res.iter().flatten().copied().collect();
    if vals.len() < 6 {
        return None;
    }
    vals.sort_by(f64::total_cmp);
    let med = median(&vals);
    let mut dev: Vec<f64> = vals.iter().map(|v| (v - med).abs()).collect();
    dev.sort_by(f64::total_cmp);
    let limit = (med + CLIP_NSIGMA * MAD_SCALE * median(&dev)).max(CLIP_FLOOR_PX);

    let kept: Vec<(usize, usize)> = matches
        .iter()
        .zip(res)
        .filter(|(_, r)| r.is_some_and(|r| r <= limit))
        .map(|(m, _)| *m)
        .collect();
    (kept.len() < matches.len() && kept.len() >= 4).then_some(kept)
}

/// Refine `initial` using all detections and the index stars around the field.
pub fn tweak(
    initial: &TanWcs,
    initial_matches: &[(usize, usize)],
    stars: &StarList,
    index: &dyn CatalogIndex,
    image_size: (f64, f64),
    match_radius_px: f64,
    config: &TweakConfig,
) -> TweakResult {
    let detected: Vec<(f64, f64)> = stars.iter().map(|s| (s.x as f64, s.y as f64)).collect();
    let (width, height) = image_size;

    let mut wcs = *initial;
    let mut matches = initial_matches.to_vec();
    matches.sort_unstable();

    for round in 0..config.iterations.max(1) {
        if matches.len() >= 3 {
            let sky: Vec<(f64, f64)> = matches.iter().map(|&(_, si)| star_radians(index, si)).collect();
            let pix: Vec<(f64, f64)> = matches.iter().map(|&(di, _)| detected[di]).collect();
            match refit_tan_wcs(wcs.crval, &sky, &pix, wcs.crpix) {
                Some(fit) => wcs = fit,
                None => {
                    debug!("tweak round {round}: linear re-fit failed, keeping previous WCS");
                    break;
                }
            }
        }

        let res = residuals(&wcs, &matches, &detected, index);
        if let Some(kept) = mad_clip(&matches, &res) {
            debug!("tweak round {round}: MAD clip {} -> {} matches", matches.len(), kept.len());
            matches = kept;
        }

        // re-associate against every index star in the field
        let (ra_c, dec_c) = wcs.pixel_to_radec(width / 2.0, height / 2.0);
        let cone_deg =
            0.5 * (width * width + height * height).sqrt() * wcs.pixel_scale_arcsec() / 3600.0 * 1.1;
        let predicted: Vec<(usize, f64, f64)> = index
            .stars_in_cone(ra_c.to_degrees(), dec_c.to_degrees(), cone_deg)
            .into_iter()
            .filter_map(|si| {
                let (ra, dec) = star_radians(index, si);
                wcs.radec_to_pixel(ra, dec).map(|(x, y)| (si, x, y))
            })
            .collect();
        let found = find_pixel_matches(&detected, &predicted, match_radius_px);
        if found.len() < 4 || found == matches {
            debug!("tweak round {round}: converged with {} matches", matches.len());
            break;
        }
        debug!("tweak round {round}: re-associated {} -> {} matches", matches.len(), found.len());
        matches = found;
    }

    if matches.len() >= 3 {
        let sky: Vec<(f64, f64)> = matches.iter().map(|&(_, si)| star_radians(index, si)).collect();
        let pix: Vec<(f64, f64)> = matches.iter().map(|&(di, _)| detected[di]).collect();
        if let Some(fit) = refit_tan_wcs(wcs.crval, &sky, &pix, wcs.crpix) {
            wcs = fit;
        }
    }

    let sip = if config.sip_order >= 2 && matches.len() >= config.min_matches_for_sip {
        fit_with_sip(&mut wcs, &matches, &detected, index, image_size, config.sip_order)
    } else {
        None
    };
    let rms_px = rms(&wcs, sip.as_ref(), &matches, &detected, index);
    TweakResult {
        wcs,
        sip,
        matches,
        rms_px,
    }
}

/// Alternate SIP and linear fits; the linear fit is redone on SIP-corrected
/// positions so that CD and CRVAL absorb the low-order part of the distortion.
fn fit_with_sip(
    wcs: &mut TanWcs,
    matches: &[(usize, usize)],
    detected: &[(f64, f64)],
    index: &dyn CatalogIndex,
    image_size: (f64, f64),
    order: u32,
) -> Option<SipPolynomial> {
    let scale = 0.5 * image_size.0.max(image_size.1);
    let sky: Vec<(f64, f64)> = matches.iter().map(|&(_, si)| star_radians(index, si)).collect();

    let mut sip = fit_sip(wcs, matches, detected, &sky, order, scale)?;
    for _ in 0..SIP_ROUNDS {
        let corrected: Vec<(f64, f64)> = matches
            .iter()
            .map(|&(di, _)| {
                let (x, y) = detected[di];
                let (u, v) = sip.forward(x - wcs.crpix[0], y - wcs.crpix[1]);
                (u + wcs.crpix[0], v + wcs.crpix[1])
            })
            .collect();
        let Some(fit) = refit_tan_wcs(wcs.crval, &sky, &corrected, wcs.crpix) else {
            break;
        };
        let Some(next) = fit_sip(&fit, matches, detected, &sky, order, scale) else {
            break;
        };
        *wcs = fit;
        sip = next;
    }
    Some(sip)
}

fn fit_sip(
    wcs: &TanWcs,
    matches: &[(usize, usize)],
    detected: &[(f64, f64)],
    sky: &[(f64, f64)],
    order: u32,
    scale: f64,
) -> Option<SipPolynomial> {
    let inv = cd_inverse(&wcs.cd)?;
    let samples: Vec<SipSample> = matches
        .iter()
        .zip(sky)
        .filter_map(|(&(di, _), &(ra, dec))| {
            let (xi, eta) = tan_project(ra, dec, wcs.crval[0], wcs.crval[1])?;
            let (x, y) = detected[di];
            Some(SipSample {
                u: x - wcs.crpix[0],
                v: y - wcs.crpix[1],
                big_u: inv[0][0] * xi + inv[0][1] * eta,
                big_v: inv[1][0] * xi + inv[1][1] * eta,
            })
        })
        .collect();
    SipPolynomial::fit(order, scale, &samples)
}

fn rms(
    wcs: &TanWcs,
    sip: Option<&SipPolynomial>,
    matches: &[(usize, usize)],
    detected: &[(f64, f64)],
    index: &dyn CatalogIndex,
) -> f64 {
    let Some(inv) = cd_inverse(&wcs.cd) else {
        return f64::NAN;
    };
    let mut sum = 0.0;
    let mut n = 0usize;
    for &(di, si) in matches {
        let (ra, dec) = star_radians(index, si);
        let Some((xi, eta)) = tan_project(ra, dec, wcs.crval[0], wcs.crval[1]) else {
            continue;
        };
        let big = (inv[0][0] * xi + inv[0][1] * eta, inv[1][0] * xi + inv[1][1] * eta);
        let (u, v) = match sip {
            Some(p) => p.inverse(big.0, big.1),
            None => big,
        };
        let (x, y) = detected[di];
        sum += (u + wcs.crpix[0] - x).powi(2) + (v + wcs.crpix[1] - y).powi(2);
        n += 1;
    }
    if n == 0 {
        f64::NAN
    } else {
        (sum / n as f64).sqrt()
    }
}
