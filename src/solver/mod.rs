//! Blind astrometric solver over precomputed quad indices.
//!
//! The solver takes a detection list already in search order (see
//! [`crate::reorder`]) and searches it in growing depth windows:
//!
//! 1. **Quads**: four stars, the widest pair as backbone, encoded as a
//!    similarity-invariant 4-vector ([`quad`]).
//! 2. **Lookup**: codes are matched within a tolerance against every loaded
//!    [`CatalogIndex`] whose scale range fits the backbone ([`index`]).
//! 3. **Verification**: each hit yields a TAN WCS from the four stars, scored
//!    by log-odds over the remaining detections ([`verify`]).
//! 4. **Tweak**: the accepted solution is refined on all matched stars and
//!    optionally given a SIP distortion polynomial ([`tweak`], [`sip`]).
//!
//! Indices are built offline with [`QuadIndex::build`] and loaded by the
//! caller; the solver holds no global state.

pub mod combinations;
pub mod depth;
pub mod index;
pub mod matcher;
pub mod quad;
pub mod sip;
pub mod tweak;
pub mod verify;
pub mod wcs;

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use crate::detected_star::StarList;
use crate::detection::{detect_stars_with_config, DetectionConfig, RawPixelBuffer};
use crate::error::{DetectionError, MatchError};
use crate::reorder::reorder;

pub use depth::DepthSchedule;
pub use index::{load_indices, CatalogIndex, IndexBuildConfig, IndexHandle, QuadIndex};
pub use sip::SipPolynomial;
pub use tweak::TweakConfig;
pub use verify::VerifyConfig;

use wcs::{cd_inverse, inverse_tan_project, tan_project, TanWcs};

/// Margin, in pixels, by which [`WcsResult::is_on_image`] extends the frame.
pub const ON_IMAGE_MARGIN_PX: f64 = 50.0;

// ── Configuration ───────────────────────────────────────────────────────────

/// Parameters controlling a solve.
#[derive(Debug, Clone)]
pub struct SolveConfig {
    /// Smallest plausible pixel scale, arcsec/px. Default: 10.
    pub scale_low_arcsec: f64,
    /// Largest plausible pixel scale, arcsec/px. Default: 180.
    pub scale_high_arcsec: f64,
    /// Log-odds a candidate must reach (inclusive) to be accepted. Default: 20.
    pub log_odds_threshold: f64,
    /// Star-count checkpoints of the incremental search. Default: 10, 20, ..., 200.
    pub depth: DepthSchedule,
    /// Shortest backbone as a fraction of the smaller image side. Default: 0.1.
    pub quad_size_min_fraction: f64,
    /// Longest backbone as a fraction of the image diagonal. Default: 1.0.
    pub quad_size_max_fraction: f64,
    /// Euclidean code-space tolerance for index lookups. Default: 0.02.
    pub code_tolerance: f64,
    pub verify: VerifyConfig,
    pub tweak: TweakConfig,
    /// Checked between depth windows. None = no timeout.
    pub timeout_ms: Option<u64>,
    /// Set from another thread to stop the search at the next window.
    pub cancel: Option<Arc<AtomicBool>>,
}

impl Default for SolveConfig {
    fn default() -> Self {
        Self {
            scale_low_arcsec: 10.0,
            scale_high_arcsec: 180.0,
            log_odds_threshold: 20.0,
            depth: DepthSchedule::default(),
            quad_size_min_fraction: 0.1,
            quad_size_max_fraction: 1.0,
            code_tolerance: 0.02,
            verify: VerifyConfig::default(),
            tweak: TweakConfig::default(),
            timeout_ms: None,
            cancel: None,
        }
    }
}

impl SolveConfig {
    /// Default configuration with the given scale bounds and acceptance threshold.
    pub fn new(scale_low_arcsec: f64, scale_high_arcsec: f64, log_odds_threshold: f64) -> Self {
        Self {
            scale_low_arcsec,
            scale_high_arcsec,
            log_odds_threshold,
            ..Default::default()
        }
    }
}

// ── Results ─────────────────────────────────────────────────────────────────

/// Outcome of a solve attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolveStatus {
    Solved,
    /// Every depth window was searched without an accepted candidate.
    Exhausted,
    /// Fewer than four stars; nothing was searched.
    InsufficientStars,
    /// No index with any quads was supplied; nothing was searched.
    NoIndexLoaded,
    Cancelled,
    Timeout,
}

/// Plate solution in FITS conventions.
///
/// `crpix` is 1-based and `cd_matrix` is in degrees per pixel, as they would
/// be written to a FITS header. Pixel coordinates passed to the conversion
/// helpers are 0-based. An unsolved result has `solved == false` and zeros
/// everywhere else.
#[derive(Debug, Clone, Default)]
pub struct WcsResult {
    pub solved: bool,
    /// Reference point RA, degrees in [0, 360).
    pub ra: f64,
    /// Reference point Dec, degrees.
    pub dec: f64,
    pub crpix: (f64, f64),
    pub cd_matrix: [[f64; 2]; 2],
    /// Arcseconds per pixel.
    pub pixel_scale: f64,
    /// Angle from the tangent-plane East axis to image +x, counter-clockwise, degrees.
    pub rotation_deg: f64,
    /// Log-odds of the accepted candidate.
    pub log_odds: f64,
    /// 0 when no SIP polynomial was fitted.
    pub sip_polynomial_order: u32,
    /// True when det(CD) < 0.
    pub parity: bool,
    pub sip: Option<SipPolynomial>,
}

impl WcsResult {
    pub(crate) fn from_solution(wcs: &TanWcs, sip: Option<SipPolynomial>, log_odds: f64) -> Self {
        let cd = wcs.cd.map(|row| row.map(f64::to_degrees));
        Self {
            solved: true,
            ra: wcs.crval[0].to_degrees().rem_euclid(360.0),
            dec: wcs.crval[1].to_degrees(),
            crpix: (wcs.crpix[0] + 1.0, wcs.crpix[1] + 1.0),
            cd_matrix: cd,
            pixel_scale: wcs.pixel_scale_arcsec(),
            rotation_deg: wcs.rotation_deg(),
            log_odds,
            sip_polynomial_order: sip.as_ref().map_or(0, |s| s.order),
            parity: wcs.determinant() < 0.0,
            sip,
        }
    }

    /// Sky position (RA, Dec in degrees) of a 0-based pixel.
    ///
    /// Returns `None` for an unsolved result.
    pub fn pixel_to_radec(&self, x: f64, y: f64) -> Option<(f64, f64)> {
        if !self.solved {
            return None;
        }
        let mut u = x - (self.crpix.0 - 1.0);
        let mut v = y - (self.crpix.1 - 1.0);
        if let Some(sip) = &self.sip {
            (u, v) = sip.forward(u, v);
        }
        let cd = &self.cd_matrix;
        let xi = (cd[0][0] * u + cd[0][1] * v).to_radians();
        let eta = (cd[1][0] * u + cd[1][1] * v).to_radians();
        let (ra, dec) = inverse_tan_project(xi, eta, self.ra.to_radians(), self.dec.to_radians());
        Some((ra.to_degrees().rem_euclid(360.0), dec.to_degrees()))
    }

    /// 0-based pixel position of a sky position.
    ///
    /// Returns `None` for an unsolved result, a singular CD matrix, or a point
    /// behind the tangent plane.
    pub fn radec_to_pixel(&self, ra_deg: f64, dec_deg: f64) -> Option<(f64, f64)> {
        if !self.solved {
            return None;
        }
        let (xi, eta) = tan_project(
            ra_deg.to_radians(),
            dec_deg.to_radians(),
            self.ra.to_radians(),
            self.dec.to_radians(),
        )?;
        let (xi, eta) = (xi.to_degrees(), eta.to_degrees());
        let inv = cd_inverse(&self.cd_matrix)?;
        let mut u = inv[0][0] * xi + inv[0][1] * eta;
        let mut v = inv[1][0] * xi + inv[1][1] * eta;
        if let Some(sip) = &self.sip {
            (u, v) = sip.inverse(u, v);
        }
        Some((u + self.crpix.0 - 1.0, v + self.crpix.1 - 1.0))
    }

    /// Whether a pixel lies on a `width` x `height` image, allowing
    /// [`ON_IMAGE_MARGIN_PX`] beyond each edge.
    pub fn is_on_image(x: f64, y: f64, width: u32, height: u32) -> bool {
        let m = ON_IMAGE_MARGIN_PX;
        x >= -m && x < width as f64 + m && y >= -m && y < height as f64 + m
    }
}

/// Solve outcome with search diagnostics.
#[derive(Debug, Clone)]
pub struct SolveReport {
    pub wcs: WcsResult,
    pub status: SolveStatus,
    /// Length of the star list that was searched.
    pub num_stars: usize,
    /// End of the depth window in which the solution was accepted.
    pub accepted_depth: Option<usize>,
    pub checkpoints_attempted: usize,
    /// Last window searched, `[start, end)`.
    pub last_window: Option<(usize, usize)>,
    pub quads_tried: u64,
    pub candidates_verified: u64,
    /// Highest log-odds of any verified candidate, accepted or not.
    pub best_log_odds: Option<f64>,
    /// Matched stars after tweak.
    pub num_matches: usize,
    pub solve_time_ms: f64,
}

impl SolveReport {
    pub(crate) fn new(status: SolveStatus) -> Self {
        Self {
            wcs: WcsResult::default(),
            status,
            num_stars: 0,
            accepted_depth: None,
            checkpoints_attempted: 0,
            last_window: None,
            quads_tried: 0,
            candidates_verified: 0,
            best_log_odds: None,
            num_matches: 0,
            solve_time_ms: 0.0,
        }
    }

    pub fn is_solved(&self) -> bool {
        self.status == SolveStatus::Solved
    }

    /// The failure as a [`MatchError`], or `None` when solved.
    pub fn error(&self) -> Option<MatchError> {
        match self.status {
            SolveStatus::Solved => None,
            SolveStatus::InsufficientStars => Some(MatchError::InsufficientStars {
                found: self.num_stars,
            }),
            SolveStatus::NoIndexLoaded => Some(MatchError::NoIndexLoaded),
            SolveStatus::Exhausted | SolveStatus::Cancelled | SolveStatus::Timeout => Some(MatchError::Exhausted {
                checkpoints: self.checkpoints_attempted,
            }),
        }
    }
}

// ── Entry points ────────────────────────────────────────────────────────────

/// Solve a reordered star list.
///
/// Never fails: an unsolved field gives `solved == false`.
pub fn solve_field(
    stars: &StarList,
    image_width: u32,
    image_height: u32,
    indices: &[IndexHandle],
    scale_low: f64,
    scale_high: f64,
    log_odds_threshold: f64,
) -> WcsResult {
    let config = SolveConfig::new(scale_low, scale_high, log_odds_threshold);
    solve_field_with_config(stars, image_width, image_height, indices, &config).wcs
}

/// Solve a reordered star list, returning search diagnostics.
pub fn solve_field_with_config(
    stars: &StarList,
    image_width: u32,
    image_height: u32,
    indices: &[IndexHandle],
    config: &SolveConfig,
) -> SolveReport {
    matcher::run(stars, image_width, image_height, indices, config)
}

/// Detect, reorder and solve an image.
pub fn solve_image(
    pixels: &RawPixelBuffer,
    detection: &DetectionConfig,
    indices: &[IndexHandle],
    config: &SolveConfig,
) -> Result<SolveReport, DetectionError> {
    let detected = detect_stars_with_config(pixels, detection)?;
    let ordered = reorder(&detected.stars);
    Ok(solve_field_with_config(
        &ordered,
        pixels.width(),
        pixels.height(),
        indices,
        config,
    ))
}
