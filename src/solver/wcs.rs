//! Gnomonic (TAN) projection and linear WCS fitting.
//!
//! A [`TanWcs`] maps pixel offsets from a fixed reference pixel (CRPIX) to
//! tangent-plane coordinates at a reference sky point (CRVAL) through a 2×2 CD
//! matrix. All angles in this module are radians; pixel coordinates are
//! 0-based.
//!
//! Fitting solves two 3-parameter least-squares problems
//! (`ξ = CD11·u + CD12·v + ξ₀`, likewise for η), moves CRVAL by the fitted
//! offset `(ξ₀, η₀)` and repeats until the offset vanishes.

use tracing::trace;

use crate::star::{radec_to_uvec, uvec_to_radec};

const MAX_INNER_ITERATIONS: usize = 10;
const CONVERGENCE_RAD: f64 = 1e-12;

/// Forward gnomonic projection of `(ra, dec)` onto the plane tangent at
/// `(crval_ra, crval_dec)`.
///
/// Returns `(ξ, η)`, or `None` when the point is on or behind the plane.
#[inline]
pub fn tan_project(ra: f64, dec: f64, crval_ra: f64, crval_dec: f64) -> Option<(f64, f64)> {
    let (sin_da, cos_da) = (ra - crval_ra).sin_cos();
    let (sin_dec, cos_dec) = dec.sin_cos();
    let (sin_dec0, cos_dec0) = crval_dec.sin_cos();

    let denom = sin_dec * sin_dec0 + cos_dec * cos_dec0 * cos_da;
    if denom <= 1e-12 {
        return None;
    }
    Some((
        cos_dec * sin_da / denom,
        (sin_dec * cos_dec0 - cos_dec * sin_dec0 * cos_da) / denom,
    ))
}

/// Inverse gnomonic projection. RA is not wrapped.
#[inline]
pub fn inverse_tan_project(xi: f64, eta: f64, crval_ra: f64, crval_dec: f64) -> (f64, f64) {
    let rho_sq = xi * xi + eta * eta;
    if rho_sq < 1e-30 {
        return (crval_ra, crval_dec);
    }
    let (sin_dec0, cos_dec0) = crval_dec.sin_cos();
    let rho = rho_sq.sqrt();
    let (sin_c, cos_c) = rho.atan().sin_cos();

    let dec = (cos_c * sin_dec0 + eta * sin_c * cos_dec0 / rho).clamp(-1.0, 1.0).asin();
    let ra = crval_ra + (xi * sin_c).atan2(rho * cos_dec0 * cos_c - eta * sin_dec0 * sin_c);
    (ra, dec)
}

/// Inverse of a 2×2 matrix, `None` when singular.
#[inline]
pub fn cd_inverse(cd: &[[f64; 2]; 2]) -> Option<[[f64; 2]; 2]> {
    let det = cd[0][0] * cd[1][1] - cd[0][1] * cd[1][0];
    if !det.is_finite() || det.abs() < 1e-30 {
        return None;
    }
    let inv = 1.0 / det;
    Some([
        [cd[1][1] * inv, -cd[0][1] * inv],
        [-cd[1][0] * inv, cd[0][0] * inv],
    ])
}

/// Gaussian elimination with partial pivoting on a 3×3 system.
pub(crate) fn solve_3x3(a: &[[f64; 3]; 3], b: &[f64; 3]) -> Option<[f64; 3]> {
    let mut m = *a;
    let mut rhs = *b;

    for col in 0..3 {
        let pivot_row = (col..3)
            .max_by(|&i, &j| m[i][col].abs().total_cmp(&m[j][col].abs()))
            .unwrap_or(col);
        if m[pivot_row][col].abs() < 1e-30 {
            return None;
        }
        m.swap(col, pivot_row);
        rhs.swap(col, pivot_row);

        for row in (col + 1)..3 {
            let factor = m[row][col] / m[col][col];
            for j in col..3 {
                m[row][j] -= factor * m[col][j];
            }
            rhs[row] -= factor * rhs[col];
        }
    }

    let mut x = [0.0; 3];
    for i in (0..3).rev() {
        let tail: f64 = ((i + 1)..3).map(|j| m[i][j] * x[j]).sum();
        x[i] = (rhs[i] - tail) / m[i][i];
    }
    x.iter().all(|v| v.is_finite()).then_some(x)
}

/// A linear TAN world coordinate system.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TanWcs {
    /// Reference sky point `[ra, dec]`, radians.
    pub crval: [f64; 2],
    /// Reference pixel, 0-based.
    pub crpix: [f64; 2],
    /// Tangent-plane radians per pixel: `[[CD11, CD12], [CD21, CD22]]`.
    pub cd: [[f64; 2]; 2],
}

impl TanWcs {
    /// Tangent-plane coordinates of a pixel.
    pub fn pixel_to_plane(&self, x: f64, y: f64) -> (f64, f64) {
        let (u, v) = (x - self.crpix[0], y - self.crpix[1]);
        (
            self.cd[0][0] * u + self.cd[0][1] * v,
            self.cd[1][0] * u + self.cd[1][1] * v,
        )
    }

    /// Sky position of a pixel, radians, RA in `[0, 2π)`.
    pub fn pixel_to_radec(&self, x: f64, y: f64) -> (f64, f64) {
        let (xi, eta) = self.pixel_to_plane(x, y);
        let (ra, dec) = inverse_tan_project(xi, eta, self.crval[0], self.crval[1]);
        (ra.rem_euclid(std::f64::consts::TAU), dec)
    }

    /// Pixel position of a sky point, `None` when it cannot be projected.
    pub fn radec_to_pixel(&self, ra: f64, dec: f64) -> Option<(f64, f64)> {
        let (xi, eta) = tan_project(ra, dec, self.crval[0], self.crval[1])?;
        let inv = cd_inverse(&self.cd)?;
        Some((
            inv[0][0] * xi + inv[0][1] * eta + self.crpix[0],
            inv[1][0] * xi + inv[1][1] * eta + self.crpix[1],
        ))
    }

    pub fn determinant(&self) -> f64 {
        self.cd[0][0] * self.cd[1][1] - self.cd[0][1] * self.cd[1][0]
    }

    /// Geometric-mean pixel scale in arcseconds per pixel.
    pub fn pixel_scale_arcsec(&self) -> f64 {
        self.determinant().abs().sqrt().to_degrees() * 3600.0
    }

    /// Angle in degrees from the ξ axis to the image +x axis, counter-clockwise.
    pub fn rotation_deg(&self) -> f64 {
        self.cd[1][0].atan2(self.cd[0][0]).to_degrees()
    }
}

/// Fit a TAN WCS to pixel/sky correspondences.
///
/// `sky` holds `(ra, dec)` in radians, `pixels` the matching 0-based pixel
/// positions. The reference pixel stays fixed at `crpix`; CRVAL starts at
/// the centroid of the sky points. Needs at least three pairs.
pub fn fit_tan_wcs(sky: &[(f64, f64)], pixels: &[(f64, f64)], crpix: [f64; 2]) -> Option<TanWcs> {
    let n = sky.len().min(pixels.len());
    if n < 3 {
        return None;
    }
    let sum = sky[..n]
        .iter()
        .map(|&(ra, dec)| radec_to_uvec(ra.to_degrees(), dec.to_degrees()))
        .fold(nalgebra::Vector3::zeros(), |acc, v| acc + v);
    if sum.norm() < 1e-12 {
        return None;
    }
    let (ra0, dec0) = uvec_to_radec(&sum);
    refit_tan_wcs([ra0.to_radians(), dec0.to_radians()], sky, pixels, crpix)
}

/// Same as [`fit_tan_wcs`], starting from a known CRVAL.
pub fn refit_tan_wcs(
    crval: [f64; 2],
    sky: &[(f64, f64)],
    pixels: &[(f64, f64)],
    crpix: [f64; 2],
) -> Option<TanWcs> {
    let mut wcs = TanWcs {
        crval,
        crpix,
        cd: [[0.0; 2]; 2],
    };
    let mut fitted = false;

    for iter in 0..MAX_INNER_ITERATIONS {
        let mut ata = [[0.0f64; 3]; 3];
        let mut atb_xi = [0.0f64; 3];
        let mut atb_eta = [0.0f64; 3];
        let mut used = 0usize;

        for (&(ra, dec), &(x, y)) in sky.iter().zip(pixels.iter()) {
            let Some((xi, eta)) = tan_project(ra, dec, wcs.crval[0], wcs.crval[1]) else {
                continue;
            };
            let row = [x - crpix[0], y - crpix[1], 1.0];
            for i in 0..3 {
                for j in 0..3 {
                    ata[i][j] += row[i] * row[j];
                }
                atb_xi[i] += row[i] * xi;
                atb_eta[i] += row[i] * eta;
            }
            used += 1;
        }
        if used < 3 {
            return None;
        }

        let sol_xi = solve_3x3(&ata, &atb_xi)?;
        let sol_eta = solve_3x3(&ata, &atb_eta)?;
        wcs.cd = [[sol_xi[0], sol_xi[1]], [sol_eta[0], sol_eta[1]]];
        let (ra, dec) = inverse_tan_project(sol_xi[2], sol_eta[2], wcs.crval[0], wcs.crval[1]);
        wcs.crval = [ra.rem_euclid(std::f64::consts::TAU), dec];
        fitted = true;

        trace!(
            "tan fit iter {iter}: offset ({:.3e}, {:.3e}) rad",
            sol_xi[2],
            sol_eta[2]
        );
        if sol_xi[2].abs() + sol_eta[2].abs() < CONVERGENCE_RAD {
            break;
        }
    }

    (fitted && cd_inverse(&wcs.cd).is_some()).then_some(wcs)
}
