//! SIP polynomial distortion terms.
//!
//! Pixel offsets `(u, v)` from the reference pixel are corrected before the
//! CD matrix is applied:
//!
//! ```text
//! U = u + Σ A_pq · u^p · v^q      (2 ≤ p+q ≤ order)
//! V = v + Σ B_pq · u^p · v^q
//! ```
//!
//! The reverse direction has its own fitted polynomial (AP, BP), so neither
//! direction needs iteration. Coefficients are stored for coordinates divided
//! by `scale` (half the larger image dimension), which keeps the least-squares
//! problem well conditioned.

use nalgebra::{DMatrix, DVector};
use tracing::debug;

/// Number of coefficients for terms with `2 <= p + q <= order`.
pub fn num_coeffs(order: u32) -> usize {
    (2..=order).map(|s| (s + 1) as usize).sum()
}

/// Flat index of term `(p, q)`: increasing total degree, then decreasing `p`.
#[cfg(test)]
fn coeff_index(p: u32, q: u32) -> usize {
    let s = p + q;
    debug_assert!(s >= 2, "SIP terms start at degree 2");
    num_coeffs(s - 1) + (s - p) as usize
}

/// All `(p, q)` exponent pairs, in coefficient order.
pub fn term_pairs(order: u32) -> Vec<(u32, u32)> {
    (2..=order)
        .flat_map(|s| (0..=s).rev().map(move |p| (p, s - p)))
        .collect()
}

fn eval(coeffs: &[f64], terms: &[(u32, u32)], x: f64, y: f64) -> f64 {
    coeffs
        .iter()
        .zip(terms)
        .map(|(c, &(p, q))| c * x.powi(p as i32) * y.powi(q as i32))
        .sum()
}

/// One correspondence for the SIP fit: observed offset `(u, v)` and the
/// ideal linear offset `(big_u, big_v)`, both relative to the reference pixel.
#[derive(Debug, Clone, Copy)]
pub struct SipSample {
    pub u: f64,
    pub v: f64,
    pub big_u: f64,
    pub big_v: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SipPolynomial {
    pub order: u32,
    pub scale: f64,
    pub a: Vec<f64>,
    pub b: Vec<f64>,
    pub ap: Vec<f64>,
    pub bp: Vec<f64>,
}

impl SipPolynomial {
    /// Observed offset to ideal offset.
    pub fn forward(&self, u: f64, v: f64) -> (f64, f64) {
        let terms = term_pairs(self.order);
        let (x, y) = (u / self.scale, v / self.scale);
        (
            u + eval(&self.a, &terms, x, y) * self.scale,
            v + eval(&self.b, &terms, x, y) * self.scale,
        )
    }

    /// Ideal offset to observed offset.
    pub fn inverse(&self, big_u: f64, big_v: f64) -> (f64, f64) {
        let terms = term_pairs(self.order);
        let (x, y) = (big_u / self.scale, big_v / self.scale);
        (
            big_u + eval(&self.ap, &terms, x, y) * self.scale,
            big_v + eval(&self.bp, &terms, x, y) * self.scale,
        )
    }

    /// Least-squares fit of both directions.
    ///
    /// Returns `None` for `order < 2`, a non-positive scale, or fewer samples
    /// than twice the number of coefficients.
    pub fn fit(order: u32, scale: f64, samples: &[SipSample]) -> Option<Self> {
        let ncoef = num_coeffs(order);
        if order < 2 || !(scale > 0.0) || samples.len() < 2 * ncoef {
            return None;
        }
        let terms = term_pairs(order);

        let observed: Vec<(f64, f64)> = samples.iter().map(|s| (s.u, s.v)).collect();
        let ideal: Vec<(f64, f64)> = samples.iter().map(|s| (s.big_u, s.big_v)).collect();

        let (a, b) = fit_direction(&terms, scale, &observed, &ideal)?;
        let (ap, bp) = fit_direction(&terms, scale, &ideal, &observed)?;

        debug!(
            "SIP order {order} fitted from {} samples (scale {scale:.1} px)",
            samples.len()
        );
        Some(Self {
            order,
            scale,
            a,
            b,
            ap,
            bp,
        })
    }
}

/// Fit corrections taking `from` to `to`: `to - from = poly(from)`.
fn fit_direction(
    terms: &[(u32, u32)],
    scale: f64,
    from: &[(f64, f64)],
    to: &[(f64, f64)],
) -> Option<(Vec<f64>, Vec<f64>)> {
    let nrows = from.len();
    let mut design = DMatrix::<f64>::zeros(nrows, terms.len());
    let mut rhs_x = DVector::<f64>::zeros(nrows);
    let mut rhs_y = DVector::<f64>::zeros(nrows);

    for (row, (&(fx, fy), &(tx, ty))) in from.iter().zip(to).enumerate() {
        let (x, y) = (fx / scale, fy / scale);
        for (col, &(p, q)) in terms.iter().enumerate() {
            design[(row, col)] = x.powi(p as i32) * y.powi(q as i32);
        }
        rhs_x[row] = (tx - fx) / scale;
        rhs_y[row] = (ty - fy) / scale;
    }

    let svd = design.svd(true, true);
    let cx = svd.solve(&rhs_x, 1e-12).ok()?;
    let cy = svd.solve(&rhs_y, 1e-12).ok()?;
    if cx.iter().chain(cy.iter()).any(|c| !c.is_finite()) {
        return None;
    }
    Some((cx.iter().copied().collect(), cy.iter().copied().collect()))
}
