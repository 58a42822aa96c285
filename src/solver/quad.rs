//! Quad geometry: scale, rotation and translation invariant codes.
//!
//! Stars A and B form the backbone; the frame that sends A to (0, 0) and B to
//! (1, 1) is applied to C and D, and their coordinates in that frame are the
//! code `[cx, cy, dx, dy]`. A valid quad has C and D inside the circle with AB
//! as diameter, so AB is its widest pair.
//!
//! Canonical form: the mean of `cx, dx` is at most 0.5 (otherwise A and B swap,
//! which maps every code value `v` to `1 - v`) and `cx <= dx`.
//!
//! Catalog quads are coded from tangent-plane coordinates at the AB midpoint.
//! Field quads are coded from pixel positions in both parities, since the
//! image may be mirrored relative to the sky.

use super::wcs::tan_project;
use crate::star::{radec_to_uvec, uvec_to_radec};

/// Stars per quad.
pub const QUAD_SIZE: usize = 4;

/// Code dimensions: two coordinates for each non-backbone star.
pub const CODE_SIZE: usize = 2 * (QUAD_SIZE - 2);

pub type Code = [f64; CODE_SIZE];

/// Raw code of four plane points, A and B first.
///
/// Returns `None` when A and B coincide.
pub fn plane_code(points: &[(f64, f64); QUAD_SIZE]) -> Option<Code> {
    let (ax, ay) = points[0];
    let (bx, by) = points[1];
    let (abx, aby) = (bx - ax, by - ay);
    let scale = abx * abx + aby * aby;
    if scale < 1e-30 {
        return None;
    }
    let costheta = (aby + abx) / scale;
    let sintheta = (aby - abx) / scale;

    let mut code = [0.0; CODE_SIZE];
    for (i, &(px, py)) in points[2..].iter().enumerate() {
        let (dx, dy) = (px - ax, py - ay);
        code[2 * i] = dx * costheta + dy * sintheta;
        code[2 * i + 1] = -dx * sintheta + dy * costheta;
    }
    Some(code)
}

/// Put a code and its star labels into canonical form.
///
/// `order` holds the labels of A, B, C, D and is permuted alongside the code.
pub fn canonicalize(code: Code, order: [usize; QUAD_SIZE]) -> (Code, [usize; QUAD_SIZE]) {
    let mut code = code;
    let mut order = order;

    let mean_x = (code[0] + code[2]) / 2.0;
    if mean_x > 0.5 {
        order.swap(0, 1);
        for v in code.iter_mut() {
            *v = 1.0 - *v;
        }
    }
    if code[2] < code[0] {
        order.swap(2, 3);
        code.swap(0, 2);
        code.swap(1, 3);
    }
    (code, order)
}

/// True when both non-backbone stars lie inside the AB circle.
pub fn inside_backbone_circle(code: &Code) -> bool {
    code.chunks_exact(2)
        .all(|c| (c[0] - 0.5).powi(2) + (c[1] - 0.5).powi(2) <= 0.5 + 1e-12)
}

/// Squared L2 distance between two codes.
pub fn code_distance_sq(a: &Code, b: &Code) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y).powi(2)).sum()
}

/// Canonical field codes for four pixel positions (A, B first), one per parity.
///
/// Element 0 codes `(x, y)`, element 1 codes the mirrored `(y, x)`. The label
/// arrays index into `positions`.
pub fn field_codes(positions: &[(f64, f64); QUAD_SIZE]) -> Option<[(Code, [usize; QUAD_SIZE]); 2]> {
    let mirrored: [(f64, f64); QUAD_SIZE] = std::array::from_fn(|i| (positions[i].1, positions[i].0));
    let normal = plane_code(positions)?;
    let flipped = plane_code(&mirrored)?;
    Some([
        canonicalize(normal, [0, 1, 2, 3]),
        canonicalize(flipped, [0, 1, 2, 3]),
    ])
}

/// Canonical sky code for four stars given as RA/Dec degrees, A and B first.
///
/// Returns `None` if a star cannot be projected onto the tangent plane at the
/// AB midpoint.
pub fn sky_code(radec_deg: &[(f64, f64); QUAD_SIZE]) -> Option<(Code, [usize; QUAD_SIZE])> {
    let mid = radec_to_uvec(radec_deg[0].0, radec_deg[0].1) + radec_to_uvec(radec_deg[1].0, radec_deg[1].1);
    if mid.norm() < 1e-12 {
        return None;
    }
    let (mra, mdec) = uvec_to_radec(&mid);
    let (mra, mdec) = (mra.to_radians(), mdec.to_radians());

    let mut plane = [(0.0, 0.0); QUAD_SIZE];
    for (p, &(ra, dec)) in plane.iter_mut().zip(radec_deg.iter()) {
        *p = tan_project(ra.to_radians(), dec.to_radians(), mra, mdec)?;
    }
    Some(canonicalize(plane_code(&plane)?, [0, 1, 2, 3]))
}
