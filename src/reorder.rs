//! Detection reordering: bright, spatially spread stars first.
//!
//! Two steps turn an unordered [`StarList`] into the matcher's search order:
//!
//! 1. **Interleave** the flux order and the raw-signal (flux + background)
//!    order by rank, so a star ranked highly under either metric comes early.
//! 2. **Uniformize**: bin the stars into a near-square grid of about
//!    [`UNIFORMIZE_N`] cells over their bounding box and emit them round-robin,
//!    one star per non-empty cell per round, so that any short prefix of the
//!    result is spread across the image.
//!
//! Both steps are deterministic and produce a permutation of the input.

use tracing::debug;

use crate::detected_star::StarList;

/// Target number of uniformization bins.
pub const UNIFORMIZE_N: usize = 10;

/// Reorder a star list for matching (interleave, then uniformize).
pub fn reorder(stars: &StarList) -> StarList {
    stars.permuted(&reorder_permutation(stars))
}

/// Same as [`reorder`], returning the permutation instead of the stars.
///
/// Element `i` of the result is the input index of the star placed at `i`.
pub fn reorder_permutation(stars: &StarList) -> Vec<usize> {
    let resorted = interleave(stars);
    uniformize(stars, &resorted)
}

/// Step A: merge flux order and raw-signal order by rank.
///
/// At rank `i`, the flux-order star is emitted if not already emitted, then
/// the raw-signal-order star. Returns input indices.
pub fn interleave(stars: &StarList) -> Vec<usize> {
    let by_flux = stars.flux_order();
    let by_raw = stars.raw_signal_order();

    let mut emitted = vec![false; stars.len()];
    let mut out = Vec::with_capacity(stars.len());
    for (&f, &r) in by_flux.iter().zip(by_raw.iter()) {
        for idx in [f, r] {
            if !emitted[idx] {
                emitted[idx] = true;
                out.push(idx);
            }
        }
    }
    out
}

/// Grid dimensions `(cols, rows)` for a bounding box of the given size.
///
/// Bins come out roughly square whatever the aspect ratio.
pub fn grid_shape(width: f64, height: f64) -> (usize, usize) {
    let n = UNIFORMIZE_N as f64;
    let cols = (width / (width * height / n).sqrt()).round().max(1.0);
    let rows = (n / cols).round().max(1.0);
    (cols as usize, rows as usize)
}

/// Step B: spatially uniformize an ordering `resorted` (input indices).
///
/// Returns input indices. Skipped (returns `resorted` unchanged) when there
/// are 4 stars or fewer, or when the bounding box is degenerate in either axis.
pub fn uniformize(stars: &StarList, resorted: &[usize]) -> Vec<usize> {
    let n = resorted.len();
    if n <= 4 {
        return resorted.to_vec();
    }

    let (mut xmin, mut xmax) = (f64::INFINITY, f64::NEG_INFINITY);
    let (mut ymin, mut ymax) = (f64::INFINITY, f64::NEG_INFINITY);
    for &i in resorted {
        let (x, y) = (stars[i].x as f64, stars[i].y as f64);
        xmin = xmin.min(x);
        xmax = xmax.max(x);
        ymin = ymin.min(y);
        ymax = ymax.max(y);
    }
    let width = xmax - xmin;
    let height = ymax - ymin;
    if !(width > 0.0 && height > 0.0) {
        debug!("uniformize skipped: degenerate bounding box {width} x {height}");
        return resorted.to_vec();
    }

    let (cols, rows) = grid_shape(width, height);

    // bin id -> positions in `resorted`, ascending
    let mut bins: Vec<Vec<usize>> = vec![Vec::new(); cols * rows];
    for (pos, &i) in resorted.iter().enumerate() {
        let fx = (stars[i].x as f64 - xmin) / width * cols as f64;
        let fy = (stars[i].y as f64 - ymin) / height * rows as f64;
        let bx = (fx.floor() as usize).min(cols - 1);
        let by = (fy.floor() as usize).min(rows - 1);
        bins[by * cols + bx].push(pos);
    }

    let deepest = bins.iter().map(Vec::len).max().unwrap_or(0);
    let mut out = Vec::with_capacity(n);
    let mut round: Vec<usize> = Vec::with_capacity(bins.len());
    for k in 0..deepest {
        round.clear();
        round.extend(bins.iter().filter_map(|b| b.get(k).copied()));
        round.sort_unstable();
        out.extend(round.iter().map(|&pos| resorted[pos]));
    }

    debug!(
        "uniformize: {} stars into {}x{} bins, {} rounds",
        n, cols, rows, deepest
    );
    out
}
