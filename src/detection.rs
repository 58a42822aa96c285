//! Detect point-source stars in a luminance image.
//!
//! The detector works on a downsampled copy of the image:
//! 1. Block-average downsampling by an integer factor
//! 2. Local background model (block medians, bilinear interpolation) subtracted
//! 3. Noise sigma from the lower half of the residual distribution
//! 4. Gaussian smoothing with the PSF width `dpsf`
//! 5. Thresholding at `plim` sigma of the smoothed noise
//! 6. Connected-component labeling of the thresholded mask
//! 7. Peak finding per component, de-blended by a saddle test
//! 8. Quadratic sub-pixel refinement, mapped back to full resolution
//!
//! Positions are in full-resolution pixels with the origin at the image corner,
//! +X right and +Y down.
//!
//! # Example
//!
//! ```no_run
//! use quadsolve::detection::{detect_stars, RawPixelBuffer};
//!
//! let (w, h) = (64u32, 64u32);
//! let mut pixels = vec![100.0_f32; (w * h) as usize];
//! for row in 0..h {
//!     for col in 0..w {
//!         let r2 = (col as f32 - 31.0).powi(2) + (row as f32 - 29.0).powi(2);
//!         pixels[(row * w + col) as usize] += 5000.0 * (-r2 / 8.0).exp();
//!     }
//! }
//! let buffer = RawPixelBuffer::new(pixels, w, h).unwrap();
//! let stars = detect_stars(&buffer, 1.0, 8.0, 2).unwrap();
//! assert_eq!(stars.len(), 1);
//! ```

use tracing::debug;

use crate::detected_star::{DetectedStar, StarList};
use crate::error::DetectionError;

/// A row-major grid of luminance samples.
#[derive(Debug, Clone, PartialEq)]
pub struct RawPixelBuffer {
    pixels: Vec<f32>,
    width: u32,
    height: u32,
}

impl RawPixelBuffer {
    /// Wrap row-major samples. Rejects empty dimensions and length mismatches.
    pub fn new(pixels: Vec<f32>, width: u32, height: u32) -> Result<Self, DetectionError> {
        if width == 0 || height == 0 {
            return Err(DetectionError::invalid_input(format!(
                "image dimensions must be non-zero, got {width}x{height}"
            )));
        }
        let expected = width as usize * height as usize;
        if pixels.len() != expected {
            return Err(DetectionError::invalid_input(format!(
                "pixel count {} does not match {}x{} = {}",
                pixels.len(),
                width,
                height,
                expected
            )));
        }
        Ok(Self {
            pixels,
            width,
            height,
        })
    }

    /// Build from 8-bit luminance samples.
    pub fn from_luma8(pixels: &[u8], width: u32, height: u32) -> Result<Self, DetectionError> {
        Self::new(pixels.iter().map(|&v| v as f32).collect(), width, height)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixels(&self) -> &[f32] {
        &self.pixels
    }
}

/// Configuration for star detection.
#[derive(Debug, Clone)]
pub struct DetectionConfig {
    /// Gaussian PSF sigma, in downsampled pixels.
    /// Default: 1.0
    pub dpsf: f32,

    /// Detection significance: peaks must exceed this many sigma of the
    /// smoothed-image noise.
    /// Default: 8.0
    pub plim: f32,

    /// Integer block-averaging factor applied before detection. Must be >= 1.
    /// Default: 2
    pub downsample: u32,

    /// Minimum separation (downsampled pixels) between two kept peaks.
    /// Default: 1.0
    pub dlim: f32,

    /// Saddle depth, in smoothed-noise sigma, required to split a blob into
    /// separate peaks.
    /// Default: 5.0
    pub saddle: f32,

    /// Maximum number of peaks kept per connected component.
    /// Default: 1000
    pub max_peaks_per_blob: usize,

    /// Maximum number of peaks overall.
    /// Default: 100000
    pub max_peaks: usize,

    /// Components larger than this many (downsampled) pixels are discarded
    /// as extended objects.
    /// Default: 2000
    pub max_blob_size: usize,

    /// Half-size, in full-resolution pixels, of the local background box.
    /// Default: 100
    pub halfbox: u32,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            dpsf: 1.0,
            plim: 8.0,
            downsample: 2,
            dlim: 1.0,
            saddle: 5.0,
            max_peaks_per_blob: 1000,
            max_peaks: 100_000,
            max_blob_size: 2000,
            halfbox: 100,
        }
    }
}

/// Detected stars plus detection diagnostics.
#[derive(Debug, Clone)]
pub struct DetectionResult {
    /// Detected stars in full-resolution pixel coordinates.
    pub stars: StarList,

    /// Downsampled image width in pixels.
    pub work_width: u32,

    /// Downsampled image height in pixels.
    pub work_height: u32,

    /// Median of the (downsampled) image before background subtraction.
    pub background_median: f32,

    /// Noise sigma of the background-subtracted, downsampled image.
    pub noise_sigma: f32,

    /// Detection threshold applied to the smoothed image.
    pub limit: f32,

    /// Connected components above the threshold.
    pub num_blobs: usize,

    /// Components discarded for exceeding `max_blob_size`.
    pub num_blobs_rejected: usize,
}

/// Detect stars with the given PSF width, significance and downsampling.
///
/// Other parameters take their [`DetectionConfig`] defaults.
pub fn detect_stars(
    pixels: &RawPixelBuffer,
    dpsf: f32,
    plim: f32,
    downsample: u32,
) -> Result<StarList, DetectionError> {
    let config = DetectionConfig {
        dpsf,
        plim,
        downsample,
        ..Default::default()
    };
    detect_stars_with_config(pixels, &config).map(|r| r.stars)
}

/// Detect stars, returning diagnostics alongside the star list.
pub fn detect_stars_with_config(
    pixels: &RawPixelBuffer,
    config: &DetectionConfig,
) -> Result<DetectionResult, DetectionError> {
    validate_config(config)?;
    let ds = config.downsample;
    if pixels.width < ds || pixels.height < ds {
        return Err(DetectionError::invalid_input(format!(
            "image {}x{} is smaller than the downsample factor {}",
            pixels.width, pixels.height, ds
        )));
    }

    let (img, w, h) = downsample(&pixels.pixels, pixels.width, pixels.height, ds);

    // ── Background model and residual ──
    let block = (2 * config.halfbox / ds).max(8);
    let background = estimate_local_background(&img, w, h, block);
    let residual: Vec<f32> = img
        .iter()
        .zip(background.iter())
        .map(|(&v, &b)| v - b)
        .collect();
    let background_median = median(&img);
    let noise_sigma = estimate_noise(&residual);

    // ── Smooth and threshold ──
    let smoothed = gaussian_smooth(&residual, w, h, config.dpsf);
    let smoothed_sigma = noise_sigma / (2.0 * std::f32::consts::PI.sqrt() * config.dpsf);
    let limit = config.plim * smoothed_sigma;
    debug!(
        "detection: {}x{} (ds={}), background {:.2}, sigma {:.3}, limit {:.3}",
        w, h, ds, background_median, noise_sigma, limit
    );

    let mask: Vec<bool> = smoothed.iter().map(|&v| v > limit).collect();
    let (labels, num_blobs) = label_connected_components(&mask, w, h);

    // ── Peaks per component ──
    let mut blobs: Vec<Vec<usize>> = vec![Vec::new(); num_blobs + 1];
    for (idx, &label) in labels.iter().enumerate() {
        if label > 0 {
            blobs[label as usize].push(idx);
        }
    }

    let finder = PeakFinder {
        img: &smoothed,
        width: w as usize,
        height: h as usize,
        saddle_depth: config.saddle * smoothed_sigma,
        min_separation_sq: config.dlim * config.dlim,
    };

    let mut stars = Vec::new();
    let mut num_blobs_rejected = 0;
    for blob in blobs.iter().skip(1) {
        if blob.len() > config.max_blob_size {
            num_blobs_rejected += 1;
            continue;
        }
        let peaks = finder.deblend(blob, config.max_peaks_per_blob);
        for peak in peaks {
            if stars.len() >= config.max_peaks {
                break;
            }
            let (x, y) = finder.refine(peak);
            stars.push(DetectedStar::new(
                to_full_resolution(x, ds),
                to_full_resolution(y, ds),
                smoothed[peak],
                background[peak],
            ));
        }
        if stars.len() >= config.max_peaks {
            debug!("detection: peak limit {} reached", config.max_peaks);
            break;
        }
    }

    debug!(
        "detection: {} blobs ({} too large), {} stars",
        num_blobs,
        num_blobs_rejected,
        stars.len()
    );

    if stars.is_empty() {
        return Err(DetectionError::NoPeaksFound);
    }

    Ok(DetectionResult {
        stars: StarList::new(stars),
        work_width: w,
        work_height: h,
        background_median,
        noise_sigma,
        limit,
        num_blobs,
        num_blobs_rejected,
    })
}

fn validate_config(config: &DetectionConfig) -> Result<(), DetectionError> {
    if config.downsample == 0 {
        return Err(DetectionError::invalid_input("downsample factor must be >= 1"));
    }
    if !(config.dpsf.is_finite() && config.dpsf > 0.0) {
        return Err(DetectionError::invalid_input(format!(
            "dpsf must be positive, got {}",
            config.dpsf
        )));
    }
    if !config.plim.is_finite() {
        return Err(DetectionError::invalid_input("plim must be finite"));
    }
    Ok(())
}

/// Center of downsampled pixel `v` in full-resolution pixel coordinates.
fn to_full_resolution(v: f64, ds: u32) -> f32 {
    ((v + 0.5) * ds as f64 - 0.5) as f32
}

/// Block-average by `ds`. Partial edge blocks average the pixels they contain.
fn downsample(pixels: &[f32], width: u32, height: u32, ds: u32) -> (Vec<f32>, u32, u32) {
    if ds == 1 {
        return (pixels.to_vec(), width, height);
    }
    let (w, h, ds) = (width as usize, height as usize, ds as usize);
    let ow = w.div_ceil(ds);
    let oh = h.div_ceil(ds);
    let mut sums = vec![0.0f64; ow * oh];
    let mut counts = vec![0u32; ow * oh];
    for row in 0..h {
        let orow = row / ds;
        for col in 0..w {
            let o = orow * ow + col / ds;
            sums[o] += pixels[row * w + col] as f64;
            counts[o] += 1;
        }
    }
    let out = sums
        .iter()
        .zip(counts.iter())
        .map(|(&s, &c)| (s / c as f64) as f32)
        .collect();
    (out, ow as u32, oh as u32)
}

/// Median of the finite values; 0 when there are none.
fn median(values: &[f32]) -> f32 {
    let mut v: Vec<f32> = values.iter().copied().filter(|x| x.is_finite()).collect();
    if v.is_empty() {
        return 0.0;
    }
    v.sort_unstable_by(f32::total_cmp);
    let n = v.len();
    if n % 2 == 0 {
        (v[n / 2 - 1] + v[n / 2]) / 2.0
    } else {
        v[n / 2]
    }
}

/// Smooth background surface from block medians, bilinearly interpolated
/// between block centers.
fn estimate_local_background(pixels: &[f32], width: u32, height: u32, block_size: u32) -> Vec<f32> {
    let w = width as usize;
    let h = height as usize;
    let bs = block_size as usize;
    let nx = w.div_ceil(bs);
    let ny = h.div_ceil(bs);

    let mut medians = vec![0.0f32; nx * ny];
    let mut vals: Vec<f32> = Vec::with_capacity(bs * bs);
    for by in 0..ny {
        for bx in 0..nx {
            vals.clear();
            for y in by * bs..((by + 1) * bs).min(h) {
                vals.extend_from_slice(&pixels[y * w + bx * bs..y * w + ((bx + 1) * bs).min(w)]);
            }
            medians[by * nx + bx] = median(&vals);
        }
    }

    let half = bs as f32 / 2.0;
    let mut background = vec![0.0f32; w * h];
    for y in 0..h {
        let gy = (y as f32 - half) / bs as f32;
        let y0 = (gy.floor().max(0.0) as usize).min(ny - 1);
        let y1 = (y0 + 1).min(ny - 1);
        let fy = (gy - y0 as f32).clamp(0.0, 1.0);
        for x in 0..w {
            let gx = (x as f32 - half) / bs as f32;
            let x0 = (gx.floor().max(0.0) as usize).min(nx - 1);
            let x1 = (x0 + 1).min(nx - 1);
            let fx = (gx - x0 as f32).clamp(0.0, 1.0);

            let top = medians[y0 * nx + x0] * (1.0 - fx) + medians[y0 * nx + x1] * fx;
            let bottom = medians[y1 * nx + x0] * (1.0 - fx) + medians[y1 * nx + x1] * fx;
            background[y * w + x] = top * (1.0 - fy) + bottom * fy;
        }
    }
    background
}

/// Noise sigma from the below-median half of the distribution, sigma-clipped.
///
/// Stars only bias the upper half, so the lower half gives a clean estimate.
fn estimate_noise(residual: &[f32]) -> f32 {
    const CLIP_ITERATIONS: usize = 5;
    const CLIP_FACTOR: f64 = 3.0;

    let med = median(residual) as f64;
    let mut low: Vec<f64> = residual
        .iter()
        .filter(|v| v.is_finite())
        .map(|&v| v as f64)
        .filter(|&v| v <= med)
        .collect();

    let mut sigma = 0.0f64;
    for _ in 0..CLIP_ITERATIONS {
        if low.is_empty() {
            break;
        }
        // deviations are measured from the median so the half-distribution
        // RMS equals the full Gaussian sigma
        let var = low.iter().map(|&v| (v - med).powi(2)).sum::<f64>() / low.len() as f64;
        sigma = var.sqrt();
        if sigma < 1e-10 {
            break;
        }
        let lo = med - CLIP_FACTOR * sigma;
        let before = low.len();
        low.retain(|&v| v >= lo);
        if low.len() == before {
            break;
        }
    }
    sigma as f32
}

/// Separable, normalized Gaussian convolution with clamped edges.
fn gaussian_smooth(pixels: &[f32], width: u32, height: u32, sigma: f32) -> Vec<f32> {
    let w = width as usize;
    let h = height as usize;
    let radius = (3.0 * sigma).ceil().max(1.0) as isize;
    let kernel: Vec<f32> = (-radius..=radius)
        .map(|i| (-(i * i) as f32 / (2.0 * sigma * sigma)).exp())
        .collect();
    let norm: f32 = kernel.iter().sum();
    let kernel: Vec<f32> = kernel.iter().map(|k| k / norm).collect();

    let clamp = |v: isize, n: usize| v.clamp(0, n as isize - 1) as usize;

    let mut rows = vec![0.0f32; w * h];
    for y in 0..h {
        for x in 0..w {
            rows[y * w + x] = kernel
                .iter()
                .enumerate()
                .map(|(k, &kv)| kv * pixels[y * w + clamp(x as isize + k as isize - radius, w)])
                .sum();
        }
    }
    let mut out = vec![0.0f32; w * h];
    for y in 0..h {
        for x in 0..w {
            out[y * w + x] = kernel
                .iter()
                .enumerate()
                .map(|(k, &kv)| kv * rows[clamp(y as isize + k as isize - radius, h) * w + x])
                .sum();
        }
    }
    out
}

/// Union-find over provisional labels.
struct UnionFind {
    parent: Vec<u32>,
}

impl UnionFind {
    fn new() -> Self {
        // label 0 is background
        Self { parent: vec![0] }
    }

    fn make(&mut self) -> u32 {
        let label = self.parent.len() as u32;
        self.parent.push(label);
        label
    }

    fn find(&mut self, mut x: u32) -> u32 {
        while self.parent[x as usize] != x {
            self.parent[x as usize] = self.parent[self.parent[x as usize] as usize];
            x = self.parent[x as usize];
        }
        x
    }

    fn union(&mut self, a: u32, b: u32) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra < rb {
            self.parent[rb as usize] = ra;
        } else if rb < ra {
            self.parent[ra as usize] = rb;
        }
    }
}

/// Two-pass 8-connected labeling. Returns sequential labels (0 = background)
/// and the number of components.
fn label_connected_components(mask: &[bool], width: u32, height: u32) -> (Vec<u32>, usize) {
    let w = width as usize;
    let h = height as usize;
    let mut labels = vec![0u32; w * h];
    let mut uf = UnionFind::new();

    for row in 0..h {
        for col in 0..w {
            let idx = row * w + col;
            if !mask[idx] {
                continue;
            }
            let mut neighbors = [0u32; 4];
            if col > 0 {
                neighbors[0] = labels[idx - 1];
            }
            if row > 0 {
                neighbors[1] = labels[idx - w];
                if col > 0 {
                    neighbors[2] = labels[idx - w - 1];
                }
                if col + 1 < w {
                    neighbors[3] = labels[idx - w + 1];
                }
            }
            match neighbors.iter().copied().filter(|&l| l > 0).min() {
                None => labels[idx] = uf.make(),
                Some(min_label) => {
                    labels[idx] = min_label;
                    for &n in neighbors.iter().filter(|&&l| l > 0) {
                        uf.union(min_label, n);
                    }
                }
            }
        }
    }

    let mut remap = vec![0u32; uf.parent.len()];
    let mut count = 0u32;
    for label in labels.iter_mut().filter(|l| **l > 0) {
        let root = uf.find(*label) as usize;
        if remap[root] == 0 {
            count += 1;
            remap[root] = count;
        }
        *label = remap[root];
    }
    (labels, count as usize)
}

/// Peak finding and refinement on the smoothed image.
struct PeakFinder<'a> {
    img: &'a [f32],
    width: usize,
    height: usize,
    saddle_depth: f32,
    min_separation_sq: f32,
}

impl PeakFinder<'_> {
    /// 3x3 local maximum. Ties go to the pixel earliest in raster order.
    fn is_local_max(&self, idx: usize) -> bool {
        let (col, row) = ((idx % self.width) as isize, (idx / self.width) as isize);
        let v = self.img[idx];
        for dy in -1..=1isize {
            for dx in -1..=1isize {
                if dx == 0 && dy == 0 {
                    continue;
                }
                let (c, r) = (col + dx, row + dy);
                if c < 0 || r < 0 || c >= self.width as isize || r >= self.height as isize {
                    continue;
                }
                let n = self.img[r as usize * self.width + c as usize];
                let earlier = dy < 0 || (dy == 0 && dx < 0);
                if n > v || (earlier && n == v) {
                    return false;
                }
            }
        }
        true
    }

    /// Lowest smoothed value on the straight line between two pixels.
    fn line_minimum(&self, a: usize, b: usize) -> f32 {
        let (ax, ay) = ((a % self.width) as f32, (a / self.width) as f32);
        let (bx, by) = ((b % self.width) as f32, (b / self.width) as f32);
        let steps = (bx - ax).abs().max((by - ay).abs()).ceil().max(1.0) as usize;
        (0..=steps)
            .map(|s| {
                let t = s as f32 / steps as f32;
                let x = (ax + (bx - ax) * t).round() as usize;
                let y = (ay + (by - ay) * t).round() as usize;
                self.img[y * self.width + x]
            })
            .fold(f32::INFINITY, f32::min)
    }

    /// Peaks of one component, brightest first. A fainter peak survives only
    /// if the profile dips by at least the saddle depth on the way to every
    /// brighter kept peak.
    fn deblend(&self, blob: &[usize], max_peaks: usize) -> Vec<usize> {
        let mut candidates: Vec<usize> = blob
            .iter()
            .copied()
            .filter(|&i| self.is_local_max(i))
            .collect();
        candidates.sort_by(|&a, &b| self.img[b].total_cmp(&self.img[a]));

        let mut kept: Vec<usize> = Vec::new();
        for &c in &candidates {
            if kept.len() >= max_peaks {
                break;
            }
            let (cx, cy) = ((c % self.width) as f32, (c / self.width) as f32);
            let distinct = kept.iter().all(|&k| {
                let (kx, ky) = ((k % self.width) as f32, (k / self.width) as f32);
                let d2 = (cx - kx).powi(2) + (cy - ky).powi(2);
                d2 >= self.min_separation_sq
                    && self.img[c] - self.line_minimum(c, k) >= self.saddle_depth
            });
            if distinct {
                kept.push(c);
            }
        }
        kept
    }

    /// Sub-pixel position by a quadratic fit to the 3x3 neighborhood.
    /// Falls back to the pixel center at the border or when the fit moves
    /// more than half a pixel.
    fn refine(&self, peak: usize) -> (f64, f64) {
        let (pc, pr) = (peak % self.width, peak / self.width);
        let center = (pc as f64, pr as f64);
        if pc == 0 || pr == 0 || pc + 1 >= self.width || pr + 1 >= self.height {
            return center;
        }
        let v = |dy: isize, dx: isize| -> f64 {
            let r = (pr as isize + dy) as usize;
            let c = (pc as isize + dx) as usize;
            self.img[r * self.width + c] as f64
        };

        let b = (v(0, 1) - v(0, -1)) / 2.0;
        let c = (v(1, 0) - v(-1, 0)) / 2.0;
        let d = (v(0, 1) + v(0, -1) - 2.0 * v(0, 0)) / 2.0;
        let f = (v(1, 0) + v(-1, 0) - 2.0 * v(0, 0)) / 2.0;
        let e = (v(1, 1) - v(1, -1) - v(-1, 1) + v(-1, -1)) / 4.0;

        let denom = 4.0 * d * f - e * e;
        if denom.abs() <= 1e-10 {
            return center;
        }
        let x_off = (e * c - 2.0 * f * b) / denom;
        let y_off = (e * b - 2.0 * d * c) / denom;
        if x_off.abs() <= 0.5 && y_off.abs() <= 0.5 {
            (center.0 + x_off, center.1 + y_off)
        } else {
            center
        }
    }
}

/// Luminance buffer from a decoded image, `0.299 R + 0.587 G + 0.114 B`.
#[cfg(feature = "image")]
pub fn luminance_from_image(img: &image::DynamicImage) -> Result<RawPixelBuffer, DetectionError> {
    use image::DynamicImage;

    let (width, height) = (img.width(), img.height());
    let luma = |r: f32, g: f32, b: f32| 0.299 * r + 0.587 * g + 0.114 * b;
    let pixels: Vec<f32> = match img {
        DynamicImage::ImageLuma8(g) => g.as_raw().iter().map(|&v| v as f32).collect(),
        DynamicImage::ImageLuma16(g) => g.as_raw().iter().map(|&v| v as f32).collect(),
        DynamicImage::ImageRgb16(rgb) => rgb
            .pixels()
            .map(|p| luma(p.0[0] as f32, p.0[1] as f32, p.0[2] as f32))
            .collect(),
        DynamicImage::ImageRgb32F(rgb) => rgb.pixels().map(|p| luma(p.0[0], p.0[1], p.0[2])).collect(),
        _ => img
            .to_rgb8()
            .pixels()
            .map(|p| luma(p.0[0] as f32, p.0[1] as f32, p.0[2] as f32))
            .collect(),
    };
    RawPixelBuffer::new(pixels, width, height)
}

/// Load an image file and detect stars in it.
#[cfg(feature = "image")]
pub fn detect_stars_in_file(
    path: impl AsRef<std::path::Path>,
    config: &DetectionConfig,
) -> anyhow::Result<DetectionResult> {
    use anyhow::Context;

    let img = image::open(path.as_ref())
        .with_context(|| format!("Failed to open image: {}", path.as_ref().display()))?;
    let buffer = luminance_from_image(&img)?;
    Ok(detect_stars_with_config(&buffer, config)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render(width: u32, height: u32, bg: f32, stars: &[(f32, f32, f32)], sigma: f32) -> Vec<f32> {
        let mut pixels = vec![bg; (width * height) as usize];
        for &(sx, sy, peak) in stars {
            for row in 0..height {
                for col in 0..width {
                    let r2 = (col as f32 - sx).powi(2) + (row as f32 - sy).powi(2);
                    pixels[(row * width + col) as usize] += peak * (-r2 / (2.0 * sigma * sigma)).exp();
                }
            }
        }
        pixels
    }

    /// Deterministic pseudo-noise with zero mean.
    fn add_noise(pixels: &mut [f32], amplitude: f32) {
        let mut state = 0x2545_f491_u32;
        for p in pixels.iter_mut() {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            *p += amplitude * ((state % 2001) as f32 / 1000.0 - 1.0);
        }
    }

    #[test]
    fn test_invalid_dimensions() {
        let err = RawPixelBuffer::new(vec![0.0; 10], 4, 4).unwrap_err();
        assert!(matches!(err, DetectionError::InvalidInput { .. }));
        let err = RawPixelBuffer::new(vec![], 0, 4).unwrap_err();
        assert!(matches!(err, DetectionError::InvalidInput { .. }));
        assert!(RawPixelBuffer::from_luma8(&[0u8; 16], 4, 4).is_ok());
    }

    #[test]
    fn test_invalid_downsample() {
        let buf = RawPixelBuffer::new(vec![1.0; 64], 8, 8).unwrap();
        let err = detect_stars(&buf, 1.0, 8.0, 0).unwrap_err();
        assert!(matches!(err, DetectionError::InvalidInput { .. }));
        let err = detect_stars(&buf, 1.0, 8.0, 16).unwrap_err();
        assert!(matches!(err, DetectionError::InvalidInput { .. }));
    }

    #[test]
    fn test_flat_image_has_no_peaks() {
        let mut pixels = vec![100.0; 64 * 64];
        add_noise(&mut pixels, 3.0);
        let buf = RawPixelBuffer::new(pixels, 64, 64).unwrap();
        assert_eq!(
            detect_stars(&buf, 1.0, 8.0, 2).unwrap_err(),
            DetectionError::NoPeaksFound
        );
    }

    #[test]
    fn test_downsample_block_average() {
        let pixels: Vec<f32> = (0..20).map(|v| v as f32).collect();
        let (out, w, h) = downsample(&pixels, 5, 4, 2);
        assert_eq!((w, h), (3, 2));
        assert_eq!(out[0], (0.0 + 1.0 + 5.0 + 6.0) / 4.0);
        // partial edge block averages the two pixels it holds
        assert_eq!(out[2], (4.0 + 9.0) / 2.0);
    }

    #[test]
    fn test_noise_estimate() {
        let mut pixels = vec![0.0f32; 200 * 200];
        add_noise(&mut pixels, 10.0);
        // uniform on [-10, 10] has sigma 10/sqrt(3)
        let sigma = estimate_noise(&pixels);
        assert!((sigma - 5.77).abs() < 0.5, "sigma = {sigma}");
    }

    #[test]
    fn test_connected_components() {
        let mask = vec![
            false, true, true, false, false, //
            false, true, false, false, false, //
            false, false, false, false, false, //
            false, false, false, true, true, //
            false, false, true, false, false, //
        ];
        let (labels, n) = label_connected_components(&mask, 5, 5);
        assert_eq!(n, 2);
        assert_eq!(labels[1], labels[2]);
        assert_eq!(labels[1], labels[6]);
        // diagonal neighbor joins under 8-connectivity
        assert_eq!(labels[18], labels[22]);
        assert_ne!(labels[1], labels[18]);
    }

    #[test]
    fn test_single_star_subpixel() {
        let (w, h) = (96u32, 96u32);
        let (tx, ty) = (47.3f32, 50.6f32);
        let mut pixels = render(w, h, 100.0, &[(tx, ty, 3000.0)], 2.0);
        add_noise(&mut pixels, 2.0);
        let buf = RawPixelBuffer::new(pixels, w, h).unwrap();

        let result = detect_stars_with_config(&buf, &DetectionConfig::default()).unwrap();
        assert_eq!(result.stars.len(), 1);
        let s = result.stars[0];
        assert!((s.x - tx).abs() < 0.5, "x = {}", s.x);
        assert!((s.y - ty).abs() < 0.5, "y = {}", s.y);
        assert!(s.flux > 0.0);
        assert!((s.background - 100.0).abs() < 5.0, "bg = {}", s.background);
    }

    #[test]
    fn test_full_resolution_without_downsampling() {
        let (w, h) = (64u32, 64u32);
        let mut pixels = render(w, h, 50.0, &[(20.0, 40.0, 1000.0)], 2.0);
        add_noise(&mut pixels, 2.0);
        let buf = RawPixelBuffer::new(pixels, w, h).unwrap();
        let stars = detect_stars(&buf, 2.0, 8.0, 1).unwrap();
        assert_eq!(stars.len(), 1);
        assert!((stars[0].x - 20.0).abs() < 0.2);
        assert!((stars[0].y - 40.0).abs() < 0.2);
    }

    #[test]
    fn test_saddle_splits_close_pair() {
        let (w, h) = (128u32, 128u32);
        // two stars 12 px apart share one component but dip deeply between
        let mut pixels = render(w, h, 100.0, &[(58.0, 64.0, 4000.0), (70.0, 64.0, 2500.0)], 2.0);
        add_noise(&mut pixels, 2.0);
        let buf = RawPixelBuffer::new(pixels, w, h).unwrap();
        let stars = detect_stars(&buf, 1.0, 8.0, 2).unwrap();
        assert_eq!(stars.len(), 2);
        let order = stars.flux_order();
        assert!((stars[order[0]].x - 58.0).abs() < 1.0);
        assert!((stars[order[1]].x - 70.0).abs() < 1.0);
    }

    #[test]
    fn test_multiple_stars_with_gradient() {
        let (w, h) = (160u32, 120u32);
        let truth = [(30.0, 30.0, 2000.0), (120.0, 40.0, 3000.0), (80.0, 95.0, 1500.0)];
        let mut pixels = render(w, h, 0.0, &truth, 2.0);
        for row in 0..h {
            for col in 0..w {
                pixels[(row * w + col) as usize] += 80.0 + 40.0 * col as f32 / w as f32;
            }
        }
        add_noise(&mut pixels, 2.0);
        let buf = RawPixelBuffer::new(pixels, w, h).unwrap();
        // background boxes small enough to follow the gradient
        let config = DetectionConfig {
            halfbox: 20,
            ..Default::default()
        };
        let stars = detect_stars_with_config(&buf, &config).unwrap().stars;
        assert_eq!(stars.len(), 3);
        for &(tx, ty, _) in &truth {
            assert!(
                stars
                    .iter()
                    .any(|s| (s.x - tx).abs() < 1.0 && (s.y - ty).abs() < 1.0),
                "missing star at ({tx}, {ty})"
            );
        }
    }

    #[test]
    fn test_max_peaks_limit() {
        let (w, h) = (128u32, 128u32);
        let truth = [(30.0, 30.0, 2000.0), (90.0, 50.0, 3000.0), (60.0, 100.0, 1500.0)];
        let mut pixels = render(w, h, 10.0, &truth, 2.0);
        add_noise(&mut pixels, 2.0);
        let buf = RawPixelBuffer::new(pixels, w, h).unwrap();
        let config = DetectionConfig {
            max_peaks: 2,
            ..Default::default()
        };
        let result = detect_stars_with_config(&buf, &config).unwrap();
        assert_eq!(result.stars.len(), 2);
    }
}
