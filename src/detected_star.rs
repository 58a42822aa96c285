//! Detected point sources and the ordered star list handed between stages.
//!
//! A [`DetectedStar`] is the output of the detector and the input of the
//! reorderer and matcher. Index order in a [`StarList`] is meaningful: the
//! matcher tries stars in that order.

use std::ops::Deref;

/// A point source found in the image.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectedStar {
    /// Sub-pixel column position, origin at the image corner, +X right.
    pub x: f32,
    /// Sub-pixel row position, origin at the image corner, +Y down.
    pub y: f32,
    /// Background-subtracted flux.
    pub flux: f32,
    /// Local background level under the star.
    pub background: f32,
}

impl DetectedStar {
    pub fn new(x: f32, y: f32, flux: f32, background: f32) -> Self {
        Self {
            x,
            y,
            flux,
            background,
        }
    }

    /// Flux plus background: the brightness before background subtraction.
    pub fn raw_signal(&self) -> f32 {
        self.flux + self.background
    }
}

/// An ordered sequence of [`DetectedStar`].
///
/// Indices are stable: reordering always produces a new list instead of
/// shuffling in place.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StarList {
    stars: Vec<DetectedStar>,
}

impl StarList {
    pub fn new(stars: Vec<DetectedStar>) -> Self {
        Self { stars }
    }

    pub fn into_vec(self) -> Vec<DetectedStar> {
        self.stars
    }

    /// Indices sorted by descending background-subtracted flux.
    ///
    /// Ties keep their original relative order.
    pub fn flux_order(&self) -> Vec<usize> {
        self.descending_order(|s| s.flux)
    }

    /// Indices sorted by descending flux + background.
    pub fn raw_signal_order(&self) -> Vec<usize> {
        self.descending_order(|s| s.raw_signal())
    }

    /// Build a new list whose i-th star is `self[order[i]]`.
    ///
    /// `order` must be a permutation of `0..len()`.
    pub fn permuted(&self, order: &[usize]) -> StarList {
        debug_assert_eq!(order.len(), self.stars.len());
        StarList {
            stars: order.iter().map(|&i| self.stars[i]).collect(),
        }
    }

    fn descending_order<F>(&self, key: F) -> Vec<usize>
    where
        F: Fn(&DetectedStar) -> f32,
    {
        let mut order: Vec<usize> = (0..self.stars.len()).collect();
        order.sort_by(|&a, &b| key(&self.stars[b]).total_cmp(&key(&self.stars[a])));
        order
    }
}

impl Deref for StarList {
    type Target = [DetectedStar];

    fn deref(&self) -> &[DetectedStar] {
        &self.stars
    }
}

impl From<Vec<DetectedStar>> for StarList {
    fn from(stars: Vec<DetectedStar>) -> Self {
        Self::new(stars)
    }
}

impl FromIterator<DetectedStar> for StarList {
    fn from_iter<I: IntoIterator<Item = DetectedStar>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}
