//! Depth checkpoints for the incremental quad search.
//!
//! The matcher considers the reordered star list in growing prefixes. Each
//! checkpoint closes a window `[previous, checkpoint)`; only quads whose
//! newest star lies in the window are tried there, so every quad is tried
//! once over the whole search.

/// Ascending star-count checkpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepthSchedule {
    checkpoints: Vec<usize>,
}

impl Default for DepthSchedule {
    /// 10, 20, ..., 200.
    fn default() -> Self {
        Self::uniform(10, 200)
    }
}

impl DepthSchedule {
    /// Schedule from arbitrary checkpoints; zeros and duplicates are dropped.
    pub fn new(mut checkpoints: Vec<usize>) -> Self {
        checkpoints.retain(|&c| c > 0);
        checkpoints.sort_unstable();
        checkpoints.dedup();
        Self { checkpoints }
    }

    /// Checkpoints every `step` stars up to and including `max`.
    pub fn uniform(step: usize, max: usize) -> Self {
        let step = step.max(1);
        Self::new((1..=max / step).map(|k| k * step).collect())
    }

    pub fn checkpoints(&self) -> &[usize] {
        &self.checkpoints
    }

    /// Search windows for a list of `total` stars, in order.
    ///
    /// Windows past the end of the list are clamped; once a window reaches
    /// `total` no further windows are produced.
    pub fn windows(&self, total: usize) -> Vec<(usize, usize)> {
        let mut out = Vec::new();
        let mut start = 0;
        for &cp in &self.checkpoints {
            if start >= total {
                break;
            }
            let end = clamp_window(start, cp, total);
            out.push((start, end));
            start = end;
        }
        out
    }
}

/// End of the window starting at `start`: the requested checkpoint, clamped
/// to the list length and never before `start`.
pub fn clamp_window(start: usize, requested_end: usize, total: usize) -> usize {
    requested_end.min(total).max(start)
}

/// Where the incremental search stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchState {
    NotStarted,
    /// Searching the window that ends at `depth`.
    Searching { depth: usize },
    /// A candidate was accepted in the window ending at `depth`.
    Solved { depth: usize },
    /// Every window was searched without an accepted candidate.
    Exhausted,
}

impl SearchState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SearchState::Solved { .. } | SearchState::Exhausted)
    }
}
