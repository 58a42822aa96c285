//! Error types for detection and matching.

use thiserror::Error;

/// Failure of a star-detection call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DetectionError {
    /// The detector ran but found no candidate above the threshold.
    /// Recoverable by lowering `plim` or changing `dpsf`.
    #[error("no peaks found above the detection threshold")]
    NoPeaksFound,

    /// The pixel buffer or parameters are malformed.
    #[error("invalid detection input: {reason}")]
    InvalidInput { reason: String },
}

impl DetectionError {
    pub fn invalid_input(reason: impl Into<String>) -> Self {
        Self::InvalidInput {
            reason: reason.into(),
        }
    }
}

/// Failure of a solve attempt.
///
/// [`MatchError::Exhausted`] is not exceptional: it is reported through
/// `solved = false` rather than propagated.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MatchError {
    #[error("insufficient stars for quad matching: {found} (need at least 4)")]
    InsufficientStars { found: usize },

    #[error("no catalog index loaded")]
    NoIndexLoaded,

    #[error("search exhausted after {checkpoints} depth checkpoint(s) without an accepted match")]
    Exhausted { checkpoints: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detection_error_display() {
        let err = DetectionError::invalid_input("pixel count 10 != 4x4");
        assert!(err.to_string().contains("pixel count 10"));
        assert!(DetectionError::NoPeaksFound
            .to_string()
            .contains("no peaks"));
    }

    #[test]
    fn test_match_error_display() {
        let err = MatchError::InsufficientStars { found: 3 };
        assert!(err.to_string().contains('3'));
        let err = MatchError::Exhausted { checkpoints: 2 };
        assert!(err.to_string().contains("2 depth checkpoint"));
        assert_eq!(MatchError::NoIndexLoaded.to_string(), "no catalog index loaded");
    }
}
