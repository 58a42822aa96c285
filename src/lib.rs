//! # quadsolve
//!
//! **Blind astrometric plate solving** in Rust: given an image of the night
//! sky and nothing else, find where on the sky it points.
//!
//! The pipeline has three stages:
//!
//! 1. **Star detection** ([`detection`]): background subtraction, PSF
//!    smoothing, thresholding, connected components, peak splitting and
//!    sub-pixel centroiding on a raw luminance buffer.
//! 2. **Detection reordering** ([`reorder`]): interleave brightness orders
//!    and spread the list over the frame so that short prefixes are good
//!    quad material.
//! 3. **Iterative quad matching** ([`solver`]): geometric-hash lookups of
//!    4-star codes against precomputed [`QuadIndex`]es, in growing depth
//!    windows, with log-odds verification and a final WCS/SIP refinement.
//!
//! The result is a FITS-style TAN [`WcsResult`].
//!
//! ## Example
//!
//! ```no_run
//! use quadsolve::{
//!     detect_stars, load_indices, reorder, solve_field, DetectionError, IndexBuildConfig,
//!     QuadIndex, RawPixelBuffer,
//! };
//! # fn read_frame() -> Vec<f32> { vec![0.0; 1280 * 960] }
//!
//! # fn main() -> anyhow::Result<()> {
//! // Build an index offline from a CSV star list and save it
//! let config = IndexBuildConfig {
//!     scale_lower_deg: 1.0,
//!     scale_upper_deg: 8.0,
//!     ..Default::default()
//! };
//! let index = QuadIndex::build_from_csv("data/stars.csv", &config)?;
//! index.save_to_file("data/index_1-8deg.rkyv")?;
//!
//! // Load indices once per session
//! let indices = load_indices(&["data/index_1-8deg.rkyv"]);
//!
//! // Detect, reorder, solve
//! let (width, height) = (1280, 960);
//! let pixels = RawPixelBuffer::new(read_frame(), width, height)?;
//! let stars = match detect_stars(&pixels, 1.0, 8.0, 2) {
//!     Ok(stars) => stars,
//!     Err(DetectionError::NoPeaksFound) => {
//!         println!("no stars above the detection limit");
//!         return Ok(());
//!     }
//!     Err(e) => return Err(e.into()),
//! };
//! let ordered = reorder(&stars);
//! let wcs = solve_field(&ordered, width, height, &indices, 10.0, 180.0, 20.0);
//! if wcs.solved {
//!     println!("RA {:.4} Dec {:.4}, {:.2}\"/px", wcs.ra, wcs.dec, wcs.pixel_scale);
//! }
//! # Ok(())
//! # }
//! ```

pub mod catalog;
pub mod detected_star;
pub mod detection;
pub mod error;
pub mod reorder;
pub mod skycells;
pub mod solver;
pub mod star;

pub use detected_star::{DetectedStar, StarList};
#[cfg(feature = "image")]
pub use detection::{detect_stars_in_file, luminance_from_image};
pub use detection::{
    detect_stars, detect_stars_with_config, DetectionConfig, DetectionResult, RawPixelBuffer,
};
pub use error::{DetectionError, MatchError};
pub use reorder::reorder;
pub use solver::{
    load_indices, solve_field, solve_field_with_config, solve_image, CatalogIndex,
    DepthSchedule, IndexBuildConfig, IndexHandle, QuadIndex, SolveConfig, SolveReport,
    SolveStatus, WcsResult,
};
pub use star::Star;
