//! Crate-wide error type.
//!
//! Fatal conditions only: recoverable per-point problems (a point outside
//! the footprint, a rejected tree insert) are counted and logged by the
//! callers instead of aborting the calculation.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Two scalar fields that must share a resolution do not.
    #[error("scalar field resolutions differ ({a} vs {b})")]
    ResolutionMismatch { a: u32, b: u32 },

    /// An angular bin was handed to a field sweep at the wrong resolution.
    #[error("angular bin expects resolution {bin} but the field is at {field}")]
    BinResolutionMismatch { bin: u32, field: u32 },

    /// Aggregation target must be a coarser power-of-two resolution.
    #[error("cannot aggregate a field at resolution {from} down to {to}")]
    InvalidAggregation { from: u32, to: u32 },

    /// Binning construction was given an empty or inverted angular range.
    #[error("invalid angular binning: {0}")]
    InvalidBinning(String),

    /// Local-mean overdensity conversion requires a regionated field.
    #[error("local mean intensity requires an initialized regionation")]
    NoRegions,

    /// Region labels could not be attached to a field or point index.
    #[error("failed to initialize regions: {0}")]
    RegionInit(String),
}
