//! Angular two-point correlation functions on the celestial sphere.
//!
//! Aspect measures how the clustering of a weighted point catalog deviates
//! from a uniform random distribution over an arbitrary survey footprint,
//! as a function of angular separation. Small scales are counted pair by
//! pair through a hierarchical spatial index; large scales go through a
//! pixelized overdensity field, re-measured on successively coarser
//! aggregates. Footprint regionation turns the accumulators into jack-knife
//! samples for covariance estimation.

pub mod bins;
pub mod catalog;
pub mod correlation;
pub mod error;
pub mod footprint;
pub mod geom;
pub mod healpix;
pub mod output;
pub mod scalar_field;
pub mod tree;

pub use bins::{AngularBin, Binning};
pub use catalog::SkyPoint;
pub use correlation::CorrelationEngine;
pub use error::{Error, Result};
pub use footprint::{CoveragePixel, Footprint};
pub use scalar_field::{FieldKind, SampleOptions, ScalarField};
pub use tree::PointIndex;
