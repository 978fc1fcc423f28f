//! Gaussian splat primitive sets and reference reconstruction I/O.
//!
//! Provides the typed attribute container produced by splat predictors and
//! consumed by rasterizers, plus disk round-trips for the precomputed
//! reference reconstructions used as alignment targets during training.

pub mod reference;
pub mod set;

pub use reference::ReferenceDataset;
pub use set::{GaussianSplatSet, SplatSetRecord};
