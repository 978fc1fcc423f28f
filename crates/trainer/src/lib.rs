//! Training orchestrator for image-to-splat predictors.
//!
//! Drives the iterate/forward/render/loss/backward/step cycle over paired
//! multi-view and reference-reconstruction data, with scheduled loss
//! blending, an optional EMA shadow model, resumable two-slot checkpoints
//! and rank-gated side effects for data-parallel runs. The predictor
//! network, the rasterizer, the perceptual scorer and the metric
//! computation are external collaborators behind the traits in [`model`]
//! and [`training::eval`].

pub mod category;
pub mod dist;
pub mod model;
pub mod synthetic;
pub mod training;
