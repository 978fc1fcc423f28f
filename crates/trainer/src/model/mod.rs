//! External-collaborator interfaces: predictor, rasterizer and
//! perceptual scorer. The orchestrator never looks inside any of them.

pub mod perceptual;
pub mod predictor;
pub mod renderer;

pub use perceptual::PerceptualScorer;
pub use predictor::SplatPredictor;
pub use renderer::{RenderView, SplatRenderer};
