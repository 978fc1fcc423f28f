//! Predictor interface: posed input views in, primitive set out.

use burn::prelude::*;
use splats::GaussianSplatSet;

/// Predicts a set of Gaussian primitives from posed input views.
///
/// `images` is `[batch, views, channels, height, width]`; categories with
/// depth hints carry an extra channel. `view_to_world` is
/// `[batch, views, 4, 4]`, `camera_quats` is `[batch, views, 4]` and
/// `focals`, when the category provides them, `[batch, views, 2]`.
///
/// The produced set lives for one iteration; the orchestrator never keeps
/// it across steps.
pub trait SplatPredictor<B: Backend> {
    fn predict(
        &self,
        images: Tensor<B, 5>,
        view_to_world: Tensor<B, 4>,
        camera_quats: Tensor<B, 3>,
        focals: Option<Tensor<B, 3>>,
    ) -> GaussianSplatSet<B>;
}
