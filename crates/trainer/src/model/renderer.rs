//! Differentiable rasterizer interface.

use burn::prelude::*;
use splats::GaussianSplatSet;

/// One camera for a single rendered image.
#[derive(Debug, Clone)]
pub struct RenderView<B: Backend> {
    /// `[4, 4]` world-to-view transform.
    pub world_view: Tensor<B, 2>,
    /// `[4, 4]` full projection transform.
    pub projection: Tensor<B, 2>,
    /// `[3]` camera center in world space.
    pub camera_center: Tensor<B, 1>,
}

/// Renders one sample of a primitive set from one camera.
///
/// Rasterization does not batch: callers loop over samples and views
/// sequentially and accumulate the returned `[channels, height, width]`
/// images themselves.
pub trait SplatRenderer<B: Backend> {
    fn render(
        &self,
        splats: &GaussianSplatSet<B>,
        sample: usize,
        view: &RenderView<B>,
        background: &Tensor<B, 1>,
        focal: Option<Tensor<B, 1>>,
    ) -> anyhow::Result<Tensor<B, 3>>;
}
