//! Deterministic in-tree collaborators for smoke runs and tests.
//!
//! None of these stand in for production components: the scene is
//! procedural, the predictor is a minimal linear head and the renderer is
//! a flat color average. Together they exercise every seam of the
//! training loop on the CPU backend in seconds.

use std::collections::HashMap;
use std::ops::Range;
use std::path::Path;

use burn::module::Ignored;
use burn::nn::{Linear, LinearConfig};
use burn::prelude::*;
use burn::tensor::activation::sigmoid;
use splats::GaussianSplatSet;

use crate::model::perceptual::PerceptualScorer;
use crate::model::predictor::SplatPredictor;
use crate::model::renderer::{RenderView, SplatRenderer};
use crate::training::data::{ViewBatch, ViewProvider};
use crate::training::eval::{Evaluator, NOVEL_VIEW_PSNR};

/// Procedurally generated posed-view dataset.
///
/// Sample `i` is a near-constant image whose intensity encodes `i`, so
/// positional pairing stays easy to assert in tests. Cameras are
/// identity transforms; the flat renderer ignores them anyway.
#[derive(Debug, Clone)]
pub struct SyntheticScene {
    pub samples: usize,
    pub views: usize,
    pub image_size: usize,
}

impl SyntheticScene {
    pub fn new(samples: usize, views: usize, image_size: usize) -> Self {
        Self { samples, views, image_size }
    }

    /// Intensity encoding sample `index`.
    pub fn intensity(&self, index: usize) -> f32 {
        (index as f32 + 1.0) / (self.samples as f32 + 1.0)
    }
}

impl<B: Backend> ViewProvider<B> for SyntheticScene {
    fn len(&self) -> usize {
        self.samples
    }

    fn batch(&self, samples: Range<usize>, device: &B::Device) -> anyhow::Result<ViewBatch<B>> {
        anyhow::ensure!(
            samples.end <= self.samples,
            "sample range {samples:?} out of bounds for {} samples",
            self.samples
        );
        let b = samples.len();
        let (v, s) = (self.views, self.image_size);

        let mut pixels = Vec::with_capacity(b * v * 3 * s * s);
        for index in samples.clone() {
            let base = self.intensity(index);
            for view in 0..v {
                let shade = base * (1.0 - 0.05 * view as f32 / v.max(1) as f32);
                pixels.extend(std::iter::repeat_n(shade, 3 * s * s));
            }
        }
        let gt_images = Tensor::from_data(TensorData::new(pixels, [b, v, 3, s, s]), device);

        let mut mats = Vec::with_capacity(b * v * 16);
        let mut quats = Vec::with_capacity(b * v * 4);
        for _ in 0..b * v {
            mats.extend([
                1.0_f32, 0.0, 0.0, 0.0, //
                0.0, 1.0, 0.0, 0.0, //
                0.0, 0.0, 1.0, 0.0, //
                0.0, 0.0, 0.0, 1.0,
            ]);
            quats.extend([1.0_f32, 0.0, 0.0, 0.0]);
        }
        let identity = Tensor::from_data(TensorData::new(mats, [b, v, 4, 4]), device);

        Ok(ViewBatch {
            gt_images,
            view_to_world: identity.clone(),
            world_view: identity.clone(),
            projection: identity,
            camera_centers: Tensor::zeros([b, v, 3], device),
            camera_quats: Tensor::from_data(TensorData::new(quats, [b, v, 4]), device),
            focals: None,
            origin_distances: None,
        })
    }
}

/// Minimal image-to-splats head: mean-pooled input statistics through a
/// single linear projection, sliced into attribute blocks. Scaling and
/// opacity pass through a sigmoid to stay in range.
#[derive(Config, Debug)]
pub struct SplatHeadConfig {
    #[config(default = 3)]
    pub input_channels: usize,
    #[config(default = 16)]
    pub points: usize,
    #[config(default = 1)]
    pub sh_coeffs: usize,
}

impl SplatHeadConfig {
    /// Attribute scalars predicted per primitive.
    fn per_point(&self) -> usize {
        // xyz 3 + rotation 4 + scaling 3 + base color 3 + opacity 1 + harmonics
        14 + 3 * self.sh_coeffs
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> SplatHead<B> {
        SplatHead {
            proj: LinearConfig::new(self.input_channels, self.points * self.per_point())
                .init(device),
            points: Ignored(self.points),
            sh_coeffs: Ignored(self.sh_coeffs),
        }
    }
}

/// See [`SplatHeadConfig`].
#[derive(Module, Debug)]
pub struct SplatHead<B: Backend> {
    proj: Linear<B>,
    points: Ignored<usize>,
    sh_coeffs: Ignored<usize>,
}

impl<B: Backend> SplatPredictor<B> for SplatHead<B> {
    fn predict(
        &self,
        images: Tensor<B, 5>,
        _view_to_world: Tensor<B, 4>,
        _camera_quats: Tensor<B, 3>,
        _focals: Option<Tensor<B, 3>>,
    ) -> GaussianSplatSet<B> {
        let [b, v, c, h, w] = images.dims();
        let pooled = images
            .reshape([b, v, c, h * w])
            .mean_dim(3)
            .squeeze::<3>(3)
            .mean_dim(1)
            .squeeze::<2>(1);
        let points = *self.points;
        let sh = *self.sh_coeffs;
        let attrs = 14 + 3 * sh;
        let out = self.proj.forward(pooled).reshape([b, points, attrs]);
        let take = |from: usize, to: usize| out.clone().slice([0..b, 0..points, from..to]);
        GaussianSplatSet {
            xyz: take(0, 3),
            rotation: take(3, 7),
            scaling: sigmoid(take(7, 10)),
            features_dc: take(10, 13).reshape([b, points, 1, 3]),
            opacity: sigmoid(take(13, 14)),
            features_rest: take(14, attrs).reshape([b, points, sh, 3]),
        }
    }
}

/// Debug rasterizer: fills the frame with the opacity-weighted mean color
/// of the sample's primitives, blended over the background by mean
/// opacity. Fully differentiable, which is all the loop needs.
#[derive(Debug, Clone)]
pub struct FlatRenderer {
    pub image_size: usize,
}

impl<B: Backend> SplatRenderer<B> for FlatRenderer {
    fn render(
        &self,
        splats: &GaussianSplatSet<B>,
        sample: usize,
        _view: &RenderView<B>,
        background: &Tensor<B, 1>,
        _focal: Option<Tensor<B, 1>>,
    ) -> anyhow::Result<Tensor<B, 3>> {
        let [batch, points, _] = splats.opacity.dims();
        anyhow::ensure!(sample < batch, "sample {sample} out of range for batch {batch}");

        let opacity = splats.opacity.clone().slice([sample..sample + 1, 0..points, 0..1]);
        let colors = splats
            .features_dc
            .clone()
            .slice([sample..sample + 1, 0..points, 0..1, 0..3])
            .reshape([1, points, 3]);
        let color = (colors * opacity.clone().expand([1, points, 3]))
            .mean_dim(1)
            .reshape([3]);
        let coverage = opacity.mean_dim(1).reshape([1]).clamp(0.0, 1.0);

        let s = self.image_size;
        let foreground = color.reshape([3, 1, 1]).expand([3, s, s]);
        let bg = background.clone().reshape([3, 1, 1]).expand([3, s, s]);
        let cov = coverage.reshape([1, 1, 1]).expand([3, s, s]);
        Ok(foreground * cov.clone() + bg * (cov.ones_like() - cov))
    }
}

/// Stand-in perceptual scorer: mean absolute difference. Cheap, and
/// enough to verify the blending path.
#[derive(Debug, Clone, Copy, Default)]
pub struct MeanAbsScorer;

impl<B: Backend> PerceptualScorer<B> for MeanAbsScorer {
    fn score(&self, rendered: Tensor<B, 4>, reference: Tensor<B, 4>) -> Tensor<B, 1> {
        (rendered - reference).abs().mean()
    }
}

/// Renders held-out views with the debug rasterizer and reports mean
/// PSNR under the canonical selector key.
pub struct PsnrEvaluator {
    pub scene: SyntheticScene,
    pub renderer: FlatRenderer,
    pub input_views: usize,
    pub white_background: bool,
}

impl<B: Backend, M: SplatPredictor<B>> Evaluator<B, M> for PsnrEvaluator {
    fn evaluate(&mut self, model: &M, device: &B::Device) -> anyhow::Result<HashMap<String, f64>> {
        let background = if self.white_background {
            Tensor::<B, 1>::ones([3], device)
        } else {
            Tensor::<B, 1>::zeros([3], device)
        };
        let mut psnr_sum = 0.0;
        let mut count = 0usize;
        for index in 0..self.scene.samples {
            let batch = ViewProvider::<B>::batch(&self.scene, index..index + 1, device)?;
            let splats = model.predict(
                batch.input_images(self.input_views, false)?,
                batch.input_poses(self.input_views),
                batch.input_quats(self.input_views),
                None,
            );
            for view in self.input_views..batch.num_views() {
                let camera = batch.render_view(0, view);
                let rendered = self.renderer.render(&splats, 0, &camera, &background, None)?;
                let mse: f64 = (rendered - batch.image(0, view))
                    .powf_scalar(2.0)
                    .mean()
                    .into_scalar()
                    .elem();
                psnr_sum += -10.0 * (mse + 1e-12).log10();
                count += 1;
            }
        }
        anyhow::ensure!(count > 0, "evaluation set has no novel views");
        Ok(HashMap::from([(NOVEL_VIEW_PSNR.to_string(), psnr_sum / count as f64)]))
    }
}

/// Write a deterministic reference reconstruction set for `samples`
/// samples under `root`, named by zero-padded index.
pub fn write_reference_set<B: Backend>(
    root: &Path,
    samples: usize,
    points: usize,
    device: &B::Device,
) -> anyhow::Result<()> {
    for index in 0..samples {
        let set = synthetic_splats::<B>(index, points, device);
        splats::reference::write_sample(root, &format!("{index:05}"), &set)?;
    }
    Ok(())
}

/// Deterministic single-sample splat set; the xyz fill value encodes the
/// sample index.
pub fn synthetic_splats<B: Backend>(
    index: usize,
    points: usize,
    device: &B::Device,
) -> GaussianSplatSet<B> {
    let fill = |channels: usize, offset: f32| -> Tensor<B, 3> {
        let mut data = Vec::with_capacity(points * channels);
        for point in 0..points {
            for channel in 0..channels {
                data.push(
                    offset + index as f32 * 0.1 + point as f32 * 0.01 + channel as f32 * 0.001,
                );
            }
        }
        Tensor::from_data(TensorData::new(data, [1, points, channels]), device)
    };
    GaussianSplatSet {
        xyz: fill(3, 0.0),
        rotation: fill(4, 0.2),
        scaling: fill(3, 0.4).clamp(0.01, 1.0),
        opacity: fill(1, 0.3).clamp(0.0, 1.0),
        features_dc: fill(3, 0.5).reshape([1, points, 1, 3]),
        features_rest: fill(3, 0.7).reshape([1, points, 1, 3]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::Autodiff;
    use burn::backend::ndarray::NdArray;
    use burn::optim::GradientsParams;

    type TestBackend = NdArray<f32>;
    type TestAutodiffBackend = Autodiff<NdArray<f32>>;

    #[test]
    fn test_splat_head_output_shapes() {
        let device = Default::default();
        let head = SplatHeadConfig::new()
            .with_points(8)
            .with_sh_coeffs(2)
            .init::<TestBackend>(&device);
        let scene = SyntheticScene::new(2, 3, 8);
        let batch = ViewProvider::<TestBackend>::batch(&scene, 0..2, &device).unwrap();
        let splats = head.predict(
            batch.input_images(1, false).unwrap(),
            batch.input_poses(1),
            batch.input_quats(1),
            None,
        );
        splats.validate().unwrap();
        assert_eq!(splats.batch_size(), 2);
        assert_eq!(splats.num_points(), 8);
        assert_eq!(splats.features_rest.dims(), [2, 8, 2, 3]);
    }

    #[test]
    fn test_flat_renderer_is_differentiable() {
        let device = Default::default();
        let head = SplatHeadConfig::new().init::<TestAutodiffBackend>(&device);
        let scene = SyntheticScene::new(1, 2, 4);
        let batch = ViewProvider::<TestAutodiffBackend>::batch(&scene, 0..1, &device).unwrap();
        let splats = head.predict(
            batch.input_images(1, false).unwrap(),
            batch.input_poses(1),
            batch.input_quats(1),
            None,
        );
        let renderer = FlatRenderer { image_size: 4 };
        let background = Tensor::<TestAutodiffBackend, 1>::zeros([3], &device);
        let image = renderer
            .render(&splats, 0, &batch.render_view(0, 1), &background, None)
            .unwrap();
        let loss = (image - batch.image(0, 1)).powf_scalar(2.0).mean();
        let grads = GradientsParams::from_grads(loss.backward(), &head);
        assert!(!grads.is_empty());
    }

    #[test]
    fn test_psnr_evaluator_reports_selector_key() {
        let device = Default::default();
        let head = SplatHeadConfig::new().init::<TestBackend>(&device);
        let mut evaluator = PsnrEvaluator {
            scene: SyntheticScene::new(2, 3, 4),
            renderer: FlatRenderer { image_size: 4 },
            input_views: 1,
            white_background: true,
        };
        let metrics = evaluator.evaluate(&head, &device).unwrap();
        let psnr = metrics[NOVEL_VIEW_PSNR];
        assert!(psnr.is_finite());
    }

    #[test]
    fn test_synthetic_splats_are_deterministic_and_valid() {
        let device = Default::default();
        let a = synthetic_splats::<TestBackend>(3, 6, &device);
        let b = synthetic_splats::<TestBackend>(3, 6, &device);
        a.validate().unwrap();
        let left: Vec<f32> = a.xyz.into_data().to_vec().unwrap();
        let right: Vec<f32> = b.xyz.into_data().to_vec().unwrap();
        assert_eq!(left, right);
    }
}
