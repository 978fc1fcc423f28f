//! Paired batch assembly from two positionally-aligned datasets.
//!
//! The primary multi-view stream and the precomputed reference
//! reconstructions are iterated strictly sequentially, without shuffling,
//! and zipped by position: sample `i` of an epoch pairs with reference
//! `i`. Correctness rests on both directory listings being sorted
//! identically; no content-based matching is performed.

use std::marker::PhantomData;
use std::ops::Range;

use anyhow::Context;
use burn::prelude::*;
use splats::{GaussianSplatSet, ReferenceDataset};

use crate::model::renderer::RenderView;

/// One batch of posed views with ground-truth images and camera tensors,
/// keyed by field the way the dataset interface hands them over.
#[derive(Debug, Clone)]
pub struct ViewBatch<B: Backend> {
    /// `[batch, views, channels, height, width]` ground-truth images.
    pub gt_images: Tensor<B, 5>,
    /// `[batch, views, 4, 4]` camera-to-world transforms.
    pub view_to_world: Tensor<B, 4>,
    /// `[batch, views, 4, 4]` world-to-view transforms.
    pub world_view: Tensor<B, 4>,
    /// `[batch, views, 4, 4]` full projection transforms.
    pub projection: Tensor<B, 4>,
    /// `[batch, views, 3]` camera centers.
    pub camera_centers: Tensor<B, 3>,
    /// `[batch, views, 4]` camera-to-world rotations as quaternions.
    pub camera_quats: Tensor<B, 3>,
    /// `[batch, views, 2]` focal lengths in pixels, when the category
    /// provides them.
    pub focals: Option<Tensor<B, 3>>,
    /// `[batch, views, 1, height, width]` origin-distance hints, when the
    /// category provides them.
    pub origin_distances: Option<Tensor<B, 5>>,
}

impl<B: Backend> ViewBatch<B> {
    pub fn batch_size(&self) -> usize {
        self.gt_images.dims()[0]
    }

    pub fn num_views(&self) -> usize {
        self.gt_images.dims()[1]
    }

    /// Ground-truth image `[channels, height, width]` for one sample/view.
    pub fn image(&self, sample: usize, view: usize) -> Tensor<B, 3> {
        let [_, _, c, h, w] = self.gt_images.dims();
        self.gt_images
            .clone()
            .slice([sample..sample + 1, view..view + 1, 0..c, 0..h, 0..w])
            .reshape([c, h, w])
    }

    /// Camera tensors for rendering one sample from one view.
    pub fn render_view(&self, sample: usize, view: usize) -> RenderView<B> {
        RenderView {
            world_view: mat4(&self.world_view, sample, view),
            projection: mat4(&self.projection, sample, view),
            camera_center: self
                .camera_centers
                .clone()
                .slice([sample..sample + 1, view..view + 1, 0..3])
                .reshape([3]),
        }
    }

    /// Focal length `[2]` for one sample/view, if present.
    pub fn focal(&self, sample: usize, view: usize) -> Option<Tensor<B, 1>> {
        self.focals.as_ref().map(|focals| {
            focals
                .clone()
                .slice([sample..sample + 1, view..view + 1, 0..2])
                .reshape([2])
        })
    }

    /// Images of the first `count` views, fed to the predictor, with the
    /// origin-distance hint concatenated on the channel axis when asked.
    pub fn input_images(&self, count: usize, concat_origin_distances: bool) -> anyhow::Result<Tensor<B, 5>> {
        let [b, v, c, h, w] = self.gt_images.dims();
        anyhow::ensure!(
            count >= 1 && count <= v,
            "input view count {count} out of range for a batch with {v} views"
        );
        let images = self.gt_images.clone().slice([0..b, 0..count, 0..c, 0..h, 0..w]);
        if !concat_origin_distances {
            return Ok(images);
        }
        let distances = self
            .origin_distances
            .clone()
            .context("origin-distance hints requested but absent from the batch")?;
        let distances = distances.slice([0..b, 0..count, 0..1, 0..h, 0..w]);
        Ok(Tensor::cat(vec![images, distances], 2))
    }

    /// Camera-to-world transforms of the input views.
    pub fn input_poses(&self, count: usize) -> Tensor<B, 4> {
        let [b, _, _, _] = self.view_to_world.dims();
        self.view_to_world.clone().slice([0..b, 0..count, 0..4, 0..4])
    }

    /// Rotation quaternions of the input views.
    pub fn input_quats(&self, count: usize) -> Tensor<B, 3> {
        let [b, _, _] = self.camera_quats.dims();
        self.camera_quats.clone().slice([0..b, 0..count, 0..4])
    }

    /// Focal lengths of the input views, if present.
    pub fn input_focals(&self, count: usize) -> Option<Tensor<B, 3>> {
        self.focals.as_ref().map(|focals| {
            let [b, _, _] = focals.dims();
            focals.clone().slice([0..b, 0..count, 0..2])
        })
    }
}

fn mat4<B: Backend>(tensor: &Tensor<B, 4>, sample: usize, view: usize) -> Tensor<B, 2> {
    tensor
        .clone()
        .slice([sample..sample + 1, view..view + 1, 0..4, 0..4])
        .reshape([4, 4])
}

/// Primary multi-view dataset interface. Decoding and camera assembly are
/// external; providers are consumed strictly sequentially so positional
/// pairing with the reference set holds.
pub trait ViewProvider<B: Backend> {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Assemble the samples at `samples` into one batch, in order.
    fn batch(&self, samples: Range<usize>, device: &B::Device) -> anyhow::Result<ViewBatch<B>>;
}

/// An aligned training batch: views plus the reference reconstruction for
/// the same sample positions. `reference` is `None` when any sample in
/// the batch has no reference artifact on disk; the alignment term is
/// then skipped rather than failing the batch.
pub struct PairedBatch<B: Backend> {
    pub views: ViewBatch<B>,
    pub reference: Option<GaussianSplatSet<B>>,
}

/// One epoch over the positional zip of a view provider and a reference
/// set. The shorter side ends the epoch; constructing a new source
/// restarts both streams at position zero.
pub struct PairedBatchSource<'a, B: Backend, V: ViewProvider<B>> {
    views: &'a V,
    references: &'a ReferenceDataset,
    batch_size: usize,
    cursor: usize,
    _backend: PhantomData<B>,
}

impl<'a, B: Backend, V: ViewProvider<B>> PairedBatchSource<'a, B, V> {
    pub fn new(views: &'a V, references: &'a ReferenceDataset, batch_size: usize) -> Self {
        Self {
            views,
            references,
            batch_size,
            cursor: 0,
            _backend: PhantomData,
        }
    }

    /// Samples visited per epoch: whichever stream is shorter.
    pub fn epoch_samples(&self) -> usize {
        self.views.len().min(self.references.len())
    }

    /// Batches per epoch.
    pub fn epoch_len(&self) -> usize {
        if self.batch_size == 0 {
            return 0;
        }
        self.epoch_samples().div_ceil(self.batch_size)
    }

    /// Next aligned batch, or `None` once the epoch is over.
    pub fn next_batch(&mut self, device: &B::Device) -> Option<anyhow::Result<PairedBatch<B>>> {
        let total = self.epoch_samples();
        if self.batch_size == 0 || self.cursor >= total {
            return None;
        }
        let samples = self.cursor..(self.cursor + self.batch_size).min(total);
        self.cursor = samples.end;
        Some(self.assemble(samples, device))
    }

    fn assemble(&self, samples: Range<usize>, device: &B::Device) -> anyhow::Result<PairedBatch<B>> {
        let views = self.views.batch(samples.clone(), device)?;
        let mut sets = Vec::with_capacity(samples.len());
        let mut complete = true;
        for index in samples {
            // The loader already warned about whatever is missing.
            match self.references.load::<B>(index, device) {
                Some(set) => sets.push(set),
                None => complete = false,
            }
        }
        let reference = if complete {
            Some(GaussianSplatSet::concat(sets)?)
        } else {
            None
        };
        Ok(PairedBatch { views, reference })
    }
}

/// Cyclic cursor over the preview dataset. Exhaustion wraps back to the
/// start; it is never a reason to stop training.
#[derive(Debug, Default)]
pub struct VisCycle {
    cursor: usize,
}

impl VisCycle {
    /// Next preview index, or `None` for an empty preview set.
    pub fn next(&mut self, len: usize) -> Option<usize> {
        if len == 0 {
            return None;
        }
        if self.cursor >= len {
            self.cursor = 0;
        }
        let index = self.cursor;
        self.cursor += 1;
        Some(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthetic::{SyntheticScene, write_reference_set};
    use burn::backend::ndarray::NdArray;
    use tempfile::TempDir;

    type TestBackend = NdArray<f32>;

    fn reference_dir(samples: usize) -> TempDir {
        let device = Default::default();
        let dir = TempDir::new().unwrap();
        write_reference_set::<TestBackend>(dir.path(), samples, 4, &device).unwrap();
        dir
    }

    #[test]
    fn test_positional_pairing_and_epoch_length() {
        let device = Default::default();
        let scene = SyntheticScene::new(5, 3, 8);
        let dir = reference_dir(5);
        let references = ReferenceDataset::open(dir.path()).unwrap();

        let mut source = PairedBatchSource::<TestBackend, _>::new(&scene, &references, 2);
        assert_eq!(source.epoch_len(), 3);

        let mut sizes = Vec::new();
        while let Some(batch) = source.next_batch(&device) {
            let batch = batch.unwrap();
            assert!(batch.reference.is_some());
            sizes.push(batch.views.batch_size());
        }
        assert_eq!(sizes, vec![2, 2, 1]);
        // Epoch over: the source stays exhausted until rebuilt.
        assert!(source.next_batch(&device).is_none());

        let mut fresh = PairedBatchSource::<TestBackend, _>::new(&scene, &references, 2);
        assert!(fresh.next_batch(&device).is_some());
    }

    #[test]
    fn test_shorter_side_ends_epoch() {
        let device = Default::default();
        let scene = SyntheticScene::new(5, 3, 8);
        let dir = reference_dir(3);
        let references = ReferenceDataset::open(dir.path()).unwrap();

        let mut source = PairedBatchSource::<TestBackend, _>::new(&scene, &references, 1);
        let mut visited = 0;
        while let Some(batch) = source.next_batch(&device) {
            batch.unwrap();
            visited += 1;
        }
        assert_eq!(visited, 3);
    }

    #[test]
    fn test_missing_reference_drops_alignment_for_that_batch() {
        let device = Default::default();
        let scene = SyntheticScene::new(4, 3, 8);
        let dir = reference_dir(4);
        std::fs::remove_file(dir.path().join("00002").join("reconstruction.mpk")).unwrap();
        let references = ReferenceDataset::open(dir.path()).unwrap();

        let mut source = PairedBatchSource::<TestBackend, _>::new(&scene, &references, 2);
        let first = source.next_batch(&device).unwrap().unwrap();
        assert!(first.reference.is_some());
        let second = source.next_batch(&device).unwrap().unwrap();
        assert!(second.reference.is_none());
    }

    #[test]
    fn test_batch_reference_matches_sample_positions() {
        let device = Default::default();
        let scene = SyntheticScene::new(3, 3, 8);
        let dir = reference_dir(3);
        let references = ReferenceDataset::open(dir.path()).unwrap();

        let mut source = PairedBatchSource::<TestBackend, _>::new(&scene, &references, 3);
        let batch = source.next_batch(&device).unwrap().unwrap();
        let reference = batch.reference.unwrap();
        assert_eq!(reference.batch_size(), 3);

        // Each reference sample carries its index in its xyz fill value.
        let expected: Vec<_> = (0..3)
            .map(|i| references.load::<TestBackend>(i, &device).unwrap())
            .collect();
        let merged = GaussianSplatSet::concat(expected).unwrap();
        let got: Vec<f32> = reference.xyz.into_data().to_vec().unwrap();
        let want: Vec<f32> = merged.xyz.into_data().to_vec().unwrap();
        assert_eq!(got, want);
    }

    #[test]
    fn test_input_images_concat_requires_hints() {
        let device = Default::default();
        let scene = SyntheticScene::new(1, 2, 8);
        let batch = ViewProvider::<TestBackend>::batch(&scene, 0..1, &device).unwrap();
        assert!(batch.input_images(1, false).is_ok());
        assert!(batch.input_images(1, true).is_err());
    }

    #[test]
    fn test_input_images_concat_adds_channel() {
        let device = Default::default();
        let scene = SyntheticScene::new(1, 2, 8);
        let mut batch = ViewProvider::<TestBackend>::batch(&scene, 0..1, &device).unwrap();
        batch.origin_distances = Some(Tensor::zeros([1, 2, 1, 8, 8], &device));
        let images = batch.input_images(1, true).unwrap();
        assert_eq!(images.dims(), [1, 1, 4, 8, 8]);
    }

    #[test]
    fn test_vis_cycle_wraps() {
        let mut cycle = VisCycle::default();
        let visited: Vec<_> = (0..5).map(|_| cycle.next(3).unwrap()).collect();
        assert_eq!(visited, vec![0, 1, 2, 0, 1]);
        assert!(cycle.next(0).is_none());
    }
}
