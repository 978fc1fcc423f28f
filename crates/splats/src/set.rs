//! The per-primitive attribute container shared by predictor, rasterizer
//! and loss code.

use burn::prelude::*;
use burn::record::Record;

/// A batch of Gaussian primitive sets.
///
/// Attribute layout, with `batch` samples of `points` primitives each:
///
/// ```text
/// xyz           [batch, points, 3]    position
/// rotation      [batch, points, 4]    unit quaternion
/// scaling       [batch, points, 3]    per-axis extent
/// opacity       [batch, points, 1]
/// features_dc   [batch, points, 1, 3] base color
/// features_rest [batch, points, sh, 3] higher-order harmonics
/// ```
///
/// A set lives for one forward pass: produced by the predictor, consumed
/// by the rasterizer and the loss, then dropped. Reference reconstructions
/// loaded from disk use the same type with `batch == 1` per sample.
#[derive(Debug, Clone)]
pub struct GaussianSplatSet<B: Backend> {
    pub xyz: Tensor<B, 3>,
    pub rotation: Tensor<B, 3>,
    pub scaling: Tensor<B, 3>,
    pub opacity: Tensor<B, 3>,
    pub features_dc: Tensor<B, 4>,
    pub features_rest: Tensor<B, 4>,
}

/// Serializable form of [`GaussianSplatSet`] for burn recorders.
#[derive(Record)]
pub struct SplatSetRecord<B: Backend> {
    pub xyz: Tensor<B, 3>,
    pub rotation: Tensor<B, 3>,
    pub scaling: Tensor<B, 3>,
    pub opacity: Tensor<B, 3>,
    pub features_dc: Tensor<B, 4>,
    pub features_rest: Tensor<B, 4>,
}

impl<B: Backend> GaussianSplatSet<B> {
    /// Number of samples in the batch axis.
    pub fn batch_size(&self) -> usize {
        self.xyz.dims()[0]
    }

    /// Number of primitives per sample.
    pub fn num_points(&self) -> usize {
        self.xyz.dims()[1]
    }

    /// Check that every attribute agrees on batch size, point count and
    /// carries its expected channel layout.
    pub fn validate(&self) -> anyhow::Result<()> {
        let [batch, points, xyz_c] = self.xyz.dims();
        anyhow::ensure!(xyz_c == 3, "xyz must have 3 channels, got {xyz_c}");

        let check = |name: &str, dims: &[usize], channels: usize| -> anyhow::Result<()> {
            anyhow::ensure!(
                dims[0] == batch && dims[1] == points,
                "{name} is {dims:?} but the set holds {batch} samples of {points} points"
            );
            let got = *dims.last().unwrap_or(&0);
            anyhow::ensure!(got == channels, "{name} must have {channels} channels, got {got}");
            Ok(())
        };

        check("rotation", &self.rotation.dims(), 4)?;
        check("scaling", &self.scaling.dims(), 3)?;
        check("opacity", &self.opacity.dims(), 1)?;
        check("features_dc", &self.features_dc.dims(), 3)?;
        let dc_sh = self.features_dc.dims()[2];
        anyhow::ensure!(dc_sh == 1, "features_dc must have a single harmonic, got {dc_sh}");
        check("features_rest", &self.features_rest.dims(), 3)?;
        Ok(())
    }

    /// Concatenate single-sample sets along the batch axis. All sets must
    /// agree on point count and harmonic degree.
    pub fn concat(sets: Vec<Self>) -> anyhow::Result<Self> {
        anyhow::ensure!(!sets.is_empty(), "cannot concatenate an empty list of splat sets");
        let points = sets[0].num_points();
        for set in &sets {
            anyhow::ensure!(
                set.num_points() == points,
                "splat sets disagree on point count: {} vs {points}",
                set.num_points()
            );
        }
        let mut xyz = Vec::with_capacity(sets.len());
        let mut rotation = Vec::with_capacity(sets.len());
        let mut scaling = Vec::with_capacity(sets.len());
        let mut opacity = Vec::with_capacity(sets.len());
        let mut features_dc = Vec::with_capacity(sets.len());
        let mut features_rest = Vec::with_capacity(sets.len());
        for set in sets {
            xyz.push(set.xyz);
            rotation.push(set.rotation);
            scaling.push(set.scaling);
            opacity.push(set.opacity);
            features_dc.push(set.features_dc);
            features_rest.push(set.features_rest);
        }
        Ok(Self {
            xyz: Tensor::cat(xyz, 0),
            rotation: Tensor::cat(rotation, 0),
            scaling: Tensor::cat(scaling, 0),
            opacity: Tensor::cat(opacity, 0),
            features_dc: Tensor::cat(features_dc, 0),
            features_rest: Tensor::cat(features_rest, 0),
        })
    }

    /// Convert into the serializable record form.
    pub fn into_record(self) -> SplatSetRecord<B> {
        SplatSetRecord {
            xyz: self.xyz,
            rotation: self.rotation,
            scaling: self.scaling,
            opacity: self.opacity,
            features_dc: self.features_dc,
            features_rest: self.features_rest,
        }
    }

    /// Rebuild from the serializable record form.
    pub fn from_record(record: SplatSetRecord<B>) -> Self {
        Self {
            xyz: record.xyz,
            rotation: record.rotation,
            scaling: record.scaling,
            opacity: record.opacity,
            features_dc: record.features_dc,
            features_rest: record.features_rest,
        }
    }
}
