//! Multi-term loss composition with scheduled blending.
//!
//! The scalar training loss blends a photometric term over rendered vs
//! ground-truth novel views, an optional perceptual term, a reference
//! alignment term whose weight follows a step curriculum over iterations,
//! and category-conditional scale-outlier penalties.

use std::fmt;

use burn::prelude::*;
use serde::{Deserialize, Serialize};
use splats::GaussianSplatSet;

use crate::model::perceptual::PerceptualScorer;

/// Keeps min-max normalization finite on constant slices.
const NORM_EPS: f64 = 1e-8;
/// Scale magnitude above which a primitive counts as oversized.
const SCALE_CEILING: f64 = 20.0;
/// Scale magnitude below which a primitive counts as degenerate.
const SCALE_FLOOR: f64 = 1e-5;
/// Weight applied to both scale penalties.
const SCALE_PENALTY_WEIGHT: f64 = 0.1;

/// Pixel-space distance used for the photometric term.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PhotometricKind {
    L1,
    L2,
}

impl fmt::Display for PhotometricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::L1 => write!(f, "l1"),
            Self::L2 => write!(f, "l2"),
        }
    }
}

impl PhotometricKind {
    /// Parse the config-file spelling.
    pub fn from_name(name: &str) -> anyhow::Result<Self> {
        match name {
            "l1" => Ok(Self::L1),
            "l2" => Ok(Self::L2),
            other => anyhow::bail!("unknown photometric loss {other:?}, expected \"l1\" or \"l2\""),
        }
    }
}

/// Loss blending configuration, resolved once at startup.
#[derive(Config, Debug)]
pub struct LossConfig {
    /// Pixel distance between rendered and ground-truth images.
    #[config(default = "PhotometricKind::L1")]
    pub photometric: PhotometricKind,
    /// Weight of the perceptual term; the photometric term gets the
    /// complement. Zero disables perceptual scoring entirely.
    #[config(default = 0.0)]
    pub lambda_perceptual: f64,
    /// Scale-outlier penalties, for categories that need them.
    #[config(default = false)]
    pub regularize_scales: bool,
}

/// Alignment-term weight as a step function of the iteration count.
///
/// Predictions are pulled toward the references only after photometric
/// training has stabilized, then with gradually increasing pressure.
pub fn alignment_weight(iteration: u64) -> f64 {
    match iteration {
        0..=2999 => 0.0,
        3000..=3999 => 0.03,
        4000..=6999 => 0.05,
        7000..=9999 => 0.08,
        _ => 0.1,
    }
}

/// Min-max normalize over `axes`, independently for every slice of the
/// remaining axes: `(x - min) / (max - min + 1e-8)`.
pub fn min_max_normalize<B: Backend, const D: usize>(
    tensor: Tensor<B, D>,
    axes: &[usize],
) -> Tensor<B, D> {
    let mins = axes.iter().fold(tensor.clone(), |acc, &axis| acc.min_dim(axis));
    let maxs = axes.iter().fold(tensor.clone(), |acc, &axis| acc.max_dim(axis));
    (tensor - mins.clone()) / (maxs - mins).add_scalar(NORM_EPS)
}

/// Squared-difference alignment between predicted and reference
/// attributes, each min-max normalized per sample and weighted by the
/// reference opacity. Opacity itself is compared with plain MSE.
pub fn alignment_loss<B: Backend>(
    predicted: &GaussianSplatSet<B>,
    reference: &GaussianSplatSet<B>,
) -> Tensor<B, 1> {
    let opacity = reference.opacity.clone();

    let xyz = point_term(predicted.xyz.clone(), reference.xyz.clone(), opacity.clone());
    let rotation = point_term(predicted.rotation.clone(), reference.rotation.clone(), opacity.clone());
    let scaling = point_term(predicted.scaling.clone(), reference.scaling.clone(), opacity.clone());
    let base_color = color_term(
        predicted.features_dc.clone(),
        reference.features_dc.clone(),
        opacity.clone(),
    );
    let harmonics = harmonics_term(
        predicted.features_rest.clone(),
        reference.features_rest.clone(),
        opacity,
    );
    let opacity_mse = (predicted.opacity.clone() - reference.opacity.clone())
        .powf_scalar(2.0)
        .mean();

    xyz + rotation + scaling + base_color + harmonics + opacity_mse
}

/// Opacity-weighted mean of squared differences between per-point
/// `[batch, points, channels]` attributes, normalized over the point axis.
fn point_term<B: Backend>(
    predicted: Tensor<B, 3>,
    reference: Tensor<B, 3>,
    opacity: Tensor<B, 3>,
) -> Tensor<B, 1> {
    let predicted = min_max_normalize(predicted, &[1]);
    let reference = min_max_normalize(reference, &[1]);
    let diff = (predicted - reference).powf_scalar(2.0);
    let [b, n, c] = diff.dims();
    (diff * opacity.expand([b, n, c])).mean()
}

/// Base-color term: channel-mean difference, squared, opacity-weighted.
fn color_term<B: Backend>(
    predicted: Tensor<B, 4>,
    reference: Tensor<B, 4>,
    opacity: Tensor<B, 3>,
) -> Tensor<B, 1> {
    let predicted = min_max_normalize(predicted, &[2, 3]);
    let reference = min_max_normalize(reference, &[2, 3]);
    let diff = (predicted - reference)
        .mean_dim(3)
        .squeeze::<3>(3)
        .powf_scalar(2.0);
    (diff * opacity).mean()
}

/// Higher-order term: squared difference averaged over the harmonic and
/// channel axes, opacity-weighted.
fn harmonics_term<B: Backend>(
    predicted: Tensor<B, 4>,
    reference: Tensor<B, 4>,
    opacity: Tensor<B, 3>,
) -> Tensor<B, 1> {
    let predicted = min_max_normalize(predicted, &[2, 3]);
    let reference = min_max_normalize(reference, &[2, 3]);
    let diff = (predicted - reference)
        .powf_scalar(2.0)
        .mean_dim(3)
        .mean_dim(2)
        .squeeze::<3>(3);
    (diff * opacity).mean()
}

/// Penalty on oversized predicted scales: 0.1 × mean of values above the
/// ceiling; exactly zero when none qualify.
pub fn oversize_scale_penalty<B: Backend>(scaling: Tensor<B, 3>) -> Tensor<B, 1> {
    let mask = scaling.clone().greater_elem(SCALE_CEILING);
    masked_mean(scaling, mask) * SCALE_PENALTY_WEIGHT
}

/// Penalty on degenerate predicted scales: 0.1 × mean of `-ln` of values
/// below the floor; exactly zero when none qualify.
pub fn undersize_scale_penalty<B: Backend>(scaling: Tensor<B, 3>) -> Tensor<B, 1> {
    let mask = scaling.clone().lower_elem(SCALE_FLOOR);
    let neg_log = scaling.clamp_min(1e-12).log().neg();
    masked_mean(neg_log, mask) * SCALE_PENALTY_WEIGHT
}

/// Mean of `values` where `mask` holds; zero when the mask is empty.
fn masked_mean<B: Backend, const D: usize>(
    values: Tensor<B, D>,
    mask: Tensor<B, D, Bool>,
) -> Tensor<B, 1> {
    let device = values.device();
    let mask = Tensor::<B, D>::from_data(mask.int().into_data(), &device);
    let count = mask.clone().sum();
    let mean = (values * mask).sum() / count.clone().clamp_min(1.0);
    let has_any = Tensor::<B, 1>::from_data(count.greater_elem(0.0).int().into_data(), &device);
    mean * has_any
}

/// Per-iteration loss components, kept for logging only.
#[derive(Debug, Clone, Copy, Default)]
pub struct LossTerms {
    pub total: f64,
    pub photometric: f64,
    pub perceptual: Option<f64>,
    pub alignment: f64,
    pub alignment_weight: f64,
    pub oversize_penalty: Option<f64>,
    pub undersize_penalty: Option<f64>,
}

impl LossTerms {
    /// Scalar entries for the metric sink, with logarithmic compression
    /// on loss magnitudes.
    pub fn log_scalars(&self) -> Vec<(String, f64)> {
        fn compress(value: f64) -> f64 {
            (value + 1e-8).log10()
        }
        let mut entries = vec![
            ("loss/total".to_string(), compress(self.total)),
            ("loss/photometric".to_string(), compress(self.photometric)),
            ("loss/alignment".to_string(), compress(self.alignment)),
            ("loss/alignment_weight".to_string(), self.alignment_weight),
        ];
        if let Some(perceptual) = self.perceptual {
            entries.push(("loss/perceptual".to_string(), compress(perceptual)));
        }
        if let Some(oversize) = self.oversize_penalty {
            entries.push(("loss/oversize_reg".to_string(), compress(oversize)));
        }
        if let Some(undersize) = self.undersize_penalty {
            entries.push(("loss/undersize_reg".to_string(), compress(undersize)));
        }
        entries
    }
}

/// Composes the scalar training loss. Collaborator handles and blend
/// weights are fixed at startup; only the alignment weight varies with
/// the iteration.
pub struct LossEngine<'a, B: Backend> {
    config: LossConfig,
    perceptual: Option<&'a dyn PerceptualScorer<B>>,
}

impl<'a, B: Backend> LossEngine<'a, B> {
    pub fn new(
        config: LossConfig,
        perceptual: Option<&'a dyn PerceptualScorer<B>>,
    ) -> anyhow::Result<Self> {
        if config.lambda_perceptual != 0.0 && perceptual.is_none() {
            anyhow::bail!(
                "perceptual weight {} configured but no scorer supplied",
                config.lambda_perceptual
            );
        }
        Ok(Self { config, perceptual })
    }

    /// Blend all terms into the scalar loss for one iteration.
    ///
    /// `rendered` and `gt` are `[n, channels, height, width]` stacks over
    /// every novel view of every sample in the batch. A batch without a
    /// reference simply contributes no alignment term.
    pub fn compose(
        &self,
        rendered: Tensor<B, 4>,
        gt: Tensor<B, 4>,
        splats: &GaussianSplatSet<B>,
        reference: Option<&GaussianSplatSet<B>>,
        iteration: u64,
    ) -> (Tensor<B, 1>, LossTerms) {
        let photometric = match self.config.photometric {
            PhotometricKind::L1 => (rendered.clone() - gt.clone()).abs().mean(),
            PhotometricKind::L2 => (rendered.clone() - gt.clone()).powf_scalar(2.0).mean(),
        };
        let lambda_p = self.config.lambda_perceptual;
        let mut terms = LossTerms {
            photometric: scalar(&photometric),
            alignment_weight: alignment_weight(iteration),
            ..Default::default()
        };
        let mut total = photometric * (1.0 - lambda_p);

        if lambda_p != 0.0 {
            if let Some(scorer) = self.perceptual {
                let perceptual = scorer.score(
                    rendered.mul_scalar(2.0).sub_scalar(1.0),
                    gt.mul_scalar(2.0).sub_scalar(1.0),
                );
                terms.perceptual = Some(scalar(&perceptual));
                total = total + perceptual * lambda_p;
            }
        }

        if terms.alignment_weight != 0.0 {
            if let Some(reference) = reference {
                let alignment = alignment_loss(splats, reference);
                terms.alignment = scalar(&alignment);
                total = total + alignment * terms.alignment_weight;
            }
        }

        if self.config.regularize_scales {
            let oversize = oversize_scale_penalty(splats.scaling.clone());
            let undersize = undersize_scale_penalty(splats.scaling.clone());
            terms.oversize_penalty = Some(scalar(&oversize));
            terms.undersize_penalty = Some(scalar(&undersize));
            total = total + oversize + undersize;
        }

        terms.total = scalar(&total);
        (total, terms)
    }
}

fn scalar<B: Backend>(value: &Tensor<B, 1>) -> f64 {
    value.clone().into_scalar().elem()
}
