//! Learned image-similarity interface.

use burn::prelude::*;

/// Perceptual distance over `[-1, 1]`-scaled image stacks.
///
/// Scoring is expensive; the loss engine never calls it when its blend
/// weight is zero.
pub trait PerceptualScorer<B: Backend> {
    /// Mean perceptual distance between two `[n, channels, height, width]`
    /// stacks.
    fn score(&self, rendered: Tensor<B, 4>, reference: Tensor<B, 4>) -> Tensor<B, 1>;
}
