//! Data-parallel worker coordination.
//!
//! One process per device runs the same iteration sequence in lockstep.
//! Gradient reduction is a blocking collective owned by an external
//! primitive; this module carries the worker identity used to gate
//! singleton side effects and the seam where that collective plugs in.

use burn::optim::GradientsParams;
use burn::tensor::backend::AutodiffBackend;

/// Identity of one worker in a synchronous data-parallel group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerContext {
    pub rank: usize,
    pub world_size: usize,
}

impl WorkerContext {
    /// Single-process context.
    pub fn single() -> Self {
        Self { rank: 0, world_size: 1 }
    }

    pub fn new(rank: usize, world_size: usize) -> anyhow::Result<Self> {
        anyhow::ensure!(world_size > 0, "world size must be positive");
        anyhow::ensure!(rank < world_size, "rank {rank} out of range for world size {world_size}");
        Ok(Self { rank, world_size })
    }

    /// Whether this worker owns logging, checkpoint writes, evaluation
    /// and the EMA shadow.
    pub fn is_global_zero(&self) -> bool {
        self.rank == 0
    }
}

/// Synchronous gradient all-reduce, invoked exactly once per iteration
/// between backward and the optimizer step. Implementations block until
/// every worker in the group has contributed, so each worker steps on
/// identical gradients.
pub trait GradientSync<B: AutodiffBackend> {
    fn all_reduce(&self, grads: GradientsParams) -> GradientsParams;
}

/// Identity reduction for single-process training.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalSync;

impl<B: AutodiffBackend> GradientSync<B> for LocalSync {
    fn all_reduce(&self, grads: GradientsParams) -> GradientsParams {
        grads
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_context_is_global_zero() {
        let ctx = WorkerContext::single();
        assert!(ctx.is_global_zero());
        assert_eq!(ctx.world_size, 1);
    }

    #[test]
    fn test_only_rank_zero_owns_side_effects() {
        assert!(WorkerContext::new(0, 4).unwrap().is_global_zero());
        for rank in 1..4 {
            assert!(!WorkerContext::new(rank, 4).unwrap().is_global_zero());
        }
    }

    #[test]
    fn test_invalid_contexts_rejected() {
        assert!(WorkerContext::new(0, 0).is_err());
        assert!(WorkerContext::new(4, 4).is_err());
    }
}
