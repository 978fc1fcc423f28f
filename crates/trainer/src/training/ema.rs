//! Exponential-moving-average shadow of the live model.

use std::marker::PhantomData;

// `Param` is re-exported for the unit tests via `use super::*`.
#[allow(unused_imports)]
use burn::module::{Module, ModuleMapper, ModuleVisitor, Param, ParamId};
use burn::optim::GradientsParams;
use burn::prelude::*;

/// Shadow-model configuration.
#[derive(Config, Debug)]
pub struct EmaConfig {
    /// Maintain a shadow model at all.
    #[config(default = false)]
    pub enabled: bool,
    /// Fraction of the shadow kept on each averaging step.
    #[config(default = 0.9999)]
    pub beta: f64,
    /// Iterations between averaging steps once warm.
    #[config(default = 10)]
    pub update_every: u64,
    /// Warmup iterations during which the shadow tracks the live weights
    /// verbatim.
    #[config(default = 100)]
    pub update_after_step: u64,
}

/// Parameter-wise EMA copy of a model.
///
/// The shadow never participates in gradient computation and is mutated
/// only by the primary worker. Whether it replaces the live model for
/// export and evaluation is the caller's policy.
pub struct EmaShadow<B: Backend, M: Module<B>> {
    shadow: M,
    beta: f64,
    update_after_step: u64,
    update_every: u64,
    _backend: PhantomData<B>,
}

impl<B: Backend, M: Module<B>> EmaShadow<B, M> {
    /// Seed the shadow with a copy of the live weights.
    pub fn new(config: &EmaConfig, model: M) -> Self {
        Self {
            shadow: model,
            beta: config.beta,
            update_after_step: config.update_after_step,
            update_every: config.update_every,
            _backend: PhantomData,
        }
    }

    /// Shadow weights for evaluation or export.
    pub fn model(&self) -> &M {
        &self.shadow
    }

    /// Apply the update rule for one completed iteration: a verbatim copy
    /// during warmup, then `shadow = beta*shadow + (1-beta)*live` every
    /// `update_every` iterations.
    pub fn update(&mut self, iteration: u64, live: &M) {
        if iteration < self.update_after_step {
            self.shadow = live.clone();
            return;
        }
        if self.update_every == 0 || iteration % self.update_every != 0 {
            return;
        }
        let mut live_params = GradientsParams::new();
        let mut collector = ParamCollector::<B> {
            store: &mut live_params,
            _backend: PhantomData,
        };
        live.visit(&mut collector);
        let mut lerp = ShadowLerp::<B> {
            live: &mut live_params,
            beta: self.beta,
            _backend: PhantomData,
        };
        self.shadow = self.shadow.clone().map(&mut lerp);
    }
}

/// Collects a module's float parameters keyed by parameter id.
struct ParamCollector<'a, B: Backend> {
    store: &'a mut GradientsParams,
    _backend: PhantomData<B>,
}

impl<B: Backend> ModuleVisitor<B> for ParamCollector<'_, B> {
    fn visit_float<const D: usize>(&mut self, id: ParamId, tensor: &Tensor<B, D>) {
        self.store.register::<B, D>(id, tensor.clone());
    }
}

/// Lerps shadow parameters toward their live counterparts.
struct ShadowLerp<'a, B: Backend> {
    live: &'a mut GradientsParams,
    beta: f64,
    _backend: PhantomData<B>,
}

impl<B: Backend> ModuleMapper<B> for ShadowLerp<'_, B> {
    fn map_float<const D: usize>(&mut self, id: ParamId, tensor: Tensor<B, D>) -> Tensor<B, D> {
        let beta = self.beta;
        match self.live.remove::<B, D>(id) {
            Some(live) => tensor.mul_scalar(beta).add(live.mul_scalar(1.0 - beta)),
            None => tensor,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::ndarray::NdArray;
    use burn::tensor::TensorData;

    type TestBackend = NdArray<f32>;

    #[derive(Module, Debug)]
    struct ConstModule<B: Backend> {
        value: Param<Tensor<B, 1>>,
    }

    impl<B: Backend> ConstModule<B> {
        fn new(value: f32, device: &B::Device) -> Self {
            Self {
                value: Param::from_tensor(Tensor::from_data(TensorData::from([value]), device)),
            }
        }

        fn get(&self) -> f32 {
            self.value.val().into_scalar().elem()
        }
    }

    /// Adds a constant to every float parameter, standing in for an
    /// optimizer step.
    struct Shift(f32);

    impl<B: Backend> ModuleMapper<B> for Shift {
        fn map_float<const D: usize>(&mut self, _id: ParamId, tensor: Tensor<B, D>) -> Tensor<B, D> {
            let delta = self.0;
            tensor.add_scalar(delta)
        }
    }

    fn config(beta: f64, update_every: u64, update_after_step: u64) -> EmaConfig {
        EmaConfig::new()
            .with_enabled(true)
            .with_beta(beta)
            .with_update_every(update_every)
            .with_update_after_step(update_after_step)
    }

    #[test]
    fn test_warmup_copies_live_weights() {
        let device = Default::default();
        let mut live = ConstModule::<TestBackend>::new(1.0, &device);
        let mut ema = EmaShadow::new(&config(0.5, 2, 5), live.clone());

        live = live.map(&mut Shift(1.0));
        ema.update(3, &live);
        assert_eq!(ema.model().get(), 2.0);

        live = live.map(&mut Shift(1.0));
        ema.update(4, &live);
        assert_eq!(ema.model().get(), 3.0);
    }

    #[test]
    fn test_off_cadence_iterations_leave_shadow_unchanged() {
        let device = Default::default();
        let mut live = ConstModule::<TestBackend>::new(2.0, &device);
        let mut ema = EmaShadow::new(&config(0.5, 2, 2), live.clone());

        live = live.map(&mut Shift(1.0));
        ema.update(3, &live);
        assert_eq!(ema.model().get(), 2.0);
    }

    #[test]
    fn test_on_cadence_iterations_average() {
        let device = Default::default();
        let mut live = ConstModule::<TestBackend>::new(2.0, &device);
        let mut ema = EmaShadow::new(&config(0.5, 2, 2), live.clone());

        live = live.map(&mut Shift(1.0));
        ema.update(4, &live);
        // 0.5 * 2.0 + 0.5 * 3.0
        assert!((ema.model().get() - 2.5).abs() < 1e-6);
    }

    #[test]
    fn test_shadow_never_regresses_on_repeated_off_cadence_calls() {
        let device = Default::default();
        let mut live = ConstModule::<TestBackend>::new(0.0, &device);
        let mut ema = EmaShadow::new(&config(0.9, 4, 0), live.clone());

        for iteration in 1..4 {
            live = live.map(&mut Shift(1.0));
            ema.update(iteration, &live);
            assert_eq!(ema.model().get(), 0.0, "iteration {iteration} must not update");
        }
        live = live.map(&mut Shift(1.0));
        ema.update(4, &live);
        // 0.9 * 0.0 + 0.1 * 4.0
        assert!((ema.model().get() - 0.4).abs() < 1e-6);
    }
}
