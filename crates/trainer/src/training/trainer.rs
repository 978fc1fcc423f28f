//! The distributed training coordinator.
//!
//! Drives the per-iteration cycle — paired batch, forward, sequential
//! novel-view rendering, loss composition, backward, synchronized
//! optimizer step — plus the interval-gated singleton side effects:
//! logging, preview rendering, evaluation with best-model promotion and
//! checkpointing. Every side effect belongs to the global-zero worker.

use std::path::Path;

use anyhow::Context;
use burn::module::AutodiffModule;
use burn::optim::{AdamConfig, GradientsParams, Optimizer};
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use splats::{GaussianSplatSet, ReferenceDataset};

use crate::dist::{GradientSync, WorkerContext};
use crate::model::perceptual::PerceptualScorer;
use crate::model::predictor::SplatPredictor;
use crate::model::renderer::SplatRenderer;

use super::checkpoint::{self, Slot, TrainState};
use super::data::{PairedBatch, PairedBatchSource, ViewBatch, ViewProvider, VisCycle};
use super::ema::{EmaConfig, EmaShadow};
use super::eval::{BestTracker, Evaluator, novel_view_score};
use super::loss::{LossConfig, LossEngine};
use super::metrics::{MetricSink, image_to_frame};

/// Coordinator configuration.
#[derive(Config, Debug)]
pub struct TrainerConfig {
    /// Loss blending.
    pub loss: LossConfig,
    /// Shadow-model maintenance.
    pub ema: EmaConfig,
    /// Iteration budget.
    #[config(default = 30_000)]
    pub iterations: u64,
    #[config(default = 8)]
    pub batch_size: usize,
    /// Views fed to the predictor; the remaining views supervise.
    #[config(default = 1)]
    pub input_views: usize,
    #[config(default = 5e-5)]
    pub base_lr: f64,
    #[config(default = 0.9)]
    pub adam_beta1: f32,
    #[config(default = 0.999)]
    pub adam_beta2: f32,
    #[config(default = 1e-15)]
    pub adam_epsilon: f32,
    /// Iterations between scalar log flushes. Zero disables.
    #[config(default = 100)]
    pub log_interval: u64,
    /// Iterations between preview renders. Zero disables.
    #[config(default = 500)]
    pub vis_interval: u64,
    /// Iterations between held-out evaluations. Zero disables.
    #[config(default = 1000)]
    pub val_interval: u64,
    /// Iterations between `latest` checkpoint writes. Zero disables the
    /// interval writes; the final write still happens.
    #[config(default = 1000)]
    pub ckpt_interval: u64,
    #[config(default = true)]
    pub white_background: bool,
    /// Feed per-view focal lengths to the predictor (category-gated).
    #[config(default = false)]
    pub use_focals: bool,
    /// Concatenate origin-distance hints onto the input images
    /// (category-gated).
    #[config(default = false)]
    pub concat_origin_distances: bool,
}

/// Result of a completed training run.
#[derive(Debug)]
pub struct TrainOutcome<M> {
    pub model: M,
    pub state: TrainState,
}

/// Run the training loop to the configured iteration budget.
///
/// Every worker executes the same sequence; `ctx` decides which one owns
/// logging, the EMA shadow, evaluation and checkpoint writes. Gradients
/// pass through `sync` exactly once per iteration, so each worker steps
/// on identical values.
///
/// # Errors
/// A non-finite loss aborts immediately, before the optimizer step and
/// before any checkpoint write for that iteration. I/O failures while
/// writing checkpoints abort as well.
#[allow(clippy::too_many_arguments)]
pub fn train<B, M, R, P, E, V, S, G>(
    config: &TrainerConfig,
    model: M,
    renderer: &R,
    perceptual: Option<&P>,
    views: &V,
    references: &ReferenceDataset,
    vis_views: Option<&V>,
    evaluator: &mut E,
    sink: &mut S,
    sync: &G,
    ctx: &WorkerContext,
    run_dir: &Path,
    pretrained: Option<&Path>,
    device: &B::Device,
) -> anyhow::Result<TrainOutcome<M>>
where
    B: AutodiffBackend,
    M: AutodiffModule<B> + SplatPredictor<B>,
    M::InnerModule: SplatPredictor<B::InnerBackend>,
    R: SplatRenderer<B>,
    P: PerceptualScorer<B>,
    E: Evaluator<B::InnerBackend, M::InnerModule>,
    V: ViewProvider<B>,
    S: MetricSink,
    G: GradientSync<B>,
{
    anyhow::ensure!(config.batch_size > 0, "batch size must be positive");
    std::fs::create_dir_all(run_dir)
        .with_context(|| format!("creating run directory {}", run_dir.display()))?;

    let optimizer = AdamConfig::new()
        .with_beta_1(config.adam_beta1)
        .with_beta_2(config.adam_beta2)
        .with_epsilon(config.adam_epsilon)
        .init();
    let (mut model, mut optimizer, mut state, resume_kind) =
        checkpoint::resume::<B, M, _>(run_dir, pretrained, model, optimizer, device)?;

    if ctx.is_global_zero() {
        tracing::info!(
            rank = ctx.rank,
            world_size = ctx.world_size,
            resume = ?resume_kind,
            start_iteration = state.iteration,
            iterations = config.iterations,
            "starting training"
        );
    }

    let engine = LossEngine::new(
        config.loss.clone(),
        perceptual.map(|scorer| scorer as &dyn PerceptualScorer<B>),
    )?;
    let mut ema = (config.ema.enabled && ctx.is_global_zero())
        .then(|| EmaShadow::new(&config.ema, model.valid()));
    let background = background_color::<B>(config.white_background, device);
    let mut best = BestTracker::new(state.best_psnr);
    let mut vis_cycle = VisCycle::default();
    let mut iteration = state.iteration;
    let mut last_loss = state.loss;

    'training: loop {
        let mut batches = PairedBatchSource::new(views, references, config.batch_size);
        if batches.epoch_len() == 0 {
            anyhow::bail!("no overlapping samples between the view dataset and the reference set");
        }
        loop {
            if iteration >= config.iterations {
                break 'training;
            }
            let Some(batch) = batches.next_batch(device) else {
                break;
            };
            let PairedBatch { views: batch_views, reference } = batch?;
            iteration += 1;

            let input_images =
                batch_views.input_images(config.input_views, config.concat_origin_distances)?;
            let focals = config
                .use_focals
                .then(|| batch_views.input_focals(config.input_views))
                .flatten();
            let splats = model.predict(
                input_images,
                batch_views.input_poses(config.input_views),
                batch_views.input_quats(config.input_views),
                focals,
            );

            let (rendered, gt) = render_novel_views(
                renderer,
                &splats,
                &batch_views,
                config.input_views,
                &background,
            )?;
            let (total, terms) =
                engine.compose(rendered, gt, &splats, reference.as_ref(), iteration);

            // Corrupted gradients must never reach the optimizer.
            if !terms.total.is_finite() {
                anyhow::bail!("non-finite loss {} at iteration {iteration}", terms.total);
            }
            last_loss = terms.total;

            let grads = GradientsParams::from_grads(total.backward(), &model);
            let grads = sync.all_reduce(grads);
            model = optimizer.step(config.base_lr, model, grads);

            if let Some(ema) = ema.as_mut() {
                ema.update(iteration, &model.valid());
            }

            if !ctx.is_global_zero() {
                continue;
            }

            if config.log_interval > 0 && iteration % config.log_interval == 0 {
                sink.log_scalars(&terms.log_scalars(), iteration);
            }

            if let Some(vis) = vis_views {
                if config.vis_interval > 0
                    && (iteration % config.vis_interval == 0 || iteration == 1)
                {
                    if let Err(err) = render_preview(
                        config,
                        &model,
                        renderer,
                        vis,
                        &mut vis_cycle,
                        &background,
                        sink,
                        iteration,
                        device,
                    ) {
                        tracing::warn!(iteration, error = %err, "preview rendering failed");
                    }
                }
            }

            if config.val_interval > 0 && iteration % config.val_interval == 0 {
                let metrics = match ema.as_ref() {
                    Some(ema) => evaluator.evaluate(ema.model(), device)?,
                    None => evaluator.evaluate(&model.valid(), device)?,
                };
                let mut entries: Vec<(String, f64)> =
                    metrics.iter().map(|(name, value)| (format!("val/{name}"), *value)).collect();
                entries.sort_by(|a, b| a.0.cmp(&b.0));
                sink.log_scalars(&entries, iteration);

                let score = novel_view_score(&metrics)?;
                if best.observe(score) {
                    state = TrainState {
                        iteration,
                        epoch: state.epoch,
                        loss: last_loss,
                        best_psnr: best.best(),
                    };
                    write_slot::<B, _, _>(run_dir, Slot::Best, &model, ema.as_ref(), &optimizer, &state)?;
                    tracing::info!(iteration, psnr = score, "new best model");
                }
            }

            if config.ckpt_interval > 0 && iteration % config.ckpt_interval == 0 {
                state = TrainState {
                    iteration,
                    epoch: state.epoch,
                    loss: last_loss,
                    best_psnr: best.best(),
                };
                write_slot::<B, _, _>(run_dir, Slot::Latest, &model, ema.as_ref(), &optimizer, &state)?;
            }
        }
        state.epoch += 1;
    }

    state = TrainState {
        iteration,
        epoch: state.epoch,
        loss: last_loss,
        best_psnr: best.best(),
    };
    if ctx.is_global_zero() {
        write_slot::<B, _, _>(run_dir, Slot::Latest, &model, ema.as_ref(), &optimizer, &state)?;
        tracing::info!(iteration, best_psnr = state.best_psnr, "training finished");
    }
    Ok(TrainOutcome { model, state })
}

/// Render every supervision view of every sample sequentially — the
/// rasterizer cannot batch — and stack results alongside the matching
/// ground truth.
fn render_novel_views<B, R>(
    renderer: &R,
    splats: &GaussianSplatSet<B>,
    views: &ViewBatch<B>,
    input_views: usize,
    background: &Tensor<B, 1>,
) -> anyhow::Result<(Tensor<B, 4>, Tensor<B, 4>)>
where
    B: Backend,
    R: SplatRenderer<B>,
{
    let batch = views.batch_size();
    let total = views.num_views();
    anyhow::ensure!(
        input_views < total,
        "need at least one novel view beyond the {input_views} input views"
    );
    let count = batch * (total - input_views);
    let mut rendered = Vec::with_capacity(count);
    let mut targets = Vec::with_capacity(count);
    for sample in 0..batch {
        for view in input_views..total {
            let camera = views.render_view(sample, view);
            let image = renderer
                .render(splats, sample, &camera, background, views.focal(sample, view))
                .with_context(|| format!("rendering sample {sample} view {view}"))?;
            rendered.push(image);
            targets.push(views.image(sample, view));
        }
    }
    Ok((Tensor::stack::<4>(rendered, 0), Tensor::stack::<4>(targets, 0)))
}

/// Forward one preview sample and log a full orbit of rendered frames
/// next to ground truth. The preview cursor wraps when the set is
/// exhausted.
#[allow(clippy::too_many_arguments)]
fn render_preview<B, M, R, V, S>(
    config: &TrainerConfig,
    model: &M,
    renderer: &R,
    vis: &V,
    cycle: &mut VisCycle,
    background: &Tensor<B, 1>,
    sink: &mut S,
    iteration: u64,
    device: &B::Device,
) -> anyhow::Result<()>
where
    B: Backend,
    M: SplatPredictor<B>,
    R: SplatRenderer<B>,
    V: ViewProvider<B>,
    S: MetricSink,
{
    let Some(index) = cycle.next(vis.len()) else {
        return Ok(());
    };
    let batch = vis.batch(index..index + 1, device)?;
    let input_images = batch.input_images(config.input_views, config.concat_origin_distances)?;
    let focals = config
        .use_focals
        .then(|| batch.input_focals(config.input_views))
        .flatten();
    let splats = model.predict(
        input_images,
        batch.input_poses(config.input_views),
        batch.input_quats(config.input_views),
        focals,
    );
    let mut frames = Vec::with_capacity(batch.num_views());
    let mut gt_frames = Vec::with_capacity(batch.num_views());
    for view in 0..batch.num_views() {
        let camera = batch.render_view(0, view);
        let image = renderer.render(&splats, 0, &camera, background, batch.focal(0, view))?;
        frames.push(image_to_frame(image)?);
        gt_frames.push(image_to_frame(batch.image(0, view))?);
    }
    sink.log_frames("render/orbit", &frames, iteration);
    sink.log_frames("render/orbit_gt", &gt_frames, iteration);
    Ok(())
}

/// Write one checkpoint slot, exporting the EMA shadow when one exists.
fn write_slot<B, M, O>(
    run_dir: &Path,
    slot: Slot,
    model: &M,
    ema: Option<&EmaShadow<B::InnerBackend, M::InnerModule>>,
    optimizer: &O,
    state: &TrainState,
) -> anyhow::Result<()>
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
    O: Optimizer<M, B>,
{
    match ema {
        Some(ema) => checkpoint::save_slot::<B::InnerBackend, _, B, _>(
            run_dir,
            slot,
            ema.model(),
            optimizer.to_record(),
            state,
        ),
        None => checkpoint::save_slot::<B, _, B, _>(
            run_dir,
            slot,
            model,
            optimizer.to_record(),
            state,
        ),
    }
}

/// Constant rasterization background.
fn background_color<B: Backend>(white: bool, device: &B::Device) -> Tensor<B, 1> {
    if white {
        Tensor::ones([3], device)
    } else {
        Tensor::zeros([3], device)
    }
}
