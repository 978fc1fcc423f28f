mod config;

use std::path::{Path, PathBuf};

use anyhow::Context;
use burn::backend::Autodiff;
use burn::backend::ndarray::NdArray;
use burn::prelude::*;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use splats::ReferenceDataset;
use trainer::dist::{LocalSync, WorkerContext};
use trainer::synthetic::{
    FlatRenderer, MeanAbsScorer, PsnrEvaluator, SplatHeadConfig, SyntheticScene,
    write_reference_set,
};
use trainer::training::metrics::TracingSink;
use trainer::training::trainer::train;

use config::{Overrides, build_trainer_config, load_train_toml};

type SmokeBackend = Autodiff<NdArray<f32>>;

/// splat-train: training orchestrator for image-to-splat predictors.
#[derive(Parser)]
#[command(name = "splat-train", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

/// CLI subcommands.
#[derive(Subcommand)]
enum Command {
    /// Run a short synthetic end-to-end training loop on the CPU
    /// backend. Verifies the pipeline and the run directory layout
    /// without real data or a GPU rasterizer.
    Smoke {
        /// Path to the training config TOML file.
        #[arg(long, default_value = "configs/train.toml")]
        config: PathBuf,
        /// Run directory for checkpoints and generated references.
        #[arg(long, default_value = "runs/smoke")]
        run_dir: PathBuf,
        /// Override the iteration budget.
        #[arg(long)]
        iterations: Option<u64>,
        /// Override the batch size.
        #[arg(long)]
        batch_size: Option<usize>,
        /// Override the perceptual-term weight.
        #[arg(long)]
        lambda_lpips: Option<f64>,
        /// Random seed for model initialization.
        #[arg(long, default_value_t = 0)]
        seed: u64,
    },
    /// Load a config file, apply defaults and overrides, and print the
    /// resolved coordinator configuration.
    CheckConfig {
        /// Path to the training config TOML file.
        #[arg(long, default_value = "configs/train.toml")]
        config: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match Cli::parse().command {
        Command::Smoke { config, run_dir, iterations, batch_size, lambda_lpips, seed } => smoke(
            &config,
            &run_dir,
            Overrides { iterations, batch_size, lambda_lpips },
            seed,
        ),
        Command::CheckConfig { config } => check_config(&config),
    }
}

fn check_config(path: &Path) -> anyhow::Result<()> {
    let file = load_train_toml(path)?;
    let resolved = build_trainer_config(&file, &Overrides::default())?;
    println!("{resolved:#?}");
    Ok(())
}

fn smoke(config_path: &Path, run_dir: &Path, overrides: Overrides, seed: u64) -> anyhow::Result<()> {
    let file = load_train_toml(config_path)?;
    let config = build_trainer_config(&file, &overrides)?;
    if file.general.mixed_precision {
        tracing::warn!("mixed precision is delegated to the backend; the smoke pipeline runs in f32");
    }
    if file.general.num_devices > 1 {
        tracing::warn!(
            num_devices = file.general.num_devices,
            "smoke runs single-process; multi-device placement is the launcher's job"
        );
    }

    let device = Default::default();
    SmokeBackend::seed(seed);

    std::fs::create_dir_all(run_dir)
        .with_context(|| format!("creating run directory {}", run_dir.display()))?;
    config.save(run_dir.join("config.json"))?;

    let samples = 12;
    let views = 4;
    let image_size = 16;
    let points = 32;

    let scene = SyntheticScene::new(samples, views, image_size);
    let vis_scene = SyntheticScene::new(4, views, image_size);
    let references_dir = match &file.data.target_dir {
        Some(dir) => dir.clone(),
        None => {
            let dir = run_dir.join("references");
            write_reference_set::<SmokeBackend>(&dir, samples, points, &device)?;
            tracing::info!(dir = %dir.display(), samples, "generated synthetic reference set");
            dir
        }
    };
    let references = ReferenceDataset::open(&references_dir)?;

    let model = SplatHeadConfig::new()
        .with_points(points)
        .init::<SmokeBackend>(&device);
    let renderer = FlatRenderer { image_size };
    let scorer = MeanAbsScorer;
    let perceptual = (config.loss.lambda_perceptual != 0.0).then_some(&scorer);
    let mut evaluator = PsnrEvaluator {
        scene: SyntheticScene::new(3, views, image_size),
        renderer: renderer.clone(),
        input_views: config.input_views,
        white_background: config.white_background,
    };
    let mut sink = TracingSink;

    let outcome = train(
        &config,
        model,
        &renderer,
        perceptual,
        &scene,
        &references,
        Some(&vis_scene),
        &mut evaluator,
        &mut sink,
        &LocalSync,
        &WorkerContext::single(),
        run_dir,
        file.opt.pretrained_ckpt.as_deref(),
        &device,
    )?;

    tracing::info!(
        iteration = outcome.state.iteration,
        epoch = outcome.state.epoch,
        best_psnr = outcome.state.best_psnr,
        "smoke run complete"
    );
    Ok(())
}
