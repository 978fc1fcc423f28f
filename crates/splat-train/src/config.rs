//! TOML config loading for the training CLI.
//!
//! Deserializes `configs/train.toml` with `[data]`, `[opt]`, `[opt.ema]`,
//! `[logging]` and `[general]` sections, then merges CLI overrides.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;
use trainer::category::CategoryProfile;
use trainer::training::ema::EmaConfig;
use trainer::training::loss::{LossConfig, PhotometricKind};
use trainer::training::trainer::TrainerConfig;

/// Top-level structure matching `configs/train.toml`.
#[derive(Debug, Deserialize)]
pub struct TrainToml {
    pub data: DataSection,
    pub opt: OptSection,
    #[serde(default)]
    pub logging: LoggingSection,
    #[serde(default)]
    pub general: GeneralSection,
}

/// Dataset options.
#[derive(Debug, Deserialize)]
pub struct DataSection {
    /// Object category; gates scale regularization and input hints.
    pub category: String,
    /// Views fed to the predictor per sample.
    #[serde(default = "default_input_images")]
    pub input_images: usize,
    #[serde(default = "default_true")]
    pub white_background: bool,
    /// Root of the precomputed reference reconstructions. The smoke
    /// command generates a synthetic set when absent.
    #[serde(default)]
    pub target_dir: Option<PathBuf>,
}

/// Optimization options.
#[derive(Debug, Deserialize)]
pub struct OptSection {
    #[serde(default = "default_iterations")]
    pub iterations: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_base_lr")]
    pub base_lr: f64,
    #[serde(default = "default_betas")]
    pub betas: [f32; 2],
    /// Photometric distance: "l1" or "l2".
    #[serde(default = "default_loss")]
    pub loss: String,
    /// Perceptual-term weight; zero disables perceptual scoring.
    #[serde(default)]
    pub lambda_lpips: f64,
    /// Seed a fresh run from another run's weights.
    #[serde(default)]
    pub pretrained_ckpt: Option<PathBuf>,
    #[serde(default)]
    pub ema: EmaSection,
}

/// Shadow-model options.
#[derive(Debug, Deserialize)]
pub struct EmaSection {
    #[serde(rename = "use", default)]
    pub enabled: bool,
    #[serde(default = "default_ema_beta")]
    pub beta: f64,
    #[serde(default = "default_ema_update_every")]
    pub update_every: u64,
    #[serde(default = "default_ema_update_after_step")]
    pub update_after_step: u64,
}

impl Default for EmaSection {
    fn default() -> Self {
        Self {
            enabled: false,
            beta: default_ema_beta(),
            update_every: default_ema_update_every(),
            update_after_step: default_ema_update_after_step(),
        }
    }
}

/// Side-effect cadences, in iterations.
#[derive(Debug, Deserialize)]
pub struct LoggingSection {
    #[serde(default = "default_loss_log")]
    pub loss_log: u64,
    #[serde(default = "default_render_log")]
    pub render_log: u64,
    #[serde(default = "default_val_log")]
    pub val_log: u64,
    #[serde(default = "default_ckpt_iterations")]
    pub ckpt_iterations: u64,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            loss_log: default_loss_log(),
            render_log: default_render_log(),
            val_log: default_val_log(),
            ckpt_iterations: default_ckpt_iterations(),
        }
    }
}

/// Launch-level options surfaced for operators; precision and device
/// placement belong to the backend and the surrounding launcher.
#[derive(Debug, Deserialize)]
pub struct GeneralSection {
    #[serde(default = "default_num_devices")]
    pub num_devices: usize,
    #[serde(default)]
    pub mixed_precision: bool,
}

impl Default for GeneralSection {
    fn default() -> Self {
        Self { num_devices: default_num_devices(), mixed_precision: false }
    }
}

fn default_input_images() -> usize {
    1
}
fn default_true() -> bool {
    true
}
fn default_iterations() -> u64 {
    30_000
}
fn default_batch_size() -> usize {
    8
}
fn default_base_lr() -> f64 {
    5e-5
}
fn default_betas() -> [f32; 2] {
    [0.9, 0.999]
}
fn default_loss() -> String {
    "l1".to_string()
}
fn default_ema_beta() -> f64 {
    0.9999
}
fn default_ema_update_every() -> u64 {
    10
}
fn default_ema_update_after_step() -> u64 {
    100
}
fn default_loss_log() -> u64 {
    100
}
fn default_render_log() -> u64 {
    500
}
fn default_val_log() -> u64 {
    1000
}
fn default_ckpt_iterations() -> u64 {
    1000
}
fn default_num_devices() -> usize {
    1
}

/// Load and deserialize a `TrainToml` from a TOML file.
pub fn load_train_toml(path: &Path) -> anyhow::Result<TrainToml> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("reading config file {}", path.display()))?;
    let config: TrainToml = toml::from_str(&contents)?;
    tracing::info!(path = %path.display(), "loaded training config");
    Ok(config)
}

/// CLI overrides; flags take priority over file values.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub iterations: Option<u64>,
    pub batch_size: Option<usize>,
    pub lambda_lpips: Option<f64>,
}

/// Resolve the config file plus CLI overrides into the coordinator
/// configuration. The category profile is applied here, once.
pub fn build_trainer_config(file: &TrainToml, overrides: &Overrides) -> anyhow::Result<TrainerConfig> {
    let profile = CategoryProfile::resolve(&file.data.category);
    let photometric = PhotometricKind::from_name(&file.opt.loss)?;
    let loss = LossConfig::new()
        .with_photometric(photometric)
        .with_lambda_perceptual(overrides.lambda_lpips.unwrap_or(file.opt.lambda_lpips))
        .with_regularize_scales(profile.regularize_scales);
    let ema = EmaConfig::new()
        .with_enabled(file.opt.ema.enabled)
        .with_beta(file.opt.ema.beta)
        .with_update_every(file.opt.ema.update_every)
        .with_update_after_step(file.opt.ema.update_after_step);
    Ok(TrainerConfig::new(loss, ema)
        .with_iterations(overrides.iterations.unwrap_or(file.opt.iterations))
        .with_batch_size(overrides.batch_size.unwrap_or(file.opt.batch_size))
        .with_input_views(file.data.input_images)
        .with_base_lr(file.opt.base_lr)
        .with_adam_beta1(file.opt.betas[0])
        .with_adam_beta2(file.opt.betas[1])
        .with_log_interval(file.logging.loss_log)
        .with_vis_interval(file.logging.render_log)
        .with_val_interval(file.logging.val_log)
        .with_ckpt_interval(file.logging.ckpt_iterations)
        .with_white_background(file.data.white_background)
        .with_use_focals(profile.use_focals)
        .with_concat_origin_distances(profile.concat_origin_distances))
}
