//! Two-slot checkpoint persistence and the resume protocol.
//!
//! Each slot is a directory holding the model record, the optimizer
//! record and a small JSON metadata file. `latest` is rewritten on a
//! fixed cadence, `best` only when evaluation reports a strictly better
//! novel-view score.

use std::fs::File;
use std::path::Path;

use anyhow::Context;
use burn::module::{AutodiffModule, Module};
use burn::optim::Optimizer;
use burn::prelude::*;
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder, Record, Recorder};
use burn::tensor::backend::AutodiffBackend;
use serde::{Deserialize, Serialize};

const MODEL_FILE: &str = "model";
const OPTIMIZER_FILE: &str = "optimizer";
const META_FILE: &str = "meta.json";

/// Counters persisted alongside the weights in every slot.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrainState {
    /// Completed training iterations.
    pub iteration: u64,
    /// Completed passes over the paired data.
    pub epoch: u64,
    /// Total loss at the iteration that wrote this slot.
    pub loss: f64,
    /// Best novel-view score observed so far.
    pub best_psnr: f64,
}

impl TrainState {
    /// Fresh counters for a cold start.
    pub fn cold() -> Self {
        Self { iteration: 0, epoch: 0, loss: 0.0, best_psnr: 0.0 }
    }
}

/// Named checkpoint slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    /// Rewritten on every checkpoint interval.
    Latest,
    /// Rewritten only on strict evaluation improvement.
    Best,
}

impl Slot {
    pub fn dir_name(self) -> &'static str {
        match self {
            Slot::Latest => "latest",
            Slot::Best => "best",
        }
    }
}

/// How training state was initialized at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeKind {
    /// Continued from the run directory's own `latest` slot.
    Latest,
    /// Seeded from another run's weights; counters restart.
    Pretrained,
    /// Nothing to restore.
    Cold,
}

/// Whether a slot has been written under `run_dir`.
pub fn slot_exists(run_dir: &Path, slot: Slot) -> bool {
    run_dir.join(slot.dir_name()).join(META_FILE).is_file()
}

/// Read the counters stored in a slot.
pub fn load_state(run_dir: &Path, slot: Slot) -> anyhow::Result<TrainState> {
    read_meta(&run_dir.join(slot.dir_name()))
}

/// Write one slot as a unit: model weights (live or shadow), optimizer
/// record and metadata.
pub fn save_slot<BM, M, BO, R>(
    run_dir: &Path,
    slot: Slot,
    model: &M,
    optimizer_record: R,
    state: &TrainState,
) -> anyhow::Result<()>
where
    BM: Backend,
    M: Module<BM>,
    BO: Backend,
    R: Record<BO>,
{
    let dir = run_dir.join(slot.dir_name());
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("creating checkpoint slot {}", dir.display()))?;
    let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
    model
        .clone()
        .save_file(dir.join(MODEL_FILE), &recorder)
        .map_err(|err| anyhow::anyhow!("saving model weights to {}: {err}", dir.display()))?;
    recorder
        .record(optimizer_record, dir.join(OPTIMIZER_FILE))
        .map_err(|err| anyhow::anyhow!("saving optimizer state to {}: {err}", dir.display()))?;
    let meta = File::create(dir.join(META_FILE))
        .with_context(|| format!("creating {}", dir.join(META_FILE).display()))?;
    serde_json::to_writer_pretty(meta, state)?;
    tracing::info!(
        slot = slot.dir_name(),
        iteration = state.iteration,
        best_psnr = state.best_psnr,
        "checkpoint written"
    );
    Ok(())
}

/// Resume protocol, first match wins: the run directory's own `latest`
/// slot; else a configured pretrained run directory (weights and best
/// score only — the iteration counter restarts and the optimizer stays
/// fresh); else a cold start.
pub fn resume<B, M, O>(
    run_dir: &Path,
    pretrained: Option<&Path>,
    model: M,
    optimizer: O,
    device: &B::Device,
) -> anyhow::Result<(M, O, TrainState, ResumeKind)>
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
    O: Optimizer<M, B>,
{
    let latest = run_dir.join(Slot::Latest.dir_name());
    if latest.join(META_FILE).is_file() {
        let state = read_meta(&latest)?;
        let model = load_model_lenient(model, &latest, device);
        let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
        let optimizer = match recorder.load(latest.join(OPTIMIZER_FILE), device) {
            Ok(record) => optimizer.load_record(record),
            Err(err) => {
                tracing::warn!(error = %err, "optimizer state unreadable, reinitializing");
                optimizer
            }
        };
        tracing::info!(
            iteration = state.iteration,
            best_psnr = state.best_psnr,
            "resumed from latest checkpoint"
        );
        return Ok((model, optimizer, state, ResumeKind::Latest));
    }

    if let Some(pretrained) = pretrained {
        let slot = pretrained.join(Slot::Latest.dir_name());
        let meta = read_meta(&slot).with_context(|| {
            format!("pretrained run at {} has no readable latest slot", pretrained.display())
        })?;
        let model = load_model_lenient(model, &slot, device);
        let state = TrainState { best_psnr: meta.best_psnr, ..TrainState::cold() };
        tracing::info!(
            source = %pretrained.display(),
            best_psnr = state.best_psnr,
            "seeded weights from pretrained checkpoint, starting a fresh run"
        );
        return Ok((model, optimizer, state, ResumeKind::Pretrained));
    }

    tracing::info!("no checkpoint found, cold start");
    Ok((model, optimizer, TrainState::cold(), ResumeKind::Cold))
}

/// Load slot weights into `model`; a record mismatch is recovered by
/// keeping whatever the model already holds, with a warning.
fn load_model_lenient<B: Backend, M: Module<B>>(model: M, dir: &Path, device: &B::Device) -> M {
    let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
    match model.clone().load_file(dir.join(MODEL_FILE), &recorder, device) {
        Ok(loaded) => loaded,
        Err(err) => {
            tracing::warn!(
                path = %dir.display(),
                error = %err,
                "model weights did not match the checkpoint, continuing with current values for unmatched parameters"
            );
            model
        }
    }
}

fn read_meta(dir: &Path) -> anyhow::Result<TrainState> {
    let path = dir.join(META_FILE);
    let file = File::open(&path).with_context(|| format!("opening {}", path.display()))?;
    let state = serde_json::from_reader(file).with_context(|| format!("parsing {}", path.display()))?;
    Ok(state)
}
