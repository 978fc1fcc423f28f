//! Reference reconstructions on disk: one subdirectory per sample, each
//! holding a `reconstruction.mpk` record.
//!
//! Samples are ordered by sorted folder name. Training pairs them with the
//! primary dataset purely by position, so the two directory trees must be
//! sorted identically; nothing here verifies content correspondence.

use std::path::{Path, PathBuf};

use anyhow::Context;
use burn::prelude::*;
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder, Recorder};

use crate::set::GaussianSplatSet;

/// Base name of the per-sample record; the recorder appends `.mpk`.
pub const RECONSTRUCTION_FILE: &str = "reconstruction";

/// Sorted directory listing of precomputed reference reconstructions.
pub struct ReferenceDataset {
    root: PathBuf,
    folders: Vec<String>,
}

impl ReferenceDataset {
    /// Scan `root` for sample subdirectories, sorted by name.
    pub fn open(root: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let root = root.into();
        let entries = std::fs::read_dir(&root)
            .with_context(|| format!("reading reference root {}", root.display()))?;
        let mut folders = Vec::new();
        for entry in entries {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                folders.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        folders.sort();
        tracing::debug!(root = %root.display(), samples = folders.len(), "opened reference dataset");
        Ok(Self { root, folders })
    }

    /// Number of sample folders.
    pub fn len(&self) -> usize {
        self.folders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.folders.is_empty()
    }

    /// Folder name of the sample at `index`.
    pub fn sample_name(&self, index: usize) -> Option<&str> {
        self.folders.get(index).map(String::as_str)
    }

    /// Load the reconstruction for one sample.
    ///
    /// A missing or unreadable record is not an error: it yields `None`
    /// with a warning, and the caller skips whatever depends on it.
    pub fn load<B: Backend>(&self, index: usize, device: &B::Device) -> Option<GaussianSplatSet<B>> {
        let folder = self.folders.get(index)?;
        let base = self.root.join(folder).join(RECONSTRUCTION_FILE);
        if !base.with_extension("mpk").is_file() {
            tracing::warn!(sample = %folder, "no reconstruction found, sample has no reference");
            return None;
        }
        let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
        match recorder.load(base, device) {
            Ok(record) => Some(GaussianSplatSet::from_record(record)),
            Err(err) => {
                tracing::warn!(sample = %folder, error = %err, "unreadable reconstruction, sample has no reference");
                None
            }
        }
    }
}

/// Persist one sample's reconstruction under `root/name/`.
pub fn write_sample<B: Backend>(
    root: &Path,
    name: &str,
    set: &GaussianSplatSet<B>,
) -> anyhow::Result<()> {
    set.validate()?;
    let dir = root.join(name);
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("creating reference folder {}", dir.display()))?;
    let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
    recorder
        .record(set.clone().into_record(), dir.join(RECONSTRUCTION_FILE))
        .map_err(|err| anyhow::anyhow!("writing reconstruction for {name}: {err}"))?;
    Ok(())
}
