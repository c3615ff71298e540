//! Test-phase export of whole-image translations

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{info, instrument, warn};

use crate::training::checkpoints::CheckpointManager;
use crate::training::config::TrainingConfig;
use crate::training::data::{DataPipeline, Dataset, InMemoryDataset};
use crate::training::session::TrainingSession;
use crate::utils::io::ensure_dir_exists;

/// Prefix of every exported file name
pub const EXPORT_PREFIX: &str = "Gen_from_";

/// What an export wrote
#[derive(Debug, Clone)]
pub struct ExportSummary {
    /// Whether trained weights were restored
    pub checkpoint_loaded: bool,
    /// Global step of the restored weights
    pub step: u64,
    /// Directory holding the outputs
    pub output_dir: PathBuf,
    /// Written files, A-domain sources first
    pub files: Vec<PathBuf>,
}

/// Output path for a source image id
pub fn export_path(output_dir: &Path, source_id: &str) -> PathBuf {
    output_dir.join(format!("{EXPORT_PREFIX}{source_id}.npy"))
}

/// Restore the latest checkpoint and translate every test image
///
/// A-domain images go through generator_G and B-domain images through
/// generator_F, in inference mode at whole-image size. Outputs keep the
/// generator's [-1, 1] range. Missing weights are reported and the export
/// runs with the fresh networks.
#[instrument(skip_all, fields(task = task_id))]
pub fn export(
    config: &TrainingConfig,
    task_id: &str,
    session: &mut TrainingSession,
    pipeline: &DataPipeline,
) -> Result<ExportSummary> {
    let manager = CheckpointManager::new(
        config.checkpointing.run_dir(task_id),
        config.checkpointing.model_name.clone(),
        task_id,
    );
    let outcome = manager.load(session);
    if outcome.found {
        info!(" [*] Load SUCCESS: step {}", outcome.step);
    } else {
        warn!(" [!] Load failed: exporting with untrained weights");
    }

    let output_dir = config.checkpointing.export_dir(task_id);
    ensure_dir_exists(&output_dir)
        .with_context(|| format!("Failed to create export directory {}", output_dir.display()))?;

    let mut files = translate_all(pipeline.test_a(), &output_dir, |x| session.translate_a_to_b(x))?;
    files.extend(translate_all(pipeline.test_b(), &output_dir, |y| session.translate_b_to_a(y))?);

    info!("Exported {} translations to {}", files.len(), output_dir.display());
    Ok(ExportSummary {
        checkpoint_loaded: outcome.found,
        step: outcome.step,
        output_dir,
        files,
    })
}

fn translate_all<F>(dataset: &InMemoryDataset, output_dir: &Path, translate: F) -> Result<Vec<PathBuf>>
where
    F: Fn(&candle_core::Tensor) -> Result<candle_core::Tensor>,
{
    let mut files = Vec::with_capacity(dataset.len());
    for sample in dataset.samples() {
        let output = translate(&sample.to_tensor()?)
            .with_context(|| format!("Failed to translate {}", sample.id))?;
        let path = export_path(output_dir, &sample.id);
        output
            .write_npy(&path)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        files.push(path);
    }
    Ok(files)
}
