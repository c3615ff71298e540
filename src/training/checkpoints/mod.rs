//! Checkpoint records and resume
//!
//! A record is a tensor file plus a JSON manifest named after the global step:
//!
//! ```text
//! <run_dir>/<model>.model-<step>.safetensors
//! <run_dir>/<model>.model-<step>.json
//! <run_dir>/checkpoint
//! ```
//!
//! The tensor file holds every variable of the four networks under
//! `params/<network>/<var>` (batch-norm statistics included) and both
//! optimizers' moments under `optim/<optimizer>/{m,v}/<network>/<var>`.
//! The `checkpoint` pointer names the latest record and is rewritten last.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use candle_core::{Tensor, Var};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::training::optimizers::{OptimizerScalars, OptimizerStateDict};
use crate::training::session::TrainingSession;
use crate::utils::io::{ensure_dir_exists, temp_sibling, write_file_atomic};

/// File name of the latest-record pointer
pub const POINTER_FILE: &str = "checkpoint";

const PARAMS_PREFIX: &str = "params/";
const OPTIM_PREFIX: &str = "optim/";

/// Manifest stored next to each tensor file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointManifest {
    /// Global step at save time
    pub step: u64,
    /// Epoch at save time
    pub epoch: usize,
    /// Learning rate of the last update
    pub learning_rate: f64,
    /// Run identifier
    pub task_id: String,
    /// Model name used in file names
    pub model_name: String,
    /// Tensor file name, relative to the run directory
    pub tensor_file: String,
    /// Generator optimizer scalars
    pub generator_optimizer: OptimizerScalars,
    /// Discriminator optimizer scalars
    pub discriminator_optimizer: OptimizerScalars,
    /// When the record was written
    pub timestamp: DateTime<Utc>,
}

/// Contents of the pointer file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointPointer {
    /// Record name of the latest checkpoint
    pub latest: String,
    /// Every record written to this directory, oldest first
    pub records: Vec<String>,
}

/// Result of [`CheckpointManager::load`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadOutcome {
    /// Whether a record was restored
    pub found: bool,
    /// Restored global step, 0 when nothing was found
    pub step: u64,
}

impl LoadOutcome {
    fn missing() -> Self {
        Self { found: false, step: 0 }
    }
}

/// Saves and restores [`TrainingSession`]s in one run directory
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    run_dir: PathBuf,
    model_name: String,
    task_id: String,
}

/// A record read from disk and checked against a session, not yet applied
struct ValidatedRecord {
    manifest: CheckpointManifest,
    params: Vec<(Var, Tensor)>,
    generator_state: OptimizerStateDict,
    discriminator_state: OptimizerStateDict,
}

impl CheckpointManager {
    /// Create a manager; nothing is touched on disk until the first save
    pub fn new(run_dir: impl Into<PathBuf>, model_name: impl Into<String>, task_id: impl Into<String>) -> Self {
        Self {
            run_dir: run_dir.into(),
            model_name: model_name.into(),
            task_id: task_id.into(),
        }
    }

    /// Directory holding the records
    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// Record name for a step
    pub fn record_name(&self, step: u64) -> String {
        format!("{}.model-{}", self.model_name, step)
    }

    fn tensor_path(&self, record: &str) -> PathBuf {
        self.run_dir.join(format!("{record}.safetensors"))
    }

    fn manifest_path(&self, record: &str) -> PathBuf {
        self.run_dir.join(format!("{record}.json"))
    }

    fn pointer_path(&self) -> PathBuf {
        self.run_dir.join(POINTER_FILE)
    }

    /// Read the pointer file, if there is one
    pub fn read_pointer(&self) -> Result<Option<CheckpointPointer>> {
        let path = self.pointer_path();
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let pointer = serde_json::from_str(&content)
            .with_context(|| format!("Malformed checkpoint pointer {}", path.display()))?;
        Ok(Some(pointer))
    }

    /// Record names listed in the pointer, oldest first
    pub fn list_records(&self) -> Result<Vec<String>> {
        Ok(self.read_pointer()?.map(|p| p.records).unwrap_or_default())
    }

    /// Write a record for the session's current step and move the pointer to it
    #[instrument(skip(self, session), fields(step = session.global_step))]
    pub fn save(&self, session: &TrainingSession, epoch: usize, learning_rate: f64) -> Result<PathBuf> {
        ensure_dir_exists(&self.run_dir).with_context(|| {
            format!("Failed to create checkpoint directory {}", self.run_dir.display())
        })?;

        let step = session.global_step;
        let record = self.record_name(step);
        let tensor_path = self.tensor_path(&record);

        let mut tensors: HashMap<String, Tensor> = HashMap::new();
        for network in session.models.networks() {
            let data = network
                .varmap()
                .data()
                .lock()
                .map_err(|_| anyhow!("parameter map of '{}' is poisoned", network.name()))?;
            for (name, var) in data.iter() {
                tensors.insert(
                    format!("{PARAMS_PREFIX}{}/{name}", network.name()),
                    var.as_tensor().detach(),
                );
            }
        }

        let generator_state = session.generator_optimizer.state_dict()?;
        let discriminator_state = session.discriminator_optimizer.state_dict()?;
        for (optimizer, state) in [
            (session.generator_optimizer.name(), &generator_state),
            (session.discriminator_optimizer.name(), &discriminator_state),
        ] {
            for (key, tensor) in &state.tensors {
                tensors.insert(format!("{OPTIM_PREFIX}{optimizer}/{key}"), tensor.clone());
            }
        }

        let temp_tensor_path = temp_sibling(&tensor_path);
        candle_core::safetensors::save(&tensors, &temp_tensor_path)
            .with_context(|| format!("Failed to write {}", temp_tensor_path.display()))?;
        std::fs::rename(&temp_tensor_path, &tensor_path)
            .with_context(|| format!("Failed to move {} into place", tensor_path.display()))?;

        let manifest = CheckpointManifest {
            step,
            epoch,
            learning_rate,
            task_id: self.task_id.clone(),
            model_name: self.model_name.clone(),
            tensor_file: format!("{record}.safetensors"),
            generator_optimizer: generator_state.scalars,
            discriminator_optimizer: discriminator_state.scalars,
            timestamp: Utc::now(),
        };
        write_file_atomic(
            self.manifest_path(&record),
            serde_json::to_string_pretty(&manifest)?.as_bytes(),
        )?;

        let mut records = match self.read_pointer() {
            Ok(pointer) => pointer.map(|p| p.records).unwrap_or_default(),
            Err(e) => {
                warn!("Rebuilding unreadable checkpoint pointer: {:#}", e);
                Vec::new()
            }
        };
        if !records.contains(&record) {
            records.push(record.clone());
        }
        let pointer = CheckpointPointer {
            latest: record,
            records,
        };
        write_file_atomic(
            self.pointer_path(),
            serde_json::to_string_pretty(&pointer)?.as_bytes(),
        )?;

        info!("Saved checkpoint at step {} to {}", step, tensor_path.display());
        Ok(tensor_path)
    }

    /// Restore the latest record into `session`
    ///
    /// The record is read and checked in full before anything is applied. A
    /// missing or unusable record leaves the session untouched and reports
    /// `found == false`.
    #[instrument(skip(self, session))]
    pub fn load(&self, session: &mut TrainingSession) -> LoadOutcome {
        match self.read_validated(session) {
            Ok(Some(record)) => match Self::apply(session, record) {
                Ok(step) => {
                    info!("Restored checkpoint at step {} from {}", step, self.run_dir.display());
                    LoadOutcome { found: true, step }
                }
                // Only reachable if a validated tensor cannot be copied in.
                Err(e) => {
                    warn!("Failed to apply checkpoint: {:#}", e);
                    LoadOutcome::missing()
                }
            },
            Ok(None) => {
                warn!("No checkpoint found in {}", self.run_dir.display());
                LoadOutcome::missing()
            }
            Err(e) => {
                warn!("Ignoring unreadable checkpoint in {}: {:#}", self.run_dir.display(), e);
                LoadOutcome::missing()
            }
        }
    }

    fn read_validated(&self, session: &TrainingSession) -> Result<Option<ValidatedRecord>> {
        let Some(pointer) = self.read_pointer()? else {
            return Ok(None);
        };
        let manifest_path = self.manifest_path(&pointer.latest);
        let manifest: CheckpointManifest = serde_json::from_str(
            &std::fs::read_to_string(&manifest_path)
                .with_context(|| format!("Failed to read {}", manifest_path.display()))?,
        )
        .with_context(|| format!("Malformed manifest {}", manifest_path.display()))?;
        if self.record_name(manifest.step) != pointer.latest {
            return Err(anyhow!(
                "manifest step {} does not match record '{}'",
                manifest.step,
                pointer.latest
            ));
        }

        let tensor_path = self.run_dir.join(&manifest.tensor_file);
        let mut tensors = candle_core::safetensors::load(&tensor_path, session.device())
            .with_context(|| format!("Failed to read {}", tensor_path.display()))?;
        debug!("Read {} tensors from {}", tensors.len(), tensor_path.display());

        let params = Self::match_parameters(session, &mut tensors)?;

        let generator_state = Self::extract_optimizer_state(
            session.generator_optimizer.name(),
            manifest.generator_optimizer.clone(),
            &mut tensors,
        );
        let discriminator_state = Self::extract_optimizer_state(
            session.discriminator_optimizer.name(),
            manifest.discriminator_optimizer.clone(),
            &mut tensors,
        );
        session
            .generator_optimizer
            .validate_state_dict(&generator_state)
            .context("Generator optimizer state does not fit")?;
        session
            .discriminator_optimizer
            .validate_state_dict(&discriminator_state)
            .context("Discriminator optimizer state does not fit")?;

        if let Some(extra) = tensors.keys().next() {
            return Err(anyhow!("unexpected tensor '{extra}' in checkpoint"));
        }

        Ok(Some(ValidatedRecord {
            manifest,
            params,
            generator_state,
            discriminator_state,
        }))
    }

    /// Pair every session variable with its saved tensor, removing them from `tensors`
    fn match_parameters(
        session: &TrainingSession,
        tensors: &mut HashMap<String, Tensor>,
    ) -> Result<Vec<(Var, Tensor)>> {
        let mut params = Vec::new();
        for network in session.models.networks() {
            let data = network
                .varmap()
                .data()
                .lock()
                .map_err(|_| anyhow!("parameter map of '{}' is poisoned", network.name()))?;
            for (name, var) in data.iter() {
                let key = format!("{PARAMS_PREFIX}{}/{name}", network.name());
                let saved = tensors
                    .remove(&key)
                    .ok_or_else(|| anyhow!("checkpoint is missing '{key}'"))?;
                if saved.dims() != var.dims() {
                    return Err(anyhow!(
                        "'{key}' has shape {:?} in checkpoint, network expects {:?}",
                        saved.dims(),
                        var.dims()
                    ));
                }
                let saved = saved.to_dtype(var.dtype())?;
                params.push((var.clone(), saved));
            }
        }
        if let Some(extra) = tensors.keys().find(|k| k.starts_with(PARAMS_PREFIX)) {
            return Err(anyhow!("checkpoint parameter '{extra}' matches no network variable"));
        }
        Ok(params)
    }

    fn extract_optimizer_state(
        optimizer: &str,
        scalars: OptimizerScalars,
        tensors: &mut HashMap<String, Tensor>,
    ) -> OptimizerStateDict {
        let prefix = format!("{OPTIM_PREFIX}{optimizer}/");
        let keys: Vec<String> = tensors.keys().filter(|k| k.starts_with(&prefix)).cloned().collect();
        let mut state_tensors = HashMap::new();
        for key in keys {
            if let Some(tensor) = tensors.remove(&key) {
                state_tensors.insert(key[prefix.len()..].to_string(), tensor);
            }
        }
        OptimizerStateDict {
            scalars,
            tensors: state_tensors,
        }
    }

    fn apply(session: &mut TrainingSession, record: ValidatedRecord) -> Result<u64> {
        for (var, tensor) in &record.params {
            var.set(tensor)?;
        }
        session.generator_optimizer.load_state_dict(record.generator_state)?;
        session.discriminator_optimizer.load_state_dict(record.discriminator_state)?;
        session.global_step = record.manifest.step;
        Ok(record.manifest.step)
    }
}
