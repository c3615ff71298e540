//! Training configuration for the cycle-identity trainer
//!
//! The configuration is split into sections (data, model, optimizer, loss,
//! training, checkpointing, runtime). Every section has a `Default`, the whole
//! structure round-trips through JSON or YAML, and [`TrainingConfig::validate`]
//! rejects anything the trainer could not run with.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_core::Device;
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::networks::{DiscriminatorConfig, GeneratorConfig};
use crate::utils::task_id;

/// Main training configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct TrainingConfig {
    /// Data pipeline configuration
    pub data: DataConfig,

    /// Network widths
    pub model: ModelConfig,

    /// Optimization configuration
    pub optimizer: OptimizerConfig,

    /// Loss weights
    pub loss: LossConfig,

    /// Training loop parameters
    pub training: TrainingParams,

    /// Checkpointing and output locations
    pub checkpointing: CheckpointingConfig,

    /// Runtime configuration
    pub runtime: RuntimeConfig,
}

/// What the binary does
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// Train the model pair
    Train,
    /// Export translations of the test set
    Test,
}

/// How A and B patches are matched within a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PairingMode {
    /// Same example index and crop for both domains
    Paired,
    /// Independent example index and crop per domain
    Unpaired,
}

/// How batches are drawn within an epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SamplingMode {
    /// Random crops from random examples, capped at `steps_per_epoch`
    Random,
    /// One ordered pass over the examples
    Sequential,
}

/// Data pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    /// A-domain training images
    pub train_a_dir: PathBuf,

    /// B-domain training images
    pub train_b_dir: PathBuf,

    /// A-domain test images
    pub test_a_dir: PathBuf,

    /// B-domain test images
    pub test_b_dir: PathBuf,

    /// Side length of the whole images
    pub whole_size: usize,

    /// Side length of training patches
    pub patch_size: usize,

    /// Image channel depth
    pub channels: usize,

    /// Raw value mapped to -1
    pub value_min: f32,

    /// Raw value mapped to 1
    pub value_max: f32,

    /// Patches per batch
    pub batch_size: usize,

    /// Pairing between domains
    pub pairing: PairingMode,

    /// Sampling strategy
    pub sampling: SamplingMode,

    /// Background patch workers
    pub num_workers: usize,

    /// Bounded prefetch queue depth
    pub prefetch_depth: usize,
}

/// Network widths
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Generator feature width
    pub ngf: usize,

    /// Width of the generator's last conv block
    pub nglf: usize,

    /// Discriminator base width
    pub ndf: usize,

    /// Residual modules per generator
    pub num_modules: usize,
}

/// Optimizer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    /// Initial learning rate
    pub learning_rate: f64,

    /// Adam beta1
    pub beta1: f64,

    /// Adam beta2
    pub beta2: f64,

    /// Adam epsilon
    pub eps: f64,

    /// Learning rate schedule
    pub scheduler: SchedulerConfig,
}

/// Learning rate schedule configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Scheduler type
    pub scheduler_type: SchedulerType,

    /// Last epoch trained at the initial rate (linear decay)
    pub decay_epoch: usize,

    /// Steps per decay period (exponential decay)
    pub decay_steps: u64,

    /// Multiplier per decay period (exponential decay)
    pub decay_rate: f64,
}

/// Learning rate scheduler types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerType {
    /// Linear decay to zero at `end_epoch`, starting after `decay_epoch`
    LinearDecay,
    /// Exponential decay by global step
    Exponential,
    /// Fixed learning rate
    Constant,
}

/// Loss weights
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LossConfig {
    /// Cycle-consistency weight
    pub lambda_cycle: f64,

    /// Identity weight
    pub gamma_identity: f64,
}

/// Training loop parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingParams {
    /// Train or export
    pub phase: Phase,

    /// Exclusive upper bound on epochs
    pub end_epoch: usize,

    /// Steps per epoch
    pub steps_per_epoch: u64,

    /// Progress/summary period in global steps
    pub print_freq: u64,

    /// Checkpoint period in global steps
    pub save_freq: u64,

    /// Resume from the latest checkpoint
    pub continue_train: bool,

    /// Seed for crop plans and sample selection
    pub seed: u64,
}

/// Checkpointing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointingConfig {
    /// Root directory for checkpoints and summaries
    pub checkpoint_dir: PathBuf,

    /// Model name used in record file names
    pub model_name: String,

    /// Run identifier, generated from the UTC time when unset
    pub task_id: Option<String>,

    /// Root directory for exported translations
    pub test_npy_save_dir: PathBuf,
}

/// Runtime configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Device type
    pub device_type: DeviceType,

    /// Device ordinal for accelerators
    pub device_id: usize,
}

/// Device types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    /// Host CPU
    Cpu,
    /// NVIDIA GPU
    Cuda,
    /// Apple GPU
    Metal,
}

impl TrainingConfig {
    /// Create a new training configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from a JSON or YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        crate::utils::config::load_config(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))
    }

    /// Save configuration to a JSON or YAML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        crate::utils::config::save_config(self, path)
            .with_context(|| format!("Failed to write configuration to {}", path.display()))
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        let data = &self.data;
        if data.whole_size == 0 || data.patch_size == 0 {
            return Err(Error::config("Image and patch sizes must be greater than 0"));
        }
        if data.patch_size > data.whole_size {
            return Err(Error::config(format!(
                "Patch size {} exceeds whole image size {}",
                data.patch_size, data.whole_size
            )));
        }
        if data.channels == 0 {
            return Err(Error::config("Channel depth must be greater than 0"));
        }
        if !(data.value_max > data.value_min) {
            return Err(Error::config("value_max must be greater than value_min"));
        }
        if data.batch_size == 0 {
            return Err(Error::config("Batch size must be greater than 0"));
        }
        if data.num_workers == 0 || data.prefetch_depth == 0 {
            return Err(Error::config("Worker count and prefetch depth must be greater than 0"));
        }

        let model = &self.model;
        if model.ngf == 0 || model.nglf == 0 || model.ndf == 0 {
            return Err(Error::config("Network widths must be greater than 0"));
        }
        if self.discriminator_config().score_map_size(data.patch_size).is_none() {
            return Err(Error::config(format!(
                "Patch size {} is too small for the discriminator",
                data.patch_size
            )));
        }

        let opt = &self.optimizer;
        if !(opt.learning_rate > 0.0) {
            return Err(Error::config("Learning rate must be positive"));
        }
        if !(0.0..1.0).contains(&opt.beta1) || !(0.0..1.0).contains(&opt.beta2) {
            return Err(Error::config("Adam betas must be in [0.0, 1.0)"));
        }
        if !(opt.eps > 0.0) {
            return Err(Error::config("Adam epsilon must be positive"));
        }

        let training = &self.training;
        if training.end_epoch == 0 || training.steps_per_epoch == 0 {
            return Err(Error::config("end_epoch and steps_per_epoch must be greater than 0"));
        }
        if training.print_freq == 0 || training.save_freq == 0 {
            return Err(Error::config("print_freq and save_freq must be greater than 0"));
        }

        let sched = &opt.scheduler;
        match sched.scheduler_type {
            SchedulerType::Exponential if sched.decay_steps == 0 => {
                return Err(Error::config("decay_steps must be greater than 0"));
            }
            SchedulerType::Exponential if !(sched.decay_rate > 0.0 && sched.decay_rate <= 1.0) => {
                return Err(Error::config("decay_rate must be in (0.0, 1.0]"));
            }
            _ => {}
        }

        if self.loss.lambda_cycle < 0.0 || self.loss.gamma_identity < 0.0 {
            return Err(Error::config("Loss weights must be non-negative"));
        }
        if !self.loss.lambda_cycle.is_finite() || !self.loss.gamma_identity.is_finite() {
            return Err(Error::config("Loss weights must be finite"));
        }

        if self.checkpointing.model_name.is_empty() {
            return Err(Error::config("Model name must not be empty"));
        }

        Ok(())
    }

    /// Generator configuration derived from the model and data sections
    pub fn generator_config(&self) -> GeneratorConfig {
        GeneratorConfig {
            channels: self.data.channels,
            ngf: self.model.ngf,
            nglf: self.model.nglf,
            num_modules: self.model.num_modules,
        }
    }

    /// Discriminator configuration derived from the model and data sections
    pub fn discriminator_config(&self) -> DiscriminatorConfig {
        DiscriminatorConfig {
            channels: self.data.channels,
            ndf: self.model.ndf,
        }
    }

    /// Fill in the task id from the current time if it is unset, and return it
    pub fn resolve_task_id(&mut self) -> String {
        self.checkpointing
            .task_id
            .get_or_insert_with(task_id::generate)
            .clone()
    }
}

impl CheckpointingConfig {
    /// Directory holding checkpoint records for a run
    pub fn run_dir(&self, task_id: &str) -> PathBuf {
        self.checkpoint_dir.join(task_id)
    }

    /// Directory holding summaries for a run
    pub fn log_dir(&self, task_id: &str) -> PathBuf {
        self.checkpoint_dir.join(format!("{task_id}_tb"))
    }

    /// Directory receiving exported translations for a run
    pub fn export_dir(&self, task_id: &str) -> PathBuf {
        self.test_npy_save_dir.join(task_id)
    }
}

impl RuntimeConfig {
    /// Open the configured device
    pub fn device(&self) -> crate::Result<Device> {
        let device = match self.device_type {
            DeviceType::Cpu => Device::Cpu,
            DeviceType::Cuda => Device::new_cuda(self.device_id)?,
            DeviceType::Metal => Device::new_metal(self.device_id)?,
        };
        Ok(device)
    }
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            train_a_dir: PathBuf::from("./data/train/A"),
            train_b_dir: PathBuf::from("./data/train/B"),
            test_a_dir: PathBuf::from("./data/test/A"),
            test_b_dir: PathBuf::from("./data/test/B"),
            whole_size: 512,
            patch_size: 56,
            channels: 1,
            value_min: -1024.0,
            value_max: 3072.0,
            batch_size: 10,
            pairing: PairingMode::Unpaired,
            sampling: SamplingMode::Random,
            num_workers: num_cpus::get().clamp(1, 4),
            prefetch_depth: 8,
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            ngf: 128,
            nglf: 15,
            ndf: 64,
            num_modules: 6,
        }
    }
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            learning_rate: 2e-4,
            beta1: 0.5,
            beta2: 0.999,
            eps: 1e-8,
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            scheduler_type: SchedulerType::LinearDecay,
            decay_epoch: 100,
            decay_steps: 100_000,
            decay_rate: 0.5,
        }
    }
}

impl Default for LossConfig {
    fn default() -> Self {
        Self {
            lambda_cycle: 10.0,
            gamma_identity: 5.0,
        }
    }
}

impl Default for TrainingParams {
    fn default() -> Self {
        Self {
            phase: Phase::Train,
            end_epoch: 160,
            steps_per_epoch: 3000,
            print_freq: 100,
            save_freq: 1000,
            continue_train: true,
            seed: 0,
        }
    }
}

impl Default for CheckpointingConfig {
    fn default() -> Self {
        Self {
            checkpoint_dir: PathBuf::from("./checkpoint"),
            model_name: "cycle_identity".to_string(),
            task_id: None,
            test_npy_save_dir: PathBuf::from("./test"),
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            device_type: DeviceType::Cpu,
            device_id: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = TrainingConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_serialization() {
        let config = TrainingConfig::default();

        let json_str = serde_json::to_string(&config).unwrap();
        let deserialized: TrainingConfig = serde_json::from_str(&json_str).unwrap();
        assert_eq!(config.model.ngf, deserialized.model.ngf);

        let yaml_str = serde_yaml::to_string(&config).unwrap();
        let deserialized: TrainingConfig = serde_yaml::from_str(&yaml_str).unwrap();
        assert_eq!(config.optimizer.learning_rate, deserialized.optimizer.learning_rate);
        assert_eq!(
            deserialized.optimizer.scheduler.scheduler_type,
            SchedulerType::LinearDecay
        );
    }

    #[test]
    fn test_config_file_operations() {
        let config = TrainingConfig::default();

        let json_file = NamedTempFile::new().unwrap();
        let json_path = json_file.path().with_extension("json");
        config.to_file(&json_path).unwrap();
        let loaded_config = TrainingConfig::from_file(&json_path).unwrap();
        assert_eq!(config.data.batch_size, loaded_config.data.batch_size);

        let yaml_file = NamedTempFile::new().unwrap();
        let yaml_path = yaml_file.path().with_extension("yaml");
        config.to_file(&yaml_path).unwrap();
        let loaded_config = TrainingConfig::from_file(&yaml_path).unwrap();
        assert_eq!(config.training.end_epoch, loaded_config.training.end_epoch);
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let yaml = "loss:\n  lambda_cycle: 3.0\ndata:\n  pairing: paired\n";
        let config: TrainingConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.loss.lambda_cycle, 3.0);
        assert_eq!(config.loss.gamma_identity, 5.0);
        assert_eq!(config.data.pairing, PairingMode::Paired);
        assert_eq!(config.data.sampling, SamplingMode::Random);
    }

    #[test]
    fn test_config_validation() {
        let mut config = TrainingConfig::default();
        assert!(config.validate().is_ok());

        config.loss.gamma_identity = -1.0;
        assert!(config.validate().unwrap_err().is_configuration());

        config = TrainingConfig::default();
        config.data.patch_size = config.data.whole_size + 1;
        assert!(config.validate().is_err());

        config = TrainingConfig::default();
        config.data.patch_size = 16;
        assert!(config.validate().is_err());

        config = TrainingConfig::default();
        config.optimizer.learning_rate = -0.1;
        assert!(config.validate().is_err());

        config = TrainingConfig::default();
        config.data.batch_size = 0;
        assert!(config.validate().is_err());

        // Linear decay that never starts keeps the base rate
        config = TrainingConfig::default();
        config.optimizer.scheduler.scheduler_type = SchedulerType::LinearDecay;
        config.optimizer.scheduler.decay_epoch = config.training.end_epoch;
        assert!(config.validate().is_ok());

        config.optimizer.scheduler.scheduler_type = SchedulerType::Exponential;
        config.optimizer.scheduler.decay_steps = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_resolve_task_id() {
        let mut config = TrainingConfig::default();
        config.checkpointing.task_id = Some("run1".to_string());
        assert_eq!(config.resolve_task_id(), "run1");
        assert_eq!(config.checkpointing.log_dir("run1"), PathBuf::from("./checkpoint/run1_tb"));

        config.checkpointing.task_id = None;
        let generated = config.resolve_task_id();
        assert_eq!(generated.len(), "20200630_141600".len());
        assert_eq!(config.checkpointing.task_id.as_deref(), Some(generated.as_str()));
    }
}
