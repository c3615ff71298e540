//! Training infrastructure for cycle-consistent image translation
//!
//! # Main Components
//!
//! - **Configuration**: sectioned training configuration with validation
//! - **Data**: two-domain datasets, patch batching and the prefetching loader
//! - **Loss**: cycle, identity and least-squares adversarial objectives
//! - **Optimizers**: per-role Adam with injected learning rate schedules
//! - **Session**: networks, optimizers and global step as one unit
//! - **Checkpoints**: step-keyed records with a latest-record pointer
//! - **Metrics**: rolling loss averages, PSNR and JSON-lines summaries
//! - **Trainer**: the epoch/step orchestrator
//! - **Inference**: test-phase export of translated images
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use cycleid::training::{CycleTrainer, DataPipeline, TrainingConfig, TrainingSession};
//!
//! let config = TrainingConfig::from_file("config.yaml")?;
//! let device = config.runtime.device()?;
//! let session = TrainingSession::from_config(&config, device)?;
//! let pipeline = DataPipeline::for_training(&config.data, &config.training)?;
//!
//! let mut trainer = CycleTrainer::new(config, session, pipeline)?;
//! let result = trainer.train().await?;
//! ```

pub mod checkpoints;
pub mod config;
pub mod data;
pub mod inference;
pub mod loss;
pub mod metrics;
pub mod optimizers;
pub mod session;
pub mod trainer;

// Tests module
#[cfg(test)]
pub mod tests;

// Configuration re-exports
pub use config::{
    CheckpointingConfig, DataConfig, DeviceType, LossConfig, ModelConfig, OptimizerConfig,
    PairingMode, Phase, RuntimeConfig, SamplingMode, SchedulerConfig, SchedulerType,
    TrainingConfig, TrainingParams,
};

// Trainer re-exports
pub use trainer::{
    CycleTrainer, SamplePsnr, TrainingEvent, TrainingResult, TrainingState, TrainingStatus,
};

// Session re-exports
pub use session::{StepReport, TrainingSession};

// Data re-exports
pub use data::{
    rescale, DataLoader, DataLoaderConfig, DataPipeline, Dataset, ImageSample, InMemoryDataset,
    NpyImageDataset, PatchPair,
};

// Checkpoint re-exports
pub use checkpoints::{CheckpointManager, CheckpointManifest, CheckpointPointer, LoadOutcome};

// Metrics re-exports
pub use metrics::{psnr, JsonlSummaryWriter, MetricsTracker, SummaryWriter};

// Optimizer re-exports
pub use optimizers::{
    create_optimizer, create_scheduler, AdamOptimizer, ConstantScheduler, ExponentialScheduler,
    LinearDecayScheduler, Optimizer, Scheduler,
};

// Loss re-exports
pub use loss::{LossComposer, LossScalars, LossTerms};

// Inference re-exports
pub use inference::{export, ExportSummary};

/// Training result type alias
pub type Result<T> = anyhow::Result<T>;
