//! Training orchestrator for cycle-consistent image translation
//!
//! [`CycleTrainer`] drives epochs over the training stream, applies one
//! [`TrainingSession::train_step`] per batch, and on the configured cadence
//! logs progress, emits summaries, checks a test sample and saves a
//! checkpoint. A resumed run continues from the restored global step and
//! replays the same batch order as an uninterrupted run.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use candle_core::Tensor;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, warn};

use crate::training::checkpoints::CheckpointManager;
use crate::training::config::TrainingConfig;
use crate::training::data::{DataPipeline, Dataset, PatchPair};
use crate::training::loss::{LossComposer, LossScalars};
use crate::training::metrics::{psnr, JsonlSummaryWriter, MetricsTracker, SummaryWriter, SIGNED_UNIT_RANGE};
use crate::training::optimizers::{create_scheduler, Scheduler};
use crate::training::session::{StepReport, TrainingSession};

/// Window of the rolling loss averages on progress lines
const SMOOTHING_WINDOW: usize = 100;

/// Main trainer
pub struct CycleTrainer {
    /// Training configuration
    config: TrainingConfig,

    /// Run identifier
    task_id: String,

    /// Networks, optimizers and global step
    session: TrainingSession,

    /// Training stream and test sets
    pipeline: DataPipeline,

    /// Objective weights
    composer: LossComposer,

    /// Learning rate schedule
    scheduler: Box<dyn Scheduler + Send + Sync>,

    /// Checkpoint manager
    checkpoint_manager: CheckpointManager,

    /// Metrics tracker
    metrics: MetricsTracker,

    /// Summary sink, opened on first use when not injected
    summary: Option<Box<dyn SummaryWriter>>,

    /// Training state
    state: TrainingState,

    /// Picks sample-check images
    rng: StdRng,

    /// Set to end training after the current step
    stop_flag: Arc<AtomicBool>,

    /// Event channel for monitoring
    event_tx: Option<mpsc::UnboundedSender<TrainingEvent>>,
}

/// Training state tracking
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingState {
    /// Current epoch
    pub epoch: usize,

    /// Batches consumed in the current epoch, including skipped ones
    pub step_in_epoch: usize,

    /// Global step across all epochs
    pub global_step: u64,

    /// Step the run started from
    pub start_step: u64,

    /// Training start time
    pub start_time: DateTime<Utc>,

    /// Training status
    pub status: TrainingStatus,

    /// Learning rate of the last update
    pub current_lr: f64,

    /// Path of the last checkpoint written by this run
    pub last_checkpoint: Option<PathBuf>,
}

/// Training status enumeration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum TrainingStatus {
    NotStarted,
    Running,
    Stopped,
    Completed,
    Failed { error: String },
}

/// Training events for monitoring
#[derive(Debug, Clone)]
pub enum TrainingEvent {
    EpochStarted { epoch: usize, skipped: usize },
    EpochCompleted { epoch: usize, steps: usize },
    StepCompleted { step: u64, losses: LossScalars, lr: f64 },
    SampleChecked { step: u64, psnr: SamplePsnr },
    CheckpointSaved { step: u64, path: PathBuf },
    Stopped { step: u64 },
    TrainingCompleted { total_steps: u64 },
    Error { error: String },
}

/// PSNR values of one sample check, in dB
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SamplePsnr {
    /// Input A against target B
    pub input: f64,
    /// G(A) against B
    pub a_to_b: f64,
    /// F(B) against A
    pub b_to_a: f64,
}

/// Training result information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingResult {
    /// Training state at completion
    pub final_state: TrainingState,

    /// Losses of the last step
    pub last_losses: Option<LossScalars>,

    /// Training duration
    pub training_duration: Duration,

    /// Global step at completion
    pub total_steps: u64,

    /// Steps taken by this run
    pub steps_this_run: u64,

    /// Steps that produced a non-finite loss
    pub non_finite_steps: u64,

    /// Whether the run ended on the stop flag
    pub stopped: bool,
}

impl TrainingState {
    fn new() -> Self {
        Self {
            epoch: 0,
            step_in_epoch: 0,
            global_step: 0,
            start_step: 0,
            start_time: Utc::now(),
            status: TrainingStatus::NotStarted,
            current_lr: 0.0,
            last_checkpoint: None,
        }
    }
}

impl CycleTrainer {
    /// Create a new trainer instance
    ///
    /// The pipeline must carry a training loader. An unset task id is
    /// generated from the current time and written back into the config.
    pub fn new(mut config: TrainingConfig, session: TrainingSession, pipeline: DataPipeline) -> Result<Self> {
        config
            .validate()
            .context("Training configuration validation failed")?;
        if pipeline.train().is_none() {
            return Err(anyhow!("training needs a pipeline with a training loader"));
        }

        let task_id = config.resolve_task_id();
        let composer = LossComposer::new(config.loss.lambda_cycle, config.loss.gamma_identity)?;
        let scheduler = create_scheduler(&config.optimizer, config.training.end_epoch);
        let checkpoint_manager = CheckpointManager::new(
            config.checkpointing.run_dir(&task_id),
            config.checkpointing.model_name.clone(),
            task_id.clone(),
        );
        let rng = StdRng::seed_from_u64(config.training.seed);

        Ok(Self {
            config,
            task_id,
            session,
            pipeline,
            composer,
            scheduler,
            checkpoint_manager,
            metrics: MetricsTracker::new(SMOOTHING_WINDOW),
            summary: None,
            state: TrainingState::new(),
            rng,
            stop_flag: Arc::new(AtomicBool::new(false)),
            event_tx: None,
        })
    }

    /// Set up event monitoring
    pub fn with_event_monitoring(mut self, tx: mpsc::UnboundedSender<TrainingEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// Use a specific summary sink instead of the JSON-lines log
    pub fn with_summary_writer(mut self, writer: Box<dyn SummaryWriter>) -> Self {
        self.summary = Some(writer);
        self
    }

    /// Flag that ends training after the current step when set
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.stop_flag.clone()
    }

    /// Run identifier
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Current training state
    pub fn state(&self) -> &TrainingState {
        &self.state
    }

    /// The training session
    pub fn session(&self) -> &TrainingSession {
        &self.session
    }

    /// Give back the session, e.g. to export after training
    pub fn into_session(self) -> TrainingSession {
        self.session
    }

    /// Start training
    pub async fn train(&mut self) -> Result<TrainingResult> {
        info!("Starting cycle-identity training, task {}", self.task_id);
        let training_start = Instant::now();

        self.initialize_training().await?;

        let outcome = self.run_training_loop().await;

        // Pending summaries are flushed even when training failed.
        if let Some(mut writer) = self.summary.take() {
            if let Err(e) = writer.close().await {
                warn!("Failed to close summary writer: {:#}", e);
            }
        }

        let stopped = match outcome {
            Ok(stopped) => stopped,
            Err(e) => {
                let error_msg = format!("Training failed: {e:#}");
                error!("{}", error_msg);
                self.state.status = TrainingStatus::Failed {
                    error: error_msg.clone(),
                };
                self.send_event(TrainingEvent::Error { error: error_msg });
                return Err(e);
            }
        };

        self.state.status = if stopped {
            TrainingStatus::Stopped
        } else {
            TrainingStatus::Completed
        };
        let result = TrainingResult {
            final_state: self.state.clone(),
            last_losses: self.metrics.last().copied(),
            training_duration: training_start.elapsed(),
            total_steps: self.state.global_step,
            steps_this_run: self.state.global_step - self.state.start_step,
            non_finite_steps: self.metrics.non_finite_steps(),
            stopped,
        };

        info!(
            "Training {} at step {} after {:?}",
            if stopped { "stopped" } else { "completed" },
            result.total_steps,
            result.training_duration
        );
        self.send_event(TrainingEvent::TrainingCompleted {
            total_steps: result.total_steps,
        });
        Ok(result)
    }

    /// Resume state and open the summary sink
    async fn initialize_training(&mut self) -> Result<()> {
        self.state.status = TrainingStatus::Running;
        self.state.start_time = Utc::now();

        if self.config.training.continue_train {
            let outcome = self.checkpoint_manager.load(&mut self.session);
            if outcome.found {
                info!(" [*] Load SUCCESS: resuming from step {}", outcome.step);
            } else {
                info!(" [!] Load failed: training from scratch");
            }
        }
        self.state.global_step = self.session.global_step;
        self.state.start_step = self.session.global_step;

        if self.summary.is_none() {
            let log_dir = self.config.checkpointing.log_dir(&self.task_id);
            let writer = JsonlSummaryWriter::create(&log_dir).await?;
            self.summary = Some(Box::new(writer));
        }

        let g_params = self.session.generator_optimizer.parameter_count();
        let d_params = self.session.discriminator_optimizer.parameter_count();
        info!("Device: {:?}", self.session.device());
        info!("Parameter tensors: {} generator, {} discriminator", g_params, d_params);
        Ok(())
    }

    /// Main training loop; returns whether it ended on the stop flag
    async fn run_training_loop(&mut self) -> Result<bool> {
        // Sequential epochs may be shorter than steps_per_epoch
        let batches_per_epoch = self
            .pipeline
            .train()
            .ok_or_else(|| anyhow!("training loader missing"))?
            .num_batches() as u64;
        if batches_per_epoch == 0 {
            bail!("training loader yields no batches per epoch");
        }
        let start_epoch = (self.session.global_step / batches_per_epoch) as usize;
        let mut skip = (self.session.global_step % batches_per_epoch) as usize;
        let end_epoch = self.config.training.end_epoch;

        info!("Start point: step {}, epoch {}", self.session.global_step, start_epoch);

        for epoch in start_epoch..end_epoch {
            if self.stop_requested() {
                return Ok(true);
            }
            self.state.epoch = epoch;
            let stopped = self.train_epoch(epoch, skip).await?;
            skip = 0;
            if stopped {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Train for one epoch; returns whether it ended on the stop flag
    #[instrument(skip(self))]
    async fn train_epoch(&mut self, epoch: usize, skip: usize) -> Result<bool> {
        let mut stream = self
            .pipeline
            .train()
            .ok_or_else(|| anyhow!("training loader missing"))?
            .epoch_stream(epoch, skip);
        let total = skip + stream.total_batches();

        self.state.step_in_epoch = skip;
        self.send_event(TrainingEvent::EpochStarted { epoch, skipped: skip });

        let mut stopped = false;
        let outcome = loop {
            if self.stop_requested() {
                stopped = true;
                break Ok(());
            }
            let batch = match stream.next().await {
                Some(Ok(batch)) => batch,
                Some(Err(e)) => break Err(e.context("Failed to produce training batch")),
                None => break Ok(()),
            };
            if let Err(e) = self.process_batch(epoch, total, &batch) {
                break Err(e);
            }
        };

        // Workers are joined before the stream goes away.
        stream.shutdown().await;
        outcome?;

        if stopped {
            info!("Stop requested at step {}", self.state.global_step);
            self.send_event(TrainingEvent::Stopped {
                step: self.state.global_step,
            });
        } else {
            debug!("Epoch {} finished after {} batches", epoch, self.state.step_in_epoch);
            self.send_event(TrainingEvent::EpochCompleted {
                epoch,
                steps: self.state.step_in_epoch,
            });
        }
        Ok(stopped)
    }

    /// One optimization step plus the cadence-driven side work
    fn process_batch(&mut self, epoch: usize, epoch_total: usize, batch: &PatchPair) -> Result<()> {
        let lr = self.scheduler.learning_rate(self.session.global_step + 1, epoch);
        let report = self
            .session
            .train_step(&batch.x, &batch.y, &self.composer, lr)
            .with_context(|| format!("Training step {} failed", self.session.global_step + 1))?;

        self.state.global_step = report.global_step;
        self.state.step_in_epoch += 1;
        self.state.current_lr = lr;

        if !self.metrics.record(&report.losses) {
            warn!(
                "Non-finite loss at step {}: G {} D {}",
                report.global_step, report.losses.g_loss, report.losses.d_loss
            );
        }
        self.write_loss_summaries(&report);
        self.send_event(TrainingEvent::StepCompleted {
            step: report.global_step,
            losses: report.losses,
            lr,
        });

        let step = report.global_step;
        if step % self.config.training.print_freq == 0 {
            self.log_progress(epoch, epoch_total, lr);
            self.write_patch_image(&report);
            if let Err(e) = self.check_sample(step) {
                warn!("Sample check failed at step {}: {:#}", step, e);
            }
        }
        if step % self.config.training.save_freq == 0 {
            let path = self.checkpoint_manager.save(&self.session, epoch, lr)?;
            self.state.last_checkpoint = Some(path.clone());
            self.send_event(TrainingEvent::CheckpointSaved { step, path });
        }
        Ok(())
    }

    fn log_progress(&self, epoch: usize, epoch_total: usize, lr: f64) {
        let elapsed = (Utc::now() - self.state.start_time).num_milliseconds() as f64 / 1000.0;
        match self.metrics.smoothed() {
            Some(avg) => info!(
                "Epoch: {} {}/{} time: {:.1}s lr {:.3e}: G {:.4} (cycle {:.4}, identity {:.4}) D {:.4}",
                epoch,
                self.state.step_in_epoch,
                epoch_total,
                elapsed,
                lr,
                avg.g_loss,
                avg.cycle_loss,
                avg.identity_loss,
                avg.d_loss
            ),
            None => info!(
                "Epoch: {} {}/{} time: {:.1}s lr {:.3e}: no finite losses yet",
                epoch, self.state.step_in_epoch, epoch_total, elapsed, lr
            ),
        }
    }

    fn write_loss_summaries(&self, report: &StepReport) {
        let Some(writer) = &self.summary else {
            return;
        };
        let entries = report
            .losses
            .generator_entries()
            .into_iter()
            .chain(report.losses.discriminator_entries())
            .map(|(tag, value)| (tag, value as f64))
            .chain(std::iter::once(("Learning_rate/lr", report.learning_rate)));
        for (tag, value) in entries {
            if let Err(e) = writer.add_scalar(tag, value, report.global_step) {
                warn!("Dropping summary '{}': {:#}", tag, e);
                return;
            }
        }
    }

    fn write_patch_image(&self, report: &StepReport) {
        let Some(writer) = &self.summary else {
            return;
        };
        let image = Tensor::cat(&[&report.x, &report.y, &report.g_x, &report.f_y], 3)
            .map_err(anyhow::Error::from)
            .and_then(|image| writer.add_image("train_patch_image", &image, report.global_step));
        if let Err(e) = image {
            warn!("Dropping training patch image: {:#}", e);
        }
    }

    /// Translate one random test pair both ways and report PSNR
    ///
    /// The same index is used in both test domains.
    pub fn check_sample(&mut self, step: u64) -> Result<Option<SamplePsnr>> {
        let count = self.pipeline.test_a().len().min(self.pipeline.test_b().len());
        if count == 0 {
            debug!("No test images for the sample check");
            return Ok(None);
        }
        let index = self.rng.random_range(0..count);
        let x = self.pipeline.test_a().get(index)?.to_tensor()?;
        let y = self.pipeline.test_b().get(index)?.to_tensor()?;
        let x = x.to_device(self.session.device())?;
        let y = y.to_device(self.session.device())?;

        let g_x = self.session.translate_a_to_b(&x)?;
        let f_y = self.session.translate_b_to_a(&y)?;

        let sample = SamplePsnr {
            input: psnr(&x, &y, SIGNED_UNIT_RANGE)?,
            a_to_b: psnr(&y, &g_x, SIGNED_UNIT_RANGE)?,
            b_to_a: psnr(&x, &f_y, SIGNED_UNIT_RANGE)?,
        };
        debug!(
            "Sample {} PSNR: input {:.2} AtoB {:.2} BtoA {:.2}",
            index, sample.input, sample.a_to_b, sample.b_to_a
        );

        if let Some(writer) = &self.summary {
            let image = Tensor::cat(&[&x, &y, &g_x, &f_y], 3)?;
            let written = writer
                .add_image("test_whole_image", &image, step)
                .and_then(|_| writer.add_scalar("PSNR/1_psnr", sample.input, step))
                .and_then(|_| writer.add_scalar("PSNR/2_psnr_AtoB", sample.a_to_b, step))
                .and_then(|_| writer.add_scalar("PSNR/3_psnr_BtoA", sample.b_to_a, step));
            if let Err(e) = written {
                warn!("Dropping sample summaries: {:#}", e);
            }
        }

        self.send_event(TrainingEvent::SampleChecked { step, psnr: sample });
        Ok(Some(sample))
    }

    fn stop_requested(&self) -> bool {
        self.stop_flag.load(Ordering::SeqCst)
    }

    /// Send training event
    fn send_event(&self, event: TrainingEvent) {
        if let Some(tx) = &self.event_tx {
            if let Err(e) = tx.send(event) {
                debug!("Failed to send training event: {}", e);
            }
        }
    }
}
