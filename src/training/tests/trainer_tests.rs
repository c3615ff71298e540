//! Tests for trainer functionality

use anyhow::Result;
use approx::assert_relative_eq;
use std::sync::atomic::Ordering;
use tokio::sync::mpsc;

use crate::training::checkpoints::CheckpointManager;
use crate::training::config::{SamplingMode, SchedulerType};
use crate::training::loss::LossComposer;
use crate::training::metrics::{EventRecord, EventValue, EVENTS_FILE};
use crate::training::optimizers::create_scheduler;
use crate::training::trainer::{CycleTrainer, TrainingEvent, TrainingStatus};

use super::fixtures::TrainingTestFixture;
use super::test_utils::{create_test_config, create_test_session, random_batch, synthetic_dataset};

fn drain(rx: &mut mpsc::UnboundedReceiver<TrainingEvent>) -> Vec<TrainingEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn step_events(events: &[TrainingEvent]) -> Vec<(u64, f64)> {
    events
        .iter()
        .filter_map(|e| match e {
            TrainingEvent::StepCompleted { step, lr, .. } => Some((*step, *lr)),
            _ => None,
        })
        .collect()
}

#[test]
fn test_identity_loss_decreases_on_identical_domains() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let config = create_test_config(temp.path());
    let mut session = create_test_session(&config)?;
    let composer = LossComposer::new(10.0, 5.0)?;

    let batch = random_batch(4, 32);
    let first = session.train_step(&batch, &batch, &composer, 1e-3)?.losses;
    let mut last = first;
    for _ in 0..15 {
        last = session.train_step(&batch, &batch, &composer, 1e-3)?.losses;
    }

    assert!(first.all_finite() && last.all_finite());
    assert!(
        last.identity_loss < first.identity_loss,
        "identity loss went from {} to {}",
        first.identity_loss,
        last.identity_loss
    );
    assert_eq!(session.global_step, 16);
    Ok(())
}

#[test]
fn test_trainer_rejects_pipeline_without_loader() -> Result<()> {
    let fixture = TrainingTestFixture::new()?;
    let session = create_test_session(&fixture.config)?;
    let pipeline = crate::training::data::DataPipeline::new(
        None,
        super::test_utils::synthetic_dataset("a", &["x"], 32, 0.0),
        super::test_utils::synthetic_dataset("b", &["x"], 32, 0.0),
    );
    assert!(crate::training::CycleTrainer::new(fixture.config.clone(), session, pipeline).is_err());
    Ok(())
}

#[tokio::test]
async fn test_full_run_writes_checkpoints_and_events() -> Result<()> {
    let fixture = TrainingTestFixture::new()?;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut trainer = fixture.trainer()?.with_event_monitoring(tx);

    let result = trainer.train().await?;

    // 2 epochs x 3 steps
    assert_eq!(result.total_steps, 6);
    assert_eq!(result.steps_this_run, 6);
    assert!(!result.stopped);
    assert_eq!(result.final_state.status, TrainingStatus::Completed);
    assert!(result.last_losses.is_some());

    let events = drain(&mut rx);
    let steps = step_events(&events);
    assert_eq!(steps.iter().map(|(s, _)| *s).collect::<Vec<_>>(), vec![1, 2, 3, 4, 5, 6]);

    // Every step uses the scheduler's rate for that step
    let scheduler = create_scheduler(&fixture.config.optimizer, fixture.config.training.end_epoch);
    for (step, lr) in &steps {
        let epoch = ((step - 1) / 3) as usize;
        assert_relative_eq!(*lr, scheduler.learning_rate(*step, epoch));
    }

    let sample_checks = events
        .iter()
        .filter(|e| matches!(e, TrainingEvent::SampleChecked { .. }))
        .count();
    assert_eq!(sample_checks, 3); // steps 2, 4, 6

    let manager = CheckpointManager::new(
        fixture.config.checkpointing.run_dir("unit"),
        "cycle_identity",
        "unit",
    );
    assert_eq!(
        manager.list_records()?,
        vec!["cycle_identity.model-3".to_string(), "cycle_identity.model-6".to_string()]
    );

    let log_dir = fixture.config.checkpointing.log_dir("unit");
    let records: Vec<EventRecord> = std::fs::read_to_string(log_dir.join(EVENTS_FILE))?
        .lines()
        .map(serde_json::from_str)
        .collect::<std::result::Result<_, _>>()?;
    assert!(records
        .iter()
        .any(|r| r.tag == "Generator_loss/1_G_loss" && r.step == 6));
    assert!(records
        .iter()
        .any(|r| r.tag == "Discriminator_loss/5_D_loss_FY" && r.step == 1));
    assert!(records.iter().any(|r| r.tag == "PSNR/2_psnr_AtoB"));
    let image = records
        .iter()
        .find(|r| r.tag == "test_whole_image")
        .expect("sample image recorded");
    let EventValue::Image { path, shape } = &image.value else {
        panic!("expected an image event");
    };
    // Four whole images side by side
    assert_eq!(shape, &vec![1, 1, 32, 128]);
    assert!(log_dir.join(path).exists());
    Ok(())
}

#[tokio::test]
async fn test_resume_continues_mid_epoch_with_next_learning_rate() -> Result<()> {
    let fixture = TrainingTestFixture::new()?;

    // First run: one epoch with a checkpoint at step 2
    let mut first = fixture.config.clone();
    first.training.end_epoch = 1;
    first.training.save_freq = 2;
    first.training.continue_train = false;
    let result = fixture.trainer_with(first)?.train().await?;
    assert_eq!(result.total_steps, 3);

    // Second run resumes from step 2: epoch 0, one batch left
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut trainer = fixture.trainer()?.with_event_monitoring(tx);
    let result = trainer.train().await?;

    let events = drain(&mut rx);
    let started: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            TrainingEvent::EpochStarted { epoch, skipped } => Some((*epoch, *skipped)),
            _ => None,
        })
        .collect();
    assert_eq!(started, vec![(0, 2), (1, 0)]);

    let steps = step_events(&events);
    let scheduler = create_scheduler(&fixture.config.optimizer, fixture.config.training.end_epoch);
    assert_eq!(steps[0].0, 3);
    assert_relative_eq!(steps[0].1, scheduler.learning_rate(3, 0));
    assert_eq!(steps.last().map(|s| s.0), Some(6));

    assert_eq!(result.final_state.start_step, 2);
    assert_eq!(result.steps_this_run, 4);
    Ok(())
}

#[tokio::test]
async fn test_resume_with_short_sequential_epochs_matches_uninterrupted_run() -> Result<()> {
    let fixture = TrainingTestFixture::new()?;

    // Four images in batches of two: 2 batches per epoch, fewer than steps_per_epoch
    let mut config = fixture.config.clone();
    config.data.sampling = SamplingMode::Sequential;
    config.training.steps_per_epoch = 3;
    config.training.end_epoch = 3;
    config.training.save_freq = 4;
    config.optimizer.scheduler.scheduler_type = SchedulerType::LinearDecay;
    config.optimizer.scheduler.decay_epoch = 1;

    let mut uninterrupted = config.clone();
    uninterrupted.training.continue_train = false;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let result = fixture
        .trainer_with(uninterrupted)?
        .with_event_monitoring(tx)
        .train()
        .await?;
    assert_eq!(result.total_steps, 6);
    let full_steps = step_events(&drain(&mut rx));

    // Resume from the checkpoint at step 4: the last epoch, nothing to skip
    config.training.continue_train = true;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut trainer = fixture.trainer_with(config)?.with_event_monitoring(tx);
    let result = trainer.train().await?;

    assert_eq!(result.final_state.start_step, 4);
    assert_eq!(result.total_steps, 6);
    assert_eq!(result.steps_this_run, 2);

    let events = drain(&mut rx);
    let started: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            TrainingEvent::EpochStarted { epoch, skipped } => Some((*epoch, *skipped)),
            _ => None,
        })
        .collect();
    assert_eq!(started, vec![(2, 0)]);

    // Same steps at the same epoch-dependent learning rates
    let resumed_steps = step_events(&events);
    assert_eq!(resumed_steps.iter().map(|(s, _)| *s).collect::<Vec<_>>(), vec![5, 6]);
    for ((step, lr), (full_step, full_lr)) in resumed_steps.iter().zip(&full_steps[4..]) {
        assert_eq!(step, full_step);
        assert_relative_eq!(*lr, *full_lr);
    }
    assert_relative_eq!(resumed_steps[0].1, 0.5e-3);
    Ok(())
}

#[tokio::test]
async fn test_failed_sample_check_does_not_stop_training() -> Result<()> {
    let fixture = TrainingTestFixture::new()?;
    // Test images of different sizes cannot be compared
    let pipeline = fixture.pipeline_with_test_sets(
        &fixture.config,
        synthetic_dataset("test_A", &["p1.dcm"], 32, -0.5),
        synthetic_dataset("test_B", &["p1.dcm"], 16, -0.3),
    )?;
    let session = create_test_session(&fixture.config)?;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut trainer = CycleTrainer::new(fixture.config.clone(), session, pipeline)?
        .with_event_monitoring(tx);

    assert!(trainer.check_sample(0).is_err());
    let result = trainer.train().await?;

    assert_eq!(result.total_steps, 6);
    assert_eq!(result.final_state.status, TrainingStatus::Completed);
    let events = drain(&mut rx);
    assert!(!events
        .iter()
        .any(|e| matches!(e, TrainingEvent::SampleChecked { .. })));
    assert_eq!(step_events(&events).len(), 6);
    Ok(())
}

#[tokio::test]
async fn test_stop_flag_ends_training() -> Result<()> {
    let fixture = TrainingTestFixture::new()?;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut trainer = fixture.trainer()?.with_event_monitoring(tx);

    trainer.stop_handle().store(true, Ordering::SeqCst);
    let result = trainer.train().await?;

    assert!(result.stopped);
    assert_eq!(result.total_steps, 0);
    assert_eq!(result.final_state.status, TrainingStatus::Stopped);
    assert!(step_events(&drain(&mut rx)).is_empty());
    Ok(())
}

#[tokio::test]
async fn test_check_sample_reports_finite_psnr() -> Result<()> {
    let fixture = TrainingTestFixture::new()?;
    let mut trainer = fixture.trainer()?;

    let sample = trainer.check_sample(0)?.expect("test sets are not empty");
    assert!(sample.input.is_finite());
    assert!(sample.a_to_b.is_finite());
    assert!(sample.b_to_a.is_finite());
    Ok(())
}
