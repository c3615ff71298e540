//! Summary writers
//!
//! [`JsonlSummaryWriter`] hands events to a single background task over an
//! unbounded channel, so recording a summary never blocks a training step.
//! The task appends one JSON object per line to `events.jsonl` and stores
//! images as `u8` `.npy` arrays under `images/`.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use candle_core::{DType, Tensor};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::training::data::rescale;
use crate::utils::io::ensure_dir_exists;

/// Event log file name inside the log directory
pub const EVENTS_FILE: &str = "events.jsonl";

const IMAGES_DIR: &str = "images";

/// Trait for summary sinks
#[async_trait]
pub trait SummaryWriter: Send + Sync {
    /// Writer name
    fn name(&self) -> &str;

    /// Queue a scalar
    fn add_scalar(&self, tag: &str, value: f64, step: u64) -> Result<()>;

    /// Queue an image with values in [-1, 1]
    fn add_image(&self, tag: &str, image: &Tensor, step: u64) -> Result<()>;

    /// Wait until every queued event is on disk
    async fn flush(&self) -> Result<()>;

    /// Drain the queue and stop the writer
    async fn close(&mut self) -> Result<()>;
}

/// One line of the event log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Wall-clock time the event was queued
    pub wall_time: DateTime<Utc>,
    /// Global step
    pub step: u64,
    /// Summary tag
    pub tag: String,
    /// Payload
    #[serde(flatten)]
    pub value: EventValue,
}

/// Event payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum EventValue {
    /// Scalar value
    Scalar {
        /// Value
        value: f64,
    },
    /// Image stored next to the log
    Image {
        /// Path relative to the log directory
        path: String,
        /// Array shape
        shape: Vec<usize>,
    },
}

enum WriterCommand {
    Scalar(EventRecord),
    Image(EventRecord, Tensor),
    Flush(oneshot::Sender<()>),
}

/// JSON-lines summary writer backed by a background task
pub struct JsonlSummaryWriter {
    log_dir: PathBuf,
    sender: Option<mpsc::UnboundedSender<WriterCommand>>,
    handle: Option<JoinHandle<Result<u64>>>,
}

impl JsonlSummaryWriter {
    /// Create the log directory and start the writer task
    ///
    /// Must be called inside a tokio runtime. Existing logs are appended to.
    pub async fn create(log_dir: impl Into<PathBuf>) -> Result<Self> {
        let log_dir = log_dir.into();
        ensure_dir_exists(log_dir.join(IMAGES_DIR))
            .with_context(|| format!("Failed to create log directory {}", log_dir.display()))?;

        let events_path = log_dir.join(EVENTS_FILE);
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&events_path)
            .await
            .with_context(|| format!("Failed to open {}", events_path.display()))?;

        let (sender, receiver) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run_writer(log_dir.clone(), file, receiver));

        debug!("Summary writer started in {}", log_dir.display());
        Ok(Self {
            log_dir,
            sender: Some(sender),
            handle: Some(handle),
        })
    }

    /// Directory receiving the log
    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    fn send(&self, command: WriterCommand) -> Result<()> {
        self.sender
            .as_ref()
            .ok_or_else(|| anyhow!("summary writer is closed"))?
            .send(command)
            .map_err(|_| anyhow!("summary writer task has stopped"))
    }
}

#[async_trait]
impl SummaryWriter for JsonlSummaryWriter {
    fn name(&self) -> &str {
        "jsonl"
    }

    fn add_scalar(&self, tag: &str, value: f64, step: u64) -> Result<()> {
        self.send(WriterCommand::Scalar(EventRecord {
            wall_time: Utc::now(),
            step,
            tag: tag.to_string(),
            value: EventValue::Scalar { value },
        }))
    }

    fn add_image(&self, tag: &str, image: &Tensor, step: u64) -> Result<()> {
        let pixels = rescale(image, -1.0, 1.0, 0.0, 255.0, DType::U8)?;
        let file_name = format!("{}_{step:08}.npy", tag.replace('/', "_"));
        self.send(WriterCommand::Image(
            EventRecord {
                wall_time: Utc::now(),
                step,
                tag: tag.to_string(),
                value: EventValue::Image {
                    path: format!("{IMAGES_DIR}/{file_name}"),
                    shape: pixels.dims().to_vec(),
                },
            },
            pixels,
        ))
    }

    async fn flush(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(WriterCommand::Flush(tx))?;
        rx.await.map_err(|_| anyhow!("summary writer task has stopped"))
    }

    async fn close(&mut self) -> Result<()> {
        // Dropping the sender ends the task once the queue is drained.
        self.sender.take();
        if let Some(handle) = self.handle.take() {
            let written = handle.await.context("Summary writer task panicked")??;
            debug!("Summary writer closed after {} events", written);
        }
        Ok(())
    }
}

impl Drop for JsonlSummaryWriter {
    fn drop(&mut self) {
        if self.handle.is_some() {
            warn!("Summary writer dropped without close; pending events may be lost");
        }
    }
}

async fn run_writer(
    log_dir: PathBuf,
    mut file: tokio::fs::File,
    mut receiver: mpsc::UnboundedReceiver<WriterCommand>,
) -> Result<u64> {
    let mut written = 0u64;
    while let Some(command) = receiver.recv().await {
        match command {
            WriterCommand::Scalar(record) => {
                append_record(&mut file, &record).await?;
                written += 1;
            }
            WriterCommand::Image(record, pixels) => {
                if let EventValue::Image { path, .. } = &record.value {
                    let target = log_dir.join(path);
                    tokio::task::spawn_blocking(move || pixels.write_npy(&target))
                        .await
                        .context("Image writer panicked")?
                        .context("Failed to write summary image")?;
                }
                append_record(&mut file, &record).await?;
                written += 1;
            }
            WriterCommand::Flush(done) => {
                file.flush().await?;
                // The requester may have given up waiting.
                let _ = done.send(());
            }
        }
    }
    file.flush().await?;
    Ok(written)
}

async fn append_record(file: &mut tokio::fs::File, record: &EventRecord) -> Result<()> {
    let mut line = serde_json::to_vec(record)?;
    line.push(b'\n');
    file.write_all(&line).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use tempfile::TempDir;

    fn read_records(dir: &Path) -> Vec<EventRecord> {
        std::fs::read_to_string(dir.join(EVENTS_FILE))
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_scalars_written_in_order() {
        let temp = TempDir::new().unwrap();
        let mut writer = JsonlSummaryWriter::create(temp.path()).await.unwrap();

        writer.add_scalar("Generator_loss/1_G_loss", 1.5, 1).unwrap();
        writer.add_scalar("Generator_loss/1_G_loss", 1.25, 2).unwrap();
        writer.flush().await.unwrap();
        writer.close().await.unwrap();

        let records = read_records(temp.path());
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].step, 2);
        assert_eq!(records[1].value, EventValue::Scalar { value: 1.25 });
    }

    #[tokio::test]
    async fn test_image_stored_as_u8() {
        let temp = TempDir::new().unwrap();
        let mut writer = JsonlSummaryWriter::create(temp.path()).await.unwrap();

        let image = Tensor::new(&[[[[-1.0f32, 0.0], [1.0, 2.0]]]], &Device::Cpu).unwrap();
        writer.add_image("sample/AtoB", &image, 7).unwrap();
        writer.close().await.unwrap();

        let records = read_records(temp.path());
        let EventValue::Image { path, shape } = &records[0].value else {
            panic!("expected an image record");
        };
        assert_eq!(shape, &vec![1, 1, 2, 2]);

        let stored = Tensor::read_npy(temp.path().join(path)).unwrap();
        assert_eq!(stored.dtype(), DType::U8);
        let values: Vec<u8> = stored.flatten_all().unwrap().to_vec1().unwrap();
        // 0.0 maps to 127.5 and rounds up; out-of-range values clamp
        assert_eq!(values, vec![0, 128, 255, 255]);
    }

    #[tokio::test]
    async fn test_closed_writer_rejects_events() {
        let temp = TempDir::new().unwrap();
        let mut writer = JsonlSummaryWriter::create(temp.path()).await.unwrap();
        writer.close().await.unwrap();
        assert!(writer.add_scalar("x", 1.0, 1).is_err());
    }
}
