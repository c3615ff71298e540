//! Prefetching patch loader with background workers
//!
//! Each epoch spawns `num_workers` tokio tasks. Worker `w` materializes plans
//! `w, w + num_workers, ...` on the blocking pool and sends them through a
//! bounded channel. The stream reorders by sequence number, so consumers always
//! see batches in plan order regardless of worker timing.

use super::batching::{plan_epoch, BatchPlan, PatchCollator, PatchPair, PlanParams};
use super::{DataError, Dataset};
use crate::training::config::{PairingMode, SamplingMode};
use anyhow::Result;
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument};

/// Configuration for DataLoader
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataLoaderConfig {
    /// Whole image side length
    pub whole_size: usize,
    /// Patch side length
    pub patch_size: usize,
    /// Image channel depth
    pub channels: usize,
    /// Patches per batch
    pub batch_size: usize,
    /// Upper bound on batches per epoch
    pub steps_per_epoch: u64,
    /// Domain pairing
    pub pairing: PairingMode,
    /// Sampling strategy
    pub sampling: SamplingMode,
    /// Number of worker tasks
    pub num_workers: usize,
    /// Bounded queue depth
    pub prefetch_depth: usize,
    /// Base seed for crop plans
    pub seed: u64,
}

impl Default for DataLoaderConfig {
    fn default() -> Self {
        Self {
            whole_size: 512,
            patch_size: 56,
            channels: 1,
            batch_size: 10,
            steps_per_epoch: 3000,
            pairing: PairingMode::Unpaired,
            sampling: SamplingMode::Random,
            num_workers: 4,
            prefetch_depth: 8,
            seed: 0,
        }
    }
}

/// Restartable source of `(patch_X, patch_Y)` batches
pub struct DataLoader {
    domain_a: Arc<dyn Dataset>,
    domain_b: Arc<dyn Dataset>,
    config: DataLoaderConfig,
}

impl DataLoader {
    /// Create a new DataLoader over two domains
    pub fn new(
        domain_a: Arc<dyn Dataset>,
        domain_b: Arc<dyn Dataset>,
        config: DataLoaderConfig,
    ) -> Result<Self> {
        for dataset in [&domain_a, &domain_b] {
            if dataset.is_empty() {
                return Err(DataError::Empty {
                    name: dataset.metadata().name.clone(),
                }
                .into());
            }
        }
        if config.pairing == PairingMode::Paired && domain_a.len() != domain_b.len() {
            return Err(crate::Error::config(format!(
                "paired mode needs equal domain sizes, found {} A and {} B images",
                domain_a.len(),
                domain_b.len()
            ))
            .into());
        }
        if config.patch_size > config.whole_size {
            return Err(crate::Error::config(format!(
                "patch size {} exceeds whole image size {}",
                config.patch_size, config.whole_size
            ))
            .into());
        }
        if config.batch_size == 0 || config.num_workers == 0 || config.prefetch_depth == 0 {
            return Err(crate::Error::config(
                "batch size, worker count and prefetch depth must be greater than 0",
            )
            .into());
        }

        info!(
            "Creating DataLoader: {} A / {} B images, batch_size={}, num_workers={}, {:?}/{:?}",
            domain_a.len(),
            domain_b.len(),
            config.batch_size,
            config.num_workers,
            config.sampling,
            config.pairing
        );

        Ok(Self {
            domain_a,
            domain_b,
            config,
        })
    }

    fn plan_params(&self) -> PlanParams {
        PlanParams {
            len_a: self.domain_a.len(),
            len_b: self.domain_b.len(),
            whole_size: self.config.whole_size,
            patch_size: self.config.patch_size,
            batch_size: self.config.batch_size,
            steps_per_epoch: self.config.steps_per_epoch,
            pairing: self.config.pairing,
            sampling: self.config.sampling,
            seed: self.config.seed,
        }
    }

    /// Get the number of batches per epoch
    pub fn num_batches(&self) -> usize {
        self.plan_params().batches_per_epoch()
    }

    /// Number of images per domain
    pub fn dataset_sizes(&self) -> (usize, usize) {
        (self.domain_a.len(), self.domain_b.len())
    }

    /// Loader configuration
    pub fn config(&self) -> &DataLoaderConfig {
        &self.config
    }

    /// Start streaming an epoch, skipping its first `skip` batches
    ///
    /// Skipping keeps a resumed run on the same batch sequence as an
    /// uninterrupted one.
    #[instrument(skip(self))]
    pub fn epoch_stream(&self, epoch: usize, skip: usize) -> DataLoaderStream {
        let plans: Vec<BatchPlan> = plan_epoch(&self.plan_params(), epoch)
            .into_iter()
            .skip(skip)
            .enumerate()
            .map(|(seq, plan)| BatchPlan { seq, ..plan })
            .collect();

        info!("Starting epoch {} with {} batches (skipped {})", epoch, plans.len(), skip);

        let collator = PatchCollator::new(
            self.domain_a.clone(),
            self.domain_b.clone(),
            self.config.patch_size,
            self.config.channels,
        );
        DataLoaderStream::new(
            collator,
            plans,
            self.config.num_workers,
            self.config.prefetch_depth,
            epoch,
        )
    }
}

type BatchResult = Result<PatchPair>;

/// Ordered stream of one epoch's batches
pub struct DataLoaderStream {
    /// Channel receiver for `(seq, batch)` pairs
    receiver: mpsc::Receiver<(usize, BatchResult)>,
    /// Out-of-order arrivals
    pending: BTreeMap<usize, BatchResult>,
    /// Next sequence number to yield
    next_seq: usize,
    /// Total number of batches
    total_batches: usize,
    /// Current epoch number
    epoch: usize,
    /// Set to stop workers early
    cancelled: Arc<AtomicBool>,
    /// Worker handles, joined on shutdown
    workers: Vec<JoinHandle<()>>,
}

impl DataLoaderStream {
    #[instrument(skip(collator, plans))]
    fn new(
        collator: PatchCollator,
        plans: Vec<BatchPlan>,
        num_workers: usize,
        prefetch_depth: usize,
        epoch: usize,
    ) -> Self {
        let total_batches = plans.len();
        let (sender, receiver) = mpsc::channel(prefetch_depth);
        let cancelled = Arc::new(AtomicBool::new(false));

        debug!(
            "Creating DataLoaderStream with {} workers for {} batches",
            num_workers, total_batches
        );

        let workers = (0..num_workers)
            .map(|worker_id| {
                let worker_plans: Vec<_> = plans
                    .iter()
                    .skip(worker_id)
                    .step_by(num_workers)
                    .cloned()
                    .collect();
                tokio::spawn(Self::worker_task(
                    worker_id,
                    collator.clone(),
                    worker_plans,
                    sender.clone(),
                    cancelled.clone(),
                ))
            })
            .collect();

        // Drop the original sender so the channel closes when workers finish
        drop(sender);

        Self {
            receiver,
            pending: BTreeMap::new(),
            next_seq: 0,
            total_batches,
            epoch,
            cancelled,
            workers,
        }
    }

    async fn worker_task(
        worker_id: usize,
        collator: PatchCollator,
        plans: Vec<BatchPlan>,
        sender: mpsc::Sender<(usize, BatchResult)>,
        cancelled: Arc<AtomicBool>,
    ) {
        debug!("Worker {} starting with {} batches", worker_id, plans.len());

        for plan in plans {
            if cancelled.load(Ordering::Relaxed) {
                break;
            }
            let seq = plan.seq;
            let collator = collator.clone();
            let result = match tokio::task::spawn_blocking(move || collator.collate(&plan)).await {
                Ok(result) => result,
                Err(e) => {
                    error!("Worker {} batch {} panicked: {}", worker_id, seq, e);
                    Err(e.into())
                }
            };
            if let Err(e) = &result {
                error!("Worker {} batch {} failed: {}", worker_id, seq, e);
            }
            if sender.send((seq, result)).await.is_err() {
                debug!("Worker {} channel closed, stopping", worker_id);
                break;
            }
        }

        debug!("Worker {} finished", worker_id);
    }

    /// Stop the workers and wait for all of them to exit
    pub async fn shutdown(mut self) {
        self.cancelled.store(true, Ordering::Relaxed);
        self.receiver.close();
        while self.receiver.recv().await.is_some() {}
        for handle in self.workers.drain(..) {
            if let Err(e) = handle.await {
                error!("Data worker failed to join: {}", e);
            }
        }
        debug!("Epoch {} stream shut down", self.epoch);
    }

    /// Get the number of batches yielded so far
    pub fn batches_processed(&self) -> usize {
        self.next_seq
    }

    /// Get the total number of batches
    pub fn total_batches(&self) -> usize {
        self.total_batches
    }

    /// Get the current epoch
    pub fn epoch(&self) -> usize {
        self.epoch
    }
}

impl Stream for DataLoaderStream {
    type Item = BatchResult;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        loop {
            if let Some(batch) = this.pending.remove(&this.next_seq) {
                this.next_seq += 1;
                return Poll::Ready(Some(batch));
            }
            match this.receiver.poll_recv(cx) {
                Poll::Ready(Some((seq, batch))) => {
                    this.pending.insert(seq, batch);
                }
                Poll::Ready(None) => {
                    // Workers are gone; yield whatever is left in order.
                    if let Some((seq, batch)) = this.pending.pop_first() {
                        this.next_seq = seq + 1;
                        return Poll::Ready(Some(batch));
                    }
                    info!(
                        "Epoch {} completed: {}/{} batches",
                        this.epoch, this.next_seq, this.total_batches
                    );
                    return Poll::Ready(None);
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::training::data::{ImageSample, InMemoryDataset};
    use futures::StreamExt;

    fn dataset(name: &str, n: usize, size: usize) -> Arc<dyn Dataset> {
        let samples = (0..n)
            .map(|i| {
                ImageSample::new(format!("{name}{i}"), 1, size, size, vec![i as f32 / n as f32; size * size])
                    .unwrap()
            })
            .collect();
        Arc::new(InMemoryDataset::new(name, samples))
    }

    fn config(workers: usize) -> DataLoaderConfig {
        DataLoaderConfig {
            whole_size: 16,
            patch_size: 8,
            channels: 1,
            batch_size: 2,
            steps_per_epoch: 12,
            pairing: PairingMode::Unpaired,
            sampling: SamplingMode::Random,
            num_workers: workers,
            prefetch_depth: 2,
            seed: 11,
        }
    }

    async fn collect(stream: &mut DataLoaderStream) -> Vec<PatchPair> {
        let mut out = Vec::new();
        while let Some(batch) = stream.next().await {
            out.push(batch.unwrap());
        }
        out
    }

    #[tokio::test]
    async fn test_stream_yields_in_order() {
        let loader = DataLoader::new(dataset("a", 5, 16), dataset("b", 4, 16), config(3)).unwrap();
        assert_eq!(loader.num_batches(), 12);

        let mut stream = loader.epoch_stream(0, 0);
        let batches = collect(&mut stream).await;
        assert_eq!(batches.len(), 12);
        for (i, b) in batches.iter().enumerate() {
            assert_eq!(b.seq, i);
            assert_eq!(b.x.dims(), &[2, 1, 8, 8]);
        }
        assert_eq!(stream.batches_processed(), 12);
        stream.shutdown().await;
    }

    #[tokio::test]
    async fn test_worker_count_does_not_change_batches() {
        let one = DataLoader::new(dataset("a", 5, 16), dataset("b", 4, 16), config(1)).unwrap();
        let four = DataLoader::new(dataset("a", 5, 16), dataset("b", 4, 16), config(4)).unwrap();

        let mut s1 = one.epoch_stream(1, 0);
        let mut s4 = four.epoch_stream(1, 0);
        let b1 = collect(&mut s1).await;
        let b4 = collect(&mut s4).await;
        for (p, q) in b1.iter().zip(b4.iter()) {
            let diff = (&p.y - &q.y).unwrap().abs().unwrap().sum_all().unwrap();
            assert_eq!(diff.to_scalar::<f32>().unwrap(), 0.0);
        }
        s1.shutdown().await;
        s4.shutdown().await;
    }

    #[tokio::test]
    async fn test_skip_resumes_mid_epoch() {
        let loader = DataLoader::new(dataset("a", 5, 16), dataset("b", 4, 16), config(2)).unwrap();

        let mut full = loader.epoch_stream(0, 0);
        let all = collect(&mut full).await;
        let mut resumed = loader.epoch_stream(0, 5);
        let rest = collect(&mut resumed).await;

        assert_eq!(rest.len(), 7);
        let diff = (&all[5].x - &rest[0].x).unwrap().abs().unwrap().sum_all().unwrap();
        assert_eq!(diff.to_scalar::<f32>().unwrap(), 0.0);
        full.shutdown().await;
        resumed.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_mid_epoch_joins_workers() {
        let loader = DataLoader::new(dataset("a", 5, 16), dataset("b", 4, 16), config(2)).unwrap();
        let mut stream = loader.epoch_stream(0, 0);
        assert!(stream.next().await.is_some());
        tokio::time::timeout(std::time::Duration::from_secs(5), stream.shutdown())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_empty_dataset_rejected() {
        let empty: Arc<dyn Dataset> = Arc::new(InMemoryDataset::new("empty", vec![]));
        assert!(DataLoader::new(empty, dataset("b", 1, 16), config(1)).is_err());
    }
}
