//! Crop planning and patch batch collation
//!
//! An epoch is described up front as a list of [`BatchPlan`]s drawn from a
//! seeded RNG, so the batch sequence depends only on `(seed, epoch)`. Workers
//! then materialize plans into tensors in any order.

use super::{DataError, Dataset};
use crate::training::config::{PairingMode, SamplingMode};
use anyhow::Result;
use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use tracing::{debug, instrument};

/// Where to cut one patch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropSpec {
    /// Image index in its dataset
    pub index: usize,
    /// Top row of the patch
    pub top: usize,
    /// Left column of the patch
    pub left: usize,
}

/// Crops for one `(patch_X, patch_Y)` batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchPlan {
    /// Position of the batch within its epoch
    pub seq: usize,
    /// A-domain crops
    pub a: Vec<CropSpec>,
    /// B-domain crops
    pub b: Vec<CropSpec>,
}

/// One training batch pair, `(N, C, P, P)` each, values in `[-1, 1]`
#[derive(Debug, Clone)]
pub struct PatchPair {
    /// Position of the batch within its epoch
    pub seq: usize,
    /// A-domain patches
    pub x: Tensor,
    /// B-domain patches
    pub y: Tensor,
}

/// Parameters that determine an epoch's crop plan
#[derive(Debug, Clone)]
pub struct PlanParams {
    /// Examples in domain A
    pub len_a: usize,
    /// Examples in domain B
    pub len_b: usize,
    /// Whole image side length
    pub whole_size: usize,
    /// Patch side length
    pub patch_size: usize,
    /// Patches per batch
    pub batch_size: usize,
    /// Upper bound on batches per epoch
    pub steps_per_epoch: u64,
    /// Domain pairing
    pub pairing: PairingMode,
    /// Sampling strategy
    pub sampling: SamplingMode,
    /// Base seed
    pub seed: u64,
}

impl PlanParams {
    /// Number of batches an epoch yields
    pub fn batches_per_epoch(&self) -> usize {
        let cap = usize::try_from(self.steps_per_epoch).unwrap_or(usize::MAX);
        match self.sampling {
            SamplingMode::Random => cap,
            SamplingMode::Sequential => (self.pass_length() / self.batch_size).min(cap),
        }
    }

    fn pass_length(&self) -> usize {
        match self.pairing {
            PairingMode::Paired => self.len_a.min(self.len_b),
            PairingMode::Unpaired => self.len_a.max(self.len_b),
        }
    }
}

fn random_crop(rng: &mut StdRng, index: usize, max_offset: usize) -> CropSpec {
    CropSpec {
        index,
        top: rng.random_range(0..=max_offset),
        left: rng.random_range(0..=max_offset),
    }
}

/// Build the crop plan of one epoch
#[instrument(skip(params), fields(sampling = ?params.sampling, pairing = ?params.pairing))]
pub fn plan_epoch(params: &PlanParams, epoch: usize) -> Vec<BatchPlan> {
    let mut rng = StdRng::seed_from_u64(params.seed.wrapping_add(epoch as u64));
    let max_offset = params.whole_size - params.patch_size;
    let num_batches = params.batches_per_epoch();

    let mut plans = Vec::with_capacity(num_batches);
    for seq in 0..num_batches {
        let mut a = Vec::with_capacity(params.batch_size);
        let mut b = Vec::with_capacity(params.batch_size);
        for slot in 0..params.batch_size {
            let (ia, ib) = match params.sampling {
                SamplingMode::Random => {
                    let ia = rng.random_range(0..params.len_a);
                    let ib = match params.pairing {
                        PairingMode::Paired => ia,
                        PairingMode::Unpaired => rng.random_range(0..params.len_b),
                    };
                    (ia, ib)
                }
                SamplingMode::Sequential => {
                    let k = seq * params.batch_size + slot;
                    (k % params.len_a, k % params.len_b)
                }
            };

            let crop_a = random_crop(&mut rng, ia, max_offset);
            let crop_b = match params.pairing {
                PairingMode::Paired => CropSpec { index: ib, ..crop_a },
                PairingMode::Unpaired => random_crop(&mut rng, ib, max_offset),
            };
            a.push(crop_a);
            b.push(crop_b);
        }
        plans.push(BatchPlan { seq, a, b });
    }

    debug!("Planned {} batches for epoch {}", plans.len(), epoch);
    plans
}

/// Materializes batch plans into patch tensors
#[derive(Clone)]
pub struct PatchCollator {
    domain_a: Arc<dyn Dataset>,
    domain_b: Arc<dyn Dataset>,
    patch_size: usize,
    channels: usize,
}

impl PatchCollator {
    /// Create a collator over two datasets
    pub fn new(
        domain_a: Arc<dyn Dataset>,
        domain_b: Arc<dyn Dataset>,
        patch_size: usize,
        channels: usize,
    ) -> Self {
        Self {
            domain_a,
            domain_b,
            patch_size,
            channels,
        }
    }

    fn stack(&self, dataset: &dyn Dataset, crops: &[CropSpec]) -> Result<Tensor> {
        let p = self.patch_size;
        let mut data = Vec::with_capacity(crops.len() * self.channels * p * p);
        for crop in crops {
            let sample = dataset.get(crop.index)?;
            if sample.channels != self.channels {
                return Err(DataError::MalformedData {
                    id: sample.id,
                    reason: format!("{} channels, expected {}", sample.channels, self.channels),
                }
                .into());
            }
            data.extend(sample.crop(crop.top, crop.left, p)?);
        }
        let tensor = Tensor::from_vec(data, (crops.len(), self.channels, p, p), &Device::Cpu)
            .map_err(DataError::from)?;
        Ok(tensor)
    }

    /// Cut and stack the patches of one plan
    pub fn collate(&self, plan: &BatchPlan) -> Result<PatchPair> {
        Ok(PatchPair {
            seq: plan.seq,
            x: self.stack(self.domain_a.as_ref(), &plan.a)?,
            y: self.stack(self.domain_b.as_ref(), &plan.b)?,
        })
    }
}
