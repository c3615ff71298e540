//! Two-domain data pipeline: training loader plus whole-image test sets

use super::{DataLoader, DataLoaderConfig, Dataset, InMemoryDataset, NpyImageDataset};
use crate::training::config::{DataConfig, TrainingParams};
use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;

/// Everything the trainer and exporter read
pub struct DataPipeline {
    train: Option<DataLoader>,
    test_a: Arc<InMemoryDataset>,
    test_b: Arc<InMemoryDataset>,
}

impl DataPipeline {
    /// Assemble a pipeline from in-memory datasets
    pub fn new(train: Option<DataLoader>, test_a: InMemoryDataset, test_b: InMemoryDataset) -> Self {
        Self {
            train,
            test_a: Arc::new(test_a),
            test_b: Arc::new(test_b),
        }
    }

    fn load_dir(data: &DataConfig, dir: &std::path::Path) -> Result<InMemoryDataset> {
        NpyImageDataset::new(dir, data.whole_size, data.channels, data.value_min, data.value_max)
            .load()
            .with_context(|| format!("Failed to load images from {}", dir.display()))
    }

    /// Load the training and test sets for the train phase
    pub fn for_training(data: &DataConfig, training: &TrainingParams) -> Result<Self> {
        let train_a = Self::load_dir(data, &data.train_a_dir)?;
        let train_b = Self::load_dir(data, &data.train_b_dir)?;
        let test_a = Self::load_dir(data, &data.test_a_dir)?;
        let test_b = Self::load_dir(data, &data.test_b_dir)?;

        info!(
            "Data loaded: N_train = {}/{}, N_test = {}/{}",
            train_a.len(),
            train_b.len(),
            test_a.len(),
            test_b.len()
        );

        let loader = DataLoader::new(
            Arc::new(train_a),
            Arc::new(train_b),
            DataLoaderConfig {
                whole_size: data.whole_size,
                patch_size: data.patch_size,
                channels: data.channels,
                batch_size: data.batch_size,
                steps_per_epoch: training.steps_per_epoch,
                pairing: data.pairing,
                sampling: data.sampling,
                num_workers: data.num_workers,
                prefetch_depth: data.prefetch_depth,
                seed: training.seed,
            },
        )?;

        Ok(Self::new(Some(loader), test_a, test_b))
    }

    /// Load only the test sets for the export phase
    pub fn for_testing(data: &DataConfig) -> Result<Self> {
        let test_a = Self::load_dir(data, &data.test_a_dir)?;
        let test_b = Self::load_dir(data, &data.test_b_dir)?;
        info!("Data loaded: N_test = {}/{}", test_a.len(), test_b.len());
        Ok(Self::new(None, test_a, test_b))
    }

    /// Training loader, absent in the export phase
    pub fn train(&self) -> Option<&DataLoader> {
        self.train.as_ref()
    }

    /// A-domain test images
    pub fn test_a(&self) -> &InMemoryDataset {
        &self.test_a
    }

    /// B-domain test images
    pub fn test_b(&self) -> &InMemoryDataset {
        &self.test_b
    }

    /// Identifiers of the A- and B-domain test images
    pub fn test_ids(&self) -> (&[String], &[String]) {
        (&self.test_a.metadata().ids, &self.test_b.metadata().ids)
    }
}
