//! Loss tracking, image-quality metrics and summary output
//!
//! [`MetricsTracker`] smooths the per-step loss scalars for progress lines.
//! Summaries go through a [`SummaryWriter`], which appends them to an event
//! log off the training thread.

pub mod exporters;

pub use exporters::{EventRecord, EventValue, JsonlSummaryWriter, SummaryWriter, EVENTS_FILE};

use std::collections::VecDeque;

use candle_core::{DType, Tensor};

use crate::error::{Error, Result};
use crate::training::loss::LossScalars;

/// Data range of generator inputs and outputs in [-1, 1]
pub const SIGNED_UNIT_RANGE: f64 = 2.0;

/// Mean over the last `window_size` values
#[derive(Debug, Clone)]
pub struct RollingAverage {
    window_size: usize,
    values: VecDeque<f64>,
    sum: f64,
}

impl RollingAverage {
    /// Create an empty window; a zero size is treated as one
    pub fn new(window_size: usize) -> Self {
        let window_size = window_size.max(1);
        Self {
            window_size,
            values: VecDeque::with_capacity(window_size),
            sum: 0.0,
        }
    }

    /// Add a value, evicting the oldest one when the window is full
    pub fn push(&mut self, value: f64) {
        self.values.push_back(value);
        self.sum += value;
        if self.values.len() > self.window_size {
            if let Some(old) = self.values.pop_front() {
                self.sum -= old;
            }
        }
    }

    /// Current mean, if any value was pushed
    pub fn mean(&self) -> Option<f64> {
        if self.values.is_empty() {
            None
        } else {
            Some(self.sum / self.values.len() as f64)
        }
    }

    /// Number of values in the window
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the window is empty
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Drop all values
    pub fn reset(&mut self) {
        self.values.clear();
        self.sum = 0.0;
    }
}

/// Rolling averages of the loss scalars and a count of non-finite steps
#[derive(Debug, Clone)]
pub struct MetricsTracker {
    g_loss: RollingAverage,
    cycle_loss: RollingAverage,
    identity_loss: RollingAverage,
    d_loss: RollingAverage,
    last: Option<LossScalars>,
    steps: u64,
    non_finite_steps: u64,
}

/// Smoothed values reported on progress lines
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SmoothedLosses {
    /// Mean generator loss
    pub g_loss: f64,
    /// Mean cycle loss
    pub cycle_loss: f64,
    /// Mean identity loss
    pub identity_loss: f64,
    /// Mean discriminator loss
    pub d_loss: f64,
}

impl MetricsTracker {
    /// Create a tracker averaging over `window_size` steps
    pub fn new(window_size: usize) -> Self {
        Self {
            g_loss: RollingAverage::new(window_size),
            cycle_loss: RollingAverage::new(window_size),
            identity_loss: RollingAverage::new(window_size),
            d_loss: RollingAverage::new(window_size),
            last: None,
            steps: 0,
            non_finite_steps: 0,
        }
    }

    /// Record one step; returns whether every value was finite
    ///
    /// Non-finite steps are counted but kept out of the averages.
    pub fn record(&mut self, losses: &LossScalars) -> bool {
        self.steps += 1;
        self.last = Some(*losses);
        if !losses.all_finite() {
            self.non_finite_steps += 1;
            return false;
        }
        self.g_loss.push(losses.g_loss as f64);
        self.cycle_loss.push(losses.cycle_loss as f64);
        self.identity_loss.push(losses.identity_loss as f64);
        self.d_loss.push(losses.d_loss as f64);
        true
    }

    /// Smoothed losses, once at least one finite step was recorded
    pub fn smoothed(&self) -> Option<SmoothedLosses> {
        Some(SmoothedLosses {
            g_loss: self.g_loss.mean()?,
            cycle_loss: self.cycle_loss.mean()?,
            identity_loss: self.identity_loss.mean()?,
            d_loss: self.d_loss.mean()?,
        })
    }

    /// Most recent step's losses
    pub fn last(&self) -> Option<&LossScalars> {
        self.last.as_ref()
    }

    /// Steps recorded
    pub fn steps(&self) -> u64 {
        self.steps
    }

    /// Steps with at least one non-finite loss
    pub fn non_finite_steps(&self) -> u64 {
        self.non_finite_steps
    }
}

/// Peak signal-to-noise ratio in dB between two same-shaped tensors
///
/// Identical inputs give `f64::INFINITY`.
pub fn psnr(a: &Tensor, b: &Tensor, data_range: f64) -> Result<f64> {
    if a.dims() != b.dims() {
        return Err(Error::shape(
            "psnr",
            format!("{:?}", a.dims()),
            format!("{:?}", b.dims()),
        ));
    }
    let mse = (a.to_dtype(DType::F64)? - b.to_dtype(DType::F64)?)?
        .sqr()?
        .mean_all()?
        .to_scalar::<f64>()?;
    if mse == 0.0 {
        return Ok(f64::INFINITY);
    }
    Ok(10.0 * (data_range * data_range / mse).log10())
}
