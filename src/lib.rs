//! cycleid - cycle-consistency and identity training for unpaired image translation
//!
//! Two generators translate between image domains A and B while two patch
//! discriminators judge realism. Training combines least-squares adversarial
//! losses with cycle-consistency and identity terms, runs on candle, and
//! checkpoints every network and optimizer so a run resumes exactly where it
//! stopped.

#![warn(missing_docs)]
#![warn(rustdoc::broken_intra_doc_links)]

pub mod error;
pub mod networks;
pub mod training;
pub mod utils;

// Re-exports
pub use error::{Error, Result};
pub use networks::{ModelPair, Network, NetworkRole};
pub use training::{CycleTrainer, DataPipeline, TrainingConfig, TrainingSession};
