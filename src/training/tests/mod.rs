//! Test suite for the training infrastructure
//!
//! Component tests live next to their modules; this suite covers the pieces
//! that only make sense together: loss properties over real forward passes,
//! checkpoint round trips through a session, the trainer loop and export.

pub mod trainer_tests;


// Re-export commonly used test utilities
pub use fixtures::TrainingTestFixture;
pub use test_utils::{
    assert_tensor_close, create_test_config, create_test_session, random_batch, synthetic_dataset,
};
