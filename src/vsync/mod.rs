//! Vsync generation and hardware vsync estimation
//!
//! Each connected display owns a `VsyncThread`. Present fences from the
//! composition path feed the `VsyncEstimator`, which predicts the next
//! hardware vsync from the fences' real signal times.

mod estimator;
mod thread;

pub use estimator::{VsyncEstimator, HISTORY_SIZE};
pub use thread::{VsyncSink, VsyncThread, VsyncThreadState};
