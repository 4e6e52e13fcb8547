//! Per-build state.
//!
//! - [`context`] - explicit build context threaded through the pipeline

pub mod context;

pub use context::{generate_build_id, BuildContext};
