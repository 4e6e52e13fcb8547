//! Filesystem helpers shared by the pipeline stages.
//!
//! - [`filesystem`] - Tree copies, in-image path resolution, atomic renames
//! - [`tarball`] - Deterministic `tar.zst` archives for image output

pub mod filesystem;
pub mod tarball;
