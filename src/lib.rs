//! Build container and VM root filesystem images from a declarative definition.
//!
//! A build fetches (or is handed) a root filesystem, gets a writable working
//! tree over it, runs package management and hooks inside a chroot, generates
//! files, and packs the result:
//!
//! ```text
//! Definition ──► source ──► overlay ──► chroot ──► generators ──► chroot ──► image
//!  (YAML)       (cache)    (or copy)   packages    dump/copy/..   post-files
//!                                      hooks
//! ```
//!
//! # Modules
//!
//! - [`definition`] - image definition, target scopes and filters
//! - [`source`] - download cache for `rootfs-http` sources
//! - [`overlay`] - overlayfs working tree with copy fallback
//! - [`chroot`] - sandbox sessions and capability restoration
//! - [`managers`] - built-in and custom package managers
//! - [`hooks`] - user actions per pipeline stage
//! - [`generators`] - file generators and their dispatch
//! - [`image`] - output image formats
//! - [`pipeline`] - the build itself
//!
//! # Example
//!
//! ```rust,ignore
//! use rootfs_builder::{pipeline, BuildContext, BuilderConfig, Definition};
//!
//! let definition = Definition::load(Path::new("alpine.yaml"))?;
//! let ctx = BuildContext::new(definition, BuilderConfig::load(None)?, Path::new("out"))?;
//! let artifacts = pipeline::build(&ctx)?;
//! ```

pub mod artifact;
pub mod build;
pub mod chroot;
pub mod config;
pub mod definition;
pub mod error;
pub mod generators;
pub mod hooks;
pub mod image;
pub mod managers;
pub mod mount;
pub mod overlay;
pub mod pipeline;
pub mod preflight;
pub mod process;
pub mod source;

#[cfg(test)]
pub(crate) mod testutil;

pub use build::BuildContext;
pub use config::BuilderConfig;
pub use definition::Definition;
pub use error::{DefinitionError, TeardownErrors};
