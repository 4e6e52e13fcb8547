//! The explicit context a build runs with.
//!
//! Everything the pipeline needs from the outside world lives here: the
//! parsed definition, builder configuration, directories, and the two
//! side-effect seams (mounts and source transport). Tests swap the seams for
//! recording fakes.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use time::OffsetDateTime;

use crate::config::BuilderConfig;
use crate::definition::{Definition, ImageTarget};
use crate::generators::GeneratorRegistry;
use crate::mount::{HostMounts, MountOps};
use crate::source::{HttpTransport, Transport};

const WORK_DIR: &str = "work";
static BUILD_SEQ: AtomicU64 = AtomicU64::new(0);

/// Work directory name for a build, e.g. `20261018T142501.042117Z-1f3a-0000`.
///
/// UTC start time to the microsecond, so `work/` lists oldest first, then
/// the pid and a per-process sequence number.
pub fn generate_build_id() -> String {
    let now = OffsetDateTime::now_utc();
    let seq = BUILD_SEQ.fetch_add(1, Ordering::Relaxed) % 10_000;
    format!(
        "{:04}{:02}{:02}T{:02}{:02}{:02}.{:06}Z-{:x}-{:04}",
        now.year(),
        u8::from(now.month()),
        now.day(),
        now.hour(),
        now.minute(),
        now.second(),
        now.microsecond(),
        std::process::id(),
        seq
    )
}

/// Resolve `path` against the current directory.
///
/// Sessions change the process root and working directory, so every host
/// path the pipeline holds must be absolute.
fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    Ok(std::env::current_dir()
        .context("reading current directory")?
        .join(path))
}

pub struct BuildContext {
    pub definition: Definition,
    pub config: BuilderConfig,
    pub cache_dir: PathBuf,
    pub target_dir: PathBuf,
    pub build_id: String,
    pub mounts: Box<dyn MountOps>,
    pub transport: Box<dyn Transport>,
    pub generators: GeneratorRegistry,
}

impl BuildContext {
    /// Context backed by real mounts and HTTP.
    pub fn new(definition: Definition, config: BuilderConfig, target_dir: &Path) -> Result<Self> {
        Ok(Self {
            cache_dir: absolute(&config.cache_dir)?,
            target_dir: absolute(target_dir)?,
            build_id: generate_build_id(),
            definition,
            config,
            mounts: Box::new(HostMounts),
            transport: Box::new(HttpTransport::new()?),
            generators: GeneratorRegistry::default(),
        })
    }

    pub fn with_mounts(mut self, mounts: Box<dyn MountOps>) -> Self {
        self.mounts = mounts;
        self
    }

    pub fn with_transport(mut self, transport: Box<dyn Transport>) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_generators(mut self, generators: GeneratorRegistry) -> Self {
        self.generators = generators;
        self
    }

    /// `<cache_dir>/work/<build-id>`
    pub fn work_dir(&self) -> PathBuf {
        self.cache_dir.join(WORK_DIR).join(&self.build_id)
    }

    pub fn scope(&self) -> ImageTarget {
        self.definition.scope()
    }
}
