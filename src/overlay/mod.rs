//! Writable working tree on top of a source root filesystem.
//!
//! The preferred strategy is an overlayfs mount with the source as the
//! read-only lower layer. Hosts that refuse the mount (missing privilege,
//! nested containers, unsupported filesystems) get a full recursive copy
//! instead; that degradation is a warning, not an error.
//!
//! Layout under the per-build work directory:
//!
//! ```text
//! <work>/overlay          merged (or copied) working tree
//! <work>/.overlay/upper   writable layer
//! <work>/.overlay/work    overlayfs scratch
//! ```

use anyhow::{Context, Result};
use nix::mount::MsFlags;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::artifact::filesystem::{copy_dir_recursive, remove_dir_if_exists};
use crate::mount::{MountOps, MountRequest};
use crate::preflight::is_root;

pub const MERGED_DIR: &str = "overlay";
const LAYERS_DIR: &str = ".overlay";

/// An overlayfs mount. Unmounted by [`release`](Self::release) or on drop.
pub struct OverlayMount<'a> {
    ops: &'a dyn MountOps,
    merged: PathBuf,
    upper: PathBuf,
    released: bool,
}

impl<'a> OverlayMount<'a> {
    fn mount(ops: &'a dyn MountOps, lower: &Path, work_dir: &Path) -> Result<Self> {
        let merged = work_dir.join(MERGED_DIR);
        let layers = work_dir.join(LAYERS_DIR);
        let upper = layers.join("upper");
        let scratch = layers.join("work");
        for dir in [&merged, &upper, &scratch] {
            fs::create_dir_all(dir).with_context(|| format!("creating '{}'", dir.display()))?;
        }

        let data = format!(
            "lowerdir={},upperdir={},workdir={}",
            lower.display(),
            upper.display(),
            scratch.display()
        );
        ops.mount(&MountRequest {
            source: Some(Path::new("overlay")),
            target: &merged,
            fstype: Some("overlay"),
            flags: MsFlags::empty(),
            data: Some(&data),
        })?;

        Ok(Self {
            ops,
            merged,
            upper,
            released: false,
        })
    }

    pub fn merged(&self) -> &Path {
        &self.merged
    }

    /// Writable layer holding everything the build changed.
    pub fn upper(&self) -> &Path {
        &self.upper
    }

    /// Unmount. The layers stay on disk with the work directory. Calling it
    /// again is a no-op.
    pub fn release(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        self.ops
            .unmount(&self.merged)
            .with_context(|| format!("releasing overlay '{}'", self.merged.display()))?;
        debug!(merged = %self.merged.display(), "overlay released");
        Ok(())
    }
}

impl Drop for OverlayMount<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.release() {
            warn!("{err:#}");
        }
    }
}

/// The working tree a build mutates.
pub enum WorkingDir<'a> {
    Overlay(OverlayMount<'a>),
    /// Plain copy; nothing to release.
    Copy(PathBuf),
}

impl WorkingDir<'_> {
    pub fn path(&self) -> &Path {
        match self {
            WorkingDir::Overlay(mount) => mount.merged(),
            WorkingDir::Copy(path) => path,
        }
    }

    pub fn is_overlay(&self) -> bool {
        matches!(self, WorkingDir::Overlay(_))
    }

    /// Where the build's changes live after release: the upper layer for an
    /// overlay, the tree itself for a copy.
    pub fn changes(&self) -> PathBuf {
        match self {
            WorkingDir::Overlay(mount) => mount.upper().to_path_buf(),
            WorkingDir::Copy(path) => path.clone(),
        }
    }

    pub fn release(&mut self) -> Result<()> {
        match self {
            WorkingDir::Overlay(mount) => mount.release(),
            WorkingDir::Copy(_) => Ok(()),
        }
    }
}

/// Acquire a writable working tree for `source` under `work_dir`.
///
/// With `allow_overlay` unset the copy strategy is used directly.
pub fn acquire<'a>(
    ops: &'a dyn MountOps,
    work_dir: &Path,
    source: &Path,
    allow_overlay: bool,
) -> Result<WorkingDir<'a>> {
    if allow_overlay {
        match OverlayMount::mount(ops, source, work_dir) {
            Ok(mount) => {
                info!("working tree: overlay at {}", mount.merged().display());
                return Ok(WorkingDir::Overlay(mount));
            }
            Err(err) => {
                warn!("Failed to create overlay, copying image content instead: {err:#}");
                remove_dir_if_exists(&work_dir.join(LAYERS_DIR))?;
            }
        }
    }

    let target = work_dir.join(MERGED_DIR);
    remove_dir_if_exists(&target)?;
    copy_dir_recursive(source, &target, is_root()).context("failed to copy image content")?;
    info!("working tree: copy at {}", target.display());
    Ok(WorkingDir::Copy(target))
}
