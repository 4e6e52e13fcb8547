//! Preflight checks for the build host.
//!
//! Real builds mount filesystems and chroot, which needs root. Overlay
//! support is checked up front so the log explains a later copy fallback.
//!
//! # Example
//!
//! ```rust,ignore
//! use rootfs_builder::preflight::check_host;
//!
//! let host = check_host(true)?;
//! if !host.overlay {
//!     println!("overlayfs unavailable, working tree will be copied");
//! }
//! ```

use anyhow::{bail, Result};
use std::fs;
use std::path::Path;
use tracing::{debug, warn};

const PROC_FILESYSTEMS: &str = "/proc/filesystems";

/// What the host offers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostReport {
    pub root: bool,
    pub overlay: bool,
}

/// Whether the process runs with effective uid 0.
pub fn is_root() -> bool {
    nix::unistd::geteuid().is_root()
}

/// Whether `filesystems` (the `/proc/filesystems` format) lists overlay.
pub fn lists_overlay(filesystems: &str) -> bool {
    filesystems
        .lines()
        .filter_map(|line| line.split_whitespace().last())
        .any(|fs| fs == "overlay")
}

/// Read `/proc/filesystems` (or the given file) and look for overlay.
pub fn overlay_supported(path: &Path) -> bool {
    match fs::read_to_string(path) {
        Ok(content) => lists_overlay(&content),
        Err(err) => {
            debug!("cannot read {}: {}", path.display(), err);
            false
        }
    }
}

/// Check the host before a build.
///
/// # Returns
///
/// * `Ok(report)` when the build can proceed
/// * `Err` when `require_root` is set and the process is not root
pub fn check_host(require_root: bool) -> Result<HostReport> {
    let report = HostReport {
        root: is_root(),
        overlay: overlay_supported(Path::new(PROC_FILESYSTEMS)),
    };

    if require_root && !report.root {
        bail!("rootfs-builder must run as root: building needs mount and chroot");
    }
    if !report.overlay {
        warn!("overlayfs not listed in {PROC_FILESYSTEMS}, builds will copy the source tree");
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SAMPLE: &str = "nodev\tsysfs\nnodev\ttmpfs\n\text4\nnodev\toverlay\n";

    #[test]
    fn test_lists_overlay() {
        assert!(lists_overlay(SAMPLE));
        assert!(!lists_overlay("nodev\tsysfs\n\text4\n"));
        assert!(!lists_overlay("nodev\toverlayfs-like\n"));
    }

    #[test]
    fn test_overlay_supported_reads_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("filesystems");
        std::fs::write(&path, SAMPLE).unwrap();
        assert!(overlay_supported(&path));
        assert!(!overlay_supported(&temp.path().join("missing")));
    }

    #[test]
    fn test_check_host_without_root_requirement() {
        let report = check_host(false).unwrap();
        assert_eq!(report.root, is_root());
    }
}
