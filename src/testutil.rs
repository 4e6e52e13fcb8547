//! Test doubles shared by module tests.

use anyhow::{bail, Result};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::mount::{MountOps, MountRequest};
use crate::source::http::Transport;

/// A recorded privileged call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountCall {
    Mount {
        target: PathBuf,
        fstype: Option<String>,
    },
    Unmount(PathBuf),
    EnterRoot(PathBuf),
    LeaveRoot,
}

/// [`MountOps`] that records calls instead of touching the host.
///
/// `enter_root` reports the rootfs path itself as the effective root, so
/// commands run "inside" the sandbox execute on the host with the rootfs as
/// their working directory.
#[derive(Debug, Default)]
pub struct RecordingMounts {
    calls: Mutex<Vec<MountCall>>,
    fail_fstype: Option<String>,
    fail_unmount: Vec<PathBuf>,
}

impl RecordingMounts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every mount of the given filesystem type (e.g. `overlay`).
    pub fn failing_fstype(mut self, fstype: &str) -> Self {
        self.fail_fstype = Some(fstype.to_string());
        self
    }

    /// Fail unmounting `target`.
    pub fn failing_unmount(mut self, target: impl Into<PathBuf>) -> Self {
        self.fail_unmount.push(target.into());
        self
    }

    pub fn calls(&self) -> Vec<MountCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn mounted(&self) -> Vec<PathBuf> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                MountCall::Mount { target, .. } => Some(target),
                _ => None,
            })
            .collect()
    }

    pub fn unmounted(&self) -> Vec<PathBuf> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                MountCall::Unmount(target) => Some(target),
                _ => None,
            })
            .collect()
    }

    /// Targets mounted and not unmounted yet.
    pub fn active(&self) -> Vec<PathBuf> {
        let mut active = Vec::new();
        for call in self.calls() {
            match call {
                MountCall::Mount { target, .. } => active.push(target),
                MountCall::Unmount(target) => {
                    if let Some(pos) = active.iter().rposition(|t| *t == target) {
                        active.remove(pos);
                    }
                }
                _ => {}
            }
        }
        active
    }

    fn record(&self, call: MountCall) {
        self.calls.lock().unwrap().push(call);
    }
}

impl MountOps for RecordingMounts {
    fn mount(&self, req: &MountRequest<'_>) -> Result<()> {
        if let (Some(fail), Some(fstype)) = (&self.fail_fstype, req.fstype) {
            if fail == fstype {
                bail!("mounting {} on '{}': EPERM", fstype, req.target.display());
            }
        }
        self.record(MountCall::Mount {
            target: req.target.to_path_buf(),
            fstype: req.fstype.map(str::to_string),
        });
        Ok(())
    }

    fn unmount(&self, target: &Path) -> Result<()> {
        // Record the attempt even when it fails.
        self.record(MountCall::Unmount(target.to_path_buf()));
        if self.fail_unmount.iter().any(|t| t == target) {
            bail!("unmounting '{}': EBUSY", target.display());
        }
        Ok(())
    }

    fn enter_root(&self, root: &Path) -> Result<PathBuf> {
        self.record(MountCall::EnterRoot(root.to_path_buf()));
        Ok(root.to_path_buf())
    }

    fn leave_root(&self, _saved_root: &File) -> Result<()> {
        self.record(MountCall::LeaveRoot);
        Ok(())
    }
}

/// Lets a test keep a handle on mounts it hands to a `BuildContext`.
impl MountOps for Arc<RecordingMounts> {
    fn mount(&self, req: &MountRequest<'_>) -> Result<()> {
        self.as_ref().mount(req)
    }

    fn unmount(&self, target: &Path) -> Result<()> {
        self.as_ref().unmount(target)
    }

    fn enter_root(&self, root: &Path) -> Result<PathBuf> {
        self.as_ref().enter_root(root)
    }

    fn leave_root(&self, saved_root: &File) -> Result<()> {
        self.as_ref().leave_root(saved_root)
    }
}

/// In-memory [`Transport`] that counts network calls.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    files: HashMap<String, Vec<u8>>,
    redirects: HashMap<String, String>,
    resolves: AtomicUsize,
    downloads: AtomicUsize,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, url: &str, bytes: Vec<u8>) -> Self {
        self.files.insert(url.to_string(), bytes);
        self
    }

    pub fn with_redirect(mut self, from: &str, to: &str) -> Self {
        self.redirects.insert(from.to_string(), to.to_string());
        self
    }

    pub fn resolves(&self) -> usize {
        self.resolves.load(Ordering::SeqCst)
    }

    pub fn downloads(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }
}

impl Transport for MemoryTransport {
    fn resolve(&self, url: &str) -> Result<String> {
        self.resolves.fetch_add(1, Ordering::SeqCst);
        Ok(self.redirects.get(url).cloned().unwrap_or_else(|| url.to_string()))
    }

    fn download(&self, url: &str, dest: &Path) -> Result<u64> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        let Some(bytes) = self.files.get(url) else {
            bail!("404 Not Found: {}", url);
        };
        std::fs::write(dest, bytes)?;
        Ok(bytes.len() as u64)
    }
}

impl Transport for Arc<MemoryTransport> {
    fn resolve(&self, url: &str) -> Result<String> {
        self.as_ref().resolve(url)
    }

    fn download(&self, url: &str, dest: &Path) -> Result<u64> {
        self.as_ref().download(url, dest)
    }
}

/// A `tar.gz` holding the given `(path, content)` files.
pub fn tar_gz(files: &[(&str, &str)]) -> Vec<u8> {
    let encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for (path, content) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, path, content.as_bytes()).unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap()
}
