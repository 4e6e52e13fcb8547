//! Privileged filesystem syscalls behind a seam.
//!
//! Overlay construction and the chroot sandbox only talk to the host through
//! [`MountOps`]. [`HostMounts`] performs the real syscalls; tests substitute a
//! recording implementation.

use anyhow::{bail, Context, Result};
use nix::mount::{MntFlags, MsFlags};
use std::ffi::CString;
use std::fs::File;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

/// One mount(2) call.
#[derive(Debug, Clone, Copy)]
pub struct MountRequest<'a> {
    pub source: Option<&'a Path>,
    pub target: &'a Path,
    pub fstype: Option<&'a str>,
    pub flags: MsFlags,
    pub data: Option<&'a str>,
}

pub trait MountOps {
    fn mount(&self, req: &MountRequest<'_>) -> Result<()>;

    fn unmount(&self, target: &Path) -> Result<()>;

    /// Make `root` the process root. Returns the path under which the new
    /// root is reachable afterwards.
    fn enter_root(&self, root: &Path) -> Result<PathBuf>;

    /// Return to the root that `saved_root` (opened on `/` before entering) refers to.
    fn leave_root(&self, saved_root: &File) -> Result<()>;
}

/// Real mount/umount/chroot on the running host.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostMounts;

impl MountOps for HostMounts {
    fn mount(&self, req: &MountRequest<'_>) -> Result<()> {
        nix::mount::mount(req.source, req.target, req.fstype, req.flags, req.data).with_context(
            || {
                format!(
                    "mounting {} on '{}'",
                    req.fstype.unwrap_or("bind"),
                    req.target.display()
                )
            },
        )
    }

    fn unmount(&self, target: &Path) -> Result<()> {
        nix::mount::umount2(target, MntFlags::MNT_DETACH)
            .with_context(|| format!("unmounting '{}'", target.display()))
    }

    fn enter_root(&self, root: &Path) -> Result<PathBuf> {
        let root_cstr = CString::new(root.as_os_str().as_bytes())
            .with_context(|| format!("invalid root path '{}'", root.display()))?;
        unsafe {
            if libc::chdir(root_cstr.as_ptr()) != 0 {
                bail!(
                    "chdir to '{}' failed: {}",
                    root.display(),
                    std::io::Error::last_os_error()
                );
            }
            if libc::chroot(c".".as_ptr()) != 0 {
                bail!(
                    "chroot into '{}' failed: {}",
                    root.display(),
                    std::io::Error::last_os_error()
                );
            }
            if libc::chdir(c"/".as_ptr()) != 0 {
                bail!("chdir after chroot failed: {}", std::io::Error::last_os_error());
            }
        }
        Ok(PathBuf::from("/"))
    }

    fn leave_root(&self, saved_root: &File) -> Result<()> {
        unsafe {
            if libc::fchdir(saved_root.as_raw_fd()) != 0 {
                bail!(
                    "fchdir to saved root failed: {}",
                    std::io::Error::last_os_error()
                );
            }
            if libc::chroot(c".".as_ptr()) != 0 {
                bail!(
                    "chroot back to saved root failed: {}",
                    std::io::Error::last_os_error()
                );
            }
        }
        Ok(())
    }
}
