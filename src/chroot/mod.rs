//! Chroot sandbox around a working root filesystem.
//!
//! [`Sandbox::enter`] mounts the pseudo-filesystems and the definition's extra
//! bind mounts into the rootfs, then makes it the process root. The returned
//! [`ChrootSession`] unmounts everything again on [`ChrootSession::exit`] or,
//! failing that, on drop.

pub mod capabilities;

use anyhow::{Context, Result};
use nix::mount::MsFlags;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::artifact::filesystem::rootfs_path;
use crate::definition::{Environment, ExtraMount};
use crate::error::TeardownErrors;
use crate::mount::{MountOps, MountRequest};
use crate::process::Cmd;

const RESOLV_CONF: &str = "/etc/resolv.conf";
const RESOLV_BACKUP: &str = "etc/resolv.conf.rootfs-builder";

/// Environment for commands run inside the sandbox.
///
/// Starts from a minimal root environment unless `clear_defaults` is set;
/// definition variables override the defaults.
pub fn chroot_env(environment: &Environment) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    if !environment.clear_defaults {
        env.insert("PATH".into(), "/usr/sbin:/usr/bin:/sbin:/bin".into());
        env.insert("SHELL".into(), "/bin/sh".into());
        env.insert("USER".into(), "root".into());
        env.insert("LANG".into(), "C.UTF-8".into());
        if let Ok(term) = std::env::var("TERM") {
            env.insert("TERM".into(), term);
        }
    }
    for var in &environment.variables {
        env.insert(var.key.clone(), var.value.clone());
    }
    env
}

#[derive(Debug, Clone)]
enum MountKind {
    Pseudo { fstype: &'static str, source: &'static str },
    Bind { source: PathBuf, recursive: bool },
}

#[derive(Debug, Clone)]
struct MountSpec {
    /// Absolute path inside the image.
    target: String,
    kind: MountKind,
    is_file: bool,
}

fn default_mounts(resolv_source: Option<&Path>) -> Vec<MountSpec> {
    let pseudo = |target: &str, fstype: &'static str, source: &'static str| MountSpec {
        target: target.to_string(),
        kind: MountKind::Pseudo { fstype, source },
        is_file: false,
    };
    let mut mounts = vec![
        pseudo("/proc", "proc", "proc"),
        pseudo("/sys", "sysfs", "sysfs"),
        MountSpec {
            target: "/dev".to_string(),
            kind: MountKind::Bind {
                source: PathBuf::from("/dev"),
                recursive: true,
            },
            is_file: false,
        },
        pseudo("/run", "tmpfs", "tmpfs"),
        pseudo("/tmp", "tmpfs", "tmpfs"),
    ];
    if let Some(source) = resolv_source {
        mounts.push(MountSpec {
            target: RESOLV_CONF.to_string(),
            kind: MountKind::Bind {
                source: source.to_path_buf(),
                recursive: false,
            },
            is_file: true,
        });
    }
    mounts
}

/// Factory for chroot sessions sharing one mount backend and environment.
pub struct Sandbox<'a> {
    ops: &'a dyn MountOps,
    env: BTreeMap<String, String>,
    extra: Vec<ExtraMount>,
    resolv_source: Option<PathBuf>,
}

impl<'a> Sandbox<'a> {
    pub fn new(ops: &'a dyn MountOps, env: BTreeMap<String, String>, extra: &[ExtraMount]) -> Self {
        let host_resolv = Path::new(RESOLV_CONF);
        Self {
            ops,
            env,
            extra: extra.to_vec(),
            resolv_source: host_resolv.exists().then(|| host_resolv.to_path_buf()),
        }
    }

    /// Skip the host resolv.conf bind mount.
    pub fn without_resolv_conf(mut self) -> Self {
        self.resolv_source = None;
        self
    }

    fn mounts(&self) -> Vec<MountSpec> {
        let mut mounts = default_mounts(self.resolv_source.as_deref());
        for extra in &self.extra {
            let source = PathBuf::from(&extra.source);
            mounts.push(MountSpec {
                target: extra.target.clone(),
                is_file: source.is_file(),
                kind: MountKind::Bind {
                    source,
                    recursive: true,
                },
            });
        }
        mounts
    }

    /// Mount everything into `rootfs` and chroot into it.
    ///
    /// A failure part-way through undoes the mounts already made.
    pub fn enter(&self, rootfs: &Path) -> Result<ChrootSession<'a>> {
        let mut session = ChrootSession {
            ops: self.ops,
            rootfs: rootfs.to_path_buf(),
            effective_root: rootfs.to_path_buf(),
            env: self.env.clone(),
            saved_root: None,
            saved_cwd: None,
            mounted: Vec::new(),
            resolv_moved: false,
            finished: false,
        };

        if let Err(err) = session.setup(&self.mounts()) {
            if let Err(teardown) = session.teardown() {
                warn!("{teardown}");
            }
            return Err(err.context(format!("entering chroot '{}'", rootfs.display())));
        }
        debug!(root = %rootfs.display(), mounts = session.mounted.len(), "entered chroot");
        Ok(session)
    }
}

/// An entered sandbox. Tear it down with [`exit`](Self::exit).
pub struct ChrootSession<'a> {
    ops: &'a dyn MountOps,
    rootfs: PathBuf,
    effective_root: PathBuf,
    env: BTreeMap<String, String>,
    saved_root: Option<File>,
    saved_cwd: Option<PathBuf>,
    /// Host paths, in mount order.
    mounted: Vec<PathBuf>,
    resolv_moved: bool,
    finished: bool,
}

impl<'a> ChrootSession<'a> {
    fn setup(&mut self, mounts: &[MountSpec]) -> Result<()> {
        for spec in mounts {
            let target = rootfs_path(&self.rootfs, &spec.target)?;
            if spec.target == RESOLV_CONF {
                self.move_resolv_symlink(&target)?;
            }
            prepare_target(&target, spec.is_file)?;

            let req = match &spec.kind {
                MountKind::Pseudo { fstype, source } => MountRequest {
                    source: Some(Path::new(*source)),
                    target: &target,
                    fstype: Some(*fstype),
                    flags: MsFlags::empty(),
                    data: None,
                },
                MountKind::Bind { source, recursive } => {
                    let mut flags = MsFlags::MS_BIND;
                    if *recursive {
                        flags |= MsFlags::MS_REC;
                    }
                    MountRequest {
                        source: Some(source.as_path()),
                        target: &target,
                        fstype: None,
                        flags,
                        data: None,
                    }
                }
            };
            self.ops.mount(&req)?;
            self.mounted.push(target);
        }

        let saved = File::open("/").context("opening current root")?;
        self.saved_cwd = std::env::current_dir().ok();
        self.effective_root = self.ops.enter_root(&self.rootfs)?;
        self.saved_root = Some(saved);
        Ok(())
    }

    fn move_resolv_symlink(&mut self, target: &Path) -> Result<()> {
        let is_link = target
            .symlink_metadata()
            .map(|m| m.file_type().is_symlink())
            .unwrap_or(false);
        if is_link {
            let backup = self.rootfs.join(RESOLV_BACKUP);
            fs::rename(target, &backup)
                .with_context(|| format!("moving aside '{}'", target.display()))?;
            self.resolv_moved = true;
        }
        Ok(())
    }

    /// Where the rootfs is reachable while the session is active.
    pub fn root(&self) -> &Path {
        &self.effective_root
    }

    /// Absolute in-image path as seen by this process while inside.
    pub fn path(&self, in_image: &str) -> Result<PathBuf> {
        rootfs_path(&self.effective_root, in_image)
    }

    /// A command that runs inside the sandbox with the sandbox environment.
    pub fn command(&self, program: impl AsRef<std::ffi::OsStr>) -> Cmd {
        Cmd::new(program)
            .env_exact(&self.env)
            .current_dir(&self.effective_root)
    }

    /// Leave the chroot and unmount everything, in reverse mount order.
    pub fn exit(mut self) -> Result<(), TeardownErrors> {
        self.teardown()
    }

    fn teardown(&mut self) -> Result<(), TeardownErrors> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;

        let mut errors = TeardownErrors::default();
        if let Some(saved) = self.saved_root.take() {
            if let Err(err) = self.ops.leave_root(&saved) {
                errors.record("leaving chroot", &err);
            }
            if let Some(cwd) = self.saved_cwd.take() {
                if let Err(err) = std::env::set_current_dir(&cwd) {
                    errors.record(format!("restoring cwd '{}'", cwd.display()), &err.into());
                }
            }
        }
        while let Some(target) = self.mounted.pop() {
            if let Err(err) = self.ops.unmount(&target) {
                errors.record(format!("unmounting '{}'", target.display()), &err);
            }
        }
        if self.resolv_moved {
            if let Err(err) = self.restore_resolv_conf() {
                errors.record("restoring resolv.conf", &err);
            }
        }
        debug!(root = %self.rootfs.display(), "left chroot");
        errors.into_result()
    }

    fn restore_resolv_conf(&mut self) -> Result<()> {
        let target = self.rootfs.join(&RESOLV_CONF[1..]);
        if target.symlink_metadata().is_ok() {
            fs::remove_file(&target)?;
        }
        fs::rename(self.rootfs.join(RESOLV_BACKUP), &target)?;
        self.resolv_moved = false;
        Ok(())
    }
}

impl Drop for ChrootSession<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.teardown() {
            warn!("{err}");
        }
    }
}

fn prepare_target(target: &Path, is_file: bool) -> Result<()> {
    if is_file {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        if target.symlink_metadata().is_err() {
            File::create(target).with_context(|| format!("creating '{}'", target.display()))?;
        }
    } else {
        fs::create_dir_all(target).with_context(|| format!("creating '{}'", target.display()))?;
    }
    Ok(())
}
