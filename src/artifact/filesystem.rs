//! Filesystem utilities for working trees.

use anyhow::{bail, Context, Result};
use nix::sys::stat::{mknod, Mode, SFlag};
use nix::unistd::mkfifo;
use std::fs;
use std::os::unix::fs::{lchown, FileTypeExt, MetadataExt, PermissionsExt};
use std::path::{Component, Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

/// Recursively copy a directory, preserving symlinks, permissions and
/// special files.
///
/// Directory modes are applied after their contents so read-only
/// directories can still be filled. Symlinks are recreated, not followed.
/// Fifos, sockets and device nodes are recreated with `mknod`. Ownership is
/// copied only with `preserve_owner` (requires root for foreign owners).
///
/// # Example
///
/// ```rust,ignore
/// use rootfs_builder::artifact::filesystem::copy_dir_recursive;
/// use std::path::Path;
///
/// copy_dir_recursive(Path::new("/tmp/source"), Path::new("/tmp/dest"), false)?;
/// ```
pub fn copy_dir_recursive(src: &Path, dst: &Path, preserve_owner: bool) -> Result<()> {
    if !dst.exists() {
        fs::create_dir_all(dst)
            .with_context(|| format!("creating '{}'", dst.display()))?;
    }

    for entry in fs::read_dir(src)
        .with_context(|| format!("reading '{}'", src.display()))?
    {
        let entry = entry?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());
        let meta = fs::symlink_metadata(&src_path)?;
        let file_type = meta.file_type();

        if file_type.is_symlink() {
            let link = fs::read_link(&src_path)?;
            if dst_path.symlink_metadata().is_ok() {
                fs::remove_file(&dst_path)?;
            }
            std::os::unix::fs::symlink(&link, &dst_path)
                .with_context(|| format!("linking '{}'", dst_path.display()))?;
            if preserve_owner {
                chown(&dst_path, &meta)?;
            }
            continue;
        }

        if file_type.is_dir() {
            copy_dir_recursive(&src_path, &dst_path, preserve_owner)?;
            continue;
        }

        if file_type.is_file() {
            fs::copy(&src_path, &dst_path)
                .with_context(|| format!("copying '{}'", src_path.display()))?;
            apply_metadata(&dst_path, &meta, preserve_owner)?;
            copy_xattrs(&src_path, &dst_path);
        } else {
            make_special(&dst_path, &meta)?;
            apply_metadata(&dst_path, &meta, preserve_owner)?;
        }
    }

    apply_metadata(dst, &fs::metadata(src)?, preserve_owner)
}

fn chown(path: &Path, meta: &fs::Metadata) -> Result<()> {
    lchown(path, Some(meta.uid()), Some(meta.gid()))
        .with_context(|| format!("chown '{}'", path.display()))
}

/// Owner first: chown clears the setuid and setgid bits.
fn apply_metadata(path: &Path, meta: &fs::Metadata, preserve_owner: bool) -> Result<()> {
    if preserve_owner {
        chown(path, meta)?;
    }
    fs::set_permissions(path, fs::Permissions::from_mode(meta.mode() & 0o7777))
        .with_context(|| format!("setting permissions on '{}'", path.display()))
}

/// Best effort: file capabilities and `user.*` attributes. Runs after chown,
/// which drops `security.capability`.
fn copy_xattrs(src: &Path, dst: &Path) {
    let Ok(names) = xattr::list(src) else {
        return;
    };
    for name in names {
        let key = name.to_string_lossy();
        if key != "security.capability" && !key.starts_with("user.") {
            continue;
        }
        if let Ok(Some(value)) = xattr::get(src, &name) {
            if let Err(err) = xattr::set(dst, &name, &value) {
                debug!(path = %dst.display(), "not copying {key}: {err}");
            }
        }
    }
}

/// Recreate a fifo, socket or device node.
fn make_special(path: &Path, meta: &fs::Metadata) -> Result<()> {
    let file_type = meta.file_type();
    let perm = Mode::from_bits_truncate(meta.mode() & 0o7777);
    if path.symlink_metadata().is_ok() {
        fs::remove_file(path)?;
    }

    if file_type.is_fifo() {
        return mkfifo(path, perm).with_context(|| format!("creating fifo '{}'", path.display()));
    }

    let kind = if file_type.is_socket() {
        SFlag::S_IFSOCK
    } else if file_type.is_char_device() {
        SFlag::S_IFCHR
    } else if file_type.is_block_device() {
        SFlag::S_IFBLK
    } else {
        bail!("unsupported file type at '{}'", path.display());
    };
    mknod(path, kind, perm, meta.rdev() as libc::dev_t)
        .with_context(|| format!("creating device node '{}'", path.display()))
}

/// Resolve an absolute in-image path (e.g. `/etc/hostname`) under `root`.
///
/// Rejects `..` components so generated files cannot escape the tree.
pub fn rootfs_path(root: &Path, path: &str) -> Result<PathBuf> {
    let mut resolved = root.to_path_buf();
    for component in Path::new(path).components() {
        match component {
            Component::RootDir | Component::CurDir => {}
            Component::Normal(part) => resolved.push(part),
            Component::ParentDir | Component::Prefix(_) => {
                bail!("path '{}' escapes the root filesystem", path)
            }
        }
    }
    if resolved == root {
        bail!("path '{}' does not name a file inside the root filesystem", path);
    }
    Ok(resolved)
}

/// Contents of `path`, or an empty string when it does not exist. Every other
/// error, invalid UTF-8 included, is returned.
pub fn read_to_string_if_exists(path: &Path) -> Result<String> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(content),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
        Err(err) => Err(err).with_context(|| format!("reading '{}'", path.display())),
    }
}

/// Remove a directory tree if it exists.
pub fn remove_dir_if_exists(path: &Path) -> Result<()> {
    if path.symlink_metadata().is_ok() {
        fs::remove_dir_all(path)
            .with_context(|| format!("Failed to remove {}", path.display()))?;
    }
    Ok(())
}

/// Name for a scratch sibling of a final path: `<prefix>-<nanos>`.
pub fn tmp_name(prefix: &str) -> String {
    let n = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    format!("{prefix}-{n}")
}

/// Move `src` over `dst`, falling back to copy+remove across filesystems.
pub fn atomic_rename(src: &Path, dst: &Path) -> Result<()> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }
    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(_) => {
            // EXDEV: the scratch file lives on another mount.
            fs::copy(src, dst).with_context(|| {
                format!("Failed to copy {} to {}", src.display(), dst.display())
            })?;
            fs::remove_file(src)
                .with_context(|| format!("Failed to remove tmp {}", src.display()))?;
            Ok(())
        }
    }
}
