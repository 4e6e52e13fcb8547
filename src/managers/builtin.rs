//! Built-in package managers.
//!
//! Each entry is a command table plus the way the distribution stores
//! repository definitions. Repository files are written directly into the
//! rootfs through the active chroot session.

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

use super::{Commands, Manager, RepoHandler};
use crate::artifact::filesystem::read_to_string_if_exists;
use crate::chroot::ChrootSession;
use crate::definition::{CommandTemplate, Repository};

fn op(cmd: &str, flags: &[&str]) -> CommandTemplate {
    CommandTemplate {
        cmd: cmd.to_string(),
        flags: flags.iter().map(|f| f.to_string()).collect(),
    }
}

/// Look up a built-in manager by name.
pub fn lookup(name: &str) -> Option<Manager> {
    let (cmd, global, repos): (&str, &[&str], RepoHandler) = match name {
        "apk" => ("apk", &["--no-cache"], RepoHandler::Apk),
        "apt" => ("apt-get", &["-y"], RepoHandler::Apt),
        "dnf" => ("dnf", &["-y"], RepoHandler::Yum),
        "yum" => ("yum", &["-y"], RepoHandler::Yum),
        "pacman" => ("pacman", &["--noconfirm"], RepoHandler::Unsupported),
        "zypper" => (
            "zypper",
            &["--non-interactive", "--gpg-auto-import-keys"],
            RepoHandler::Zypper,
        ),
        _ => return None,
    };

    let commands = match name {
        "apk" => Commands {
            install: op(cmd, &["add"]),
            remove: op(cmd, &["del", "--rdepends"]),
            update: op(cmd, &["upgrade"]),
            refresh: op(cmd, &["update"]),
            clean: None,
            global: vec![],
        },
        "apt" => Commands {
            install: op(cmd, &["install"]),
            remove: op(cmd, &["remove", "--auto-remove"]),
            update: op(cmd, &["dist-upgrade"]),
            refresh: op(cmd, &["update"]),
            clean: Some(op(cmd, &["clean"])),
            global: vec![],
        },
        "dnf" | "yum" => Commands {
            install: op(cmd, &["install"]),
            remove: op(cmd, &["remove"]),
            update: op(cmd, &["upgrade"]),
            refresh: op(cmd, &["makecache"]),
            clean: Some(op(cmd, &["clean", "all"])),
            global: vec![],
        },
        "pacman" => Commands {
            install: op(cmd, &["-S", "--needed"]),
            remove: op(cmd, &["-Rcs"]),
            update: op(cmd, &["-Su"]),
            refresh: op(cmd, &["-Syy"]),
            clean: Some(op(cmd, &["-Sc"])),
            global: vec![],
        },
        _ => Commands {
            install: op(cmd, &["install"]),
            remove: op(cmd, &["remove"]),
            update: op(cmd, &["update"]),
            refresh: op(cmd, &["refresh"]),
            clean: Some(op(cmd, &["clean", "-a"])),
            global: vec![],
        },
    };

    Some(Manager {
        name: name.to_string(),
        commands: Commands {
            global: global.iter().map(|f| f.to_string()).collect(),
            ..commands
        },
        repos,
    })
}

fn write_file(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut content = content.to_string();
    if !content.ends_with('\n') {
        content.push('\n');
    }
    fs::write(path, content).with_context(|| format!("writing '{}'", path.display()))
}

fn remove_file(path: &Path) -> Result<()> {
    if path.symlink_metadata().is_ok() {
        fs::remove_file(path).with_context(|| format!("removing '{}'", path.display()))?;
    }
    Ok(())
}

/// `/etc/apk/repositories`: one URL per line.
pub(super) fn apk_repository(session: &ChrootSession<'_>, repo: &Repository) -> Result<()> {
    let path = session.path("/etc/apk/repositories")?;
    let existing = read_to_string_if_exists(&path)?;
    let url = repo.url.trim();
    let mut lines: Vec<&str> = existing.lines().filter(|l| l.trim() != url).collect();
    if !repo.remove {
        lines.push(url);
    }
    write_file(&path, &lines.join("\n"))
}

/// `sources.list.d/<name>.list`, with an optional armored key.
pub(super) fn apt_repository(session: &ChrootSession<'_>, repo: &Repository) -> Result<()> {
    let list = session.path(&format!("/etc/apt/sources.list.d/{}.list", repo.name))?;
    let key = session.path(&format!("/etc/apt/trusted.gpg.d/{}.asc", repo.name))?;
    if repo.remove {
        remove_file(&list)?;
        return remove_file(&key);
    }
    write_file(&list, &repo.url)?;
    if let Some(armored) = &repo.key {
        write_file(&key, armored)?;
    }
    Ok(())
}

/// A `.repo` stanza. A URL that already looks like a repo file is written as-is.
fn rpm_repo_file(repo: &Repository, gpgkey: Option<&str>, extra: &[&str]) -> String {
    if repo.url.trim_start().starts_with('[') {
        return repo.url.clone();
    }
    let mut lines = vec![
        format!("[{}]", repo.name),
        format!("name={}", repo.name),
        format!("baseurl={}", repo.url.trim()),
        "enabled=1".to_string(),
    ];
    lines.extend(extra.iter().map(|l| l.to_string()));
    match gpgkey {
        Some(key) => {
            lines.push("gpgcheck=1".to_string());
            lines.push(format!("gpgkey={key}"));
        }
        None => lines.push("gpgcheck=0".to_string()),
    }
    lines.join("\n")
}

fn rpm_repository(
    session: &ChrootSession<'_>,
    repo: &Repository,
    repo_dir: &str,
    extra: &[&str],
) -> Result<()> {
    let file = session.path(&format!("{repo_dir}/{}.repo", repo.name))?;
    let key_in_image = format!("/etc/pki/rpm-gpg/RPM-GPG-KEY-{}", repo.name);
    let key = session.path(&key_in_image)?;
    if repo.remove {
        remove_file(&file)?;
        return remove_file(&key);
    }
    let gpgkey = match &repo.key {
        Some(armored) => {
            write_file(&key, armored)?;
            Some(format!("file://{key_in_image}"))
        }
        None => None,
    };
    write_file(&file, &rpm_repo_file(repo, gpgkey.as_deref(), extra))
}

pub(super) fn yum_repository(session: &ChrootSession<'_>, repo: &Repository) -> Result<()> {
    rpm_repository(session, repo, "/etc/yum.repos.d", &[])
}

pub(super) fn zypper_repository(session: &ChrootSession<'_>, repo: &Repository) -> Result<()> {
    rpm_repository(session, repo, "/etc/zypp/repos.d", &["autorefresh=1", "type=rpm-md"])
}
