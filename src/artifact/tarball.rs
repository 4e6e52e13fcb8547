//! Deterministic `tar.zst` writer used for image output.

use anyhow::{Context, Result};
use std::fs::{self, File};
use std::io::Write;
use nix::sys::stat::{major, minor};
use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use tar::Builder as TarBuilder;
use tracing::debug;
use walkdir::WalkDir;

/// How entry headers are stamped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    /// Carry uid, gid and mtime from the source tree (root filesystems).
    Preserve,
    /// Zero uid, gid and mtime (metadata archives).
    Normalize,
}

/// Archive every entry under `src_dir` into `out_path`, sorted by relative path.
///
/// With [`Ownership::Preserve`] extended attributes (file capabilities among
/// them) are carried as `SCHILY.xattr.*` PAX records. Sockets are skipped.
pub fn create_tar_zst(src_dir: &Path, out_path: &Path, ownership: Ownership) -> Result<u64> {
    let out = File::create(out_path)
        .with_context(|| format!("Failed to create {}", out_path.display()))?;
    let encoder = zstd::stream::Encoder::new(out, 3)?;
    let mut builder = TarBuilder::new(encoder);

    let mut entries: Vec<PathBuf> = vec![];
    for ent in WalkDir::new(src_dir).follow_links(false) {
        let ent = ent.with_context(|| format!("Failed to walk {}", src_dir.display()))?;
        if ent.path() == src_dir {
            continue;
        }
        entries.push(ent.into_path());
    }
    entries.sort_by(|a, b| {
        let ra = a.strip_prefix(src_dir).unwrap_or(a);
        let rb = b.strip_prefix(src_dir).unwrap_or(b);
        ra.cmp(rb)
    });

    let mut written = 0u64;
    for p in entries {
        let rel = p.strip_prefix(src_dir).unwrap_or(&p).to_path_buf();
        let md = fs::symlink_metadata(&p)?;

        let mut header = tar::Header::new_gnu();
        header.set_mode(md.permissions().mode() & 0o7777);
        match ownership {
            Ownership::Preserve => {
                header.set_uid(u64::from(md.uid()));
                header.set_gid(u64::from(md.gid()));
                header.set_mtime(md.mtime().max(0) as u64);
            }
            Ownership::Normalize => {
                header.set_uid(0);
                header.set_gid(0);
                header.set_mtime(0);
            }
        }

        let file_type = md.file_type();
        if file_type.is_socket() {
            debug!(path = %p.display(), "skipping socket");
            continue;
        }
        if ownership == Ownership::Preserve && !file_type.is_symlink() {
            let records = xattr_records(&p)?;
            append_pax_records(&mut builder, &records)?;
        }

        if md.is_dir() {
            header.set_entry_type(tar::EntryType::Directory);
            header.set_size(0);
            header.set_cksum();
            builder.append_data(&mut header, &rel, std::io::empty())?;
        } else if file_type.is_symlink() {
            let target = fs::read_link(&p)?;
            header.set_entry_type(tar::EntryType::Symlink);
            header.set_size(0);
            builder.append_link(&mut header, &rel, &target)?;
        } else if md.is_file() {
            let mut f = File::open(&p)?;
            header.set_entry_type(tar::EntryType::Regular);
            header.set_size(md.len());
            header.set_cksum();
            builder
                .append_data(&mut header, &rel, &mut f)
                .with_context(|| format!("Failed to archive {}", p.display()))?;
        } else {
            let kind = if file_type.is_fifo() {
                tar::EntryType::Fifo
            } else if file_type.is_char_device() {
                tar::EntryType::Char
            } else {
                tar::EntryType::Block
            };
            header.set_entry_type(kind);
            header.set_size(0);
            header.set_device_major(major(md.rdev()) as u32)?;
            header.set_device_minor(minor(md.rdev()) as u32)?;
            header.set_cksum();
            builder.append_data(&mut header, &rel, std::io::empty())?;
        }
        written += 1;
    }

    let encoder = builder
        .into_inner()
        .with_context(|| "Failed to finalize tar builder")?;
    encoder.finish()?;
    Ok(written)
}

/// Write a PAX extended header (`x`) applying `records` to the next entry.
fn append_pax_records<W: Write>(
    builder: &mut TarBuilder<W>,
    records: &[(String, Vec<u8>)],
) -> Result<()> {
    if records.is_empty() {
        return Ok(());
    }
    let mut data = Vec::new();
    for (key, value) in records {
        // "<len> <key>=<value>\n", where <len> counts its own digits.
        let base = key.len() + value.len() + 3;
        let mut len = base;
        loop {
            let total = base + len.to_string().len();
            if total == len {
                break;
            }
            len = total;
        }
        data.extend_from_slice(format!("{len} {key}=").as_bytes());
        data.extend_from_slice(value);
        data.push(b'\n');
    }

    let mut header = tar::Header::new_ustar();
    header.set_path("@PaxHeader")?;
    header.set_entry_type(tar::EntryType::XHeader);
    header.set_mode(0o644);
    header.set_size(data.len() as u64);
    header.set_cksum();
    builder.append(&header, data.as_slice())?;
    Ok(())
}

/// Extended attributes of `path` as PAX records, sorted by name.
///
/// Filesystems without xattr support yield no records.
fn xattr_records(path: &Path) -> Result<Vec<(String, Vec<u8>)>> {
    let names = match xattr::list(path) {
        Ok(names) => names,
        Err(err) if err.raw_os_error() == Some(libc::ENOTSUP) => return Ok(Vec::new()),
        Err(err) => {
            return Err(err).with_context(|| format!("listing xattrs of {}", path.display()))
        }
    };

    let mut records = Vec::new();
    for name in names {
        let value = xattr::get(path, &name)
            .with_context(|| format!("reading xattrs of {}", path.display()))?;
        if let Some(value) = value {
            records.push((format!("SCHILY.xattr.{}", name.to_string_lossy()), value));
        }
    }
    records.sort();
    Ok(records)
}
