//! `copy`: copy a host file or directory into the rootfs.

use anyhow::{bail, Context, Result};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use super::{target_path, Generator, GeneratorContext};
use crate::artifact::filesystem::copy_dir_recursive;
use crate::definition::{parse_mode, FileSpec};

pub struct CopyFile;

impl Generator for CopyFile {
    fn run(&self, ctx: &mut GeneratorContext<'_>, file: &FileSpec) -> Result<()> {
        let Some(source) = file.source.as_deref() else {
            bail!("copy generator: source is required for '{}'", file.path);
        };
        let source = Path::new(source);
        let dest = target_path(ctx, file)?;

        let meta = fs::metadata(source)
            .with_context(|| format!("copy generator: reading '{}'", source.display()))?;
        if meta.is_dir() {
            copy_dir_recursive(source, &dest, false)?;
        } else {
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(source, &dest).with_context(|| {
                format!("copying '{}' to '{}'", source.display(), file.path)
            })?;
        }

        if let Some(mode) = &file.mode {
            fs::set_permissions(&dest, fs::Permissions::from_mode(parse_mode(mode)?))?;
        }
        Ok(())
    }
}
