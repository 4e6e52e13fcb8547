//! `remove`: delete a file or directory from the rootfs.

use anyhow::{Context, Result};
use std::fs;
use tracing::debug;

use super::{target_path, Generator, GeneratorContext};
use crate::definition::FileSpec;

pub struct Remove;

impl Generator for Remove {
    fn run(&self, ctx: &mut GeneratorContext<'_>, file: &FileSpec) -> Result<()> {
        let path = target_path(ctx, file)?;
        let meta = match path.symlink_metadata() {
            Ok(meta) => meta,
            Err(_) => {
                debug!("{} already absent", file.path);
                return Ok(());
            }
        };
        if meta.is_dir() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        }
        .with_context(|| format!("removing '{}'", file.path))
    }
}
