//! `hostname`: write the image name to `/etc/hostname`.
//!
//! Container images also get a template so the runtime can substitute the
//! instance name on create and copy.

use anyhow::Result;
use std::collections::BTreeMap;

use super::{write_file, Generator, GeneratorContext};
use crate::artifact::filesystem::rootfs_path;
use crate::definition::{FileSpec, TargetKind};
use crate::image::TemplateEntry;

const DEFAULT_PATH: &str = "/etc/hostname";

pub struct Hostname;

impl Generator for Hostname {
    fn run(&self, ctx: &mut GeneratorContext<'_>, file: &FileSpec) -> Result<()> {
        let in_image = if file.path.trim().is_empty() {
            DEFAULT_PATH
        } else {
            file.path.as_str()
        };
        let path = rootfs_path(ctx.rootfs, in_image)?;
        write_file(&path, &format!("{}\n", ctx.definition.image.name), file, 0o644)?;

        if ctx.definition.targets.kind == TargetKind::Container {
            ctx.image.add_template(TemplateEntry {
                name: "hostname".to_string(),
                path: in_image.to_string(),
                content: "{{ container.name }}\n".to_string(),
                when: vec!["create".to_string(), "copy".to_string()],
                create_only: false,
                properties: BTreeMap::new(),
            })?;
        }
        Ok(())
    }
}
