//! `hosts`: make `/etc/hosts` resolve the image's own hostname.

use anyhow::Result;
use std::collections::BTreeMap;

use super::{write_file, Generator, GeneratorContext};
use crate::artifact::filesystem::{read_to_string_if_exists, rootfs_path};
use crate::definition::{FileSpec, TargetKind};
use crate::image::TemplateEntry;

const DEFAULT_PATH: &str = "/etc/hosts";
const LOCALHOST: &str = "127.0.0.1\tlocalhost";
const SELF_ADDR: &str = "127.0.1.1";

/// Existing entries with the self address replaced by one for `name`.
fn hosts_content(existing: &str, name: &str) -> String {
    let mut lines: Vec<String> = existing
        .lines()
        .filter(|line| line.split_whitespace().next() != Some(SELF_ADDR))
        .map(str::to_string)
        .collect();
    let has_localhost = lines.iter().any(|line| {
        let mut fields = line.split_whitespace();
        fields.next() == Some("127.0.0.1") && fields.any(|f| f == "localhost")
    });
    if !has_localhost {
        lines.insert(0, LOCALHOST.to_string());
    }
    let at = lines
        .iter()
        .position(|line| line.starts_with("127.0.0.1"))
        .map_or(lines.len(), |i| i + 1);
    lines.insert(at, format!("{SELF_ADDR}\t{name}"));

    let mut out = lines.join("\n");
    out.push('\n');
    out
}

pub struct Hosts;

impl Generator for Hosts {
    fn run(&self, ctx: &mut GeneratorContext<'_>, file: &FileSpec) -> Result<()> {
        let in_image = if file.path.trim().is_empty() {
            DEFAULT_PATH
        } else {
            file.path.as_str()
        };
        let path = rootfs_path(ctx.rootfs, in_image)?;
        let existing = read_to_string_if_exists(&path)?;
        let content = hosts_content(&existing, &ctx.definition.image.name);
        write_file(&path, &content, file, 0o644)?;

        if ctx.definition.targets.kind == TargetKind::Container {
            ctx.image.add_template(TemplateEntry {
                name: "hosts".to_string(),
                path: in_image.to_string(),
                content: hosts_content(&existing, "{{ container.name }}"),
                when: vec!["create".to_string(), "copy".to_string()],
                create_only: false,
                properties: BTreeMap::new(),
            })?;
        }
        Ok(())
    }
}
