//! File generators and their dispatch.
//!
//! Every file spec names a generator. The dispatcher walks the specs in
//! definition order, skips the ones whose filter does not match the image and
//! active scope, and runs the named generator for the rest. A name with no
//! registered generator stops the build.

mod copy;
mod dump;
mod hostname;
mod hosts;
mod remove;
mod template;

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use tracing::{debug, info};

use crate::artifact::filesystem::rootfs_path;
use crate::chroot::{ChrootSession, Sandbox};
use crate::definition::{parse_mode, Definition, FileSpec, ImageTarget};
use crate::error::DefinitionError;
use crate::image::Image;

/// What a generator can reach while it runs.
pub struct GeneratorContext<'a> {
    pub cache_dir: &'a Path,
    pub rootfs: &'a Path,
    pub definition: &'a Definition,
    pub image: &'a mut dyn Image,
    sandbox: &'a Sandbox<'a>,
}

impl<'a> GeneratorContext<'a> {
    pub fn new(
        cache_dir: &'a Path,
        rootfs: &'a Path,
        definition: &'a Definition,
        image: &'a mut dyn Image,
        sandbox: &'a Sandbox<'a>,
    ) -> Self {
        Self {
            cache_dir,
            rootfs,
            definition,
            image,
            sandbox,
        }
    }

    /// Enter the chroot for generators that need tools from the rootfs.
    pub fn chroot(&self) -> Result<ChrootSession<'a>> {
        self.sandbox.enter(self.rootfs)
    }
}

pub trait Generator {
    fn run(&self, ctx: &mut GeneratorContext<'_>, file: &FileSpec) -> Result<()>;
}

/// Generators by name.
pub struct GeneratorRegistry {
    generators: BTreeMap<String, Box<dyn Generator>>,
}

impl Default for GeneratorRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register("copy", Box::new(copy::CopyFile));
        registry.register("dump", Box::new(dump::Dump));
        registry.register("hostname", Box::new(hostname::Hostname));
        registry.register("hosts", Box::new(hosts::Hosts));
        registry.register("remove", Box::new(remove::Remove));
        registry.register("template", Box::new(template::Template));
        registry
    }
}

impl GeneratorRegistry {
    pub fn empty() -> Self {
        Self {
            generators: BTreeMap::new(),
        }
    }

    pub fn register(&mut self, name: &str, generator: Box<dyn Generator>) {
        self.generators.insert(name.to_string(), generator);
    }

    pub fn get(&self, name: &str) -> Option<&dyn Generator> {
        self.generators.get(name).map(|g| g.as_ref())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.generators.keys().map(String::as_str)
    }

    /// Every file spec, matching or not, must name a registered generator.
    pub fn check(&self, definition: &Definition) -> Result<(), DefinitionError> {
        match definition
            .files
            .iter()
            .find(|file| self.get(&file.generator).is_none())
        {
            Some(file) => Err(DefinitionError::UnknownGenerator(file.generator.clone())),
            None => Ok(()),
        }
    }
}

/// Run the generators for every file spec that applies under `scope`.
///
/// Generator errors are returned as-is. Returns the number of specs run.
pub fn dispatch(
    registry: &GeneratorRegistry,
    ctx: &mut GeneratorContext<'_>,
    scope: ImageTarget,
) -> Result<usize> {
    let definition = ctx.definition;
    let filter_ctx = definition.filter_context(scope);
    let mut ran = 0;
    for file in &definition.files {
        if !file.filter.applies(&filter_ctx) {
            debug!(generator = %file.generator, path = %file.path, "filtered out");
            continue;
        }
        let generator = registry
            .get(&file.generator)
            .ok_or_else(|| DefinitionError::UnknownGenerator(file.generator.clone()))?;
        info!("generating {} ({})", file.path, file.generator);
        generator.run(ctx, file)?;
        ran += 1;
    }
    Ok(ran)
}

/// Host path of `file.path` under the rootfs. Empty paths are rejected.
fn target_path(ctx: &GeneratorContext<'_>, file: &FileSpec) -> Result<std::path::PathBuf> {
    if file.path.trim().is_empty() {
        anyhow::bail!("{} generator: path is required", file.generator);
    }
    rootfs_path(ctx.rootfs, &file.path)
}

/// Write `content` to `path`, creating parents and applying the spec's mode.
fn write_file(path: &Path, content: &str, file: &FileSpec, default_mode: u32) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("creating '{}'", parent.display()))?;
    }
    fs::write(path, content).with_context(|| format!("writing '{}'", path.display()))?;
    let mode = match &file.mode {
        Some(mode) => parse_mode(mode)?,
        None => default_mode,
    };
    fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    Ok(())
}
