//! The build pipeline.
//!
//! ```text
//! validate definition, select manager, check generators   (no mutation yet)
//!   -> fetch source (build) | caller's directory (pack)
//!   -> working tree: overlay, or a copy when overlay is unavailable
//!   -> chroot: repositories, post-unpack, packages, post-packages
//!   -> file generators (may re-enter the chroot)
//!   -> chroot: capabilities, post-files
//!   -> image
//! ```
//!
//! Every acquired resource (overlay, chroot session) is a guard value, so an
//! early return from any stage still unmounts what that stage set up.

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::artifact::filesystem::remove_dir_if_exists;
use crate::build::BuildContext;
use crate::chroot::{capabilities, chroot_env, ChrootSession, Sandbox};
use crate::definition::HookStage;
use crate::generators::{dispatch, GeneratorContext};
use crate::hooks::run_hooks;
use crate::image::{ContainerImage, Image};
use crate::managers::{manage_packages, manage_repositories, Manager};
use crate::overlay;
use crate::source::SourceFetcher;

/// Checks that must pass before anything on disk changes.
pub fn prepare(ctx: &BuildContext) -> Result<Manager> {
    ctx.definition.validate()?;
    let manager = Manager::select(&ctx.definition.packages)?;
    ctx.generators.check(&ctx.definition)?;
    Ok(manager)
}

/// Build from scratch: fetch the definition's source, then build on it.
pub fn build(ctx: &BuildContext) -> Result<Vec<PathBuf>> {
    let manager = prepare(ctx)?;
    let image = &ctx.definition.image;
    info!(
        "building {} {} {} ({})",
        image.name, image.release, image.architecture, ctx.definition.targets.kind
    );

    // The cache entry stays locked until `source` drops, after the build.
    let source = SourceFetcher::new(&ctx.cache_dir, ctx.transport.as_ref())
        .fetch(&ctx.definition)?;
    run(ctx, &manager, &source.rootfs)
}

/// Build on an existing root filesystem. `source_dir` is never modified.
pub fn pack(ctx: &BuildContext, source_dir: &Path) -> Result<Vec<PathBuf>> {
    let manager = prepare(ctx)?;
    if !source_dir.is_dir() {
        bail!("source directory '{}' does not exist", source_dir.display());
    }
    let source_dir = source_dir
        .canonicalize()
        .with_context(|| format!("resolving '{}'", source_dir.display()))?;
    info!("packing {}", source_dir.display());
    run(ctx, &manager, &source_dir)
}

fn run(ctx: &BuildContext, manager: &Manager, source: &Path) -> Result<Vec<PathBuf>> {
    let work_dir = ctx.work_dir();
    fs::create_dir_all(&work_dir)
        .with_context(|| format!("creating work directory '{}'", work_dir.display()))?;

    let mut working = overlay::acquire(ctx.mounts.as_ref(), &work_dir, source, ctx.config.overlay)?;
    let result = build_tree(ctx, manager, working.path(), &work_dir);
    let released = working.release();
    let changes = working.changes();
    drop(working);

    let artifacts = match result {
        Ok(artifacts) => artifacts,
        Err(err) => {
            if let Err(release_err) = released {
                warn!("{release_err:#}");
            }
            warn!(
                "work directory left at {} (changes in {})",
                work_dir.display(),
                changes.display()
            );
            return Err(err);
        }
    };
    released?;

    if ctx.config.keep_work_dir {
        info!(
            "keeping work directory {} (changes in {})",
            work_dir.display(),
            changes.display()
        );
    } else {
        remove_dir_if_exists(&work_dir)?;
    }
    Ok(artifacts)
}

fn exit_session(session: ChrootSession<'_>) {
    if let Err(err) = session.exit() {
        warn!("{err}");
    }
}

fn build_tree(
    ctx: &BuildContext,
    manager: &Manager,
    rootfs: &Path,
    work_dir: &Path,
) -> Result<Vec<PathBuf>> {
    let definition = &ctx.definition;
    let scope = ctx.scope();
    let sandbox = Sandbox::new(
        ctx.mounts.as_ref(),
        chroot_env(&definition.environment),
        &definition.mounts,
    );
    let mut image = ContainerImage::new(rootfs, &ctx.target_dir, work_dir, definition);

    let session = sandbox.enter(rootfs).context("failed to setup chroot")?;
    manage_repositories(manager, definition, scope, &session)
        .context("failed to manage repositories")?;
    run_hooks(definition, HookStage::PostUnpack, scope, &session)?;
    manage_packages(manager, definition, scope, &session).context("failed to manage packages")?;
    run_hooks(definition, HookStage::PostPackages, scope, &session)?;
    exit_session(session);

    let mut generator_ctx =
        GeneratorContext::new(&ctx.cache_dir, rootfs, definition, &mut image, &sandbox);
    let generated = dispatch(&ctx.generators, &mut generator_ctx, scope)?;
    info!("generated {} files", generated);

    let session = sandbox.enter(rootfs).context("failed to setup chroot")?;
    capabilities::restore(&session, &ctx.config.capabilities);
    run_hooks(definition, HookStage::PostFiles, scope, &session)?;
    exit_session(session);

    image.build().context("failed to create image")
}
