use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::EnvFilter;

use rootfs_builder::generators::GeneratorRegistry;
use rootfs_builder::managers::Manager;
use rootfs_builder::preflight::check_host;
use rootfs_builder::{pipeline, BuildContext, BuilderConfig, Definition};

/// Build container and VM root filesystem images
#[derive(Parser)]
#[command(name = "rootfs-builder")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Cache directory for downloads and work trees
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,

    /// Builder configuration file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Keep the per-build work directory
    #[arg(long, global = true)]
    keep_work_dir: bool,

    /// Copy the source tree instead of mounting an overlay
    #[arg(long, global = true)]
    no_overlay: bool,

    /// Debug logging
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build an image from scratch
    Build {
        /// Definition file, or - for stdin
        definition: PathBuf,

        /// Output directory
        #[arg(default_value = ".")]
        target_dir: PathBuf,
    },

    /// Build an image from an existing root filesystem
    Pack {
        /// Definition file, or - for stdin
        definition: PathBuf,

        /// Root filesystem to start from
        source_dir: PathBuf,

        /// Output directory
        #[arg(default_value = ".")]
        target_dir: PathBuf,
    },

    /// Check a definition without building
    Validate {
        /// Definition file, or - for stdin
        definition: PathBuf,
    },
}

impl Cli {
    fn builder_config(&self) -> Result<BuilderConfig> {
        let mut config = BuilderConfig::load(self.config.as_deref())?;
        if let Some(dir) = &self.cache_dir {
            config.cache_dir = dir.clone();
        }
        if self.keep_work_dir {
            config.keep_work_dir = true;
        }
        if self.no_overlay {
            config.overlay = false;
        }
        Ok(config)
    }

    fn context(&self, definition: &Path, target_dir: &Path) -> Result<BuildContext> {
        let definition = Definition::load(definition)?;
        BuildContext::new(definition, self.builder_config()?, target_dir)
    }
}

fn main() {
    let cli = Cli::parse();

    let default_level = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(err) = run(&cli) {
        eprintln!("Error: {err:#}");
        std::process::exit(1);
    }
}

fn run(cli: &Cli) -> Result<()> {
    match &cli.command {
        Commands::Build {
            definition,
            target_dir,
        } => {
            check_host(true)?;
            let ctx = cli.context(definition, target_dir)?;
            report(pipeline::build(&ctx)?);
            Ok(())
        }
        Commands::Pack {
            definition,
            source_dir,
            target_dir,
        } => {
            check_host(true)?;
            let ctx = cli.context(definition, target_dir)?;
            report(pipeline::pack(&ctx, source_dir)?);
            Ok(())
        }
        Commands::Validate { definition } => validate(definition),
    }
}

fn validate(path: &Path) -> Result<()> {
    let definition = Definition::load(path)?;
    definition.validate()?;
    let manager = Manager::select(&definition.packages)?;
    GeneratorRegistry::default().check(&definition)?;
    info!(
        "{} {} {} is valid (manager: {})",
        definition.image.name, definition.image.release, definition.image.architecture, manager.name
    );
    println!("{}: ok", path.display());
    Ok(())
}

fn report(artifacts: Vec<PathBuf>) {
    for artifact in artifacts {
        println!("{}", artifact.display());
    }
}
