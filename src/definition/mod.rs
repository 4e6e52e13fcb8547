//! Image definition: the declarative input of a build.
//!
//! A definition is parsed once (YAML), validated, and then only read by the
//! pipeline. Sections mirror the on-disk format:
//!
//! ```yaml
//! image: { name: alpine, release: "3.20", architecture: x86_64 }
//! source: { type: rootfs-http, url: https://example.org/rootfs.tar.gz }
//! packages: { manager: apk, sets: [{ packages: [openssh], action: install }] }
//! files: [{ generator: hostname, path: /etc/hostname }]
//! actions: [{ trigger: post-packages, action: "rc-update add sshd" }]
//! ```

pub mod filter;
pub mod target;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::Read;
use std::path::Path;

pub use filter::{Filter, FilterContext};
pub use target::{ImageTarget, TargetKind};

use crate::error::DefinitionError;

/// Source type that downloads a root filesystem tarball over HTTP.
pub const SOURCE_ROOTFS_HTTP: &str = "rootfs-http";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Definition {
    pub image: ImageSection,
    #[serde(default)]
    pub source: SourceSection,
    #[serde(default)]
    pub targets: Targets,
    #[serde(default)]
    pub packages: Packages,
    #[serde(default)]
    pub files: Vec<FileSpec>,
    #[serde(default)]
    pub actions: Vec<Action>,
    #[serde(default)]
    pub environment: Environment,
    /// Extra bind mounts made available inside the chroot.
    #[serde(default)]
    pub mounts: Vec<ExtraMount>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ImageSection {
    #[serde(alias = "distribution")]
    pub name: String,
    pub release: String,
    pub architecture: String,
    #[serde(default = "default_variant")]
    pub variant: String,
    #[serde(default)]
    pub description: Option<String>,
}

fn default_variant() -> String {
    "default".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceSection {
    #[serde(rename = "type", alias = "downloader", default = "default_source_type")]
    pub kind: String,
    #[serde(default)]
    pub url: Option<String>,
    /// `sha256:<hex>`, `sha512:<hex>` or bare sha256 hex.
    #[serde(default)]
    pub hash: Option<String>,
}

fn default_source_type() -> String {
    SOURCE_ROOTFS_HTTP.to_string()
}

impl Default for SourceSection {
    fn default() -> Self {
        Self {
            kind: default_source_type(),
            url: None,
            hash: None,
        }
    }
}

/// Per-format target configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Targets {
    #[serde(default)]
    pub kind: TargetKind,
    /// Free-form format variant (e.g. `unified`, `split`) matched by `target_types` filters.
    #[serde(rename = "type", default)]
    pub format_type: Option<String>,
    #[serde(default)]
    pub container: ContainerTarget,
    #[serde(default)]
    pub vm: VmTarget,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ContainerTarget {
    #[serde(default)]
    pub create_message: Option<String>,
    #[serde(default)]
    pub config: Vec<ContainerConfigEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ContainerConfigEntry {
    #[serde(rename = "type", default)]
    pub kind: String,
    pub content: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VmTarget {
    #[serde(default)]
    pub filesystem: Option<String>,
    #[serde(default)]
    pub size: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Packages {
    /// Built-in manager name.
    #[serde(default)]
    pub manager: Option<String>,
    #[serde(default)]
    pub custom_manager: Option<CustomManagerDef>,
    #[serde(default)]
    pub update: bool,
    #[serde(default)]
    pub cleanup: bool,
    #[serde(default)]
    pub sets: Vec<PackageSet>,
    #[serde(default)]
    pub repositories: Vec<Repository>,
}

/// A package manager assembled from user-supplied commands.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CustomManagerDef {
    #[serde(default)]
    pub install: Option<CommandTemplate>,
    #[serde(default)]
    pub remove: Option<CommandTemplate>,
    #[serde(default)]
    pub update: Option<CommandTemplate>,
    #[serde(default)]
    pub refresh: Option<CommandTemplate>,
    #[serde(default)]
    pub clean: Option<CommandTemplate>,
    #[serde(default)]
    pub repo_add: Option<CommandTemplate>,
    #[serde(default)]
    pub repo_remove: Option<CommandTemplate>,
    /// Flags appended to every command.
    #[serde(default)]
    pub flags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommandTemplate {
    pub cmd: String,
    #[serde(default)]
    pub flags: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageAction {
    Install,
    Remove,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageSet {
    pub packages: Vec<String>,
    pub action: PackageAction,
    #[serde(flatten)]
    pub filter: Filter,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Repository {
    pub name: String,
    pub url: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub key: Option<String>,
    /// Remove the repository instead of adding it.
    #[serde(default)]
    pub remove: bool,
    #[serde(flatten)]
    pub filter: Filter,
}

/// A file to generate into the working tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileSpec {
    pub generator: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub content: Option<String>,
    /// Host-side source for the `copy` generator.
    #[serde(default)]
    pub source: Option<String>,
    /// Octal file mode, e.g. `"0644"`.
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub template: Option<TemplateSpec>,
    #[serde(flatten)]
    pub filter: Filter,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TemplateSpec {
    #[serde(default)]
    pub when: Vec<String>,
    #[serde(default)]
    pub create_only: bool,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

/// Named pipeline stages that run user actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HookStage {
    PostUnpack,
    PostPackages,
    PostFiles,
}

impl fmt::Display for HookStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookStage::PostUnpack => write!(f, "post-unpack"),
            HookStage::PostPackages => write!(f, "post-packages"),
            HookStage::PostFiles => write!(f, "post-files"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    pub trigger: HookStage,
    /// Script body or inline command.
    pub action: String,
    #[serde(flatten)]
    pub filter: Filter,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Environment {
    #[serde(default)]
    pub clear_defaults: bool,
    #[serde(default)]
    pub variables: Vec<EnvVariable>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EnvVariable {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExtraMount {
    pub source: String,
    pub target: String,
}

impl Definition {
    /// Load a definition from a file, or from stdin when `path` is `-`.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = if path == Path::new("-") {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("reading definition from stdin")?;
            buf
        } else {
            fs::read_to_string(path)
                .with_context(|| format!("reading definition '{}'", path.display()))?
        };
        Self::from_yaml(&raw).with_context(|| format!("parsing definition '{}'", path.display()))
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(raw)?)
    }

    /// Active scope of this build.
    pub fn scope(&self) -> ImageTarget {
        ImageTarget::for_build(self.targets.kind)
    }

    /// Filter context for this image under `scope`.
    pub fn filter_context(&self, scope: ImageTarget) -> FilterContext<'_> {
        FilterContext {
            release: &self.image.release,
            architecture: &self.image.architecture,
            variant: &self.image.variant,
            target_type: self.targets.format_type.as_deref(),
            scope,
        }
    }

    /// Actions for `stage` that apply under `scope`, in definition order.
    pub fn runnable_actions(&self, stage: HookStage, scope: ImageTarget) -> Vec<&Action> {
        let ctx = self.filter_context(scope);
        self.actions
            .iter()
            .filter(|action| action.trigger == stage && action.filter.applies(&ctx))
            .collect()
    }

    /// Structural checks that do not depend on registries.
    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("image.name", &self.image.name),
            ("image.release", &self.image.release),
            ("image.architecture", &self.image.architecture),
        ] {
            if value.trim().is_empty() {
                return Err(DefinitionError::Invalid(format!("{field} must not be empty")).into());
            }
        }

        if self.source.kind != SOURCE_ROOTFS_HTTP {
            return Err(DefinitionError::UnsupportedSource(self.source.kind.clone()).into());
        }

        let filters = self
            .packages
            .sets
            .iter()
            .map(|set| &set.filter)
            .chain(self.packages.repositories.iter().map(|repo| &repo.filter))
            .chain(self.files.iter().map(|file| &file.filter))
            .chain(self.actions.iter().map(|action| &action.filter));
        for filter in filters {
            filter
                .scope()
                .map_err(|err| DefinitionError::Invalid(err.to_string()))?;
        }

        for file in &self.files {
            if let Some(mode) = &file.mode {
                parse_mode(mode).map_err(|err| DefinitionError::Invalid(err.to_string()))?;
            }
        }

        for mount in &self.mounts {
            if !mount.target.starts_with('/') {
                return Err(DefinitionError::Invalid(format!(
                    "mount target '{}' must be absolute",
                    mount.target
                ))
                .into());
            }
        }

        Ok(())
    }
}

/// Parse an octal file mode such as `"0644"` or `"755"`.
pub fn parse_mode(raw: &str) -> Result<u32> {
    let trimmed = raw.trim().trim_start_matches("0o");
    let mode = u32::from_str_radix(trimmed, 8)
        .with_context(|| format!("invalid file mode '{}'", raw))?;
    if mode > 0o7777 {
        bail!("file mode '{}' out of range", raw);
    }
    Ok(mode)
}
