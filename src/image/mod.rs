//! Output images.
//!
//! An [`Image`] is bound to the working tree and a target directory. File
//! generators register templates on it while the build runs; [`Image::build`]
//! finalizes it exactly once.
//!
//! [`ContainerImage`] writes:
//!
//! ```text
//! <target>/rootfs.tar.zst   the working tree
//! <target>/meta.tar.zst     metadata.yaml, templates/*.tpl, optional config files
//! ```

use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use time::OffsetDateTime;
use tracing::info;

use crate::artifact::filesystem::{atomic_rename, remove_dir_if_exists, tmp_name};
use crate::artifact::tarball::{create_tar_zst, Ownership};
use crate::definition::Definition;

pub const ROOTFS_ARCHIVE: &str = "rootfs.tar.zst";
pub const META_ARCHIVE: &str = "meta.tar.zst";

/// A file rendered by the container runtime at instance creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateEntry {
    pub name: String,
    /// Absolute path inside the instance.
    pub path: String,
    pub content: String,
    pub when: Vec<String>,
    pub create_only: bool,
    pub properties: BTreeMap<String, String>,
}

pub trait Image {
    fn add_template(&mut self, template: TemplateEntry) -> Result<()>;

    /// Finalize into the target directory, returning the artifact paths.
    fn build(&mut self) -> Result<Vec<PathBuf>>;
}

#[derive(Debug, Serialize)]
struct Metadata {
    architecture: String,
    creation_date: i64,
    properties: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    templates: BTreeMap<String, TemplateMetadata>,
}

#[derive(Debug, Serialize)]
struct TemplateMetadata {
    when: Vec<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    create_only: bool,
    template: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    properties: BTreeMap<String, String>,
}

/// Replace `{{ image.<field> }}` placeholders.
pub fn render_image_fields(text: &str, definition: &Definition) -> String {
    let image = &definition.image;
    [
        ("name", &image.name),
        ("release", &image.release),
        ("architecture", &image.architecture),
        ("variant", &image.variant),
    ]
    .iter()
    .fold(text.to_string(), |acc, (field, value)| {
        acc.replace(&format!("{{{{ image.{field} }}}}"), value)
    })
}

/// Container image: rootfs tarball plus a metadata tarball.
pub struct ContainerImage {
    rootfs: PathBuf,
    target_dir: PathBuf,
    /// Scratch space for assembling the metadata tree.
    work_dir: PathBuf,
    architecture: String,
    properties: BTreeMap<String, String>,
    create_message: Option<String>,
    config: Vec<(String, String)>,
    templates: Vec<TemplateEntry>,
    built: bool,
}

impl ContainerImage {
    pub fn new(rootfs: &Path, target_dir: &Path, work_dir: &Path, definition: &Definition) -> Self {
        let image = &definition.image;
        let description = image
            .description
            .as_deref()
            .map(|d| render_image_fields(d, definition))
            .unwrap_or_else(|| {
                format!(
                    "{} {} {} ({})",
                    image.name, image.release, image.architecture, image.variant
                )
            });

        let properties = BTreeMap::from([
            ("os".to_string(), image.name.clone()),
            ("release".to_string(), image.release.clone()),
            ("variant".to_string(), image.variant.clone()),
            ("architecture".to_string(), image.architecture.clone()),
            ("description".to_string(), description),
            ("target".to_string(), definition.targets.kind.to_string()),
        ]);

        let container = &definition.targets.container;
        Self {
            rootfs: rootfs.to_path_buf(),
            target_dir: target_dir.to_path_buf(),
            work_dir: work_dir.to_path_buf(),
            architecture: image.architecture.clone(),
            properties,
            create_message: container
                .create_message
                .as_deref()
                .map(|m| render_image_fields(m, definition)),
            config: container
                .config
                .iter()
                .map(|entry| (entry.kind.clone(), entry.content.clone()))
                .collect(),
            templates: Vec::new(),
            built: false,
        }
    }

    pub fn templates(&self) -> &[TemplateEntry] {
        &self.templates
    }

    fn metadata(&self) -> Metadata {
        let templates = self
            .templates
            .iter()
            .map(|t| {
                (
                    t.path.clone(),
                    TemplateMetadata {
                        when: t.when.clone(),
                        create_only: t.create_only,
                        template: format!("{}.tpl", t.name),
                        properties: t.properties.clone(),
                    },
                )
            })
            .collect();
        Metadata {
            architecture: self.architecture.clone(),
            creation_date: OffsetDateTime::now_utc().unix_timestamp(),
            properties: self.properties.clone(),
            templates,
        }
    }

    fn write_meta_tree(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir.join("templates"))?;
        let yaml = serde_yaml::to_string(&self.metadata()).context("serializing metadata")?;
        fs::write(dir.join("metadata.yaml"), yaml)?;

        for template in &self.templates {
            fs::write(
                dir.join("templates").join(format!("{}.tpl", template.name)),
                &template.content,
            )?;
        }
        if let Some(message) = &self.create_message {
            fs::write(dir.join("create-message"), format!("{}\n", message.trim_end()))?;
        }

        let mut system = String::new();
        let mut user = String::new();
        // `all` entries apply to both privileged and unprivileged containers.
        for (kind, content) in &self.config {
            let line = format!("{}\n", content.trim_end());
            match kind.as_str() {
                "user" => user.push_str(&line),
                "all" => {
                    system.push_str(&line);
                    user.push_str(&line);
                }
                _ => system.push_str(&line),
            }
        }
        if !system.is_empty() {
            fs::write(dir.join("config"), system)?;
        }
        if !user.is_empty() {
            fs::write(dir.join("config-user"), user)?;
        }
        Ok(())
    }

    fn write_archive(&self, src: &Path, name: &str, ownership: Ownership) -> Result<PathBuf> {
        let out = self.target_dir.join(name);
        let tmp = self.target_dir.join(tmp_name(&format!(".{name}")));
        let entries = create_tar_zst(src, &tmp, ownership)
            .with_context(|| format!("writing {}", name))?;
        atomic_rename(&tmp, &out)?;
        info!("wrote {} ({} entries)", out.display(), entries);
        Ok(out)
    }
}

impl Image for ContainerImage {
    fn add_template(&mut self, template: TemplateEntry) -> Result<()> {
        if self.built {
            bail!("image has already been built");
        }
        self.templates.retain(|t| t.path != template.path);
        self.templates.push(template);
        Ok(())
    }

    fn build(&mut self) -> Result<Vec<PathBuf>> {
        if self.built {
            bail!("image has already been built");
        }
        self.built = true;

        fs::create_dir_all(&self.target_dir)
            .with_context(|| format!("creating '{}'", self.target_dir.display()))?;

        let rootfs = self.write_archive(&self.rootfs, ROOTFS_ARCHIVE, Ownership::Preserve)?;

        let meta_dir = self.work_dir.join("meta");
        remove_dir_if_exists(&meta_dir)?;
        self.write_meta_tree(&meta_dir)?;
        let meta = self.write_archive(&meta_dir, META_ARCHIVE, Ownership::Normalize)?;
        remove_dir_if_exists(&meta_dir)?;

        Ok(vec![rootfs, meta])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Read;
    use tempfile::TempDir;

    const DEF: &str = r#"
image:
  name: debian
  release: bookworm
  architecture: amd64
  description: "Debian {{ image.release }}"
targets:
  container:
    create_message: "Welcome to {{ image.name }}"
    config:
      - { type: all, content: "lxc.include = common.conf" }
      - { type: user, content: "lxc.include = userns.conf" }
"#;

    fn read_member(archive: &Path, member: &str) -> Option<String> {
        let decoder = zstd::stream::Decoder::new(File::open(archive).unwrap()).unwrap();
        let mut ar = tar::Archive::new(decoder);
        for entry in ar.entries().unwrap() {
            let mut entry = entry.unwrap();
            if entry.path().unwrap().to_string_lossy() == member {
                let mut s = String::new();
                entry.read_to_string(&mut s).unwrap();
                return Some(s);
            }
        }
        None
    }

    fn image(temp: &TempDir) -> ContainerImage {
        let rootfs = temp.path().join("rootfs");
        fs::create_dir_all(rootfs.join("etc")).unwrap();
        fs::write(rootfs.join("etc/hostname"), "debian\n").unwrap();
        let def = Definition::from_yaml(DEF).unwrap();
        ContainerImage::new(&rootfs, &temp.path().join("out"), &temp.path().join("work"), &def)
    }

    fn hostname_template() -> TemplateEntry {
        TemplateEntry {
            name: "hostname".into(),
            path: "/etc/hostname".into(),
            content: "{{ container.name }}\n".into(),
            when: vec!["create".into(), "copy".into()],
            create_only: false,
            properties: BTreeMap::new(),
        }
    }

    #[test]
    fn build_writes_rootfs_and_metadata() {
        let temp = TempDir::new().unwrap();
        let mut img = image(&temp);
        img.add_template(hostname_template()).unwrap();

        let artifacts = img.build().unwrap();
        assert_eq!(
            artifacts,
            vec![temp.path().join("out/rootfs.tar.zst"), temp.path().join("out/meta.tar.zst")]
        );

        assert_eq!(
            read_member(&artifacts[0], "etc/hostname").as_deref(),
            Some("debian\n")
        );
        let meta = read_member(&artifacts[1], "metadata.yaml").unwrap();
        assert!(meta.contains("architecture: amd64"));
        assert!(meta.contains("description: Debian bookworm"));
        assert!(meta.contains("/etc/hostname:"));
        assert!(meta.contains("template: hostname.tpl"));
        assert_eq!(
            read_member(&artifacts[1], "templates/hostname.tpl").as_deref(),
            Some("{{ container.name }}\n")
        );
        assert_eq!(
            read_member(&artifacts[1], "create-message").as_deref(),
            Some("Welcome to debian\n")
        );
        assert_eq!(
            read_member(&artifacts[1], "config").as_deref(),
            Some("lxc.include = common.conf\n")
        );
        assert_eq!(
            read_member(&artifacts[1], "config-user").as_deref(),
            Some("lxc.include = common.conf\nlxc.include = userns.conf\n")
        );
        assert!(!temp.path().join("work/meta").exists());
    }

    #[test]
    fn build_happens_once() {
        let temp = TempDir::new().unwrap();
        let mut img = image(&temp);
        img.build().unwrap();

        let err = img.build().unwrap_err();
        assert!(err.to_string().contains("image has already been built"));
        assert!(img.add_template(hostname_template()).is_err());
    }

    #[test]
    fn later_template_for_same_path_wins() {
        let temp = TempDir::new().unwrap();
        let mut img = image(&temp);
        img.add_template(hostname_template()).unwrap();
        let mut second = hostname_template();
        second.name = "hostname-v2".into();
        img.add_template(second).unwrap();

        assert_eq!(img.templates().len(), 1);
        assert_eq!(img.templates()[0].name, "hostname-v2");
    }
}
