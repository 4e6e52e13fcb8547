//! `template`: register a runtime template on the image.

use anyhow::{bail, Result};

use super::{Generator, GeneratorContext};
use crate::definition::FileSpec;
use crate::image::{render_image_fields, TemplateEntry};

pub struct Template;

impl Generator for Template {
    fn run(&self, ctx: &mut GeneratorContext<'_>, file: &FileSpec) -> Result<()> {
        let Some(name) = file.name.as_deref().filter(|n| !n.is_empty()) else {
            bail!("template generator: name is required for '{}'", file.path);
        };
        let Some(content) = file.content.as_deref() else {
            bail!("template generator: content is required for '{}'", name);
        };
        if !file.path.starts_with('/') {
            bail!("template generator: '{}' needs an absolute path", name);
        }

        let spec = file.template.clone().unwrap_or_default();
        let when = if spec.when.is_empty() {
            vec!["create".to_string(), "copy".to_string()]
        } else {
            spec.when
        };
        ctx.image.add_template(TemplateEntry {
            name: name.to_string(),
            path: file.path.clone(),
            content: render_image_fields(content, ctx.definition),
            when,
            create_only: spec.create_only,
            properties: spec.properties,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generators::testing::Fixture;

    #[test]
    fn registers_with_defaults_and_overrides() {
        let fx = Fixture::new();
        let templates = fx
            .run_collect(
                &Template,
                &fx.spec("{ generator: template, name: motd, path: /etc/motd, content: '{{ image.name }} on {{ container.name }}' }"),
            )
            .unwrap();
        assert_eq!(templates[0].content, "alpine on {{ container.name }}");
        assert_eq!(templates[0].when, vec!["create", "copy"]);
        assert!(!fx.rootfs().join("etc/motd").exists());

        let templates = fx
            .run_collect(
                &Template,
                &fx.spec("{ generator: template, name: net, path: /etc/network, content: x, template: { when: [start], create_only: true, properties: { a: b } } }"),
            )
            .unwrap();
        assert_eq!(templates[0].when, vec!["start"]);
        assert!(templates[0].create_only);
        assert_eq!(templates[0].properties.get("a").map(String::as_str), Some("b"));
    }

    #[test]
    fn name_is_required() {
        let fx = Fixture::new();
        let err = fx
            .run(&Template, &fx.spec("{ generator: template, path: /etc/motd, content: x }"))
            .unwrap_err();
        assert!(err.to_string().contains("name is required"));
    }
}
