//! `dump`: write inline content to a file.

use anyhow::Result;

use super::{target_path, write_file, Generator, GeneratorContext};
use crate::definition::FileSpec;
use crate::image::render_image_fields;

pub struct Dump;

impl Generator for Dump {
    fn run(&self, ctx: &mut GeneratorContext<'_>, file: &FileSpec) -> Result<()> {
        let path = target_path(ctx, file)?;
        let content = render_image_fields(file.content.as_deref().unwrap_or_default(), ctx.definition);
        write_file(&path, &content, file, 0o644)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generators::testing::Fixture;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    #[test]
    fn writes_content_and_mode() {
        let fx = Fixture::new();
        let spec = fx.spec(
            "{ generator: dump, path: /etc/motd, content: 'Welcome to {{ image.name }}', mode: '0600' }",
        );

        fx.run(&Dump, &spec).unwrap();

        let path = fx.rootfs().join("etc/motd");
        assert_eq!(fs::read_to_string(&path).unwrap(), "Welcome to alpine");
        assert_eq!(fs::metadata(&path).unwrap().permissions().mode() & 0o7777, 0o600);
    }

    #[test]
    fn path_is_required() {
        let fx = Fixture::new();
        let spec = fx.spec("{ generator: dump, content: x }");
        assert!(fx.run(&Dump, &spec).is_err());
    }
}
