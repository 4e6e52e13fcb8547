//! Release/architecture/variant/target filters.
//!
//! Package sets, repositories, files and actions all embed a [`Filter`].
//! Evaluation is pure: it only compares the filter against the image
//! identity and the active build scope.

use anyhow::Result;
use serde::{Deserialize, Serialize};

use super::target::ImageTarget;

/// Identity values a filter is evaluated against.
#[derive(Debug, Clone, Copy)]
pub struct FilterContext<'a> {
    pub release: &'a str,
    pub architecture: &'a str,
    pub variant: &'a str,
    /// Free-form `targets.type` of the definition.
    pub target_type: Option<&'a str>,
    /// Active build scope.
    pub scope: ImageTarget,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Filter {
    pub releases: Vec<String>,
    pub architectures: Vec<String>,
    pub variants: Vec<String>,
    pub types: Vec<String>,
    pub target_types: Vec<String>,
}

impl Filter {
    /// Target mask declared by `types`.
    pub fn scope(&self) -> Result<ImageTarget> {
        ImageTarget::from_types(&self.types)
    }

    pub fn applies(&self, ctx: &FilterContext<'_>) -> bool {
        if !list_accepts(&self.releases, ctx.release) {
            return false;
        }
        if !list_accepts(&self.architectures, ctx.architecture) {
            return false;
        }
        if !list_accepts(&self.variants, ctx.variant) {
            return false;
        }
        if !self.target_types.is_empty() {
            match ctx.target_type {
                Some(ty) if self.target_types.iter().any(|t| t == ty) => {}
                _ => return false,
            }
        }
        // Invalid `types` are rejected by definition validation; treat them as
        // matching nothing here.
        self.scope()
            .map(|scope| scope.matches(ctx.scope))
            .unwrap_or(false)
    }
}

fn list_accepts(list: &[String], value: &str) -> bool {
    list.is_empty() || list.iter().any(|item| item == value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::target::TargetKind;

    fn ctx() -> FilterContext<'static> {
        FilterContext {
            release: "jammy",
            architecture: "x86_64",
            variant: "default",
            target_type: Some("unified"),
            scope: ImageTarget::for_build(TargetKind::Container),
        }
    }

    #[test]
    fn empty_filter_applies() {
        assert!(Filter::default().applies(&ctx()));
    }

    #[test]
    fn release_mismatch_rejects() {
        let filter = Filter {
            releases: vec!["focal".into()],
            ..Default::default()
        };
        assert!(!filter.applies(&ctx()));
    }

    #[test]
    fn architecture_and_variant_must_both_match() {
        let filter = Filter {
            architectures: vec!["x86_64".into()],
            variants: vec!["cloud".into()],
            ..Default::default()
        };
        assert!(!filter.applies(&ctx()));
    }

    #[test]
    fn target_type_requires_definition_type() {
        let filter = Filter {
            target_types: vec!["split".into()],
            ..Default::default()
        };
        assert!(!filter.applies(&ctx()));

        let mut no_type = ctx();
        no_type.target_type = None;
        let unified = Filter {
            target_types: vec!["unified".into()],
            ..Default::default()
        };
        assert!(unified.applies(&ctx()));
        assert!(!unified.applies(&no_type));
    }

    #[test]
    fn vm_scope_is_skipped_for_container_builds() {
        let filter = Filter {
            types: vec!["vm".into()],
            ..Default::default()
        };
        assert!(!filter.applies(&ctx()));
    }
}
