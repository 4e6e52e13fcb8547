//! Build target scopes.
//!
//! Every package set, repository, file and action carries an [`ImageTarget`]
//! mask derived from its `types` list. The build itself runs with an active
//! mask (see [`ImageTarget::for_build`]) and an item only applies when its
//! mask matches the active one.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};

/// Bitmask over {Undefined, All, Container, VM}.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ImageTarget(u8);

impl ImageTarget {
    pub const NONE: ImageTarget = ImageTarget(0);
    /// Item declared no `types`.
    pub const UNDEFINED: ImageTarget = ImageTarget(1);
    pub const ALL: ImageTarget = ImageTarget(1 << 1);
    pub const CONTAINER: ImageTarget = ImageTarget(1 << 2);
    pub const VM: ImageTarget = ImageTarget(1 << 3);

    const KINDS: ImageTarget = ImageTarget(Self::CONTAINER.0 | Self::VM.0);

    /// Active scope for a build of the given kind.
    ///
    /// Untargeted items and items scoped to `all` run in every build.
    pub fn for_build(kind: TargetKind) -> Self {
        Self::UNDEFINED | Self::ALL | kind.as_target()
    }

    /// Scope of an item from its `types` list.
    pub fn from_types(types: &[String]) -> Result<Self> {
        if types.is_empty() {
            return Ok(Self::UNDEFINED);
        }
        let mut mask = Self::NONE;
        for ty in types {
            mask |= match ty.trim().to_ascii_lowercase().as_str() {
                "container" => Self::CONTAINER,
                "vm" => Self::VM,
                "all" => Self::ALL,
                other => bail!(
                    "unsupported target type '{}' (expected 'container', 'vm' or 'all')",
                    other
                ),
            };
        }
        Ok(mask)
    }

    pub fn contains(self, other: ImageTarget) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    pub fn intersects(self, other: ImageTarget) -> bool {
        self.0 & other.0 != 0
    }

    /// Whether an item with this scope runs under the `active` build scope.
    pub fn matches(self, active: ImageTarget) -> bool {
        if self.contains(Self::ALL) {
            return true;
        }
        if self == Self::UNDEFINED {
            return active.contains(Self::UNDEFINED);
        }
        (self & active).intersects(Self::KINDS)
    }
}

impl BitOr for ImageTarget {
    type Output = ImageTarget;

    fn bitor(self, rhs: Self) -> Self {
        ImageTarget(self.0 | rhs.0)
    }
}

impl BitOrAssign for ImageTarget {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for ImageTarget {
    type Output = ImageTarget;

    fn bitand(self, rhs: Self) -> Self {
        ImageTarget(self.0 & rhs.0)
    }
}

/// The kind of image a build produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    #[default]
    Container,
    Vm,
}

impl TargetKind {
    pub fn as_target(self) -> ImageTarget {
        match self {
            TargetKind::Container => ImageTarget::CONTAINER,
            TargetKind::Vm => ImageTarget::VM,
        }
    }
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetKind::Container => write!(f, "container"),
            TargetKind::Vm => write!(f, "virtual-machine"),
        }
    }
}
