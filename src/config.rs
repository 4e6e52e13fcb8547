//! Builder configuration (TOML).
//!
//! Host-side settings that do not belong in an image definition:
//!
//! ```toml
//! cache_dir = "/var/cache/rootfs-builder"
//! keep_work_dir = false
//! overlay = true
//!
//! [[capabilities]]
//! path = "/usr/bin/ping"
//! caps = "cap_net_raw+ep"
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::chroot::capabilities::{default_capabilities, CapabilityEntry};

const APP_DIR: &str = "rootfs-builder";
const CONFIG_FILE: &str = "config.toml";
const FALLBACK_CACHE_DIR: &str = "/var/cache/rootfs-builder";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BuilderConfig {
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    /// Leave `<cache_dir>/work/<build-id>` behind for inspection.
    #[serde(default)]
    pub keep_work_dir: bool,
    /// Set to false to always copy the source tree.
    #[serde(default = "default_true")]
    pub overlay: bool,
    #[serde(default = "default_capabilities")]
    pub capabilities: Vec<CapabilityEntry>,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            keep_work_dir: false,
            overlay: true,
            capabilities: default_capabilities(),
        }
    }
}

fn default_true() -> bool {
    true
}

pub fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .map(|dir| dir.join(APP_DIR))
        .unwrap_or_else(|| PathBuf::from(FALLBACK_CACHE_DIR))
}

/// `<config_dir>/rootfs-builder/config.toml`, if the platform has a config dir.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(APP_DIR).join(CONFIG_FILE))
}

impl BuilderConfig {
    pub fn from_toml(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    pub fn load_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading builder config '{}'", path.display()))?;
        Self::from_toml(&raw)
            .with_context(|| format!("parsing builder config '{}'", path.display()))
    }

    /// Load `explicit` if given, else the default config file when it exists,
    /// else built-in defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load_file(path);
        }
        match default_config_path() {
            Some(path) if path.is_file() => Self::load_file(&path),
            _ => {
                debug!("no builder config file, using defaults");
                Ok(Self::default())
            }
        }
    }
}
