//! Source root filesystems for build-from-scratch mode.
//!
//! The only source type is `rootfs-http`: resolve redirects on the definition
//! URL, download the tarball into the shared cache, verify it, and unpack it.

pub mod cache;
pub mod http;
pub mod unpack;

use anyhow::{Context, Result};
use std::path::Path;
use tracing::info;

pub use cache::{CachedSource, DownloadCache, ExpectedHash};
pub use http::{HttpTransport, Transport};

use crate::definition::{Definition, SOURCE_ROOTFS_HTTP};
use crate::error::DefinitionError;

/// Fetches the definition's source into a cache directory.
pub struct SourceFetcher<'a> {
    cache: DownloadCache,
    transport: &'a dyn Transport,
}

impl<'a> SourceFetcher<'a> {
    pub fn new(cache_dir: &Path, transport: &'a dyn Transport) -> Self {
        Self {
            cache: DownloadCache::new(cache_dir),
            transport,
        }
    }

    pub fn fetch(&self, definition: &Definition) -> Result<CachedSource> {
        let source = &definition.source;
        if source.kind != SOURCE_ROOTFS_HTTP {
            return Err(DefinitionError::UnsupportedSource(source.kind.clone()).into());
        }
        let url = source
            .url
            .as_deref()
            .filter(|url| !url.trim().is_empty())
            .ok_or_else(|| DefinitionError::Invalid("source.url is required".into()))?;
        let expected = source
            .hash
            .as_deref()
            .map(ExpectedHash::parse)
            .transpose()?;

        info!("fetching source {}", url);
        self.cache
            .fetch(&definition.image, url, expected.as_ref(), self.transport)
            .with_context(|| format!("fetching source '{}'", url))
    }
}
