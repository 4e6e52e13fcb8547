//! HTTP access for source downloads.

use anyhow::{bail, Context, Result};
use reqwest::blocking::Client;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Network seam for the source fetcher.
pub trait Transport {
    /// Follow redirects and return the final URL.
    fn resolve(&self, url: &str) -> Result<String>;

    /// Download `url` into `dest`, returning the number of bytes written.
    fn download(&self, url: &str, dest: &Path) -> Result<u64>;
}

/// Split a URL into its base and final path segment.
///
/// Query strings and fragments are not part of the file name.
pub fn split_url(url: &str) -> Result<(String, String)> {
    let without_query = url.split(['?', '#']).next().unwrap_or(url);
    match without_query.rsplit_once('/') {
        Some((base, name)) if !name.is_empty() && base.contains("://") => {
            Ok((base.to_string(), name.to_string()))
        }
        _ => bail!("URL '{}' does not name a file", url),
    }
}

/// Blocking reqwest client. Downloads have no overall timeout.
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(None::<Duration>)
            .user_agent(concat!("rootfs-builder/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("creating HTTP client")?;
        Ok(Self { client })
    }
}

impl Transport for HttpTransport {
    fn resolve(&self, url: &str) -> Result<String> {
        let response = self
            .client
            .head(url)
            .send()
            .with_context(|| format!("couldn't resolve URL '{}'", url))?;
        let resolved = response.url().to_string();
        if resolved != url {
            debug!("{} redirected to {}", url, resolved);
        }
        Ok(resolved)
    }

    fn download(&self, url: &str, dest: &Path) -> Result<u64> {
        info!("downloading {}", url);
        let mut response = self
            .client
            .get(url)
            .send()
            .and_then(|r| r.error_for_status())
            .with_context(|| format!("downloading '{}'", url))?;

        let file = File::create(dest).with_context(|| format!("creating '{}'", dest.display()))?;
        let mut writer = BufWriter::new(file);
        let written = io::copy(&mut response, &mut writer)
            .with_context(|| format!("writing '{}'", dest.display()))?;
        writer.flush()?;
        debug!("downloaded {} bytes from {}", written, url);
        Ok(written)
    }
}
