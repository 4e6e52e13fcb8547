//! Shared download cache for source root filesystems.
//!
//! Layout under `<cache_dir>/downloads/`:
//!
//! ```text
//! <key>.lock            shared while a build uses the entry, exclusive while filling
//! <key>/<filename>      downloaded archive
//! <key>/rootfs/         unpacked tree
//! <key>/entry.json      manifest, written last
//! ```
//!
//! An entry without a manifest is incomplete and is rebuilt from scratch.
//! The lock travels with the returned [`CachedSource`], so an entry cannot be
//! replaced while a build still reads its tree.

use anyhow::{bail, Context, Result};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

use super::http::{split_url, Transport};
use super::unpack::{unpack, Compression};
use crate::artifact::filesystem::{atomic_rename, remove_dir_if_exists, tmp_name};
use crate::definition::ImageSection;

pub const DOWNLOADS_DIR: &str = "downloads";
const MANIFEST: &str = "entry.json";
const ROOTFS_DIR: &str = "rootfs";

/// A digest the downloaded archive must match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExpectedHash {
    Sha256(String),
    Sha512(String),
}

impl ExpectedHash {
    /// Parse `sha256:<hex>`, `sha512:<hex>`, or bare hex (length picks the algorithm).
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        let (algo, hex) = match raw.split_once(':') {
            Some((algo, hex)) => (Some(algo.to_ascii_lowercase()), hex),
            None => (None, raw),
        };
        let hex = hex.to_ascii_lowercase();
        if hex.is_empty() || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            bail!("invalid source hash '{}'", raw);
        }
        match (algo.as_deref(), hex.len()) {
            (Some("sha256") | None, 64) => Ok(Self::Sha256(hex)),
            (Some("sha512") | None, 128) => Ok(Self::Sha512(hex)),
            _ => bail!("invalid source hash '{}'", raw),
        }
    }

    fn verify(&self, path: &Path, sha256: &str) -> Result<()> {
        let (expected, actual) = match self {
            Self::Sha256(hex) => (hex.as_str(), sha256.to_string()),
            Self::Sha512(hex) => (hex.as_str(), digest_file::<Sha512>(path)?.0),
        };
        if expected != actual {
            bail!(
                "hash mismatch for {}\n  expected: {}\n  actual:   {}",
                path.display(),
                expected,
                actual
            );
        }
        Ok(())
    }
}

/// Manifest of a complete cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryManifest {
    pub url: String,
    pub resolved_url: String,
    pub filename: String,
    pub sha256: String,
    pub unpacked_at_unix: u64,
}

/// An unpacked source tree in the cache, locked until dropped.
#[derive(Debug)]
pub struct CachedSource {
    pub rootfs: PathBuf,
    pub manifest: EntryManifest,
    /// True when no download happened.
    pub reused: bool,
    _lock: EntryLock,
}

/// Cache key for an image identity and source URL.
pub fn cache_key(image: &ImageSection, url: &str) -> String {
    let mut hasher = Sha256::new();
    for part in [
        image.name.as_str(),
        image.release.as_str(),
        image.architecture.as_str(),
        image.variant.as_str(),
        url,
    ] {
        hasher.update(part.as_bytes());
        hasher.update(b"|");
    }
    let hex = format!("{:x}", hasher.finalize());
    hex[..32].to_string()
}

/// Download cache rooted at `<cache_dir>/downloads`.
#[derive(Debug, Clone)]
pub struct DownloadCache {
    root: PathBuf,
}

impl DownloadCache {
    pub fn new(cache_dir: &Path) -> Self {
        Self {
            root: cache_dir.join(DOWNLOADS_DIR),
        }
    }

    pub fn entry_dir(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    /// Return the unpacked tree for `url`, downloading it if no valid entry exists.
    pub fn fetch(
        &self,
        image: &ImageSection,
        url: &str,
        expected: Option<&ExpectedHash>,
        transport: &dyn Transport,
    ) -> Result<CachedSource> {
        let key = cache_key(image, url);
        let entry_dir = self.entry_dir(&key);
        let rootfs = entry_dir.join(ROOTFS_DIR);

        let shared = self.lock(&key, LockMode::Shared)?;
        if let Some(manifest) = self.reusable(&entry_dir, url, expected) {
            info!("using cached source {}", manifest.filename);
            return Ok(CachedSource {
                rootfs,
                manifest,
                reused: true,
                _lock: shared,
            });
        }
        drop(shared);

        let exclusive = self.lock(&key, LockMode::Exclusive)?;
        // Another build may have filled it while we waited.
        if let Some(manifest) = self.reusable(&entry_dir, url, expected) {
            info!("using cached source {}", manifest.filename);
            return Ok(CachedSource {
                rootfs,
                manifest,
                reused: true,
                _lock: exclusive,
            });
        }

        let manifest = self.fill(&entry_dir, url, expected, transport)?;
        Ok(CachedSource {
            rootfs,
            manifest,
            reused: false,
            _lock: exclusive,
        })
    }

    /// Download, verify and unpack into a fresh `entry_dir`. The manifest is
    /// written last.
    fn fill(
        &self,
        entry_dir: &Path,
        url: &str,
        expected: Option<&ExpectedHash>,
        transport: &dyn Transport,
    ) -> Result<EntryManifest> {
        remove_dir_if_exists(entry_dir)?;
        fs::create_dir_all(entry_dir)
            .with_context(|| format!("creating '{}'", entry_dir.display()))?;

        let resolved_url = transport.resolve(url)?;
        let (_, filename) = split_url(&resolved_url)?;
        Compression::from_filename(&filename)?;

        let tmp_archive = entry_dir.join(tmp_name(".tmp-download"));
        transport.download(&resolved_url, &tmp_archive)?;
        let (sha256, size) = digest_file::<Sha256>(&tmp_archive)?;
        if let Some(expected) = expected {
            if let Err(err) = expected.verify(&tmp_archive, &sha256) {
                let _ = fs::remove_file(&tmp_archive);
                return Err(err);
            }
        }
        let archive = entry_dir.join(&filename);
        atomic_rename(&tmp_archive, &archive)?;
        debug!(size, sha256 = %sha256, "stored {}", archive.display());

        let tmp_rootfs = entry_dir.join(tmp_name(".tmp-rootfs"));
        unpack(&archive, &tmp_rootfs)?;
        fs::rename(&tmp_rootfs, entry_dir.join(ROOTFS_DIR))
            .with_context(|| format!("moving unpacked tree into '{}'", entry_dir.display()))?;

        let manifest = EntryManifest {
            url: url.to_string(),
            resolved_url,
            filename,
            sha256,
            unpacked_at_unix: now_unix(),
        };
        let tmp_manifest = entry_dir.join(tmp_name(".tmp-entry"));
        fs::write(&tmp_manifest, serde_json::to_vec_pretty(&manifest)?)?;
        atomic_rename(&tmp_manifest, &entry_dir.join(MANIFEST))?;
        Ok(manifest)
    }

    /// A complete, verified entry for `url`, or `None`.
    fn reusable(
        &self,
        entry_dir: &Path,
        url: &str,
        expected: Option<&ExpectedHash>,
    ) -> Option<EntryManifest> {
        let bytes = fs::read(entry_dir.join(MANIFEST)).ok()?;
        let manifest: EntryManifest = serde_json::from_slice(&bytes).ok()?;
        if manifest.url != url || !entry_dir.join(ROOTFS_DIR).is_dir() {
            return None;
        }
        let archive = entry_dir.join(&manifest.filename);
        let (sha256, _) = digest_file::<Sha256>(&archive).ok()?;
        if sha256 != manifest.sha256 {
            debug!("cached archive {} changed on disk", archive.display());
            return None;
        }
        if let Some(expected) = expected {
            if let Err(err) = expected.verify(&archive, &sha256) {
                debug!("cached entry rejected: {err:#}");
                return None;
            }
        }
        Some(manifest)
    }

    /// Block until this process holds the entry lock for `key` in `mode`.
    fn lock(&self, key: &str, mode: LockMode) -> Result<EntryLock> {
        fs::create_dir_all(&self.root)
            .with_context(|| format!("creating '{}'", self.root.display()))?;
        let path = self.root.join(format!("{key}.lock"));

        // Lock files are never unlinked: another process may hold or be
        // waiting on the same inode.
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("Failed to create lock file: {}", path.display()))?;

        let busy = match mode {
            LockMode::Shared => FileExt::try_lock_shared(&file).is_err(),
            LockMode::Exclusive => FileExt::try_lock_exclusive(&file).is_err(),
        };
        if busy {
            info!("waiting for another build to finish with {}", path.display());
            match mode {
                LockMode::Shared => FileExt::lock_shared(&file),
                LockMode::Exclusive => FileExt::lock_exclusive(&file),
            }
            .with_context(|| format!("locking {}", path.display()))?;
        }
        Ok(EntryLock { file })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LockMode {
    /// Reading a complete entry.
    Shared,
    /// Filling or replacing an entry.
    Exclusive,
}

#[derive(Debug)]
struct EntryLock {
    file: File,
}

impl Drop for EntryLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Hex digest and size of a file.
pub fn digest_file<D: Digest>(path: &Path) -> Result<(String, u64)> {
    let f = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut r = BufReader::new(f);
    let mut hasher = D::new();
    let mut buf = vec![0u8; 1024 * 1024];
    let mut size = 0u64;
    loop {
        let n = r.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    let hex = hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<String>();
    Ok((hex, size))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{tar_gz, MemoryTransport};
    use tempfile::TempDir;

    const URL: &str = "https://example.org/latest";
    const FINAL: &str = "https://mirror.example.org/3.20/rootfs.tar.gz";

    fn image() -> ImageSection {
        ImageSection {
            name: "alpine".into(),
            release: "3.20".into(),
            architecture: "x86_64".into(),
            variant: "default".into(),
            description: None,
        }
    }

    fn transport() -> MemoryTransport {
        MemoryTransport::new()
            .with_redirect(URL, FINAL)
            .with_file(FINAL, tar_gz(&[("etc/os-release", "ID=alpine\n")]))
    }

    #[test]
    fn first_fetch_downloads_and_unpacks() {
        let temp = TempDir::new().unwrap();
        let cache = DownloadCache::new(temp.path());
        let transport = transport();

        let source = cache.fetch(&image(), URL, None, &transport).unwrap();

        assert!(!source.reused);
        assert_eq!(source.manifest.filename, "rootfs.tar.gz");
        assert_eq!(source.manifest.resolved_url, FINAL);
        assert!(source.rootfs.join("etc/os-release").is_file());
        assert_eq!(transport.downloads(), 1);
        let leftovers: Vec<_> = fs::read_dir(source.rootfs.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|n| n.starts_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn cached_entry_is_reused_without_network() {
        let temp = TempDir::new().unwrap();
        let cache = DownloadCache::new(temp.path());
        let first = transport();
        let fetched = cache.fetch(&image(), URL, None, &first).unwrap();
        let expected = ExpectedHash::Sha256(fetched.manifest.sha256.clone());
        let rootfs = fetched.rootfs.clone();
        drop(fetched);

        let second = transport();
        let reused = cache.fetch(&image(), URL, Some(&expected), &second).unwrap();

        assert!(reused.reused);
        assert_eq!(reused.rootfs, rootfs);
        assert_eq!(second.downloads(), 0);
        assert_eq!(second.resolves(), 0);
    }

    #[test]
    fn incomplete_entry_is_refetched() {
        let temp = TempDir::new().unwrap();
        let cache = DownloadCache::new(temp.path());
        let fetched = cache.fetch(&image(), URL, None, &transport()).unwrap();
        let entry = fetched.rootfs.parent().unwrap().to_path_buf();
        drop(fetched);
        fs::remove_file(entry.join(MANIFEST)).unwrap();

        let again = transport();
        let source = cache.fetch(&image(), URL, None, &again).unwrap();
        assert!(!source.reused);
        assert_eq!(again.downloads(), 1);
    }

    #[test]
    fn entry_stays_locked_while_a_build_uses_it() {
        let temp = TempDir::new().unwrap();
        let cache = DownloadCache::new(temp.path());
        let lock_path = temp
            .path()
            .join(DOWNLOADS_DIR)
            .join(format!("{}.lock", cache_key(&image(), URL)));
        let try_replace = || {
            let file = OpenOptions::new().write(true).open(&lock_path).unwrap();
            let free = FileExt::try_lock_exclusive(&file).is_ok();
            if free {
                FileExt::unlock(&file).unwrap();
            }
            free
        };

        let filled = cache.fetch(&image(), URL, None, &transport()).unwrap();
        assert!(!try_replace());
        drop(filled);
        assert!(try_replace());

        let first = cache.fetch(&image(), URL, None, &transport()).unwrap();
        let second = cache.fetch(&image(), URL, None, &transport()).unwrap();
        assert!(first.reused && second.reused);
        assert!(!try_replace());
        drop(first);
        assert!(!try_replace());
        drop(second);
        assert!(try_replace());
    }

    #[test]
    fn hash_mismatch_is_fatal() {
        let temp = TempDir::new().unwrap();
        let cache = DownloadCache::new(temp.path());
        let expected = ExpectedHash::Sha256("0".repeat(64));

        let err = cache
            .fetch(&image(), URL, Some(&expected), &transport())
            .unwrap_err();
        assert!(err.to_string().contains("hash mismatch"));
        let entry = cache.entry_dir(&cache_key(&image(), URL));
        assert!(!entry.join(MANIFEST).exists());
        assert!(!entry.join("rootfs.tar.gz").exists());
    }

    #[test]
    fn unsupported_archive_is_fatal() {
        let temp = TempDir::new().unwrap();
        let cache = DownloadCache::new(temp.path());
        let transport = MemoryTransport::new().with_file(
            "https://example.org/rootfs.squashfs",
            b"hsqs".to_vec(),
        );
        let err = cache
            .fetch(&image(), "https://example.org/rootfs.squashfs", None, &transport)
            .unwrap_err();
        assert!(err.to_string().contains("unsupported archive format"));
        assert_eq!(transport.downloads(), 0);
    }

    #[test]
    fn test_expected_hash_parse() {
        let hex = "ab".repeat(32);
        assert_eq!(
            ExpectedHash::parse(&format!("sha256:{hex}")).unwrap(),
            ExpectedHash::Sha256(hex.clone())
        );
        assert_eq!(ExpectedHash::parse(&hex.to_uppercase()).unwrap(), ExpectedHash::Sha256(hex));
        assert!(matches!(
            ExpectedHash::parse(&"cd".repeat(64)).unwrap(),
            ExpectedHash::Sha512(_)
        ));
        assert!(ExpectedHash::parse("md5:abcd").is_err());
        assert!(ExpectedHash::parse("sha256:xyz").is_err());
    }

    #[test]
    fn cache_key_depends_on_identity() {
        let mut other = image();
        other.variant = "cloud".into();
        assert_ne!(cache_key(&image(), URL), cache_key(&other, URL));
        assert_eq!(cache_key(&image(), URL).len(), 32);
    }
}
