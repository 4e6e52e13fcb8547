//! Root filesystem archive extraction.

use anyhow::{bail, Context, Result};
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::Path;

use crate::preflight::is_root;

/// Compression wrapped around a tar stream, picked from the file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
    Xz,
    Zstd,
}

impl Compression {
    pub fn from_filename(name: &str) -> Result<Self> {
        let lower = name.to_ascii_lowercase();
        let format = if lower.ends_with(".tar") {
            Self::None
        } else if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
            Self::Gzip
        } else if lower.ends_with(".tar.xz") || lower.ends_with(".txz") {
            Self::Xz
        } else if lower.ends_with(".tar.zst") || lower.ends_with(".tzst") {
            Self::Zstd
        } else {
            bail!("unsupported archive format: '{}'", name);
        };
        Ok(format)
    }

    fn decoder<'a, R: Read + 'a>(self, reader: R) -> Result<Box<dyn Read + 'a>> {
        Ok(match self {
            Self::None => Box::new(reader),
            Self::Gzip => Box::new(flate2::read::GzDecoder::new(reader)),
            Self::Xz => Box::new(xz2::read::XzDecoder::new(reader)),
            Self::Zstd => Box::new(zstd::stream::Decoder::new(reader)?),
        })
    }
}

/// Extract `archive` into `dest`, keeping modes, xattrs and (as root) owners.
pub fn unpack(archive: &Path, dest: &Path) -> Result<()> {
    let name = archive
        .file_name()
        .and_then(|n| n.to_str())
        .with_context(|| format!("archive path has no file name: {}", archive.display()))?;
    let compression = Compression::from_filename(name)?;

    fs::create_dir_all(dest).with_context(|| format!("creating '{}'", dest.display()))?;
    let file = File::open(archive).with_context(|| format!("opening '{}'", archive.display()))?;
    let decoder = compression.decoder(BufReader::new(file))?;

    let mut tar = tar::Archive::new(decoder);
    tar.set_preserve_permissions(true);
    tar.set_preserve_ownerships(is_root());
    tar.set_unpack_xattrs(true);
    tar.set_overwrite(true);
    tar.unpack(dest)
        .with_context(|| format!("unpacking '{}' into '{}'", archive.display(), dest.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn tar_bytes() -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        let content = b"ID=test\n";
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, "etc/os-release", &content[..])
            .unwrap();
        builder.into_inner().unwrap()
    }

    #[test]
    fn test_from_filename() {
        assert_eq!(Compression::from_filename("a.tar").unwrap(), Compression::None);
        assert_eq!(Compression::from_filename("a.tgz").unwrap(), Compression::Gzip);
        assert_eq!(Compression::from_filename("a.tar.XZ").unwrap(), Compression::Xz);
        assert_eq!(Compression::from_filename("a.tar.zst").unwrap(), Compression::Zstd);
        let err = Compression::from_filename("rootfs.squashfs").unwrap_err();
        assert!(err.to_string().contains("unsupported archive format"));
    }

    #[test]
    fn unpacks_gzip_tarball() {
        let temp = TempDir::new().unwrap();
        let archive = temp.path().join("rootfs.tar.gz");
        let mut encoder =
            flate2::write::GzEncoder::new(File::create(&archive).unwrap(), flate2::Compression::default());
        encoder.write_all(&tar_bytes()).unwrap();
        encoder.finish().unwrap();

        let dest = temp.path().join("rootfs");
        unpack(&archive, &dest).unwrap();
        assert_eq!(fs::read_to_string(dest.join("etc/os-release")).unwrap(), "ID=test\n");
    }

    #[test]
    fn unpacks_xz_tarball() {
        let temp = TempDir::new().unwrap();
        let archive = temp.path().join("rootfs.tar.xz");
        let mut encoder = xz2::write::XzEncoder::new(File::create(&archive).unwrap(), 6);
        encoder.write_all(&tar_bytes()).unwrap();
        encoder.finish().unwrap();

        let dest = temp.path().join("rootfs");
        unpack(&archive, &dest).unwrap();
        assert!(dest.join("etc/os-release").is_file());
    }
}
