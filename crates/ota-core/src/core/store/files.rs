//! On-disk asset files: naming, hashing, and crash-safe writes.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;

use super::PARTIAL_PREFIX;
use crate::core::errors::UpdatesError;

/// File name for an asset, derived from its content key.
///
/// Keys made of portable characters are used verbatim; anything else is
/// replaced by the hex SHA-256 of the key so it can never escape the directory.
#[must_use]
pub fn asset_file_name(key: &str) -> String {
    let portable = !key.is_empty()
        && !key.starts_with('.')
        && key
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'));
    if portable {
        key.to_string()
    } else {
        hex::encode(Sha256::digest(key.as_bytes()))
    }
}

pub fn compute_sha256(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0_u8; 32 * 1024];
    loop {
        let read = file.read(&mut buf)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Check that `path` exists and hashes to `expected`.
pub(crate) fn verify_file(key: &str, path: &Path, expected: &str) -> Result<u64> {
    if !path.exists() {
        return Err(UpdatesError::MissingAsset {
            key: key.to_string(),
        }
        .into());
    }
    let actual = compute_sha256(path)
        .with_context(|| format!("failed to hash asset file {}", path.display()))?;
    if actual != expected {
        return Err(UpdatesError::DigestMismatch {
            key: key.to_string(),
            expected: expected.to_string(),
            actual,
        }
        .into());
    }
    Ok(fs::metadata(path)?.len())
}

/// Writer that hashes everything passing through it.
pub(crate) struct HashingWriter<W> {
    inner: W,
    hasher: Sha256,
    written: u64,
}

impl<W: Write> HashingWriter<W> {
    pub(crate) fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            written: 0,
        }
    }

    pub(crate) fn finish(self) -> (W, String, u64) {
        (self.inner, hex::encode(self.hasher.finalize()), self.written)
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.inner.write(buf)?;
        self.hasher.update(&buf[..written]);
        self.written += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Stream an asset into `dir/<file_name>` through a partial file.
///
/// `fill` writes the content; the digest is checked before the partial file is
/// renamed into place, so the destination is either absent or complete.
pub(crate) fn write_verified<F>(
    dir: &Path,
    file_name: &str,
    key: &str,
    expected_hash: &str,
    fill: F,
) -> Result<(PathBuf, u64)>
where
    F: FnOnce(&mut dyn Write) -> Result<()>,
{
    let dest = dir.join(file_name);
    let tmp = tempfile::Builder::new()
        .prefix(PARTIAL_PREFIX)
        .tempfile_in(dir)
        .with_context(|| format!("failed to create partial file in {}", dir.display()))?;
    let mut writer = HashingWriter::new(tmp);
    fill(&mut writer)?;
    writer.flush()?;
    let (tmp, actual, size) = writer.finish();
    if actual != expected_hash {
        return Err(UpdatesError::DigestMismatch {
            key: key.to_string(),
            expected: expected_hash.to_string(),
            actual,
        }
        .into());
    }
    tmp.as_file().sync_all()?;
    persist(tmp, &dest, key, expected_hash)?;
    Ok((dest, size))
}

fn persist(tmp: NamedTempFile, dest: &Path, key: &str, expected_hash: &str) -> Result<()> {
    match tmp.persist(dest) {
        Ok(_) => Ok(()),
        Err(err) if err.error.kind() == io::ErrorKind::AlreadyExists => {
            if verify_file(key, dest, expected_hash).is_ok() {
                return Ok(());
            }
            let _ = fs::remove_file(dest);
            err.file
                .persist(dest)
                .map(|_| ())
                .with_context(|| format!("failed to persist asset {}", dest.display()))
        }
        Err(err) => Err(err.error)
            .with_context(|| format!("failed to persist asset {}", dest.display())),
    }
}

pub(crate) fn modified_before(path: &Path, cutoff: SystemTime) -> bool {
    fs::metadata(path)
        .and_then(|meta| meta.modified())
        .map(|modified| modified <= cutoff)
        .unwrap_or(true)
}
