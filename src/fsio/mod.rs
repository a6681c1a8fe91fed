//! Durable file I/O: atomic writes, content digests, and backups.
//!
//! All writes that reach user files go through [`write_atomic`]: content is
//! written to a sibling temp file in the target directory and renamed into
//! place, so readers never observe a partial write.

mod lock;

pub use lock::FileLock;

use crate::error::{MorfxError, Result};
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Name of the engine's metadata directory.
pub const MORFX_DIR: &str = ".morfx";

/// Computes the SHA-256 digest of `content` as lowercase hex.
pub fn sha256_hex(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        use std::fmt::Write as _;
        write!(&mut out, "{byte:02x}").unwrap();
    }
    out
}

/// Writes `content` to `path` via a sibling temp file and rename.
///
/// With `fsync` set, the temp file is synced to disk before the rename. The
/// temp file is removed on any failure path.
pub fn write_atomic(path: &Path, content: &[u8], fsync: bool) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut temp = tempfile::Builder::new()
        .prefix(".morfx-write-")
        .tempfile_in(dir)?;

    temp.write_all(content)?;
    if fsync {
        temp.as_file().sync_all()?;
    }

    temp.persist(path)
        .map_err(|e| MorfxError::Io(e.error))?;
    Ok(())
}

/// Plain write used when atomic writes are disabled in config.
pub fn write_plain(path: &Path, content: &[u8]) -> Result<()> {
    fs::write(path, content)?;
    Ok(())
}

/// Copies `path` into `.morfx/backups/<basename>-<tx>-<ts>.<suffix>` next
/// to it and returns the backup location. An empty suffix is omitted.
pub fn write_backup(path: &Path, tx_id: &str, suffix: &str) -> Result<PathBuf> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let backups = dir.join(MORFX_DIR).join("backups");
    fs::create_dir_all(&backups)?;

    let basename = path
        .file_name()
        .ok_or_else(|| MorfxError::FileNotFound(path.to_path_buf()))?
        .to_string_lossy();
    let stamp = Utc::now().format("%Y%m%dT%H%M%S%.3f");
    let mut name = format!("{basename}-{tx_id}-{stamp}");
    if !suffix.is_empty() {
        name.push('.');
        name.push_str(suffix);
    }
    let backup_path = backups.join(name);

    fs::copy(path, &backup_path)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&backup_path, fs::Permissions::from_mode(0o644))?;
    }

    Ok(backup_path)
}

/// Reads a file and returns its bytes together with the content digest.
pub fn read_with_digest(path: &Path) -> Result<(Vec<u8>, String)> {
    let content = fs::read(path)?;
    let digest = sha256_hex(&content);
    Ok((content, digest))
}
