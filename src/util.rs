use crate::prelude::*;
use std::path::Path;

use data_encoding::HEXLOWER;

/// Renders a SHA-1 digest as 40 lowercase hex characters, matching the
/// format recorded in `.hashes` and `.dirindex`.
pub fn hex_encode(bytes: &[u8]) -> String {
    HEXLOWER.encode(bytes)
}

/// Parses a tar header's fixed-width, NUL/space-padded octal field (the
/// `size`, `mode`, `mtime`, etc. fields of a ustar header).
///
/// Tolerates a trailing NUL and/or trailing spaces, per the ustar format.
/// An all-zero or empty field parses as 0.
pub fn parse_octal(field: &[u8]) -> Result<u64> {
    let trimmed: &[u8] = field
        .split(|&b| b == 0)
        .next()
        .unwrap_or(field);
    let trimmed = std::str::from_utf8(trimmed)
        .context("tar header field is not valid UTF-8")?
        .trim();
    if trimmed.is_empty() {
        return Ok(0);
    }
    u64::from_str_radix(trimmed, 8).with_context(|| format!("invalid octal field {trimmed:?}"))
}

/// Rejects the unsafe path shapes common to both `.dirindex` child names
/// and archive entry paths: empty, absolute, or containing a `..`
/// component. This is the one safety check shared by every path that
/// ultimately becomes a filesystem write target.
pub fn is_safe_relative_path(path: &str) -> bool {
    if path.is_empty() {
        return false;
    }
    if path.starts_with('/') || path.starts_with('\\') {
        return false;
    }
    if path.contains("..") {
        return false;
    }
    true
}

/// Writes `contents` to `path` atomically: a temp file is created
/// alongside `path` (so the final rename stays on the same filesystem),
/// written, and persisted over the destination.
pub fn atomic_write(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .with_context(|| format!("creating temp file in {}", dir.display()))?;
    tmp.write_all(contents)?;
    tmp.persist(path)
        .with_context(|| format!("persisting temp file to {}", path.display()))?;
    Ok(())
}

/// Removes a file if present, swallowing `NotFound` -- used to discard
/// partial downloads and orphaned siblings without a TOCTOU check.
pub fn remove_file_if_exists(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("removing {}", path.display())),
    }
}
