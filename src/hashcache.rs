use crate::error::TerrasyncError;
use crate::prelude::*;
use crate::util::{atomic_write, hex_encode};
use ring::digest;
use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

const READ_BLOCK_SIZE: usize = 1024 * 1024;
const HASH_CACHE_FILE_NAME: &str = ".hashes";

/// One row of the persistent `.hashes` file: the SHA-1 hash is only
/// trusted as long as the file's `mtime`/`length` still match what was
/// observed when the hash was computed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashCacheEntry {
    pub mtime: i64,
    pub length_bytes: u64,
    pub hash_hex: String,
}

/// Persistent mapping `absolute-path -> (mtime, length, hex-hash)`,
/// backed by a `.hashes` file at the repository root.
///
/// Loaded once at construction, mutated in memory as files are
/// added/updated/removed, and flushed back to disk on a dirty flag
/// rather than on every mutation.
pub struct HashCache {
    root: PathBuf,
    entries: HashMap<String, HashCacheEntry>,
    dirty: bool,
}

impl HashCache {
    /// Loads `root/.hashes` if present. A missing file is not an error;
    /// malformed lines are skipped with a warning.
    pub fn load(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let mut cache = HashCache {
            root,
            entries: HashMap::new(),
            dirty: false,
        };
        cache.parse_hash_cache();
        cache
    }

    fn hash_cache_path(&self) -> PathBuf {
        self.root.join(HASH_CACHE_FILE_NAME)
    }

    fn parse_hash_cache(&mut self) {
        let path = self.hash_cache_path();
        let contents = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
            Err(e) => {
                warn!("failed to read hash cache {}: {e}", path.display());
                return;
            }
        };
        for (lineno, line) in contents.lines().enumerate() {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match parse_hash_cache_line(line) {
                Some((path, entry)) => {
                    self.entries.insert(path, entry);
                }
                None => {
                    warn!(
                        "line {}: {}, skipping",
                        lineno + 1,
                        TerrasyncError::MalformedHashCacheEntry {
                            path: line.to_string()
                        }
                    );
                }
            }
        }
    }

    /// Returns the path's current hash, preferring the cache if its
    /// recorded `mtime`/`length` still agree with the filesystem, and
    /// otherwise recomputing SHA-1 over the file contents.
    ///
    /// `key` is the string used as the cache key (typically the path
    /// relative to the repository root); `abs_path` is where the bytes
    /// actually live on disk.
    pub fn hash_for_path(&mut self, key: &str, abs_path: &Path) -> Result<String> {
        let meta = std::fs::metadata(abs_path)
            .with_context(|| format!("statting {}", abs_path.display()))?;
        let mtime = mtime_seconds(&meta);
        let length = meta.len();

        if let Some(entry) = self.entries.get(key) {
            if entry.mtime == mtime && entry.length_bytes == length {
                return Ok(entry.hash_hex.clone());
            }
        }

        let hash_hex = compute_hash_for_path(abs_path)?;
        self.entries.insert(
            key.to_string(),
            HashCacheEntry {
                mtime,
                length_bytes: length,
                hash_hex: hash_hex.clone(),
            },
        );
        self.dirty = true;
        Ok(hash_hex)
    }

    /// Called after a file at `key`/`abs_path` has just been (re)written
    /// or removed. Drops the stale entry; if the file still exists,
    /// re-inserts it with a fresh stat (not a recomputed hash -- the
    /// caller already knows the hash it just wrote).
    pub fn updated_file_contents(&mut self, key: &str, abs_path: &Path, new_hash: &str) {
        self.entries.remove(key);
        if new_hash.is_empty() {
            self.dirty = true;
            return;
        }
        if let Ok(meta) = std::fs::metadata(abs_path) {
            self.entries.insert(
                key.to_string(),
                HashCacheEntry {
                    mtime: mtime_seconds(&meta),
                    length_bytes: meta.len(),
                    hash_hex: new_hash.to_string(),
                },
            );
        }
        self.dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Rewrites `.hashes` atomically if dirty; no-op otherwise.
    pub fn write_hash_cache(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        let mut contents = String::new();
        let mut keys: Vec<&String> = self.entries.keys().collect();
        keys.sort();
        for key in keys {
            let entry = &self.entries[key];
            contents.push_str(&format!(
                "{}*{}*{}*{}\n",
                key, entry.mtime, entry.length_bytes, entry.hash_hex
            ));
        }
        atomic_write(&self.hash_cache_path(), contents.as_bytes())?;
        self.dirty = false;
        Ok(())
    }
}

fn mtime_seconds(meta: &std::fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn parse_hash_cache_line(line: &str) -> Option<(String, HashCacheEntry)> {
    let mut fields = line.splitn(4, '*');
    let path = fields.next()?;
    let mtime: i64 = fields.next()?.parse().ok()?;
    let length_bytes: u64 = fields.next()?.parse().ok()?;
    let hash_hex = fields.next()?;
    if path.is_empty() || hash_hex.is_empty() {
        return None;
    }
    Some((
        path.to_string(),
        HashCacheEntry {
            mtime,
            length_bytes,
            hash_hex: hash_hex.to_string(),
        },
    ))
}

/// Computes SHA-1 over a file's contents, streaming in 1 MiB blocks so
/// multi-gigabyte archives don't need to be held in memory.
pub fn compute_hash_for_path(path: &Path) -> Result<String> {
    let mut file =
        File::open(path).with_context(|| format!("opening {} for hashing", path.display()))?;
    let mut ctx = digest::Context::new(&digest::SHA1_FOR_LEGACY_USE_ONLY);
    let mut buf = vec![0u8; READ_BLOCK_SIZE];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        ctx.update(&buf[..n]);
    }
    Ok(hex_encode(ctx.finish().as_ref()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn hash_cache_recomputes_on_stale_metadata() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("leaf");
        std::fs::write(&file_path, b"hello world").unwrap();

        let mut cache = HashCache::load(dir.path());
        let h1 = cache.hash_for_path("leaf", &file_path).unwrap();
        assert_eq!(h1, compute_hash_for_path(&file_path).unwrap());

        std::fs::write(&file_path, b"hello world, changed").unwrap();
        let h2 = cache.hash_for_path("leaf", &file_path).unwrap();
        assert_ne!(h1, h2);
    }

    #[test]
    fn round_trips_through_disk() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("leaf");
        std::fs::write(&file_path, b"persisted").unwrap();

        let mut cache = HashCache::load(dir.path());
        cache.hash_for_path("leaf", &file_path).unwrap();
        cache.write_hash_cache().unwrap();
        assert!(!cache.is_dirty());

        let reloaded = HashCache::load(dir.path());
        assert_eq!(
            reloaded.entries.get("leaf").unwrap().hash_hex,
            compute_hash_for_path(&file_path).unwrap()
        );
    }

    #[test]
    fn ignores_comments_and_blank_lines() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join(".hashes"),
            "# comment\n\nleaf*1700000000*5*aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa\n",
        )
        .unwrap();
        let cache = HashCache::load(dir.path());
        assert_eq!(cache.entries.len(), 1);
    }
}
