use crate::dirindex::{ChildInfo, ChildType, DirIndex};
use crate::prelude::*;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

/// In-memory model of one remote directory: its path relative to the
/// repository root, and the children last parsed from its `.dirindex`.
/// Owned by the Repository's directory arena and referred to elsewhere
/// by relative path rather than by pointer (see [`crate::repository`]).
#[derive(Debug, Clone, Default)]
pub struct Directory {
    pub relative_path: String,
    pub children: Vec<ChildInfo>,
}

impl Directory {
    pub fn root() -> Self {
        Directory {
            relative_path: String::new(),
            children: Vec::new(),
        }
    }

    pub fn new(relative_path: impl Into<String>) -> Self {
        Directory {
            relative_path: relative_path.into(),
            children: Vec::new(),
        }
    }

    pub fn is_root(&self) -> bool {
        self.relative_path.is_empty()
    }

    /// `baseUrl` if root, else `baseUrl/relativePath`.
    pub fn url(&self, base_url: &Url) -> Result<Url> {
        if self.is_root() {
            return Ok(base_url.clone());
        }
        let mut url = base_url.clone();
        let mut path = url.path().trim_end_matches('/').to_string();
        path.push('/');
        path.push_str(&self.relative_path);
        url.set_path(&path);
        Ok(url)
    }

    pub fn absolute_path(&self, repository_root: &Path) -> PathBuf {
        if self.is_root() {
            repository_root.to_path_buf()
        } else {
            repository_root.join(&self.relative_path)
        }
    }

    pub fn dirindex_path(&self, repository_root: &Path) -> PathBuf {
        self.absolute_path(repository_root).join(".dirindex")
    }

    /// Reparses this directory's children from freshly-downloaded
    /// `.dirindex` bytes, replacing whatever was parsed before.
    pub fn set_children_from_dirindex(&mut self, contents: &str) -> Result<()> {
        let parsed = DirIndex::parse(contents)?;
        self.children = parsed.children;
        Ok(())
    }

    pub fn child_relative_path(&self, name: &str) -> String {
        if self.is_root() {
            name.to_string()
        } else {
            format!("{}/{}", self.relative_path, name)
        }
    }
}

/// The outcome of diffing a directory's expected children against its
/// on-disk state: what needs fetching, which already-correct
/// subdirectories should still be recursed into, and what's an orphan.
#[derive(Debug, Default)]
pub struct DiffResult {
    pub to_update: Vec<ChildInfo>,
    pub up_to_date_dirs: Vec<ChildInfo>,
    pub orphans: Vec<String>,
}

/// Core diff: for each indexed child, decide whether the on-disk copy
/// is missing, stale, or already correct, via `hash_for` (a closure so
/// callers can route through the persistent hash cache without this
/// function needing to know about it). Orphans are filesystem entries
/// present locally but absent from the index, excluding `.dirindex` and
/// `.hashes`.
pub fn diff_children(
    children: &[ChildInfo],
    local_entries: &BTreeSet<String>,
    mut hash_for: impl FnMut(&ChildInfo) -> Result<String>,
) -> DiffResult {
    let mut result = DiffResult::default();
    let mut seen: BTreeSet<&str> = BTreeSet::new();

    for child in children {
        seen.insert(child.name.as_str());
        if !local_entries.contains(&child.name) {
            result.to_update.push(child.clone());
            continue;
        }
        match hash_for(child) {
            Ok(actual) if actual == child.expected_hash => {
                if child.kind == ChildType::Dir {
                    result.up_to_date_dirs.push(child.clone());
                }
            }
            _ => {
                result.to_update.push(child.clone());
            }
        }
    }

    for name in local_entries {
        if name == ".dirindex" || name == ".hashes" {
            continue;
        }
        if !seen.contains(name.as_str()) {
            result.orphans.push(name.clone());
        }
    }

    result
}

/// Lists the immediate entries of `dir` (file and subdirectory names),
/// returning an empty set if the directory doesn't exist yet.
pub fn list_local_entries(dir: &Path) -> Result<BTreeSet<String>> {
    let mut entries = BTreeSet::new();
    let read_dir = match std::fs::read_dir(dir) {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(entries),
        Err(e) => return Err(e).with_context(|| format!("listing {}", dir.display())),
    };
    for entry in read_dir {
        let entry = entry?;
        if let Some(name) = entry.file_name().to_str() {
            entries.insert(name.to_string());
        }
    }
    Ok(entries)
}

/// Removes every name in `orphans` from `dir`, recursively for
/// directories. Best-effort: logs and continues past entries that fail
/// to delete rather than aborting the whole orphan sweep.
pub fn remove_orphans(dir: &Path, orphans: &[String]) {
    for name in orphans {
        let path = dir.join(name);
        let result = if path.is_dir() {
            std::fs::remove_dir_all(&path)
        } else {
            std::fs::remove_file(&path)
        };
        if let Err(e) = result {
            warn!("failed to remove orphan {}: {e}", path.display());
        }
    }
}

/// Step 1 of `updateChildrenBasedOnHash`: best-effort copy of any child
/// that exists in the installed-copy tree but not yet on disk locally.
/// Failures are swallowed -- a missing installed copy is not an error,
/// it just means the child will be fetched over HTTP instead.
pub fn copy_installed_children(children: &[ChildInfo], local_dir: &Path, installed_dir: &Path) {
    for child in children {
        let local_path = local_dir.join(&child.name);
        if local_path.exists() {
            continue;
        }
        let installed_path = installed_dir.join(&child.name);
        if !installed_path.exists() {
            continue;
        }
        if let Err(e) = copy_recursive(&installed_path, &local_path) {
            warn!(
                "failed to copy installed child {} -> {}: {e}",
                installed_path.display(),
                local_path.display()
            );
        }
    }
}

fn copy_recursive(from: &Path, to: &Path) -> Result<()> {
    if from.is_dir() {
        std::fs::create_dir_all(to)?;
        for entry in std::fs::read_dir(from)? {
            let entry = entry?;
            copy_recursive(&entry.path(), &to.join(entry.file_name()))?;
        }
    } else {
        if let Some(parent) = to.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(from, to)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dirindex::ChildType;

    fn child(kind: ChildType, name: &str, hash: &str) -> ChildInfo {
        ChildInfo {
            kind,
            name: name.to_string(),
            expected_hash: hash.to_string(),
            expected_size: None,
        }
    }

    #[test]
    fn missing_child_needs_update() {
        let children = vec![child(ChildType::File, "fileA", "aaaa")];
        let local = BTreeSet::new();
        let diff = diff_children(&children, &local, |_| Ok("aaaa".to_string()));
        assert_eq!(diff.to_update.len(), 1);
        assert!(diff.orphans.is_empty());
    }

    #[test]
    fn matching_hash_is_left_alone() {
        let children = vec![child(ChildType::File, "fileA", "aaaa")];
        let mut local = BTreeSet::new();
        local.insert("fileA".to_string());
        let diff = diff_children(&children, &local, |_| Ok("aaaa".to_string()));
        assert!(diff.to_update.is_empty());
    }

    #[test]
    fn mismatched_hash_needs_update() {
        let children = vec![child(ChildType::File, "fileA", "aaaa")];
        let mut local = BTreeSet::new();
        local.insert("fileA".to_string());
        let diff = diff_children(&children, &local, |_| Ok("bbbb".to_string()));
        assert_eq!(diff.to_update.len(), 1);
    }

    #[test]
    fn matching_dir_is_recursed() {
        let children = vec![child(ChildType::Dir, "subdirA", "aaaa")];
        let mut local = BTreeSet::new();
        local.insert("subdirA".to_string());
        let diff = diff_children(&children, &local, |_| Ok("aaaa".to_string()));
        assert_eq!(diff.up_to_date_dirs.len(), 1);
        assert!(diff.to_update.is_empty());
    }

    #[test]
    fn unlisted_local_entry_is_orphan() {
        let children = vec![child(ChildType::File, "fileA", "aaaa")];
        let mut local = BTreeSet::new();
        local.insert("fileA".to_string());
        local.insert("strayfile".to_string());
        local.insert(".dirindex".to_string());
        local.insert(".hashes".to_string());
        let diff = diff_children(&children, &local, |_| Ok("aaaa".to_string()));
        assert_eq!(diff.orphans, vec!["strayfile".to_string()]);
    }
}
