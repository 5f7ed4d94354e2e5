use crate::error::TerrasyncError;
use crate::prelude::*;
use crate::util::is_safe_relative_path;

/// The type tag on a `.dirindex` line: `f` (regular file), `d`
/// (subdirectory, hash covers the child's own `.dirindex`), or `t`
/// (tarball, unpacked in place after verification).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildType {
    File,
    Dir,
    Tarball,
}

/// A single expected child parsed from a directory's `.dirindex`, kept
/// sorted by `name` alongside its siblings so the on-disk diff is a
/// linear merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildInfo {
    pub kind: ChildType,
    pub name: String,
    pub expected_hash: String,
    pub expected_size: Option<u64>,
}

impl ChildInfo {
    /// The on-disk leaf this child's hash actually covers: the file
    /// itself, the subdirectory's `.dirindex`, or the tarball archive.
    pub fn hash_target_name(&self) -> String {
        match self.kind {
            ChildType::File | ChildType::Tarball => self.name.clone(),
            ChildType::Dir => format!("{}/.dirindex", self.name),
        }
    }
}

/// The parsed contents of one `.dirindex` file: children sorted by name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirIndex {
    pub children: Vec<ChildInfo>,
}

impl DirIndex {
    /// Parses the line-oriented `.dirindex` grammar. Tolerant of
    /// unrecognized line types and unsafe names -- both are skipped
    /// with a warning rather than failing the whole parse, matching the
    /// forgiving posture of the rest of the sync protocol.
    pub fn parse(contents: &str) -> Result<DirIndex> {
        let mut children = Vec::new();
        let mut saw_version = false;

        for (lineno, line) in contents.lines().enumerate() {
            let line = line.trim_end();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let mut parts = line.splitn(2, ':');
            let tag = parts.next().unwrap_or("");
            let rest = parts.next().unwrap_or("");

            match tag {
                "version" => {
                    if rest.trim() != "1" {
                        bail!("unsupported dirindex version {:?}", rest.trim());
                    }
                    saw_version = true;
                }
                "path" | "time" => {
                    // informational, ignored
                }
                "f" | "d" | "t" => {
                    let mut fields = rest.splitn(3, ':');
                    let name = fields.next().unwrap_or("");
                    let hash = fields.next().unwrap_or("");
                    let size = fields.next().and_then(|s| s.parse::<u64>().ok());

                    if name == ".." || name.contains('/') || name.contains('\\') || !is_safe_relative_path(name) {
                        warn!(
                            "line {}: {}, skipping",
                            lineno + 1,
                            TerrasyncError::UnsafeChildName {
                                name: name.to_string()
                            }
                        );
                        continue;
                    }
                    if hash.is_empty() {
                        warn!("line {}: child {:?} missing hash, skipping", lineno + 1, name);
                        continue;
                    }

                    let kind = match tag {
                        "f" => ChildType::File,
                        "d" => ChildType::Dir,
                        "t" => ChildType::Tarball,
                        _ => unreachable!(),
                    };

                    children.push(ChildInfo {
                        kind,
                        name: name.to_string(),
                        expected_hash: hash.to_string(),
                        expected_size: size,
                    });
                }
                other => {
                    warn!("line {}: unknown dirindex line type {:?}, ignoring", lineno + 1, other);
                }
            }
        }

        if !saw_version {
            warn!("dirindex has no version line; proceeding anyway");
        }

        children.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(DirIndex { children })
    }

    pub fn find(&self, name: &str) -> Option<&ChildInfo> {
        self.children.iter().find(|c| c.name == name)
    }
}
