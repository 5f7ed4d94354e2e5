use crate::prelude::*;
use crate::archive::path_safety::{apply_filter, FilterOutcome, PathFilter};
use std::io::Cursor;
use std::path::PathBuf;
use std::rc::Rc;

/// Zip archives carry their central directory at the end, so unlike the
/// tar strategies this one just accumulates bytes until `flush()`, then
/// reads entries out of an in-memory buffer.
pub struct ZipStrategy {
    root: PathBuf,
    filter: Rc<dyn PathFilter>,
    buffer: Vec<u8>,
    error: bool,
    done: bool,
}

impl ZipStrategy {
    pub fn new(root: impl Into<PathBuf>, filter: Rc<dyn PathFilter>) -> Self {
        ZipStrategy {
            root: root.into(),
            filter,
            buffer: Vec::new(),
            error: false,
            done: false,
        }
    }

    pub fn has_error(&self) -> bool {
        self.error
    }

    pub fn is_at_end(&self) -> bool {
        self.done
    }

    pub fn extract_bytes(&mut self, data: &[u8]) -> Result<()> {
        self.buffer.extend_from_slice(data);
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        if self.done {
            return Ok(());
        }
        let cursor = Cursor::new(&self.buffer);
        let mut archive = match zip::ZipArchive::new(cursor) {
            Ok(a) => a,
            Err(e) => {
                self.error = true;
                return Err(e).context("reading zip central directory");
            }
        };

        for i in 0..archive.len() {
            let mut entry = archive
                .by_index(i)
                .with_context(|| format!("reading zip entry {i}"))?;
            let name = match entry.enclosed_name() {
                Some(p) => p.to_string_lossy().into_owned(),
                None => entry.name().to_string(),
            };

            match apply_filter(&name, self.filter.as_ref()) {
                FilterOutcome::Stop => {
                    self.done = true;
                    break;
                }
                FilterOutcome::Skipped => continue,
                FilterOutcome::Accepted => self.extract_one(&name, &mut entry)?,
                FilterOutcome::Modified(new_path) => self.extract_one(&new_path, &mut entry)?,
            }
        }

        self.done = true;
        Ok(())
    }

    fn extract_one(&self, relative: &str, entry: &mut zip::read::ZipFile) -> Result<()> {
        if entry.is_dir() || entry.size() == 0 {
            std::fs::create_dir_all(self.root.join(relative))?;
            return Ok(());
        }
        let dest = self.root.join(relative);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = std::fs::File::create(&dest)
            .with_context(|| format!("creating {}", dest.display()))?;
        std::io::copy(entry, &mut out)
            .with_context(|| format!("writing {}", dest.display()))?;

        #[cfg(unix)]
        if let Some(mode) = entry.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&dest, std::fs::Permissions::from_mode(mode))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::path_safety::{DefaultPathFilter, FilterOutcome, PathFilter};
    use tempfile::tempdir;
    use zip::write::FileOptions;

    fn build_zip(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut buf = Vec::new();
        {
            let cursor = Cursor::new(&mut buf);
            let mut writer = zip::ZipWriter::new(cursor);
            let options = FileOptions::default();
            for (name, contents) in entries {
                writer.start_file(*name, options).unwrap();
                writer.write_all(contents).unwrap();
            }
            writer.finish().unwrap();
        }
        buf
    }

    #[test]
    fn extracts_files_from_a_zip_archive() {
        let dir = tempdir().unwrap();
        let zip_bytes = build_zip(&[
            ("testDir/hello.c", b"int main(void) { return 0; }\n"),
            ("testDir/foo.txt", b"foo contents\n"),
        ]);

        let mut strategy = ZipStrategy::new(dir.path(), Rc::new(DefaultPathFilter));
        strategy.extract_bytes(&zip_bytes).unwrap();
        strategy.flush().unwrap();

        assert!(!strategy.has_error());
        assert!(strategy.is_at_end());
        assert_eq!(
            std::fs::read(dir.path().join("testDir/hello.c")).unwrap(),
            b"int main(void) { return 0; }\n"
        );
        assert_eq!(
            std::fs::read(dir.path().join("testDir/foo.txt")).unwrap(),
            b"foo contents\n"
        );
    }

    struct StopAtFoo;
    impl PathFilter for StopAtFoo {
        fn filter_path(&self, path: &str) -> FilterOutcome {
            if path == "testDir/foo.txt" {
                FilterOutcome::Stop
            } else {
                FilterOutcome::Accepted
            }
        }
    }

    #[test]
    fn filter_stop_aborts_remaining_entries() {
        let dir = tempdir().unwrap();
        let zip_bytes = build_zip(&[
            ("testDir/hello.c", b"int main(void) { return 0; }\n"),
            ("testDir/foo.txt", b"foo contents\n"),
            ("testDir/after.txt", b"never written\n"),
        ]);

        let mut strategy = ZipStrategy::new(dir.path(), Rc::new(StopAtFoo));
        strategy.extract_bytes(&zip_bytes).unwrap();
        strategy.flush().unwrap();

        assert!(dir.path().join("testDir/hello.c").exists());
        assert!(!dir.path().join("testDir/foo.txt").exists());
        assert!(!dir.path().join("testDir/after.txt").exists());
    }
}
