use crate::archive::path_safety::{DefaultPathFilter, PathFilter};
use crate::archive::ArchiveExtractor;
use crate::dirindex::{ChildInfo, ChildType};
use crate::directory::{
    copy_installed_children, diff_children, list_local_entries, remove_orphans, Directory,
};
use crate::hashcache::HashCache;
use crate::http_pool::{HttpPool, PoolEvent, PoolRequest, RequestTarget};
use crate::prelude::*;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::rc::Rc;

/// The maximum number of HTTP requests this repository will have in
/// flight at once. Submissions beyond the cap sit in `queued` until a
/// slot frees up.
pub const POOL_CAP: usize = 5;

/// One accumulated per-file or per-directory failure. `status ==
/// NoError` with a non-empty failure list downgrades to `PartialUpdate`
/// when reported through [`Repository::failure`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub path: String,
    pub code: ResultCode,
}

enum RequestKind {
    File {
        name: String,
        expected_hash: String,
        expected_size: Option<u64>,
    },
    DirIndex {
        expected_hash: Option<String>,
    },
}

struct PendingRequest {
    id: u64,
    dir_handle: usize,
    url: Url,
    kind: RequestKind,
}

/// Orchestrator: owns the request pool, the directory arena, the hash
/// cache, and the public `update`/`process`/`failures` surface.
///
/// The directory tree is kept as a flat arena (`directories`) indexed
/// by integer handle and looked up by relative path, per the design
/// note on mixed directory ownership -- this sidesteps the need for
/// back-references or reference counting that the original's pointer
/// graph relied on.
pub struct Repository {
    root: PathBuf,
    base_url: Option<Url>,
    installed_copy_path: Option<PathBuf>,
    filter: Rc<dyn PathFilter>,

    hash_cache: HashCache,
    directories: Vec<Directory>,
    dir_handle_by_path: HashMap<String, usize>,

    pool: HttpPool,
    next_id: u64,
    queued: VecDeque<PendingRequest>,
    active: HashMap<u64, PendingRequest>,

    failures: Vec<Failure>,
    status: ResultCode,
    is_updating: bool,
    bytes_downloaded_total: u64,
}

const ROOT_HANDLE: usize = 0;

impl Repository {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let hash_cache = HashCache::load(&root);
        let mut dir_handle_by_path = HashMap::new();
        dir_handle_by_path.insert(String::new(), ROOT_HANDLE);

        Repository {
            root,
            base_url: None,
            installed_copy_path: None,
            filter: Rc::new(DefaultPathFilter),
            hash_cache,
            directories: vec![Directory::root()],
            dir_handle_by_path,
            pool: HttpPool::new(),
            next_id: 0,
            queued: VecDeque::new(),
            active: HashMap::new(),
            failures: Vec::new(),
            status: ResultCode::NoError,
            is_updating: false,
            bytes_downloaded_total: 0,
        }
    }

    pub fn set_base_url(&mut self, url: Url) {
        self.base_url = Some(url);
    }

    pub fn set_installed_copy_path(&mut self, path: impl Into<PathBuf>) {
        self.installed_copy_path = Some(path.into());
    }

    pub fn set_filter(&mut self, filter: Rc<dyn PathFilter>) {
        self.filter = filter;
    }

    pub fn is_doing_sync(&self) -> bool {
        self.is_updating && self.status == ResultCode::NoError
    }

    /// Whether this repository still has work outstanding (requests
    /// active or queued), regardless of whether `status` has already
    /// recorded a terminal failure. Unlike [`Repository::is_doing_sync`],
    /// this stays `true` until every in-flight request -- including
    /// ones cancelled by a checksum escalation -- has actually reported
    /// back through [`Repository::process`].
    pub fn is_updating(&self) -> bool {
        self.is_updating
    }

    pub fn failure(&self) -> ResultCode {
        if self.status != ResultCode::NoError {
            self.status
        } else if !self.failures.is_empty() {
            ResultCode::PartialUpdate
        } else {
            ResultCode::NoError
        }
    }

    pub fn failures(&self) -> Vec<Failure> {
        self.failures.clone()
    }

    pub fn bytes_to_download(&self) -> u64 {
        self.queued
            .iter()
            .chain(self.active.values())
            .filter_map(|p| match &p.kind {
                RequestKind::File { expected_size, .. } => *expected_size,
                RequestKind::DirIndex { .. } => None,
            })
            .sum()
    }

    pub fn bytes_downloaded(&self) -> u64 {
        self.bytes_downloaded_total
    }

    /// Idempotent: a sync already in progress is left alone. Clears
    /// failure state, then enqueues a root `.dirindex` GET with no
    /// expected hash (the root is its own anchor).
    pub fn update(&mut self) -> Result<()> {
        if self.is_updating {
            return Ok(());
        }
        let base_url = self
            .base_url
            .clone()
            .context("base URL must be set before calling update()")?;

        self.failures.clear();
        self.status = ResultCode::NoError;
        self.is_updating = true;
        self.bytes_downloaded_total = 0;

        let url = build_child_url(&base_url, ".dirindex")?;
        self.enqueue(ROOT_HANDLE, RequestKind::DirIndex { expected_hash: None }, url);
        Ok(())
    }

    /// Drains completed network events and advances the sync. Also
    /// where extraction and hash-cache writes happen -- both are
    /// synchronous and will stall the caller if an archive is large.
    pub fn process(&mut self) -> Result<()> {
        let events = self.pool.poll();
        for event in events {
            self.dispatch_event(event)?;
        }
        Ok(())
    }

    fn next_request_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn get_or_create_directory(&mut self, relative_path: &str) -> usize {
        if let Some(&handle) = self.dir_handle_by_path.get(relative_path) {
            return handle;
        }
        let handle = self.directories.len();
        self.directories.push(Directory::new(relative_path));
        self.dir_handle_by_path
            .insert(relative_path.to_string(), handle);
        handle
    }

    fn enqueue(&mut self, dir_handle: usize, kind: RequestKind, url: Url) {
        let id = self.next_request_id();
        let pending = PendingRequest {
            id,
            dir_handle,
            url,
            kind,
        };
        if self.active.len() < POOL_CAP {
            self.submit_to_pool(pending);
        } else {
            self.queued.push_back(pending);
        }
    }

    fn submit_to_pool(&mut self, pending: PendingRequest) {
        let target = match &pending.kind {
            RequestKind::File { name, .. } => {
                let dir = &self.directories[pending.dir_handle];
                let rel = dir.child_relative_path(name);
                RequestTarget::File {
                    dest_path: self.root.join(rel),
                }
            }
            RequestKind::DirIndex { .. } => RequestTarget::DirIndex,
        };
        self.pool.submit(PoolRequest {
            id: pending.id,
            url: pending.url.clone(),
            target,
        });
        self.active.insert(pending.id, pending);
    }

    fn finish_request_bookkeeping(&mut self) {
        if let Some(next) = self.queued.pop_front() {
            self.submit_to_pool(next);
        }
        if let Err(e) = self.hash_cache.write_hash_cache() {
            warn!("failed to write hash cache: {e}");
        }
        if self.active.is_empty() && self.queued.is_empty() {
            self.is_updating = false;
        }
    }

    fn dispatch_event(&mut self, event: PoolEvent) -> Result<()> {
        let id = pool_event_id(&event);
        let pending = match self.active.remove(&id) {
            Some(p) => p,
            None => {
                self.finish_request_bookkeeping();
                return Ok(());
            }
        };

        if self.status != ResultCode::NoError {
            // A checksum escalation (or other terminal status) already
            // stopped the sync this `process()` call. Events for
            // requests that were in flight at that moment -- cancelled
            // but already completed on their worker thread before the
            // cancel flag was observed -- are still sitting in the
            // channel; drop them here instead of dispatching, so they
            // can't resurrect the sync by enqueueing further work.
            self.finish_request_bookkeeping();
            return Ok(());
        }

        match event {
            PoolEvent::FileOk { hash_hex, size, .. } => {
                if let RequestKind::File {
                    name, expected_hash, ..
                } = &pending.kind
                {
                    self.handle_file_done(pending.dir_handle, name.clone(), hash_hex, size, expected_hash.clone())?;
                }
            }
            PoolEvent::DirOk { body, hash_hex, .. } => {
                if let RequestKind::DirIndex { expected_hash } = &pending.kind {
                    self.handle_dir_done(pending.dir_handle, expected_hash.clone(), body, hash_hex)?;
                }
            }
            PoolEvent::NotFound { .. } => self.handle_not_found(&pending),
            PoolEvent::HttpError { .. } => self.handle_http_error(&pending),
            PoolEvent::TransportError { .. } => self.handle_transport_error(&pending),
            PoolEvent::Cancelled { .. } => {}
        }

        self.finish_request_bookkeeping();
        Ok(())
    }

    fn handle_not_found(&mut self, pending: &PendingRequest) {
        match &pending.kind {
            RequestKind::DirIndex { .. } => {
                let dir = &self.directories[pending.dir_handle];
                if dir.is_root() {
                    self.status = ResultCode::NotFound;
                } else {
                    self.failures.push(Failure {
                        path: dir.relative_path.clone(),
                        code: ResultCode::FileNotFound,
                    });
                }
            }
            RequestKind::File { name, .. } => {
                let path = self.directories[pending.dir_handle].child_relative_path(name);
                self.failures.push(Failure {
                    path,
                    code: ResultCode::FileNotFound,
                });
            }
        }
    }

    fn handle_http_error(&mut self, pending: &PendingRequest) {
        match &pending.kind {
            RequestKind::DirIndex { .. } => {
                let dir = &self.directories[pending.dir_handle];
                if dir.is_root() {
                    self.status = ResultCode::Http;
                } else {
                    self.failures.push(Failure {
                        path: dir.relative_path.clone(),
                        code: ResultCode::Http,
                    });
                }
            }
            RequestKind::File { name, .. } => {
                let path = self.directories[pending.dir_handle].child_relative_path(name);
                self.failures.push(Failure {
                    path,
                    code: ResultCode::Http,
                });
            }
        }
    }

    fn handle_transport_error(&mut self, pending: &PendingRequest) {
        match &pending.kind {
            RequestKind::DirIndex { .. } => {
                let dir = &self.directories[pending.dir_handle];
                if dir.is_root() {
                    self.status = ResultCode::Socket;
                } else {
                    self.failures.push(Failure {
                        path: dir.relative_path.clone(),
                        code: ResultCode::Socket,
                    });
                }
            }
            RequestKind::File { name, .. } => {
                let path = self.directories[pending.dir_handle].child_relative_path(name);
                self.failures.push(Failure {
                    path,
                    code: ResultCode::Socket,
                });
            }
        }
    }

    fn handle_file_done(
        &mut self,
        dir_handle: usize,
        name: String,
        actual_hash: String,
        size: u64,
        expected_hash: String,
    ) -> Result<()> {
        if actual_hash != expected_hash {
            // Do not delete the file: a concurrent server-side update may
            // make it briefly correct again on the next sync.
            let dir_relpath = self.directories[dir_handle].relative_path.clone();
            self.escalate_checksum_failure(&dir_relpath, &name);
            return Ok(());
        }

        let key = self.directories[dir_handle].child_relative_path(&name);
        let abs_path = self.root.join(&key);
        self.hash_cache
            .updated_file_contents(&key, &abs_path, &actual_hash);
        self.bytes_downloaded_total += size;

        if is_archive_leaf(&name) {
            self.extract_archive(dir_handle, &name)?;
        }
        Ok(())
    }

    fn handle_dir_done(
        &mut self,
        dir_handle: usize,
        expected_hash: Option<String>,
        body: Vec<u8>,
        hash_hex: String,
    ) -> Result<()> {
        if self.status != ResultCode::NoError {
            return Ok(());
        }
        if let Some(expected) = &expected_hash {
            if expected != &hash_hex {
                let dir_relpath = self.directories[dir_handle].relative_path.clone();
                self.escalate_checksum_failure_for_dir(&dir_relpath);
                return Ok(());
            }
        }

        let dir_relpath = self.directories[dir_handle].relative_path.clone();
        let dirindex_key = if dir_relpath.is_empty() {
            ".dirindex".to_string()
        } else {
            format!("{dir_relpath}/.dirindex")
        };
        let abs_path = self.root.join(&dirindex_key);

        let unchanged = self
            .hash_cache
            .hash_for_path(&dirindex_key, &abs_path)
            .map(|cached| cached == hash_hex)
            .unwrap_or(false);

        if !unchanged {
            let abs_dir = self.directories[dir_handle].absolute_path(&self.root);
            std::fs::create_dir_all(&abs_dir)?;
            atomic_write_dirindex(&abs_path, &body)?;
            self.hash_cache
                .updated_file_contents(&dirindex_key, &abs_path, &hash_hex);
        }

        let contents = String::from_utf8_lossy(&body).into_owned();
        self.directories[dir_handle].set_children_from_dirindex(&contents)?;
        self.bytes_downloaded_total += body.len() as u64;

        self.update_children_based_on_hash(dir_handle)?;
        Ok(())
    }

    /// Escalates a checksum mismatch on a file: sets repository-wide
    /// `status`, drops all queued work, cancels active requests, and
    /// records the failure. The sync cannot make further progress until
    /// a fresh `update()`.
    fn escalate_checksum_failure(&mut self, dir_relpath: &str, name: &str) {
        self.status = ResultCode::Checksum;
        self.queued.clear();
        for id in self.active.keys().copied().collect::<Vec<_>>() {
            self.pool.cancel(id);
        }
        let path = if dir_relpath.is_empty() {
            name.to_string()
        } else {
            format!("{dir_relpath}/{name}")
        };
        self.failures.push(Failure {
            path,
            code: ResultCode::Checksum,
        });
    }

    fn escalate_checksum_failure_for_dir(&mut self, dir_relpath: &str) {
        self.status = ResultCode::Checksum;
        self.queued.clear();
        for id in self.active.keys().copied().collect::<Vec<_>>() {
            self.pool.cancel(id);
        }
        self.failures.push(Failure {
            path: dir_relpath.to_string(),
            code: ResultCode::Checksum,
        });
    }

    /// The core diff/merge/schedule step described in the directory
    /// contract: merge in any installed-copy files, diff the parsed
    /// children against what's actually on disk, sweep orphans, recurse
    /// into already-correct subdirectories, and schedule fetches for
    /// everything else.
    fn update_children_based_on_hash(&mut self, dir_handle: usize) -> Result<()> {
        let relpath = self.directories[dir_handle].relative_path.clone();
        let abs_dir = self.directories[dir_handle].absolute_path(&self.root);
        let children = self.directories[dir_handle].children.clone();

        if let Some(installed) = self.installed_copy_path.clone() {
            let installed_dir = if relpath.is_empty() {
                installed
            } else {
                installed.join(&relpath)
            };
            copy_installed_children(&children, &abs_dir, &installed_dir);
        }

        let local_entries = list_local_entries(&abs_dir)?;

        let diff = {
            let hash_cache = &mut self.hash_cache;
            let root = &self.root;
            diff_children(&children, &local_entries, |child| {
                let key = if relpath.is_empty() {
                    child.hash_target_name()
                } else {
                    format!("{relpath}/{}", child.hash_target_name())
                };
                let abs = root.join(&key);
                hash_cache.hash_for_path(&key, &abs)
            })
        };

        remove_orphans(&abs_dir, &diff.orphans);

        for child in &diff.up_to_date_dirs {
            let child_relpath = self.directories[dir_handle].child_relative_path(&child.name);
            let child_handle = self.get_or_create_directory(&child_relpath);
            self.load_existing_dirindex(child_handle)?;
            self.update_children_based_on_hash(child_handle)?;
        }

        for child in diff.to_update {
            self.schedule_child_update(dir_handle, &child)?;
        }

        Ok(())
    }

    /// A subdirectory whose `.dirindex` hash already matched on disk
    /// still needs its children parsed before we can recurse, since a
    /// freshly-created `Directory` in the arena starts out childless.
    fn load_existing_dirindex(&mut self, dir_handle: usize) -> Result<()> {
        if !self.directories[dir_handle].children.is_empty() {
            return Ok(());
        }
        let path = self.directories[dir_handle].dirindex_path(&self.root);
        if let Ok(contents) = std::fs::read_to_string(&path) {
            self.directories[dir_handle].set_children_from_dirindex(&contents)?;
        }
        Ok(())
    }

    fn schedule_child_update(&mut self, dir_handle: usize, child: &ChildInfo) -> Result<()> {
        let dir = &self.directories[dir_handle];
        let dir_url = dir.url(self.base_url.as_ref().context("base URL not set")?)?;

        match child.kind {
            ChildType::File | ChildType::Tarball => {
                let url = build_child_url(&dir_url, &child.name)?;
                self.enqueue(
                    dir_handle,
                    RequestKind::File {
                        name: child.name.clone(),
                        expected_hash: child.expected_hash.clone(),
                        expected_size: child.expected_size,
                    },
                    url,
                );
            }
            ChildType::Dir => {
                let child_relpath = dir.child_relative_path(&child.name);
                let child_handle = self.get_or_create_directory(&child_relpath);
                let child_dir_url = build_child_url(&dir_url, &child.name)?;
                let url = build_child_url(&child_dir_url, ".dirindex")?;
                self.enqueue(
                    child_handle,
                    RequestKind::DirIndex {
                        expected_hash: Some(child.expected_hash.clone()),
                    },
                    url,
                );
            }
        }
        Ok(())
    }

    /// Atomically replaces any pre-existing sibling with the archive's
    /// stem (e.g. `foo/` or `foo.old-format` for `foo.tgz`), then runs
    /// the streaming extractor over the freshly-verified archive bytes.
    fn extract_archive(&mut self, dir_handle: usize, name: &str) -> Result<()> {
        let abs_dir = self.directories[dir_handle].absolute_path(&self.root);
        let archive_path = abs_dir.join(name);

        let stem = Path::new(name)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(name);
        let sibling = abs_dir.join(stem);
        if sibling.exists() {
            if sibling.is_dir() {
                std::fs::remove_dir_all(&sibling)?;
            } else {
                std::fs::remove_file(&sibling)?;
            }
        }

        let bytes = std::fs::read(&archive_path)
            .with_context(|| format!("reading archive {}", archive_path.display()))?;
        let mut extractor = ArchiveExtractor::with_filter(abs_dir, self.filter.clone());
        extractor.extract_bytes(&bytes)?;
        extractor.flush()?;

        if extractor.has_error() {
            let path = self.directories[dir_handle].child_relative_path(name);
            self.failures.push(Failure {
                path,
                code: ResultCode::Io,
            });
        }
        Ok(())
    }
}

impl Drop for Repository {
    fn drop(&mut self) {
        for id in self.active.keys() {
            self.pool.cancel(*id);
        }
    }
}

fn pool_event_id(event: &PoolEvent) -> u64 {
    match event {
        PoolEvent::FileOk { id, .. }
        | PoolEvent::DirOk { id, .. }
        | PoolEvent::NotFound { id }
        | PoolEvent::HttpError { id, .. }
        | PoolEvent::TransportError { id }
        | PoolEvent::Cancelled { id } => *id,
    }
}

fn is_archive_leaf(name: &str) -> bool {
    name.ends_with(".tgz") || name.ends_with(".zip")
}

fn build_child_url(dir_url: &Url, name: &str) -> Result<Url> {
    let mut url = dir_url.clone();
    let mut path = url.path().trim_end_matches('/').to_string();
    path.push('/');
    path.push_str(name);
    url.set_path(&path);
    Ok(url)
}

fn atomic_write_dirindex(path: &Path, body: &[u8]) -> Result<()> {
    crate::util::atomic_write(path, body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_repository_has_root_directory_handle() {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repository::new(dir.path());
        assert_eq!(repo.directories.len(), 1);
        assert!(repo.directories[ROOT_HANDLE].is_root());
    }

    #[test]
    fn update_requires_base_url() {
        let dir = tempfile::tempdir().unwrap();
        let mut repo = Repository::new(dir.path());
        assert!(repo.update().is_err());
    }

    #[test]
    fn update_is_idempotent_once_in_progress() {
        let dir = tempfile::tempdir().unwrap();
        let mut repo = Repository::new(dir.path());
        repo.set_base_url(Url::parse("http://example.test/repo").unwrap());
        repo.update().unwrap();
        assert!(repo.is_doing_sync());
        // Second call is a no-op; still exactly one request in flight.
        repo.update().unwrap();
        assert_eq!(repo.active.len(), 1);
    }

    #[test]
    fn failure_reports_partial_update_when_only_file_failures_present() {
        let dir = tempfile::tempdir().unwrap();
        let mut repo = Repository::new(dir.path());
        repo.failures.push(Failure {
            path: "fileA".to_string(),
            code: ResultCode::FileNotFound,
        });
        assert_eq!(repo.failure(), ResultCode::PartialUpdate);
    }

    /// A `DirOk` event for a request that was in flight at the moment a
    /// checksum escalation set `status`, but which completed on its
    /// worker thread before the cancellation was observed, must not be
    /// allowed to enqueue further work -- otherwise a sibling
    /// subdirectory's index can resurrect a sync that already stopped.
    #[test]
    fn stale_event_after_checksum_escalation_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let mut repo = Repository::new(dir.path());
        repo.set_base_url(Url::parse("http://example.test/repo").unwrap());
        repo.status = ResultCode::Checksum;

        repo.active.insert(
            1,
            PendingRequest {
                id: 1,
                dir_handle: ROOT_HANDLE,
                url: Url::parse("http://example.test/repo/sibling/.dirindex").unwrap(),
                kind: RequestKind::DirIndex { expected_hash: None },
            },
        );

        let event = PoolEvent::DirOk {
            id: 1,
            body: b"version:1\nf:child:aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa\n".to_vec(),
            hash_hex: "deadbeef".to_string(),
        };
        repo.dispatch_event(event).unwrap();

        assert!(repo.active.is_empty());
        assert!(repo.queued.is_empty());
        assert_eq!(repo.directories.len(), 1, "no child directory should have been created");
    }

    #[test]
    fn failure_reports_status_when_set() {
        let dir = tempfile::tempdir().unwrap();
        let mut repo = Repository::new(dir.path());
        repo.status = ResultCode::Checksum;
        assert_eq!(repo.failure(), ResultCode::Checksum);
    }
}
