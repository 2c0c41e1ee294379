//! Deterministic layout of the shared cache directory.
//!
//! ```text
//! <cache>/namespaces/<ns>/sessions/<sid>/request.json
//! <cache>/namespaces/<ns>/sessions/<sid>/status.json
//! <cache>/namespaces/<ns>/sessions/<sid>/stream.jsonl
//! <cache>/namespaces/<ns>/sessions/<sid>/stdin.jsonl
//! <cache>/namespaces/<ns>/sessions/<sid>/control.jsonl
//! <cache>/namespaces/<ns>/sessions/<sid>/worker.claim
//! <cache>/namespaces/<ns>/workers/<host>-<pid>.json
//! <cache>/namespaces/<ns>/locks/<sha256(cwd)>.lock
//! ```

use std::fs;
use std::io;
use std::path::Path;
use std::path::PathBuf;

use sha2::Digest;
use sha2::Sha256;

/// Pure mapping from `(cache_root, namespace)` to every path the protocol
/// touches. Cheap to clone; holds no handles.
#[derive(Debug, Clone)]
pub struct PathLayout {
    cache_root: PathBuf,
    namespace: String,
}

impl PathLayout {
    pub fn new(cache_root: impl Into<PathBuf>, namespace: impl Into<String>) -> Self {
        Self {
            cache_root: cache_root.into(),
            namespace: namespace.into(),
        }
    }

    pub fn cache_root(&self) -> &Path {
        &self.cache_root
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn namespace_root(&self) -> PathBuf {
        self.cache_root.join("namespaces").join(&self.namespace)
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.namespace_root().join("sessions")
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.namespace_root().join("locks")
    }

    pub fn workers_dir(&self) -> PathBuf {
        self.namespace_root().join("workers")
    }

    pub fn session(&self, session_id: &str) -> SessionPaths {
        SessionPaths::new(self.sessions_dir().join(session_id))
    }

    /// Per-cwd lock path, keyed by the hex sha256 of the absolute path so
    /// arbitrary directory names stay filesystem-safe.
    pub fn cwd_lock_path(&self, cwd: &Path) -> PathBuf {
        let digest = Sha256::digest(cwd.as_os_str().as_encoded_bytes());
        self.locks_dir().join(format!("{digest:x}.lock"))
    }

    pub fn worker_heartbeat_path(&self, host: &str, pid: u32) -> PathBuf {
        let safe: String = host
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.workers_dir().join(format!("{safe}-{pid}.json"))
    }

    /// Creates the namespace subtree. Called once at client/worker start.
    pub fn ensure_dirs(&self) -> io::Result<()> {
        fs::create_dir_all(self.sessions_dir())?;
        fs::create_dir_all(self.locks_dir())?;
        fs::create_dir_all(self.workers_dir())?;
        Ok(())
    }
}

/// The file set backing one session directory.
#[derive(Debug, Clone)]
pub struct SessionPaths {
    dir: PathBuf,
}

impl SessionPaths {
    fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn session_id(&self) -> &str {
        self.dir
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or_default()
    }

    pub fn request(&self) -> PathBuf {
        self.dir.join("request.json")
    }

    pub fn status(&self) -> PathBuf {
        self.dir.join("status.json")
    }

    pub fn stream(&self) -> PathBuf {
        self.dir.join("stream.jsonl")
    }

    pub fn stdin(&self) -> PathBuf {
        self.dir.join("stdin.jsonl")
    }

    pub fn control(&self) -> PathBuf {
        self.dir.join("control.jsonl")
    }

    pub fn claim(&self) -> PathBuf {
        self.dir.join("worker.claim")
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn layout() -> PathLayout {
        PathLayout::new("/cache", "alice")
    }

    #[test]
    fn session_paths_follow_the_contract() {
        let session = layout().session("123-abc");
        assert_eq!(
            session.request(),
            PathBuf::from("/cache/namespaces/alice/sessions/123-abc/request.json")
        );
        assert_eq!(
            session.claim(),
            PathBuf::from("/cache/namespaces/alice/sessions/123-abc/worker.claim")
        );
        assert_eq!(session.session_id(), "123-abc");
    }

    #[test]
    fn cwd_lock_is_keyed_by_sha256_hex() {
        let path = layout().cwd_lock_path(Path::new("/work/project"));
        let name = path.file_name().and_then(|n| n.to_str()).expect("name");
        assert!(name.ends_with(".lock"));
        assert_eq!(name.len(), 64 + ".lock".len());
        // Stable digest for a stable path.
        assert_eq!(path, layout().cwd_lock_path(Path::new("/work/project")));
        assert_ne!(path, layout().cwd_lock_path(Path::new("/work/other")));
    }

    #[test]
    fn heartbeat_path_sanitizes_host_names() {
        let path = layout().worker_heartbeat_path("gpu node/01", 99);
        assert_eq!(
            path,
            PathBuf::from("/cache/namespaces/alice/workers/gpu_node_01-99.json")
        );
    }

    #[test]
    fn ensure_dirs_creates_the_subtree() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let layout = PathLayout::new(tmp.path(), "ns");
        layout.ensure_dirs().expect("ensure dirs");
        assert!(layout.sessions_dir().is_dir());
        assert!(layout.locks_dir().is_dir());
        assert!(layout.workers_dir().is_dir());
    }
}
