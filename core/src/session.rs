//! The on-disk state machine for one command invocation.
//!
//! ```text
//! CREATED --request.json appears--------------------> QUEUED
//! QUEUED --worker.claim exclusive-create succeeds---> CLAIMED
//! CLAIMED --status=running written------------------> RUNNING
//! RUNNING --status=exited|signaled|error written----> DONE
//! ```
//!
//! `request.json` is immutable once written, `worker.claim` is created at
//! most once, and a terminal `status.json` is never overwritten. All JSON
//! documents are published with a temp-file + rename so readers never see
//! partial contents.

use std::fs;
use std::fs::OpenOptions;
use std::io;
use std::io::Write;
use std::path::Path;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tempfile::NamedTempFile;

use crate::error::PigeonError;
use crate::paths::PathLayout;
use crate::paths::SessionPaths;
use crate::protocol::ClaimRecord;
use crate::protocol::SessionRequest;
use crate::protocol::SessionStatus;

/// A scanner's view of a session, derived purely from which files exist.
#[derive(Debug, Clone)]
pub enum SessionState {
    /// `request.json` present, no claim, no status.
    Queued,
    /// Claimed but the worker has not yet published `status=running`.
    Claimed,
    Running(SessionStatus),
    Done(SessionStatus),
}

/// Creates the session directory and publishes `request.json`.
///
/// The directory is created with plain `create_dir` so an id collision
/// surfaces as `SessionExists` and the caller can retry with a fresh id.
/// The three JSONL logs are created empty so tailers on either side never
/// need to special-case a missing file.
pub fn create(layout: &PathLayout, request: &SessionRequest) -> Result<SessionPaths, PigeonError> {
    let paths = layout.session(&request.session_id);
    fs::create_dir_all(layout.sessions_dir())
        .map_err(|e| PigeonError::io("creating sessions directory", e))?;
    match fs::create_dir(paths.dir()) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
            return Err(PigeonError::SessionExists {
                session_id: request.session_id.clone(),
            });
        }
        Err(err) => return Err(PigeonError::io("creating session directory", err)),
    }

    write_json_atomic(&paths.request(), request)
        .map_err(|e| PigeonError::io("writing request.json", e))?;
    for log in [paths.stream(), paths.stdin(), paths.control()] {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log)
            .map_err(|e| PigeonError::io("creating session log", e))?;
    }
    Ok(paths)
}

/// Attempts to claim a queued session via `O_CREAT|O_EXCL`.
///
/// Exactly one worker wins; everyone else observes `false`. The claim
/// contents are flushed before the function returns so a reader that sees
/// the file sees the claiming worker's identity.
pub fn try_claim(paths: &SessionPaths, claim: &ClaimRecord) -> Result<bool, PigeonError> {
    let mut file = match OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(paths.claim())
    {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => return Ok(false),
        Err(err) => return Err(PigeonError::io("creating worker.claim", err)),
    };
    let body = serde_json::to_string(claim).map_err(io::Error::other);
    let body = body.map_err(|e| PigeonError::io("encoding worker.claim", e))?;
    file.write_all(body.as_bytes())
        .and_then(|()| file.sync_data())
        .map_err(|e| PigeonError::io("writing worker.claim", e))?;
    Ok(true)
}

pub fn read_request(paths: &SessionPaths) -> Result<SessionRequest, PigeonError> {
    read_json(&paths.request()).map_err(|err| PigeonError::MalformedRequest {
        session_id: paths.session_id().to_string(),
        detail: err.to_string(),
    })
}

/// Reads `status.json`; `None` means the session is still queued or
/// merely claimed.
pub fn read_status(paths: &SessionPaths) -> Result<Option<SessionStatus>, PigeonError> {
    match read_json(&paths.status()) {
        Ok(status) => Ok(Some(status)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(PigeonError::io("reading status.json", err)),
    }
}

/// Publishes a status phase atomically, refusing to regress a terminal
/// state.
pub fn write_status(paths: &SessionPaths, status: &SessionStatus) -> Result<(), PigeonError> {
    if let Some(current) = read_status(paths).unwrap_or(None)
        && current.is_terminal()
    {
        return Err(PigeonError::TerminalStatus {
            session_id: paths.session_id().to_string(),
        });
    }
    write_json_atomic(&paths.status(), status)
        .map_err(|e| PigeonError::io("writing status.json", e))
}

/// Classifies a session for the worker's scan pass.
pub fn observe(paths: &SessionPaths) -> Result<SessionState, PigeonError> {
    match read_status(paths)? {
        Some(status) if status.is_terminal() => Ok(SessionState::Done(status)),
        Some(status) => Ok(SessionState::Running(status)),
        None if paths.claim().exists() => Ok(SessionState::Claimed),
        None => Ok(SessionState::Queued),
    }
}

/// Temp-file + rename publication in the target directory, fsynced before
/// the rename so a crash cannot expose a short file under the final name.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> io::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;
    let mut tmp = NamedTempFile::new_in(parent)?;
    let body = serde_json::to_string(value).map_err(io::Error::other)?;
    tmp.write_all(body.as_bytes())?;
    tmp.as_file().sync_data()?;
    tmp.persist(path).map_err(|err| err.error)?;
    Ok(())
}

fn read_json<T: DeserializeOwned>(path: &Path) -> io::Result<T> {
    let body = fs::read(path)?;
    serde_json::from_slice(&body).map_err(io::Error::other)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::protocol::ClientInfo;
    use crate::protocol::TerminalSize;
    use crate::protocol::WorkerRef;

    fn request(session_id: &str) -> SessionRequest {
        SessionRequest {
            session_id: session_id.to_string(),
            cwd: "/work".into(),
            argv: vec!["echo hi".to_string()],
            use_shell: true,
            env_overrides: Default::default(),
            unset_env: Vec::new(),
            route: None,
            terminal: TerminalSize::default(),
            created_at: 1_700_000_000.0,
            client: ClientInfo {
                host: "gpu01".into(),
                pid: 1,
                user: "ci".into(),
            },
        }
    }

    fn claim() -> ClaimRecord {
        ClaimRecord {
            host: "cpu01".into(),
            pid: 42,
            epoch: 1_700_000_001.0,
        }
    }

    #[test]
    fn create_publishes_request_and_empty_logs() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let layout = PathLayout::new(tmp.path(), "ns");
        let paths = create(&layout, &request("sid-1")).expect("create");

        let back = read_request(&paths).expect("request round-trip");
        assert_eq!(back.session_id, "sid-1");
        assert!(paths.stream().exists());
        assert!(paths.stdin().exists());
        assert!(paths.control().exists());
        assert!(!paths.status().exists());
        assert!(matches!(
            observe(&paths).expect("observe"),
            SessionState::Queued
        ));
    }

    #[test]
    fn create_refuses_id_collision() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let layout = PathLayout::new(tmp.path(), "ns");
        create(&layout, &request("sid-1")).expect("first create");
        let err = create(&layout, &request("sid-1")).expect_err("collision");
        assert!(matches!(err, PigeonError::SessionExists { .. }));
    }

    #[test]
    fn claim_is_exclusive() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let layout = PathLayout::new(tmp.path(), "ns");
        let paths = create(&layout, &request("sid-1")).expect("create");

        assert!(try_claim(&paths, &claim()).expect("first claim"));
        assert!(!try_claim(&paths, &claim()).expect("second claim loses"));
        assert!(matches!(
            observe(&paths).expect("observe"),
            SessionState::Claimed
        ));
    }

    #[test]
    fn status_transitions_are_monotonic() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let layout = PathLayout::new(tmp.path(), "ns");
        let paths = create(&layout, &request("sid-1")).expect("create");

        let running = SessionStatus::Running {
            worker: WorkerRef {
                host: "cpu01".into(),
                pid: 42,
            },
            started_at: 1.0,
        };
        write_status(&paths, &running).expect("running");
        assert!(matches!(
            observe(&paths).expect("observe"),
            SessionState::Running(_)
        ));

        let exited = SessionStatus::Exited {
            code: 7,
            started_at: 1.0,
            ended_at: 2.0,
        };
        write_status(&paths, &exited).expect("terminal");
        assert!(matches!(
            observe(&paths).expect("observe"),
            SessionState::Done(SessionStatus::Exited { code: 7, .. })
        ));

        // A terminal state never changes, and re-reads stay stable.
        let err = write_status(&paths, &running).expect_err("regression refused");
        assert!(matches!(err, PigeonError::TerminalStatus { .. }));
        let stable = read_status(&paths).expect("read").expect("present");
        assert_eq!(stable.exit_code(), 7);
    }

    #[test]
    fn malformed_request_is_reported_not_panicked() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let layout = PathLayout::new(tmp.path(), "ns");
        let paths = layout.session("sid-bad");
        fs::create_dir_all(paths.dir()).expect("mkdir");
        fs::write(paths.request(), b"{ not json").expect("write");

        let err = read_request(&paths).expect_err("malformed");
        assert!(matches!(err, PigeonError::MalformedRequest { .. }));
    }
}
