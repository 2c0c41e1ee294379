//! On-disk record schemas shared by the client and the worker.
//!
//! Every file in a session directory holds either a single JSON document
//! (`request.json`, `status.json`, `worker.claim`) or newline-delimited JSON
//! records (`stream.jsonl`, `stdin.jsonl`, `control.jsonl`). The shapes here
//! are the wire contract; changing a field name changes the protocol.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use serde::Deserialize;
use serde::Serialize;

/// Terminal geometry captured at session creation and on resize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalSize {
    pub cols: u16,
    pub rows: u16,
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

/// Requester identity, recorded for debugging only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientInfo {
    pub host: String,
    pub pid: u32,
    pub user: String,
}

/// `request.json` — written once by the client, immutable thereafter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRequest {
    pub session_id: String,
    pub cwd: PathBuf,
    pub argv: Vec<String>,
    #[serde(default = "default_use_shell")]
    pub use_shell: bool,
    #[serde(default)]
    pub env_overrides: BTreeMap<String, String>,
    /// Variables removed from the worker's base environment before
    /// `env_overrides` apply. Used to clear color switches the worker's
    /// launch context set but the client's terminal did not.
    #[serde(default)]
    pub unset_env: Vec<String>,
    #[serde(default)]
    pub route: Option<String>,
    pub terminal: TerminalSize,
    pub created_at: f64,
    pub client: ClientInfo,
}

fn default_use_shell() -> bool {
    true
}

/// Identity of the worker that claimed or is running a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRef {
    pub host: String,
    pub pid: u32,
}

/// `status.json` — written by the worker, atomically, in monotonic phases.
///
/// Absence of the file means the session is still queued.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum SessionStatus {
    Running {
        worker: WorkerRef,
        started_at: f64,
    },
    Exited {
        code: i32,
        started_at: f64,
        ended_at: f64,
    },
    Signaled {
        signal: String,
        started_at: f64,
        ended_at: f64,
    },
    Error {
        message: String,
        ended_at: f64,
    },
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SessionStatus::Running { .. })
    }

    /// The exit code a client should mirror for this status.
    ///
    /// `error` maps to 125, a signal death to the conventional
    /// `128 + signo`.
    pub fn exit_code(&self) -> i32 {
        match self {
            SessionStatus::Running { .. } => EXIT_CODE_REMOTE_ERROR,
            SessionStatus::Exited { code, .. } => *code,
            SessionStatus::Signaled { signal, .. } => {
                EXIT_CODE_SIGNAL_BASE + signal_number(signal).unwrap_or(0)
            }
            SessionStatus::Error { .. } => EXIT_CODE_REMOTE_ERROR,
        }
    }
}

/// `worker.claim` — written exactly once via exclusive create.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimRecord {
    pub host: String,
    pub pid: u32,
    pub epoch: f64,
}

/// One line of `stream.jsonl`: a timed chunk of PTY output.
///
/// `fd` is 1 or 2; a PTY merges stderr into the master so in practice
/// every record carries `fd: 1`, but readers accept both.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamRecord {
    pub t: f64,
    pub fd: u8,
    pub data_b64: String,
}

impl StreamRecord {
    pub fn new(t: f64, fd: u8, data: &[u8]) -> Self {
        Self {
            t,
            fd,
            data_b64: B64.encode(data),
        }
    }

    pub fn decode(&self) -> Option<Vec<u8>> {
        B64.decode(&self.data_b64).ok()
    }
}

/// One line of `stdin.jsonl`: bytes for the child, or end-of-input.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StdinRecord {
    Eof { t: f64, eof: bool },
    Data { t: f64, data_b64: String },
}

impl StdinRecord {
    pub fn data(t: f64, bytes: &[u8]) -> Self {
        Self::Data {
            t,
            data_b64: B64.encode(bytes),
        }
    }

    pub fn eof(t: f64) -> Self {
        Self::Eof { t, eof: true }
    }

    pub fn decode(&self) -> Option<Vec<u8>> {
        match self {
            Self::Data { data_b64, .. } => B64.decode(data_b64).ok(),
            Self::Eof { .. } => None,
        }
    }

    pub fn is_eof(&self) -> bool {
        matches!(self, Self::Eof { eof: true, .. })
    }
}

/// Signals a client may forward through `control.jsonl`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalName {
    #[serde(rename = "SIGINT")]
    Int,
    #[serde(rename = "SIGTERM")]
    Term,
    #[serde(rename = "SIGQUIT")]
    Quit,
}

impl SignalName {
    pub fn signo(self) -> i32 {
        match self {
            SignalName::Int => libc::SIGINT,
            SignalName::Term => libc::SIGTERM,
            SignalName::Quit => libc::SIGQUIT,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SignalName::Int => "SIGINT",
            SignalName::Term => "SIGTERM",
            SignalName::Quit => "SIGQUIT",
        }
    }
}

/// One line of `control.jsonl`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlRecord {
    pub t: f64,
    #[serde(flatten)]
    pub action: ControlAction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ControlAction {
    Signal { signal: SignalName },
    Resize { cols: u16, rows: u16 },
}

/// `workers/<host>-<pid>.json` — liveness beacon for clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerHeartbeat {
    pub host: String,
    pub pid: u32,
    pub route: Option<String>,
    pub started_at: f64,
    pub updated_at: f64,
    pub max_jobs: usize,
    pub active: usize,
}

/// Exit code the client uses when no live worker answered the precheck.
pub const EXIT_CODE_NO_WORKER: i32 = 124;
/// Exit code mirrored for a remote `state = "error"` status.
pub const EXIT_CODE_REMOTE_ERROR: i32 = 125;
/// Conventional shell base for signal deaths.
pub const EXIT_CODE_SIGNAL_BASE: i32 = 128;
/// Exit code for unusable invocations (empty argv, ambiguous operators).
pub const EXIT_CODE_USAGE: i32 = 2;

/// Seconds since the Unix epoch as a float, the timestamp unit used across
/// every record in the protocol.
pub fn now_epoch() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Generates a session id: millisecond timestamp prefix plus a short random
/// token, unique within a namespace and lexicographically ordered by
/// creation time.
pub fn new_session_id() -> String {
    let millis = chrono::Utc::now().timestamp_millis();
    let token = uuid::Uuid::new_v4().simple().to_string();
    format!("{millis}-{}", &token[..12])
}

/// Resolves this process's hostname for heartbeats and claim records.
pub fn host_name() -> String {
    let mut buf = [0u8; 256];
    // SAFETY: `buf` is a valid writable buffer for the duration of the call
    // and gethostname null-terminates within the provided length on success.
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len()) };
    if rc == 0 {
        let end = buf.iter().position(|b| *b == 0).unwrap_or(buf.len());
        if let Ok(name) = std::str::from_utf8(&buf[..end])
            && !name.is_empty()
        {
            return name.to_string();
        }
    }
    "localhost".to_string()
}

/// Maps a signal name like `SIGTERM` (or a bare number) to its number.
pub fn signal_number(name: &str) -> Option<i32> {
    let name = name.strip_prefix("SIG").unwrap_or(name);
    let known = match name {
        "HUP" => libc::SIGHUP,
        "INT" => libc::SIGINT,
        "QUIT" => libc::SIGQUIT,
        "ILL" => libc::SIGILL,
        "TRAP" => libc::SIGTRAP,
        "ABRT" => libc::SIGABRT,
        "BUS" => libc::SIGBUS,
        "FPE" => libc::SIGFPE,
        "KILL" => libc::SIGKILL,
        "USR1" => libc::SIGUSR1,
        "SEGV" => libc::SIGSEGV,
        "USR2" => libc::SIGUSR2,
        "PIPE" => libc::SIGPIPE,
        "ALRM" => libc::SIGALRM,
        "TERM" => libc::SIGTERM,
        _ => return name.parse::<i32>().ok(),
    };
    Some(known)
}

/// Route matching for claim filtering and the client liveness precheck.
///
/// Tagged work only runs on a worker advertising the same tag. Untagged
/// work runs anywhere, unless a routed worker opted out of unrouted
/// sessions via config.
pub fn route_accepts(
    worker_route: Option<&str>,
    request_route: Option<&str>,
    accept_unrouted: bool,
) -> bool {
    match (worker_route, request_route) {
        (_, None) => worker_route.is_none() || accept_unrouted,
        (Some(w), Some(r)) => w == r,
        (None, Some(_)) => false,
    }
}

/// Normalizes a route tag: trimmed, empty collapses to `None`.
pub fn normalize_route(route: Option<&str>) -> Option<String> {
    let route = route?.trim();
    if route.is_empty() {
        None
    } else {
        Some(route.to_string())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    #[test]
    fn request_round_trips_with_defaults() {
        let raw = json!({
            "session_id": "1700000000000-abcdefabcdef",
            "cwd": "/work/project",
            "argv": ["echo hi"],
            "terminal": {"cols": 120, "rows": 40},
            "created_at": 1_700_000_000.25,
            "client": {"host": "gpu01", "pid": 4242, "user": "ci"},
        });
        let req: SessionRequest = serde_json::from_value(raw).expect("deserialize request");
        assert!(req.use_shell, "use_shell defaults to true");
        assert!(req.env_overrides.is_empty());
        assert!(req.unset_env.is_empty());
        assert_eq!(req.route, None);
        assert_eq!(req.terminal.cols, 120);
    }

    #[test]
    fn status_serializes_with_state_tag() {
        let status = SessionStatus::Exited {
            code: 7,
            started_at: 1.0,
            ended_at: 2.0,
        };
        let value = serde_json::to_value(&status).expect("serialize status");
        assert_eq!(value["state"], "exited");
        assert_eq!(value["code"], 7);

        let signaled: SessionStatus = serde_json::from_value(json!({
            "state": "signaled",
            "signal": "SIGINT",
            "started_at": 1.0,
            "ended_at": 2.0,
        }))
        .expect("deserialize signaled");
        assert_eq!(signaled.exit_code(), 130);
    }

    #[test]
    fn error_status_maps_to_125() {
        let status = SessionStatus::Error {
            message: "spawn failed".into(),
            ended_at: 3.0,
        };
        assert!(status.is_terminal());
        assert_eq!(status.exit_code(), 125);
    }

    #[test]
    fn stdin_records_distinguish_eof_from_data() {
        let data = StdinRecord::data(0.5, b"abc\n");
        let eof = StdinRecord::eof(0.6);

        let data_json = serde_json::to_string(&data).expect("serialize data");
        let eof_json = serde_json::to_string(&eof).expect("serialize eof");
        assert!(data_json.contains("data_b64"));
        assert!(eof_json.contains("\"eof\":true"));

        let back: StdinRecord = serde_json::from_str(&data_json).expect("deserialize data");
        assert_eq!(back.decode().as_deref(), Some(b"abc\n".as_slice()));
        let back: StdinRecord = serde_json::from_str(&eof_json).expect("deserialize eof");
        assert!(back.is_eof());
    }

    #[test]
    fn control_records_round_trip() {
        let sig = ControlRecord {
            t: 1.5,
            action: ControlAction::Signal {
                signal: SignalName::Int,
            },
        };
        let value = serde_json::to_value(&sig).expect("serialize signal");
        assert_eq!(value["kind"], "signal");
        assert_eq!(value["signal"], "SIGINT");

        let resize: ControlRecord = serde_json::from_value(json!({
            "t": 2.0,
            "kind": "resize",
            "cols": 132,
            "rows": 50,
        }))
        .expect("deserialize resize");
        match resize.action {
            ControlAction::Resize { cols, rows } => {
                assert_eq!((cols, rows), (132, 50));
            }
            other => panic!("expected resize, got {other:?}"),
        }
    }

    #[test]
    fn stream_record_round_trips_bytes() {
        let rec = StreamRecord::new(0.25, 1, b"hi\r\n");
        let line = serde_json::to_string(&rec).expect("serialize");
        let back: StreamRecord = serde_json::from_str(&line).expect("deserialize");
        assert_eq!(back.decode().as_deref(), Some(b"hi\r\n".as_slice()));
        assert_eq!(back.fd, 1);
    }

    #[test]
    fn session_ids_are_unique_and_ordered_by_prefix() {
        let a = new_session_id();
        let b = new_session_id();
        assert_ne!(a, b);
        let (millis, token) = a.split_once('-').expect("id has a dash");
        assert!(millis.parse::<i64>().is_ok());
        assert_eq!(token.len(), 12);
    }

    #[test]
    fn signal_table_covers_common_names() {
        assert_eq!(signal_number("SIGINT"), Some(2));
        assert_eq!(signal_number("TERM"), Some(15));
        assert_eq!(signal_number("SIGKILL"), Some(9));
        assert_eq!(signal_number("9"), Some(9));
        assert_eq!(signal_number("SIGWHATEVER"), None);
    }

    #[test]
    fn route_matching_truth_table() {
        // Untagged request: unrouted worker always accepts; routed worker
        // accepts only when permissive.
        assert!(route_accepts(None, None, true));
        assert!(route_accepts(None, None, false));
        assert!(route_accepts(Some("gpu"), None, true));
        assert!(!route_accepts(Some("gpu"), None, false));
        // Tagged request: exact match required.
        assert!(route_accepts(Some("gpu"), Some("gpu"), false));
        assert!(!route_accepts(Some("gpu"), Some("cpu"), true));
        assert!(!route_accepts(None, Some("gpu"), true));
    }

    #[test]
    fn normalize_route_collapses_empty() {
        assert_eq!(normalize_route(Some("  ")), None);
        assert_eq!(normalize_route(Some(" gpu ")), Some("gpu".to_string()));
        assert_eq!(normalize_route(None), None);
    }
}
