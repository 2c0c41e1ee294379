//! The foreground driver: publishes a session, mirrors remote I/O, and
//! exits with the remote command's code.
//!
//! The client never talks to a worker directly. It proves one is alive
//! from heartbeat freshness, writes `request.json`, then tails the stream
//! log while forwarding local stdin, signals and terminal resizes through
//! the session's append-only logs.

use std::collections::BTreeMap;
use std::io::IsTerminal;
use std::io::Read;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use std::time::Instant;

use tokio::signal::unix::SignalKind;
use tokio::signal::unix::signal;
use tracing::debug;
use tracing::warn;

use crate::append_log::AppendLog;
use crate::append_log::log_len;
use crate::append_log::tail_records;
use crate::argv;
use crate::argv::ArgvError;
use crate::config;
use crate::config::Settings;
use crate::error::PigeonError;
use crate::paths::PathLayout;
use crate::paths::SessionPaths;
use crate::protocol::ClientInfo;
use crate::protocol::ControlAction;
use crate::protocol::ControlRecord;
use crate::protocol::EXIT_CODE_NO_WORKER;
use crate::protocol::EXIT_CODE_USAGE;
use crate::protocol::SessionRequest;
use crate::protocol::SessionStatus;
use crate::protocol::SignalName;
use crate::protocol::StdinRecord;
use crate::protocol::StreamRecord;
use crate::protocol::TerminalSize;
use crate::protocol::WorkerHeartbeat;
use crate::protocol::host_name;
use crate::protocol::new_session_id;
use crate::protocol::normalize_route;
use crate::protocol::now_epoch;
use crate::session;

const DEFAULT_WAIT_WORKER_SECS: f64 = 3.0;
const PRECHECK_POLL: Duration = Duration::from_millis(100);
const TAIL_POLL: Duration = Duration::from_millis(50);
const STDIN_CHUNK_BYTES: usize = 1024;
const SESSION_ID_RETRIES: usize = 5;
/// Local terminal variables copied into the request so the remote child
/// renders for the terminal the user is actually looking at.
const TERMINAL_ENV_KEYS: &[&str] = &[
    "TERM",
    "COLORTERM",
    "TERM_PROGRAM",
    "TERM_PROGRAM_VERSION",
    "LANG",
    "LC_ALL",
    "LC_CTYPE",
    "LS_COLORS",
    "NO_COLOR",
    "FORCE_COLOR",
];
/// Color switches that must also be *cleared* remotely when the client's
/// terminal does not set them, or a worker launched with NO_COLOR=1 /
/// FORCE_COLOR=1 would impose its own rendering on every session.
const COLOR_SWITCH_KEYS: &[&str] = &["NO_COLOR", "FORCE_COLOR"];

#[derive(Debug, Default)]
pub struct ClientOptions {
    pub config_path: Option<PathBuf>,
    pub route: Option<String>,
    pub wait_worker: Option<f64>,
    pub verbose: bool,
}

/// Runs one remote command to completion and returns the exit code the
/// process should mirror.
pub async fn run(command: Vec<String>, opts: ClientOptions) -> Result<i32, PigeonError> {
    if command.is_empty() {
        eprintln!("usage: pigeon [--route R] [--wait-worker S] <cmd...>");
        return Ok(EXIT_CODE_USAGE);
    }

    let config_file = config::config_path(opts.config_path.as_deref());
    let settings = config::load_file(&config_file)?.resolve()?;

    let normalized = match argv::normalize(&command, &settings.remote_env) {
        Ok(normalized) => normalized,
        Err(ArgvError::Empty) => {
            eprintln!("usage: pigeon [--route R] [--wait-worker S] <cmd...>");
            return Ok(EXIT_CODE_USAGE);
        }
        Err(err) => {
            eprintln!("pigeon: {err}");
            return Ok(EXIT_CODE_USAGE);
        }
    };

    settings
        .layout
        .ensure_dirs()
        .map_err(|e| PigeonError::io("creating cache directories", e))?;

    let route = normalize_route(opts.route.as_deref()).or_else(|| settings.route.clone());
    let wait_worker = resolve_wait_worker(opts.wait_worker);

    // Worker-liveness precheck: refuse to publish a session nobody will
    // pick up.
    let workers = wait_for_worker(&settings, route.as_deref(), wait_worker).await;
    if workers.is_empty() {
        let route_label = route.as_deref().unwrap_or("-");
        eprintln!(
            "pigeon: no live worker within {wait_worker:.1}s \
             (namespace={} route={route_label} cache={})",
            settings.layout.namespace(),
            settings.layout.cache_root().display(),
        );
        match &route {
            Some(route) => eprintln!("pigeon: start one with: pigeon worker --route {route}"),
            None => eprintln!("pigeon: start one with: pigeon worker"),
        }
        return Ok(EXIT_CODE_NO_WORKER);
    }

    let cwd = std::env::current_dir()
        .map_err(|e| PigeonError::io("resolving current directory", e))?;
    let paths = publish_session(&settings, &normalized, &cwd, route.clone())?;
    if opts.verbose {
        eprintln!("[pigeon] session={}", paths.session_id());
    }

    // Near-raw proxy mode: keystrokes travel verbatim; the remote PTY's
    // line discipline does the editing.
    let raw_guard = RawModeGuard::enter();
    let start = Instant::now();

    spawn_signal_forwarder(&settings, &paths, start);
    spawn_stdin_pump(&settings, &paths, start);

    let code = mirror_session(&paths, opts.verbose).await?;
    drop(raw_guard);
    Ok(code)
}

fn resolve_wait_worker(cli_value: Option<f64>) -> f64 {
    let raw = cli_value.or_else(|| {
        std::env::var("PIGEON_WAIT_WORKER")
            .ok()
            .and_then(|raw| raw.trim().parse().ok())
    });
    raw.unwrap_or(DEFAULT_WAIT_WORKER_SECS).max(0.0)
}

/// Fresh heartbeats whose route is compatible with the request.
pub fn discover_live_workers(
    layout: &PathLayout,
    route: Option<&str>,
    stale_after: f64,
) -> Vec<WorkerHeartbeat> {
    let now = now_epoch();
    let Ok(entries) = std::fs::read_dir(layout.workers_dir()) else {
        return Vec::new();
    };
    let mut names: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .collect();
    names.sort();

    let mut live = Vec::new();
    for path in names {
        let Ok(body) = std::fs::read(&path) else {
            continue;
        };
        let Ok(heartbeat) = serde_json::from_slice::<WorkerHeartbeat>(&body) else {
            continue;
        };
        if now - heartbeat.updated_at > stale_after {
            continue;
        }
        // The precheck is permissive on purpose: an unrouted side matches
        // anything, the worker applies its own stricter filter at claim
        // time.
        let compatible = match (heartbeat.route.as_deref(), route) {
            (Some(w), Some(r)) => w == r,
            _ => true,
        };
        if compatible {
            live.push(heartbeat);
        }
    }
    live
}

async fn wait_for_worker(
    settings: &Settings,
    route: Option<&str>,
    timeout: f64,
) -> Vec<WorkerHeartbeat> {
    let deadline = Instant::now() + Duration::from_secs_f64(timeout.max(0.0));
    loop {
        let workers = discover_live_workers(&settings.layout, route, settings.heartbeat_stale);
        if !workers.is_empty() {
            return workers;
        }
        if Instant::now() >= deadline {
            return Vec::new();
        }
        tokio::time::sleep(PRECHECK_POLL).await;
    }
}

fn publish_session(
    settings: &Settings,
    normalized: &argv::NormalizedCommand,
    cwd: &std::path::Path,
    route: Option<String>,
) -> Result<SessionPaths, PigeonError> {
    let env_overrides: BTreeMap<String, String> = TERMINAL_ENV_KEYS
        .iter()
        .filter_map(|key| std::env::var(key).ok().map(|value| (key.to_string(), value)))
        .collect();
    // Keep color behavior aligned with this terminal: a switch the caller
    // did not set is explicitly cleared on the worker side.
    let unset_env: Vec<String> = COLOR_SWITCH_KEYS
        .iter()
        .filter(|key| !env_overrides.contains_key(**key))
        .map(|key| key.to_string())
        .collect();

    let terminal = if std::io::stdin().is_terminal() {
        crossterm::terminal::size()
            .map(|(cols, rows)| TerminalSize { cols, rows })
            .unwrap_or_default()
    } else {
        TerminalSize::default()
    };

    let template = SessionRequest {
        session_id: String::new(),
        cwd: cwd.to_path_buf(),
        argv: normalized.argv.clone(),
        use_shell: normalized.use_shell,
        env_overrides,
        unset_env,
        route,
        terminal,
        created_at: 0.0,
        client: ClientInfo {
            host: host_name(),
            pid: std::process::id(),
            user: settings.user.clone(),
        },
    };
    for _ in 0..SESSION_ID_RETRIES {
        let mut request = template.clone();
        request.session_id = new_session_id();
        request.created_at = now_epoch();
        match session::create(&settings.layout, &request) {
            Ok(paths) => {
                debug!(session = request.session_id, "session created");
                return Ok(paths);
            }
            Err(PigeonError::SessionExists { session_id }) => {
                warn!(session = session_id, "session id collision; retrying");
                continue;
            }
            Err(err) => return Err(err),
        }
    }
    Err(PigeonError::io(
        "creating session",
        std::io::Error::other("session id retries exhausted"),
    ))
}

/// Installs SIGINT/SIGTERM/SIGQUIT/SIGWINCH handlers that append control
/// records instead of killing the client.
fn spawn_signal_forwarder(settings: &Settings, paths: &SessionPaths, start: Instant) {
    let control = AppendLog::new(paths.control(), settings.fsync);
    tokio::spawn(async move {
        let Ok(mut sigint) = signal(SignalKind::interrupt()) else {
            return;
        };
        let Ok(mut sigterm) = signal(SignalKind::terminate()) else {
            return;
        };
        let Ok(mut sigquit) = signal(SignalKind::quit()) else {
            return;
        };
        let Ok(mut sigwinch) = signal(SignalKind::window_change()) else {
            return;
        };
        loop {
            let action = tokio::select! {
                _ = sigint.recv() => ControlAction::Signal { signal: SignalName::Int },
                _ = sigterm.recv() => ControlAction::Signal { signal: SignalName::Term },
                _ = sigquit.recv() => ControlAction::Signal { signal: SignalName::Quit },
                _ = sigwinch.recv() => {
                    match crossterm::terminal::size() {
                        Ok((cols, rows)) => ControlAction::Resize { cols, rows },
                        Err(_) => continue,
                    }
                }
            };
            let record = ControlRecord {
                t: start.elapsed().as_secs_f64(),
                action,
            };
            if let Err(err) = control.append(&record) {
                warn!(error = %err, "control append failed");
            }
        }
    });
}

/// Pumps local stdin into `stdin.jsonl` from a plain OS thread so a
/// blocked `read` cannot stall runtime shutdown.
fn spawn_stdin_pump(settings: &Settings, paths: &SessionPaths, start: Instant) {
    let stdin_log = AppendLog::new(paths.stdin(), settings.fsync);
    std::thread::spawn(move || {
        let mut stdin = std::io::stdin().lock();
        let mut buf = [0u8; STDIN_CHUNK_BYTES];
        loop {
            match stdin.read(&mut buf) {
                Ok(0) => {
                    let record = StdinRecord::eof(start.elapsed().as_secs_f64());
                    if let Err(err) = stdin_log.append(&record) {
                        warn!(error = %err, "stdin eof append failed");
                    }
                    break;
                }
                Ok(n) => {
                    let record = StdinRecord::data(start.elapsed().as_secs_f64(), &buf[..n]);
                    if let Err(err) = stdin_log.append(&record) {
                        warn!(error = %err, "stdin append failed");
                        break;
                    }
                }
                Err(ref err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
    });
}

/// Tails the stream and status until the session reaches a terminal
/// state, then drains trailing output and returns the mirrored exit code.
///
/// `--wait-worker` bounds only the precheck; once the session is
/// published the client waits as long as the command takes, however long
/// a worker needs to pick it up.
async fn mirror_session(paths: &SessionPaths, verbose: bool) -> Result<i32, PigeonError> {
    let stream_path = paths.stream();
    let mut offset = 0u64;
    let mut was_running = false;

    loop {
        offset = render_stream(&stream_path, offset)?;

        match session::read_status(paths)? {
            // Still queued (or merely claimed); keep polling.
            None => {}
            Some(SessionStatus::Running { .. }) => {
                if verbose && !was_running {
                    eprintln!("[pigeon] session={} state=running", paths.session_id());
                }
                was_running = true;
            }
            Some(terminal) => {
                offset = drain_stream(&stream_path, offset).await?;
                if verbose {
                    eprintln!(
                        "[pigeon] session={} exit={}",
                        paths.session_id(),
                        terminal.exit_code()
                    );
                }
                return Ok(terminal.exit_code());
            }
        }

        tokio::time::sleep(TAIL_POLL).await;
    }
}

/// Decodes new stream records onto local stdout/stderr without extra
/// buffering.
fn render_stream(stream_path: &std::path::Path, offset: u64) -> Result<u64, PigeonError> {
    let (new_offset, records) = tail_records::<StreamRecord>(stream_path, offset)
        .map_err(|e| PigeonError::io("tailing stream", e))?;
    for record in &records {
        let Some(bytes) = record.decode() else {
            warn!("undecodable stream record");
            continue;
        };
        let result = if record.fd == 2 {
            let mut err = std::io::stderr().lock();
            err.write_all(&bytes).and_then(|()| err.flush())
        } else {
            let mut out = std::io::stdout().lock();
            out.write_all(&bytes).and_then(|()| out.flush())
        };
        if let Err(err) = result {
            // A closed local pipe is not a remote failure; stop rendering
            // but keep mirroring the exit code.
            debug!(error = %err, "local output closed");
            break;
        }
    }
    Ok(new_offset)
}

/// After the terminal status: keep tailing until the stream length is
/// stable for two consecutive polls, so every byte the worker flushed
/// before the status write reaches the local terminal.
async fn drain_stream(stream_path: &std::path::Path, offset: u64) -> Result<u64, PigeonError> {
    // The worker stops appending before it writes a terminal status, so
    // stability arrives within a poll or two; the cap only bounds a
    // pathological filesystem.
    const MAX_DRAIN_POLLS: u32 = 40;

    let mut offset = offset;
    let mut stable_polls = 0u32;
    let mut last_len = log_len(stream_path).map_err(|e| PigeonError::io("stream length", e))?;
    for _ in 0..MAX_DRAIN_POLLS {
        if stable_polls >= 2 {
            break;
        }
        tokio::time::sleep(TAIL_POLL).await;
        offset = render_stream(stream_path, offset)?;
        let len = log_len(stream_path).map_err(|e| PigeonError::io("stream length", e))?;
        if len == last_len {
            stable_polls += 1;
        } else {
            stable_polls = 0;
            last_len = len;
        }
    }
    Ok(offset)
}

/// RAII wrapper for the local terminal's raw mode; restores cooked mode
/// on every exit path.
struct RawModeGuard {
    active: bool,
}

impl RawModeGuard {
    fn enter() -> Self {
        if !std::io::stdin().is_terminal() {
            return Self { active: false };
        }
        match crossterm::terminal::enable_raw_mode() {
            Ok(()) => Self { active: true },
            Err(err) => {
                warn!(error = %err, "raw mode unavailable");
                Self { active: false }
            }
        }
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if self.active {
            let _ = crossterm::terminal::disable_raw_mode();
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::session::write_json_atomic;

    fn heartbeat(route: Option<&str>, updated_at: f64) -> WorkerHeartbeat {
        WorkerHeartbeat {
            host: "cpu01".into(),
            pid: 7,
            route: route.map(String::from),
            started_at: updated_at - 100.0,
            updated_at,
            max_jobs: 4,
            active: 0,
        }
    }

    #[test]
    fn stale_heartbeats_are_ignored() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let layout = PathLayout::new(tmp.path(), "ns");
        layout.ensure_dirs().expect("dirs");

        let now = now_epoch();
        write_json_atomic(
            &layout.worker_heartbeat_path("fresh", 1),
            &heartbeat(None, now),
        )
        .expect("write");
        write_json_atomic(
            &layout.worker_heartbeat_path("stale", 2),
            &heartbeat(None, now - 60.0),
        )
        .expect("write");

        let live = discover_live_workers(&layout, None, 5.0);
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].host, "cpu01");
        assert_eq!(live[0].pid, 7);
    }

    #[test]
    fn precheck_route_matching_is_permissive_on_either_side() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let layout = PathLayout::new(tmp.path(), "ns");
        layout.ensure_dirs().expect("dirs");

        let now = now_epoch();
        write_json_atomic(
            &layout.worker_heartbeat_path("routed", 1),
            &heartbeat(Some("gpu"), now),
        )
        .expect("write");

        assert_eq!(discover_live_workers(&layout, Some("gpu"), 5.0).len(), 1);
        // An untagged request may still land on a routed worker.
        assert_eq!(discover_live_workers(&layout, None, 5.0).len(), 1);
        assert!(discover_live_workers(&layout, Some("cpu"), 5.0).is_empty());
    }

    #[test]
    fn malformed_heartbeats_are_skipped() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let layout = PathLayout::new(tmp.path(), "ns");
        layout.ensure_dirs().expect("dirs");
        std::fs::write(layout.workers_dir().join("junk.json"), b"nope").expect("write");

        assert!(discover_live_workers(&layout, None, 5.0).is_empty());
    }

    #[test]
    fn wait_worker_resolution_prefers_cli_then_env() {
        assert_eq!(resolve_wait_worker(Some(0.5)), 0.5);
        assert_eq!(resolve_wait_worker(Some(-1.0)), 0.0);
        // No CLI value and no env: the default.
        if std::env::var("PIGEON_WAIT_WORKER").is_err() {
            assert_eq!(resolve_wait_worker(None), DEFAULT_WAIT_WORKER_SECS);
        }
    }
}
