//! The long-lived job dispatcher.
//!
//! A worker scans the shared `sessions/` directory, claims queued work
//! whose route it serves, and runs each claimed session under a PTY in
//! the session's own cwd. Claims are arbitrated purely by the exclusive
//! create of `worker.claim`; scanning is best-effort and racing workers
//! are harmless. Same-cwd sessions serialize on the advisory cwd lock.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::append_log::AppendLog;
use crate::append_log::tail_records;
use crate::config;
use crate::config::Settings;
use crate::error::PigeonError;
use crate::lock;
use crate::paths::SessionPaths;
use crate::protocol::ClaimRecord;
use crate::protocol::ControlAction;
use crate::protocol::ControlRecord;
use crate::protocol::SessionRequest;
use crate::protocol::SessionStatus;
use crate::protocol::StdinRecord;
use crate::protocol::WorkerHeartbeat;
use crate::protocol::WorkerRef;
use crate::protocol::host_name;
use crate::protocol::now_epoch;
use crate::protocol::route_accepts;
use crate::pty;
use crate::pty::PtyCommand;
use crate::pty::PtyInput;
use crate::session;
use crate::session::SessionState;

const CONFIG_RELOAD_INTERVAL: Duration = Duration::from_secs(1);
const HEARTBEAT_MIN_INTERVAL: f64 = 1.0;
/// Heartbeats must stay comfortably inside the client's staleness window
/// (3–10 s) even when the scan poll is slow.
const HEARTBEAT_MAX_INTERVAL: f64 = 2.0;
/// How long in-flight jobs may keep running after a shutdown signal
/// before their process groups are force-killed.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);
const SHUTDOWN_KILL_WAIT: Duration = Duration::from_secs(2);

/// Startup knobs. Values given on the command line are pinned: the 1 Hz
/// config reload never changes them.
#[derive(Default)]
pub struct WorkerOptions {
    pub config_path: Option<PathBuf>,
    pub route: Option<String>,
    pub max_jobs: Option<usize>,
    pub poll_interval: Option<f64>,
    pub debug: Option<bool>,
    /// Applied when the config file flips `worker.debug` at runtime;
    /// wired to the subscriber's filter reload handle by the binary.
    pub set_debug: Option<Arc<dyn Fn(bool) + Send + Sync>>,
}

/// Runs the worker loop until SIGTERM/SIGINT.
pub async fn run(opts: WorkerOptions) -> Result<(), PigeonError> {
    let config_file = config::config_path(opts.config_path.as_deref());
    let mut settings = config::load_file(&config_file)?.resolve()?;
    settings
        .layout
        .ensure_dirs()
        .map_err(|e| PigeonError::io("creating cache directories", e))?;
    // Fail fast if the shared filesystem cannot hold advisory locks; the
    // per-cwd serialization guarantee depends on it.
    lock::probe_support(&settings.layout.locks_dir())?;

    let host = host_name();
    let pid = std::process::id();
    let heartbeat_path = settings.layout.worker_heartbeat_path(&host, pid);
    let started_at = now_epoch();

    let mut route = crate::protocol::normalize_route(opts.route.as_deref())
        .or_else(|| settings.worker_route.clone());
    let mut poll_interval = opts.poll_interval.unwrap_or(settings.worker_poll_interval);
    let mut debug_enabled = opts.debug.unwrap_or(settings.worker_debug);
    let max_jobs = opts.max_jobs.unwrap_or(settings.worker_max_jobs).max(1);

    let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
        .map_err(|e| PigeonError::io("installing SIGINT handler", e))?;
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .map_err(|e| PigeonError::io("installing SIGTERM handler", e))?;

    let mut jobs: JoinSet<String> = JoinSet::new();
    let controls: Arc<StdMutex<HashMap<String, mpsc::Sender<PtyInput>>>> =
        Arc::new(StdMutex::new(HashMap::new()));

    let mut next_heartbeat = 0.0_f64;
    let mut next_reload = now_epoch() + CONFIG_RELOAD_INTERVAL.as_secs_f64();

    info!(
        host,
        pid,
        namespace = settings.layout.namespace(),
        cache = %settings.layout.cache_root().display(),
        route = route.as_deref().unwrap_or("-"),
        max_jobs,
        "worker started"
    );

    loop {
        let now = now_epoch();

        if now >= next_reload {
            match config::load_file(&config_file).and_then(|cfg| cfg.resolve()) {
                Ok(fresh) => {
                    let new_route = crate::protocol::normalize_route(opts.route.as_deref())
                        .or_else(|| fresh.worker_route.clone());
                    let new_poll = opts.poll_interval.unwrap_or(fresh.worker_poll_interval);
                    let new_debug = opts.debug.unwrap_or(fresh.worker_debug);
                    if new_route != route || new_poll != poll_interval || new_debug != debug_enabled
                    {
                        info!(
                            route = new_route.as_deref().unwrap_or("-"),
                            poll_interval = new_poll,
                            debug = new_debug,
                            "worker config reloaded"
                        );
                        if new_debug != debug_enabled
                            && let Some(set_debug) = &opts.set_debug
                        {
                            set_debug(new_debug);
                        }
                        route = new_route;
                        poll_interval = new_poll;
                        debug_enabled = new_debug;
                        next_heartbeat = 0.0;
                    }
                    settings = fresh;
                }
                Err(err) => {
                    warn!(error = %err, "config reload failed; keeping previous settings");
                }
            }
            next_reload = now + CONFIG_RELOAD_INTERVAL.as_secs_f64();
        }

        while let Some(finished) = jobs.try_join_next() {
            match finished {
                Ok(session_id) => {
                    if let Ok(mut map) = controls.lock() {
                        map.remove(&session_id);
                    }
                    debug!(session = session_id, "job finished");
                }
                Err(err) => error!(error = %err, "session job panicked"),
            }
            next_heartbeat = 0.0;
        }

        if now >= next_heartbeat {
            let heartbeat = WorkerHeartbeat {
                host: host.clone(),
                pid,
                route: route.clone(),
                started_at,
                updated_at: now,
                max_jobs,
                active: jobs.len(),
            };
            if let Err(err) = session::write_json_atomic(&heartbeat_path, &heartbeat) {
                warn!(error = %err, "failed to publish heartbeat");
            }
            next_heartbeat = now
                + HEARTBEAT_MIN_INTERVAL
                    .max(poll_interval)
                    .min(HEARTBEAT_MAX_INTERVAL);
        }

        scan_once(
            &settings,
            route.as_deref(),
            max_jobs,
            &host,
            pid,
            &mut jobs,
            &controls,
        );

        let stopped = tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs_f64(poll_interval.max(0.01))) => false,
            _ = sigint.recv() => true,
            _ = sigterm.recv() => true,
        };
        if stopped {
            info!(active = jobs.len(), "shutdown requested");
            break;
        }
    }

    shutdown(&mut jobs, &controls).await;
    if let Err(err) = std::fs::remove_file(&heartbeat_path) {
        if err.kind() != std::io::ErrorKind::NotFound {
            warn!(error = %err, "failed to remove heartbeat");
        }
    }
    info!("worker stopped");
    Ok(())
}

/// One discovery pass: claim and dispatch queued sessions, in
/// lexicographic order, until the pool is full.
fn scan_once(
    settings: &Settings,
    route: Option<&str>,
    max_jobs: usize,
    host: &str,
    pid: u32,
    jobs: &mut JoinSet<String>,
    controls: &Arc<StdMutex<HashMap<String, mpsc::Sender<PtyInput>>>>,
) {
    if jobs.len() >= max_jobs {
        return;
    }
    let sessions_dir = settings.layout.sessions_dir();
    let entries = match std::fs::read_dir(&sessions_dir) {
        Ok(entries) => entries,
        Err(err) => {
            warn!(error = %err, dir = %sessions_dir.display(), "cannot scan sessions");
            return;
        }
    };
    let mut session_ids: Vec<String> = entries
        .filter_map(|entry| {
            let entry = entry.ok()?;
            entry.file_type().ok()?.is_dir().then_some(())?;
            entry.file_name().into_string().ok()
        })
        .collect();
    session_ids.sort();

    for session_id in session_ids {
        if jobs.len() >= max_jobs {
            break;
        }
        let paths = settings.layout.session(&session_id);
        match session::observe(&paths) {
            Ok(SessionState::Queued) => {}
            Ok(_) => continue,
            Err(err) => {
                warn!(session = session_id, error = %err, "skipping unreadable session");
                continue;
            }
        }
        if !paths.request().exists() {
            continue;
        }

        let request = match session::read_request(&paths) {
            Ok(request) => request,
            Err(err) => {
                warn!(session = session_id, error = %err, "malformed request");
                let status = SessionStatus::Error {
                    message: err.to_string(),
                    ended_at: now_epoch(),
                };
                if let Err(err) = session::write_status(&paths, &status) {
                    debug!(session = session_id, error = %err, "error status not written");
                }
                continue;
            }
        };

        if !route_accepts(route, request.route.as_deref(), settings.accept_unrouted) {
            continue;
        }

        let claim = ClaimRecord {
            host: host.to_string(),
            pid,
            epoch: now_epoch(),
        };
        match session::try_claim(&paths, &claim) {
            Ok(true) => debug!(session = session_id, "claim won"),
            Ok(false) => {
                debug!(session = session_id, "claim lost");
                continue;
            }
            Err(err) => {
                warn!(session = session_id, error = %err, "claim failed");
                continue;
            }
        }

        let (input_tx, input_rx) = mpsc::channel::<PtyInput>(128);
        if let Ok(mut map) = controls.lock() {
            map.insert(session_id.clone(), input_tx.clone());
        }
        let worker_ref = WorkerRef {
            host: host.to_string(),
            pid,
        };
        let job_settings = settings.clone();
        jobs.spawn(async move {
            let session_id = request.session_id.clone();
            run_session(job_settings, paths, request, worker_ref, input_tx, input_rx).await;
            session_id
        });
    }
}

/// Runs one claimed session to its terminal status. Never panics; every
/// failure path lands in `status.json`.
async fn run_session(
    settings: Settings,
    paths: SessionPaths,
    request: SessionRequest,
    worker: WorkerRef,
    input_tx: mpsc::Sender<PtyInput>,
    input_rx: mpsc::Receiver<PtyInput>,
) {
    let session_id = request.session_id.clone();
    debug!(
        session = session_id,
        cwd = %request.cwd.display(),
        argv = ?request.argv,
        "job start"
    );

    let lock_path = settings.layout.cwd_lock_path(&request.cwd);
    debug!(session = session_id, lock = %lock_path.display(), "waiting for cwd lock");
    let guard = {
        let lock_path = lock_path.clone();
        tokio::task::spawn_blocking(move || lock::acquire_blocking(&lock_path)).await
    };
    let guard = match guard {
        Ok(Ok(guard)) => guard,
        Ok(Err(err)) => {
            fail_session(&paths, &session_id, &err.to_string());
            return;
        }
        Err(err) => {
            fail_session(&paths, &session_id, &format!("lock task failed: {err}"));
            return;
        }
    };
    debug!(session = session_id, lock = %lock_path.display(), "cwd lock acquired");

    let started_at = now_epoch();
    let running = SessionStatus::Running {
        worker: worker.clone(),
        started_at,
    };
    if let Err(err) = session::write_status(&paths, &running) {
        fail_session(&paths, &session_id, &err.to_string());
        return;
    }

    // Replay tailers: stdin and control records flow into the PTY input
    // channel, each log consumed strictly in order from its own cursor.
    let (done_tx, done_rx) = watch::channel(false);
    let tailer = tokio::spawn(tail_session_inputs(
        paths.clone(),
        input_tx,
        settings.worker_poll_interval,
        done_rx,
    ));

    let command = PtyCommand {
        argv: build_argv(&request, &settings),
        cwd: request.cwd.clone(),
        env: build_env(&request, &settings),
        size: request.terminal,
    };
    let stream = AppendLog::new(paths.stream(), settings.fsync);
    let outcome = pty::run(command, input_rx, stream).await;
    let _ = done_tx.send(true);
    let _ = tailer.await;

    let ended_at = now_epoch();
    let status = match outcome {
        Ok(pty::PtyOutcome::Exited(code)) => SessionStatus::Exited {
            code,
            started_at,
            ended_at,
        },
        Ok(pty::PtyOutcome::Signaled(signal)) => SessionStatus::Signaled {
            signal,
            started_at,
            ended_at,
        },
        Err(err) => SessionStatus::Error {
            message: err.to_string(),
            ended_at,
        },
    };
    match &status {
        SessionStatus::Exited { code, .. } => {
            debug!(session = session_id, code, "job end");
        }
        SessionStatus::Signaled { signal, .. } => {
            debug!(session = session_id, signal, "job end (signaled)");
        }
        other => {
            warn!(session = session_id, status = ?other, "job end (error)");
        }
    }
    if let Err(err) = session::write_status(&paths, &status) {
        error!(session = session_id, error = %err, "terminal status not written");
    }
    drop(guard);
}

/// Feeds stdin and control records into the PTY until told to stop.
async fn tail_session_inputs(
    paths: SessionPaths,
    input_tx: mpsc::Sender<PtyInput>,
    poll_interval: f64,
    mut done: watch::Receiver<bool>,
) {
    let stdin_path = paths.stdin();
    let control_path = paths.control();
    let mut stdin_offset = 0u64;
    let mut control_offset = 0u64;

    loop {
        match tail_records::<StdinRecord>(&stdin_path, stdin_offset) {
            Ok((offset, records)) => {
                stdin_offset = offset;
                for record in records {
                    let input = if record.is_eof() {
                        PtyInput::StdinEof
                    } else {
                        match record.decode() {
                            Some(bytes) => {
                                debug!(
                                    session = paths.session_id(),
                                    preview = bytes_preview(&bytes),
                                    "stdin replay"
                                );
                                PtyInput::Stdin(bytes)
                            }
                            None => {
                                warn!(session = paths.session_id(), "undecodable stdin record");
                                continue;
                            }
                        }
                    };
                    if input_tx.send(input).await.is_err() {
                        return;
                    }
                }
            }
            Err(err) => warn!(error = %err, "stdin tail failed"),
        }

        match tail_records::<ControlRecord>(&control_path, control_offset) {
            Ok((offset, records)) => {
                control_offset = offset;
                for record in records {
                    let input = match record.action {
                        ControlAction::Signal { signal } => {
                            debug!(
                                session = paths.session_id(),
                                signal = signal.as_str(),
                                "signal forward"
                            );
                            PtyInput::Signal(signal.signo())
                        }
                        ControlAction::Resize { cols, rows } => {
                            PtyInput::Resize(crate::protocol::TerminalSize { cols, rows })
                        }
                    };
                    if input_tx.send(input).await.is_err() {
                        return;
                    }
                }
            }
            Err(err) => warn!(error = %err, "control tail failed"),
        }

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs_f64(poll_interval.max(0.01))) => {}
            changed = done.changed() => {
                if changed.is_err() || *done.borrow() {
                    return;
                }
            }
        }
    }
}

fn fail_session(paths: &SessionPaths, session_id: &str, message: &str) {
    warn!(session = session_id, message, "session failed");
    let status = SessionStatus::Error {
        message: message.to_string(),
        ended_at: now_epoch(),
    };
    if let Err(err) = session::write_status(paths, &status) {
        error!(session = session_id, error = %err, "error status not written");
    }
}

/// Applies the `use_shell` wrapping: the published argv becomes one
/// `bash -lc` invocation, with an optional `.bashrc` prelude.
fn build_argv(request: &SessionRequest, settings: &Settings) -> Vec<String> {
    if !request.use_shell {
        return request.argv.clone();
    }
    let joined = request.argv.join(" ");
    let snippet = if settings.source_bashrc {
        format!(
            "if [ -r ~/.bashrc ]; then . ~/.bashrc >/dev/null 2>&1 || true; fi\n{joined}"
        )
    } else {
        joined
    };
    vec!["bash".to_string(), "-lc".to_string(), snippet]
}

/// Child environment: the worker's own env is the base, minus the
/// request's `unset_env` keys; request overrides apply on top, and
/// configured `remote_env` wins over both.
fn build_env(request: &SessionRequest, settings: &Settings) -> BTreeMap<String, String> {
    let mut env: BTreeMap<String, String> = std::env::vars().collect();
    for key in &request.unset_env {
        env.remove(key);
    }
    for (key, value) in &request.env_overrides {
        env.insert(key.clone(), value.clone());
    }
    for (key, value) in &settings.remote_env {
        env.insert(key.clone(), value.clone());
    }
    env
}

/// Waits out in-flight jobs, escalating from SIGTERM to SIGKILL after the
/// grace period.
async fn shutdown(
    jobs: &mut JoinSet<String>,
    controls: &Arc<StdMutex<HashMap<String, mpsc::Sender<PtyInput>>>>,
) {
    if jobs.is_empty() {
        return;
    }
    let drain = async {
        while jobs.join_next().await.is_some() {}
    };
    if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_ok() {
        return;
    }

    warn!(active = jobs.len(), "grace period expired; terminating jobs");
    broadcast_signal(controls, libc::SIGTERM).await;
    let drain = async {
        while jobs.join_next().await.is_some() {}
    };
    if tokio::time::timeout(SHUTDOWN_KILL_WAIT, drain).await.is_ok() {
        return;
    }

    broadcast_signal(controls, libc::SIGKILL).await;
    let drain = async {
        while jobs.join_next().await.is_some() {}
    };
    if tokio::time::timeout(SHUTDOWN_KILL_WAIT, drain).await.is_err() {
        warn!("aborting unresponsive session jobs");
        jobs.abort_all();
    }
}

async fn broadcast_signal(
    controls: &Arc<StdMutex<HashMap<String, mpsc::Sender<PtyInput>>>>,
    signo: i32,
) {
    let senders: Vec<(String, mpsc::Sender<PtyInput>)> = controls
        .lock()
        .map(|map| {
            map.iter()
                .map(|(sid, tx)| (sid.clone(), tx.clone()))
                .collect()
        })
        .unwrap_or_default();
    for (session_id, tx) in senders {
        debug!(session = session_id, signo, "shutdown signal to job");
        let _ = tx.send(PtyInput::Signal(signo)).await;
    }
}

fn bytes_preview(data: &[u8]) -> String {
    const LIMIT: usize = 96;
    let cut = &data[..data.len().min(LIMIT)];
    let hex: Vec<String> = cut.iter().map(|b| format!("{b:02x}")).collect();
    let text: String = cut
        .iter()
        .flat_map(|b| std::ascii::escape_default(*b))
        .map(char::from)
        .collect();
    let extra = if data.len() > LIMIT {
        format!(" ...(+{}b)", data.len() - LIMIT)
    } else {
        String::new()
    };
    format!("len={} hex=[{}] text='{text}'{extra}", data.len(), hex.join(" "))
}
