//! PTY execution engine.
//!
//! Runs one command under a pseudo-terminal and pumps its output into the
//! session stream log. The child sees a real TTY (line discipline, window
//! size, signals); the worker sees three ordered input flows — stdin
//! bytes, end-of-input, control actions — merged into a single channel by
//! the session tailers so replay order per log is preserved.
//!
//! Ordering guarantee: every byte the child wrote before exiting is
//! appended to the stream log before `run` returns, so the worker's
//! terminal status write always happens after the last output record.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::io::Read;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use std::time::Instant;

use portable_pty::CommandBuilder;
use portable_pty::PtySize;
use portable_pty::native_pty_system;
use tokio::sync::mpsc;
use tracing::debug;
use tracing::warn;

use crate::append_log::AppendLog;
use crate::error::PtyError;
use crate::protocol::StreamRecord;
use crate::protocol::TerminalSize;

/// Upper bound on the payload of one stream record.
pub const MAX_CHUNK_BYTES: usize = 64 * 1024;
/// How long to keep collecting trailing output after the child exited.
const DRAIN_GRACE: Duration = Duration::from_millis(500);
/// End-of-transmission, delivered for a stdin `eof` record. The master
/// stays open so late output is still collected; a canonical-mode reader
/// treats EOT as end-of-input.
const EOT: u8 = 0x04;

/// A fully resolved command: the worker has already applied the
/// `use_shell` wrapping and built the child environment.
#[derive(Debug, Clone)]
pub struct PtyCommand {
    pub argv: Vec<String>,
    pub cwd: PathBuf,
    pub env: BTreeMap<String, String>,
    pub size: TerminalSize,
}

/// Inputs replayed into the running child.
#[derive(Debug)]
pub enum PtyInput {
    Stdin(Vec<u8>),
    StdinEof,
    Signal(i32),
    Resize(TerminalSize),
}

/// How the child finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PtyOutcome {
    Exited(i32),
    Signaled(String),
}

/// Spawns `command` under a fresh PTY and runs it to completion.
///
/// Output is appended to `stream` as base64 records of at most
/// [`MAX_CHUNK_BYTES`] each, timestamped relative to spawn. Inputs arrive
/// on `input_rx`; the channel closing is not a termination signal (the
/// tailers shut down independently).
pub async fn run(
    command: PtyCommand,
    mut input_rx: mpsc::Receiver<PtyInput>,
    stream: AppendLog,
) -> Result<PtyOutcome, PtyError> {
    if command.argv.is_empty() {
        return Err(PtyError::Spawn("empty argv".to_string()));
    }

    let pty_system = native_pty_system();
    let pair = pty_system
        .openpty(PtySize {
            rows: command.size.rows.max(1),
            cols: command.size.cols.max(1),
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(|err| PtyError::Open(err.to_string()))?;

    let mut builder = CommandBuilder::new(&command.argv[0]);
    for arg in &command.argv[1..] {
        builder.arg(arg);
    }
    builder.cwd(&command.cwd);
    builder.env_clear();
    for (key, value) in &command.env {
        builder.env(key, value);
    }

    let child = pair
        .slave
        .spawn_command(builder)
        .map_err(|err| PtyError::Spawn(err.to_string()))?;
    // Drop our copy of the slave so the master reads EOF once the child
    // (and its descendants) release the terminal.
    drop(pair.slave);

    let child_pid = child.process_id();
    let mut killer = child.clone_killer();
    let master = pair.master;
    let start = Instant::now();

    // Reader thread: master -> chunk channel. PTY reads must stay prompt,
    // so nothing else shares this thread.
    let mut reader = master
        .try_clone_reader()
        .map_err(|err| PtyError::Open(err.to_string()))?;
    let (chunk_tx, mut chunk_rx) = mpsc::channel::<Vec<u8>>(64);
    tokio::task::spawn_blocking(move || {
        let mut buf = vec![0u8; MAX_CHUNK_BYTES];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if chunk_tx.blocking_send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(ref err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(ref err) if err.kind() == ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(5));
                    continue;
                }
                // On Linux the master raises EIO once the slave side is
                // fully closed; treat it like EOF.
                Err(_) => break,
            }
        }
    });

    // Writer task: stdin bytes -> master, decoupled from the main loop so
    // a child that stopped reading cannot stall output pumping.
    let writer = master
        .take_writer()
        .map_err(|err| PtyError::Open(err.to_string()))?;
    let writer = Arc::new(StdMutex::new(writer));
    let (writer_tx, mut writer_rx) = mpsc::channel::<Vec<u8>>(128);
    tokio::spawn({
        let writer = Arc::clone(&writer);
        async move {
            while let Some(bytes) = writer_rx.recv().await {
                let writer = Arc::clone(&writer);
                let result = tokio::task::spawn_blocking(move || {
                    let mut guard = writer.lock().map_err(|_| ())?;
                    guard.write_all(&bytes).and_then(|()| guard.flush()).map_err(|_| ())
                })
                .await;
                if !matches!(result, Ok(Ok(()))) {
                    break;
                }
            }
        }
    });

    let mut wait_handle = {
        let mut child = child;
        tokio::task::spawn_blocking(move || child.wait())
    };

    let mut sink = stream
        .open_writer()
        .map_err(|source| PtyError::Stream { source })?;
    let mut append_chunk = move |bytes: &[u8], t: f64| -> Result<(), PtyError> {
        for piece in bytes.chunks(MAX_CHUNK_BYTES) {
            sink.append(&StreamRecord::new(t, 1, piece))
                .map_err(|source| PtyError::Stream { source })?;
        }
        Ok(())
    };

    let mut outcome: Option<PtyOutcome> = None;
    let mut chunks_closed = false;
    let mut inputs_closed = false;
    let mut stdin_eof = false;

    while outcome.is_none() || !chunks_closed {
        tokio::select! {
            chunk = chunk_rx.recv(), if !chunks_closed => {
                match chunk {
                    Some(bytes) => {
                        if let Err(err) = append_chunk(&bytes, start.elapsed().as_secs_f64()) {
                            let _ = killer.kill();
                            return Err(err);
                        }
                    }
                    None => chunks_closed = true,
                }
            }
            input = input_rx.recv(), if !inputs_closed => {
                match input {
                    Some(PtyInput::Stdin(bytes)) => {
                        if stdin_eof {
                            warn!(len = bytes.len(), "dropping stdin bytes after eof");
                        } else {
                            let _ = writer_tx.send(bytes).await;
                        }
                    }
                    Some(PtyInput::StdinEof) => {
                        if !stdin_eof {
                            stdin_eof = true;
                            let _ = writer_tx.send(vec![EOT]).await;
                        }
                    }
                    Some(PtyInput::Signal(signo)) => {
                        deliver_signal(child_pid, &mut *killer, signo);
                    }
                    Some(PtyInput::Resize(size)) => {
                        let _ = master.resize(PtySize {
                            rows: size.rows.max(1),
                            cols: size.cols.max(1),
                            pixel_width: 0,
                            pixel_height: 0,
                        });
                        debug!(cols = size.cols, rows = size.rows, "pty resized");
                    }
                    None => inputs_closed = true,
                }
            }
            status = &mut wait_handle, if outcome.is_none() => {
                outcome = Some(match status {
                    Ok(Ok(exit)) => map_exit_status(&exit),
                    Ok(Err(err)) => {
                        warn!(error = %err, "pty wait failed");
                        PtyOutcome::Exited(1)
                    }
                    Err(err) => {
                        warn!(error = %err, "pty wait task failed");
                        PtyOutcome::Exited(1)
                    }
                });
                if !chunks_closed {
                    // The reader will hit EOF/EIO shortly; bound the wait
                    // for trailing bytes.
                    let deadline = tokio::time::Instant::now() + DRAIN_GRACE;
                    loop {
                        match tokio::time::timeout_at(deadline, chunk_rx.recv()).await {
                            Ok(Some(bytes)) => {
                                append_chunk(&bytes, start.elapsed().as_secs_f64())?;
                            }
                            Ok(None) | Err(_) => break,
                        }
                    }
                    chunks_closed = true;
                }
            }
        }
    }

    // Keep the master alive until all reading finished, then let it close.
    drop(master);

    Ok(outcome.unwrap_or(PtyOutcome::Exited(1)))
}

fn map_exit_status(status: &portable_pty::ExitStatus) -> PtyOutcome {
    if let Some(signal) = status.signal() {
        PtyOutcome::Signaled(signal.to_string())
    } else {
        PtyOutcome::Exited(status.exit_code() as i32)
    }
}

/// Delivers `signo` to the child's process group; the PTY child is its
/// session leader, so the group id equals its pid.
fn deliver_signal(child_pid: Option<u32>, killer: &mut dyn portable_pty::ChildKiller, signo: i32) {
    #[cfg(unix)]
    if let Some(pid) = child_pid {
        // SAFETY: killpg with a valid pid and signal number; failure is
        // reported via errno and ignored (the child may already be gone).
        let rc = unsafe { libc::killpg(pid as libc::pid_t, signo) };
        if rc == 0 {
            debug!(pid, signo, "signal forwarded to process group");
            return;
        }
        warn!(pid, signo, "killpg failed; falling back to child killer");
    }
    let _ = child_pid;
    let _ = killer.kill();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::append_log::FsyncPolicy;
    use crate::append_log::tail_records;

    fn sh(script: &str) -> Vec<String> {
        vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()]
    }

    fn command(argv: Vec<String>, cwd: &std::path::Path) -> PtyCommand {
        PtyCommand {
            argv,
            cwd: cwd.to_path_buf(),
            env: std::env::vars().collect(),
            size: TerminalSize::default(),
        }
    }

    fn collected_output(stream_path: &std::path::Path) -> Vec<u8> {
        let (_, records) = tail_records::<StreamRecord>(stream_path, 0).expect("tail stream");
        let mut out = Vec::new();
        for record in records {
            out.extend(record.decode().expect("decode chunk"));
        }
        out
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn echo_round_trips_through_the_stream_log() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let stream_path = tmp.path().join("stream.jsonl");
        let (_input_tx, input_rx) = mpsc::channel(8);

        let outcome = run(
            command(sh("printf 'hi\\n'"), tmp.path()),
            input_rx,
            AppendLog::new(&stream_path, FsyncPolicy::Never),
        )
        .await
        .expect("run");

        assert_eq!(outcome, PtyOutcome::Exited(0));
        let out = collected_output(&stream_path);
        // PTY line discipline rewrites \n to \r\n.
        assert_eq!(String::from_utf8_lossy(&out), "hi\r\n");
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn exit_codes_are_reported_verbatim() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let stream_path = tmp.path().join("stream.jsonl");
        let (_input_tx, input_rx) = mpsc::channel(8);

        let outcome = run(
            command(sh("exit 7"), tmp.path()),
            input_rx,
            AppendLog::new(&stream_path, FsyncPolicy::Never),
        )
        .await
        .expect("run");
        assert_eq!(outcome, PtyOutcome::Exited(7));
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stdin_bytes_reach_the_child() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let stream_path = tmp.path().join("stream.jsonl");
        let (input_tx, input_rx) = mpsc::channel(8);

        let feeder = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            let _ = input_tx.send(PtyInput::Stdin(b"abc\n".to_vec())).await;
        });

        let outcome = run(
            command(sh("read x; echo got $x"), tmp.path()),
            input_rx,
            AppendLog::new(&stream_path, FsyncPolicy::Never),
        )
        .await
        .expect("run");
        feeder.await.expect("feeder");

        assert_eq!(outcome, PtyOutcome::Exited(0));
        let out = String::from_utf8_lossy(&collected_output(&stream_path)).to_string();
        assert!(out.contains("got abc"), "output was {out:?}");
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn output_bursts_split_across_records_in_order() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let stream_path = tmp.path().join("stream.jsonl");
        let (_input_tx, input_rx) = mpsc::channel(8);

        // 200k 'x' bytes: larger than one chunk, so multiple records.
        let outcome = run(
            command(
                sh("head -c 200000 /dev/zero | tr '\\0' 'x'"),
                tmp.path(),
            ),
            input_rx,
            AppendLog::new(&stream_path, FsyncPolicy::Never),
        )
        .await
        .expect("run");
        assert_eq!(outcome, PtyOutcome::Exited(0));

        let (_, records) = tail_records::<StreamRecord>(&stream_path, 0).expect("tail");
        assert!(records.len() > 1, "expected multiple records");
        let out = collected_output(&stream_path);
        assert_eq!(out.len(), 200_000);
        assert!(out.iter().all(|b| *b == b'x'));
        // Timestamps never move backward.
        let mut last = 0.0_f64;
        for record in &records {
            assert!(record.t >= last);
            last = record.t;
        }
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn missing_executable_is_a_spawn_error_not_a_hang() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let stream_path = tmp.path().join("stream.jsonl");
        let (_input_tx, input_rx) = mpsc::channel(8);

        let result = run(
            command(
                vec!["/nonexistent/pigeon-test-binary".to_string()],
                tmp.path(),
            ),
            input_rx,
            AppendLog::new(&stream_path, FsyncPolicy::Never),
        )
        .await;

        match result {
            Err(PtyError::Spawn(_)) => {}
            Ok(PtyOutcome::Exited(code)) => assert_ne!(code, 0),
            other => panic!("unexpected result {other:?}"),
        }
    }
}
