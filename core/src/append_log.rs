//! Append-only newline-delimited JSON logs with non-blocking tail cursors.
//!
//! One writer, many readers. Appends are a single `write` of one complete
//! line; tails advance a byte offset only past complete lines, so a reader
//! racing the writer re-reads a partial trailing line on its next poll
//! instead of dropping it.

use std::fs::File;
use std::fs::OpenOptions;
use std::io;
use std::io::Read;
use std::io::Seek;
use std::io::SeekFrom;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::warn;

/// Whether each append is followed by `fdatasync`.
///
/// The default trades durability for latency; `PIGEON_APPEND_FSYNC=always`
/// forces a sync per record for caches on crash-prone mounts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FsyncPolicy {
    Always,
    #[default]
    Never,
}

impl FsyncPolicy {
    pub fn from_env() -> Self {
        match std::env::var("PIGEON_APPEND_FSYNC").as_deref() {
            Ok("always") => FsyncPolicy::Always,
            _ => FsyncPolicy::Never,
        }
    }
}

/// Writer handle for one JSONL file.
#[derive(Debug, Clone)]
pub struct AppendLog {
    path: PathBuf,
    fsync: FsyncPolicy,
}

impl AppendLog {
    pub fn new(path: impl Into<PathBuf>, fsync: FsyncPolicy) -> Self {
        Self {
            path: path.into(),
            fsync,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one record, opening the file for this write only. Suits the
    /// low-rate logs (stdin, control).
    pub fn append<T: Serialize>(&self, record: &T) -> io::Result<()> {
        let mut writer = self.open_writer()?;
        writer.append(record)
    }

    /// Opens a persistent writer for high-rate appends (the stream log).
    pub fn open_writer(&self) -> io::Result<AppendWriter> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        Ok(AppendWriter {
            file,
            fsync: self.fsync,
        })
    }
}

#[derive(Debug)]
pub struct AppendWriter {
    file: File,
    fsync: FsyncPolicy,
}

impl AppendWriter {
    pub fn append<T: Serialize>(&mut self, record: &T) -> io::Result<()> {
        let mut line = serde_json::to_string(record).map_err(io::Error::other)?;
        line.push('\n');
        self.file.write_all(line.as_bytes())?;
        self.file.flush()?;
        if self.fsync == FsyncPolicy::Always {
            self.file.sync_data()?;
        }
        Ok(())
    }
}

/// Reads complete records appended since `offset`.
///
/// Returns the new offset and the decoded records. A missing file yields
/// no records; an offset past the current file size resets to zero. A
/// malformed line is logged and skipped, never surfaced as an error.
pub fn tail_records<T: DeserializeOwned>(path: &Path, offset: u64) -> io::Result<(u64, Vec<T>)> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok((offset, Vec::new())),
        Err(err) => return Err(err),
    };

    let size = file.metadata()?.len();
    let mut offset = offset;
    if offset > size {
        offset = 0;
    }
    if offset == size {
        return Ok((offset, Vec::new()));
    }

    file.seek(SeekFrom::Start(offset))?;
    let mut buf = Vec::with_capacity((size - offset) as usize);
    file.read_to_end(&mut buf)?;

    // Only parse up to the last newline; a partial trailing line stays
    // unconsumed for the next poll.
    let Some(last_newline) = buf.iter().rposition(|b| *b == b'\n') else {
        return Ok((offset, Vec::new()));
    };
    let parseable = &buf[..=last_newline];
    let new_offset = offset + parseable.len() as u64;

    let mut records = Vec::new();
    for line in parseable.split(|b| *b == b'\n') {
        if line.is_empty() {
            continue;
        }
        match serde_json::from_slice::<T>(line) {
            Ok(record) => records.push(record),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "skipping malformed log line");
            }
        }
    }
    Ok((new_offset, records))
}

/// Current byte length of a log file; zero when absent. Used by the client
/// to detect a drained stream after the terminal status appears.
pub fn log_len(path: &Path) -> io::Result<u64> {
    match std::fs::metadata(path) {
        Ok(meta) => Ok(meta.len()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(0),
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use pretty_assertions::assert_eq;
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Rec {
        seq: u32,
    }

    #[test]
    fn append_then_tail_yields_each_record_once() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("log.jsonl");
        let log = AppendLog::new(&path, FsyncPolicy::Never);

        log.append(&Rec { seq: 0 }).expect("append");
        log.append(&Rec { seq: 1 }).expect("append");

        let (offset, records) = tail_records::<Rec>(&path, 0).expect("tail");
        assert_eq!(records, vec![Rec { seq: 0 }, Rec { seq: 1 }]);

        // Tailing from the advanced offset yields nothing.
        let (offset_again, records) = tail_records::<Rec>(&path, offset).expect("tail");
        assert_eq!(offset_again, offset);
        assert!(records.is_empty());

        log.append(&Rec { seq: 2 }).expect("append");
        let (_, records) = tail_records::<Rec>(&path, offset).expect("tail");
        assert_eq!(records, vec![Rec { seq: 2 }]);
    }

    #[test]
    fn partial_trailing_line_is_reread_next_poll() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("log.jsonl");
        fs::write(&path, b"{\"seq\":0}\n{\"seq\":1").expect("write");

        let (offset, records) = tail_records::<Rec>(&path, 0).expect("tail");
        assert_eq!(records, vec![Rec { seq: 0 }]);
        assert_eq!(offset, b"{\"seq\":0}\n".len() as u64);

        // Writer finishes the line; the next poll picks it up from the
        // held offset.
        let mut existing = fs::read(&path).expect("read");
        existing.extend_from_slice(b"}\n");
        fs::write(&path, existing).expect("rewrite");
        let (_, records) = tail_records::<Rec>(&path, offset).expect("tail");
        assert_eq!(records, vec![Rec { seq: 1 }]);
    }

    #[test]
    fn malformed_lines_are_skipped_not_fatal() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("log.jsonl");
        fs::write(&path, b"{\"seq\":0}\nnot json\n{\"seq\":2}\n").expect("write");

        let (_, records) = tail_records::<Rec>(&path, 0).expect("tail");
        assert_eq!(records, vec![Rec { seq: 0 }, Rec { seq: 2 }]);
    }

    #[test]
    fn missing_file_yields_nothing() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("absent.jsonl");
        let (offset, records) = tail_records::<Rec>(&path, 7).expect("tail");
        assert_eq!(offset, 7);
        assert!(records.is_empty());
    }

    #[test]
    fn stale_offset_resets_to_start() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("log.jsonl");
        fs::write(&path, b"{\"seq\":5}\n").expect("write");

        let (offset, records) = tail_records::<Rec>(&path, 10_000).expect("tail");
        assert_eq!(records, vec![Rec { seq: 5 }]);
        assert_eq!(offset, 10);
    }
}
