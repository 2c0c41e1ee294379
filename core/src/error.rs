use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Top-level error for session transport operations.
///
/// Per-session failures are reported back through `status.json` as
/// `state = "error"`; only fatal startup conditions (unwritable cache,
/// unsupported advisory locks) abort a process.
#[derive(Debug, Error)]
pub enum PigeonError {
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("session {session_id} already exists")]
    SessionExists { session_id: String },

    #[error("malformed request for session {session_id}: {detail}")]
    MalformedRequest { session_id: String, detail: String },

    #[error("status for session {session_id} is terminal and cannot change")]
    TerminalStatus { session_id: String },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Pty(#[from] PtyError),
}

impl PigeonError {
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{path}: invalid TOML: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("failed to write config {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid value for {key}: {detail}")]
    InvalidValue { key: String, detail: String },

    #[error("unknown config key {key:?}")]
    UnknownKey { key: String },

    #[error(
        "no cache directory configured; set PIGEON_CACHE or `cache` in the config file \
         to the shared cache path"
    )]
    MissingCache,
}

#[derive(Debug, Error)]
pub enum LockError {
    #[error("failed to open lock file {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("flock on {path} failed: {source}")]
    Flock {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(
        "advisory file locks are not supported on {path}; the shared filesystem must \
         provide working flock() semantics for per-cwd serialization"
    )]
    Unsupported { path: PathBuf },
}

#[derive(Debug, Error)]
pub enum PtyError {
    #[error("failed to open pty: {0}")]
    Open(String),

    #[error("failed to spawn command: {0}")]
    Spawn(String),

    #[error("failed to write to pty master: {source}")]
    Write {
        #[source]
        source: io::Error,
    },

    #[error("failed to append to stream log: {source}")]
    Stream {
        #[source]
        source: io::Error,
    },
}
