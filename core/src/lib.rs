//! pigeon-core: borrow-the-network command execution over a shared
//! filesystem.
//!
//! Two hosts that mount the same POSIX filesystem but cannot reach each
//! other over the network trade work through session directories: the
//! client publishes `request.json`, a worker claims the session with an
//! exclusive file create, runs the command under a PTY in the same
//! absolute cwd, and streams output back through an append-only log. The
//! client mirrors bytes, forwards stdin and signals, and exits with the
//! remote exit code.

pub mod append_log;
pub mod argv;
pub mod client;
pub mod config;
pub mod error;
pub mod lock;
pub mod paths;
pub mod protocol;
pub mod pty;
pub mod session;
pub mod worker;

pub use error::PigeonError;
