//! Execution backends

pub mod qemu;
pub mod valgrind;

use std::fmt;
use std::io;

use crate::feedback::Trace;

/// Backend result type
pub type Result<T> = std::result::Result<T, BackendError>;

/// Outcome of a single target execution
#[derive(Debug)]
pub enum Execution {
    /// The target ran to completion
    Completed(Trace),
    /// The target did not finish within the configured timeout
    Hung,
}

/// Error raised by an execution backend
#[derive(Debug)]
pub enum BackendError {
    /// The runner could not be launched
    Spawn(io::Error),
    /// The runner exited before completing the fork server handshake
    PrematureExit(String),
    /// I/O failure on the fork server plumbing after startup
    Ipc(io::Error),
    /// Error while setting up backend resources
    Setup(io::Error),
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BackendError::Spawn(error) => write!(f, "Failed to launch the runner: {}", error),
            BackendError::PrematureExit(detail) => {
                write!(f, "The fork server exited prematurely: {}", detail)
            }
            BackendError::Ipc(error) => write!(f, "Fork server I/O failure: {}", error),
            BackendError::Setup(error) => write!(f, "Backend setup failure: {}", error),
        }
    }
}

/// Convert a nix level error into a std io error
pub(crate) fn nix_to_io(error: nix::Error) -> io::Error {
    io::Error::from_raw_os_error(error as i32)
}

/// Launches instrumented executions of the target and reports traces
pub trait Backend: Send {
    /// Execute the target once against `data` and collect its trace
    fn run(&mut self, data: &[u8]) -> Result<Execution>;

    /// Release every resource held by the backend. Idempotent, safe to
    /// call even if initialization did not complete.
    fn cleanup(&mut self);
}
