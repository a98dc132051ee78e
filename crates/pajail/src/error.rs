//! Error types and exit-code mapping.

use std::io;
use thiserror::Error;

/// Engine error. Every variant renders as the one-line
/// `<path-or-cmd>: <reason>` shape the tool prints on stderr.
#[derive(Debug, Error)]
pub enum Error {
    /// A syscall failed; carries the operation name and the path it acted on.
    #[error("{op} {path}: {source}")]
    Sys {
        op: &'static str,
        path: String,
        source: io::Error,
    },

    /// A path-shaped failure without an interesting operation name.
    #[error("{path}: {source}")]
    Path { path: String, source: io::Error },

    /// The policy oracle refused the request.
    #[error("{path}: {message}")]
    Policy { path: String, message: String },

    /// Manifest syntax or semantic problem.
    #[error("{0}")]
    Manifest(String),

    /// Anything else with a preformatted one-line message.
    #[error("{0}")]
    Msg(String),
}

impl Error {
    pub fn sys(op: &'static str, path: impl Into<String>) -> Error {
        Error::Sys {
            op,
            path: path.into(),
            source: io::Error::last_os_error(),
        }
    }

    pub fn path(path: impl Into<String>) -> Error {
        Error::Path {
            path: path.into(),
            source: io::Error::last_os_error(),
        }
    }

    pub fn msg(message: impl Into<String>) -> Error {
        Error::Msg(message.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Process exit codes (the supervisor produces the 124..128+n range).
pub mod exit {
    /// Usage error or fatal setup failure.
    pub const FATAL: i32 = 1;
    /// A wall-clock or idle deadline fired.
    pub const TIMEOUT: i32 = 124;
    /// The PTY read side failed with a real error.
    pub const IO: i32 = 125;
    /// The jailed program could not be exec'd.
    pub const EXEC: i32 = 126;
    /// Privilege transition or listen failure inside the init process.
    pub const PRIV: i32 = 127;

    /// Exit code for a child killed by signal `signo`.
    pub fn signaled(signo: i32) -> i32 {
        128 + signo
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_renders_one_line() {
        let e = Error::Sys {
            op: "chown",
            path: "/jails/a".into(),
            source: io::Error::from_raw_os_error(libc::EPERM),
        };
        let s = e.to_string();
        assert!(s.starts_with("chown /jails/a: "));
        assert!(!s.contains('\n'));
    }

    #[test]
    fn signal_exit_codes() {
        assert_eq!(exit::signaled(libc::SIGTERM), 143);
        assert_eq!(exit::signaled(libc::SIGKILL), 137);
    }
}
