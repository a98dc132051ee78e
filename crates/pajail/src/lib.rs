//! pajail: per-user filesystem jails for untrusted programs.
//!
//! This crate is the engine behind the `pa-jail` tool: an automated grader
//! hands it a manifest and a target account, and it builds a throwaway
//! chroot tree, launches the program inside fresh mount/PID/IPC namespaces
//! on its own PTY, and supervises the session. It combines:
//!
//! - **Policy oracle** - `/etc/pa-jail.conf` decides where jails and
//!   skeletons may live
//! - **Path materializer** - manifest-driven tree construction with
//!   hard-link sharing through a skeleton directory
//! - **Mount planner** - reflects host mounts into the jail across the
//!   add / pre-fork / in-child phases
//! - **Jail launcher** - namespaces, `pivot_root`, privilege ladder, PTY
//! - **Supervisor** - the namespace init: one `poll` loop moving bytes
//!   between caller stdio, the PTY and event-source subscribers, with
//!   wall-clock and idle timeouts
//!
//! ## Requirements
//!
//! - Linux with mount/PID/IPC namespaces (macOS degrades to plain
//!   `chroot` + `fork`, for development only)
//! - root (installed setuid-root or invoked by root)

pub mod buffer;
pub mod error;
pub mod eventsource;
pub mod fsops;
pub mod jaildir;
pub mod launcher;
pub mod manifest;
pub mod materialize;
pub mod mounts;
pub mod paths;
pub mod pidfile;
pub mod policy;
pub mod session;
pub mod supervisor;

pub use error::{exit, Error, Result};
pub use fsops::FsOps;
pub use jaildir::{JailAction, JailDir};
pub use launcher::Launcher;
pub use materialize::Materializer;
pub use mounts::{MountPhase, MountPlanner};
pub use policy::Policy;
pub use session::{JailUser, RunSession};
pub use supervisor::TtyState;
