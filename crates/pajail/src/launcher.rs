//! Jail launcher: namespace creation, pivot, privilege ladder, PTY, exec.
//!
//! `Launcher::exec` is called with real and effective uid 0. It clones a
//! child into fresh mount + PID + IPC namespaces; the child finishes the
//! in-namespace mounts, pivots the root into the jail, demotes to the
//! target user (saving root for PTY setup), opens the PTY pair, forks the
//! user program onto the slave, and becomes the supervising init. The
//! caller either waits (`--fg`) or exits immediately.
//!
//! On macOS there are no namespaces or `pivot_root`; the launcher degrades
//! to plain `chroot` + `fork` with the same observable contracts.

use std::os::fd::RawFd;

use crate::error::{exit, Error, Result};
use crate::fsops::{name_of_uid, wait_status, FsOps};
use crate::jaildir::JailDir;
use crate::mounts::{MountPhase, MountPlanner};
use crate::paths::{cstr, end_slash, shell_quote};
use crate::session::RunSession;
use crate::supervisor::{set_gids, set_uids, SignalSource, Supervisor, TtyState};

pub struct Launcher<'a> {
    pub session: RunSession,
    pub jail: &'a JailDir,
    pub ops: &'a mut FsOps,
    pub planner: &'a mut MountPlanner,
}

impl<'a> Launcher<'a> {
    /// Enter the jail and run the session command. Does not return: every
    /// path ends in `process::exit` (the `Err` side covers setup failures
    /// before the namespace exists).
    pub fn exec(mut self, tty: TtyState) -> Result<std::convert::Infallible> {
        let dryrun = self.ops.dryrun;

        #[cfg(any(target_os = "linux", target_os = "android"))]
        let child: libc::pid_t = if dryrun {
            self.ops.echo(format_args!("-clone-"));
            let code = self.jail_init(&tty);
            std::process::exit(code);
        } else {
            use nix::sched::{clone, CloneFlags};
            self.ops.echo(format_args!("-clone-"));
            let mut stack = vec![0u8; 256 * 1024];
            let flags =
                CloneFlags::CLONE_NEWIPC | CloneFlags::CLONE_NEWNS | CloneFlags::CLONE_NEWPID;
            let tty_for_child = tty.clone();
            let this = &mut self;
            let r = unsafe {
                clone(
                    Box::new(|| this.jail_init(&tty_for_child) as isize),
                    &mut stack,
                    flags,
                    Some(libc::SIGCHLD),
                )
            };
            match r {
                Ok(pid) => pid.as_raw(),
                Err(e) => {
                    return Err(Error::Sys {
                        op: "clone",
                        path: self.jail.dir.clone(),
                        source: std::io::Error::from_raw_os_error(e as i32),
                    })
                }
            }
        };
        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        let child: libc::pid_t = if dryrun {
            let code = self.jail_init(&tty);
            std::process::exit(code);
        } else {
            let pid = unsafe { libc::fork() };
            if pid < 0 {
                return Err(Error::sys("fork", &self.jail.dir));
            }
            if pid == 0 {
                let code = self.jail_init(&tty);
                std::process::exit(code);
            }
            pid
        };

        if let Some(pf) = &self.session.pid_file {
            pf.write_pid(child)
                .unwrap_or_else(|e| fatal(&e.to_string()));
        }

        // the namespace init owns all further I/O
        unsafe {
            libc::close(0);
            libc::close(1);
            libc::close(2);
        }

        let mut exit_status = 0;
        if self.session.foreground {
            let (cu, cg) = (self.session.caller_uid, self.session.caller_gid);
            set_gids(cg, cg, cg);
            set_uids(cu, cu, cu);
            exit_status = wait_status(child, 0).1;
            tty.restore();
        }
        std::process::exit(exit_status.max(0));
    }

    /// Body of the namespace init process. Returns an exit code instead of
    /// erroring: there is no caller left to report to.
    fn jail_init(&mut self, tty: &TtyState) -> i32 {
        match self.jail_init_inner(tty) {
            Ok(code) => code,
            Err(e) => {
                eprintln!("{e}");
                exit::FATAL
            }
        }
    }

    fn jail_init_inner(&mut self, tty: &TtyState) -> Result<i32> {
        let session = {
            let user = self.session.user.clone();
            std::mem::replace(&mut self.session, RunSession::new(user))
        };
        let jdir = end_slash(&self.jail.dir);
        let unmounted_jdir = end_slash(&self.planner.unmounted(&jdir));
        self.planner.phase = MountPhase::InChild;

        #[cfg(any(target_os = "linux", target_os = "android"))]
        {
            let parent_mnt = format!("{jdir}mnt/.parent");
            let unmounted_parent_mnt = format!("{unmounted_jdir}mnt/.parent");
            self.ops
                .ensure_dir(&unmounted_parent_mnt, 0o777, true)
                .map_err(|_| Error::sys("mkdir -p", &unmounted_parent_mnt))?;

            // without this, mount changes can propagate to a host whose /
            // is a shared mount despite CLONE_NEWNS
            self.ops.echo(format_args!("mount --make-rslave /"));
            if !self.ops.dryrun {
                use nix::mount::{mount, MsFlags};
                mount(
                    Some("none"),
                    "/",
                    None::<&str>,
                    MsFlags::MS_REC | MsFlags::MS_SLAVE,
                    None::<&str>,
                )
                .map_err(|e| sys_err("mount --make-rslave /", e))?;
            }

            self.planner.populate()?;
            self.planner.run_delayed(self.ops)?;
            self.planner
                .handle_mount(self.ops, "/proc", &format!("{jdir}proc"))?;
            self.planner
                .handle_mount(self.ops, "/dev/pts", &format!("{jdir}dev/pts"))?;
            self.planner
                .handle_mount(self.ops, "/tmp", &format!("{jdir}tmp"))?;
            self.planner
                .handle_mount(self.ops, "/run", &format!("{jdir}run"))?;

            // a jail that is not already a bind target must become one so
            // pivot_root accepts it
            if unmounted_jdir == jdir {
                self.ops.echo(format_args!("mount --bind {}", shell_quote(&jdir)));
                if !self.ops.dryrun {
                    use nix::mount::{mount, MsFlags};
                    mount(
                        Some(jdir.as_str()),
                        jdir.as_str(),
                        None::<&str>,
                        MsFlags::MS_BIND | MsFlags::MS_REC,
                        None::<&str>,
                    )
                    .map_err(|e| sys_err(&format!("mount --bind {jdir}"), e))?;
                }
            }

            self.ops.echo(format_args!(
                "pivot_root {} {}",
                shell_quote(&jdir),
                shell_quote(&parent_mnt)
            ));
            if !self.ops.dryrun {
                let jc = cstr(&jdir);
                let pc = cstr(&parent_mnt);
                if unsafe { libc::syscall(libc::SYS_pivot_root, jc.as_ptr(), pc.as_ptr()) } != 0 {
                    return Err(Error::sys("pivot_root", format!("{jdir} {parent_mnt}")));
                }
            }
            self.ops.echo(format_args!("cd /"));
            if !self.ops.dryrun && unsafe { libc::chdir(cstr("/").as_ptr()) } != 0 {
                return Err(Error::sys("cd", "/"));
            }
            let new_parent_mnt = parent_mnt[jdir.len() - 1..].to_string();
            self.ops
                .echo(format_args!("umount {}", shell_quote(&new_parent_mnt)));
            if !self.ops.dryrun
                && unsafe { libc::umount2(cstr(&new_parent_mnt).as_ptr(), libc::MNT_DETACH) } != 0
            {
                return Err(Error::sys("umount", &new_parent_mnt));
            }
        }
        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        {
            self.ops.echo(format_args!("cd {}", shell_quote(&jdir)));
            if !self.ops.dryrun && unsafe { libc::chdir(cstr(&jdir).as_ptr()) } != 0 {
                return Err(Error::path(&jdir));
            }
            self.ops.echo(format_args!("chroot ."));
            if !self.ops.dryrun && unsafe { libc::chroot(cstr(".").as_ptr()) } != 0 {
                return Err(Error::sys("chroot", "."));
            }
        }

        // demote the effective identity now, keeping root saved for the
        // PTY grant below
        self.ops
            .echo(format_args!("su {}", name_of_uid(session.user.uid)));
        if !self.ops.dryrun {
            if !set_gids(session.user.gid, session.user.gid, 0) {
                return Err(Error::sys("setresgid", "-"));
            }
            if !set_uids(session.user.uid, session.user.uid, 0) {
                return Err(Error::sys("setresuid", "-"));
            }
        }

        let mut ptymaster: RawFd = -1;
        let mut slave_name = String::new();
        self.ops.echo(format_args!("make-pty"));
        if !self.ops.dryrun {
            (ptymaster, slave_name) = open_pty_master()?;
        }

        self.ops
            .echo(format_args!("cd {}", shell_quote(&session.user.home)));
        if !self.ops.dryrun && unsafe { libc::chdir(cstr(&session.user.home).as_ptr()) } != 0 {
            return Err(Error::path(&session.user.home));
        }

        if !self.ops.dryrun
            && unsafe { libc::access(cstr(&session.user.shell).as_ptr(), libc::R_OK | libc::X_OK) }
                != 0
        {
            return Err(Error::path(&session.user.shell));
        }

        if let Some(marker) = &session.ready_marker {
            let nl = if marker.ends_with('\n') { "" } else { "-n " };
            self.ops.echo(format_args!("echo {nl}{}", marker.trim_end_matches('\n')));
            if !self.ops.dryrun {
                use std::io::Write;
                let mut out = std::io::stdout();
                let _ = out.write_all(marker.as_bytes());
                let _ = out.flush();
            }
        }

        if self.ops.verbose {
            let mut line = String::new();
            for e in &session.env {
                line.push_str(&e.to_string_lossy());
                line.push(' ');
            }
            let words: Vec<String> = session
                .argv
                .iter()
                .map(|a| shell_quote(&a.to_string_lossy()))
                .collect();
            line.push_str(&words.join(" "));
            self.ops.echo(format_args!("{line}"));
        }

        if self.ops.dryrun {
            return Ok(0);
        }

        let signals = SignalSource::install().map_err(|e| Error::Sys {
            op: "signalfd",
            path: "-".into(),
            source: e,
        })?;

        let child = unsafe { libc::fork() };
        if child < 0 {
            return Err(Error::sys("fork", "-"));
        }
        if child == 0 {
            user_child(&session, ptymaster, &slave_name, tty);
        }

        Supervisor::new(session, tty.clone(), signals, child, ptymaster).run()
    }
}

fn sys_err(what: &str, e: nix::errno::Errno) -> Error {
    Error::Path {
        path: what.to_string(),
        source: std::io::Error::from_raw_os_error(e as i32),
    }
}

fn fatal(msg: &str) -> ! {
    eprintln!("{msg}");
    std::process::exit(exit::FATAL);
}

/// Open and prime the PTY master: baseline input flags, `grantpt`,
/// `unlockpt`, slave name.
fn open_pty_master() -> Result<(RawFd, String)> {
    use nix::fcntl::OFlag;
    use nix::pty::{grantpt, posix_openpt, unlockpt};
    use std::os::fd::{AsRawFd, IntoRawFd};

    let master = posix_openpt(OFlag::O_RDWR | OFlag::O_NOCTTY)
        .map_err(|e| sys_err("posix_openpt", e))?;
    let raw = master.as_raw_fd();

    unsafe {
        let mut t = std::mem::zeroed::<libc::termios>();
        if libc::tcgetattr(raw, &mut t) >= 0 {
            t.c_iflag |= libc::BRKINT | libc::IGNPAR | libc::IMAXBEL;
            #[cfg(any(target_os = "linux", target_os = "android"))]
            {
                t.c_iflag |= libc::IUTF8;
            }
            libc::tcsetattr(raw, libc::TCSANOW, &t);
        }
    }

    grantpt(&master).map_err(|e| sys_err("grantpt", e))?;
    unlockpt(&master).map_err(|e| sys_err("unlockpt", e))?;
    #[cfg(any(target_os = "linux", target_os = "android"))]
    let name = nix::pty::ptsname_r(&master).map_err(|e| sys_err("ptsname", e))?;
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    let name = unsafe {
        let p = libc::ptsname(raw);
        if p.is_null() {
            return Err(Error::sys("ptsname", "-"));
        }
        std::ffi::CStr::from_ptr(p).to_string_lossy().into_owned()
    };
    Ok((master.into_raw_fd(), name))
}

/// The forked user process: session setup, controlling tty, exec.
/// Never returns.
fn user_child(session: &RunSession, ptymaster: RawFd, slave_name: &str, tty: &TtyState) -> ! {
    SignalSource::unblock_in_child();

    // permanent drop: no saved root remains after this
    if !set_gids(session.user.gid, session.user.gid, session.user.gid) {
        fatal_errno("setresgid");
    }
    if !set_uids(session.user.uid, session.user.uid, session.user.uid) {
        fatal_errno("setresuid");
    }
    if unsafe { libc::setsid() } < 0 {
        fatal_errno("setsid");
    }

    if !slave_name.is_empty() {
        attach_pty_slave(session, ptymaster, slave_name, tty);
    }

    // default dispositions for everything; an ignored SIGPIPE must not
    // leak into the jailed program
    for sig in nix::sys::signal::Signal::iterator() {
        unsafe {
            let _ = nix::sys::signal::signal(sig, nix::sys::signal::SigHandler::SigDfl);
        }
    }

    let argv: Vec<*const libc::c_char> = session
        .argv
        .iter()
        .map(|a| a.as_ptr())
        .chain(std::iter::once(std::ptr::null()))
        .collect();
    let envp: Vec<*const libc::c_char> = session
        .env
        .iter()
        .map(|e| e.as_ptr())
        .chain(std::iter::once(std::ptr::null()))
        .collect();
    unsafe { libc::execve(session.argv[0].as_ptr(), argv.as_ptr(), envp.as_ptr()) };

    eprintln!(
        "exec {}: {}",
        session.user.shell,
        std::io::Error::last_os_error()
    );
    unsafe { libc::_exit(exit::EXEC) };
}

/// Make the PTY slave the controlling terminal and wire it over stdio.
fn attach_pty_slave(session: &RunSession, ptymaster: RawFd, slave_name: &str, tty: &TtyState) {
    let slave = unsafe { libc::open(cstr(slave_name).as_ptr(), libc::O_RDWR) };
    if slave < 0 {
        fatal_errno(slave_name);
    }
    unsafe {
        libc::close(ptymaster);
        libc::ioctl(slave, libc::TIOCSCTTY, 0);
        libc::tcsetpgrp(slave, libc::getpid());

        if let Some((cols, rows)) = session.term_size {
            let mut ws = std::mem::zeroed::<libc::winsize>();
            libc::ioctl(slave, libc::TIOCGWINSZ, &mut ws);
            ws.ws_col = cols;
            ws.ws_row = rows;
            libc::ioctl(slave, libc::TIOCSWINSZ, &ws);
        }

        let mut t = std::mem::zeroed::<libc::termios>();
        if libc::tcgetattr(slave, &mut t) >= 0 {
            t.c_iflag |= libc::BRKINT | libc::IGNPAR | libc::IMAXBEL;
            #[cfg(any(target_os = "linux", target_os = "android"))]
            {
                t.c_iflag |= libc::IUTF8;
            }
            if session.no_onlcr {
                t.c_oflag &= !libc::ONLCR;
            }
            libc::tcsetattr(slave, libc::TCSANOW, &t);
        }

        let external_input = session.input_fd > 0;
        if external_input || tty.stdin_tty {
            libc::dup2(slave, 0);
        }
        if external_input || tty.stdout_tty {
            libc::dup2(slave, 1);
        }
        if external_input || tty.stderr_tty {
            libc::dup2(slave, 2);
        }
        libc::close(slave);
    }
}

fn fatal_errno(what: &str) -> ! {
    eprintln!("{what}: {}", std::io::Error::last_os_error());
    std::process::exit(exit::FATAL);
}
