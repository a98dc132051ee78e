//! The supervisor: pid 1 of the jail's namespace.
//!
//! After the user program is forked onto the PTY slave, this process is the
//! only thing left in the namespace besides the jailed session. It owns a
//! single non-blocking `poll` loop that shuttles bytes between the caller's
//! input, the PTY master, the caller's stdout and any event-source
//! subscribers, reaps children, enforces the wall-clock and idle deadlines,
//! and appends timing records. Within one iteration all reads happen before
//! all writes, so an input chunk is mirrored to every output in the same
//! tick; timing records are written between the phases so their offsets are
//! monotonic.

use std::os::fd::RawFd;
use std::time::{Duration, Instant};

use crate::buffer::JailBuffer;
use crate::error::exit;
use crate::eventsource::Subscriber;
use crate::session::RunSession;

pub fn make_nonblocking(fd: RawFd) {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
    }
}

/// Set real/effective/saved uid. The saved id is dropped on platforms
/// without `setresuid`.
pub fn set_uids(r: libc::uid_t, e: libc::uid_t, s: libc::uid_t) -> bool {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        unsafe { libc::setresuid(r, e, s) == 0 }
    }
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    {
        let _ = s;
        unsafe { libc::setreuid(r, e) == 0 }
    }
}

pub fn set_gids(r: libc::gid_t, e: libc::gid_t, s: libc::gid_t) -> bool {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        unsafe { libc::setresgid(r, e, s) == 0 }
    }
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    {
        let _ = s;
        unsafe { libc::setregid(r, e) == 0 }
    }
}

// ---------------------------------------------------------------------------
// Signal delivery

#[cfg(not(target_os = "linux"))]
static SIGPIPE_WRITE: std::sync::atomic::AtomicI32 = std::sync::atomic::AtomicI32::new(-1);
#[cfg(not(target_os = "linux"))]
static GOT_SIGTERM: std::sync::atomic::AtomicBool = std::sync::atomic::AtomicBool::new(false);

#[cfg(not(target_os = "linux"))]
extern "C" fn sigpipe_handler(signo: libc::c_int) {
    use std::sync::atomic::Ordering;
    if signo == libc::SIGTERM {
        GOT_SIGTERM.store(true, Ordering::Relaxed);
    }
    let fd = SIGPIPE_WRITE.load(Ordering::Relaxed);
    if fd >= 0 {
        let b = signo as u8;
        unsafe { libc::write(fd, std::ptr::addr_of!(b).cast(), 1) };
    }
}

/// `SIGCHLD`/`SIGTERM` delivery into the poll set: a signalfd behind a
/// blocked mask on Linux, a self-pipe written by an async handler elsewhere.
pub struct SignalSource {
    #[cfg(target_os = "linux")]
    fd: nix::sys::signalfd::SignalFd,
    #[cfg(not(target_os = "linux"))]
    read_fd: RawFd,
    got_sigterm: bool,
}

impl SignalSource {
    /// Block the signals and open the delivery fd. Must run before the user
    /// child is forked so it inherits the blocked mask.
    pub fn install() -> std::io::Result<SignalSource> {
        #[cfg(target_os = "linux")]
        {
            use nix::sys::signal::{sigprocmask, SigSet, SigmaskHow, Signal};
            use nix::sys::signalfd::{SfdFlags, SignalFd};
            let mut mask = SigSet::empty();
            mask.add(Signal::SIGCHLD);
            mask.add(Signal::SIGTERM);
            sigprocmask(SigmaskHow::SIG_BLOCK, Some(&mask), None)
                .map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
            let fd = SignalFd::with_flags(&mask, SfdFlags::SFD_NONBLOCK | SfdFlags::SFD_CLOEXEC)
                .map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
            Ok(SignalSource {
                fd,
                got_sigterm: false,
            })
        }
        #[cfg(not(target_os = "linux"))]
        {
            use std::sync::atomic::Ordering;
            let mut fds = [0; 2];
            if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
                return Err(std::io::Error::last_os_error());
            }
            make_nonblocking(fds[0]);
            make_nonblocking(fds[1]);
            SIGPIPE_WRITE.store(fds[1], Ordering::Relaxed);
            unsafe {
                let mut sa = std::mem::zeroed::<libc::sigaction>();
                sa.sa_sigaction = sigpipe_handler as usize;
                libc::sigemptyset(&mut sa.sa_mask);
                libc::sigaction(libc::SIGCHLD, &sa, std::ptr::null_mut());
                libc::sigaction(libc::SIGTERM, &sa, std::ptr::null_mut());
            }
            Ok(SignalSource {
                read_fd: fds[0],
                got_sigterm: false,
            })
        }
    }

    /// Restore an empty signal mask (the user child calls this after fork).
    pub fn unblock_in_child() {
        #[cfg(target_os = "linux")]
        {
            use nix::sys::signal::{sigprocmask, SigSet, SigmaskHow};
            let _ = sigprocmask(SigmaskHow::SIG_SETMASK, Some(&SigSet::empty()), None);
        }
    }

    pub fn raw_fd(&self) -> RawFd {
        #[cfg(target_os = "linux")]
        {
            use std::os::fd::AsRawFd;
            self.fd.as_raw_fd()
        }
        #[cfg(not(target_os = "linux"))]
        {
            self.read_fd
        }
    }

    /// Consume pending notifications; afterwards `sigterm()` reflects any
    /// SIGTERM seen so far.
    pub fn drain(&mut self) {
        #[cfg(target_os = "linux")]
        {
            while let Ok(Some(si)) = self.fd.read_signal() {
                if si.ssi_signo == libc::SIGTERM as u32 {
                    self.got_sigterm = true;
                }
            }
        }
        #[cfg(not(target_os = "linux"))]
        {
            use std::sync::atomic::Ordering;
            let mut buf = [0u8; 128];
            while unsafe { libc::read(self.read_fd, buf.as_mut_ptr().cast(), buf.len()) } > 0 {}
            if GOT_SIGTERM.load(Ordering::Relaxed) {
                self.got_sigterm = true;
            }
        }
    }

    pub fn sigterm(&self) -> bool {
        self.got_sigterm
    }
}

// ---------------------------------------------------------------------------
// Caller terminal state

/// The caller's tty condition, captured at startup and restored on every
/// exit path.
#[derive(Clone)]
pub struct TtyState {
    pub stdin_tty: bool,
    pub stdout_tty: bool,
    pub stderr_tty: bool,
    pub ttyfd: RawFd,
    saved: Option<libc::termios>,
}

impl TtyState {
    pub fn capture() -> TtyState {
        let stdin_tty = unsafe { libc::isatty(0) } == 1;
        let stdout_tty = unsafe { libc::isatty(1) } == 1;
        let stderr_tty = unsafe { libc::isatty(2) } == 1;
        // assume all tty stdio fds refer to the same terminal
        let ttyfd = if stdin_tty {
            0
        } else if stdout_tty {
            1
        } else if stderr_tty {
            2
        } else {
            -1
        };
        let mut saved = None;
        if ttyfd >= 0 {
            let mut t = unsafe { std::mem::zeroed::<libc::termios>() };
            if unsafe { libc::tcgetattr(ttyfd, &mut t) } == 0 {
                saved = Some(t);
            }
        }
        TtyState {
            stdin_tty,
            stdout_tty,
            stderr_tty,
            ttyfd,
            saved,
        }
    }

    /// Raw mode with `VMIN=1, VTIME=1` so keystrokes pass through
    /// unbuffered while reads still time out quickly.
    pub fn enter_raw(&self) {
        let Some(saved) = &self.saved else { return };
        let mut t = *saved;
        unsafe {
            libc::cfmakeraw(&mut t);
            t.c_cc[libc::VMIN] = 1;
            t.c_cc[libc::VTIME] = 1;
            libc::tcsetattr(self.ttyfd, libc::TCSANOW, &t);
        }
    }

    pub fn restore(&self) {
        if let Some(saved) = &self.saved {
            unsafe { libc::tcsetattr(self.ttyfd, libc::TCSAFLUSH, saved) };
        }
    }
}

// ---------------------------------------------------------------------------
// Supervisor

pub struct Supervisor {
    session: RunSession,
    tty: TtyState,
    signals: SignalSource,
    child: libc::pid_t,
    ptymaster: RawFd,

    to_slave: JailBuffer,
    to_slave_off: u64,
    from_slave: JailBuffer,
    from_slave_off: u64,
    subscribers: Vec<Subscriber>,

    start: Instant,
    expiry: Option<Instant>,
    idle_expiry: Option<Instant>,

    child_status: Option<i32>,
    has_blocked: bool,
    timing_count: u64,
    timing_msec: u64,
    timing_offset: u64,
}

impl Supervisor {
    pub fn new(
        session: RunSession,
        tty: TtyState,
        signals: SignalSource,
        child: libc::pid_t,
        ptymaster: RawFd,
    ) -> Supervisor {
        let mut from_slave = JailBuffer::new(8192);
        // seed the output offset so subscribers of an append-mode stdout
        // file observe file offsets
        let stdout_off = unsafe { libc::lseek(1, 0, libc::SEEK_CUR) };
        from_slave.base = if stdout_off < 0 { 0 } else { stdout_off as u64 };
        let from_slave_off = from_slave.base;

        let start = Instant::now();
        let expiry = session
            .timeout
            .filter(|t| *t > 0.0)
            .map(|t| start + Duration::from_secs_f64(t));
        let idle_expiry = session
            .idle_timeout
            .filter(|t| *t > 0.0)
            .map(|t| start + Duration::from_secs_f64(t));

        Supervisor {
            session,
            tty,
            signals,
            child,
            ptymaster,
            to_slave: JailBuffer::new(4096),
            to_slave_off: 0,
            from_slave,
            from_slave_off,
            subscribers: Vec::new(),
            start,
            expiry,
            idle_expiry,
            child_status: None,
            has_blocked: false,
            timing_count: 0,
            timing_msec: 0,
            timing_offset: 0,
        }
    }

    /// Supervise until the child exits or a deadline fires. Never returns.
    pub fn run(mut self) -> ! {
        // back to being the caller: keep no root identity in the loop
        let (cu, cg) = (self.session.caller_uid, self.session.caller_gid);
        let ok = set_uids(0, 0, 0) && set_gids(cg, cg, cg) && set_uids(cu, cu, cu);
        if !ok {
            eprintln!("setresuid: {}", std::io::Error::last_os_error());
            self.exec_done(exit::PRIV);
        }

        use std::io::Write;
        let _ = std::io::stdout().flush();

        self.to_slave_off = self.to_slave.head_offset();

        if self.ptymaster >= 0 {
            self.tty.enter_raw();
            make_nonblocking(self.ptymaster);
            if self.session.input_fd > 0 || self.tty.stdin_tty {
                make_nonblocking(self.session.input_fd);
            }
            if self.session.input_fd > 0 || self.tty.stdout_tty {
                make_nonblocking(1);
            }
            if self.session.input_fd == 0 && !self.tty.stdin_tty {
                unsafe { libc::close(0) };
                self.to_slave.mark_closed(0);
            }
            if self.session.input_fd == 0 && !self.tty.stdout_tty && !self.tty.stderr_tty {
                unsafe { libc::close(1) };
                // closed is expected here, not a read error
                self.from_slave.mark_closed(libc::EIO);
            }
        } else {
            self.to_slave.mark_closed(0);
            self.from_slave.mark_closed(libc::EIO);
        }

        if self.session.event_fd > 0 && unsafe { libc::listen(self.session.event_fd, 50) } != 0 {
            eprintln!("listen: {}", std::io::Error::last_os_error());
            self.exec_done(exit::PRIV);
        }

        loop {
            // child exit counts only once output is fully drained
            if let Some(code) = self.reap_and_check(self.from_slave.done()) {
                self.exec_done(code);
            }

            if self.from_slave.read_closed && self.from_slave.read_errno != libc::EIO {
                let nl = if self.session.no_onlcr { "\n" } else { "\r\n" };
                let err = std::io::Error::from_raw_os_error(self.from_slave.read_errno);
                eprint!("read: {err}{nl}");
                self.exec_done(exit::IO);
            }

            self.block();

            let mut any = false;
            if self.to_slave.read_from(self.session.input_fd) {
                any = true;
            }
            if self
                .to_slave
                .pending()
                .windows(2)
                .any(|w| w == b"\x1b\x03")
            {
                // user-requested kill
                self.exec_done(exit::signaled(libc::SIGTERM));
            }
            let mut off = self.to_slave_off;
            if self.to_slave.write_to(self.ptymaster, &mut off) {
                self.to_slave.consume_to(off);
                any = true;
            }
            self.to_slave_off = off;

            if self.from_slave.read_from(self.ptymaster) {
                any = true;
            }

            if self.has_blocked && self.session.timing_fd != -1 {
                self.write_timing();
                self.has_blocked = false;
            }

            if !self.from_slave.is_empty() {
                let last = self.from_slave.tail_offset();
                for sub in &mut self.subscribers {
                    if sub.output_off < last {
                        sub.write_event(&self.from_slave);
                    }
                }
            }

            let mut off = self.from_slave_off;
            if self.from_slave.write_to(1, &mut off) {
                self.from_slave.consume_to(off);
                any = true;
            }
            self.from_slave_off = off;

            self.subscribers.retain_mut(|sub| sub.flush());

            if any {
                if let Some(t) = self.session.idle_timeout.filter(|t| *t > 0.0) {
                    self.idle_expiry = Some(Instant::now() + Duration::from_secs_f64(t));
                }
            }
        }
    }

    /// Assemble the poll set, poll (non-blocking probe first), and process
    /// signal/accept readiness.
    fn block(&mut self) {
        let mut p: Vec<libc::pollfd> = Vec::with_capacity(6 + self.subscribers.len());
        let entry = |fd, events| libc::pollfd {
            fd,
            events,
            revents: 0,
        };

        p.push(entry(self.signals.raw_fd(), libc::POLLIN));

        if self.to_slave.can_read() {
            p.push(entry(self.session.input_fd, libc::POLLIN));
        }

        let mut pty_events = 0;
        if self.from_slave.can_read() {
            pty_events |= libc::POLLIN;
        }
        if self.to_slave.can_write() {
            pty_events |= libc::POLLOUT;
        }
        if pty_events != 0 {
            p.push(entry(self.ptymaster, pty_events));
        }

        if self.from_slave.can_write() {
            p.push(entry(1, libc::POLLOUT));
        }

        let mut event_index = None;
        if self.session.event_fd >= 0 {
            p.push(entry(self.session.event_fd, libc::POLLIN));
            event_index = Some(p.len() - 1);
        }
        for sub in &self.subscribers {
            if sub.buf.can_write() {
                p.push(entry(sub.fd, libc::POLLOUT));
            }
        }

        // 30s cap keeps subscriber connections alive; otherwise 1h
        let mut timeout_ms: i32 = if self.subscribers.is_empty() {
            3_600_000
        } else {
            30_000
        };
        let now = Instant::now();
        for deadline in [self.expiry, self.idle_expiry].into_iter().flatten() {
            let remaining = deadline
                .checked_duration_since(now)
                .map(|d| d.as_millis().min(i32::MAX as u128) as i32)
                .unwrap_or(0);
            timeout_ms = timeout_ms.min(remaining);
        }

        // opportunistic drain first; only a real wait arms the timing flag
        let mut pollr = unsafe { libc::poll(p.as_mut_ptr(), p.len() as libc::nfds_t, 0) };
        if pollr == 0 {
            self.has_blocked = true;
            pollr = unsafe { libc::poll(p.as_mut_ptr(), p.len() as libc::nfds_t, timeout_ms) };
        }
        if pollr < 0 {
            return; // EINTR: re-evaluate state on the next iteration
        }

        if p[0].revents & libc::POLLIN != 0 {
            self.signals.drain();
        }

        if let Some(i) = event_index {
            if p[i].revents & libc::POLLIN != 0 {
                let cfd = unsafe {
                    libc::accept(self.session.event_fd, std::ptr::null_mut(), std::ptr::null_mut())
                };
                if cfd >= 0 {
                    make_nonblocking(cfd);
                    let mut sub = Subscriber::new(cfd, self.from_slave.head_offset());
                    sub.write_event(&self.from_slave);
                    self.subscribers.push(sub);
                    log::debug!("event-source subscriber connected");
                }
            }
        }
    }

    /// Reap exited children and decide whether the loop is done.
    /// `wait_output_drained` gates the child's own exit status on the PTY
    /// buffer being fully flushed.
    fn reap_and_check(&mut self, output_drained: bool) -> Option<i32> {
        loop {
            let mut status = 0;
            let w = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };
            if w > 0 {
                let code = if libc::WIFEXITED(status) {
                    libc::WEXITSTATUS(status)
                } else {
                    128 + libc::WTERMSIG(status)
                };
                if w == self.child {
                    self.child_status = Some(code);
                }
                continue;
            }
            if w == 0 {
                break;
            }
            let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
            match errno {
                libc::EINTR => continue,
                libc::ECHILD => break,
                _ => return Some(exit::IO),
            }
        }

        if let Some(code) = self.child_status {
            if output_drained {
                return Some(code);
            }
        }
        if self.signals.sigterm() {
            return Some(exit::signaled(libc::SIGTERM));
        }
        let now = Instant::now();
        for deadline in [self.expiry, self.idle_expiry].into_iter().flatten() {
            if now > deadline {
                return Some(exit::TIMEOUT);
            }
        }
        None
    }

    /// One line per blocking iteration: absolute `ms,bytes` on the first
    /// record and every 128th, `+Δms,+Δbytes` in between.
    fn write_timing(&mut self) {
        let ms = self.start.elapsed().as_millis() as u64;
        let total = self.from_slave_off;
        let record = if self.timing_count % 128 == 0 {
            format!("{ms},{total}\n")
        } else {
            format!(
                "+{},+{}\n",
                ms - self.timing_msec,
                total - self.timing_offset
            )
        };
        let bytes = record.as_bytes();
        let mut written = 0;
        while written < bytes.len() {
            let nw = unsafe {
                libc::write(
                    self.session.timing_fd,
                    bytes[written..].as_ptr().cast::<libc::c_void>(),
                    bytes.len() - written,
                )
            };
            if nw <= 0 {
                eprintln!("timing file: {}", std::io::Error::last_os_error());
                std::process::exit(exit::FATAL);
            }
            written += nw as usize;
        }
        self.timing_msec = ms;
        self.timing_offset = total;
        self.timing_count += 1;
    }

    /// Final teardown: banner, termios restore, subscriber flush, exit.
    fn exec_done(&mut self, status: i32) -> ! {
        if self.session.timing_fd != -1 {
            self.write_timing();
        }

        let msg = if status == exit::TIMEOUT && !self.session.quiet {
            Some("...timed out".to_string())
        } else if status == exit::signaled(libc::SIGTERM) && !self.session.quiet {
            Some("...terminated".to_string())
        } else if self.session.verbose {
            Some(format!("...terminating with status {status}"))
        } else {
            None
        };
        if let Some(msg) = msg {
            let nl = if self.session.no_onlcr { "\n" } else { "\r\n" };
            if self.session.input_fd > 0 || self.tty.stderr_tty {
                eprint!("{nl}\x1b[3;7;31m{msg}\x1b[K\x1b[0m{nl}\x1b[K{nl}");
            } else {
                eprint!("{nl}{msg}{nl}{nl}");
            }
        }

        #[cfg(not(target_os = "linux"))]
        if status >= exit::TIMEOUT {
            // no pid namespace to tear the child down with
            unsafe { libc::kill(self.child, libc::SIGKILL) };
        }

        self.tty.restore();

        for sub in &mut self.subscribers {
            sub.write_done_event();
        }
        // drain subscriber buffers with a bounded poll budget
        while !self.subscribers.is_empty() {
            self.subscribers
                .retain_mut(|sub| sub.flush() && sub.buf.can_write());
            if self.subscribers.is_empty() {
                break;
            }
            let mut p: Vec<libc::pollfd> = self
                .subscribers
                .iter()
                .map(|sub| libc::pollfd {
                    fd: sub.fd,
                    events: libc::POLLOUT,
                    revents: 0,
                })
                .collect();
            let r = unsafe { libc::poll(p.as_mut_ptr(), p.len() as libc::nfds_t, 5000) };
            if r <= 0 {
                break;
            }
        }

        std::process::exit(status);
    }
}
