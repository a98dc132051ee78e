//! Effectful filesystem operations with verbose echo and dry-run support.
//!
//! Every operation that changes the filesystem goes through this layer. In
//! verbose mode each one is echoed as an equivalent shell command (to stderr
//! normally, stdout in dry-run) so an administrator can audit exactly what
//! the engine did or would do. In dry-run mode nothing is executed but the
//! same validation and bookkeeping runs.

use std::collections::HashMap;
use std::ffi::CStr;
use std::os::fd::RawFd;

use crate::error::{Error, Result};
use crate::paths::{cstr, no_end_slash, parent_dir, shell_quote};

pub struct FsOps {
    pub verbose: bool,
    pub dryrun: bool,
    /// `ensure_dir` memo: path (no trailing slash) -> result of creation.
    dirtable: HashMap<String, i32>,
}

impl FsOps {
    pub fn new(verbose: bool, dryrun: bool) -> FsOps {
        FsOps {
            verbose,
            dryrun,
            dirtable: HashMap::new(),
        }
    }

    /// Echo a shell-like command. Dry-run echoes to stdout, verbose to stderr.
    pub fn echo(&self, line: std::fmt::Arguments) {
        if self.verbose {
            if self.dryrun {
                println!("{line}");
            } else {
                eprintln!("{line}");
            }
        }
    }

    pub fn mkdir(&mut self, path: &str, mode: u32) -> Result<()> {
        self.echo(format_args!("mkdir -m 0{mode:o} {}", shell_quote(path)));
        if self.dryrun {
            return Ok(());
        }
        if unsafe { libc::mkdir(cstr(path).as_ptr(), mode as libc::mode_t) } != 0 {
            return Err(Error::sys("mkdir", path));
        }
        Ok(())
    }

    /// Ensure `path` is a directory, creating missing ancestors with `mode`.
    /// Returns true when this call created the leaf. `nolink` refuses to
    /// follow a symlink at the leaf.
    pub fn ensure_dir(&mut self, path: &str, mode: u32, nolink: bool) -> Result<bool> {
        let path = no_end_slash(path);
        if let Some(&r) = self.dirtable.get(&path) {
            return if r < 0 {
                Err(Error::sys("mkdir", path))
            } else {
                Ok(false)
            };
        }
        let result = self.ensure_dir_uncached(&path, mode, nolink);
        self.dirtable
            .insert(path, if result.is_err() { -1 } else { 0 });
        result
    }

    fn ensure_dir_uncached(&mut self, path: &str, mode: u32, nolink: bool) -> Result<bool> {
        let mut st = unsafe { std::mem::zeroed::<libc::stat>() };
        let c = cstr(path);
        let r = unsafe {
            if nolink {
                libc::lstat(c.as_ptr(), &mut st)
            } else {
                libc::stat(c.as_ptr(), &mut st)
            }
        };
        if r == 0 {
            if st.st_mode & libc::S_IFMT != libc::S_IFDIR {
                return Err(Error::Sys {
                    op: "mkdir",
                    path: path.into(),
                    source: std::io::Error::from_raw_os_error(libc::ENOTDIR),
                });
            }
            return Ok(false);
        }
        let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
        if errno != libc::ENOENT && !self.dryrun {
            return Err(Error::sys("stat", path));
        }
        let parent = no_end_slash(&parent_dir(path));
        if parent.len() != path.len() {
            self.ensure_dir(&parent, mode, false)?;
        }
        self.mkdir(path, mode)?;
        Ok(true)
    }

    /// Record that a directory exists without touching the filesystem
    /// (used after `mkdirat` in the ownership-chain walk).
    pub fn note_dir(&mut self, path: &str) {
        self.dirtable.insert(no_end_slash(path), 0);
    }

    pub fn chmod(&self, path: &str, mode: u32) -> Result<()> {
        self.echo(format_args!("chmod 0{mode:o} {}", shell_quote(path)));
        if !self.dryrun && unsafe { libc::chmod(cstr(path).as_ptr(), mode as libc::mode_t) } != 0 {
            return Err(Error::sys("chmod", path));
        }
        Ok(())
    }

    pub fn fchmod(&self, fd: RawFd, mode: u32, path: &str) -> Result<()> {
        self.echo(format_args!("chmod 0{mode:o} {}", shell_quote(path)));
        if !self.dryrun && unsafe { libc::fchmod(fd, mode as libc::mode_t) } != 0 {
            return Err(Error::sys("chmod", path));
        }
        Ok(())
    }

    pub fn lchown(&self, path: &str, uid: libc::uid_t, gid: libc::gid_t) -> Result<()> {
        self.echo(format_args!(
            "chown -h {}:{} {}",
            name_of_uid(uid),
            name_of_gid(gid),
            shell_quote(path)
        ));
        if !self.dryrun && unsafe { libc::lchown(cstr(path).as_ptr(), uid, gid) } != 0 {
            return Err(Error::sys("chown", path));
        }
        Ok(())
    }

    pub fn fchown(&self, fd: RawFd, uid: libc::uid_t, gid: libc::gid_t, path: &str) -> Result<()> {
        self.echo(format_args!(
            "chown -h {}:{} {}",
            name_of_uid(uid),
            name_of_gid(gid),
            shell_quote(path)
        ));
        if !self.dryrun && unsafe { libc::fchown(fd, uid, gid) } != 0 {
            return Err(Error::sys("chown", path));
        }
        Ok(())
    }

    pub fn lchown_at(
        &self,
        dirfd: RawFd,
        component: &str,
        uid: libc::uid_t,
        gid: libc::gid_t,
        display: &str,
    ) -> Result<()> {
        self.echo(format_args!(
            "chown -h {}:{} {}",
            name_of_uid(uid),
            name_of_gid(gid),
            shell_quote(display)
        ));
        if !self.dryrun
            && unsafe {
                libc::fchownat(
                    dirfd,
                    cstr(component).as_ptr(),
                    uid,
                    gid,
                    libc::AT_SYMLINK_NOFOLLOW,
                )
            } != 0
        {
            return Err(Error::sys("chown", display));
        }
        Ok(())
    }

    pub fn mkdir_at(&self, dirfd: RawFd, component: &str, mode: u32, display: &str) -> Result<()> {
        self.echo(format_args!("mkdir -m 0{mode:o} {}", shell_quote(display)));
        if !self.dryrun && unsafe { libc::mkdirat(dirfd, cstr(component).as_ptr(), mode as libc::mode_t) } != 0 {
            return Err(Error::sys("mkdir", display));
        }
        Ok(())
    }

    /// Remove `path` if it exists.
    pub fn rm_f(&self, path: &str) -> Result<()> {
        self.echo(format_args!("rm -f {}", shell_quote(path)));
        if self.dryrun {
            return Ok(());
        }
        if unsafe { libc::unlink(cstr(path).as_ptr()) } != 0 {
            let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
            if errno != libc::ENOENT {
                return Err(Error::sys("rm", path));
            }
        }
        Ok(())
    }

    /// Replace `newpath` with a hard link to `oldpath`.
    pub fn link(&self, oldpath: &str, newpath: &str) -> Result<()> {
        self.rm_f(newpath)?;
        self.echo(format_args!(
            "ln {} {}",
            shell_quote(oldpath),
            shell_quote(newpath)
        ));
        if !self.dryrun
            && unsafe { libc::link(cstr(oldpath).as_ptr(), cstr(newpath).as_ptr()) } != 0
        {
            return Err(Error::Sys {
                op: "ln",
                path: format!("{oldpath} {newpath}"),
                source: std::io::Error::last_os_error(),
            });
        }
        Ok(())
    }

    /// Create a device node or fifo; an identical existing node is fine.
    pub fn mknod(&self, path: &str, mode: u32, dev: libc::dev_t) -> Result<()> {
        self.echo(format_args!(
            "mknod -m 0{:o} {} {}",
            mode & 0o7777,
            shell_quote(path),
            dev_name(mode, dev)
        ));
        if self.dryrun {
            return Ok(());
        }
        if unsafe { libc::mknod(cstr(path).as_ptr(), mode as libc::mode_t, dev) } != 0 {
            let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
            if errno == libc::EEXIST && mknod_exist_ok(path, mode, dev) {
                return Ok(());
            }
            return Err(Error::sys("mknod", path));
        }
        Ok(())
    }

    /// Create a symlink; an identical existing link is fine.
    pub fn symlink(&self, target: &str, linkpath: &str) -> Result<()> {
        self.echo(format_args!(
            "ln -s {} {}",
            shell_quote(target),
            shell_quote(linkpath)
        ));
        if self.dryrun {
            return Ok(());
        }
        if unsafe { libc::symlink(cstr(target).as_ptr(), cstr(linkpath).as_ptr()) } != 0 {
            let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
            if errno == libc::EEXIST && symlink_exist_ok(target, linkpath) {
                return Ok(());
            }
            return Err(Error::Sys {
                op: "symlink",
                path: format!("{target} {linkpath}"),
                source: std::io::Error::from_raw_os_error(errno),
            });
        }
        Ok(())
    }

    /// Copy the source's mtime onto `path` (atime left unset), without
    /// following a symlink.
    pub fn copy_utimes(&self, path: &str, mtime_sec: i64, mtime_nsec: i64) -> Result<()> {
        self.echo(format_args!("touch -m -d @{mtime_sec} {}", shell_quote(path)));
        if self.dryrun {
            return Ok(());
        }
        #[cfg(target_os = "linux")]
        {
            let times = [
                libc::timespec {
                    tv_sec: 0,
                    tv_nsec: libc::UTIME_OMIT,
                },
                libc::timespec {
                    tv_sec: mtime_sec,
                    tv_nsec: mtime_nsec,
                },
            ];
            if unsafe {
                libc::utimensat(
                    libc::AT_FDCWD,
                    cstr(path).as_ptr(),
                    times.as_ptr(),
                    libc::AT_SYMLINK_NOFOLLOW,
                )
            } != 0
            {
                return Err(Error::sys("utimensat", path));
            }
        }
        Ok(())
    }

    /// Byte-exact preserving copy via `/bin/cp -p`.
    pub fn cp_p(&self, src: &str, dst: &str) -> Result<()> {
        self.rm_f(dst)?;
        self.echo(format_args!(
            "cp -p {} {}",
            shell_quote(src),
            shell_quote(dst)
        ));
        if self.dryrun {
            return Ok(());
        }
        let child = unsafe { libc::fork() };
        if child < 0 {
            return Err(Error::sys("fork", "/bin/cp"));
        }
        if child == 0 {
            let cp = cstr("/bin/cp");
            let dash_p = cstr("-p");
            let a = cstr(src);
            let b = cstr(dst);
            let argv = [
                cp.as_ptr(),
                dash_p.as_ptr(),
                a.as_ptr(),
                b.as_ptr(),
                std::ptr::null(),
            ];
            unsafe {
                libc::execv(cp.as_ptr(), argv.as_ptr());
                libc::_exit(1);
            }
        }
        match wait_status(child, 0) {
            (_, 0) => Ok(()),
            (_, -1) => Err(Error::msg(format!("/bin/cp {dst}: Did not exit"))),
            (_, _) => Err(Error::msg(format!("/bin/cp {dst}: Bad exit status"))),
        }
    }
}

/// `waitpid` folding exit/signal status into one value:
/// exit code for a normal exit, `128 + signo` for a signal death,
/// `-1` when nothing could be reaped.
pub fn wait_status(child: libc::pid_t, flags: i32) -> (libc::pid_t, i32) {
    let mut status = 0;
    loop {
        let w = unsafe { libc::waitpid(child, &mut status, flags) };
        if w > 0 && libc::WIFEXITED(status) {
            return (w, libc::WEXITSTATUS(status));
        } else if w > 0 {
            return (w, 128 + libc::WTERMSIG(status));
        } else if w == 0 {
            return (-1, -1);
        } else if std::io::Error::last_os_error().raw_os_error() != Some(libc::EINTR) {
            return (-1, -1);
        }
    }
}

fn mknod_exist_ok(path: &str, mode: u32, dev: libc::dev_t) -> bool {
    let mut st = unsafe { std::mem::zeroed::<libc::stat>() };
    (unsafe { libc::stat(cstr(path).as_ptr(), &mut st) == 0 })
        && u32::from(st.st_mode) == mode
        && st.st_rdev == dev
}

fn symlink_exist_ok(target: &str, linkpath: &str) -> bool {
    std::fs::read_link(linkpath)
        .map(|t| t.as_os_str() == std::ffi::OsStr::new(target))
        .unwrap_or(false)
}

fn dev_name(mode: u32, dev: libc::dev_t) -> String {
    let kind = mode & libc::S_IFMT as u32;
    if kind == libc::S_IFCHR as u32 {
        format!("c {} {}", libc::major(dev), libc::minor(dev))
    } else if kind == libc::S_IFBLK as u32 {
        format!("b {} {}", libc::major(dev), libc::minor(dev))
    } else if kind == libc::S_IFIFO as u32 {
        "p".to_string()
    } else {
        format!("{mode} {dev}")
    }
}

/// Close every fd above stderr before a `run`: nothing from the caller may
/// leak into the jail.
pub fn close_extra_fds() {
    unsafe {
        let dir = libc::opendir(cstr("/dev/fd").as_ptr());
        if dir.is_null() {
            return;
        }
        let own_fd = libc::dirfd(dir);
        loop {
            let de = libc::readdir(dir);
            if de.is_null() {
                break;
            }
            let name = CStr::from_ptr((*de).d_name.as_ptr()).to_string_lossy();
            if let Ok(fd) = name.parse::<libc::c_int>() {
                if fd > 2 && fd != own_fd {
                    libc::close(fd);
                }
            }
        }
        libc::closedir(dir);
    }
}

/// Resolve a uid to a login name for verbose output (falls back to digits).
pub fn name_of_uid(uid: libc::uid_t) -> String {
    unsafe {
        let pw = libc::getpwuid(uid);
        if pw.is_null() {
            uid.to_string()
        } else {
            CStr::from_ptr((*pw).pw_name).to_string_lossy().into_owned()
        }
    }
}

pub fn name_of_gid(gid: libc::gid_t) -> String {
    unsafe {
        let gr = libc::getgrgid(gid);
        if gr.is_null() {
            gid.to_string()
        } else {
            CStr::from_ptr((*gr).gr_name).to_string_lossy().into_owned()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_dir_creates_chain() {
        let tmp = tempfile::TempDir::new().unwrap();
        let mut ops = FsOps::new(false, false);
        let deep = format!("{}/a/b/c", tmp.path().display());
        assert!(ops.ensure_dir(&deep, 0o755, true).unwrap());
        assert!(std::fs::metadata(&deep).unwrap().is_dir());
        // second call is memoised and reports "already there"
        assert!(!ops.ensure_dir(&deep, 0o755, true).unwrap());
    }

    #[test]
    fn ensure_dir_rejects_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let file = format!("{}/f", tmp.path().display());
        std::fs::write(&file, b"x").unwrap();
        let mut ops = FsOps::new(false, false);
        assert!(ops.ensure_dir(&file, 0o755, true).is_err());
    }

    #[test]
    fn dryrun_makes_no_changes() {
        let tmp = tempfile::TempDir::new().unwrap();
        let mut ops = FsOps::new(false, true);
        let path = format!("{}/victim", tmp.path().display());
        ops.mkdir(&path, 0o755).unwrap();
        assert!(!std::path::Path::new(&path).exists());
        ops.rm_f(&format!("{}", tmp.path().display())).unwrap();
        assert!(tmp.path().exists());
    }

    #[test]
    fn symlink_idempotent() {
        let tmp = tempfile::TempDir::new().unwrap();
        let ops = FsOps::new(false, false);
        let link = format!("{}/l", tmp.path().display());
        ops.symlink("target", &link).unwrap();
        ops.symlink("target", &link).unwrap();
        assert!(ops.symlink("other", &link).is_err());
    }

    #[test]
    fn cp_p_preserves_mtime() {
        let tmp = tempfile::TempDir::new().unwrap();
        let src = format!("{}/src", tmp.path().display());
        let dst = format!("{}/dst", tmp.path().display());
        std::fs::write(&src, b"data").unwrap();
        let ops = FsOps::new(false, false);
        ops.cp_p(&src, &dst).unwrap();
        use std::os::unix::fs::MetadataExt;
        let a = std::fs::metadata(&src).unwrap();
        let b = std::fs::metadata(&dst).unwrap();
        assert_eq!(a.mtime(), b.mtime());
        assert_eq!(b.size(), 4);
    }
}
