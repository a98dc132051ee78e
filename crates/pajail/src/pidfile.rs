//! Pidfile handling: advisory lock plus `$$`-expanded contents.

use std::os::fd::RawFd;

use crate::error::{Error, Result};
use crate::paths::cstr;

/// An open, exclusively-locked pidfile. The lock is held for the lifetime
/// of the run; competing invocations block on it.
pub struct PidFile {
    fd: RawFd,
    path: String,
    template: String,
}

impl PidFile {
    /// Open (creating if needed) and lock the pidfile, then write the
    /// placeholder contents. `template` has `$$` replaced by the child pid
    /// once one exists; until then the file holds `*`.
    pub fn open(path: &str, template: &str) -> Result<PidFile> {
        let fd = unsafe {
            libc::open(
                cstr(path).as_ptr(),
                libc::O_WRONLY | libc::O_CLOEXEC | libc::O_CREAT,
                0o666,
            )
        };
        if fd < 0 {
            return Err(Error::path(path));
        }
        let pf = PidFile {
            fd,
            path: path.to_string(),
            template: template.to_string(),
        };
        loop {
            if unsafe { libc::flock(fd, libc::LOCK_EX) } == 0 {
                break;
            }
            let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
            if errno != libc::EINTR {
                let _ = pf.write_placeholder();
                return Err(Error::path(path));
            }
        }
        pf.write_placeholder()?;
        Ok(pf)
    }

    pub fn write_placeholder(&self) -> Result<()> {
        self.write_raw("*")
    }

    /// Record the child pid using the `$$` template.
    pub fn write_pid(&self, pid: libc::pid_t) -> Result<()> {
        let mut out = String::with_capacity(self.template.len() + 8);
        let mut rest = self.template.as_str();
        while let Some(i) = rest.find("$$") {
            out.push_str(&rest[..i]);
            out.push_str(&pid.to_string());
            rest = &rest[i + 2..];
        }
        out.push_str(rest);
        self.write_raw(&out)
    }

    fn write_raw(&self, contents: &str) -> Result<()> {
        let mut line = contents.to_string();
        if !line.ends_with('\n') {
            line.push('\n');
        }
        unsafe {
            libc::lseek(self.fd, 0, libc::SEEK_SET);
            let nw = libc::write(self.fd, line.as_ptr().cast::<libc::c_void>(), line.len());
            if nw != line.len() as isize || libc::ftruncate(self.fd, nw as libc::off_t) != 0 {
                return Err(Error::path(&self.path));
            }
        }
        Ok(())
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholder_then_pid() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = format!("{}/pid", tmp.path().display());
        let pf = PidFile::open(&path, "$$").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "*\n");
        pf.write_pid(4242).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "4242\n");
    }

    #[test]
    fn template_expansion_and_truncation() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = format!("{}/pid", tmp.path().display());
        let pf = PidFile::open(&path, "child $$ of $$\n").unwrap();
        pf.write_pid(7).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "child 7 of 7\n");
        // shorter contents truncate what was there before
        pf.write_placeholder().unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "*\n");
    }
}
