//! Jail directory validation and whole-tree operations.
//!
//! `JailDir::resolve` walks the requested path component by component with
//! `openat(O_PATH | O_NOFOLLOW)`, never following symlinks, and checks the
//! administrative invariant: every ancestor outside the policy tree root
//! must be owned by root and not writable by anyone else. Components below
//! the tree root may be created on the fly for `add`/`run`. The final
//! parent directory fd is kept open so later renames and opens are immune
//! to concurrent path swaps.

use std::collections::HashMap;
use std::ffi::CStr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use crate::error::{Error, Result};
use crate::fsops::FsOps;
use crate::mounts::{DstState, MountPlanner};
use crate::paths::{absolute, check_filename, cstr, end_slash};
use crate::policy::Policy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JailAction {
    Add,
    Run,
    Rm,
    Mv,
}

#[cfg(any(target_os = "linux", target_os = "android"))]
const O_PATH: libc::c_int = libc::O_PATH;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const O_PATH: libc::c_int = 0;

pub struct JailDir {
    /// Absolute jail path, slash-terminated.
    pub dir: String,
    pub parent: String,
    pub component: String,
    parent_fd: Option<OwnedFd>,
    /// Slash-terminated policy tree root enclosing the jail.
    pub tree_dir: String,
    pub dev: libc::dev_t,
    /// Validated skeleton directory (slash-terminated).
    pub skeleton: Option<String>,
}

impl JailDir {
    /// Validate and (for `add`/`run`) create the jail directory path.
    /// Returns `Ok(None)` only for `rm --force` on a missing jail.
    pub fn resolve(
        raw: &str,
        skeleton: Option<&str>,
        action: JailAction,
        force: bool,
        policy: &Policy,
        ops: &mut FsOps,
    ) -> Result<Option<JailDir>> {
        let dir = check_filename(&absolute(raw))
            .filter(|d| d.as_str() != "/" && d.starts_with('/'))
            .ok_or_else(|| Error::msg(format!("{raw}: Bad characters in filename")))?;
        let dir = end_slash(&dir);

        let decision = policy.allow_jail(&dir);
        if !decision.allowed {
            return Err(Error::Policy {
                path: dir.clone(),
                message: format!(
                    "Jail disabled by {}\n{}",
                    crate::policy::CONFIG_PATH,
                    decision.disable_message()
                ),
            });
        }
        let tree_dir = decision.tree_dir;

        let skeleton = match skeleton {
            None => None,
            Some(s) => {
                let sdir = end_slash(&absolute(s));
                let sdec = policy.allow_skeleton(&sdir);
                if !sdec.allowed {
                    return Err(Error::Policy {
                        path: sdir,
                        message: format!(
                            "Skeleton disabled by {}\n{}",
                            crate::policy::CONFIG_PATH,
                            sdec.disable_message()
                        ),
                    });
                }
                Some(sdir)
            }
        };

        let mut parent = String::new();
        let mut component = String::new();
        let mut parent_fd: Option<OwnedFd> = None;
        let mut fd: Option<OwnedFd> = None;
        let mut dev: libc::dev_t = 0;
        let mut dry_creating = false;

        let bytes = dir.as_bytes();
        let mut last_pos = 0usize;
        while last_pos != dir.len() {
            let mut next_pos = last_pos;
            while next_pos != 0 && next_pos < dir.len() && bytes[next_pos] != b'/' {
                next_pos += 1;
            }
            if next_pos == 0 {
                next_pos = 1; // leading "/" is its own component
            }
            parent = dir[..last_pos].to_string();
            component = dir[last_pos..next_pos].to_string();
            let thisdir = &dir[..next_pos];
            last_pos = next_pos;
            while last_pos != dir.len() && bytes[last_pos] == b'/' {
                last_pos += 1;
            }
            let is_last = last_pos == dir.len();

            // below the tree root, missing directories may be created
            let allowed_here =
                !tree_dir.is_empty() && last_pos >= tree_dir.len() && dir.starts_with(&tree_dir);

            parent_fd = fd.take();
            let pfd_raw = parent_fd.as_ref().map(|f| f.as_raw_fd()).unwrap_or(-1);
            let mut this_fd = open_at(pfd_raw, &component, O_PATH);
            let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);

            if this_fd.is_none() && !allowed_here && errno == libc::ENOENT {
                break;
            }
            if (this_fd.is_none() && dry_creating)
                || (this_fd.is_none()
                    && allowed_here
                    && errno == libc::ENOENT
                    && matches!(action, JailAction::Add | JailAction::Run))
            {
                ops.mkdir_at(pfd_raw, &component, 0o755, thisdir)?;
                ops.note_dir(thisdir);
                this_fd = open_at(pfd_raw, &component, 0);
                if is_last && (this_fd.is_some() || ops.dryrun) {
                    // strip any inherited setuid/setgid from the new root
                    let raw = this_fd.as_ref().map(|f| f.as_raw_fd()).unwrap_or(-1);
                    ops.fchmod(raw, 0o755, thisdir)?;
                }
                if ops.dryrun {
                    dry_creating = true;
                    continue;
                }
            }
            let this_fd = match this_fd {
                Some(f) => f,
                None if errno == libc::ENOENT && action == JailAction::Rm && force => {
                    return Ok(None);
                }
                None => return Err(Error::path(thisdir)),
            };

            let st = fstat(this_fd.as_raw_fd(), thisdir)?;
            if st.st_mode & libc::S_IFMT != libc::S_IFDIR {
                return Err(Error::Path {
                    path: thisdir.into(),
                    source: std::io::Error::from_raw_os_error(libc::ENOTDIR),
                });
            }
            if !allowed_here && !is_last {
                if st.st_uid != 0 {
                    return Err(Error::msg(format!("{thisdir}: Not owned by root")));
                }
                if (st.st_gid != 0 && st.st_mode & 0o020 != 0) || st.st_mode & 0o002 != 0 {
                    return Err(Error::msg(format!("{thisdir}: Writable by non-root")));
                }
            }
            dev = st.st_dev;
            fd = Some(this_fd);
        }

        Ok(Some(JailDir {
            dir,
            parent,
            component,
            parent_fd,
            tree_dir,
            dev,
            skeleton,
        }))
    }

    pub fn parent_fd(&self) -> RawFd {
        self.parent_fd.as_ref().map(|f| f.as_raw_fd()).unwrap_or(-1)
    }

    pub fn close_parent(&mut self) {
        self.parent_fd = None;
    }

    /// Recursively chown `JD/home`, mapping `/home/<name>` entries back to
    /// the host account that owns them.
    pub fn chown_home(&self, ops: &FsOps, planner: &mut MountPlanner) -> Result<()> {
        planner.populate()?;
        let mut dirbuf = format!("{}home/", self.dir);
        let rel = format!("{}/home", self.component);
        let fd = open_at(self.parent_fd(), &rel, 0).ok_or_else(|| Error::path(&dirbuf))?;
        let st = fstat(fd.as_raw_fd(), &dirbuf)?;
        let home_map = host_home_map();
        chown_tree(
            ops,
            planner,
            fd,
            &mut dirbuf,
            0,
            0,
            Some(&home_map),
            st.st_dev,
        )
    }

    /// Recursively chown an approved subdirectory to `uid:gid`.
    pub fn chown_user_dir(
        &self,
        ops: &FsOps,
        planner: &mut MountPlanner,
        dir: &str,
        uid: libc::uid_t,
        gid: libc::gid_t,
    ) -> Result<()> {
        planner.populate()?;
        let mut dirbuf = end_slash(dir);
        let fd = open_at(-1, &crate::paths::no_end_slash(dir), 0)
            .ok_or_else(|| Error::path(&dirbuf))?;
        let st = fstat(fd.as_raw_fd(), &dirbuf)?;
        ops.fchown(fd.as_raw_fd(), uid, gid, &dirbuf)?;
        chown_tree(ops, planner, fd, &mut dirbuf, uid, gid, None, st.st_dev)
    }

    /// Remove the jail tree (one file system; skips subtrees dry-run-marked
    /// as unmounted).
    pub fn remove(&self, ops: &FsOps, planner: &MountPlanner) -> Result<()> {
        remove_tree(
            ops,
            planner,
            self.parent_fd(),
            &self.component,
            &self.dir,
            self.dev,
        )
    }

    /// `mv`: rename the jail to `newpath` (same parent fd semantics as the
    /// original rename).
    pub fn rename_to(&self, ops: &FsOps, newpath: &str) -> Result<()> {
        ops.echo(format_args!(
            "mv {}{} {}",
            self.parent,
            self.component,
            crate::paths::shell_quote(newpath)
        ));
        if ops.dryrun {
            return Ok(());
        }
        let r = unsafe {
            libc::renameat(
                self.parent_fd(),
                cstr(&self.component).as_ptr(),
                self.parent_fd(),
                cstr(newpath).as_ptr(),
            )
        };
        if r != 0 {
            return Err(Error::Sys {
                op: "mv",
                path: format!("{}{} {}", self.parent, self.component, newpath),
                source: std::io::Error::last_os_error(),
            });
        }
        Ok(())
    }
}

fn open_at(dirfd: RawFd, path: &str, extra_flags: libc::c_int) -> Option<OwnedFd> {
    let fd = unsafe {
        libc::openat(
            dirfd,
            cstr(path).as_ptr(),
            extra_flags | libc::O_CLOEXEC | libc::O_NOFOLLOW,
        )
    };
    (fd >= 0).then(|| unsafe { OwnedFd::from_raw_fd(fd) })
}

fn fstat(fd: RawFd, path: &str) -> Result<libc::stat> {
    let mut st = unsafe { std::mem::zeroed::<libc::stat>() };
    if unsafe { libc::fstat(fd, &mut st) } != 0 {
        return Err(Error::path(path));
    }
    Ok(st)
}

/// Host accounts by home-directory leaf name (or login name), for
/// `--chown-home`.
fn host_home_map() -> HashMap<String, (libc::uid_t, libc::gid_t)> {
    let mut map = HashMap::new();
    unsafe {
        libc::setpwent();
        loop {
            let pw = libc::getpwent();
            if pw.is_null() {
                break;
            }
            let pw_dir = CStr::from_ptr((*pw).pw_dir).to_string_lossy().into_owned();
            let pw_name = CStr::from_ptr((*pw).pw_name).to_string_lossy().into_owned();
            let name = match pw_dir.strip_prefix("/home/") {
                Some(leaf) if !leaf.is_empty() && !leaf.contains('/') => leaf.to_string(),
                _ => pw_name,
            };
            map.insert(name, ((*pw).pw_uid, (*pw).pw_gid));
        }
        libc::endpwent();
    }
    map
}

/// Recursive chown over an open directory fd. Stays on `dev`, never follows
/// symlinks, and skips mount points.
#[allow(clippy::too_many_arguments)]
fn chown_tree(
    ops: &FsOps,
    planner: &MountPlanner,
    dirfd: OwnedFd,
    dirbuf: &mut String,
    uid: libc::uid_t,
    gid: libc::gid_t,
    home_map: Option<&HashMap<String, (libc::uid_t, libc::gid_t)>>,
    dev: libc::dev_t,
) -> Result<()> {
    *dirbuf = end_slash(dirbuf);
    let dirbuf_len = dirbuf.len();

    let dir = unsafe { libc::fdopendir(dirfd.as_raw_fd()) };
    if dir.is_null() {
        return Err(Error::path(dirbuf.as_str()));
    }
    // fdopendir took ownership of the fd
    std::mem::forget(dirfd);

    let result = (|| {
        loop {
            let de = unsafe { libc::readdir(dir) };
            if de.is_null() {
                break;
            }
            let name = unsafe { CStr::from_ptr((*de).d_name.as_ptr()) }
                .to_string_lossy()
                .into_owned();
            if name == "." || name == ".." {
                continue;
            }
            let d_type = unsafe { (*de).d_type };
            let display = format!("{dirbuf}{name}");
            let raw_dirfd = unsafe { libc::dirfd(dir) };

            if d_type == libc::DT_LNK {
                ops.lchown_at(raw_dirfd, &name, uid, gid, &display)?;
                continue;
            }

            let (u, g) = home_map
                .and_then(|m| m.get(&name).copied())
                .unwrap_or((uid, gid));

            if d_type == libc::DT_DIR {
                dirbuf.push_str(&name);
                if planner.slot(dirbuf).is_none() {
                    // not a mount point
                    let sub = open_at(raw_dirfd, &name, 0)
                        .ok_or_else(|| Error::path(dirbuf.as_str()))?;
                    let st = fstat(sub.as_raw_fd(), dirbuf)?;
                    if st.st_dev == dev {
                        ops.fchown(sub.as_raw_fd(), u, g, dirbuf)?;
                        chown_tree(ops, planner, sub, dirbuf, u, g, None, dev)?;
                    }
                }
                dirbuf.truncate(dirbuf_len);
            } else {
                ops.lchown_at(raw_dirfd, &name, u, g, &display)?;
            }
        }
        Ok(())
    })();
    unsafe { libc::closedir(dir) };
    result
}

/// Recursive removal over dir fds: `rm -r --one-file-system`.
fn remove_tree(
    ops: &FsOps,
    planner: &MountPlanner,
    parent_fd: RawFd,
    component: &str,
    dirname: &str,
    dev: libc::dev_t,
) -> Result<()> {
    if planner.dst_table.get(dirname) == Some(&DstState::Unmounted) {
        return Ok(()); // dry-run already unmounted this subtree
    }

    let dirfd = open_at(parent_fd, component, 0).ok_or_else(|| Error::path(dirname))?;
    let st = fstat(dirfd.as_raw_fd(), dirname)?;
    if st.st_dev != dev {
        return Ok(()); // different filesystem
    }

    let dirname = end_slash(dirname);
    let dir = unsafe { libc::fdopendir(dirfd.as_raw_fd()) };
    if dir.is_null() {
        return Err(Error::path(dirname.as_str()));
    }
    std::mem::forget(dirfd);

    let result = (|| {
        loop {
            let de = unsafe { libc::readdir(dir) };
            if de.is_null() {
                break;
            }
            let name = unsafe { CStr::from_ptr((*de).d_name.as_ptr()) }
                .to_string_lossy()
                .into_owned();
            if name == "." || name == ".." {
                continue;
            }
            let d_type = unsafe { (*de).d_type };
            let raw_dirfd = unsafe { libc::dirfd(dir) };
            let child = format!("{dirname}{name}");
            if d_type == libc::DT_DIR {
                remove_tree(ops, planner, raw_dirfd, &name, &child, dev)?;
            } else {
                ops.echo(format_args!("rm {child}"));
                if !ops.dryrun
                    && unsafe { libc::unlinkat(raw_dirfd, cstr(&name).as_ptr(), 0) } != 0
                {
                    return Err(Error::sys("rm", child));
                }
            }
        }
        Ok(())
    })();
    unsafe { libc::closedir(dir) };
    result?;

    let display = crate::paths::no_end_slash(&dirname);
    ops.echo(format_args!("rmdir {display}"));
    if !ops.dryrun
        && unsafe { libc::unlinkat(parent_fd, cstr(component).as_ptr(), libc::AT_REMOVEDIR) } != 0
    {
        return Err(Error::sys("rmdir", display));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mounts::MountPhase;

    // `treedir /` keeps the root-ownership checks off the temp-dir ancestry
    fn policy_for(tmp: &std::path::Path) -> Policy {
        Policy::from_text(&format!("enablejail {}/*\ntreedir /\n", tmp.display()))
    }

    #[test]
    fn resolve_creates_jail_under_tree_root() {
        let tmp = tempfile::TempDir::new().unwrap();
        let policy = policy_for(tmp.path());
        let mut ops = FsOps::new(false, false);
        let raw = format!("{}/j1", tmp.path().display());
        let jail = JailDir::resolve(&raw, None, JailAction::Add, false, &policy, &mut ops)
            .unwrap()
            .unwrap();
        assert_eq!(jail.dir, format!("{raw}/"));
        assert!(std::fs::metadata(&raw).unwrap().is_dir());
        use std::os::unix::fs::MetadataExt;
        assert_eq!(std::fs::metadata(&raw).unwrap().mode() & 0o7777, 0o755);
        assert_eq!(jail.component, "j1");
    }

    #[test]
    fn resolve_rejects_denied_path() {
        let tmp = tempfile::TempDir::new().unwrap();
        let policy = Policy::from_text("enablejail /nowhere/*\n");
        let mut ops = FsOps::new(false, false);
        let raw = format!("{}/j1", tmp.path().display());
        let err = JailDir::resolve(&raw, None, JailAction::Add, false, &policy, &mut ops)
            .err()
            .expect("should be denied");
        assert!(err.to_string().contains("Jail disabled"));
    }

    #[test]
    fn resolve_rejects_bad_names() {
        let policy = Policy::from_text("enablejail /jails/*\n");
        let mut ops = FsOps::new(false, false);
        for bad in ["/jails/../etc", "/jails/a b"] {
            assert!(
                JailDir::resolve(bad, None, JailAction::Add, false, &policy, &mut ops).is_err()
            );
        }
    }

    #[test]
    fn force_rm_of_missing_jail_is_none() {
        let tmp = tempfile::TempDir::new().unwrap();
        let policy = policy_for(tmp.path());
        let mut ops = FsOps::new(false, false);
        let raw = format!("{}/gone", tmp.path().display());
        let r = JailDir::resolve(&raw, None, JailAction::Rm, true, &policy, &mut ops).unwrap();
        assert!(r.is_none());
    }

    #[test]
    fn remove_deletes_tree() {
        let tmp = tempfile::TempDir::new().unwrap();
        let policy = policy_for(tmp.path());
        let mut ops = FsOps::new(false, false);
        let raw = format!("{}/j2", tmp.path().display());
        std::fs::create_dir_all(format!("{raw}/sub/deeper")).unwrap();
        std::fs::write(format!("{raw}/sub/file"), b"x").unwrap();
        let jail = JailDir::resolve(&raw, None, JailAction::Rm, false, &policy, &mut ops)
            .unwrap()
            .unwrap();
        let planner = MountPlanner::new(MountPhase::Add);
        jail.remove(&ops, &planner).unwrap();
        assert!(!std::path::Path::new(&raw).exists());
    }
}
