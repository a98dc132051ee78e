//! Path materialization: reproducing host paths inside the jail.
//!
//! The materializer executes a parsed manifest against a destination root,
//! preserving file type, mode, ownership and mtime. Regular files are
//! hard-linked when an already-materialized copy shares the same host
//! `(dev, ino)`; with a skeleton configured, the copy is first produced in
//! the skeleton tree so the jail (and every later jail) links out of it.
//! Symlinks are recreated verbatim and their targets queued as implicit
//! copies. Re-running with unchanged inputs performs no filesystem writes.
//!
//! Per-entry failures are reported on stderr and materialization continues;
//! the run as a whole then fails, before any program is launched.

use std::collections::HashMap;
use std::os::unix::fs::MetadataExt;

use crate::error::{Error, Result};
use crate::fsops::FsOps;
use crate::manifest::{self, Entry, EntryKind};
use crate::mounts::{DstState, MountPlanner, MountSlot};
use crate::paths::{end_slash, no_end_slash, parent_dir, shell_quote};

const BINDTAG_FILE: &str = ".pa-jail-bindtag";

pub struct Materializer<'a> {
    pub ops: &'a mut FsOps,
    pub planner: &'a mut MountPlanner,
    /// Jail root, no trailing slash.
    dstroot: String,
    /// Skeleton root, no trailing slash.
    linkdir: Option<String>,
    /// Host `(dev, ino)` of already-materialized regular files.
    devino: HashMap<(u64, u64), String>,
    /// Last ensured destination parent (cheap repeat-entry optimization).
    last_parent: String,
    failed: bool,
}

impl<'a> Materializer<'a> {
    pub fn new(
        ops: &'a mut FsOps,
        planner: &'a mut MountPlanner,
        dstroot: &str,
        linkdir: Option<&str>,
    ) -> Materializer<'a> {
        Materializer {
            ops,
            planner,
            dstroot: no_end_slash(dstroot),
            linkdir: linkdir.map(no_end_slash),
            devino: HashMap::new(),
            last_parent: String::new(),
            failed: false,
        }
    }

    /// Execute `text` against the destination root. `nomount` suppresses
    /// mount handling (bind-source re-materialization runs this way).
    pub fn construct(&mut self, text: &str, nomount: bool) -> Result<()> {
        self.ops.chmod(&self.dstroot, 0o755)?;
        if unsafe { libc::geteuid() } == 0 {
            self.ops.lchown(&self.dstroot, 0, 0)?;
        }
        self.planner
            .dst_table
            .insert(end_slash(&self.dstroot), DstState::Copied);
        self.planner.populate()?;

        for entry in manifest::parse(text)? {
            if let Err(err) = self.apply(&entry, nomount) {
                eprintln!("{err}");
                self.failed = true;
            }
        }
        if self.failed {
            Err(Error::msg(format!("{}: Jail construction failed", self.dstroot)))
        } else {
            Ok(())
        }
    }

    fn apply(&mut self, entry: &Entry, nomount: bool) -> Result<()> {
        match &entry.kind {
            EntryKind::Copy => self.handle_copy(&entry.src, &entry.dst, false),
            EntryKind::CopyNoLink => self.handle_copy(&entry.src, &entry.dst, true),
            EntryKind::Bind { read_only, tag } => {
                if nomount {
                    return Ok(());
                }
                if let Some((tag, files)) = tag {
                    self.refresh_bind_source(&entry.src, tag, files)?;
                }
                let opts = if *read_only {
                    "bind,rec,unbindable,ro"
                } else {
                    "bind,rec,unbindable"
                };
                self.planner
                    .insert_wanted(&entry.src, MountSlot::new(&entry.src, "none", opts));
                let dst = format!("{}{}", self.dstroot, entry.dst);
                self.ops.ensure_dir(&dst, 0o555, true)?;
                self.planner.handle_mount(self.ops, &entry.src, &dst)
            }
            EntryKind::Mount { fstype, args } => {
                if nomount {
                    return Ok(());
                }
                self.planner
                    .insert_wanted(&entry.src, MountSlot::new(&entry.src, fstype, args));
                let dst = format!("{}{}", self.dstroot, entry.dst);
                self.ops.ensure_dir(&dst, 0o555, true)?;
                self.planner.handle_mount(self.ops, &entry.src, &dst)
            }
        }
    }

    /// Mirror host path `src` at jail subpath `subdst`.
    fn handle_copy(&mut self, src: &str, subdst: &str, no_link: bool) -> Result<()> {
        debug_assert!(subdst.starts_with('/'));
        // a trailing slash would make lstat follow a symlink
        let src = no_end_slash(src);
        let subdst = no_end_slash(subdst);

        let dst = format!("{}{}", self.dstroot, subdst);
        if self.planner.dst_table.contains_key(&dst) {
            return Ok(());
        }
        self.planner.dst_table.insert(dst.clone(), DstState::Copied);

        // materialize the parent first (memoised on the last parent seen)
        let dst_parent = no_end_slash(&parent_dir(&dst));
        if dst_parent != self.last_parent && dst_parent.len() > self.dstroot.len() {
            self.last_parent = dst_parent.clone();
            if !self.planner.dst_table.contains_key(&dst_parent) {
                self.handle_copy(
                    &no_end_slash(&parent_dir(&src)),
                    &dst_parent[self.dstroot.len()..],
                    false,
                )?;
            }
        }

        let ss = match std::fs::symlink_metadata(&src) {
            Ok(m) => m,
            Err(e) => {
                return Err(Error::Sys {
                    op: "lstat",
                    path: src.clone(),
                    source: e,
                })
            }
        };

        // produce the shared skeleton copy first so the jail links to it
        if let Some(linkdir) = self.linkdir.clone() {
            let skel_dst = format!("{linkdir}{subdst}");
            let _ = self.do_copy(&skel_dst, &src, &ss, true);
        }

        self.do_copy(&dst, &src, &ss, !no_link)?;

        if ss.is_dir() {
            return self.planner.handle_mount(self.ops, &src, &dst);
        }
        Ok(())
    }

    /// Copy one filesystem object. `reuse_link` allows hard-linking to an
    /// already-materialized file with the same host `(dev, ino)`.
    fn do_copy(
        &mut self,
        dst: &str,
        src: &str,
        ss: &std::fs::Metadata,
        reuse_link: bool,
    ) -> Result<()> {
        let kind = ss.mode() & libc::S_IFMT as u32;

        // unchanged destination: count it and leave it alone
        if let Ok(ds) = std::fs::symlink_metadata(dst) {
            let sized = kind == libc::S_IFREG as u32 || kind == libc::S_IFLNK as u32;
            let deviced = kind == libc::S_IFCHR as u32 || kind == libc::S_IFBLK as u32;
            if ss.mode() == ds.mode()
                && ss.uid() == ds.uid()
                && ss.gid() == ds.gid()
                && (!sized || ss.size() == ds.size())
                && (!deviced || ss.rdev() == ds.rdev())
                && (!sized || (ss.mtime() == ds.mtime() && ss.mtime_nsec() == ds.mtime_nsec()))
            {
                if kind == libc::S_IFREG as u32 {
                    self.devino.insert((ss.dev(), ss.ino()), dst.to_string());
                }
                return Ok(());
            }
        }

        if kind == libc::S_IFREG as u32 {
            if reuse_link {
                let key = (ss.dev(), ss.ino());
                if let Some(existing) = self.devino.get(&key) {
                    return self.ops.link(&existing.clone(), dst);
                }
                self.devino.insert(key, dst.to_string());
            }
            self.ops.cp_p(src, dst)?;
        } else if kind == libc::S_IFDIR as u32 {
            let perm = ss.mode() & 0o7777;
            match std::fs::symlink_metadata(dst) {
                Ok(ds) if !ds.is_dir() => {
                    return Err(Error::Path {
                        path: dst.into(),
                        source: std::io::Error::from_raw_os_error(libc::ENOTDIR),
                    });
                }
                Ok(_) => {} // present with differing metadata; ownership fixed below
                Err(_) => self.ops.mkdir(dst, perm)?,
            }
        } else if kind == libc::S_IFCHR as u32 || kind == libc::S_IFBLK as u32 || kind == libc::S_IFIFO as u32 {
            self.ops.rm_f(dst)?;
            if src == "/dev/ptmx" {
                // the jail gets its own devpts instance
                return self.ops.symlink("pts/ptmx", dst);
            }
            let mode = ss.mode() & (libc::S_IFMT as u32 | 0o7777);
            self.ops.mknod(dst, mode, ss.rdev() as libc::dev_t)?;
        } else if kind == libc::S_IFLNK as u32 {
            self.ops.rm_f(dst)?;
            let target = std::fs::read_link(src).map_err(|e| Error::Sys {
                op: "readlink",
                path: src.into(),
                source: e,
            })?;
            let target = target.to_string_lossy().into_owned();
            if target.len() >= 4096 {
                return Err(Error::msg(format!("{src}: Symbolic link too long")));
            }
            self.ops.symlink(&target, dst)?;
            self.ops.copy_utimes(dst, ss.mtime(), ss.mtime_nsec())?;
            self.queue_symlink_target(dst, src, &target)?;
        } else {
            return Err(Error::msg(format!("{src}: Odd file type")));
        }

        if ss.uid() != 0 || ss.gid() != 0 {
            self.ops.lchown(dst, ss.uid(), ss.gid())?;
        }
        Ok(())
    }

    /// A recreated symlink needs its target inside the jail too. Absolute
    /// targets re-root under the jail (or the skeleton when the link itself
    /// was a skeleton copy); relative targets strip one trailing component
    /// from source and destination per `../` segment. Targets under `/proc/`
    /// are skipped, and an unresolvable walk skips the entry silently.
    fn queue_symlink_target(&mut self, dst: &str, src: &str, target: &str) -> Result<()> {
        let mut root = self.dstroot.clone();
        if let Some(linkdir) = &self.linkdir {
            if !dst.starts_with(&self.dstroot) {
                root = linkdir.clone();
            }
        }

        let (src, dst) = if target.starts_with('/') {
            (target.to_string(), format!("{root}{target}"))
        } else {
            let mut src = src.to_string();
            let mut dst = dst.to_string();
            let mut lnk = target;
            loop {
                if src.len() == 1 {
                    return Ok(()); // nothing left to strip
                }
                let srcslash = src[..src.len() - 1].rfind('/');
                let dstslash = dst[..dst.len() - 1].rfind('/');
                let (Some(srcslash), Some(dstslash)) = (srcslash, dstslash) else {
                    return Ok(());
                };
                if dstslash < root.len() {
                    return Ok(()); // would climb above the jail root
                }
                src.truncate(srcslash + 1);
                dst.truncate(dstslash + 1);
                match lnk.strip_prefix("../") {
                    Some(rest) if !rest.is_empty() => lnk = rest,
                    _ => break,
                }
            }
            (format!("{src}{lnk}"), format!("{dst}{lnk}"))
        };

        if dst.len() > root.len() && !dst[root.len()..].starts_with("/proc/") {
            // handle_copy materializes into both jail and skeleton trees
            let subdst = dst[root.len()..].to_string();
            return self.handle_copy(&src, &subdst, false);
        }
        Ok(())
    }

    /// Bind sources carry a tag file; when the tag differs from what the
    /// manifest wants, the source is re-materialized from its own manifest
    /// and the tag rewritten.
    fn refresh_bind_source(&mut self, src: &str, want_tag: &str, files: &str) -> Result<()> {
        let tagpath = format!("{}{BINDTAG_FILE}", end_slash(src));
        self.ops.echo(format_args!(
            "test {} = `cat {}`",
            shell_quote(want_tag),
            shell_quote(&tagpath)
        ));
        let got_tag = std::fs::read_to_string(&tagpath).unwrap_or_default();
        if got_tag.trim_end() == want_tag {
            return Ok(());
        }

        let contents = std::fs::read_to_string(files).map_err(|e| Error::Path {
            path: files.into(),
            source: e,
        })?;
        let saved_root = std::mem::replace(&mut self.dstroot, no_end_slash(src));
        let saved_parent = std::mem::take(&mut self.last_parent);
        let saved_failed = std::mem::replace(&mut self.failed, false);
        let r = self.construct(&contents, true);
        self.dstroot = saved_root;
        self.last_parent = saved_parent;
        self.failed |= saved_failed;
        r?;

        self.ops.echo(format_args!(
            "echo {} > {}",
            shell_quote(want_tag),
            shell_quote(&tagpath)
        ));
        if !self.ops.dryrun {
            let fd = unsafe {
                libc::open(
                    crate::paths::cstr(&tagpath).as_ptr(),
                    libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC | libc::O_NOFOLLOW,
                    0o600,
                )
            };
            if fd < 0 {
                return Err(Error::path(&tagpath));
            }
            let line = format!("{want_tag}\n");
            let nw = unsafe {
                libc::write(fd, line.as_ptr().cast::<libc::c_void>(), line.len())
            };
            unsafe { libc::close(fd) };
            if nw != line.len() as isize {
                return Err(Error::path(&tagpath));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mounts::MountPhase;
    use std::os::unix::fs::symlink;

    struct Fixture {
        _tmp: tempfile::TempDir,
        src: String,
        jail: String,
        skel: String,
    }

    // Under the crate dir rather than /tmp: a tmpfs /tmp would put the
    // jail's `/tmp` parent into the mount decision table.
    fn fixture() -> Fixture {
        let tmp = tempfile::Builder::new()
            .prefix("pajail-mat-")
            .tempdir_in(env!("CARGO_MANIFEST_DIR"))
            .unwrap();
        let base = tmp.path().to_string_lossy().into_owned();
        let f = Fixture {
            src: format!("{base}/host"),
            jail: format!("{base}/jail"),
            skel: format!("{base}/skel"),
            _tmp: tmp,
        };
        std::fs::create_dir_all(format!("{}/bin", f.src)).unwrap();
        std::fs::create_dir_all(&f.jail).unwrap();
        std::fs::write(format!("{}/bin/tool", f.src), b"#!/bin/sh\nexit 0\n").unwrap();
        f
    }

    fn materialize(f: &Fixture, manifest: &str, skel: bool) {
        let mut ops = FsOps::new(false, false);
        let mut planner = MountPlanner::new(MountPhase::Add);
        let skel_root = skel.then(|| f.skel.clone());
        if skel {
            std::fs::create_dir_all(&f.skel).unwrap();
        }
        let mut m = Materializer::new(&mut ops, &mut planner, &f.jail, skel_root.as_deref());
        m.construct(manifest, false).unwrap();
    }

    #[test]
    fn copies_file_with_metadata() {
        let f = fixture();
        let manifest = format!("/bin/tool <- {}/bin/tool\n", f.src);
        materialize(&f, &manifest, false);

        let host = std::fs::metadata(format!("{}/bin/tool", f.src)).unwrap();
        let copy = std::fs::metadata(format!("{}/bin/tool", f.jail)).unwrap();
        assert_eq!(host.size(), copy.size());
        assert_eq!(host.mode(), copy.mode());
        assert_eq!(host.mtime(), copy.mtime());
        assert_eq!(host.mtime_nsec(), copy.mtime_nsec());
    }

    #[test]
    fn parents_inherit_host_modes() {
        let f = fixture();
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(
            format!("{}/bin", f.src),
            std::fs::Permissions::from_mode(0o750),
        )
        .unwrap();
        let manifest = format!("{}/:\nbin/tool\n", f.src);
        materialize(&f, &manifest, false);
        let bin = std::fs::metadata(format!("{}{}/bin", f.jail, f.src)).unwrap();
        assert_eq!(bin.mode() & 0o7777, 0o750);
    }

    #[test]
    fn rerun_is_idempotent() {
        let f = fixture();
        let manifest = format!("/bin/tool <- {}/bin/tool\n", f.src);
        materialize(&f, &manifest, false);
        let first = std::fs::metadata(format!("{}/bin/tool", f.jail)).unwrap();

        materialize(&f, &manifest, false);
        let second = std::fs::metadata(format!("{}/bin/tool", f.jail)).unwrap();
        // same inode: the file was not copied again
        assert_eq!(first.ino(), second.ino());
        assert_eq!(first.mtime_nsec(), second.mtime_nsec());
    }

    #[test]
    fn skeleton_copy_shares_inode() {
        let f = fixture();
        let manifest = format!("/bin/tool <- {}/bin/tool\n", f.src);
        materialize(&f, &manifest, true);

        let jail = std::fs::metadata(format!("{}/bin/tool", f.jail)).unwrap();
        let skel = std::fs::metadata(format!("{}/bin/tool", f.skel)).unwrap();
        assert_eq!(jail.ino(), skel.ino(), "jail should hard-link the skeleton");

        // a second jail links from the same skeleton file
        let jail2 = format!("{}2", f.jail);
        std::fs::create_dir_all(&jail2).unwrap();
        let mut ops = FsOps::new(false, false);
        let mut planner = MountPlanner::new(MountPhase::Add);
        let mut m = Materializer::new(&mut ops, &mut planner, &jail2, Some(&f.skel));
        m.construct(&manifest, false).unwrap();
        let second = std::fs::metadata(format!("{jail2}/bin/tool")).unwrap();
        assert_eq!(second.ino(), skel.ino());
    }

    #[test]
    fn same_devino_copied_once() {
        let f = fixture();
        std::fs::hard_link(
            format!("{}/bin/tool", f.src),
            format!("{}/bin/tool2", f.src),
        )
        .unwrap();
        let manifest = format!(
            "/bin/tool <- {src}/bin/tool\n/bin/tool2 <- {src}/bin/tool2\n",
            src = f.src
        );
        materialize(&f, &manifest, false);
        let a = std::fs::metadata(format!("{}/bin/tool", f.jail)).unwrap();
        let b = std::fs::metadata(format!("{}/bin/tool2", f.jail)).unwrap();
        assert_eq!(a.ino(), b.ino());
    }

    #[test]
    fn symlink_recreated_and_target_pulled_in() {
        let f = fixture();
        symlink("tool", format!("{}/bin/alias", f.src)).unwrap();
        let manifest = format!("{}/:\nbin/alias\n", f.src);
        materialize(&f, &manifest, false);

        let link = format!("{}{}/bin/alias", f.jail, f.src);
        assert_eq!(
            std::fs::read_link(&link).unwrap().to_string_lossy(),
            "tool"
        );
        // the relative target was materialized next to it
        assert!(std::path::Path::new(&format!("{}{}/bin/tool", f.jail, f.src)).exists());
    }

    #[test]
    fn dotdot_symlink_target_resolved() {
        let f = fixture();
        std::fs::create_dir_all(format!("{}/etc", f.src)).unwrap();
        std::fs::write(format!("{}/etc/real.conf", f.src), b"conf\n").unwrap();
        symlink("../etc/real.conf", format!("{}/bin/conf", f.src)).unwrap();
        let manifest = format!("{}/:\nbin/conf\n", f.src);
        materialize(&f, &manifest, false);
        assert!(
            std::path::Path::new(&format!("{}{}/etc/real.conf", f.jail, f.src)).exists(),
            "../ target should be materialized"
        );
    }

    #[test]
    fn unresolvable_symlink_target_skipped() {
        let f = fixture();
        symlink(
            "../../../../../../../../nowhere",
            format!("{}/bin/wild", f.src),
        )
        .unwrap();
        let manifest = format!("{}/:\nbin/wild\n", f.src);
        // must not fail: the entry is skipped
        materialize(&f, &manifest, false);
        assert!(std::path::Path::new(&format!("{}{}/bin/wild", f.jail, f.src)).exists());
    }

    #[test]
    fn fifo_materialized() {
        let f = fixture();
        let fifo = format!("{}/bin/pipe", f.src);
        let c = crate::paths::cstr(&fifo);
        assert_eq!(unsafe { libc::mkfifo(c.as_ptr(), 0o644) }, 0);
        let manifest = format!("/bin/pipe <- {fifo}\n");
        materialize(&f, &manifest, false);
        let meta = std::fs::symlink_metadata(format!("{}/bin/pipe", f.jail)).unwrap();
        assert_eq!(meta.mode() & libc::S_IFMT as u32, libc::S_IFIFO as u32);
    }

    #[test]
    fn bind_tag_refresh_rematerializes_source() {
        let f = fixture();
        let bindsrc = format!("{}/bindsrc", f.src);
        std::fs::create_dir_all(&bindsrc).unwrap();
        let files = format!("{}/files.txt", f.src);
        std::fs::write(&files, format!("/bin/tool <- {}/bin/tool\n", f.src)).unwrap();

        let mut ops = FsOps::new(false, false);
        let mut planner = MountPlanner::new(MountPhase::Add);
        let mut m = Materializer::new(&mut ops, &mut planner, &f.jail, None);
        m.refresh_bind_source(&bindsrc, "v1", &files).unwrap();

        assert!(std::path::Path::new(&format!("{bindsrc}/bin/tool")).exists());
        let tag = std::fs::read_to_string(format!("{bindsrc}/{BINDTAG_FILE}")).unwrap();
        assert_eq!(tag, "v1\n");

        // same tag: no work, file untouched
        std::fs::remove_file(format!("{bindsrc}/bin/tool")).unwrap();
        m.refresh_bind_source(&bindsrc, "v1", &files).unwrap();
        assert!(!std::path::Path::new(&format!("{bindsrc}/bin/tool")).exists());
    }
}
