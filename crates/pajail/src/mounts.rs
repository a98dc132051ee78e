//! Mount planning: which host mounts are reflected into the jail, and when.
//!
//! The planner snapshots the host mount table once per invocation and runs a
//! three-phase state machine:
//!
//! - `Add`: populating a jail from the caller's namespace (`pa-jail add`).
//! - `PreFork`: materializing for a `run` that is about to create the
//!   namespace. Mounts that must live inside the namespace are recorded as
//!   *delayed* instead of executed.
//! - `InChild`: inside the new namespace. Delayed mounts and the
//!   pseudo-filesystems (`/proc`, `/dev/pts`, `/tmp`) happen here.
//!
//! Bind mounts executed in the child are re-flagged `slave` and get a second
//! `MS_REMOUNT` pass so propagation cannot leak back to the host.

use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::fsops::FsOps;
use crate::paths::shell_quote;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountPhase {
    Add,
    PreFork,
    InChild,
}

/// State of a jail destination path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DstState {
    Copied,
    Mounted,
    /// Dry-run marker left by `umount` so removal skips the subtree.
    Unmounted,
}

/// A named mount flag understood in `/proc/mounts` option strings.
struct MountArg {
    name: &'static str,
    value: libc::c_ulong,
    /// Included when unparsing flags back into `-o` form.
    unparse: bool,
}

#[cfg(target_os = "linux")]
const MOUNT_ARGS: &[MountArg] = &[
    MountArg { name: "bind", value: libc::MS_BIND, unparse: false },
    MountArg { name: "noatime", value: libc::MS_NOATIME, unparse: true },
    MountArg { name: "nodev", value: libc::MS_NODEV, unparse: true },
    MountArg { name: "nodiratime", value: libc::MS_NODIRATIME, unparse: true },
    MountArg { name: "noexec", value: libc::MS_NOEXEC, unparse: true },
    MountArg { name: "nosuid", value: libc::MS_NOSUID, unparse: true },
    MountArg { name: "private", value: libc::MS_PRIVATE, unparse: true },
    MountArg { name: "rec", value: libc::MS_REC, unparse: false },
    MountArg { name: "relatime", value: libc::MS_RELATIME, unparse: true },
    MountArg { name: "remount", value: libc::MS_REMOUNT, unparse: true },
    MountArg { name: "ro", value: libc::MS_RDONLY, unparse: true },
    MountArg { name: "rw", value: 0, unparse: true },
    MountArg { name: "slave", value: libc::MS_SLAVE, unparse: true },
    MountArg { name: "strictatime", value: libc::MS_STRICTATIME, unparse: true },
    MountArg { name: "unbindable", value: libc::MS_UNBINDABLE, unparse: true },
];

#[cfg(not(target_os = "linux"))]
const MOUNT_ARGS: &[MountArg] = &[
    MountArg { name: "nodev", value: libc::MNT_NODEV as libc::c_ulong, unparse: true },
    MountArg { name: "noexec", value: libc::MNT_NOEXEC as libc::c_ulong, unparse: true },
    MountArg { name: "nosuid", value: libc::MNT_NOSUID as libc::c_ulong, unparse: true },
    MountArg { name: "ro", value: libc::MNT_RDONLY as libc::c_ulong, unparse: true },
    MountArg { name: "rw", value: 0, unparse: true },
];

fn find_mount_arg(name: &str) -> Option<&'static MountArg> {
    MOUNT_ARGS.iter().find(|ma| ma.name == name)
}

/// One host mount (or one manifest-requested mount), keyed externally by its
/// mount point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountSlot {
    pub fsname: String,
    pub fstype: String,
    pub flags: libc::c_ulong,
    /// Filesystem-specific option string (the non-flag `a=b` options).
    pub data: String,
    /// Explicitly requested by the manifest.
    pub wanted: bool,
}

impl MountSlot {
    pub fn new(fsname: &str, fstype: &str, options: &str) -> MountSlot {
        let mut slot = MountSlot {
            fsname: fsname.to_string(),
            fstype: fstype.to_string(),
            flags: 0,
            data: String::new(),
            wanted: false,
        };
        for opt in options.split(',').filter(|o| !o.is_empty()) {
            let key = opt.split('=').next().unwrap_or(opt);
            if let Some(ma) = find_mount_arg(key) {
                slot.flags |= ma.value;
            } else {
                if !slot.data.is_empty() {
                    slot.data.push(',');
                }
                slot.data.push_str(opt);
            }
        }
        slot
    }

    /// Add one option, replacing a previous setting of the same key.
    pub fn add_option(&mut self, opt: &str) {
        let key = opt.split('=').next().unwrap_or(opt);
        if let Some(ma) = find_mount_arg(key) {
            if ma.value != 0 {
                self.flags |= ma.value;
            } else {
                // "rw" clears read-only
                #[cfg(target_os = "linux")]
                {
                    self.flags &= !libc::MS_RDONLY;
                }
            }
            return;
        }
        let kept: Vec<&str> = self
            .data
            .split(',')
            .filter(|o| !o.is_empty() && o.split('=').next().unwrap_or(o) != key)
            .collect();
        self.data = kept.join(",");
        if !self.data.is_empty() {
            self.data.push(',');
        }
        self.data.push_str(opt);
    }

    /// Render an equivalent `mount` command line for verbose output.
    pub fn debug_command(&self, dst: &str, flags: libc::c_ulong) -> String {
        let mut arg = String::new();
        #[cfg(target_os = "linux")]
        let rdonly = libc::MS_RDONLY;
        #[cfg(not(target_os = "linux"))]
        let rdonly = libc::MNT_RDONLY as libc::c_ulong;
        if flags & rdonly == 0 {
            arg.push_str("rw");
        }
        for ma in MOUNT_ARGS {
            if ma.value != 0 && flags & ma.value != 0 && ma.unparse {
                if !arg.is_empty() {
                    arg.push(',');
                }
                arg.push_str(ma.name);
            }
        }
        if !self.data.is_empty() {
            if !arg.is_empty() {
                arg.push(',');
            }
            arg.push_str(&self.data);
        }
        #[cfg(target_os = "linux")]
        if flags & libc::MS_BIND != 0 {
            let verb = if flags & libc::MS_REC != 0 { "--rbind" } else { "--bind" };
            let opts = if arg == "rw" { String::new() } else { format!("-o {arg} ") };
            return format!(
                "mount -i -n -t {} {verb} {opts}{} {}",
                self.fstype,
                shell_quote(&self.fsname),
                shell_quote(dst)
            );
        }
        let opts = if arg.is_empty() { String::new() } else { format!(" -o {arg}") };
        format!(
            "mount -i -n -t {}{opts} {} {}",
            self.fstype,
            shell_quote(&self.fsname),
            shell_quote(dst)
        )
    }

    fn mount_once(&self, dst: &str, flags: libc::c_ulong, ops: &FsOps) -> i32 {
        ops.echo(format_args!("{}", self.debug_command(dst, flags)));
        if ops.dryrun {
            return 0;
        }
        let fsname = crate::paths::cstr(&self.fsname);
        let dstc = crate::paths::cstr(dst);
        let fstype = crate::paths::cstr(&self.fstype);
        let data = crate::paths::cstr(&self.data);
        #[cfg(target_os = "linux")]
        unsafe {
            libc::mount(
                fsname.as_ptr(),
                dstc.as_ptr(),
                fstype.as_ptr(),
                flags,
                if self.data.is_empty() {
                    std::ptr::null()
                } else {
                    data.as_ptr().cast()
                },
            )
        }
        #[cfg(not(target_os = "linux"))]
        unsafe {
            let _ = (fsname, data);
            libc::mount(
                fstype.as_ptr(),
                dstc.as_ptr(),
                flags as libc::c_int,
                std::ptr::null_mut(),
            )
        }
    }
}

pub struct MountPlanner {
    table: HashMap<String, MountSlot>,
    populated: bool,
    pub phase: MountPhase,
    /// `(src, dst)` pairs discovered in `PreFork`, executed in the child.
    delayed: Vec<(String, String)>,
    /// Destination paths already acted on.
    pub dst_table: HashMap<String, DstState>,
}

impl MountPlanner {
    pub fn new(phase: MountPhase) -> MountPlanner {
        MountPlanner {
            table: HashMap::new(),
            populated: false,
            phase,
            delayed: Vec::new(),
            dst_table: HashMap::new(),
        }
    }

    /// Snapshot the host mount table (idempotent).
    pub fn populate(&mut self) -> Result<()> {
        if self.populated {
            return Ok(());
        }
        self.populated = true;
        let text = std::fs::read_to_string("/proc/mounts").map_err(|e| Error::Path {
            path: "/proc/mounts".into(),
            source: e,
        })?;
        for line in text.lines() {
            let mut f = line.split_whitespace();
            let (Some(fsname), Some(dir), Some(fstype)) = (f.next(), f.next(), f.next()) else {
                continue;
            };
            let opts = f.next().unwrap_or("");
            self.table.insert(
                unescape_mount_path(dir),
                MountSlot::new(&unescape_mount_path(fsname), fstype, opts),
            );
        }
        Ok(())
    }

    pub fn insert_wanted(&mut self, src: &str, slot: MountSlot) {
        let mut slot = slot;
        slot.wanted = true;
        self.table.insert(src.to_string(), slot);
    }

    pub fn slot(&self, mount_point: &str) -> Option<&MountSlot> {
        self.table.get(mount_point)
    }

    /// Mount points lying underneath `prefix` (used by `rm`).
    pub fn points_under(&self, prefix: &str) -> Vec<String> {
        self.table
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect()
    }

    /// Is this host mount reflected into the jail in the current phase?
    /// In `PreFork` a reflected mount is queued on the delayed list instead.
    fn reflects(&mut self, src: &str, dst: &str, slot: &MountSlot) -> bool {
        log::debug!(
            "checkmount {src} -> {dst} type={} phase={:?} wanted={}",
            slot.fstype,
            self.phase,
            slot.wanted
        );
        if (src == "/proc" && slot.fstype == "proc")
            || (src == "/dev/pts" && slot.fstype == "devpts")
        {
            self.phase == MountPhase::InChild
        } else if src == "/tmp" && slot.fstype == "tmpfs" {
            self.phase != MountPhase::PreFork
        } else if src == "/run" && slot.fstype == "tmpfs" {
            false
        } else if (src == "/sys" && slot.fstype == "sysfs")
            || (src == "/dev" && slot.fstype == "udev")
            || slot.wanted
        {
            if self.phase == MountPhase::PreFork {
                self.delayed.push((src.to_string(), dst.to_string()));
                false
            } else {
                true
            }
        } else {
            false
        }
    }

    /// Reflect the host mount at `src` onto jail path `dst` if the decision
    /// table says so. No-op when `src` is not a known mount point.
    pub fn handle_mount(&mut self, ops: &mut FsOps, src: &str, dst: &str) -> Result<()> {
        let Some(slot) = self.table.get(src).cloned() else {
            return Ok(());
        };
        if !self.reflects(src, dst, &slot) {
            return Ok(());
        }
        let in_child = self.phase == MountPhase::InChild;

        // already mounted at dst with identical parameters?
        if !in_child {
            if let Some(existing) = self.table.get(dst) {
                if existing.fsname == slot.fsname
                    && existing.fstype == slot.fstype
                    && existing.flags == slot.flags
                    && existing.data == slot.data
                {
                    return Ok(());
                }
            }
        }
        match self.dst_table.get(dst) {
            Some(DstState::Mounted) | Some(DstState::Unmounted) => return Ok(()),
            _ => {}
        }
        self.dst_table.insert(dst.to_string(), DstState::Mounted);

        if in_child {
            ops.ensure_dir(dst, 0o555, true)?;
        }

        let mut slot = slot;
        #[cfg(target_os = "linux")]
        if in_child {
            if slot.fstype == "devpts" {
                slot.add_option("newinstance");
                slot.add_option("ptmxmode=0666");
            }
            if slot.flags & libc::MS_BIND != 0 {
                slot.add_option("slave");
            }
        }

        let mut r = slot.mount_once(dst, slot.flags, ops);
        #[cfg(target_os = "linux")]
        if !ops.dryrun && r != 0 && in_child {
            let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
            if errno == libc::EBUSY {
                r = slot.mount_once(dst, slot.flags | libc::MS_REMOUNT, ops);
            }
        }
        #[cfg(target_os = "linux")]
        if r == 0 && slot.flags & libc::MS_BIND != 0 {
            // second pass establishes the slave propagation mode
            r = slot.mount_once(dst, slot.flags | libc::MS_REMOUNT, ops);
        }
        if r != 0 {
            return Err(Error::Path {
                path: slot.debug_command(dst, slot.flags),
                source: std::io::Error::last_os_error(),
            });
        }
        Ok(())
    }

    /// Run the mounts that `PreFork` deferred (call with phase `InChild`).
    pub fn run_delayed(&mut self, ops: &mut FsOps) -> Result<()> {
        for (src, dst) in std::mem::take(&mut self.delayed) {
            self.handle_mount(ops, &src, &dst)?;
            self.delayed.push((src, dst));
        }
        Ok(())
    }

    /// Unmount one mount point (used by `rm`).
    pub fn umount(&mut self, ops: &FsOps, dir: &str) -> Result<()> {
        ops.echo(format_args!("umount -i -n {}", shell_quote(dir)));
        if !ops.dryrun {
            #[cfg(target_os = "linux")]
            let r = unsafe { libc::umount(crate::paths::cstr(dir).as_ptr()) };
            #[cfg(not(target_os = "linux"))]
            let r = unsafe { libc::unmount(crate::paths::cstr(dir).as_ptr(), 0) };
            if r != 0 {
                return Err(Error::sys("umount", dir));
            }
        } else {
            self.dst_table.insert(dir.to_string(), DstState::Unmounted);
        }
        Ok(())
    }

    /// Resolve `dir` to its bind source when the directory is itself a bind
    /// mount target (common when a jail is a skeleton leaf). Falls back to
    /// `dir` unchanged.
    pub fn unmounted(&self, dir: &str) -> String {
        self.unmounted_inner(dir, false)
    }

    fn unmounted_inner(&self, dir: &str, no_retry: bool) -> String {
        #[cfg(target_os = "linux")]
        {
            if let Some(slot) = self.table.get(dir) {
                return if slot.flags & libc::MS_BIND != 0 {
                    slot.fsname.clone()
                } else {
                    dir.to_string()
                };
            }
            for (src, dst) in &self.delayed {
                if dst == dir {
                    let bind = self
                        .table
                        .get(src)
                        .map(|s| s.flags & libc::MS_BIND != 0)
                        .unwrap_or(false);
                    return if bind { src.clone() } else { dir.to_string() };
                }
            }
            if no_retry || dir.is_empty() {
                dir.to_string()
            } else if let Some(stripped) = dir.strip_suffix('/') {
                self.unmounted_inner(stripped, true)
            } else {
                self.unmounted_inner(&format!("{dir}/"), true)
            }
        }
        #[cfg(not(target_os = "linux"))]
        {
            let _ = no_retry;
            dir.to_string()
        }
    }
}

/// `/proc/mounts` escapes space, tab, newline and backslash as octal.
fn unescape_mount_path(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' {
            if let Some(oct) = s.get(i + 1..i + 4) {
                if let Ok(v) = u8::from_str_radix(oct, 8) {
                    out.push(v);
                    i += 4;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn planner_with(phase: MountPhase, entries: &[(&str, MountSlot)]) -> MountPlanner {
        let mut p = MountPlanner::new(phase);
        p.populated = true;
        for (dir, slot) in entries {
            p.table.insert(dir.to_string(), slot.clone());
        }
        p
    }

    #[test]
    fn option_parsing_splits_flags_and_data() {
        let slot = MountSlot::new("tmpfs", "tmpfs", "rw,nosuid,nodev,size=64m,mode=755");
        assert_ne!(slot.flags & libc::MS_NOSUID, 0);
        assert_ne!(slot.flags & libc::MS_NODEV, 0);
        assert_eq!(slot.data, "size=64m,mode=755");
    }

    #[test]
    fn add_option_replaces_data_key() {
        let mut slot = MountSlot::new("devpts", "devpts", "gid=5,mode=620,ptmxmode=000");
        slot.add_option("ptmxmode=0666");
        assert!(slot.data.contains("ptmxmode=0666"));
        assert!(!slot.data.contains("ptmxmode=000"));
        slot.add_option("newinstance");
        assert!(slot.data.contains("newinstance"));
    }

    #[test]
    fn proc_and_devpts_only_in_child() {
        let proc_slot = MountSlot::new("proc", "proc", "rw");
        for phase in [MountPhase::Add, MountPhase::PreFork] {
            let mut p = planner_with(phase, &[("/proc", proc_slot.clone())]);
            assert!(!p.reflects("/proc", "/j/proc", &proc_slot));
        }
        let mut p = planner_with(MountPhase::InChild, &[("/proc", proc_slot.clone())]);
        assert!(p.reflects("/proc", "/j/proc", &proc_slot));
    }

    #[test]
    fn tmp_skipped_only_prefork() {
        let tmp = MountSlot::new("tmpfs", "tmpfs", "rw");
        let mut p = planner_with(MountPhase::Add, &[("/tmp", tmp.clone())]);
        assert!(p.reflects("/tmp", "/j/tmp", &tmp));
        let mut p = planner_with(MountPhase::PreFork, &[("/tmp", tmp.clone())]);
        assert!(!p.reflects("/tmp", "/j/tmp", &tmp));
        let mut p = planner_with(MountPhase::InChild, &[("/tmp", tmp.clone())]);
        assert!(p.reflects("/tmp", "/j/tmp", &tmp));
    }

    #[test]
    fn run_tmpfs_never_reflected() {
        let run = MountSlot::new("tmpfs", "tmpfs", "rw");
        let mut p = planner_with(MountPhase::InChild, &[("/run", run.clone())]);
        assert!(!p.reflects("/run", "/j/run", &run));
    }

    #[test]
    fn sysfs_deferred_from_prefork() {
        let sys = MountSlot::new("sysfs", "sysfs", "rw");
        let mut p = planner_with(MountPhase::PreFork, &[("/sys", sys.clone())]);
        assert!(!p.reflects("/sys", "/j/sys", &sys));
        assert_eq!(p.delayed, vec![("/sys".to_string(), "/j/sys".to_string())]);
        let mut p = planner_with(MountPhase::Add, &[("/sys", sys.clone())]);
        assert!(p.reflects("/sys", "/j/sys", &sys));
    }

    #[test]
    fn wanted_mounts_reflect_outside_prefork() {
        let mut nfs = MountSlot::new("srv:/x", "nfs", "rw");
        let mut p = planner_with(MountPhase::Add, &[("/mnt/x", nfs.clone())]);
        assert!(!p.reflects("/mnt/x", "/j/mnt/x", &nfs));
        nfs.wanted = true;
        let mut p = planner_with(MountPhase::Add, &[("/mnt/x", nfs.clone())]);
        assert!(p.reflects("/mnt/x", "/j/mnt/x", &nfs));
    }

    #[test]
    fn unmounted_resolves_bind_source() {
        let bind = MountSlot::new("/srv/skel/leaf", "none", "bind,rec");
        let p = planner_with(MountPhase::Add, &[("/jails/a", bind)]);
        assert_eq!(p.unmounted("/jails/a"), "/srv/skel/leaf");
        assert_eq!(p.unmounted("/jails/a/"), "/srv/skel/leaf");
        assert_eq!(p.unmounted("/jails/other"), "/jails/other");
    }

    #[test]
    fn debug_command_shape() {
        let slot = MountSlot::new("/srv/x", "none", "bind,rec,unbindable,ro");
        let cmd = slot.debug_command("/j/x", slot.flags);
        assert!(cmd.starts_with("mount -i -n -t none --rbind -o "), "{cmd}");
        assert!(cmd.contains("ro"));
        assert!(cmd.ends_with("/srv/x /j/x"));
    }

    #[test]
    fn proc_mounts_octal_unescape() {
        assert_eq!(unescape_mount_path("/a\\040b"), "/a b");
        assert_eq!(unescape_mount_path("/plain"), "/plain");
    }
}
