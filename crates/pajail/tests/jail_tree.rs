//! End-to-end jail-tree construction through the public API.
//!
//! Everything here runs unprivileged: sources are caller-owned trees in a
//! temp directory, and the policy under test uses `treedir /` so the
//! root-ownership walk accepts the fixture ancestry.

use std::os::unix::fs::MetadataExt;
use std::path::Path;

use pajail::jaildir::JailAction;
use pajail::mounts::MountPhase;
use pajail::{FsOps, JailDir, Materializer, MountPlanner, Policy};

struct World {
    _tmp: tempfile::TempDir,
    base: String,
}

impl World {
    fn new() -> World {
        let tmp = tempfile::Builder::new()
            .prefix("pajail-it-")
            .tempdir_in(env!("CARGO_MANIFEST_DIR"))
            .unwrap();
        let base = tmp.path().to_string_lossy().into_owned();
        World { _tmp: tmp, base }
    }

    fn policy(&self) -> Policy {
        Policy::from_text(&format!(
            "enablejail {base}/jails/*\nenableskeleton {base}/skel\ntreedir /\n",
            base = self.base
        ))
    }

    fn host_tree(&self) -> String {
        let host = format!("{}/host", self.base);
        std::fs::create_dir_all(format!("{host}/bin")).unwrap();
        std::fs::create_dir_all(format!("{host}/lib")).unwrap();
        std::fs::write(format!("{host}/bin/run"), b"#!/bin/sh\necho ok\n").unwrap();
        std::fs::write(format!("{host}/lib/libx.so.1.2"), b"\x7fELFstub").unwrap();
        std::os::unix::fs::symlink("libx.so.1.2", format!("{host}/lib/libx.so")).unwrap();
        host
    }

    fn resolve(&self, name: &str, skeleton: Option<&str>, ops: &mut FsOps) -> JailDir {
        let dir = format!("{}/jails/{name}", self.base);
        std::fs::create_dir_all(format!("{}/jails", self.base)).unwrap();
        JailDir::resolve(&dir, skeleton, JailAction::Add, false, &self.policy(), ops)
            .unwrap()
            .expect("jail dir should resolve")
    }
}

fn build(world: &World, name: &str, manifest: &str, skeleton: Option<&str>) -> String {
    let mut ops = FsOps::new(false, false);
    let jail = world.resolve(name, skeleton, &mut ops);
    let mut planner = MountPlanner::new(MountPhase::Add);
    if let Some(skel) = &jail.skeleton {
        ops.ensure_dir(skel, 0o755, true).unwrap();
    }
    let root = pajail::paths::no_end_slash(&jail.dir);
    let skel = jail.skeleton.clone();
    let mut m = Materializer::new(&mut ops, &mut planner, &root, skel.as_deref());
    m.construct(manifest, false).unwrap();
    root
}

#[test]
fn manifest_tree_matches_host() {
    let world = World::new();
    let host = world.host_tree();
    let manifest = format!("{host}/:\nbin/run\nlib/libx.so\n");
    let jail = build(&world, "a", &manifest, None);

    // every materialized path keeps the host file type and metadata
    for rel in ["bin/run", "lib/libx.so.1.2"] {
        let hm = std::fs::symlink_metadata(format!("{host}/{rel}")).unwrap();
        let jm = std::fs::symlink_metadata(format!("{jail}{host}/{rel}")).unwrap();
        assert_eq!(hm.mode(), jm.mode(), "{rel} mode");
        assert_eq!(hm.size(), jm.size(), "{rel} size");
        assert_eq!(
            (hm.mtime(), hm.mtime_nsec()),
            (jm.mtime(), jm.mtime_nsec()),
            "{rel} mtime"
        );
        assert_eq!(
            std::fs::read(format!("{host}/{rel}")).unwrap(),
            std::fs::read(format!("{jail}{host}/{rel}")).unwrap(),
            "{rel} bytes"
        );
    }

    // the symlink itself is verbatim, and its target got pulled in
    let link = std::fs::read_link(format!("{jail}{host}/lib/libx.so")).unwrap();
    assert_eq!(link.to_string_lossy(), "libx.so.1.2");
}

#[test]
fn skeleton_jails_share_content() {
    let world = World::new();
    let host = world.host_tree();
    let skel = format!("{}/skel", world.base);
    let manifest = format!("{host}/:\nbin/run\n");

    let jail1 = build(&world, "s1", &manifest, Some(&skel));
    let jail2 = build(&world, "s2", &manifest, Some(&skel));

    let rel = format!("{host}/bin/run");
    let skel_ino = std::fs::metadata(format!("{skel}{rel}")).unwrap().ino();
    assert_eq!(
        std::fs::metadata(format!("{jail1}{rel}")).unwrap().ino(),
        skel_ino
    );
    assert_eq!(
        std::fs::metadata(format!("{jail2}{rel}")).unwrap().ino(),
        skel_ino
    );

    let bytes = std::fs::read(format!("{skel}{rel}")).unwrap();
    assert_eq!(bytes, std::fs::read(format!("{host}/bin/run")).unwrap());
}

#[test]
fn remove_then_rebuild_is_identical() {
    let world = World::new();
    let host = world.host_tree();
    let manifest = format!("{host}/:\nbin/run\nlib/libx.so.1.2\n");

    let jail = build(&world, "r1", &manifest, None);
    let before: Vec<(String, u64, i64)> = walk(&jail);

    let ops = FsOps::new(false, false);
    let mut rops = FsOps::new(false, false);
    let jd = JailDir::resolve(&jail, None, JailAction::Rm, false, &world.policy(), &mut rops)
        .unwrap()
        .unwrap();
    let planner = MountPlanner::new(MountPhase::Add);
    jd.remove(&ops, &planner).unwrap();
    assert!(!Path::new(&jail).exists());

    let jail = build(&world, "r1", &manifest, None);
    let after = walk(&jail);
    assert_eq!(before, after);
}

#[test]
fn denied_policy_reports_pattern() {
    let policy = Policy::from_text("enablejail /jails/ok*\ndisablejail /jails/bad\n");
    let mut ops = FsOps::new(false, false);
    let err = JailDir::resolve(
        "/jails/bad/x",
        None,
        JailAction::Add,
        false,
        &policy,
        &mut ops,
    )
    .err()
    .expect("must be denied");
    let msg = err.to_string();
    assert!(msg.contains("Jail disabled by /etc/pa-jail.conf"), "{msg}");
    assert!(msg.contains("/jails/bad/"), "{msg}");
}

#[test]
fn config_file_must_be_root_owned() {
    let tmp = tempfile::TempDir::new().unwrap();
    let path = format!("{}/pa-jail.conf", tmp.path().display());
    std::fs::write(&path, "enablejail /jails/*\n").unwrap();
    if unsafe { libc::geteuid() } != 0 {
        assert!(Policy::load_from(&path).is_err());
    }
}

/// Relative path, size and mtime of every regular file under `root`.
fn walk(root: &str) -> Vec<(String, u64, i64)> {
    let mut out = Vec::new();
    let mut stack = vec![root.to_string()];
    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(&dir).unwrap() {
            let entry = entry.unwrap();
            let path = entry.path();
            let meta = std::fs::symlink_metadata(&path).unwrap();
            if meta.is_dir() {
                stack.push(path.to_string_lossy().into_owned());
            } else if meta.is_file() {
                let rel = path.to_string_lossy()[root.len()..].to_string();
                out.push((rel, meta.size(), meta.mtime()));
            }
        }
    }
    out.sort();
    out
}
