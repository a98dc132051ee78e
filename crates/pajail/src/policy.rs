//! Administrator policy: which directories may host jails and skeletons.
//!
//! The policy lives in a single root-owned file (`/etc/pa-jail.conf` by
//! default). Each line is a verb and an optional absolute glob pattern:
//!
//! ```text
//! enablejail /jails/*
//! disablejail /jails/frozen
//! enableskeleton /jails/skel*
//! treedir /jails
//! ```
//!
//! Verbs are `enablejail`/`allowjail`, `disablejail`/`nojail`, the same four
//! with `skeleton`, and `treedir`. An empty argument makes the rule global.
//! Rules apply in file order; the final answer is "allowed globally and
//! allowed by some local rule". Matching uses the platform `fnmatch(3)` with
//! `FNM_PATHNAME | FNM_PERIOD`, so `*` never crosses a slash and never
//! matches a leading dot.
//!
//! A query also computes the *tree root*: the highest directory under which
//! the matching rule permits jails. Ancestors of a jail outside the tree
//! root must be root-owned and not writable by others (`jaildir` enforces
//! this); inside it, missing directories may be created.

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::fs::MetadataExt;

use crate::error::{Error, Result};
use crate::paths::{cstr, end_slash};

pub const CONFIG_PATH: &str = "/etc/pa-jail.conf";
const CONFIG_MAX: usize = 8192;

/// Which kind of directory a query asks about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirKind {
    Jail,
    Skeleton,
}

impl DirKind {
    fn word(self) -> &'static str {
        match self {
            DirKind::Jail => "jail",
            DirKind::Skeleton => "skeleton",
        }
    }
}

/// Outcome of a policy query.
#[derive(Debug, Clone)]
pub struct PolicyDecision {
    pub allowed: bool,
    /// Slash-terminated enclosing tree root, when one was determined.
    pub tree_dir: String,
    /// The pattern that produced the (most recent) local decision, for
    /// diagnostics. Empty for a global rule.
    pub matched_pattern: String,
}

impl PolicyDecision {
    /// The "cite the rule" suffix for denial messages.
    pub fn disable_message(&self) -> String {
        if self.matched_pattern.is_empty() {
            String::new()
        } else {
            format!("  (disabled by {})\n", self.matched_pattern)
        }
    }
}

pub struct Policy {
    text: String,
}

impl Policy {
    /// Load and validate the administrator config file.
    pub fn load() -> Result<Policy> {
        Policy::load_from(CONFIG_PATH)
    }

    pub fn load_from(path: &str) -> Result<Policy> {
        let fd = unsafe { libc::open(cstr(path).as_ptr(), libc::O_RDONLY | libc::O_NOFOLLOW) };
        if fd < 0 {
            return Err(Error::path(path));
        }
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        let file = std::fs::File::from(fd);
        let st = file.metadata().map_err(|e| Error::Path {
            path: path.into(),
            source: e,
        })?;
        if !writable_only_by_root(st.uid(), st.gid(), st.mode()) {
            return Err(Error::msg(format!("{path}: Writable by non-root")));
        }

        let mut buf = vec![0u8; CONFIG_MAX];
        let nr = unsafe {
            libc::read(
                file.as_raw_fd(),
                buf.as_mut_ptr().cast::<libc::c_void>(),
                buf.len(),
            )
        };
        if nr < 0 {
            return Err(Error::path(path));
        } else if nr == 0 {
            return Err(Error::msg(format!("{path}: Empty file")));
        } else if nr as usize == CONFIG_MAX {
            return Err(Error::msg(format!(
                "{path}: Too big, max {} bytes",
                CONFIG_MAX - 1
            )));
        }
        buf.truncate(nr as usize);
        Ok(Policy {
            text: String::from_utf8_lossy(&buf).into_owned(),
        })
    }

    /// Build a policy from literal text (tests, trusted callers).
    pub fn from_text(text: &str) -> Policy {
        Policy {
            text: text.to_string(),
        }
    }

    pub fn allow_jail(&self, dir: &str) -> PolicyDecision {
        self.allows(DirKind::Jail, dir, false)
    }

    /// Like [`allow_jail`](Self::allow_jail) but the pattern may also match
    /// a proper ancestor of `dir` (used for `--chown-user` subdirectories).
    pub fn allow_jail_subdir(&self, dir: &str) -> PolicyDecision {
        self.allows(DirKind::Jail, dir, true)
    }

    pub fn allow_skeleton(&self, dir: &str) -> PolicyDecision {
        self.allows(DirKind::Skeleton, dir, false)
    }

    fn allows(&self, kind: DirKind, dir: &str, superdir: bool) -> PolicyDecision {
        let dir = end_slash(dir);
        let type_word = kind.word();
        // -1 unset, 0 denied, 1 allowed
        let mut allowed_globally: i8 = -1;
        let mut allowed_locally: i8 = -1;
        let mut matched_pattern = String::new();
        let mut tree_dir = String::new();

        for line in self.text.lines() {
            let mut words = line.split_whitespace();
            let action = words.next().unwrap_or("");
            let arg = words.next().unwrap_or("");

            let allowed = if action_is(action, "disable", type_word)
                || action_is(action, "no", type_word)
            {
                0
            } else if action_is(action, "enable", type_word)
                || action_is(action, "allow", type_word)
            {
                1
            } else if action == "treedir" {
                if arg.starts_with('/') {
                    update_tree_dir(&mut tree_dir, &end_slash(arg), &dir, true);
                }
                continue;
            } else {
                continue;
            };

            if arg.is_empty() {
                // global rule
                allowed_globally = allowed;
                if allowed == 0 {
                    allowed_locally = 0;
                }
                matched_pattern.clear();
            } else if arg.starts_with('/') {
                let pattern = end_slash(arg);
                if dir_match(&pattern, &dir, superdir || allowed <= 0).is_some() {
                    allowed_locally = allowed;
                    matched_pattern = pattern.clone();
                    if allowed > 0 {
                        update_tree_dir(&mut tree_dir, &pattern, &dir, false);
                    }
                }
            }
        }

        PolicyDecision {
            allowed: allowed_globally != 0 && allowed_locally > 0,
            tree_dir,
            matched_pattern,
        }
    }
}

fn writable_only_by_root(uid: u32, gid: u32, mode: u32) -> bool {
    uid == 0 && (gid == 0 || mode & 0o020 == 0) && mode & 0o002 == 0
}

fn action_is(action: &str, prefix: &str, type_word: &str) -> bool {
    action.len() == prefix.len() + type_word.len()
        && action.starts_with(prefix)
        && action.ends_with(type_word)
}

/// Match `dir` (slash-terminated) against a slash-terminated glob pattern.
///
/// When `superdir` is set, `dir` is first truncated to as many components as
/// the pattern has, so the pattern can match an ancestor. Returns the matched
/// directory prefix on success.
fn dir_match(pattern: &str, dir: &str, superdir: bool) -> Option<String> {
    let mut target = dir.to_string();
    if superdir {
        let pat_components = pattern.matches('/').count();
        let mut end = 0;
        let mut seen = 0;
        for (i, b) in dir.bytes().enumerate() {
            if b == b'/' {
                seen += 1;
                end = i + 1;
                if seen == pat_components {
                    break;
                }
            }
        }
        if seen < pat_components {
            return None;
        }
        target = dir[..end].to_string();
    }
    let rc = unsafe {
        libc::fnmatch(
            cstr(pattern).as_ptr(),
            cstr(&target).as_ptr(),
            libc::FNM_PATHNAME | libc::FNM_PERIOD,
        )
    };
    (rc == 0).then_some(target)
}

/// Track the shortest matched superdirectory as the tree root. A pattern
/// ending in `/*/` rounds up one directory unless it came from an explicit
/// `treedir` rule.
fn update_tree_dir(tree_dir: &mut String, pattern: &str, dir: &str, explicit: bool) {
    let mut pattern = pattern.to_string();
    if !explicit && pattern.len() > 3 && pattern.ends_with("/*/") {
        pattern.truncate(pattern.len() - 2);
    }
    if let Some(superdir) = dir_match(&pattern, dir, true) {
        if tree_dir.is_empty() || tree_dir.len() > superdir.len() {
            *tree_dir = superdir;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_rules_and_tree_dirs() {
        let p = Policy::from_text("enablejail /jails/run*\nenablejail /jails/~*\n");
        let d = p.allow_jail("/jails/run");
        assert!(d.allowed);
        assert_eq!(d.tree_dir, "/jails/run/");
        assert!(p.allow_jail("/jails/run/").allowed);
        assert!(!p.allow_jail("/jails").allowed);
        assert!(!p.allow_jail("/jails/").allowed);
        assert!(!p.allow_jail("/jails/runa/runb").allowed);
        assert!(p.allow_jail_subdir("/jails/runa/runb").allowed);
        let d = p.allow_jail("/jails/runa");
        assert!(d.allowed);
        assert_eq!(d.tree_dir, "/jails/runa/");
        let d = p.allow_jail("/jails/~runa/");
        assert!(d.allowed);
        assert_eq!(d.tree_dir, "/jails/~runa/");
    }

    #[test]
    fn global_disable_wins() {
        let p = Policy::from_text("enablejail /jails/run*\nenablejail /jails/~*\ndisablejail /\n");
        for dir in [
            "/jails/run",
            "/jails/run/",
            "/jails",
            "/jails/runa/runb",
            "/jails/~runa",
        ] {
            assert!(!p.allow_jail(dir).allowed, "{dir} should be denied");
        }
    }

    #[test]
    fn later_local_disable_overrides() {
        let p = Policy::from_text(
            "enablejail /jails/run*\nenablejail /jails/~*\ndisablejail /jails/runa\n",
        );
        assert!(p.allow_jail("/jails/run").allowed);
        assert!(!p.allow_jail("/jails/runa").allowed);
        assert!(!p.allow_jail("/jails/runa/runb").allowed);
        assert!(p.allow_jail("/jails/~runa").allowed);
        let denied = p.allow_jail("/jails/runa");
        assert_eq!(denied.matched_pattern, "/jails/runa/");
        assert!(denied
            .disable_message()
            .contains("disabled by /jails/runa/"));
    }

    #[test]
    fn explicit_treedir_widens_root() {
        let p = Policy::from_text("enablejail /jails/run*\nenablejail /jails/~*\ntreedir /jails\n");
        let d = p.allow_jail("/jails/run");
        assert!(d.allowed);
        assert_eq!(d.tree_dir, "/jails/");
        assert_eq!(p.allow_jail("/jails/~runa").tree_dir, "/jails/");
        assert!(!p.allow_jail("/jails").allowed);
    }

    #[test]
    fn unrelated_treedir_ignored() {
        let p = Policy::from_text("enablejail /jails/run*\ntreedir /hails\n");
        let d = p.allow_jail("/jails/run");
        assert!(d.allowed);
        assert_eq!(d.tree_dir, "/jails/run/");
    }

    #[test]
    fn star_subdir_pattern_rounds_up() {
        let p = Policy::from_text("enablejail /jails/*/\n");
        let d = p.allow_jail("/jails/u1");
        assert!(d.allowed);
        assert_eq!(d.tree_dir, "/jails/");
    }

    #[test]
    fn star_does_not_cross_slash_or_leading_dot() {
        let p = Policy::from_text("enablejail /jails/*\n");
        assert!(!p.allow_jail("/jails/a/b").allowed);
        assert!(!p.allow_jail("/jails/.hidden").allowed);
    }

    #[test]
    fn skeleton_rules_are_separate() {
        let p = Policy::from_text("enablejail /jails/*\nenableskeleton /skel\n");
        assert!(!p.allow_skeleton("/jails/a").allowed);
        assert!(p.allow_skeleton("/skel").allowed);
    }

    #[test]
    fn ownership_check() {
        assert!(writable_only_by_root(0, 0, 0o644));
        assert!(writable_only_by_root(0, 0, 0o664));
        assert!(!writable_only_by_root(0, 0, 0o666));
        assert!(!writable_only_by_root(0, 50, 0o664));
        assert!(writable_only_by_root(0, 50, 0o644));
        assert!(!writable_only_by_root(1000, 0, 0o644));
    }
}
