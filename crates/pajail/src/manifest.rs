//! Manifest parsing.
//!
//! A manifest is a whitespace-tolerant, line-oriented description of a
//! jail's contents. Blank lines and `#` comments are skipped. A line ending
//! in `:` changes the current source/destination directory; every other
//! line names one path to appear inside the jail, optionally with an
//! explicit host source (`PATH <- SRC`) and a trailing `[...]` flag group:
//!
//! ```text
//! /bin/echo
//! usr/lib/:
//! libc.so.6
//! /etc/hosts <- /srv/grader/hosts
//! /home/shared [bind-ro v3 /srv/shared/files.txt]
//! /tmp [mount tmpfs size=64m,mode=1777]
//! ```
//!
//! Flag tokens are separated by spaces or semicolons: `cp`, `bind`,
//! `bind-ro TAG FILES`, `mount TYPE ARGS`.

use crate::error::{Error, Result};
use crate::paths::end_slash;

/// How one manifest entry is realized inside the jail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryKind {
    /// Mirror the host path; hard-link to the skeleton when possible.
    Copy,
    /// Copy file bytes even if the host path is a symlink; never hard-link.
    CopyNoLink,
    /// Recursive, unbindable bind mount of the host source.
    Bind {
        read_only: bool,
        /// Re-materialize the bind source when its tag file differs.
        tag: Option<(String, String)>,
    },
    /// Mount a named filesystem at the destination.
    Mount { fstype: String, args: String },
}

/// One actionable manifest line.
#[derive(Debug, Clone)]
pub struct Entry {
    /// Absolute host source path.
    pub src: String,
    /// Destination subpath inside the jail (absolute, `/`-rooted).
    pub dst: String,
    pub kind: EntryKind,
}

/// Parse the manifest into entries, resolving directory lines.
pub fn parse(text: &str) -> Result<Vec<Entry>> {
    let mut entries = Vec::new();
    let mut cursrc = String::from("/");
    let mut curdst = String::from("/");

    for raw in text.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if line.len() >= libc::PATH_MAX as usize {
            let head: String = line.chars().take(40).collect();
            return Err(Error::Manifest(format!("{head}...: Manifest line too long")));
        }

        if let Some(dir) = line.strip_suffix(':') {
            let dir = match dir {
                "." => "/",
                d => d.strip_prefix('.').filter(|_| d.starts_with("./")).unwrap_or(d),
            };
            let mut dir = if dir.starts_with('/') {
                dir.to_string()
            } else {
                format!("/{dir}")
            };
            while dir.ends_with("//") {
                dir.pop();
            }
            cursrc = end_slash(&dir);
            curdst = cursrc.clone();
            continue;
        }

        let (body, kind) = split_flags(line)?;
        let body = body.trim_end();
        if body.is_empty() {
            continue;
        }

        let (name, src) = match body.split_once(" <- ") {
            Some((name, src)) => (name.trim_end(), src.trim_start().to_string()),
            None => {
                let src = if body.starts_with('/') {
                    body.to_string()
                } else {
                    format!("{cursrc}{body}")
                };
                (body, src)
            }
        };
        let dst = format!("{curdst}{}", name.strip_prefix('/').unwrap_or(name));

        entries.push(Entry { src, dst, kind });
    }
    Ok(entries)
}

/// Split a trailing `[...]` flag group off the line and parse it.
fn split_flags(line: &str) -> Result<(&str, EntryKind)> {
    if !line.ends_with(']') {
        return Ok((line, EntryKind::Copy));
    }
    let open = match line.rfind('[') {
        Some(i) => i,
        None => return Ok(("", EntryKind::Copy)), // stray `]`: original skips the line
    };
    let group = &line[open + 1..line.len() - 1];
    let body = &line[..open];

    let mut copy_nolink = false;
    let mut bind = None;
    let mut mount = None;
    let mut tokens = FlagTokens::new(group);
    while let Some(word) = tokens.next_word() {
        match word {
            "cp" => copy_nolink = true,
            "bind" | "bind-ro" => {
                let tag = tokens.next_word().unwrap_or("").to_string();
                let files = tokens.next_word().unwrap_or("").to_string();
                let tag = (!tag.is_empty() && !files.is_empty()).then_some((tag, files));
                bind = Some(EntryKind::Bind {
                    read_only: word == "bind-ro",
                    tag,
                });
            }
            "mount" => {
                let fstype = tokens.next_word().unwrap_or("").to_string();
                let args = tokens.rest_of_clause().trim().to_string();
                if fstype.is_empty() {
                    return Err(Error::Manifest(format!("{line}: [mount] needs a type")));
                }
                mount = Some(EntryKind::Mount { fstype, args });
            }
            _ => {} // unknown tokens ignored
        }
        tokens.skip_clause();
    }

    let kind = match (bind, mount) {
        (Some(b), Some(_)) => {
            // bind wins; the mount clause is reported and dropped
            eprintln!("{}: [mount] option ignored", body.trim());
            b
        }
        (Some(b), None) => b,
        (None, Some(m)) => m,
        (None, None) if copy_nolink => EntryKind::CopyNoLink,
        (None, None) => EntryKind::Copy,
    };
    Ok((body, kind))
}

/// Word iterator over a flag group: words are separated by whitespace,
/// clauses by `;`.
struct FlagTokens<'a> {
    rest: &'a str,
}

impl<'a> FlagTokens<'a> {
    fn new(group: &'a str) -> FlagTokens<'a> {
        FlagTokens { rest: group }
    }

    fn next_word(&mut self) -> Option<&'a str> {
        self.rest = self.rest.trim_start_matches(|c: char| c.is_whitespace());
        if self.rest.is_empty() || self.rest.starts_with(';') {
            return None;
        }
        let end = self
            .rest
            .find(|c: char| c.is_whitespace() || c == ';')
            .unwrap_or(self.rest.len());
        let (word, rest) = self.rest.split_at(end);
        self.rest = rest;
        Some(word)
    }

    /// Everything up to the end of the current `;` clause.
    fn rest_of_clause(&mut self) -> &'a str {
        let end = self.rest.find(';').unwrap_or(self.rest.len());
        let (clause, rest) = self.rest.split_at(end);
        self.rest = rest;
        clause
    }

    fn skip_clause(&mut self) {
        let end = self.rest.find(';').map(|i| i + 1).unwrap_or(self.rest.len());
        self.rest = &self.rest[end..];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_absolute_entry() {
        let e = parse("/bin/echo\n").unwrap();
        assert_eq!(e.len(), 1);
        assert_eq!(e[0].src, "/bin/echo");
        assert_eq!(e[0].dst, "/bin/echo");
        assert_eq!(e[0].kind, EntryKind::Copy);
    }

    #[test]
    fn comments_and_blanks_skipped() {
        let e = parse("# header\n\n   \n/bin/sh\n").unwrap();
        assert_eq!(e.len(), 1);
    }

    #[test]
    fn directory_lines_set_context() {
        let e = parse("usr/lib/:\nlibc.so.6\n/bin/true\n.:\netc/hosts\n").unwrap();
        assert_eq!(e[0].src, "/usr/lib/libc.so.6");
        assert_eq!(e[0].dst, "/usr/lib/libc.so.6");
        // absolute source under a directory context still lands in context dst
        assert_eq!(e[1].src, "/bin/true");
        assert_eq!(e[1].dst, "/usr/lib/bin/true");
        assert_eq!(e[2].src, "/etc/hosts");
        assert_eq!(e[2].dst, "/etc/hosts");
    }

    #[test]
    fn dot_slash_directory() {
        let e = parse("./opt/:\ntool\n").unwrap();
        assert_eq!(e[0].src, "/opt/tool");
    }

    #[test]
    fn arrow_overrides_source() {
        let e = parse("/etc/hosts <- /srv/hosts\n").unwrap();
        assert_eq!(e[0].src, "/srv/hosts");
        assert_eq!(e[0].dst, "/etc/hosts");
    }

    #[test]
    fn cp_flag() {
        let e = parse("/bin/sh [cp]\n").unwrap();
        assert_eq!(e[0].kind, EntryKind::CopyNoLink);
    }

    #[test]
    fn bind_flags() {
        let e = parse("/home/shared [bind]\n/x [bind-ro v3 /srv/files.txt]\n").unwrap();
        assert_eq!(
            e[0].kind,
            EntryKind::Bind {
                read_only: false,
                tag: None
            }
        );
        assert_eq!(
            e[1].kind,
            EntryKind::Bind {
                read_only: true,
                tag: Some(("v3".into(), "/srv/files.txt".into()))
            }
        );
    }

    #[test]
    fn mount_flag() {
        let e = parse("/tmp [mount tmpfs size=64m,mode=1777]\n").unwrap();
        assert_eq!(
            e[0].kind,
            EntryKind::Mount {
                fstype: "tmpfs".into(),
                args: "size=64m,mode=1777".into()
            }
        );
    }

    #[test]
    fn overlong_line_rejected() {
        let line = format!("/{}\n", "x".repeat(libc::PATH_MAX as usize));
        assert!(parse(&line).is_err());
    }
}
