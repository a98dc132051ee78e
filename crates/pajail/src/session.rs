//! Run-session configuration: the jail user and everything a single `run`
//! carries through launch and supervision.

use std::ffi::CString;

use crate::error::{Error, Result};
use crate::pidfile::PidFile;

/// The target account a jailed program runs as.
#[derive(Debug, Clone)]
pub struct JailUser {
    pub uid: libc::uid_t,
    pub gid: libc::gid_t,
    /// Home directory; always under `/home/`.
    pub home: String,
    /// Login shell; must be whitelisted.
    pub shell: String,
}

impl JailUser {
    /// Look up `name` in the host user database and validate the account
    /// for jail use.
    pub fn lookup(name: &str) -> Result<JailUser> {
        if name.len() >= 1024 {
            return Err(Error::msg(format!("{name}: Username too long")));
        }
        let user = nix::unistd::User::from_name(name)
            .ok()
            .flatten()
            .ok_or_else(|| Error::msg(format!("{name}: No such user")))?;

        let dir = user.dir.to_string_lossy().into_owned();
        let home = if dir == "/" {
            "/home/nobody".to_string()
        } else if dir.starts_with("/home/") {
            dir
        } else {
            return Err(Error::msg(format!(
                "{name}: Home directory {dir} not under /home"
            )));
        };

        let shell = user.shell.to_string_lossy().into_owned();
        if !shell_allowed(&shell) {
            return Err(Error::msg(format!(
                "{name}: Shell {shell} not allowed by /etc/shells"
            )));
        }

        if user.uid.is_root() {
            return Err(Error::msg(format!("{name}: Jail user cannot be root")));
        }

        Ok(JailUser {
            uid: user.uid.as_raw(),
            gid: user.gid.as_raw(),
            home,
            shell,
        })
    }
}

/// `/bin/sh` and `/bin/bash` are always acceptable; anything else must be
/// listed in `/etc/shells`.
fn shell_allowed(shell: &str) -> bool {
    if shell == "/bin/sh" || shell == "/bin/bash" {
        return true;
    }
    std::fs::read_to_string("/etc/shells")
        .map(|text| {
            text.lines()
                .map(str::trim)
                .any(|l| !l.starts_with('#') && l == shell)
        })
        .unwrap_or(false)
}

/// Everything one `run` invocation needs beyond the jail directory.
pub struct RunSession {
    pub user: JailUser,
    /// `argv` used inside the jail: `[shell, "-l"]` or
    /// `[shell, "-l", "-c", command]`.
    pub argv: Vec<CString>,
    /// Curated environment for the jailed program.
    pub env: Vec<CString>,
    /// Caller input fd (0 = stdin, or an opened `--input` file).
    pub input_fd: libc::c_int,
    /// Listening event-source socket, or -1.
    pub event_fd: libc::c_int,
    /// Timing-record sink, or -1.
    pub timing_fd: libc::c_int,
    pub pid_file: Option<PidFile>,
    pub timeout: Option<f64>,
    pub idle_timeout: Option<f64>,
    /// Terminal size `(cols, rows)`; `None` leaves the PTY size alone.
    pub term_size: Option<(u16, u16)>,
    pub ready_marker: Option<String>,
    pub no_onlcr: bool,
    pub foreground: bool,
    pub quiet: bool,
    pub verbose: bool,
    pub caller_uid: libc::uid_t,
    pub caller_gid: libc::gid_t,
}

impl RunSession {
    pub fn new(user: JailUser) -> RunSession {
        RunSession {
            user,
            argv: Vec::new(),
            env: Vec::new(),
            input_fd: 0,
            event_fd: -1,
            timing_fd: -1,
            pid_file: None,
            timeout: None,
            idle_timeout: None,
            term_size: Some((80, 25)),
            ready_marker: None,
            no_onlcr: false,
            foreground: false,
            quiet: false,
            verbose: false,
            caller_uid: unsafe { libc::getuid() },
            caller_gid: unsafe { libc::getgid() },
        }
    }

    /// Build the curated environment and the shell argv from the positional
    /// words after `JAILDIR USER`. Leading `KEY=VALUE` words become
    /// environment overrides; the rest is the command.
    pub fn set_command(&mut self, words: &[String]) -> Result<()> {
        let (env, command) = curate_env(&self.user.home, words);
        self.env = env
            .iter()
            .map(|e| CString::new(e.as_str()))
            .collect::<std::result::Result<_, _>>()
            .map_err(|_| Error::msg("environment contains NUL byte"))?;

        let mut argv = vec![self.user.shell.clone(), "-l".to_string()];
        if !command.is_empty() {
            argv.push("-c".to_string());
            argv.push(command_string(command));
        }
        self.argv = argv
            .iter()
            .map(|a| CString::new(a.as_str()))
            .collect::<std::result::Result<_, _>>()
            .map_err(|_| Error::msg("command contains NUL byte"))?;
        Ok(())
    }
}

/// The environment the jailed program sees: `PATH`, `LANG`, `TERM` and
/// `LD_LIBRARY_PATH` pass through from the caller when set, `HOME` comes
/// from the target user, and leading `KEY=VALUE` arguments override
/// anything (late values win). Everything else is discarded.
pub fn curate_env<'w>(home: &str, words: &'w [String]) -> (Vec<String>, &'w [String]) {
    let mut env: Vec<String> = Vec::new();
    let mut path = String::from("PATH=/usr/local/bin:/bin:/usr/bin");
    let mut lang = String::from("LANG=C");
    let mut term = None;
    let mut ld_library_path = None;
    for (key, value) in std::env::vars_os() {
        let value = value.to_string_lossy();
        match key.to_str() {
            Some("PATH") => path = format!("PATH={value}"),
            Some("LANG") => lang = format!("LANG={value}"),
            Some("TERM") => term = Some(format!("TERM={value}")),
            Some("LD_LIBRARY_PATH") => {
                ld_library_path = Some(format!("LD_LIBRARY_PATH={value}"))
            }
            _ => {}
        }
    }
    env.push(path);
    env.push(lang);
    env.extend(term);
    env.extend(ld_library_path);
    env.push(format!("HOME={home}"));

    let mut rest = words;
    while let Some(word) = rest.first() {
        let Some((key, _)) = split_env_word(word) else {
            break;
        };
        match env
            .iter()
            .position(|e| e.split('=').next() == Some(key))
        {
            Some(i) => env[i] = word.clone(),
            None => env.push(word.clone()),
        }
        rest = &rest[1..];
    }
    (env, rest)
}

/// `KEY=VALUE` with a non-empty alphanumeric/underscore key.
fn split_env_word(word: &str) -> Option<(&str, &str)> {
    let (key, value) = word.split_once('=')?;
    if key.is_empty() || !key.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_') {
        return None;
    }
    Some((key, value))
}

/// One shell word runs verbatim; several are individually quoted.
fn command_string(words: &[String]) -> String {
    if words.len() == 1 {
        return words[0].clone();
    }
    words
        .iter()
        .map(|w| crate::paths::shell_quote(w))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_has_defaults_and_home() {
        let (env, rest) = curate_env("/home/alice", &[]);
        assert!(rest.is_empty());
        assert!(env.iter().any(|e| e.starts_with("PATH=")));
        assert!(env.iter().any(|e| e.starts_with("LANG=")));
        assert!(env.contains(&"HOME=/home/alice".to_string()));
        // nothing else from the caller environment leaks through
        for e in &env {
            let key = e.split('=').next().unwrap();
            assert!(
                matches!(key, "PATH" | "LANG" | "TERM" | "LD_LIBRARY_PATH" | "HOME"),
                "unexpected env var {key}"
            );
        }
    }

    #[test]
    fn leading_assignments_override() {
        let words: Vec<String> = ["LANG=fr_FR.UTF-8", "EXTRA=1", "EXTRA=2", "/bin/true"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let (env, rest) = curate_env("/home/bob", &words);
        assert_eq!(rest, &words[3..]);
        assert!(env.contains(&"LANG=fr_FR.UTF-8".to_string()));
        // late values win
        assert!(env.contains(&"EXTRA=2".to_string()));
        assert!(!env.contains(&"EXTRA=1".to_string()));
    }

    #[test]
    fn assignment_detection() {
        assert!(split_env_word("FOO=bar").is_some());
        assert!(split_env_word("F_2=x").is_some());
        assert!(split_env_word("=x").is_none());
        assert!(split_env_word("not an assignment").is_none());
        assert!(split_env_word("/bin/echo").is_none());
        assert!(split_env_word("A-B=x").is_none());
    }

    #[test]
    fn command_quoting() {
        let one: Vec<String> = vec!["echo $HOME".into()];
        assert_eq!(command_string(&one), "echo $HOME");
        let many: Vec<String> = vec!["/bin/echo".into(), "hello world".into()];
        assert_eq!(command_string(&many), "/bin/echo 'hello world'");
    }

    #[test]
    fn shell_whitelist_literals() {
        assert!(shell_allowed("/bin/sh"));
        assert!(shell_allowed("/bin/bash"));
        assert!(!shell_allowed("/bin/definitely-not-a-shell"));
    }
}
