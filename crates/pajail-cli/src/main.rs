//! pa-jail - set up and run per-user filesystem jails.

use std::io::Read;

use anyhow::{bail, Context};
use clap::{ArgAction, ArgMatches, Args, CommandFactory, FromArgMatches, Parser, Subcommand};

use pajail::error::exit;
use pajail::jaildir::JailAction;
use pajail::mounts::MountPhase;
use pajail::{
    FsOps, JailDir, JailUser, Launcher, Materializer, MountPlanner, Policy, RunSession, TtyState,
};

#[derive(Parser)]
#[command(
    name = "pa-jail",
    about = "Set up and run per-user filesystem jails",
    disable_help_flag = true,
    disable_version_flag = true
)]
struct Cli {
    #[arg(short = 'H', long = "help", action = ArgAction::Help, global = true,
          help = "Print help")]
    help: Option<bool>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct CommonArgs {
    /// Print actions that would be taken, don't run them
    #[arg(short = 'n', long = "dry-run")]
    dry_run: bool,

    /// Print actions as well as running them
    #[arg(short = 'V', long = "verbose")]
    verbose: bool,
}

#[derive(Args)]
struct PopulateArgs {
    /// Populate jail from SKELDIR
    #[arg(short = 'S', long = "skeleton", value_name = "SKELDIR")]
    skeleton: Option<String>,

    /// Populate jail with manifest from FILE (- for stdin)
    #[arg(short = 'f', long = "manifest-file", visible_alias = "contents-file",
          value_name = "FILE", action = ArgAction::Append)]
    manifest_file: Vec<String>,

    /// Populate jail with MANIFEST text
    #[arg(short = 'F', long = "manifest", visible_alias = "contents",
          value_name = "MANIFEST", action = ArgAction::Append)]
    manifest: Vec<String>,

    /// Change ownership of USER homedir
    #[arg(short = 'h', long = "chown-home")]
    chown_home: bool,

    /// Recursively chown DIR to USER
    #[arg(short = 'u', long = "chown-user", value_name = "DIR", action = ArgAction::Append)]
    chown_user: Vec<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or augment a jail
    #[command(alias = "init", disable_help_flag = true)]
    Add {
        #[command(flatten)]
        common: CommonArgs,
        #[command(flatten)]
        populate: PopulateArgs,
        jaildir: String,
        user: Option<String>,
    },

    /// Run a command as a user inside a jail
    #[command(disable_help_flag = true)]
    Run {
        #[command(flatten)]
        common: CommonArgs,
        #[command(flatten)]
        populate: PopulateArgs,

        /// Write jail process PID to PIDFILE
        #[arg(short = 'p', long = "pid-file", value_name = "PIDFILE")]
        pid_file: Option<String>,

        /// Write STR to PIDFILE ($$ expands to the child pid)
        #[arg(short = 'P', long = "pid-contents", value_name = "STR", default_value = "$$")]
        pid_contents: String,

        /// Kill the jail after TIMEOUT seconds
        #[arg(short = 'T', long = "timeout", value_name = "TIMEOUT")]
        timeout: Option<f64>,

        /// Kill the jail after TIMEOUT idle seconds
        #[arg(short = 'I', long = "idle-timeout", value_name = "TIMEOUT")]
        idle_timeout: Option<f64>,

        /// Use TTY, read input from INPUT (fifos opened read-write)
        #[arg(short = 'i', long = "input", value_name = "INPUT")]
        input: Option<String>,

        /// Listen on UNIX SOCK for event source connections
        #[arg(long = "event-source", value_name = "SOCK")]
        event_source: Option<String>,

        /// Write STR to stdout when ready
        #[arg(long = "ready", value_name = "STR", num_args = 0..=1,
              default_missing_value = "\n")]
        ready: Option<String>,

        /// Don't translate \n -> \r\n in output
        #[arg(long = "no-onlcr", overrides_with = "onlcr")]
        no_onlcr: bool,
        #[arg(long = "onlcr", overrides_with = "no_onlcr", hide = true)]
        onlcr: bool,

        /// Set terminal size WxH, or "none" [default: 80x25]
        #[arg(long = "size", value_name = "WxH")]
        size: Option<String>,

        /// Append timing records to FILE
        #[arg(short = 't', long = "timing-file", value_name = "FILE")]
        timing_file: Option<String>,

        /// Don't print the timeout/termination banner
        #[arg(short = 'q', long = "quiet")]
        quiet: bool,

        /// Run in the foreground
        #[arg(long = "fg", overrides_with = "bg")]
        fg: bool,
        #[arg(long = "bg", overrides_with = "fg", hide = true)]
        bg: bool,

        jaildir: String,
        user: Option<String>,
        /// [NAME=VALUE...] COMMAND...
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },

    /// Safely move a jail
    #[command(disable_help_flag = true)]
    Mv {
        #[command(flatten)]
        common: CommonArgs,
        source: String,
        dest: String,
    },

    /// Unmount and remove a jail
    #[command(disable_help_flag = true)]
    Rm {
        #[command(flatten)]
        common: CommonArgs,
        /// Do not complain if JAILDIR doesn't exist
        #[arg(short = 'f', long = "force")]
        force: bool,
        /// Run in the background
        #[arg(long = "bg")]
        bg: bool,
        jaildir: String,
    },
}

fn main() {
    env_logger::init();
    let tty = TtyState::capture();

    let matches = match Cli::command().try_get_matches() {
        Ok(m) => m,
        Err(e) => {
            let code = if e.kind() == clap::error::ErrorKind::DisplayHelp {
                0
            } else {
                exit::FATAL
            };
            let _ = e.print();
            std::process::exit(code);
        }
    };
    let cli = match Cli::from_arg_matches(&matches) {
        Ok(c) => c,
        Err(e) => {
            let _ = e.print();
            std::process::exit(exit::FATAL);
        }
    };

    if let Err(err) = dispatch(cli, &matches, tty) {
        eprintln!("{err}");
        std::process::exit(exit::FATAL);
    }
}

fn dispatch(cli: Cli, matches: &ArgMatches, tty: TtyState) -> anyhow::Result<()> {
    match cli.command {
        Commands::Add {
            common,
            populate,
            jaildir,
            user,
        } => {
            let manifest = gather_manifest(matches.subcommand().unwrap().1)?;
            add_or_run(AddOrRun {
                common,
                populate,
                manifest,
                jaildir,
                user,
                run: None,
                tty,
            })
        }
        Commands::Run {
            common,
            populate,
            pid_file,
            pid_contents,
            timeout,
            idle_timeout,
            input,
            event_source,
            ready,
            no_onlcr,
            onlcr: _,
            size,
            timing_file,
            quiet,
            fg,
            bg: _,
            jaildir,
            user,
            command,
        } => {
            let manifest = gather_manifest(matches.subcommand().unwrap().1)?;
            if fg && (input.is_some() || event_source.is_some()) {
                bail!("--fg cannot be combined with --input or --event-source");
            }
            let run = Some(RunArgs {
                pid_file,
                pid_contents,
                timeout,
                idle_timeout,
                input,
                event_source,
                ready,
                no_onlcr,
                size: parse_size(size.as_deref())?,
                timing_file,
                quiet,
                foreground: fg,
                command,
            });
            add_or_run(AddOrRun {
                common,
                populate,
                manifest,
                jaildir,
                user,
                run,
                tty,
            })
        }
        Commands::Mv {
            common,
            source,
            dest,
        } => do_mv(common, &source, &dest),
        Commands::Rm {
            common,
            force,
            bg,
            jaildir,
        } => do_rm(common, force, bg, &jaildir),
    }
}

struct RunArgs {
    pid_file: Option<String>,
    pid_contents: String,
    timeout: Option<f64>,
    idle_timeout: Option<f64>,
    input: Option<String>,
    event_source: Option<String>,
    ready: Option<String>,
    no_onlcr: bool,
    size: Option<(u16, u16)>,
    timing_file: Option<String>,
    quiet: bool,
    foreground: bool,
    command: Vec<String>,
}

struct AddOrRun {
    common: CommonArgs,
    populate: PopulateArgs,
    manifest: String,
    jaildir: String,
    user: Option<String>,
    run: Option<RunArgs>,
    tty: TtyState,
}

fn add_or_run(req: AddOrRun) -> anyhow::Result<()> {
    let AddOrRun {
        common,
        populate,
        manifest,
        jaildir,
        user,
        run,
        tty,
    } = req;
    let mut ops = FsOps::new(common.verbose || common.dry_run, common.dry_run);

    // `run` without a user and command word degrades to `add`
    let will_run = matches!(&run, Some(r) if user.is_some() && !r.command.is_empty());

    let jail_user = user.as_deref().map(JailUser::lookup).transpose()?;

    // demote the effective identity before touching caller-supplied files
    let caller_uid = unsafe { libc::getuid() };
    let caller_gid = unsafe { libc::getgid() };
    if !common.dry_run {
        if unsafe { libc::seteuid(caller_uid) } != 0 {
            bail!("seteuid: {}", std::io::Error::last_os_error());
        }
        if unsafe { libc::setegid(caller_gid) } != 0 {
            bail!("setegid: {}", std::io::Error::last_os_error());
        }
    }

    if will_run {
        pajail::fsops::close_extra_fds();
    }

    let mut pid_file = None;
    let mut input_fd: libc::c_int = 0;
    let mut event_fd: libc::c_int = -1;
    let mut timing_fd: libc::c_int = -1;
    if let Some(r) = &run {
        if let Some(path) = &r.pid_file {
            ops.echo(format_args!("touch {path}\nflock {path}"));
            if !common.dry_run {
                pid_file = Some(pajail::pidfile::PidFile::open(path, &r.pid_contents)?);
            }
        }
        if let Some(path) = &r.input {
            if !common.dry_run {
                input_fd = open_input(path)?;
            }
        }
        if let Some(path) = &r.event_source {
            ops.echo(format_args!("socket {path}"));
            if !common.dry_run {
                event_fd = pajail::eventsource::bind_listener(path)?;
            }
        }
        if let Some(path) = &r.timing_file {
            ops.echo(format_args!("touch {path}"));
            if !common.dry_run {
                timing_fd = open_timing(path)?;
            }
        }
    }

    // real root from here on: the jail machinery requires it
    if !common.dry_run {
        if !pajail::supervisor::set_gids(0, 0, 0) {
            bail!("setresgid: {}", std::io::Error::last_os_error());
        }
        if !pajail::supervisor::set_uids(0, 0, 0) {
            bail!("setresuid: {}", std::io::Error::last_os_error());
        }
    }

    let policy = Policy::load()?;
    let action = if will_run { JailAction::Run } else { JailAction::Add };
    let jail = JailDir::resolve(
        &jaildir,
        populate.skeleton.as_deref(),
        action,
        false,
        &policy,
        &mut ops,
    )?
    .context("jail directory missing")?;

    let phase = if will_run { MountPhase::PreFork } else { MountPhase::Add };
    let mut planner = MountPlanner::new(phase);

    // skeleton root must exist before anything links into it
    if let Some(skel) = &jail.skeleton {
        ops.ensure_dir(skel, 0o755, true)?;
    }

    // create the home directory in jail and skeleton
    if let Some(ju) = &jail_user {
        let jd = pajail::paths::no_end_slash(&jail.dir);
        ops.ensure_dir(&format!("{jd}/home"), 0o755, true)?;
        let jailhome = format!("{jd}{}", ju.home);
        let created = ops.ensure_dir(&jailhome, 0o700, true)?;
        let (want_uid, want_gid) = if will_run {
            (ju.uid, ju.gid)
        } else {
            (caller_uid, caller_gid)
        };
        if created {
            ops.lchown(&jailhome, want_uid, want_gid)?;
        }
        if let Some(skel) = &jail.skeleton {
            let sd = pajail::paths::no_end_slash(skel);
            let _ = ops.ensure_dir(&format!("{sd}/home"), 0o755, true);
            let skelhome = format!("{sd}{}", ju.home);
            if let Ok(true) = ops.ensure_dir(&skelhome, 0o700, true) {
                let _ = ops.lchown(&skelhome, ju.uid, ju.gid);
            }
        }
    }

    if populate.chown_home {
        jail.chown_home(&ops, &mut planner)?;
    }
    for dir in &populate.chown_user {
        let dir = pajail::paths::absolute(dir);
        let decision = policy.allow_jail_subdir(&dir);
        if !decision.allowed {
            bail!(
                "{dir}: --chown-user directory disabled by {}\n{}",
                pajail::policy::CONFIG_PATH,
                decision.disable_message()
            );
        }
        let ju = jail_user
            .as_ref()
            .context("--chown-user requires a jail user")?;
        jail.chown_user_dir(&ops, &mut planner, &dir, ju.uid, ju.gid)?;
    }

    if !manifest.is_empty() {
        let old_umask = unsafe { libc::umask(0) };
        let skel = jail.skeleton.clone();
        let mut mat = Materializer::new(
            &mut ops,
            &mut planner,
            &pajail::paths::no_end_slash(&jail.dir),
            skel.as_deref(),
        );
        let r = mat.construct(&manifest, false);
        unsafe { libc::umask(old_umask) };
        r?;
    }

    let mut jail = jail;
    jail.close_parent();

    if will_run {
        let r = run.unwrap();
        let ju = jail_user.unwrap();
        let mut session = RunSession::new(ju);
        session.set_command(&r.command)?;
        session.input_fd = input_fd;
        session.event_fd = event_fd;
        session.timing_fd = timing_fd;
        session.pid_file = pid_file;
        session.timeout = r.timeout;
        session.idle_timeout = r.idle_timeout;
        session.term_size = r.size;
        session.ready_marker = r.ready;
        session.no_onlcr = r.no_onlcr;
        session.foreground = r.foreground;
        session.quiet = r.quiet;
        session.verbose = common.verbose;
        session.caller_uid = caller_uid;
        session.caller_gid = caller_gid;

        let launcher = Launcher {
            session,
            jail: &jail,
            ops: &mut ops,
            planner: &mut planner,
        };
        launcher.exec(tty)?;
        unreachable!("launcher.exec does not return");
    }

    Ok(())
}

fn do_mv(common: CommonArgs, source: &str, dest: &str) -> anyhow::Result<()> {
    let mut ops = FsOps::new(common.verbose || common.dry_run, common.dry_run);
    escalate(common.dry_run)?;
    let policy = Policy::load()?;
    let jail = JailDir::resolve(source, None, JailAction::Mv, false, &policy, &mut ops)?
        .context("jail directory missing")?;

    let mut newpath = pajail::paths::check_filename(&pajail::paths::absolute(dest))
        .filter(|p| p.starts_with('/'))
        .with_context(|| format!("{dest}: Bad characters in move destination"))?;

    // an existing directory destination receives the jail by name
    if std::fs::metadata(&newpath).map(|m| m.is_dir()).unwrap_or(false) {
        newpath = format!("{}{}", pajail::paths::end_slash(&newpath), jail.component);
    }

    let decision = policy.allow_jail(&newpath);
    if !decision.allowed {
        bail!(
            "{newpath}: Destination jail disabled by {}\n{}",
            pajail::policy::CONFIG_PATH,
            decision.disable_message()
        );
    }

    jail.rename_to(&ops, &newpath)?;
    Ok(())
}

fn do_rm(common: CommonArgs, force: bool, bg: bool, jaildir: &str) -> anyhow::Result<()> {
    let mut ops = FsOps::new(common.verbose || common.dry_run, common.dry_run);
    escalate(common.dry_run)?;
    let policy = Policy::load()?;
    let Some(jail) =
        JailDir::resolve(jaildir, None, JailAction::Rm, force, &policy, &mut ops)?
    else {
        return Ok(()); // --force and nothing there
    };

    if !common.dry_run && bg {
        let pid = unsafe { libc::fork() };
        if pid > 0 {
            std::process::exit(0);
        } else if pid < 0 {
            bail!("fork: {}", std::io::Error::last_os_error());
        }
    }

    // unmount everything mounted under the jail before deleting
    let mut planner = MountPlanner::new(MountPhase::Add);
    planner.populate()?;
    for point in planner.points_under(&jail.dir) {
        planner.umount(&ops, &point)?;
    }
    jail.remove(&ops, &planner)?;
    Ok(())
}

fn escalate(dry_run: bool) -> anyhow::Result<()> {
    if !dry_run {
        if !pajail::supervisor::set_gids(0, 0, 0) {
            bail!("setresgid: {}", std::io::Error::last_os_error());
        }
        if !pajail::supervisor::set_uids(0, 0, 0) {
            bail!("setresuid: {}", std::io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Concatenate `-f` and `-F` manifests in command-line order.
fn gather_manifest(sub: &ArgMatches) -> anyhow::Result<String> {
    let mut pieces: Vec<(usize, String)> = Vec::new();
    if let (Some(indices), Some(values)) = (
        sub.indices_of("manifest_file"),
        sub.get_many::<String>("manifest_file"),
    ) {
        for (i, path) in indices.zip(values) {
            pieces.push((i, manifest_file_contents(path)?));
        }
    }
    if let (Some(indices), Some(values)) =
        (sub.indices_of("manifest"), sub.get_many::<String>("manifest"))
    {
        for (i, text) in indices.zip(values) {
            pieces.push((i, text.clone()));
        }
    }
    pieces.sort_by_key(|(i, _)| *i);

    let mut manifest = String::new();
    for (_, piece) in pieces {
        manifest.push_str(&piece);
        if !manifest.is_empty() && !manifest.ends_with('\n') {
            manifest.push('\n');
        }
    }
    Ok(manifest)
}

fn manifest_file_contents(path: &str) -> anyhow::Result<String> {
    if path == "-" {
        if unsafe { libc::isatty(0) } == 1 {
            bail!("stdin: Is a tty");
        }
        let mut text = String::new();
        std::io::stdin()
            .read_to_string(&mut text)
            .context("stdin")?;
        return Ok(text);
    }
    std::fs::read_to_string(path).with_context(|| path.to_string())
}

/// `--input` fifos open read-write so the jail never sees EOF on them.
fn open_input(path: &str) -> anyhow::Result<libc::c_int> {
    use std::os::unix::fs::FileTypeExt;
    let mode = match std::fs::metadata(path) {
        Ok(m) if m.file_type().is_fifo() => libc::O_RDWR,
        _ => libc::O_RDONLY,
    };
    let c = std::ffi::CString::new(path).context("input path")?;
    let fd = unsafe { libc::open(c.as_ptr(), mode | libc::O_CLOEXEC | libc::O_NONBLOCK) };
    if fd < 0 {
        bail!("{path}: {}", std::io::Error::last_os_error());
    }
    Ok(fd)
}

fn open_timing(path: &str) -> anyhow::Result<libc::c_int> {
    let c = std::ffi::CString::new(path).context("timing path")?;
    let fd = unsafe {
        libc::open(
            c.as_ptr(),
            libc::O_WRONLY | libc::O_CLOEXEC | libc::O_CREAT | libc::O_TRUNC,
            0o666,
        )
    };
    if fd < 0 {
        bail!("{path}: {}", std::io::Error::last_os_error());
    }
    Ok(fd)
}

fn parse_size(size: Option<&str>) -> anyhow::Result<Option<(u16, u16)>> {
    match size {
        None => Ok(Some((80, 25))),
        Some("none") => Ok(None),
        Some(s) => {
            let (w, h) = s.split_once('x').context("--size expects WxH")?;
            let w: u16 = w.parse().context("--size width")?;
            let h: u16 = h.parse().context("--size height")?;
            if w == 0 || h == 0 {
                bail!("--size expects positive dimensions");
            }
            Ok(Some((w, h)))
        }
    }
}
