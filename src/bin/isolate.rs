//! `isolate` command line: `isolate [options] {start|stop|status} NAME`.

use std::path::PathBuf;
use std::process;

use isolate::config;
use isolate::context::RuntimeContext;
use isolate::err::Error;
use isolate::pidfile;
use isolate::supervisor;
use isolate::util::geteuid;

const USAGE: &str = "\
Usage: isolate [options] {start|stop|status} NAME

Global options:
  -b, --background         run the supervisor in the background
  -c, --config=FILE        configuration file (default: /etc/isolate.conf)
  -C, --cgroups-dir=DIR    cgroup-v1 mount root (default: /sys/fs/cgroup)
  -p, --pidfile=FILE       override the computed pidfile path
  -v, --verbose            increase verbosity (repeatable)
  -V, --version            print version and exit
  -h, --help                print this message and exit

Per-container overrides (applied after the config file):
      --name=NAME          container name (same as the NAME argument)
      --root-dir=DIR       new root directory
      --hostname=NAME      hostname inside the UTS namespace
      --input=FILE         reopen stdin onto FILE
      --output=FILE        reopen stdout/stderr onto FILE
      --devices-file=FILE  device node description file
      --environ-file=FILE  environment description file
      --seccomp-file=FILE  compiled seccomp-bpf filter
      --fstab-file=FILE    mount table
      --cap-add=LIST       add capabilities
      --cap-drop=LIST      drop capabilities
      --uid=UID            uid to assume before exec
      --gid=GID            gid to assume before exec
      --unshare=LIST       namespaces to unshare
      --cgroups=LIST       extra cgroup controllers
      --nice=N             nice value
      --no-new-privs       set PR_SET_NO_NEW_PRIVS
      --init=CMDLINE       program to execute
";

const VERSION: &str = concat!("isolate ", env!("CARGO_PKG_VERSION"));

/// Exit code for "pidfile already held by a running instance": distinct
/// from the generic fatal-error code so a caller's init script can tell
/// "already running" apart from "actually failed".
const ALREADY_RUNNING_EXIT: i32 = 3;

struct Options {
    config: PathBuf,
    cgroups_dir: Option<PathBuf>,
    pidfile: Option<PathBuf>,
    background: bool,
    verbose: u8,
    cmd: String,
    name: String,
    overrides: Vec<(String, String)>,
}

fn parse_args() -> Result<Options, Error> {
    let mut args = std::env::args().skip(1).peekable();

    let mut config = PathBuf::from("/etc/isolate.conf");
    let mut cgroups_dir = None;
    let mut pidfile = None;
    let mut background = false;
    let mut verbose = 0u8;

    let mut positional = Vec::new();
    let mut overrides = Vec::new();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-h" | "--help" => {
                print!("{}", USAGE);
                process::exit(0);
            }
            "-V" | "--version" => {
                println!("{}", VERSION);
                process::exit(0);
            }
            "-b" | "--background" => background = true,
            "-v" | "--verbose" => verbose += 1,
            "-c" | "--config" => {
                config = PathBuf::from(args.next().ok_or_else(|| Error::Config("--config requires a value".to_string()))?);
            }
            "-C" | "--cgroups-dir" => {
                cgroups_dir = Some(PathBuf::from(args.next().ok_or_else(|| Error::Config("--cgroups-dir requires a value".to_string()))?));
            }
            "-p" | "--pidfile" => {
                pidfile = Some(PathBuf::from(args.next().ok_or_else(|| Error::Config("--pidfile requires a value".to_string()))?));
            }
            long if long.starts_with("--") => {
                let (key, value) = split_long_opt(long, &mut args)?;
                overrides.push((key, value));
            }
            positional_arg => positional.push(positional_arg.to_string()),
        }
    }

    if positional.len() < 2 {
        return Err(Error::Config("expected a command and a container name".to_string()));
    }

    Ok(Options {
        config,
        cgroups_dir,
        pidfile,
        background,
        verbose,
        cmd: positional[0].clone(),
        name: positional[1].clone(),
        overrides,
    })
}

/// `--key value` or `--key=value`, both accepted.
fn split_long_opt(arg: &str, rest: &mut std::iter::Peekable<impl Iterator<Item = String>>) -> Result<(String, String), Error> {
    let body = &arg[2..];
    if let Some(eq) = body.find('=') {
        return Ok((body[..eq].to_string(), body[eq + 1..].to_string()));
    }
    if body == "no-new-privs" {
        return Ok((body.to_string(), "1".to_string()));
    }
    let value = rest
        .next()
        .ok_or_else(|| Error::Config(format!("--{} requires a value", body)))?;
    Ok((body.to_string(), value))
}

/// Apply `--key value` overrides directly into the ini-derived
/// container the same way config keys would, by round-tripping through
/// the container's setters. Kept deliberately small: only the keys
/// documented in [`USAGE`] are recognised.
fn apply_overrides(container: &mut isolate::spec::Container, overrides: &[(String, String)]) -> Result<(), Error> {
    for (key, value) in overrides {
        match key.as_str() {
            "name" => {}
            "root-dir" => container.root = Some(PathBuf::from(value)),
            "hostname" => container.set_hostname(value.clone()),
            "input" => container.input = Some(PathBuf::from(value)),
            "output" => container.output = Some(PathBuf::from(value)),
            "devices-file" => container.devfile = Some(PathBuf::from(value)),
            "environ-file" => container.envfile = Some(PathBuf::from(value)),
            "seccomp-file" => container.seccomp = Some(config::resolve_seccomp_path(value)?),
            "fstab-file" => {
                let text = std::fs::read_to_string(value).map_err(|e| Error::file("read", value, e))?;
                container.set_fstab(isolate::mount::parse_fstab(&text)?);
            }
            "cap-add" => container.caps.parse_additive(value, false)?,
            "cap-drop" => container.caps.parse_additive(value, true)?,
            "uid" => container.uid = Some(value.parse().map_err(|_| Error::Config(format!("bad uid: {:?}", value)))?),
            "gid" => container.gid = Some(value.parse().map_err(|_| Error::Config(format!("bad gid: {:?}", value)))?),
            "unshare" => isolate::namespace::parse_unshare_flags(&mut container.unshare_flags, value)?,
            "cgroups" => container.cgroups.add_controllers_csv(value),
            "nice" => container.nice = Some(value.parse().map_err(|_| Error::Config(format!("bad nice: {:?}", value)))?),
            "no-new-privs" => container.no_new_privs = true,
            "init" => container.argv = value.split_whitespace().map(|s| s.to_string()).collect(),
            other => return Err(Error::Config(format!("unknown option: --{}", other))),
        }
    }
    Ok(())
}

fn run() -> Result<i32, Error> {
    let opts = parse_args()?;

    let ini = config::load(&opts.config)?;
    let global = config::read_global(&ini)?;
    let verbose = opts.verbose.max(global.verbose);

    isolate::logging::setup(verbose).map_err(|_| Error::Config("logger already initialized".to_string()))?;

    if opts.cmd != "start" && geteuid() != 0 {
        log::warn!("not running as root; most isolation features require it");
    }

    let mut ctx = RuntimeContext::new(opts.config.clone());
    ctx.verbose = verbose;
    ctx.background = opts.background;

    let cgroups_dir = opts.cgroups_dir.unwrap_or(global.cgroups_dir);
    let pidfile_path = opts.pidfile.unwrap_or_else(|| config::pidfile_path(&global.pid_dir, &opts.name));
    ctx.pidfile_path = pidfile_path.clone();

    match opts.cmd.as_str() {
        "start" => {
            let mut container = config::read_container(&ini, &opts.name)?;
            container.cgroups.rootdir = cgroups_dir;
            apply_overrides(&mut container, &opts.overrides)?;

            match supervisor::start(&ctx, &mut container) {
                Ok(status) => Ok(status.code),
                Err(Error::AlreadyRunning) => {
                    log::info!("{} is already running", opts.name);
                    Ok(ALREADY_RUNNING_EXIT)
                }
                Err(e) => Err(e),
            }
        }
        "stop" => match pidfile::stop(&pidfile_path) {
            Ok(()) => Ok(0),
            Err(Error::NotRunning) => {
                eprintln!("{} is not running", opts.name);
                Ok(1)
            }
            Err(e) => Err(e),
        },
        "status" => match pidfile::status(&pidfile_path) {
            Ok(()) => {
                println!("{} is running", opts.name);
                Ok(0)
            }
            Err(Error::NotRunning) => {
                println!("{} is not running", opts.name);
                Ok(1)
            }
            Err(e) => Err(e),
        },
        other => Err(Error::Config(format!("unknown command: {:?} (expected start/stop/status)", other))),
    }
}

fn main() {
    match run() {
        Ok(code) => process::exit(code),
        Err(e) => {
            eprintln!("isolate: {}", e);
            process::exit(2);
        }
    }
}
