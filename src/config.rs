//! INI config loader: `[global]` settings plus one `[isolate NAME]` (or
//! `[isolate "NAME"]`) section per container, with CLI options applied
//! afterward so they override whatever the file says.

use std::path::{Path, PathBuf};

use ini::Ini;
use log::debug;

use super::err::{Error, Result};
use super::mount::parse_fstab;
use super::spec::Container;

/// Strip the `isolate` keyword and return the bare container name from
/// a section header, accepting both `isolate NAME` and
/// `isolate "NAME"` spellings.
fn section_container_name(section: &str) -> Option<&str> {
    let rest = section.strip_prefix("isolate")?;
    let rest = rest.trim_start();
    if rest.is_empty() {
        return None;
    }
    if rest.len() >= 2 && rest.starts_with('"') && rest.ends_with('"') {
        Some(&rest[1..rest.len() - 1])
    } else {
        Some(rest)
    }
}

pub struct GlobalSettings {
    pub verbose: u8,
    pub cgroups_dir: PathBuf,
    pub pid_dir: PathBuf,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        GlobalSettings {
            verbose: 0,
            cgroups_dir: PathBuf::from("/sys/fs/cgroup"),
            pid_dir: PathBuf::from("/var/run"),
        }
    }
}

pub fn load(path: &Path) -> Result<Ini> {
    Ini::load_from_file(path).map_err(|e| Error::parse(format!("{}", e), path))
}

pub fn read_global(ini: &Ini) -> Result<GlobalSettings> {
    let mut settings = GlobalSettings::default();

    if let Some(section) = ini.section(Some("global")) {
        if let Some(v) = section.get("verbose") {
            settings.verbose = v.parse().map_err(|_| Error::Config(format!("bad verbose value: {:?}", v)))?;
        }
        if let Some(v) = section.get("cgroups-dir") {
            settings.cgroups_dir = PathBuf::from(v);
        }
        if let Some(v) = section.get("pid-dir") {
            settings.pid_dir = PathBuf::from(v);
        }
    }

    Ok(settings)
}

pub fn pidfile_path(pid_dir: &Path, name: &str) -> PathBuf {
    pid_dir.join(format!("isolate-{}.pid", name))
}

/// Locate the `[isolate NAME]` section and populate a fresh
/// [`Container`] from its keys. A missing section is fatal: there is
/// nothing sensible to run.
pub fn read_container(ini: &Ini, name: &str) -> Result<Container> {
    let mut found = None;
    for (section, props) in ini.iter() {
        if let Some(section) = section {
            if let Some(cname) = section_container_name(section) {
                if cname == name {
                    found = Some(props);
                    break;
                }
            }
        }
    }

    let props = found.ok_or_else(|| Error::Config(format!("no such section: isolate {}", name)))?;
    let mut container = Container::new(name)?;

    if let Some(v) = props.get("root-dir") {
        container.root = Some(PathBuf::from(v));
    }
    if let Some(v) = props.get("hostname") {
        container.set_hostname(v.to_string());
    }
    if let Some(v) = props.get("input") {
        container.input = Some(PathBuf::from(v));
    }
    if let Some(v) = props.get("output") {
        container.output = Some(PathBuf::from(v));
    }
    if let Some(v) = props.get("devices-file") {
        check_readable(Path::new(v))?;
        container.devfile = Some(PathBuf::from(v));
    }
    if let Some(v) = props.get("environ-file") {
        check_readable(Path::new(v))?;
        container.envfile = Some(PathBuf::from(v));
    }
    if let Some(v) = props.get("seccomp-file") {
        container.seccomp = Some(resolve_seccomp_path(v)?);
    }
    if let Some(v) = props.get("fstab-file") {
        let text = std::fs::read_to_string(v).map_err(|e| Error::file("read", v, e))?;
        container.set_fstab(parse_fstab(&text)?);
    }
    if let Some(v) = props.get("cap-add") {
        container.caps.parse_additive(v, false)?;
    }
    if let Some(v) = props.get("cap-drop") {
        container.caps.parse_additive(v, true)?;
    }
    if let Some(v) = props.get("caps") {
        container.caps.parse_capsset(v)?;
    }
    if let Some(v) = props.get("uid") {
        container.uid = Some(v.parse().map_err(|_| Error::Config(format!("bad uid: {:?}", v)))?);
    }
    if let Some(v) = props.get("gid") {
        container.gid = Some(v.parse().map_err(|_| Error::Config(format!("bad gid: {:?}", v)))?);
    }
    if let Some(v) = props.get("unshare") {
        super::namespace::parse_unshare_flags(&mut container.unshare_flags, v)?;
    }
    if let Some(v) = props.get("cgroups") {
        container.cgroups.add_controllers_csv(v);
    }
    if let Some(v) = props.get("nice") {
        container.nice = Some(v.parse().map_err(|_| Error::Config(format!("bad nice: {:?}", v)))?);
    }
    if let Some(v) = props.get("no-new-privs") {
        container.no_new_privs = matches!(v, "1" | "true" | "yes");
    }
    if let Some(v) = props.get("init") {
        container.argv = split_argv(v);
    }

    Ok(container)
}

fn check_readable(path: &Path) -> Result<()> {
    let cpath = std::ffi::CString::new(path.to_string_lossy().as_bytes()).map_err(|_| Error::BadStr)?;
    if unsafe { libc::access(cpath.as_ptr(), libc::R_OK) } != 0 {
        return Err(Error::last_file_error("access", path));
    }
    Ok(())
}

/// `$ARCH`/`$RELEASE` substitution for the seccomp policy path: the
/// substituted path is tried first, and only if that file is unreadable
/// does the literal (unsubstituted) path get tried, erroring if that is
/// also missing.
pub fn resolve_seccomp_path(template: &str) -> Result<PathBuf> {
    let (arch, release) = uname_arch_release();
    let arch = arch.unwrap_or_else(|| "unknown".to_string());
    let release = release.unwrap_or_else(|| "unknown".to_string());
    let substituted = template.replace("$ARCH", &arch).replace("$RELEASE", &release);
    let substituted = PathBuf::from(substituted);
    if check_readable(&substituted).is_ok() {
        return Ok(substituted);
    }

    let literal = PathBuf::from(template);
    check_readable(&literal)?;
    Ok(literal)
}

/// `uname(2)`'s `machine`/`release` fields, used for `$ARCH`/`$RELEASE`
/// substitution. Reading the running kernel's own idea of the
/// architecture rather than the build target's matches what a
/// cross-compiled binary would see on the box it actually runs on.
fn uname_arch_release() -> (Option<String>, Option<String>) {
    let mut uts: libc::utsname = unsafe { std::mem::zeroed() };
    if unsafe { libc::uname(&mut uts) } != 0 {
        return (None, None);
    }
    let machine = unsafe { std::ffi::CStr::from_ptr(uts.machine.as_ptr()) };
    let release = unsafe { std::ffi::CStr::from_ptr(uts.release.as_ptr()) };
    (
        Some(machine.to_string_lossy().into_owned()),
        Some(release.to_string_lossy().into_owned()),
    )
}

/// Whitespace-tokenize the `init=` command line.
fn split_argv(line: &str) -> Vec<String> {
    line.split_whitespace().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unquoted_section_name_matches() {
        assert_eq!(section_container_name("isolate build"), Some("build"));
    }

    #[test]
    fn quoted_section_name_is_unquoted() {
        assert_eq!(section_container_name("isolate \"my box\""), Some("my box"));
    }

    #[test]
    fn global_section_is_not_a_container() {
        assert_eq!(section_container_name("global"), None);
    }

    #[test]
    fn split_argv_tokenizes_on_whitespace() {
        assert_eq!(split_argv("/bin/sh -c  'echo hi'"), vec!["/bin/sh", "-c", "'echo", "hi'"]);
    }

    #[test]
    fn seccomp_path_falls_back_to_literal_when_substituted_is_missing() {
        let dir = std::env::temp_dir().join(format!("isolate-seccomp-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let template = dir.join("$ARCH.bpf");
        std::fs::write(&template, b"literal-policy").unwrap();

        let resolved = resolve_seccomp_path(template.to_str().unwrap()).unwrap();
        assert_eq!(resolved, template);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn seccomp_path_prefers_substituted_when_present() {
        let dir = std::env::temp_dir().join(format!("isolate-seccomp-test-sub-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let (arch, _) = uname_arch_release();
        let arch = arch.unwrap();
        let substituted = dir.join(format!("{}.bpf", arch));
        std::fs::write(&substituted, b"substituted-policy").unwrap();

        let template = dir.join("$ARCH.bpf");
        let resolved = resolve_seccomp_path(template.to_str().unwrap()).unwrap();
        assert_eq!(resolved, substituted);

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
