//! Cgroup Manager: create/destroy the cgroup-v1 hierarchy, attach
//! PIDs, freeze/thaw, and enumerate+signal all member PIDs.

use std::path::{Path, PathBuf};
use std::thread::sleep;
use std::time::Duration;
use std::{fs, io};

use libc;
use log::{debug, info};

use super::err::{Error, Result};
use super::mapfile::MapFile;
use super::util;

/// Controller always present: the termination cascade depends on it
/// to make signal delivery atomic with respect to forking children.
pub const FREEZER: &str = "freezer";

const POLL_INTERVAL: Duration = Duration::from_micros(500);

#[derive(Debug, Clone)]
pub struct CgroupSpec {
    pub rootdir: PathBuf,
    pub group: String,
    pub name: String,
    controllers: Vec<String>,
}

impl CgroupSpec {
    pub fn new<S: Into<String>>(name: S) -> Self {
        let mut spec = CgroupSpec {
            rootdir: PathBuf::from("/sys/fs/cgroup"),
            group: "isolate".to_string(),
            name: name.into(),
            controllers: Vec::new(),
        };
        spec.add_controller(FREEZER);
        spec
    }

    /// Add a controller if not already present. Preserves insertion
    /// order, de-duplicates by name. `freezer` is guaranteed present
    /// at construction (P2: added unconditionally, exactly once).
    pub fn add_controller<S: AsRef<str>>(&mut self, controller: S) {
        let controller = controller.as_ref();
        if self.controllers.iter().any(|c| c == controller) {
            return;
        }
        self.controllers.push(controller.to_string());
    }

    /// Parse a comma-separated controller list (the `cgroups=` config
    /// key), adding each to the existing list.
    pub fn add_controllers_csv(&mut self, csv: &str) {
        for token in csv.split(',') {
            let token = token.trim();
            if !token.is_empty() {
                self.add_controller(token);
            }
        }
    }

    pub fn controllers(&self) -> &[String] {
        &self.controllers
    }

    fn group_dir(&self) -> PathBuf {
        self.rootdir.join(&self.group)
    }

    fn controller_dir(&self, controller: &str) -> PathBuf {
        self.group_dir().join(controller)
    }

    fn leaf_dir(&self, controller: &str) -> PathBuf {
        self.controller_dir(controller).join(&self.name)
    }

    fn freezer_state_file(&self) -> PathBuf {
        self.leaf_dir(FREEZER).join("freezer.state")
    }

    fn freezer_tasks_file(&self) -> PathBuf {
        self.leaf_dir(FREEZER).join("tasks")
    }
}

fn is_mountpoint(path: &Path) -> Result<bool> {
    let st = match fs::symlink_metadata(path) {
        Ok(st) => st,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(Error::file("lstat", path, e)),
    };
    let parent = path.join("..");
    let pst = fs::symlink_metadata(&parent).map_err(|e| Error::file("lstat", &parent, e))?;
    Ok(std::os::unix::fs::MetadataExt::dev(&st) != std::os::unix::fs::MetadataExt::dev(&pst))
}

fn make_directory(path: &Path) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(st) if st.is_dir() => Ok(()),
        Ok(_) => Err(Error::Config(format!("not a directory: {}", path.display()))),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            fs::create_dir(path).map_err(|e| Error::file("mkdir", path, e))
        }
        Err(e) => Err(Error::file("lstat", path, e)),
    }
}

fn mount_cgroup(path: &Path, controller: &str) -> Result<()> {
    util::mount_with_data("cgroup", path, "cgroup", 0, controller)
}

/// Create `{root}/{group}/{controller}` (mounting it if not already a
/// mountpoint) and a fresh leaf `{root}/{group}/{controller}/{name}`
/// for every controller. If the leaf already exists it is rmdir'd and
/// recreated; a still-busy leaf (the name is in use by a running
/// container) surfaces as an error.
pub fn cgroup_create(cg: &CgroupSpec) -> Result<()> {
    if cg.rootdir.as_os_str().is_empty() {
        return Ok(());
    }

    make_directory(&cg.group_dir())?;

    for controller in &cg.controllers {
        let cdir = cg.controller_dir(controller);
        make_directory(&cdir)?;

        if !is_mountpoint(&cdir)? {
            mount_cgroup(&cdir, controller)?;
        }

        let leaf = cg.leaf_dir(controller);
        match fs::create_dir(&leaf) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                fs::remove_dir(&leaf).map_err(|e| {
                    if e.raw_os_error() == Some(libc::EBUSY) {
                        Error::Config(format!(
                            "{}: directory already exists, unable to re-create",
                            leaf.display()
                        ))
                    } else {
                        Error::file("rmdir", &leaf, e)
                    }
                })?;
                fs::create_dir(&leaf).map_err(|e| Error::file("mkdir", &leaf, e))?;
            }
            Err(e) => return Err(Error::file("mkdir", &leaf, e)),
        }
    }

    Ok(())
}

/// Tear down every leaf and (if no longer busy) every controller
/// mount. Errors are logged, never propagated: another instance may
/// still share the `{group}` hierarchy.
pub fn cgroup_destroy(cg: &CgroupSpec) {
    if cg.rootdir.as_os_str().is_empty() {
        return;
    }

    for controller in &cg.controllers {
        let leaf = cg.leaf_dir(controller);
        if let Err(e) = fs::remove_dir(&leaf) {
            if e.kind() != io::ErrorKind::NotFound {
                info!("rmdir: {} : {}", leaf.display(), e);
            }
        }

        let cdir = cg.controller_dir(controller);
        let cpath = std::ffi::CString::new(cdir.to_string_lossy().as_bytes()).unwrap();
        let rc = unsafe { libc::umount(cpath.as_ptr()) };
        if rc == 0 {
            if let Err(e) = fs::remove_dir(&cdir) {
                if e.raw_os_error() != Some(libc::EBUSY) {
                    info!("rmdir: {} : {}", cdir.display(), e);
                }
            }
        }
    }
}

/// Write `pid` as decimal into every controller's `tasks` file.
pub fn cgroup_add(cg: &CgroupSpec, pid: libc::pid_t) -> Result<()> {
    for controller in &cg.controllers {
        let path = cg.leaf_dir(controller).join("tasks");
        debug!("attach pid={} to {}", pid, path.display());
        fs::write(&path, format!("{}", pid)).map_err(|e| Error::file("write tasks", &path, e))?;
    }
    Ok(())
}

fn cgroup_state(cg: &CgroupSpec, state: &'static str) -> Result<()> {
    use std::io::{Read, Seek, SeekFrom, Write};

    let path = cg.freezer_state_file();
    let mut file = fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(&path)
        .map_err(|e| Error::file("open", &path, e))?;

    file.write_all(state.as_bytes())
        .map_err(|e| Error::file("write freezer.state", &path, e))?;

    loop {
        file.seek(SeekFrom::Start(0))
            .map_err(|e| Error::file("lseek", &path, e))?;
        let mut buf = String::new();
        file.read_to_string(&mut buf)
            .map_err(|e| Error::file("read", &path, e))?;
        let buf = buf.trim_end_matches('\n');

        if buf == state || buf == "THAWED" {
            break;
        }
        sleep(POLL_INTERVAL);
    }

    Ok(())
}

pub fn cgroup_freeze(cg: &CgroupSpec) -> Result<()> {
    cgroup_state(cg, "FROZEN")
}

pub fn cgroup_unfreeze(cg: &CgroupSpec) -> Result<()> {
    cgroup_state(cg, "THAWED")
}

/// Read the freezer `tasks` file and send `signum` to every listed
/// PID; returns the count signalled. `0` means the cgroup has no
/// members left (or is already gone).
pub fn cgroup_signal(cg: &CgroupSpec, signum: libc::c_int) -> Result<usize> {
    let path = cg.freezer_tasks_file();
    let map = match MapFile::open(&path, true) {
        Ok(m) => m,
        Err(Error::File { io, .. }) if io.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };

    if map.is_empty() {
        return Ok(0);
    }

    let mut count = 0;
    for line in map.lines()? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let pid: libc::pid_t = line
            .parse()
            .map_err(|_| Error::parse(format!("unable to read pid: {:?}", line), &path))?;
        if unsafe { libc::kill(pid, signum) } < 0 {
            let io = io::Error::last_os_error();
            if io.raw_os_error() != Some(libc::ESRCH) {
                return Err(Error::os(format!("kill({},{})", pid, signum), io));
            }
            continue;
        }
        count += 1;
    }

    Ok(count)
}

/// Termination cascade: while member PIDs remain, freeze, signal with
/// the current escalation level, thaw, and sleep. Escalates
/// `SIGPWR -> SIGTERM -> SIGKILL`, remaining at `SIGKILL` once
/// reached.
pub fn kill_container(cg: &CgroupSpec) -> Result<()> {
    let mut signum = libc::SIGPWR;

    info!("killing container");

    while cgroup_signal(cg, 0)? > 0 {
        cgroup_freeze(cg)?;
        cgroup_signal(cg, signum)?;
        cgroup_unfreeze(cg)?;

        signum = match signum {
            libc::SIGPWR => libc::SIGTERM,
            libc::SIGTERM => libc::SIGKILL,
            other => other,
        };

        sleep(POLL_INTERVAL);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn freezer_present_exactly_once() {
        let mut cg = CgroupSpec::new("test");
        cg.add_controller("freezer");
        cg.add_controller("memory");
        cg.add_controller("freezer");
        let freezer_count = cg.controllers().iter().filter(|c| c.as_str() == FREEZER).count();
        assert_eq!(freezer_count, 1);
        assert_eq!(cg.controllers()[0], FREEZER);
    }

    #[test]
    fn controller_csv_parses_in_order() {
        let mut cg = CgroupSpec::new("test");
        cg.add_controllers_csv("memory,cpu,memory");
        assert_eq!(cg.controllers(), &["freezer", "memory", "cpu"]);
    }

    #[test]
    #[ignore] // requires a writable cgroup-v1 hierarchy
    fn create_then_destroy_is_idempotent() {
        let cg = CgroupSpec::new("isolate-test-cgroup");
        cgroup_create(&cg).unwrap();
        cgroup_destroy(&cg);
        cgroup_create(&cg).unwrap();
        cgroup_destroy(&cg);
    }

    #[test]
    fn create_and_destroy_are_noops_without_a_rootdir() {
        let mut cg = CgroupSpec::new("test");
        cg.rootdir = PathBuf::new();
        cgroup_create(&cg).unwrap();
        cgroup_destroy(&cg);
    }
}
