//! Data model: the fully-resolved description of one container, built
//! up by [`super::config`] from the `[global]`/`[isolate NAME]`
//! sections and any `--section-*` CLI overrides, then consumed by
//! [`super::supervisor`].

use std::path::PathBuf;

use libc;

use super::capability::CapSet;
use super::cgroup::CgroupSpec;
use super::device::DeviceEntry;
use super::err::Result;
use super::mount::MountEntry;

#[derive(Debug)]
pub struct Container {
    pub name: String,
    pub argv: Vec<String>,
    pub root: Option<PathBuf>,
    pub hostname: Option<String>,
    pub devfile: Option<PathBuf>,
    pub envfile: Option<PathBuf>,
    pub seccomp: Option<PathBuf>,
    pub input: Option<PathBuf>,
    pub output: Option<PathBuf>,
    pub caps: CapSet,
    pub nice: Option<i32>,
    pub no_new_privs: bool,
    pub unshare_flags: libc::c_int,
    pub uid: Option<libc::uid_t>,
    pub gid: Option<libc::gid_t>,
    pub mounts: Vec<MountEntry>,
    pub devices: Vec<DeviceEntry>,
    pub cgroups: CgroupSpec,
}

impl Container {
    /// Fails if the running kernel's capability ABI is too old to
    /// support `CAP_SETFCAP` and above -- see
    /// [`CapSet::current`][super::capability::CapSet::current].
    pub fn new<S: Into<String>>(name: S) -> Result<Self> {
        let name = name.into();
        Ok(Container {
            cgroups: CgroupSpec::new(name.clone()),
            name,
            argv: Vec::new(),
            root: None,
            hostname: None,
            devfile: None,
            envfile: None,
            seccomp: None,
            input: None,
            output: None,
            caps: CapSet::current()?,
            nice: None,
            no_new_privs: false,
            // CLONE_FS is always unshared by default, not just when the
            // user lists "filesystem": otherwise chroot/chdir in the
            // grandchild could race against the parent's own cwd/root,
            // since CLONE_FS state (cwd, root, umask) is shared absent
            // an explicit unshare.
            unshare_flags: libc::CLONE_FS,
            uid: None,
            gid: None,
            mounts: Vec::new(),
            devices: Vec::new(),
        })
    }

    /// Toggle `CLONE_NEWUTS` on, as setting a hostname requires the
    /// UTS namespace to be private.
    pub fn set_hostname<S: Into<String>>(&mut self, hostname: S) {
        self.hostname = Some(hostname.into());
        self.unshare_flags |= libc::CLONE_NEWUTS;
    }

    /// Toggle `CLONE_NEWNS` on, as applying an fstab requires a
    /// private mount namespace.
    pub fn set_fstab(&mut self, mounts: Vec<MountEntry>) {
        self.mounts = mounts;
        self.unshare_flags |= libc::CLONE_NEWNS;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_container_carries_the_freezer_controller() {
        let c = Container::new("demo").unwrap();
        assert!(c.cgroups.controllers().iter().any(|n| n == "freezer"));
    }

    #[test]
    fn hostname_implies_uts_namespace() {
        let mut c = Container::new("demo").unwrap();
        c.set_hostname("box");
        assert_ne!(c.unshare_flags & libc::CLONE_NEWUTS, 0);
    }
}
