//! Container Init: the grandchild process, `PID 1` in its own pid
//! namespace once reparented. Runs the fixed setup sequence and
//! finally `execvp`s the container's program.

use std::ffi::CString;
use std::os::unix::net::UnixStream;

use libc;
use log::{debug, info};

use super::context::{set_role, Role};
use super::device;
use super::err::Error;
use super::fds;
use super::handshake::{self, Kind};
use super::mapfile::MapFile;
use super::mount;
use super::spec::Container;

/// Never returns: either `execvp`s the container program, or calls
/// `std::process::exit` on any setup failure.
pub fn run(container: &mut Container, mut sock: UnixStream) -> ! {
    set_role(Role::Init);

    if let Err(e) = setup(container, &mut sock) {
        log::error!("container init setup failed: {}", e);
        std::process::exit(127);
    }

    unreachable!("setup() always execs or exits");
}

fn setup(container: &mut Container, sock: &mut UnixStream) -> Result<(), Error> {
    // 1. wait to be reparented to the supervisor before relying on
    //    PR_SET_PDEATHSIG targeting the right parent.
    handshake::expect(sock, Kind::ClientReparent)?;

    if unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL, 0, 0, 0) } != 0 {
        return Err(Error::last_os_error("prctl(PR_SET_PDEATHSIG)"));
    }

    // 2. reopen stdio onto the configured input/output files, if given.
    if let Some(path) = &container.input {
        fds::reopen_fd(0, path)?;
    }
    if let Some(path) = &container.output {
        fds::reopen_fd(1, path)?;
        fds::reopen_fd(2, path)?;
    }

    // 3. open devices/environ/seccomp files before chroot makes them
    //    unreachable.
    let devices = match &container.devfile {
        Some(path) => {
            let map = MapFile::open(path, false)?;
            device::parse_devices_file(map.as_str()?)?
        }
        None => Vec::new(),
    };
    let environ = match &container.envfile {
        Some(path) => Some(MapFile::open(path, false)?),
        None => None,
    };
    let seccomp_filter = match &container.seccomp {
        Some(path) => Some(std::fs::read(path).map_err(|e| Error::file("read", path, e))?),
        None => None,
    };

    let root = container.root.clone().unwrap_or_else(|| std::path::PathBuf::from("/"));

    // 4. private mount namespace + fstab, only when CLONE_NEWNS was
    //    actually requested -- otherwise this is still the host's mount
    //    namespace and MS_PRIVATE|MS_REC plus an fstab would leak into it.
    if container.unshare_flags & libc::CLONE_NEWNS != 0 {
        mount::make_mounts_private()?;
        mount::do_mount(&root, &container.mounts)?;
    }

    // 5. device nodes, still host-side of the chroot.
    device::make_devices(&root, &devices)?;

    // 6. loopback, before network is otherwise unreachable post-chroot.
    if container.unshare_flags & libc::CLONE_NEWNET != 0 {
        super::net::configure_lo()?;
    }

    // 7. hostname.
    if let Some(hostname) = &container.hostname {
        let chost = CString::new(hostname.as_str()).map_err(|_| Error::BadStr)?;
        if unsafe { libc::sethostname(chost.as_ptr() as *const libc::c_char, hostname.len()) } != 0 {
            return Err(Error::last_os_error("sethostname"));
        }
    }

    // 8. niceness.
    if let Some(nice) = container.nice {
        unsafe {
            *libc::__errno_location() = 0;
            if libc::nice(nice) == -1 && *libc::__errno_location() != 0 {
                return Err(Error::last_os_error("nice"));
            }
        }
    }

    // 9. chroot + chdir.
    let croot = CString::new(root.to_string_lossy().as_bytes()).map_err(|_| Error::BadStr)?;
    if unsafe { libc::chroot(croot.as_ptr()) } != 0 {
        return Err(Error::last_file_error("chroot", &root));
    }
    if unsafe { libc::chdir(b"/\0".as_ptr() as *const libc::c_char) } != 0 {
        return Err(Error::last_os_error("chdir(/)"));
    }

    // 10. new session.
    if unsafe { libc::setsid() } < 0 {
        return Err(Error::last_os_error("setsid"));
    }

    // 11. environment: clear ours, load the container's.
    unsafe {
        libc::clearenv();
    }
    if let Some(map) = &environ {
        load_environ(map)?;
    }

    // 12. signal readiness, then wait for the supervisor's go-ahead.
    handshake::send_cmd(sock, Kind::ClientReady, &[])?;
    handshake::expect(sock, Kind::ClientExec)?;

    // 13. no_new_privs, before applying any capability/seccomp policy.
    if container.no_new_privs {
        if unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) } != 0 {
            return Err(Error::last_os_error("prctl(PR_SET_NO_NEW_PRIVS)"));
        }
    }

    // 14. capabilities, then seccomp -- seccomp goes last since it can
    //     restrict the very syscalls capability application needs.
    std::mem::replace(&mut container.caps, Default::default()).apply()?;

    if let Some(filter) = seccomp_filter {
        super::seccomp::load(&filter)?;
    }

    // 15. drop to the configured uid/gid and hand off to the program.
    if let Some(gid) = container.gid {
        if unsafe { libc::setregid(gid, gid) } != 0 {
            return Err(Error::last_os_error("setregid"));
        }
    }
    if let Some(uid) = container.uid {
        if unsafe { libc::setreuid(uid, uid) } != 0 {
            return Err(Error::last_os_error("setreuid"));
        }
    }

    fds::cloexec_fds();

    info!("execvp {:?}", container.argv);
    exec(&container.argv)
}

fn load_environ(map: &MapFile) -> Result<(), Error> {
    for line in map.lines()? {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some(eq) = line.find('=') {
            if eq == 0 {
                continue;
            }
            let centry = CString::new(line).map_err(|_| Error::BadStr)?;
            if unsafe { libc::putenv(centry.into_raw()) } != 0 {
                return Err(Error::last_os_error("putenv"));
            }
        }
    }
    Ok(())
}

fn exec(argv: &[String]) -> Result<(), Error> {
    if argv.is_empty() {
        return Err(Error::Config("no command configured (init=)".to_string()));
    }

    let cprog = CString::new(argv[0].as_str()).map_err(|_| Error::BadStr)?;
    let cargs: Vec<CString> = argv
        .iter()
        .map(|a| CString::new(a.as_str()).map_err(|_| Error::BadStr))
        .collect::<Result<_, _>>()?;
    let mut argv_ptrs: Vec<*const libc::c_char> = cargs.iter().map(|a| a.as_ptr()).collect();
    argv_ptrs.push(std::ptr::null());

    debug!("execvp({:?})", argv);
    unsafe {
        libc::execvp(cprog.as_ptr(), argv_ptrs.as_ptr());
    }
    Err(Error::last_os_error("execvp"))
}
