//! Supervisor: the long-lived parent process. Forks the intermediate
//! child, multiplexes the handshake socket and `SIGCHLD`/`SIGTERM` with
//! `epoll`+`signalfd`, and tears the cgroup down once the container
//! has exited.

use std::mem::MaybeUninit;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;

use libc;
use log::{debug, info, warn};

use super::cgroup::{self, CgroupSpec};
use super::context::{set_role, Role, RuntimeContext};
use super::err::{Error, Result};
use super::fds;
use super::handshake::{self, Kind};
use super::init;
use super::namespace;
use super::pidfile::PidFile;
use super::spec::Container;

/// Up to this many events are drained from `epoll_wait` per call; the
/// value is generous for the two or three fds this loop ever watches.
const MAX_EVENTS: usize = 42;

fn make_signalfd(mask: &libc::sigset_t) -> Result<RawFd> {
    let fd = unsafe { libc::signalfd(-1, mask, libc::SFD_CLOEXEC | libc::SFD_NONBLOCK) };
    if fd < 0 {
        return Err(Error::last_os_error("signalfd"));
    }
    Ok(fd)
}

/// Block every signal except `SIGABRT`/`SIGSEGV` (left to their default,
/// fatal disposition since they indicate the Supervisor itself is
/// crashing) and return the mask so it can be handed to `signalfd`.
/// Any blocked signal -- `SIGTERM` from the `stop` verb included --
/// becomes readable on the signalfd instead of being delivered
/// asynchronously.
fn block_signals() -> Result<libc::sigset_t> {
    unsafe {
        let mut set: libc::sigset_t = std::mem::zeroed();
        libc::sigfillset(&mut set);
        libc::sigdelset(&mut set, libc::SIGABRT);
        libc::sigdelset(&mut set, libc::SIGSEGV);
        if libc::sigprocmask(libc::SIG_SETMASK, &set, std::ptr::null_mut()) != 0 {
            return Err(Error::last_os_error("sigprocmask"));
        }
        Ok(set)
    }
}

fn epoll_add(epfd: RawFd, fd: RawFd) -> Result<()> {
    let mut ev = libc::epoll_event {
        events: libc::EPOLLIN as u32,
        u64: fd as u64,
    };
    if unsafe { libc::epoll_ctl(epfd, libc::EPOLL_CTL_ADD, fd, &mut ev) } != 0 {
        return Err(Error::last_os_error("epoll_ctl"));
    }
    Ok(())
}

/// Outcome of running one container to completion: the exit status to
/// hand back to the CLI.
pub struct ExitStatus {
    pub code: i32,
}

/// `isolate start NAME`: take the pidfile lock, create the cgroup,
/// fork the double handshake chain, and drive it to completion.
pub fn start(ctx: &RuntimeContext, container: &mut Container) -> Result<ExitStatus> {
    set_role(Role::Supervisor);

    if let Some(root) = &container.root {
        let croot = std::ffi::CString::new(root.to_string_lossy().as_bytes()).map_err(|_| Error::BadStr)?;
        if unsafe { libc::access(croot.as_ptr(), libc::R_OK | libc::X_OK) } != 0 {
            return Err(Error::last_file_error("access", root));
        }
    }

    let mut pidfile = PidFile::lock(&ctx.pidfile_path)?;

    unsafe {
        libc::setgroups(0, std::ptr::null());
    }
    fds::sanitize_fds()?;

    if ctx.background {
        if unsafe { libc::daemon(1, 0) } != 0 {
            return Err(Error::last_os_error("daemon"));
        }
        ctx.set_syslog(true);
        super::logging::enable_syslog();
        // openlog() keeps the ident pointer rather than copying it, so it
        // must outlive every subsequent syslog() call; leak it for the
        // remaining lifetime of the process.
        let ident: &'static std::ffi::CStr = Box::leak(std::ffi::CString::new("isolate").unwrap().into_boxed_c_str());
        unsafe {
            libc::openlog(ident.as_ptr(), libc::LOG_PID, libc::LOG_DAEMON);
        }
    }

    if unsafe { libc::prctl(libc::PR_SET_CHILD_SUBREAPER, 1, 0, 0, 0) } != 0 {
        return Err(Error::last_os_error("prctl(PR_SET_CHILD_SUBREAPER)"));
    }

    cgroup::cgroup_create(&container.cgroups)?;

    let (mut sv_sock, child_sock) = handshake::socketpair()?;

    let result = run_handshake(&mut pidfile, container, &mut sv_sock, child_sock);

    // Whatever brought the handshake loop down -- the container exiting
    // on its own, or a signal (e.g. `stop`'s SIGTERM) -- any remaining
    // container-owned process is still reachable through the cgroup and
    // must be reaped before the hierarchy is torn down.
    if let Err(e) = cgroup::kill_container(&container.cgroups) {
        warn!("termination cascade failed: {}", e);
    }
    cgroup::cgroup_destroy(&container.cgroups);
    let _ = std::fs::remove_file(&ctx.pidfile_path);

    result
}

fn run_handshake(
    pidfile: &mut PidFile,
    container: &mut Container,
    sv_sock: &mut UnixStream,
    child_sock: UnixStream,
) -> Result<ExitStatus> {
    let mask = block_signals()?;
    let sigfd = make_signalfd(&mask)?;

    let rc = unsafe { libc::fork() };
    if rc < 0 {
        return Err(Error::last_os_error("fork"));
    }

    if rc == 0 {
        unsafe { libc::close(sigfd) };
        // `sv_sock` is only a `&mut` borrow here; dropping the reference
        // wouldn't close the fd, so close it directly instead.
        unsafe { libc::close(sv_sock.as_raw_fd()) };
        intermediate_main(container, child_sock);
        unreachable!("intermediate_main never returns");
    }

    let intermediate_pid = rc as libc::pid_t;
    // The pidfile records the Supervisor's own pid, not the
    // intermediate's -- `stop`/`status` signal whoever holds the lock.
    pidfile.write_pid(unsafe { libc::getpid() })?;
    drop(child_sock);
    info!("container {} started, supervisor watching pid {}", container.name, intermediate_pid);

    let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
    if epfd < 0 {
        return Err(Error::last_os_error("epoll_create1"));
    }
    epoll_add(epfd, sigfd)?;
    epoll_add(epfd, sv_sock.as_raw_fd())?;

    let mut grandchild_pid: Option<libc::pid_t> = None;
    // 0 = FORK_CLIENT not yet sent. Once sent, counts down from -1;
    // reaching -6 (five silent ticks after the send) is a timeout.
    let mut pending_idle_ticks: i32 = 0;
    let mut ep_timeout: libc::c_int = 0;
    let mut exit_code = 0i32;

    loop {
        let mut events: [MaybeUninit<libc::epoll_event>; MAX_EVENTS] =
            unsafe { MaybeUninit::uninit().assume_init() };
        let n = unsafe {
            libc::epoll_wait(epfd, events.as_mut_ptr() as *mut libc::epoll_event, MAX_EVENTS as i32, ep_timeout)
        };
        if n < 0 {
            let io = std::io::Error::last_os_error();
            if io.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return Err(Error::os("epoll_wait", io));
        }

        if n == 0 {
            ep_timeout = 1000;
            if grandchild_pid.is_none() {
                if pending_idle_ticks == 0 {
                    handshake::send_cmd(sv_sock, Kind::ForkClient, &[])?;
                    pending_idle_ticks = -1;
                } else {
                    pending_idle_ticks -= 1;
                    if pending_idle_ticks < -5 {
                        return Err(Error::Protocol("timed out waiting for container pid".to_string()));
                    }
                }
            }
            continue;
        }

        for ev in &events[..n as usize] {
            let fd = unsafe { ev.assume_init_ref().u64 } as RawFd;

            if fd == sigfd {
                // Any delivered signal other than SIGCHLD (SIGTERM from
                // `stop`, e.g.) means the Supervisor itself should wind
                // down, not that a child changed state.
                if drain_signalfd(sigfd) {
                    unsafe { libc::close(epfd) };
                    unsafe { libc::close(sigfd) };
                    return Ok(ExitStatus { code: exit_code });
                }
                loop {
                    let mut status = 0;
                    let pid = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };
                    if pid <= 0 {
                        break;
                    }
                    debug!("reaped pid {}", pid);

                    if Some(pid) == grandchild_pid {
                        exit_code = if libc::WIFEXITED(status) {
                            libc::WEXITSTATUS(status)
                        } else {
                            128 + libc::WTERMSIG(status)
                        };
                        unsafe { libc::close(epfd) };
                        unsafe { libc::close(sigfd) };
                        return Ok(ExitStatus { code: exit_code });
                    } else if pid == intermediate_pid {
                        if status != 0 && !libc::WIFEXITED(status) || (libc::WIFEXITED(status) && libc::WEXITSTATUS(status) != 0) {
                            return Err(Error::Protocol("intermediate process failed (mount/unshare setup)".to_string()));
                        }
                        // Send unconditionally: CLIENT_PID and the
                        // intermediate's SIGCHLD can surface in either
                        // order through epoll, and the grandchild's
                        // handshake::expect(ClientReparent) never looks
                        // at a payload anyway.
                        handshake::send_cmd(sv_sock, Kind::ClientReparent, &[])?;
                    }
                }
            } else if fd == sv_sock.as_raw_fd() {
                let msg = handshake::recv_cmd(sv_sock)?;
                match msg.kind {
                    Kind::ClientPid => {
                        let pid = libc::pid_t::from_ne_bytes(
                            msg.payload
                                .try_into()
                                .map_err(|_| Error::Protocol("malformed pid payload".to_string()))?,
                        );
                        grandchild_pid = Some(pid);
                        debug!("container pid is {}", pid);
                    }
                    Kind::ClientReady => {
                        let pid = grandchild_pid
                            .ok_or_else(|| Error::Protocol("CLIENT_READY before CLIENT_PID".to_string()))?;
                        cgroup::cgroup_add(&container.cgroups, pid)?;
                        handshake::send_cmd(sv_sock, Kind::ClientExec, &[])?;
                    }
                    other => {
                        warn!("unexpected handshake message {:?}", other);
                    }
                }
            }
        }
    }
}

/// Drain every pending `signalfd_siginfo` and report whether any signal
/// other than `SIGCHLD` was among them. `SIGCHLD` just means a child
/// changed state and is handled by the `waitpid` loop in the caller;
/// anything else (`SIGTERM` from the `stop` verb, `SIGINT`, ...) is the
/// Supervisor's own cue to wind the container down.
fn drain_signalfd(fd: RawFd) -> bool {
    let mut info: libc::signalfd_siginfo = unsafe { std::mem::zeroed() };
    let mut other_signal = false;
    loop {
        let n = unsafe {
            libc::read(
                fd,
                &mut info as *mut _ as *mut libc::c_void,
                std::mem::size_of::<libc::signalfd_siginfo>(),
            )
        };
        if n <= 0 {
            break;
        }
        if info.ssi_signo != libc::SIGCHLD as u32 {
            other_signal = true;
        }
    }
    other_signal
}

/// The intermediate process: unshares every non-`pid` namespace flag
/// for itself, forks the container init as the grandchild (which is
/// `PID 1` in a new pid namespace if requested), reports its pid, and
/// exits so the grandchild is reparented to the subreaper supervisor.
fn intermediate_main(container: &mut Container, mut sock: UnixStream) -> ! {
    set_role(Role::Intermediate);

    if let Err(e) = namespace::unshare_flags(container.unshare_flags) {
        warn!("unshare failed: {}", e);
        std::process::exit(1);
    }

    if let Err(e) = handshake::expect(&mut sock, Kind::ForkClient) {
        warn!("did not receive FORK_CLIENT: {}", e);
        std::process::exit(1);
    }

    let rc = unsafe { libc::fork() };
    if rc < 0 {
        warn!("fork failed: {}", std::io::Error::last_os_error());
        std::process::exit(1);
    }

    if rc == 0 {
        init::run(container, sock);
        unreachable!("init::run never returns");
    }

    let grandchild_pid = rc as libc::pid_t;
    if let Err(e) = handshake::send_pid(&mut sock, grandchild_pid) {
        warn!("unable to report container pid: {}", e);
    }
    std::process::exit(0);
}

#[allow(dead_code)]
fn cgroup_spec_name(cg: &CgroupSpec) -> &str {
    &cg.name
}
