//! FD Sanitizer: close every inherited file descriptor the container
//! has no business seeing, and mark the survivors close-on-exec.

use std::ffi::CString;
use std::os::unix::io::RawFd;
use std::path::Path;

use libc;
use log::debug;

use super::err::{Error, Result};
use super::util;

/// `sysconf(_SC_OPEN_MAX)`, clamped to `[NR_OPEN, INT_MAX]` the way the
/// original does, guarding against a sysconf failure or a value too
/// small to be the real fd ceiling.
fn get_open_max() -> libc::c_int {
    const NR_OPEN: libc::c_long = 1024;
    let max = unsafe { libc::sysconf(libc::_SC_OPEN_MAX) };
    if max < NR_OPEN {
        NR_OPEN as libc::c_int
    } else if max > libc::c_int::MAX as libc::c_long {
        libc::c_int::MAX
    } else {
        max as libc::c_int
    }
}

/// `umask(0)`, then close every fd above stderr (2). Fds 0-2 are probed
/// with `fstat` first; a process started with any of them already
/// closed is missing the basic guarantee the rest of this crate relies
/// on, so that's fatal rather than silently tolerated.
pub fn sanitize_fds() -> Result<()> {
    unsafe {
        libc::umask(0);
    }

    for fd in 0..=2 {
        let mut st: libc::stat = unsafe { std::mem::zeroed() };
        if unsafe { libc::fstat(fd, &mut st) } != 0 {
            return Err(Error::last_os_error(format!("fstat(fd={})", fd)));
        }
    }

    let max = get_open_max();
    for fd in 3..max {
        unsafe {
            libc::close(fd);
        }
    }

    Ok(())
}

/// Set `FD_CLOEXEC` on every fd in `[3, open_max)` that's actually
/// open, so a later `execvp` doesn't leak sockets or the mapped
/// devices/environ/seccomp files into the container program.
pub fn cloexec_fds() {
    let max = get_open_max();
    for fd in 3..max {
        let _ = util::set_cloexec(fd, true);
    }
}

/// Reopen `fd` (0 for stdin, 1/2 for stdout/stderr) onto `path`,
/// creating it if absent. Both input and output paths are opened
/// `O_RDWR | O_CREAT`, deliberately symmetric rather than `O_RDONLY`
/// for input: matches what the container expects to inherit.
pub fn reopen_fd(fd: RawFd, path: &Path) -> Result<()> {
    let cpath = CString::new(path.to_string_lossy().as_bytes()).map_err(|_| Error::BadStr)?;

    let newfd = unsafe { libc::open(cpath.as_ptr(), libc::O_RDWR | libc::O_CREAT, 0o644) };
    if newfd < 0 {
        return Err(Error::last_file_error("open", path));
    }

    debug!("reopen fd {} onto {}", fd, path.display());

    if newfd != fd {
        if unsafe { libc::dup2(newfd, fd) } < 0 {
            let err = Error::last_file_error("dup2", path);
            unsafe { libc::close(newfd) };
            return Err(err);
        }
        unsafe { libc::close(newfd) };
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_max_is_at_least_nr_open() {
        assert!(get_open_max() >= 1024);
    }
}
