use std::ffi::CString;
use std::os::unix::prelude::*;
use std::path::Path;

use libc;

use log::debug;

use super::err::{Error, Result};
pub use super::user::*;

/// Allocate a `CString` from the given path.
fn str2cstr<S: AsRef<str>>(s: S) -> Result<CString> {
    let ret = CString::new(s.as_ref())?;
    Ok(ret)
}

/// Allocate a `CString` from the given path.
fn path2cstr<P: AsRef<Path>>(path: P) -> Result<CString> {
    str2cstr(path.as_ref().to_string_lossy())
}

/// Wraps `mount()`
pub fn mount_with_data<A, B, C, D>(
    src: A,
    target: B,
    fstype: C,
    flags: libc::c_ulong,
    data: D,
) -> Result<()>
where
    A: AsRef<Path>,
    B: AsRef<Path>,
    C: AsRef<str>,
    D: AsRef<str>,
{
    debug!(
        "mount({:?},{:?},{:?},0x{:x},{:?})",
        src.as_ref().display(),
        target.as_ref().display(),
        fstype.as_ref(),
        flags,
        data.as_ref()
    );
    if 0 != unsafe {
        libc::mount(
            path2cstr(&src)?.as_ptr(),
            path2cstr(&target)?.as_ptr(),
            str2cstr(&fstype)?.as_ptr() as *const _,
            flags,
            str2cstr(&data)?.as_ptr() as *const _,
        )
    } {
        Err(Error::last_os_error(format!(
            "mount src={:?} target={:?} fs={:?} flags=0x{:x} data=",
            src.as_ref(),
            target.as_ref(),
            fstype.as_ref(),
            flags
        )))?;
    }
    Ok(())
}

/// Wraps `umount2(..., MNT_DETACH)` to remove a mount from the current namespace,
/// but not necessarily from others.
pub fn umount_lazy<P: AsRef<Path>>(path: P) -> Result<()> {
    debug!("umount({:?})", path.as_ref().display());
    let ret = unsafe { libc::umount2(path2cstr(&path)?.as_ptr(), libc::MNT_DETACH) };
    if ret == 0 {
        Ok(())
    } else {
        Err(Error::last_file_error("umount2", path))
    }
}

/// Manipulate the `FD_CLOEXEC` descriptor flag on the provided file
/// descriptor (via `F_GETFD`/`F_SETFD`, not to be confused with the
/// `O_CLOEXEC` *open* flag of the same name's cousin).
pub fn set_cloexec<F: AsRawFd>(fd: F, v: bool) -> Result<()> {
    let fdn = fd.as_raw_fd();
    let mut cur = unsafe { libc::fcntl(fdn, libc::F_GETFD) };
    if cur < 0 {
        return Err(Error::last_os_error("F_GETFD"));
    }
    if v {
        cur |= libc::FD_CLOEXEC;
    } else {
        cur &= !libc::FD_CLOEXEC;
    }
    let err = unsafe { libc::fcntl(fdn, libc::F_SETFD, cur) };
    if err < 0 {
        return Err(Error::last_os_error("F_SETFD"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::os::unix::net::UnixStream;

    #[test]
    fn cloexec_round_trips_through_fcntl() {
        let (mut a, mut b) = UnixStream::pair().expect("socketpair");
        set_cloexec(a.as_raw_fd(), true).unwrap();
        set_cloexec(b.as_raw_fd(), true).unwrap();

        let flags = unsafe { libc::fcntl(a.as_raw_fd(), libc::F_GETFD) };
        assert_ne!(flags & libc::FD_CLOEXEC, 0);

        a.write_all("msg".as_bytes()).unwrap();
        let mut buf = vec![0; 4];
        let n = b.read(&mut buf).unwrap();
        assert_eq!(n, 3);
        assert_eq!(&buf[0..3], "msg".as_bytes());
    }

    #[test]
    fn test_cstr() {
        let cstr = path2cstr("/some/path").unwrap();
        assert_eq!(cstr.to_str().unwrap(), "/some/path");
    }
}
