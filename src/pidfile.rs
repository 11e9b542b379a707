//! Pidfile Lock: the exclusive, non-blocking `flock` that makes
//! "already running" / "not running" detectable without a live handle
//! to the supervisor.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::path::Path;

use libc;
use log::debug;

use super::err::{Error, Result};

pub struct PidFile {
    file: File,
}

impl PidFile {
    /// Open (creating if absent) and try to take an exclusive,
    /// non-blocking lock. `EWOULDBLOCK` means another instance already
    /// holds it.
    pub fn lock(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .mode(0o644)
            .open(path)
            .map_err(|e| Error::file("open", path, e))?;

        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            let io = std::io::Error::last_os_error();
            if io.raw_os_error() == Some(libc::EWOULDBLOCK) {
                return Err(Error::AlreadyRunning);
            }
            return Err(Error::os("flock", io));
        }

        Ok(PidFile { file })
    }

    /// Write our own pid, having already locked the file. Truncates
    /// first so a stale longer pid from a previous run isn't left
    /// trailing.
    pub fn write_pid(&mut self, pid: libc::pid_t) -> Result<()> {
        use std::io::{Seek, SeekFrom};

        self.file
            .set_len(0)
            .map_err(|e| Error::os("ftruncate pidfile", e))?;
        self.file
            .seek(SeekFrom::Start(0))
            .map_err(|e| Error::os("lseek pidfile", e))?;
        write!(self.file, "{}\n", pid).map_err(|e| Error::os("write pidfile", e))?;
        self.file.sync_all().map_err(|e| Error::os("fsync pidfile", e))?;
        debug!("wrote pid {} to pidfile", pid);
        Ok(())
    }

    /// Read whatever pid is recorded in the (unlocked-by-us) file.
    pub fn read_pid(path: &Path) -> Result<libc::pid_t> {
        let text = std::fs::read_to_string(path).map_err(|e| Error::file("read", path, e))?;
        text.trim()
            .parse()
            .map_err(|_| Error::parse(format!("not a pid: {:?}", text), path))
    }
}

/// `isolate stop NAME`: try the lock; if we get it, nothing is
/// running. If `EWOULDBLOCK`, read the pid and send `SIGTERM`.
pub fn stop(path: &Path) -> Result<()> {
    match PidFile::lock(path) {
        Ok(_) => Err(Error::NotRunning),
        Err(Error::AlreadyRunning) => {
            let pid = PidFile::read_pid(path)?;
            if unsafe { libc::kill(pid, libc::SIGTERM) } != 0 {
                return Err(Error::last_os_error(format!("kill({},SIGTERM)", pid)));
            }
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// `isolate status NAME`: same lock probe, but just reports via the
/// error variant rather than signalling.
pub fn status(path: &Path) -> Result<()> {
    match PidFile::lock(path) {
        Ok(_) => Err(Error::NotRunning),
        Err(Error::AlreadyRunning) => {
            let pid = PidFile::read_pid(path)?;
            if unsafe { libc::kill(pid, 0) } != 0 {
                return Err(Error::NotRunning);
            }
            Ok(())
        }
        Err(e) => Err(e),
    }
}

use std::os::unix::fs::OpenOptionsExt;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_then_relock_is_already_running() {
        let path = std::env::temp_dir().join(format!("isolate-pidfile-test-{}", std::process::id()));
        let _first = PidFile::lock(&path).unwrap();
        let second = PidFile::lock(&path);
        assert!(matches!(second, Err(Error::AlreadyRunning)));
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn write_then_read_roundtrips() {
        let path = std::env::temp_dir().join(format!("isolate-pidfile-rw-test-{}", std::process::id()));
        {
            let mut pf = PidFile::lock(&path).unwrap();
            pf.write_pid(4242).unwrap();
        }
        assert_eq!(PidFile::read_pid(&path).unwrap(), 4242);
        std::fs::remove_file(&path).ok();
    }
}
