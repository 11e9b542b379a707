//! Device Maker: create device nodes inside the new root before
//! `chroot`, from a simple text description file.

use std::ffi::CString;
use std::path::Path;

use libc;
use log::debug;

use super::err::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DevType {
    Char,
    Block,
    Fifo,
    Socket,
}

impl DevType {
    fn from_char(c: char) -> Result<Self> {
        match c {
            'c' | 'u' => Ok(DevType::Char),
            'b' => Ok(DevType::Block),
            'p' => Ok(DevType::Fifo),
            's' => Ok(DevType::Socket),
            other => Err(Error::parse(format!("unknown device type {:?}", other), "devices")),
        }
    }

    fn mode_bits(self) -> libc::mode_t {
        match self {
            DevType::Char => libc::S_IFCHR,
            DevType::Block => libc::S_IFBLK,
            DevType::Fifo => libc::S_IFIFO,
            DevType::Socket => libc::S_IFSOCK,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeviceEntry {
    pub path: String,
    pub mode: libc::mode_t,
    pub dev_type: DevType,
    pub uid: libc::uid_t,
    pub gid: libc::gid_t,
    pub major: u32,
    pub minor: u32,
}

/// Parse one line of the devices file.
///
/// Format: `nod PATH MODE UID GID TYPE MAJOR MINOR`, e.g.
/// `nod /dev/null 666 0 0 c 1 3`. Lines that, after leading whitespace
/// is trimmed, don't begin with the literal token `nod`, or begin with
/// `#`, are skipped rather than rejected.
fn parse_line(line: &str) -> Result<Option<DeviceEntry>> {
    let trimmed = line.trim_start();
    if trimmed.starts_with('#') || trimmed.is_empty() {
        return Ok(None);
    }

    let mut fields = trimmed.split_whitespace();
    match fields.next() {
        Some("nod") => {}
        _ => return Ok(None),
    }

    let bad = || Error::parse(format!("malformed device line: {:?}", line), "devices");

    let path = fields.next().ok_or_else(bad)?.to_string();
    let mode = libc::mode_t::from_str_radix(fields.next().ok_or_else(bad)?, 8).map_err(|_| bad())?;
    let uid: libc::uid_t = fields.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
    let gid: libc::gid_t = fields.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
    let dev_type = DevType::from_char(
        fields
            .next()
            .ok_or_else(bad)?
            .chars()
            .next()
            .ok_or_else(bad)?,
    )?;
    let major: u32 = fields.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
    let minor: u32 = fields.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;

    Ok(Some(DeviceEntry {
        path,
        mode,
        dev_type,
        uid,
        gid,
        major,
        minor,
    }))
}

pub fn parse_devices_file(text: &str) -> Result<Vec<DeviceEntry>> {
    let mut entries = Vec::new();
    for line in text.lines() {
        if let Some(entry) = parse_line(line)? {
            entries.push(entry);
        }
    }
    Ok(entries)
}

/// `mknod` + `lchown` every parsed entry under `root`. An existing node
/// at the target path is unlinked first so re-running is idempotent.
pub fn make_devices(root: &Path, entries: &[DeviceEntry]) -> Result<()> {
    for entry in entries {
        let target = root.join(entry.path.trim_start_matches('/'));
        debug!("mknod {} {:o}", target.display(), entry.mode);

        let ctarget = CString::new(target.to_string_lossy().as_bytes()).map_err(|_| Error::BadStr)?;

        if unsafe { libc::unlink(ctarget.as_ptr()) } != 0 {
            let io = std::io::Error::last_os_error();
            if io.raw_os_error() != Some(libc::ENOENT) {
                return Err(Error::os(format!("unlink: {}", target.display()), io));
            }
        }

        let dev = unsafe { libc::makedev(entry.major, entry.minor) };
        let mode = entry.mode | entry.dev_type.mode_bits();
        if unsafe { libc::mknod(ctarget.as_ptr(), mode, dev) } != 0 {
            return Err(Error::last_file_error("mknod", &target));
        }
        if unsafe { libc::lchown(ctarget.as_ptr(), entry.uid, entry.gid) } != 0 {
            return Err(Error::last_file_error("lchown", &target));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_null_device() {
        let entries = parse_devices_file("nod /dev/null 666 0 0 c 1 3\n").unwrap();
        assert_eq!(entries.len(), 1);
        let e = &entries[0];
        assert_eq!(e.path, "/dev/null");
        assert_eq!(e.mode, 0o666);
        assert_eq!(e.dev_type, DevType::Char);
        assert_eq!(e.major, 1);
        assert_eq!(e.minor, 3);
    }

    #[test]
    fn comment_and_blank_lines_skipped() {
        let entries = parse_devices_file("# a comment\n\n   # indented comment\n").unwrap();
        assert!(entries.is_empty());
    }

    #[test]
    fn lines_not_starting_with_nod_are_skipped() {
        let entries = parse_devices_file("foo bar baz\nnod /dev/zero 666 0 0 c 1 5\n").unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].path, "/dev/zero");
    }

    #[test]
    fn unknown_type_char_is_an_error() {
        assert!(parse_devices_file("nod /dev/x 666 0 0 q 1 1\n").is_err());
    }
}
