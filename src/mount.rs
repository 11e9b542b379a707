//! Mount Executor: parse fstab-style mount table entries and apply
//! them inside the container's private mount namespace.

use std::ffi::CString;
use std::fs;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

use libc;
use log::{debug, warn};

use super::err::{Error, Result};
use super::util;

/// One parsed line of the mount table: `fsname dir type opts freq passno`.
#[derive(Debug, Clone)]
pub struct MountEntry {
    pub fsname: String,
    pub dir: PathBuf,
    pub fstype: String,
    pub opts: String,
}

/// Flag/name pairs recognised in the options column. Order matches the
/// source table; `(name, set, clear)` where exactly one of `set`/`clear`
/// is applied when `name` matches (the other pairs the inverse token).
const MOUNTFLAG_NAMES: &[(&str, libc::c_ulong)] = &[
    ("ro", libc::MS_RDONLY),
    ("rw", 0),
    ("noatime", libc::MS_NOATIME),
    ("atime", 0),
    ("nodev", libc::MS_NODEV),
    ("dev", 0),
    ("nodiratime", libc::MS_NODIRATIME),
    ("diratime", 0),
    ("noexec", libc::MS_NOEXEC),
    ("exec", 0),
    ("nosuid", libc::MS_NOSUID),
    ("suid", 0),
    ("sync", libc::MS_SYNCHRONOUS),
    ("async", 0),
    ("relatime", libc::MS_RELATIME),
    ("norelatime", 0),
    ("strictatime", libc::MS_STRICTATIME),
    ("nostrictatime", 0),
    ("dirsync", libc::MS_DIRSYNC),
    ("nodirsync", 0),
    ("mand", libc::MS_MANDLOCK),
    ("nomand", 0),
    ("rec", libc::MS_REC),
    ("bind", libc::MS_BIND),
    ("rbind", libc::MS_BIND | libc::MS_REC),
    ("move", libc::MS_MOVE),
    ("remount", libc::MS_REMOUNT),
    ("shared", libc::MS_SHARED),
    ("rshared", libc::MS_SHARED | libc::MS_REC),
    ("slave", libc::MS_SLAVE),
    ("rslave", libc::MS_SLAVE | libc::MS_REC),
];

/// Options that are recognised but carry no mount flag: silently
/// accepted for fstab compatibility.
const MOUNTOPT_IGNORED: &[&str] = &[
    "silent", "loud", "defaults", "nodefaults", "auto", "noauto", "comment", "_netdev", "loop",
];

/// `MS_*` <-> `statfs.f_flags` (`ST_*`) pairs used to preserve flags
/// across a bind-mount-then-remount-readonly, since the kernel silently
/// drops unrelated flags not re-specified on a `MS_REMOUNT`.
const MOUNT_PAIRS: &[(libc::c_ulong, libc::c_ulong)] = &[
    (libc::MS_MANDLOCK, libc::ST_MANDLOCK as libc::c_ulong),
    (libc::MS_NOATIME, libc::ST_NOATIME as libc::c_ulong),
    (libc::MS_NODEV, libc::ST_NODEV as libc::c_ulong),
    (libc::MS_NODIRATIME, libc::ST_NODIRATIME as libc::c_ulong),
    (libc::MS_NOEXEC, libc::ST_NOEXEC as libc::c_ulong),
    (libc::MS_NOSUID, libc::ST_NOSUID as libc::c_ulong),
    (libc::MS_RELATIME, libc::ST_RELATIME as libc::c_ulong),
    (libc::MS_SYNCHRONOUS, libc::ST_SYNCHRONOUS as libc::c_ulong),
];

#[derive(Default)]
struct ParsedOpts {
    flags: libc::c_ulong,
    data: Vec<String>,
    mkdir: Option<u32>,
}

/// Parse the comma-separated options column of one fstab line.
///
/// Recognises the `x-mount.mkdir` / `x-mount.mkdir=OCTAL` directive
/// (default mode `0755` when no value is given); other `x-*` options
/// are accepted and ignored. Anything left over after flag/ignored/x-
/// matching is passed through verbatim as mount-syscall `data`.
fn parse_mountopts(opts: &str) -> Result<ParsedOpts> {
    let mut parsed = ParsedOpts::default();

    for token in opts.split(',') {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }

        if let Some(rest) = token.strip_prefix("x-mount.mkdir") {
            parsed.mkdir = Some(match rest.strip_prefix('=') {
                Some(octal) => u32::from_str_radix(octal, 8)
                    .map_err(|_| Error::Config(format!("bad x-mount.mkdir mode: {:?}", octal)))?,
                None => 0o755,
            });
            continue;
        }
        if token.starts_with("x-") {
            continue;
        }

        if let Some((_, set, clear)) = find_flag_pair(token) {
            if clear {
                parsed.flags &= !set;
            } else {
                parsed.flags |= set;
            }
            continue;
        }

        if MOUNTOPT_IGNORED.contains(&token) {
            continue;
        }

        parsed.data.push(token.to_string());
    }

    Ok(parsed)
}

/// Look up `token` in [`MOUNTFLAG_NAMES`], returning `(flag_value, set,
/// clear)`. "Clear" tokens (`rw`, `atime`, ...) carry a `0` flag value in
/// the table and instead clear the *paired* set-token's bits.
fn find_flag_pair(token: &str) -> Option<(libc::c_ulong, libc::c_ulong, bool)> {
    const PAIRS: &[(&str, &str)] = &[
        ("ro", "rw"),
        ("noatime", "atime"),
        ("nodev", "dev"),
        ("nodiratime", "diratime"),
        ("noexec", "exec"),
        ("nosuid", "suid"),
        ("sync", "async"),
        ("relatime", "norelatime"),
        ("strictatime", "nostrictatime"),
        ("dirsync", "nodirsync"),
        ("mand", "nomand"),
    ];

    for (set_name, clear_name) in PAIRS {
        if token == *set_name {
            let flag = MOUNTFLAG_NAMES.iter().find(|(n, _)| n == set_name).unwrap().1;
            return Some((flag, flag, false));
        }
        if token == *clear_name {
            let flag = MOUNTFLAG_NAMES.iter().find(|(n, _)| n == set_name).unwrap().1;
            return Some((flag, flag, true));
        }
    }

    for plain in ["rec", "bind", "rbind", "move", "remount", "shared", "rshared", "slave", "rslave"] {
        if token == plain {
            let flag = MOUNTFLAG_NAMES.iter().find(|(n, _)| *n == plain).unwrap().1;
            return Some((flag, flag, false));
        }
    }

    None
}

/// Parse an fstab-format mount table: five or six whitespace-separated
/// fields per non-comment, non-blank line (`freq`/`passno` are accepted
/// for compatibility and ignored).
pub fn parse_fstab(text: &str) -> Result<Vec<MountEntry>> {
    let mut entries = Vec::new();

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 4 {
            return Err(Error::parse(format!("malformed fstab line: {:?}", line), "fstab"));
        }

        entries.push(MountEntry {
            fsname: fields[0].to_string(),
            dir: PathBuf::from(fields[1]),
            fstype: fields[2].to_string(),
            opts: fields[3].to_string(),
        });
    }

    Ok(entries)
}

fn cstr(s: &str) -> Result<CString> {
    CString::new(s).map_err(|_| Error::BadStr)
}

fn raw_mount(src: Option<&str>, target: &Path, fstype: Option<&str>, flags: libc::c_ulong, data: Option<&str>) -> Result<()> {
    let csrc = src.map(cstr).transpose()?;
    let ctarget = cstr(&target.to_string_lossy())?;
    let ctype = fstype.map(cstr).transpose()?;
    let cdata = data.map(cstr).transpose()?;

    let rc = unsafe {
        libc::mount(
            csrc.as_ref().map_or(std::ptr::null(), |c| c.as_ptr()),
            ctarget.as_ptr(),
            ctype.as_ref().map_or(std::ptr::null(), |c| c.as_ptr()),
            flags,
            cdata.as_ref().map_or(std::ptr::null(), |c| c.as_ptr() as *const libc::c_void),
        )
    };
    if rc != 0 {
        return Err(Error::last_file_error("mount", target));
    }
    Ok(())
}

/// Mark every existing mount private and recursive, so nothing the
/// container does propagates back to the host mount namespace.
pub fn make_mounts_private() -> Result<()> {
    raw_mount(None, Path::new("/"), None, libc::MS_REC | libc::MS_PRIVATE, None)
}

fn statfs_flags(path: &Path) -> Result<libc::c_ulong> {
    let cpath = cstr(&path.to_string_lossy())?;
    let mut st: libc::statfs = unsafe { std::mem::zeroed() };
    if unsafe { libc::statfs(cpath.as_ptr(), &mut st) } != 0 {
        return Err(Error::last_file_error("statfs", path));
    }

    let mut flags = 0;
    for (ms, st_flag) in MOUNT_PAIRS {
        if (st.f_flags as libc::c_ulong) & st_flag != 0 {
            flags |= ms;
        }
    }
    Ok(flags)
}

/// Remount `target` read-only, first reading back its current flags via
/// `statfs` so flags the kernel would otherwise silently drop across
/// the `MS_REMOUNT` are re-specified explicitly.
fn remount_ro(target: &Path) -> Result<()> {
    let preserved = statfs_flags(target)?;
    raw_mount(
        None,
        target,
        None,
        libc::MS_REMOUNT | libc::MS_BIND | libc::MS_RDONLY | preserved,
        None,
    )
}

/// tmpfs at `target` (using the parsed flags/data of the fstab entry),
/// then a non-recursive bind mount of every immediate child of `source`
/// into it (skipping `.`/`..`).
fn bindents(source: &Path, target: &Path, flags: libc::c_ulong, data: Option<&str>) -> Result<()> {
    raw_mount(Some("tmpfs"), target, Some("tmpfs"), flags, data)?;

    let rd = fs::read_dir(source).map_err(|e| Error::file("opendir", source, e))?;
    for ent in rd {
        let ent = ent.map_err(|e| Error::file("readdir", source, e))?;
        let name = ent.file_name();
        if name == "." || name == ".." {
            continue;
        }

        let src_path = ent.path();
        let dst_path = target.join(&name);
        let meta = ent.metadata().map_err(|e| Error::file("stat", &src_path, e))?;

        if meta.is_dir() {
            fs::create_dir(&dst_path).map_err(|e| Error::file("mkdir", &dst_path, e))?;
        } else {
            fs::OpenOptions::new()
                .create(true)
                .write(true)
                .mode_fallback(0o644)
                .open(&dst_path)
                .map_err(|e| Error::file("creat", &dst_path, e))?;
        }

        raw_mount(
            Some(&src_path.to_string_lossy()),
            &dst_path,
            None,
            libc::MS_BIND | libc::MS_REC,
            None,
        )?;
    }

    Ok(())
}

trait OpenOptionsModeFallback {
    fn mode_fallback(&mut self, mode: u32) -> &mut Self;
}

impl OpenOptionsModeFallback for fs::OpenOptions {
    fn mode_fallback(&mut self, mode: u32) -> &mut Self {
        std::os::unix::fs::OpenOptionsExt::mode(self, mode)
    }
}

/// `x-mount.mkdir`: a single-level `mkdir(target, mode)`, mode applied
/// atomically at creation rather than via a separate `chmod`.
/// `EEXIST` is ignored -- a pre-existing target is fine.
fn ensure_mount_target(target: &Path, mode: u32) -> Result<()> {
    match fs::DirBuilder::new().mode(mode).create(target) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(Error::file("mkdir", target, e)),
    }
}

/// Apply every entry in `table`, relative to the new root `root`.
///
/// Unconditionally recognises two pseudo filesystem types in addition
/// to whatever `fstype` the kernel understands:
/// - `_bindents`: tmpfs + per-child bind mount, see [`bindents`].
/// - `_umount`: `MNT_DETACH` unmount of `dir`.
///
/// A target directory that doesn't exist is skipped with a warning
/// unless `x-mount.mkdir` was given, in which case it's created first.
pub fn do_mount(root: &Path, table: &[MountEntry]) -> Result<()> {
    for entry in table {
        let target = root.join(entry.dir.strip_prefix("/").unwrap_or(&entry.dir));
        if target.as_os_str().len() > libc::PATH_MAX as usize {
            return Err(Error::Config(format!(
                "mount target exceeds PATH_MAX: {}",
                target.display()
            )));
        }
        let parsed = parse_mountopts(&entry.opts)?;

        if let Some(mode) = parsed.mkdir {
            ensure_mount_target(&target, mode)?;
        }

        if !target.exists() {
            warn!("mount target does not exist, skipping: {}", target.display());
            continue;
        }

        debug!("mount {} on {} type {}", entry.fsname, target.display(), entry.fstype);

        match entry.fstype.as_str() {
            "_bindents" => {
                let data = if parsed.data.is_empty() {
                    None
                } else {
                    Some(parsed.data.join(","))
                };
                bindents(Path::new(&entry.fsname), &target, parsed.flags, data.as_deref())?;
            }
            "_umount" => {
                util::umount_lazy(&target)?;
            }
            fstype => {
                let data = if parsed.data.is_empty() {
                    None
                } else {
                    Some(parsed.data.join(","))
                };
                raw_mount(Some(&entry.fsname), &target, Some(fstype), parsed.flags, data.as_deref())?;

                if parsed.flags & libc::MS_RDONLY != 0 {
                    remount_ro(&target)?;
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_basic_fstab() {
        let table = parse_fstab("proc /proc proc defaults 0 0\n# comment\n\ntmpfs /tmp tmpfs rw,nosuid 0 0\n").unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table[0].fsname, "proc");
        assert_eq!(table[0].dir, PathBuf::from("/proc"));
        assert_eq!(table[1].opts, "rw,nosuid");
    }

    #[test]
    fn ro_flag_and_mkdir_directive_parsed() {
        let parsed = parse_mountopts("ro,nosuid,x-mount.mkdir=0700").unwrap();
        assert_ne!(parsed.flags & libc::MS_RDONLY, 0);
        assert_ne!(parsed.flags & libc::MS_NOSUID, 0);
        assert_eq!(parsed.mkdir, Some(0o700));
    }

    #[test]
    fn mkdir_without_value_defaults_to_0755() {
        let parsed = parse_mountopts("x-mount.mkdir").unwrap();
        assert_eq!(parsed.mkdir, Some(0o755));
    }

    #[test]
    fn unrecognised_token_passed_through_as_data() {
        let parsed = parse_mountopts("ro,size=64m").unwrap();
        assert_eq!(parsed.data, vec!["size=64m".to_string()]);
    }

    #[test]
    fn bind_and_rbind_distinguish_recursion() {
        let bind = parse_mountopts("bind").unwrap();
        let rbind = parse_mountopts("rbind").unwrap();
        assert_eq!(bind.flags, libc::MS_BIND);
        assert_eq!(rbind.flags, libc::MS_BIND | libc::MS_REC);
    }

    #[test]
    fn rw_clears_ro() {
        let parsed = parse_mountopts("ro,rw").unwrap();
        assert_eq!(parsed.flags & libc::MS_RDONLY, 0);
    }

    #[test]
    fn ensure_mount_target_creates_single_level_dir_with_requested_mode() {
        let dir = std::env::temp_dir().join(format!("isolate-mount-mkdir-test-{}", std::process::id()));
        let _ = fs::remove_dir(&dir);

        ensure_mount_target(&dir, 0o700).unwrap();

        let meta = fs::symlink_metadata(&dir).unwrap();
        assert!(meta.is_dir());
        assert_eq!(std::os::unix::fs::MetadataExt::mode(&meta) & 0o777, 0o700);

        fs::remove_dir(&dir).unwrap();
    }

    #[test]
    fn ensure_mount_target_ignores_already_existing_directory() {
        let dir = std::env::temp_dir().join(format!("isolate-mount-mkdir-exists-test-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();

        ensure_mount_target(&dir, 0o755).unwrap();

        fs::remove_dir(&dir).unwrap();
    }

    #[test]
    fn ensure_mount_target_does_not_recurse_into_missing_parents() {
        let parent = std::env::temp_dir().join(format!("isolate-mount-mkdir-noparent-{}", std::process::id()));
        let _ = fs::remove_dir_all(&parent);
        let child = parent.join("child");

        assert!(ensure_mount_target(&child, 0o755).is_err());
    }
}
