//! Capability Applier: parse capability lists and apply them to the
//! calling process before `execve`.

use std::io;

use libc;
use log::{debug, info};

use super::err::{Error, Result};
use super::sys;

/// Highest capability number this kernel ABI snapshot knows about.
/// `CAP_CHECKPOINT_RESTORE` (40) is the newest capability as of the
/// 5.9 kernel; like the C sources this crate is grounded on, the value
/// is a fixed constant rather than something probed at runtime.
pub const CAP_LAST_CAP: i32 = 40;

const CAPABILITY_NAMES: &[(&str, i32)] = &[
    ("chown", 0),
    ("dac_override", 1),
    ("dac_read_search", 2),
    ("fowner", 3),
    ("fsetid", 4),
    ("kill", 5),
    ("setgid", 6),
    ("setuid", 7),
    ("setpcap", 8),
    ("linux_immutable", 9),
    ("net_bind_service", 10),
    ("net_broadcast", 11),
    ("net_admin", 12),
    ("net_raw", 13),
    ("ipc_lock", 14),
    ("ipc_owner", 15),
    ("sys_module", 16),
    ("sys_rawio", 17),
    ("sys_chroot", 18),
    ("sys_ptrace", 19),
    ("sys_pacct", 20),
    ("sys_admin", 21),
    ("sys_boot", 22),
    ("sys_nice", 23),
    ("sys_resource", 24),
    ("sys_time", 25),
    ("sys_tty_config", 26),
    ("mknod", 27),
    ("lease", 28),
    ("audit_write", 29),
    ("audit_control", 30),
    ("setfcap", 31),
    ("mac_override", 32),
    ("mac_admin", 33),
    ("syslog", 34),
    ("wake_alarm", 35),
    ("block_suspend", 36),
    ("audit_read", 37),
    ("perfmon", 38),
    ("bpf", 39),
    ("checkpoint_restore", 40),
];

fn cap_from_name(name: &str) -> Result<i32> {
    CAPABILITY_NAMES
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| *v)
        .ok_or_else(|| Error::UnknownCapability(name.to_string()))
}

fn cap_to_name(cap: i32) -> &'static str {
    CAPABILITY_NAMES
        .iter()
        .find(|(_, v)| *v == cap)
        .map(|(n, _)| *n)
        .unwrap_or("?")
}

/// A parsed/accumulated capability vector: one flag per capability
/// number, in each of the three sets the kernel tracks.
#[derive(Debug, Clone)]
pub struct CapSet {
    effective: Vec<bool>,
    permitted: Vec<bool>,
    inheritable: Vec<bool>,
}

impl CapSet {
    fn nbits() -> usize {
        32 * sys::_LINUX_CAPABILITY_U32S_3
    }

    /// Read the calling process's current capability sets.
    ///
    /// A kernel old enough to not support the v3 (64-bit, `CAP_SETFCAP`
    /// and above) capability ABI rejects the v3 header and rewrites
    /// `head.version` to the version it does support; that rewrite is
    /// the kernel's own signal that capability support is too old for
    /// this implementation to use, and is treated as fatal per "fails
    /// fatally if the kernel does not support CAP_SETFCAP".
    pub fn current() -> Result<Self> {
        let mut head = sys::cap_user_header_t {
            version: sys::_LINUX_CAPABILITY_VERSION_3,
            pid: 0,
        };
        let mut data = vec![sys::cap_user_data_t::default(); sys::_LINUX_CAPABILITY_U32S_3];

        let err = unsafe { sys::capget(&mut head, data.as_mut_ptr()) };
        if err != 0 {
            return Err(Error::last_os_error("capget"));
        }
        if head.version != sys::_LINUX_CAPABILITY_VERSION_3 {
            return Err(Error::Config(
                "kernel does not support the v3 capability ABI (CAP_SETFCAP unavailable)".to_string(),
            ));
        }

        let nbits = Self::nbits();
        let mut ret = CapSet {
            effective: vec![false; nbits],
            permitted: vec![false; nbits],
            inheritable: vec![false; nbits],
        };

        for n in 0..nbits {
            let i = n / 32;
            let m: u32 = 1 << (n % 32);
            ret.effective[n] = (data[i].effective & m) != 0;
            ret.permitted[n] = (data[i].permitted & m) != 0;
            ret.inheritable[n] = (data[i].inheritable & m) != 0;
        }

        Ok(ret)
    }

    pub fn effective(&self, cap: i32) -> bool {
        self.effective.get(cap as usize).copied().unwrap_or(false)
    }

    fn set(&mut self, cap: i32, clear: bool) {
        let v = !clear;
        self.effective[cap as usize] = v;
        self.permitted[cap as usize] = v;
        self.inheritable[cap as usize] = v;
    }

    fn set_all(&mut self, clear: bool) {
        let v = !clear;
        self.effective.iter_mut().for_each(|b| *b = v);
        self.permitted.iter_mut().for_each(|b| *b = v);
        self.inheritable.iter_mut().for_each(|b| *b = v);
    }

    /// Apply one token (already trimmed) with a fixed add/drop sense.
    fn apply_token(&mut self, token: &str, clear: bool) -> Result<()> {
        if token.eq_ignore_ascii_case("all") {
            debug!("{} all capabilities", if clear { "unset" } else { "set" });
            self.set_all(clear);
            return Ok(());
        }
        let cap = cap_from_name(token)?;
        debug!("{} capability {}", if clear { "unset" } else { "set" }, cap_to_name(cap));
        self.set(cap, clear);
        Ok(())
    }

    /// Parse a comma-separated list where every token shares the same
    /// add/drop sense (`--cap-add` / `--cap-drop`).
    pub fn parse_additive(&mut self, arg: &str, clear: bool) -> Result<()> {
        for token in arg.split(',') {
            let token = token.trim();
            if token.is_empty() {
                continue;
            }
            self.apply_token(token, clear)?;
        }
        Ok(())
    }

    /// Parse a comma-separated list where each token may carry its own
    /// leading `+`/`-` (the `caps=` config key). A token with no sign
    /// reuses whichever sign was last seen in this list (sticky-sign),
    /// starting from "add" if none came before.
    pub fn parse_capsset(&mut self, arg: &str) -> Result<()> {
        let mut clear = false;
        for token in arg.split(',') {
            let token = token.trim();
            if token.is_empty() {
                continue;
            }
            let token = match token.as_bytes()[0] {
                b'-' => {
                    clear = true;
                    &token[1..]
                }
                b'+' => {
                    clear = false;
                    &token[1..]
                }
                _ => token,
            };
            self.apply_token(token, clear)?;
        }
        Ok(())
    }

    /// Drop every capability not present in the effective set from the
    /// bounding set, then apply the vector to the calling process.
    pub fn apply(self) -> Result<()> {
        for cap in (0..=CAP_LAST_CAP).rev() {
            if self.effective(cap) {
                continue;
            }
            let err = unsafe { libc::prctl(libc::PR_CAPBSET_DROP, cap, 0, 0, 0) };
            if err != 0 {
                let io = io::Error::last_os_error();
                if io.raw_os_error() == Some(libc::EINVAL) {
                    // kernel does not know this capability number; nothing to drop
                    continue;
                }
                return Err(Error::os(format!("prctl(PR_CAPBSET_DROP,{})", cap_to_name(cap)), io));
            }
        }

        let mut head = sys::cap_user_header_t {
            version: sys::_LINUX_CAPABILITY_VERSION_3,
            pid: 0,
        };
        let mut data = vec![sys::cap_user_data_t::default(); sys::_LINUX_CAPABILITY_U32S_3];
        let nbits = Self::nbits();
        for n in 0..nbits {
            let i = n / 32;
            let m: u32 = 1 << (n % 32);
            if self.effective[n] {
                data[i].effective |= m;
            }
            if self.permitted[n] {
                data[i].permitted |= m;
            }
            if self.inheritable[n] {
                data[i].inheritable |= m;
            }
        }

        let err = unsafe { sys::capset(&mut head, data.as_ptr()) };
        if err != 0 {
            return Err(Error::last_os_error("capset"));
        }

        info!("capabilities applied");
        Ok(())
    }
}

impl Default for CapSet {
    /// Starting point before any `+`/`-` tokens have been parsed: the
    /// calling process's own capabilities, matching
    /// `if (!*caps) *caps = cap_get_proc();` in the source. Falls back
    /// to the empty vector if `capget` itself fails (e.g. in a
    /// restricted test sandbox with no capability support at all) since
    /// there is nothing more conservative to start from.
    fn default() -> Self {
        Self::current().unwrap_or_else(|_| CapSet {
            effective: vec![false; Self::nbits()],
            permitted: vec![false; Self::nbits()],
            inheritable: vec![false; Self::nbits()],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_all_minus_chown_plus_sys_admin() {
        let mut caps = CapSet::default();
        caps.parse_capsset("all,-chown,+sys_admin").unwrap();

        let chown = cap_from_name("chown").unwrap();
        let sys_admin = cap_from_name("sys_admin").unwrap();
        let setuid = cap_from_name("setuid").unwrap();

        assert!(!caps.effective(chown));
        assert!(caps.effective(sys_admin));
        assert!(caps.effective(setuid));
    }

    #[test]
    fn parse_additive_add_then_drop() {
        let mut caps = CapSet::default();
        caps.parse_additive("net_admin,net_raw", false).unwrap();
        caps.parse_additive("net_raw", true).unwrap();

        assert!(caps.effective(cap_from_name("net_admin").unwrap()));
        assert!(!caps.effective(cap_from_name("net_raw").unwrap()));
    }

    #[test]
    fn unknown_capability_is_an_error() {
        let mut caps = CapSet::default();
        assert!(caps.parse_additive("not_a_capability", false).is_err());
    }

    #[test]
    fn capsset_sign_is_sticky_across_unsigned_tokens() {
        let mut caps = CapSet::default();
        caps.parse_capsset("-chown,sys_admin,net_raw").unwrap();

        assert!(!caps.effective(cap_from_name("chown").unwrap()));
        assert!(!caps.effective(cap_from_name("sys_admin").unwrap()));
        assert!(!caps.effective(cap_from_name("net_raw").unwrap()));
    }

    #[test]
    fn capsset_unsigned_token_defaults_to_add_when_nothing_precedes_it() {
        let mut caps = CapSet::default();
        caps.parse_capsset("chown,sys_admin").unwrap();

        assert!(caps.effective(cap_from_name("chown").unwrap()));
        assert!(caps.effective(cap_from_name("sys_admin").unwrap()));
    }

    #[test]
    fn whitespace_is_trimmed() {
        let mut caps = CapSet::default();
        caps.parse_capsset(" chown , sys_admin ").unwrap();
        assert!(caps.effective(cap_from_name("chown").unwrap()));
        assert!(caps.effective(cap_from_name("sys_admin").unwrap()));
    }
}
