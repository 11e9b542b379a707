//! Namespace Unsharer: parse the symbolic `unshare=` token list and
//! apply the resulting clone flags one at a time.

use libc;
use log::debug;

use super::err::{Error, Result};

const NAMESPACES: &[(&str, libc::c_int)] = &[
    ("mount", libc::CLONE_NEWNS),
    ("uts", libc::CLONE_NEWUTS),
    ("ipc", libc::CLONE_NEWIPC),
    ("net", libc::CLONE_NEWNET),
    ("pid", libc::CLONE_NEWPID),
    ("cgroup", libc::CLONE_NEWCGROUP),
    ("sysvsem", libc::CLONE_SYSVSEM),
    ("filesystem", libc::CLONE_FS),
];

/// Add the flag(s) named by one token to `flags`.
///
/// Matches case-insensitively against the exact token name. The
/// original C implementation matched by the *table* entry's length
/// (`strncasecmp(name, clone_flags[i].name, strlen(clone_flags[i].name))`),
/// so a longer user token like `"pidx"` silently matched `"pid"`. This
/// implementation requires an exact match and rejects unknown tokens,
/// per the explicit decision not to carry that behavior forward.
fn add_flag(flags: &mut libc::c_int, name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::UnknownNamespace(name.to_string()));
    }

    if name.eq_ignore_ascii_case("all") {
        for (_, flag) in NAMESPACES {
            *flags |= flag;
        }
        return Ok(());
    }

    for (token, flag) in NAMESPACES {
        if name.eq_ignore_ascii_case(token) {
            *flags |= flag;
            return Ok(());
        }
    }

    Err(Error::UnknownNamespace(name.to_string()))
}

/// Parse a comma-separated list of namespace tokens into a clone-flag
/// bitmask, unioned onto whatever `flags` already holds.
pub fn parse_unshare_flags(flags: &mut libc::c_int, arg: &str) -> Result<()> {
    for token in arg.split(',') {
        add_flag(flags, token)?;
    }
    Ok(())
}

/// Unshare each requested namespace kind with its own `unshare(2)`
/// call, so a failure identifies exactly which namespace could not be
/// created.
pub fn unshare_flags(flags: libc::c_int) -> Result<()> {
    for (name, flag) in NAMESPACES {
        if flags & flag == 0 {
            continue;
        }
        debug!("unshare namespace {}", name);
        if unsafe { libc::unshare(*flag) } != 0 {
            return Err(Error::last_os_error(format!("unshare({})", name)));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_match_required() {
        let mut flags = 0;
        assert!(parse_unshare_flags(&mut flags, "pidx").is_err());
    }

    #[test]
    fn comma_list_unions_flags() {
        let mut flags = 0;
        parse_unshare_flags(&mut flags, "mount,pid,net").unwrap();
        assert_eq!(
            flags,
            libc::CLONE_NEWNS | libc::CLONE_NEWPID | libc::CLONE_NEWNET
        );
    }

    #[test]
    fn all_expands_every_namespace() {
        let mut flags = 0;
        parse_unshare_flags(&mut flags, "all").unwrap();
        for (_, flag) in NAMESPACES {
            assert_ne!(flags & flag, 0);
        }
    }

    #[test]
    fn case_insensitive() {
        let mut flags = 0;
        parse_unshare_flags(&mut flags, "MOUNT").unwrap();
        assert_eq!(flags, libc::CLONE_NEWNS);
    }

    #[test]
    fn unknown_token_rejected() {
        let mut flags = 0;
        assert!(parse_unshare_flags(&mut flags, "bogus").is_err());
    }
}
