//! Seccomp filter loader.
//!
//! Policy compilation (turning a textual rule language into classic
//! BPF) is out of scope here: the policy file on disk is expected to
//! already be a compiled `sock_filter` program, and this module's only
//! job is to hand that blob to the kernel via `prctl(PR_SET_SECCOMP)`.

use libc;

use super::err::{Error, Result};

/// One `struct sock_filter` instruction: 8 bytes, `{code, jt, jf, k}`.
const FILTER_SIZE: usize = 8;

/// Install `filter` (raw, pre-compiled classic BPF bytes) as the
/// process's seccomp filter.
pub fn load(filter: &[u8]) -> Result<()> {
    if filter.is_empty() || filter.len() % FILTER_SIZE != 0 {
        return Err(Error::Config(format!(
            "seccomp filter must be a non-empty multiple of {} bytes, got {}",
            FILTER_SIZE,
            filter.len()
        )));
    }

    let prog = libc::sock_fprog {
        len: (filter.len() / FILTER_SIZE) as u16,
        filter: filter.as_ptr() as *mut libc::sock_filter,
    };

    let rc = unsafe {
        libc::prctl(
            libc::PR_SET_SECCOMP,
            libc::SECCOMP_MODE_FILTER,
            &prog as *const _ as libc::c_ulong,
            0,
            0,
        )
    };
    if rc != 0 {
        return Err(Error::last_os_error("prctl(PR_SET_SECCOMP)"));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_blob_not_a_multiple_of_instruction_size() {
        assert!(load(&[0u8; 7]).is_err());
    }

    #[test]
    fn rejects_empty_blob() {
        assert!(load(&[]).is_err());
    }
}
