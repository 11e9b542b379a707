//! Wrapper for the one UID syscall this crate still calls directly.
//!
//! `init.rs` drops privilege with raw `libc::setreuid`/`setregid` (it
//! needs the real+effective two-argument form, not the single-id
//! `setuid`/`setgid` this module used to wrap); this one survives for
//! the startup root check in `bin/isolate.rs`.

use libc;

pub fn geteuid() -> libc::uid_t {
    unsafe { libc::geteuid() }
}
