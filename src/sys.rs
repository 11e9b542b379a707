//! Hand-written bindings for a handful of kernel ABI shapes.
//!
//! These replace what used to be bindgen-generated from a vendored
//! `external.h`: the capability get/set header and the ioctl `ifreq`
//! union are stable kernel-ABI structs, small enough that writing them
//! out is simpler than a header-parsing build step.

use libc;

pub const _LINUX_CAPABILITY_VERSION_3: u32 = 0x20080522;
pub const _LINUX_CAPABILITY_U32S_3: usize = 2;

/// `cap_user_header_t` (`linux/capability.h`)
#[repr(C)]
#[derive(Copy, Clone)]
pub struct cap_user_header_t {
    pub version: u32,
    pub pid: libc::pid_t,
}

/// `cap_user_data_t` (`linux/capability.h`)
#[repr(C)]
#[derive(Copy, Clone, Default)]
pub struct cap_user_data_t {
    pub effective: u32,
    pub permitted: u32,
    pub inheritable: u32,
}

extern "C" {
    #[link_name = "capget"]
    pub fn capget(hdrp: *mut cap_user_header_t, datap: *mut cap_user_data_t) -> libc::c_int;
    #[link_name = "capset"]
    pub fn capset(hdrp: *mut cap_user_header_t, datap: *const cap_user_data_t) -> libc::c_int;
}

pub const IFNAMSIZ: usize = 16;

/// `struct ifreq` (`net/if.h`), trimmed to the union members this crate
/// actually uses: name, flags, and an IPv4 socket address.
#[repr(C)]
#[derive(Copy, Clone)]
pub struct ifreq {
    pub ifr_name: [libc::c_char; IFNAMSIZ],
    pub ifr_ifru: ifreq_ifru,
}

#[repr(C)]
#[derive(Copy, Clone)]
pub union ifreq_ifru {
    pub ifru_addr: libc::sockaddr,
    pub ifru_flags: libc::c_short,
    pub ifru_ivalue: libc::c_int,
}

impl Default for ifreq {
    fn default() -> Self {
        unsafe { std::mem::zeroed() }
    }
}

pub const SIOCGIFFLAGS: libc::c_ulong = 0x8913;
pub const SIOCSIFFLAGS: libc::c_ulong = 0x8914;
pub const SIOCGIFADDR: libc::c_ulong = 0x8915;
pub const SIOCSIFADDR: libc::c_ulong = 0x8916;

pub const IFF_UP: libc::c_short = 0x1;
pub const IFF_LOOPBACK: libc::c_short = 0x8;
