//! Direct manipulation of network configuration inside the container's
//! net namespace -- just enough to bring `lo` up, the way
//! `ip link set lo up` would.

use std::net::{self, Ipv4Addr, UdpSocket};
use std::os::unix::prelude::*;
use std::ptr;

use log;

use super::err::{Error, Result};
use super::sys;

pub const LOOPBACK: &str = "lo";

// for lack of Ipv4Addr::integer() -> u32
fn b2u32(b: [u8; 4]) -> u32 {
    let mut ret = b[3] as u32;
    ret <<= 8;
    ret |= b[2] as u32;
    ret <<= 8;
    ret |= b[1] as u32;
    ret <<= 8;
    ret |= b[0] as u32;
    ret
}

/// Wrap a `struct ifreq`. Effectively an interface name.
#[derive(Copy, Clone)] // ifreq stores no pointers
struct IfReq(sys::ifreq);

impl IfReq {
    /// Fill in `ifreq::ifr_name`
    fn from_name<S: AsRef<str>>(name: S) -> Result<Self> {
        let rawname = name.as_ref().as_bytes().to_vec();
        let mut req = sys::ifreq::default();
        unsafe {
            if rawname.len() >= req.ifr_name.len() {
                return Err(Error::TooLong);
            }
            ptr::copy_nonoverlapping(
                rawname.as_ptr(),
                req.ifr_name.as_mut_ptr() as *mut u8,
                rawname.len(),
            );
            req.ifr_name[rawname.len()] = 0;
        }
        Ok(Self(req))
    }

    /// Make an `ioctl()` on the named interface
    unsafe fn ioctl<FD: AsRawFd>(&mut self, fd: FD, req: libc::c_ulong) -> Result<()> {
        let err = libc::ioctl(fd.as_raw_fd(), req, &mut self.0);
        if err != 0 {
            return Err(Error::last_os_error(format!("ioctl(0x{:x})", req)));
        }
        Ok(())
    }
}

impl std::ops::Deref for IfReq {
    type Target = sys::ifreq;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::ops::DerefMut for IfReq {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

/// Network Interface Configurator. A (small) sub-set of `/sbin/ifconfig`.
pub struct IfConfig(UdpSocket);

impl IfConfig {
    /// Prepare to manipulate. (allocates a "dummy" socket)
    pub fn new() -> Result<Self> {
        let sock =
            UdpSocket::bind("127.0.0.1:0").map_err(|e| Error::os("bind() ifconfig socket", e))?;
        Ok(Self(sock))
    }

    /// Lookup interface flags bit mask.
    pub fn ifflags<S: AsRef<str>>(&self, ifname: S) -> Result<u32> {
        let mut req = IfReq::from_name(ifname.as_ref())?;
        let ret = unsafe {
            req.ioctl(self.0.as_raw_fd(), sys::SIOCGIFFLAGS)?;
            req.ifr_ifru.ifru_flags as u32
        };
        log::debug!("ifflags({:?}) -> {}", ifname.as_ref(), ret);
        Ok(ret)
    }

    /// Overwrite interface flags bit mask.
    pub fn set_ifflags<S: AsRef<str>>(&self, ifname: S, flags: u32) -> Result<()> {
        log::debug!("set_ifflags({:?}, {})", ifname.as_ref(), flags);
        let mut req = IfReq::from_name(ifname)?;
        unsafe {
            req.ifr_ifru.ifru_flags = flags as _;
            req.ioctl(self.0.as_raw_fd(), sys::SIOCSIFFLAGS)?;
            Ok(())
        }
    }

    /// Find "the" IPv4 address of the named interface.
    pub fn address<S: AsRef<str>>(&self, ifname: S) -> Result<net::Ipv4Addr> {
        let mut req = IfReq::from_name(ifname.as_ref())?;
        let saddr = unsafe {
            req.ioctl(self.0.as_raw_fd(), sys::SIOCGIFADDR)?;
            if req.ifr_ifru.ifru_addr.sa_family != libc::AF_INET as libc::sa_family_t {
                return Err(Error::NotIPv4);
            }
            let inaddr = &req.ifr_ifru.ifru_addr as *const _ as *const libc::sockaddr_in;
            (*inaddr).sin_addr.s_addr
        };
        let ret = net::Ipv4Addr::from(u32::from_be(saddr));
        log::debug!("address({:?}) -> {}", ifname.as_ref(), ret);
        Ok(ret)
    }

    /// Set "the" IPv4 address of the named interface.
    pub fn set_address<S: AsRef<str>>(&self, ifname: S, addr: net::Ipv4Addr) -> Result<()> {
        log::debug!("set_address({:?}, {})", ifname.as_ref(), addr);
        let iaddr = b2u32(addr.octets());
        let mut req = IfReq::from_name(ifname)?;
        unsafe {
            let inaddr = &mut req.ifr_ifru.ifru_addr as *mut _ as *mut libc::sockaddr_in;
            (*inaddr).sin_family = libc::AF_INET as libc::sa_family_t;
            (*inaddr).sin_port = 0;
            (*inaddr).sin_addr.s_addr = iaddr;
            req.ioctl(self.0.as_raw_fd(), sys::SIOCSIFADDR)?;
        }
        Ok(())
    }
}

/// Bring the `lo` interface UP with address `127.0.0.1`, once inside a
/// private network namespace (otherwise even loopback traffic is
/// unreachable).
pub fn configure_lo() -> Result<()> {
    log::debug!("setup loopback interface");

    let conf = IfConfig::new()?;

    conf.set_address(LOOPBACK, Ipv4Addr::LOCALHOST)?;

    let flags = conf.ifflags(LOOPBACK)?;
    if 0 == (flags as i16 & sys::IFF_UP) {
        conf.set_ifflags(LOOPBACK, (flags as i16 | sys::IFF_UP) as u32)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[ignore] // requires a private network namespace to not disturb the host
    fn lo_flags_include_loopback() {
        let conf = IfConfig::new().unwrap();
        let flags = conf.ifflags(LOOPBACK).expect("flags");
        assert_ne!(flags as i16 & sys::IFF_LOOPBACK, 0);
    }

    #[test]
    #[ignore]
    fn lo_bring_up_then_address() {
        configure_lo().unwrap();
        let conf = IfConfig::new().unwrap();
        let addr = conf.address(LOOPBACK).expect("address");
        assert_eq!(addr, net::Ipv4Addr::LOCALHOST);
    }
}
