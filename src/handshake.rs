//! Handshake Protocol: the fixed-header framing the Supervisor and
//! Container Init exchange over a `SOCK_STREAM` socketpair to
//! coordinate the double-fork handoff.

use std::io::{Read, Write};
use std::os::unix::io::RawFd;
use std::os::unix::net::UnixStream;

use super::err::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Kind {
    ForkClient = 0,
    ClientPid = 1,
    ClientReparent = 2,
    ClientReady = 3,
    ClientExec = 4,
}

impl Kind {
    fn from_u32(v: u32) -> Result<Self> {
        Ok(match v {
            0 => Kind::ForkClient,
            1 => Kind::ClientPid,
            2 => Kind::ClientReparent,
            3 => Kind::ClientReady,
            4 => Kind::ClientExec,
            other => return Err(Error::Protocol(format!("unknown message kind {}", other))),
        })
    }
}

/// Wire header: a 4-byte kind tag, 4 bytes of padding to bring the
/// trailing `u64` to its natural 8-byte alignment, then the payload
/// length. 16 bytes total, matching the natural layout of a C
/// `struct cmd { cmd_t type; uint64_t datalen; }`.
#[repr(C)]
struct RawHeader {
    kind: u32,
    _pad: u32,
    datalen: u64,
}

pub struct Message {
    pub kind: Kind,
    pub payload: Vec<u8>,
}

fn read_exact(stream: &mut UnixStream, buf: &mut [u8]) -> Result<()> {
    stream
        .read_exact(buf)
        .map_err(|e| Error::os("recv", e))
}

fn write_all(stream: &mut UnixStream, buf: &[u8]) -> Result<()> {
    stream.write_all(buf).map_err(|e| Error::os("send", e))
}

/// Send one framed message: header followed immediately by payload.
pub fn send_cmd(stream: &mut UnixStream, kind: Kind, payload: &[u8]) -> Result<()> {
    let header = RawHeader {
        kind: kind as u32,
        _pad: 0,
        datalen: payload.len() as u64,
    };
    let header_bytes = unsafe {
        std::slice::from_raw_parts(
            (&header as *const RawHeader) as *const u8,
            std::mem::size_of::<RawHeader>(),
        )
    };
    write_all(stream, header_bytes)?;
    if !payload.is_empty() {
        write_all(stream, payload)?;
    }
    Ok(())
}

/// Receive one framed message. A payload over 64KiB is rejected: no
/// legitimate message (a pid, a single path, a reparent ack) is
/// anywhere near that size, and an oversized `datalen` almost always
/// means the peer desynced.
pub fn recv_cmd(stream: &mut UnixStream) -> Result<Message> {
    const MAX_PAYLOAD: u64 = 64 * 1024;

    let mut raw = [0u8; std::mem::size_of::<RawHeader>()];
    read_exact(stream, &mut raw)?;

    let kind = u32::from_ne_bytes(raw[0..4].try_into().unwrap());
    let datalen = u64::from_ne_bytes(raw[8..16].try_into().unwrap());

    if datalen > MAX_PAYLOAD {
        return Err(Error::Protocol(format!("oversized payload: {} bytes", datalen)));
    }

    let mut payload = vec![0u8; datalen as usize];
    if !payload.is_empty() {
        read_exact(stream, &mut payload)?;
    }

    Ok(Message {
        kind: Kind::from_u32(kind)?,
        payload,
    })
}

/// Expect a specific message kind next; any other kind is a protocol
/// violation.
pub fn expect(stream: &mut UnixStream, want: Kind) -> Result<Message> {
    let msg = recv_cmd(stream)?;
    if msg.kind != want {
        return Err(Error::Protocol(format!("expected {:?}, got {:?}", want, msg.kind)));
    }
    Ok(msg)
}

pub fn send_pid(stream: &mut UnixStream, pid: libc::pid_t) -> Result<()> {
    send_cmd(stream, Kind::ClientPid, &pid.to_ne_bytes())
}

pub fn recv_pid(stream: &mut UnixStream) -> Result<libc::pid_t> {
    let msg = expect(stream, Kind::ClientPid)?;
    if msg.payload.len() != std::mem::size_of::<libc::pid_t>() {
        return Err(Error::Protocol("malformed pid payload".to_string()));
    }
    Ok(libc::pid_t::from_ne_bytes(msg.payload.try_into().unwrap()))
}

/// Build a connected `SOCK_STREAM` pair for the supervisor/init
/// handshake.
pub fn socketpair() -> Result<(UnixStream, UnixStream)> {
    UnixStream::pair().map_err(|e| Error::os("socketpair", e))
}

pub fn as_raw_fd(stream: &UnixStream) -> RawFd {
    use std::os::unix::io::AsRawFd;
    stream.as_raw_fd()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_over_socketpair() {
        let (mut a, mut b) = socketpair().unwrap();
        send_cmd(&mut a, Kind::ClientReady, b"hello").unwrap();
        let msg = recv_cmd(&mut b).unwrap();
        assert_eq!(msg.kind, Kind::ClientReady);
        assert_eq!(msg.payload, b"hello");
    }

    #[test]
    fn pid_roundtrip() {
        let (mut a, mut b) = socketpair().unwrap();
        send_pid(&mut a, 1234).unwrap();
        assert_eq!(recv_pid(&mut b).unwrap(), 1234);
    }

    #[test]
    fn unexpected_kind_is_a_protocol_error() {
        let (mut a, mut b) = socketpair().unwrap();
        send_cmd(&mut a, Kind::ClientReady, &[]).unwrap();
        assert!(expect(&mut b, Kind::ClientExec).is_err());
    }

    #[test]
    fn header_is_sixteen_bytes() {
        assert_eq!(std::mem::size_of::<RawHeader>(), 16);
    }
}
