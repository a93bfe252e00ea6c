//! Generic netlink transport to the host kernel.
//!
//! The host side registers a generic netlink family named `"greybus"`
//! with a single `MSG` command carrying two attributes: the 32-bit host
//! CPort id and the Greybus message itself. Framing is done by hand over
//! a raw `AF_NETLINK` socket: resolve the family id through the netlink
//! controller, then exchange `nlmsghdr`/`genlmsghdr`/`nlattr` encoded
//! datagrams. Acks are never requested and sequence numbers are not
//! checked, matching the host driver's expectations.

use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use byteorder::{ByteOrder, NativeEndian};

use greybus::message::{MSG_HEADER_SIZE, MTU};
use greybus::{Error, Result, SVC_CPORT};

use crate::bridge::{self, Core, HostTransport};
use crate::engine;
use crate::logging::hexdump;

const FAMILY_NAME: &str = "greybus";

/// Fixed local netlink port the host driver addresses.
const GB_NL_PID: u32 = 1;

const GB_NL_CMD_MSG: u8 = 1;
const GB_NL_VERSION: u8 = 1;
const GB_NL_ATTR_DATA: u16 = 1;
const GB_NL_ATTR_CPORT: u16 = 2;

const NLMSG_HDRLEN: usize = 16;
const GENL_HDRLEN: usize = 4;
const NLA_HDRLEN: usize = 4;

const NLMSG_ERROR: u16 = 2;

const GENL_ID_CTRL: u16 = 0x10;
const CTRL_CMD_GETFAMILY: u8 = 3;
const CTRL_ATTR_FAMILY_ID: u16 = 1;
const CTRL_ATTR_FAMILY_NAME: u16 = 2;

const NLM_F_REQUEST: u16 = 1;

const RECV_BUF_SIZE: usize = 8192;
const POLL_INTERVAL_MS: i32 = 500;
const RESOLVE_TIMEOUT_MS: i32 = 5000;

fn align4(len: usize) -> usize {
    (len + 3) & !3
}

/// Raw netlink socket bound to the bridge's fixed port.
struct NlSocket {
    fd: RawFd,
}

impl NlSocket {
    fn open(local_pid: u32) -> io::Result<NlSocket> {
        let fd = unsafe { libc::socket(libc::AF_NETLINK, libc::SOCK_RAW, libc::NETLINK_GENERIC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let sock = NlSocket { fd };

        let mut addr: libc::sockaddr_nl = unsafe { mem::zeroed() };
        addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
        addr.nl_pid = local_pid;
        let rc = unsafe {
            libc::bind(
                sock.fd,
                &addr as *const libc::sockaddr_nl as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(sock)
    }

    fn send(&self, buf: &[u8]) -> io::Result<()> {
        // Destination pid 0 is the kernel.
        let mut addr: libc::sockaddr_nl = unsafe { mem::zeroed() };
        addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
        let rc = unsafe {
            libc::sendto(
                self.fd,
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
                0,
                &addr as *const libc::sockaddr_nl as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let rc = unsafe { libc::recv(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(rc as usize)
    }

    /// Wait for the socket to become readable. `Ok(false)` on timeout or
    /// a caught signal.
    fn poll_readable(&self, timeout_ms: i32) -> io::Result<bool> {
        let mut pfd = libc::pollfd {
            fd: self.fd,
            events: libc::POLLIN,
            revents: 0,
        };
        let rc = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        if rc < 0 {
            let e = io::Error::last_os_error();
            if e.kind() == io::ErrorKind::Interrupted {
                return Ok(false);
            }
            return Err(e);
        }
        Ok(rc > 0 && pfd.revents & libc::POLLIN != 0)
    }
}

impl Drop for NlSocket {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

/// Incremental encoder for one generic netlink message.
struct MsgBuilder {
    buf: Vec<u8>,
}

impl MsgBuilder {
    fn new(nl_type: u16, flags: u16, seq: u32, pid: u32, cmd: u8, version: u8) -> MsgBuilder {
        let mut buf = vec![0u8; NLMSG_HDRLEN + GENL_HDRLEN];
        NativeEndian::write_u16(&mut buf[4..6], nl_type);
        NativeEndian::write_u16(&mut buf[6..8], flags);
        NativeEndian::write_u32(&mut buf[8..12], seq);
        NativeEndian::write_u32(&mut buf[12..16], pid);
        buf[NLMSG_HDRLEN] = cmd;
        buf[NLMSG_HDRLEN + 1] = version;
        MsgBuilder { buf }
    }

    fn put_bytes(&mut self, attr_type: u16, data: &[u8]) {
        let nla_len = NLA_HDRLEN + data.len();
        let start = self.buf.len();
        self.buf.resize(start + align4(nla_len), 0);
        NativeEndian::write_u16(&mut self.buf[start..start + 2], nla_len as u16);
        NativeEndian::write_u16(&mut self.buf[start + 2..start + 4], attr_type);
        self.buf[start + NLA_HDRLEN..start + nla_len].copy_from_slice(data);
    }

    fn put_u32(&mut self, attr_type: u16, value: u32) {
        let mut raw = [0u8; 4];
        NativeEndian::write_u32(&mut raw, value);
        self.put_bytes(attr_type, &raw);
    }

    fn put_str(&mut self, attr_type: u16, value: &str) {
        let mut raw = value.as_bytes().to_vec();
        raw.push(0);
        self.put_bytes(attr_type, &raw);
    }

    fn finish(mut self) -> Vec<u8> {
        let len = self.buf.len() as u32;
        NativeEndian::write_u32(&mut self.buf[0..4], len);
        self.buf
    }
}

/// One netlink message inside a received datagram.
struct NlMsg<'a> {
    nl_type: u16,
    payload: &'a [u8],
}

fn parse_nlmsgs(mut buf: &[u8]) -> Vec<NlMsg<'_>> {
    let mut msgs = Vec::new();
    while buf.len() >= NLMSG_HDRLEN {
        let len = NativeEndian::read_u32(&buf[0..4]) as usize;
        if len < NLMSG_HDRLEN || len > buf.len() {
            log::warn!("truncated netlink message ({} of {} bytes)", buf.len(), len);
            break;
        }
        msgs.push(NlMsg {
            nl_type: NativeEndian::read_u16(&buf[4..6]),
            payload: &buf[NLMSG_HDRLEN..len],
        });
        let advance = align4(len).min(buf.len());
        buf = &buf[advance..];
    }
    msgs
}

fn parse_attrs(mut buf: &[u8]) -> Vec<(u16, &[u8])> {
    let mut attrs = Vec::new();
    while buf.len() >= NLA_HDRLEN {
        let nla_len = NativeEndian::read_u16(&buf[0..2]) as usize;
        if nla_len < NLA_HDRLEN || nla_len > buf.len() {
            break;
        }
        // High bits flag nested/byte-order attributes; the type is below.
        let nla_type = NativeEndian::read_u16(&buf[2..4]) & 0x3fff;
        attrs.push((nla_type, &buf[NLA_HDRLEN..nla_len]));
        let advance = align4(nla_len).min(buf.len());
        buf = &buf[advance..];
    }
    attrs
}

/// The host transport: one socket, one receive thread.
pub struct NetlinkTransport {
    sock: NlSocket,
    family_id: u16,
    seq: AtomicU32,
}

impl NetlinkTransport {
    /// Open the socket and resolve the `"greybus"` family id.
    pub fn new() -> Result<Arc<NetlinkTransport>> {
        let sock = NlSocket::open(GB_NL_PID).map_err(Error::Io)?;
        let family_id = Self::resolve_family(&sock)?;
        log::debug!("resolved netlink family {} to id {}", FAMILY_NAME, family_id);

        Ok(Arc::new(NetlinkTransport {
            sock,
            family_id,
            seq: AtomicU32::new(1),
        }))
    }

    fn resolve_family(sock: &NlSocket) -> Result<u16> {
        let mut msg = MsgBuilder::new(
            GENL_ID_CTRL,
            NLM_F_REQUEST,
            0,
            GB_NL_PID,
            CTRL_CMD_GETFAMILY,
            GB_NL_VERSION,
        );
        msg.put_str(CTRL_ATTR_FAMILY_NAME, FAMILY_NAME);
        sock.send(&msg.finish()).map_err(Error::Io)?;

        if !sock.poll_readable(RESOLVE_TIMEOUT_MS).map_err(Error::Io)? {
            log::error!("timed out resolving netlink family {}", FAMILY_NAME);
            return Err(Error::Timeout);
        }

        let mut buf = vec![0u8; RECV_BUF_SIZE];
        let len = sock.recv(&mut buf).map_err(Error::Io)?;
        for msg in parse_nlmsgs(&buf[..len]) {
            if msg.nl_type == NLMSG_ERROR {
                let errno = if msg.payload.len() >= 4 {
                    -NativeEndian::read_i32(&msg.payload[0..4])
                } else {
                    0
                };
                log::error!(
                    "failed to resolve family {}: errno {} (is the gb-netlink module loaded?)",
                    FAMILY_NAME,
                    errno
                );
                return Err(Error::Absent);
            }
            if msg.nl_type != GENL_ID_CTRL || msg.payload.len() < GENL_HDRLEN {
                continue;
            }
            for (attr_type, value) in parse_attrs(&msg.payload[GENL_HDRLEN..]) {
                if attr_type == CTRL_ATTR_FAMILY_ID && value.len() >= 2 {
                    return Ok(NativeEndian::read_u16(&value[0..2]));
                }
            }
        }

        log::error!("netlink controller answered without a family id");
        Err(Error::Absent)
    }

    /// Spawn the receive loop feeding inbound frames into the bridge.
    pub fn start(self: &Arc<Self>, core: &Arc<Core>) -> Result<JoinHandle<()>> {
        let this = self.clone();
        let core = core.clone();
        thread::Builder::new()
            .name("gb-netlink".into())
            .spawn(move || this.recv_loop(&core))
            .map_err(Error::Io)
    }

    fn recv_loop(&self, core: &Arc<Core>) {
        let mut buf = vec![0u8; RECV_BUF_SIZE];
        while !core.shutdown_requested() {
            match self.sock.poll_readable(POLL_INTERVAL_MS) {
                Ok(false) => continue,
                Ok(true) => {}
                Err(e) => {
                    log::error!("netlink poll failed: {}", e);
                    break;
                }
            }
            let len = match self.sock.recv(&mut buf) {
                Ok(len) => len,
                Err(e) => {
                    log::error!("failed to receive netlink message: {}", e);
                    continue;
                }
            };
            self.handle_datagram(core, &buf[..len]);
        }
        log::debug!("netlink receive loop finished");
    }

    fn handle_datagram(&self, core: &Arc<Core>, datagram: &[u8]) {
        for msg in parse_nlmsgs(datagram) {
            if msg.nl_type == NLMSG_ERROR {
                if msg.payload.len() >= 4 {
                    let errno = -NativeEndian::read_i32(&msg.payload[0..4]);
                    if errno != 0 {
                        log::error!("netlink error message: errno {}", errno);
                    }
                }
                continue;
            }
            if msg.nl_type != self.family_id {
                continue;
            }
            if msg.payload.len() < GENL_HDRLEN {
                continue;
            }
            if msg.payload[0] != GB_NL_CMD_MSG {
                log::warn!("unknown greybus netlink command {}", msg.payload[0]);
                continue;
            }

            let mut cport: Option<u32> = None;
            let mut data: Option<&[u8]> = None;
            for (attr_type, value) in parse_attrs(&msg.payload[GENL_HDRLEN..]) {
                match attr_type {
                    GB_NL_ATTR_CPORT if value.len() >= 4 => {
                        cport = Some(NativeEndian::read_u32(&value[0..4]));
                    }
                    GB_NL_ATTR_DATA => data = Some(value),
                    _ => {}
                }
            }
            let (cport, data) = match (cport, data) {
                (Some(cport), Some(data)) => (cport as u16, data),
                _ => {
                    log::error!("greybus netlink message without cport or data");
                    continue;
                }
            };
            if data.len() < MSG_HEADER_SIZE {
                log::error!("short message received on cport {}", cport);
                continue;
            }

            self.deliver(core, cport, data);
        }
    }

    fn deliver(&self, core: &Arc<Core>, cport: u16, data: &[u8]) {
        hexdump("netlink recv", data);

        if cport == SVC_CPORT {
            if let Err(e) = engine::handle_message(core, greybus::AP_INTF_ID, SVC_CPORT, data) {
                log::error!("failed to handle svc operation: {}", e);
            }
            return;
        }

        let mut msg = data.to_vec();
        if let Err(e) = bridge::forward_to_module(core, cport, &mut msg) {
            log::error!("failed to forward cport {} data to module: {}", cport, e);
        }
    }
}

impl HostTransport for NetlinkTransport {
    fn send(&self, cport_id: u16, msg: &[u8]) -> Result<()> {
        if msg.len() > MTU {
            return Err(Error::Overflow);
        }
        hexdump("netlink send", msg);

        let mut builder = MsgBuilder::new(
            self.family_id,
            NLM_F_REQUEST,
            self.seq.fetch_add(1, Ordering::Relaxed),
            GB_NL_PID,
            GB_NL_CMD_MSG,
            GB_NL_VERSION,
        );
        builder.put_u32(GB_NL_ATTR_CPORT, cport_id as u32);
        builder.put_bytes(GB_NL_ATTR_DATA, msg);
        self.sock.send(&builder.finish()).map_err(Error::Io)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_output_parses_back() {
        let mut builder = MsgBuilder::new(0x1b, NLM_F_REQUEST, 7, GB_NL_PID, GB_NL_CMD_MSG, 1);
        builder.put_u32(GB_NL_ATTR_CPORT, 0x1234);
        builder.put_bytes(GB_NL_ATTR_DATA, &[0xde, 0xad, 0xbe]);
        let wire = builder.finish();

        assert_eq!(NativeEndian::read_u32(&wire[0..4]) as usize, wire.len());

        let msgs = parse_nlmsgs(&wire);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].nl_type, 0x1b);
        assert_eq!(msgs[0].payload[0], GB_NL_CMD_MSG);

        let attrs = parse_attrs(&msgs[0].payload[GENL_HDRLEN..]);
        assert_eq!(attrs.len(), 2);
        assert_eq!(attrs[0].0, GB_NL_ATTR_CPORT);
        assert_eq!(NativeEndian::read_u32(attrs[0].1), 0x1234);
        assert_eq!(attrs[1].0, GB_NL_ATTR_DATA);
        // The attribute keeps its true length even though it is padded on
        // the wire.
        assert_eq!(attrs[1].1, &[0xde, 0xad, 0xbe]);
    }

    #[test]
    fn attr_walk_stops_at_garbage() {
        let mut builder = MsgBuilder::new(0x1b, 0, 0, 0, GB_NL_CMD_MSG, 1);
        builder.put_u32(GB_NL_ATTR_CPORT, 9);
        let mut wire = builder.finish();
        // Corrupt the attribute length so it overruns the buffer.
        let attr_start = NLMSG_HDRLEN + GENL_HDRLEN;
        wire[attr_start] = 0xff;

        let msgs = parse_nlmsgs(&wire);
        assert!(parse_attrs(&msgs[0].payload[GENL_HDRLEN..]).is_empty());
    }

    #[test]
    fn truncated_nlmsg_is_dropped() {
        let mut builder = MsgBuilder::new(0x1b, 0, 0, 0, GB_NL_CMD_MSG, 1);
        builder.put_u32(GB_NL_ATTR_CPORT, 9);
        let wire = builder.finish();
        assert!(parse_nlmsgs(&wire[..wire.len() - 4]).is_empty());
    }
}
