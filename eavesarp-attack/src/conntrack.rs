//! A minimal `NETLINK_NETFILTER` conntrack DESTROY listener.
//!
//! The engine only needs one thing from conntrack: "this 4-tuple's flow
//! just ended, evict it from the connection map" (spec.md §4.4 step 2,
//! §4.6). Rather than pull in a full libnetfilter_conntrack binding this
//! speaks just enough of the `nfnetlink_conntrack` wire format — a
//! netlink header, a 4-byte `nfgenmsg`, and the `CTA_TUPLE_ORIG` nested
//! attribute — to recover the original (victim-facing) 4-tuple of a
//! destroyed flow.

use std::io;
use std::mem::MaybeUninit;
use std::net::Ipv4Addr;

use eavesarp_core::addr::Transport;

const NETLINK_NETFILTER: i32 = 12;
const NF_NETLINK_CONNTRACK_DESTROY: u32 = 0x00000004;

const NFNL_SUBSYS_CTNETLINK: u16 = 1;
const IPCTNL_MSG_CT_DELETE: u16 = 2;

const CTA_TUPLE_ORIG: u16 = 1;
const CTA_TUPLE_IP: u16 = 1;
const CTA_TUPLE_PROTO: u16 = 2;
const CTA_IP_V4_SRC: u16 = 1;
const CTA_IP_V4_DST: u16 = 2;
const CTA_PROTO_NUM: u16 = 1;
const CTA_PROTO_SRC_PORT: u16 = 2;
const CTA_PROTO_DST_PORT: u16 = 3;

const NLA_F_NESTED: u16 = 0x8000;
const NLA_TYPE_MASK: u16 = !NLA_F_NESTED;

const IPPROTO_TCP: u8 = 6;
const IPPROTO_UDP: u8 = 17;
const IPPROTO_SCTP: u8 = 132;

/// The original-direction 4-tuple of a flow conntrack just destroyed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DestroyedFlow {
    pub src_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_ip: Ipv4Addr,
    pub dst_port: u16,
    pub transport: Transport,
}

/// A raw `NETLINK_NETFILTER` socket subscribed to the conntrack DESTROY
/// multicast group.
pub struct ConntrackSocket {
    fd: std::os::unix::io::RawFd,
}

impl ConntrackSocket {
    pub fn open() -> io::Result<Self> {
        unsafe {
            let fd = libc::socket(libc::AF_NETLINK, libc::SOCK_RAW | libc::SOCK_CLOEXEC, NETLINK_NETFILTER);
            if fd < 0 {
                return Err(io::Error::last_os_error());
            }
            let mut addr: libc::sockaddr_nl = MaybeUninit::zeroed().assume_init();
            addr.nl_family = libc::AF_NETLINK as u16;
            addr.nl_groups = NF_NETLINK_CONNTRACK_DESTROY;
            let rc = libc::bind(
                fd,
                &addr as *const _ as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_nl>() as u32,
            );
            if rc < 0 {
                let e = io::Error::last_os_error();
                libc::close(fd);
                return Err(e);
            }
            Ok(Self { fd })
        }
    }

    /// Blocking receive of one or more destroy notifications in a single
    /// netlink datagram.
    pub fn recv_destroyed(&self) -> io::Result<Vec<DestroyedFlow>> {
        let mut buf = [0u8; 8192];
        let n = unsafe { libc::recv(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(parse_netlink_datagram(&buf[..n as usize]))
    }
}

impl Drop for ConntrackSocket {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

// SAFETY: the raw fd is only ever touched through `recv`/`close`, both
// of which are safe to call from any thread.
unsafe impl Send for ConntrackSocket {}
unsafe impl Sync for ConntrackSocket {}

fn parse_netlink_datagram(buf: &[u8]) -> Vec<DestroyedFlow> {
    let mut flows = Vec::new();
    let mut offset = 0usize;
    while offset + 16 <= buf.len() {
        let len = u32::from_ne_bytes(buf[offset..offset + 4].try_into().unwrap()) as usize;
        if len < 16 || offset + len > buf.len() {
            break;
        }
        let msg_type = u16::from_ne_bytes(buf[offset + 4..offset + 6].try_into().unwrap());
        let subsys = (msg_type >> 8) as u16;
        let cmd = msg_type & 0x00ff;
        if subsys == NFNL_SUBSYS_CTNETLINK && cmd == IPCTNL_MSG_CT_DELETE {
            // netlink header (16) + nfgenmsg (4)
            let payload_start = offset + 16 + 4;
            if payload_start <= offset + len {
                if let Some(flow) = parse_ct_attrs(&buf[payload_start..offset + len]) {
                    flows.push(flow);
                }
            }
        }
        offset += (len + 3) & !3; // netlink messages are 4-byte aligned
    }
    flows
}

/// Walks the top-level attribute list looking for `CTA_TUPLE_ORIG`, then
/// its nested `CTA_TUPLE_IP`/`CTA_TUPLE_PROTO` children.
fn parse_ct_attrs(buf: &[u8]) -> Option<DestroyedFlow> {
    let tuple = find_attr(buf, CTA_TUPLE_ORIG)?;
    let ip = find_attr(tuple, CTA_TUPLE_IP)?;
    let proto = find_attr(tuple, CTA_TUPLE_PROTO)?;

    let src_ip = find_attr(ip, CTA_IP_V4_SRC).and_then(to_ipv4)?;
    let dst_ip = find_attr(ip, CTA_IP_V4_DST).and_then(to_ipv4)?;
    let proto_num = find_attr(proto, CTA_PROTO_NUM).and_then(|v| v.first().copied())?;
    let src_port = find_attr(proto, CTA_PROTO_SRC_PORT).and_then(to_u16_be)?;
    let dst_port = find_attr(proto, CTA_PROTO_DST_PORT).and_then(to_u16_be)?;

    let transport = match proto_num {
        IPPROTO_TCP => Transport::Tcp,
        IPPROTO_UDP => Transport::Udp,
        IPPROTO_SCTP => Transport::Sctp,
        _ => return None,
    };

    Some(DestroyedFlow {
        src_ip,
        src_port,
        dst_ip,
        dst_port,
        transport,
    })
}

fn to_ipv4(v: &[u8]) -> Option<Ipv4Addr> {
    let arr: [u8; 4] = v.get(0..4)?.try_into().ok()?;
    Some(Ipv4Addr::from(arr))
}

fn to_u16_be(v: &[u8]) -> Option<u16> {
    let arr: [u8; 2] = v.get(0..2)?.try_into().ok()?;
    Some(u16::from_be_bytes(arr))
}

/// Finds the first top-level `nlattr` of type `want` in `buf` and returns
/// its value bytes (for a nested attribute, this is itself a list of
/// attributes to be walked again).
fn find_attr(buf: &[u8], want: u16) -> Option<&[u8]> {
    let mut offset = 0usize;
    while offset + 4 <= buf.len() {
        let len = u16::from_ne_bytes(buf[offset..offset + 2].try_into().ok()?) as usize;
        let attr_type = u16::from_ne_bytes(buf[offset + 2..offset + 4].try_into().ok()?) & NLA_TYPE_MASK;
        if len < 4 || offset + len > buf.len() {
            break;
        }
        let value = &buf[offset + 4..offset + len];
        if attr_type == want {
            return Some(value);
        }
        offset += (len + 3) & !3;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nlattr(attr_type: u16, value: &[u8]) -> Vec<u8> {
        let len = 4 + value.len();
        let mut out = Vec::new();
        out.extend_from_slice(&(len as u16).to_ne_bytes());
        out.extend_from_slice(&attr_type.to_ne_bytes());
        out.extend_from_slice(value);
        while out.len() % 4 != 0 {
            out.push(0);
        }
        out
    }

    fn nested(attr_type: u16, children: &[u8]) -> Vec<u8> {
        nlattr(attr_type | NLA_F_NESTED, children)
    }

    #[test]
    fn parses_a_minimal_destroy_tuple() {
        let ip_attrs = [
            nlattr(CTA_IP_V4_SRC, &Ipv4Addr::new(10, 0, 0, 10).octets()),
            nlattr(CTA_IP_V4_DST, &Ipv4Addr::new(10, 0, 0, 20).octets()),
        ]
        .concat();
        let proto_attrs = [
            nlattr(CTA_PROTO_NUM, &[IPPROTO_TCP]),
            nlattr(CTA_PROTO_SRC_PORT, &5000u16.to_be_bytes()),
            nlattr(CTA_PROTO_DST_PORT, &443u16.to_be_bytes()),
        ]
        .concat();
        let tuple_children = [nested(CTA_TUPLE_IP, &ip_attrs), nested(CTA_TUPLE_PROTO, &proto_attrs)].concat();
        let top = nested(CTA_TUPLE_ORIG, &tuple_children);

        let flow = parse_ct_attrs(&top).unwrap();
        assert_eq!(flow.src_ip, Ipv4Addr::new(10, 0, 0, 10));
        assert_eq!(flow.dst_ip, Ipv4Addr::new(10, 0, 0, 20));
        assert_eq!(flow.src_port, 5000);
        assert_eq!(flow.dst_port, 443);
        assert_eq!(flow.transport, Transport::Tcp);
    }
}
