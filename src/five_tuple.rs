use std::hash::{Hash, Hasher};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use nfq::Message;
use rustc_hash::FxHasher;

use crate::packet_context::{SocketRef, SocketState};

const IPPROTO_TCP: u8 = 6;
const IPPROTO_UDP: u8 = 17;

/// Connection key parsed from an IP packet; the orphan hash input.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FiveTuple {
    pub src: IpAddr,
    pub dst: IpAddr,
    pub proto: u8,
    pub src_port: u16,
    pub dst_port: u16,
}

impl Default for FiveTuple {
    fn default() -> Self {
        Self {
            src: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            dst: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            proto: 0,
            src_port: 0,
            dst_port: 0,
        }
    }
}

impl FiveTuple {
    /// Best-effort owner for traffic seen from the outside: a TCP connection
    /// is its own socket, UDP behaves like an unconnected socket, the rest is
    /// left ownerless.
    pub fn socket_ref(&self) -> Option<SocketRef> {
        let state = match self.proto {
            IPPROTO_TCP => SocketState::Connected,
            IPPROTO_UDP => SocketState::Closed,
            _ => return None,
        };
        let mut hasher = FxHasher::default();
        self.hash(&mut hasher);
        Some(SocketRef::connected(hasher.finish()).with_state(state))
    }

    fn ports(&mut self, l4: &[u8]) {
        if (self.proto == IPPROTO_TCP || self.proto == IPPROTO_UDP) && l4.len() >= 4 {
            self.src_port = u16::from_be_bytes([l4[0], l4[1]]);
            self.dst_port = u16::from_be_bytes([l4[2], l4[3]]);
        }
    }
}

impl From<&Vec<u8>> for FiveTuple {
    fn from(value: &Vec<u8>) -> Self {
        value.as_slice().into()
    }
}

impl From<&Message> for FiveTuple {
    fn from(value: &Message) -> Self {
        value.get_payload().into()
    }
}

impl From<&[u8]> for FiveTuple {
    fn from(payload: &[u8]) -> Self {
        let mut t = FiveTuple::default();
        let Some(&first) = payload.first() else {
            return t;
        };

        match first >> 4 {
            4 if payload.len() >= 20 => {
                let ihl = (first & 0x0F) as usize * 4;
                if payload.len() < ihl {
                    return t;
                }
                t.proto = payload[9];
                t.src = IpAddr::V4(Ipv4Addr::new(payload[12], payload[13], payload[14], payload[15]));
                t.dst = IpAddr::V4(Ipv4Addr::new(payload[16], payload[17], payload[18], payload[19]));
                t.ports(&payload[ihl..]);
            }
            // 不解析扩展头，next header 直接当作传输层协议
            6 if payload.len() >= 40 => {
                let mut src = [0u8; 16];
                let mut dst = [0u8; 16];
                src.copy_from_slice(&payload[8..24]);
                dst.copy_from_slice(&payload[24..40]);
                t.proto = payload[6];
                t.src = IpAddr::V6(Ipv6Addr::from(src));
                t.dst = IpAddr::V6(Ipv6Addr::from(dst));
                t.ports(&payload[40..]);
            }
            _ => {}
        }

        t
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ipv4(proto: u8, sport: u16, dport: u16) -> Vec<u8> {
        let mut p = vec![0u8; 28];
        p[0] = 0x45;
        p[9] = proto;
        p[12..16].copy_from_slice(&[10, 0, 0, 1]);
        p[16..20].copy_from_slice(&[10, 0, 0, 2]);
        p[20..22].copy_from_slice(&sport.to_be_bytes());
        p[22..24].copy_from_slice(&dport.to_be_bytes());
        p
    }

    #[test]
    fn parses_ipv4_tcp() {
        let t = FiveTuple::from(&ipv4(IPPROTO_TCP, 443, 50_000));
        assert_eq!(t.src, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(t.dst, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)));
        assert_eq!((t.src_port, t.dst_port), (443, 50_000));
    }

    #[test]
    fn parses_ipv6_udp() {
        let mut p = vec![0u8; 48];
        p[0] = 0x60;
        p[6] = IPPROTO_UDP;
        p[23] = 1;
        p[39] = 2;
        p[40..42].copy_from_slice(&53u16.to_be_bytes());
        let t = FiveTuple::from(p.as_slice());
        assert_eq!(t.src, IpAddr::V6(Ipv6Addr::LOCALHOST));
        assert_eq!(t.proto, IPPROTO_UDP);
        assert_eq!(t.src_port, 53);
    }

    #[test]
    fn short_or_unknown_payload_is_default() {
        assert_eq!(FiveTuple::from(&[0x45u8, 0, 0][..]), FiveTuple::default());
        assert_eq!(FiveTuple::from(&[0u8; 0][..]), FiveTuple::default());
        assert_eq!(FiveTuple::from(&vec![0x10u8; 40]), FiveTuple::default());
    }

    #[test]
    fn socket_inference_by_protocol() {
        let tcp = FiveTuple::from(&ipv4(IPPROTO_TCP, 1, 2)).socket_ref().unwrap();
        assert_eq!(tcp.state, SocketState::Connected);
        let again = FiveTuple::from(&ipv4(IPPROTO_TCP, 1, 2)).socket_ref().unwrap();
        assert_eq!(tcp.id, again.id);
        let other = FiveTuple::from(&ipv4(IPPROTO_TCP, 1, 3)).socket_ref().unwrap();
        assert_ne!(tcp.id, other.id);

        let udp = FiveTuple::from(&ipv4(IPPROTO_UDP, 1, 2)).socket_ref().unwrap();
        assert_eq!(udp.state, SocketState::Closed);
        assert!(FiveTuple::from(&ipv4(1, 0, 0)).socket_ref().is_none());
    }
}
