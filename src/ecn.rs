// ==========================================
// ECN 拥塞标记 (CE)
// ==========================================

pub const INET_ECN_NOT_ECT: u8 = 0;
pub const INET_ECN_ECT_1: u8 = 1;
pub const INET_ECN_ECT_0: u8 = 2;
pub const INET_ECN_CE: u8 = 3;
const INET_ECN_MASK: u8 = 3;

/// Packet payloads that can carry a congestion-experienced mark.
pub trait EcnMark {
    /// Returns true when the packet ends up CE-marked.
    fn set_ce(&mut self) -> bool;
}

impl EcnMark for Vec<u8> {
    fn set_ce(&mut self) -> bool {
        set_ce(self.as_mut_slice())
    }
}

impl EcnMark for Box<[u8]> {
    fn set_ce(&mut self) -> bool {
        set_ce(self)
    }
}

/// ECN codepoint of an IPv4/IPv6 packet, `None` if the header is unreadable.
pub fn codepoint(packet: &[u8]) -> Option<u8> {
    match packet.first()? >> 4 {
        4 if packet.len() >= 20 => Some(packet[1] & INET_ECN_MASK),
        6 if packet.len() >= 40 => Some((packet[1] >> 4) & INET_ECN_MASK),
        _ => None,
    }
}

/// Marks an ECN-capable packet as CE in place. Not-ECT packets are left alone.
pub fn set_ce(packet: &mut [u8]) -> bool {
    let Some(ecn) = codepoint(packet) else {
        return false;
    };
    match ecn {
        INET_ECN_NOT_ECT => false,
        INET_ECN_CE => true,
        _ if packet[0] >> 4 == 4 => {
            let old_word = u16::from_be_bytes([packet[0], packet[1]]);
            packet[1] |= INET_ECN_CE;
            let new_word = u16::from_be_bytes([packet[0], packet[1]]);
            let check = u16::from_be_bytes([packet[10], packet[11]]);
            let check = checksum_update(check, old_word, new_word);
            packet[10..12].copy_from_slice(&check.to_be_bytes());
            true
        }
        _ => {
            // IPv6 traffic class straddles bytes 0 and 1; ECN sits in bits 4..6 of byte 1
            packet[1] |= INET_ECN_CE << 4;
            true
        }
    }
}

// RFC 1624: HC' = ~(~HC + ~m + m')
fn checksum_update(check: u16, old: u16, new: u16) -> u16 {
    let mut sum = u32::from(!check) + u32::from(!old) + u32::from(new);
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

#[cfg(test)]
pub(crate) fn ipv4_header(ecn: u8) -> Vec<u8> {
    let mut h = vec![
        0x45, ecn, 0x00, 0x54, 0x1c, 0x46, 0x40, 0x00, 0x40, 0x06, 0x00, 0x00, 0xc0, 0xa8,
        0x00, 0x01, 0xc0, 0xa8, 0x00, 0xc7,
    ];
    let check = ipv4_checksum(&h);
    h[10..12].copy_from_slice(&check.to_be_bytes());
    h
}

#[cfg(test)]
pub(crate) fn ipv4_checksum(header: &[u8]) -> u16 {
    let mut sum: u32 = header
        .chunks(2)
        .enumerate()
        .filter(|(i, _)| *i != 5)
        .map(|(_, w)| u32::from(u16::from_be_bytes([w[0], w[1]])))
        .sum();
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ect0_ipv4_is_marked_and_checksum_stays_valid() {
        let mut pkt = ipv4_header(INET_ECN_ECT_0);
        assert!(pkt.set_ce());
        assert_eq!(codepoint(&pkt), Some(INET_ECN_CE));
        let stored = u16::from_be_bytes([pkt[10], pkt[11]]);
        assert_eq!(stored, ipv4_checksum(&pkt));
    }

    #[test]
    fn ect1_ipv4_is_marked() {
        let mut pkt = ipv4_header(INET_ECN_ECT_1);
        assert!(set_ce(&mut pkt));
        assert_eq!(pkt[1] & 3, INET_ECN_CE);
        assert_eq!(u16::from_be_bytes([pkt[10], pkt[11]]), ipv4_checksum(&pkt));
    }

    #[test]
    fn not_ect_is_left_untouched() {
        let mut pkt = ipv4_header(INET_ECN_NOT_ECT);
        let before = pkt.clone();
        assert!(!set_ce(&mut pkt));
        assert_eq!(pkt, before);
    }

    #[test]
    fn ipv6_traffic_class_gets_ce() {
        let mut pkt = vec![0u8; 40];
        pkt[0] = 0x60;
        pkt[1] = INET_ECN_ECT_0 << 4;
        assert!(set_ce(&mut pkt));
        assert_eq!(codepoint(&pkt), Some(INET_ECN_CE));
    }

    #[test]
    fn garbage_is_not_marked() {
        let mut pkt = vec![0xff; 8];
        assert!(!set_ce(&mut pkt));
        assert!(!set_ce(&mut []));
    }
}
