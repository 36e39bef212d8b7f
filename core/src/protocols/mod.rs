//! Packet-level protocol decoding.
//!
//! [`View`](view::View) provides bounded, rollback-capable reads over a raw
//! packet buffer; [`extract`](extract::extract) walks the protocol layers and
//! fills in a [`Fields`] record. Flows are identified by the packed 13-byte
//! [`FlowKey`] built from the IPv4 5-tuple.

pub mod extract;
pub mod view;

use std::fmt;

use serde::Serialize;

// EtherTypes.
pub const ETHTYPE_VLAN: u16 = 0x8100;
pub const ETHTYPE_IPV4: u16 = 0x0800;
pub const ETHTYPE_IPV6: u16 = 0x86DD;

// IANA IP protocol numbers.
pub const IP_PROTO_ICMP: u8 = 1;
pub const IP_PROTO_TCP: u8 = 6;
pub const IP_PROTO_UDP: u8 = 17;
pub const IP_PROTO_ENCAP_IPV6: u8 = 41;
pub const IP_PROTO_IPSEC_ESP: u8 = 50;
pub const IP_PROTO_IPSEC_AH: u8 = 51;
pub const IP_PROTO_ICMPV6: u8 = 58;

// TCP flag bits, including the historical NS bit above the classic eight.
pub const TCP_NS: u16 = 0b1_0000_0000;
pub const TCP_CWR: u16 = 0b0_1000_0000;
pub const TCP_ECE: u16 = 0b0_0100_0000;
pub const TCP_URG: u16 = 0b0_0010_0000;
pub const TCP_ACK: u16 = 0b0_0001_0000;
pub const TCP_PSH: u16 = 0b0_0000_1000;
pub const TCP_RST: u16 = 0b0_0000_0100;
pub const TCP_SYN: u16 = 0b0_0000_0010;
pub const TCP_FIN: u16 = 0b0_0000_0001;

// IPv4 header flag bits, relative to the {flags, fragment offset} field.
pub const IP_DF: u8 = 0b10;
pub const IP_MF: u8 = 0b01;

// Interpreted protocol flags. Metadata, not header bits.
pub const PROTO_IPV4: u8 = 0b0001;
pub const PROTO_IPV6: u8 = 0b0010;
pub const PROTO_TCP: u8 = 0b0100;
pub const PROTO_UDP: u8 = 0b1000;

/// Decoded header fields for a single packet.
///
/// One `Fields` is filled per packet by the extractor; unparsed layers leave
/// their fields zeroed. Only IPv4 addresses participate in flow keying; IPv6
/// and VLAN are decoded but not keyed.
#[derive(Debug, Default, Clone)]
pub struct Fields {
    /// Interpreted protocol membership (`PROTO_*` bits).
    pub proto_flags: u8,
    /// TCP flag bits (`TCP_*`), 9 bits with NS.
    pub tcp_flags: u16,

    // Ethernet.
    pub eth_src: u64,
    pub eth_dst: u64,
    pub eth_type: u16,
    /// Outermost VLAN identifier, 0 when untagged.
    pub vlan_id: u16,

    // IP.
    pub ipv4_src: u32,
    pub ipv4_dst: u32,
    /// IPv4 total length or IPv6 payload length.
    pub ip_length: u16,
    /// Fragment offset in 8-byte units.
    pub ip_frag_offset: u16,
    pub ip_proto: u8,
    /// Traffic class: `{6b DSCP, 2b ECN}`.
    pub ip_tc: u8,
    /// IPv6 flow label (20 bits); zero for IPv4.
    pub ip_flow_label: u32,
    /// IPv4 DF/MF bits (`IP_*`).
    pub ip_flags: u8,
    pub ipv6_src: u128,
    pub ipv6_dst: u128,
    pub ip_hop_limit: u8,

    // Transport.
    pub src_port: u16,
    pub dst_port: u16,

    // TCP.
    pub tcp_seq: u32,
    pub tcp_ack: u32,
    pub tcp_window: u16,
    /// Header length in 32-bit words.
    pub tcp_offset: u8,

    // ICMP.
    pub icmp_type: u8,
    pub icmp_code: u8,
}

impl Fields {
    #[inline]
    pub fn is_tcp(&self) -> bool {
        self.proto_flags & PROTO_TCP != 0
    }

    #[inline]
    pub fn is_udp(&self) -> bool {
        self.proto_flags & PROTO_UDP != 0
    }

    #[inline]
    pub fn tcp_flag(&self, bit: u16) -> bool {
        self.tcp_flags & bit != 0
    }

    /// Packs the interpreted protocol, IP, and TCP flags into one 15-bit
    /// value: `{proto[4], ip[2], tcp[9]}`.
    #[inline]
    pub fn flags_bitset(&self) -> u16 {
        ((self.proto_flags as u16) << 11) | ((self.ip_flags as u16) << 9) | self.tcp_flags
    }

    /// Builds the packed flow key from the decoded 5-tuple.
    pub fn flow_key(&self) -> FlowKey {
        FlowKey::new(
            self.ipv4_src,
            self.ipv4_dst,
            self.src_port,
            self.dst_port,
            self.ip_proto,
        )
    }
}

/// The packed 13-byte flow key: `{src_ip, dst_ip, src_port, dst_port, proto}`
/// in network byte order. Compared and hashed as raw bytes.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct FlowKey([u8; FlowKey::SIZE]);

impl FlowKey {
    pub const SIZE: usize = 13;

    pub fn new(src_ip: u32, dst_ip: u32, src_port: u16, dst_port: u16, proto: u8) -> Self {
        let mut b = [0u8; Self::SIZE];
        b[0..4].copy_from_slice(&src_ip.to_be_bytes());
        b[4..8].copy_from_slice(&dst_ip.to_be_bytes());
        b[8..10].copy_from_slice(&src_port.to_be_bytes());
        b[10..12].copy_from_slice(&dst_port.to_be_bytes());
        b[12] = proto;
        FlowKey(b)
    }

    pub fn from_bytes(bytes: [u8; Self::SIZE]) -> Self {
        FlowKey(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; Self::SIZE] {
        &self.0
    }

    #[inline]
    pub fn src_ip(&self) -> u32 {
        u32::from_be_bytes(self.0[0..4].try_into().unwrap())
    }

    #[inline]
    pub fn dst_ip(&self) -> u32 {
        u32::from_be_bytes(self.0[4..8].try_into().unwrap())
    }

    #[inline]
    pub fn src_port(&self) -> u16 {
        u16::from_be_bytes(self.0[8..10].try_into().unwrap())
    }

    #[inline]
    pub fn dst_port(&self) -> u16 {
        u16::from_be_bytes(self.0[10..12].try_into().unwrap())
    }

    #[inline]
    pub fn proto(&self) -> u8 {
        self.0[12]
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let src = std::net::Ipv4Addr::from(self.src_ip());
        let dst = std::net::Ipv4Addr::from(self.dst_ip());
        write!(
            f,
            "{},{},{},{},{}",
            src,
            dst,
            self.src_port(),
            self.dst_port(),
            self.proto()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_flow_key_roundtrip() {
        let key = FlowKey::new(0xc0a8_0101, 0x0808_0808, 51823, 443, IP_PROTO_TCP);
        let restored = FlowKey::from_bytes(*key.as_bytes());
        assert_eq!(restored, key);
        assert_eq!(restored.src_ip(), 0xc0a8_0101);
        assert_eq!(restored.dst_ip(), 0x0808_0808);
        assert_eq!(restored.src_port(), 51823);
        assert_eq!(restored.dst_port(), 443);
        assert_eq!(restored.proto(), IP_PROTO_TCP);
    }

    #[test]
    fn core_flow_key_display() {
        let key = FlowKey::new(0xc0a8_0101, 0x0a00_0001, 1234, 80, IP_PROTO_UDP);
        assert_eq!(key.to_string(), "192.168.1.1,10.0.0.1,1234,80,17");
    }

    #[test]
    fn core_flags_bitset_layout() {
        let mut fields = Fields {
            proto_flags: PROTO_IPV4 | PROTO_TCP,
            ip_flags: IP_DF,
            tcp_flags: TCP_SYN | TCP_ACK,
            ..Default::default()
        };
        let bits = fields.flags_bitset();
        assert_eq!(bits >> 11, (PROTO_IPV4 | PROTO_TCP) as u16);
        assert_eq!((bits >> 9) & 0b11, IP_DF as u16);
        assert_eq!(bits & 0x1ff, TCP_SYN | TCP_ACK);

        fields.tcp_flags |= TCP_NS;
        assert_eq!(fields.flags_bitset() & 0x1ff, TCP_NS | TCP_SYN | TCP_ACK);
    }
}
