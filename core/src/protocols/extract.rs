//! Layered header extraction.
//!
//! [`extract`] walks a packet from `start` down through the protocol layers,
//! committing the view after each successfully decoded header. Truncation or
//! an inconsistent length field stops extraction at the failing layer: the
//! view rolls back to the last commit, the packet is flagged malformed, and
//! the fields decoded so far remain valid. No packet aborts processing.

use super::view::{View, ViewError};
use super::*;

use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ExtractError {
    /// Not enough bytes for the current layer.
    #[error("truncated at current layer")]
    Truncated,
    /// A length field disagrees with the buffer. Recovered like truncation.
    #[error("header length inconsistent with buffer")]
    Inconsistent,
}

impl From<ViewError> for ExtractError {
    fn from(_: ViewError) -> Self {
        ExtractError::Truncated
    }
}

type LayerResult = std::result::Result<usize, ExtractError>;

/// Layer at which to begin extraction. Capture sources that strip link
/// headers (CAIDA-style traces) start at [`StartLayer::Ip`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartLayer {
    Ethernet,
    Ip,
    Tcp,
    Udp,
}

/// Outcome of extraction: bytes committed across all decoded layers, and
/// whether the walk ended on a truncated or inconsistent layer.
#[derive(Debug, Default, Clone, Copy)]
pub struct Extracted {
    pub committed: usize,
    pub malformed: bool,
}

/// Runs one layer; on failure, rolls the view back to the last commit and
/// flags the packet malformed.
fn run_layer(
    view: &mut View,
    fields: &mut Fields,
    out: &mut Extracted,
    layer: fn(&mut View, &mut Fields) -> LayerResult,
) -> usize {
    match layer(view, fields) {
        Ok(n) => n,
        Err(e) => {
            log::debug!("extract stopped: {}", e);
            view.rollback();
            out.malformed = true;
            0
        }
    }
}

/// Parses the packet in `view` starting at `start`, populating `fields`.
pub fn extract(view: &mut View, fields: &mut Fields, start: StartLayer) -> Extracted {
    let mut out = Extracted::default();

    let ether_type = match start {
        StartLayer::Ethernet => {
            if run_layer(view, fields, &mut out, extract_ethernet) == 0 {
                out.committed = view.committed();
                return out;
            }
            fields.eth_type
        }
        StartLayer::Ip => {
            // Resolved by the version nibble below.
            match view.peek_u8() {
                Ok(b) if b >> 4 == 6 => ETHTYPE_IPV6,
                Ok(_) => ETHTYPE_IPV4,
                Err(_) => {
                    out.malformed = true;
                    return out;
                }
            }
        }
        StartLayer::Tcp => {
            fields.ip_proto = IP_PROTO_TCP;
            fields.proto_flags |= PROTO_TCP;
            run_layer(view, fields, &mut out, extract_tcp);
            out.committed = view.committed();
            return out;
        }
        StartLayer::Udp => {
            fields.ip_proto = IP_PROTO_UDP;
            fields.proto_flags |= PROTO_UDP;
            run_layer(view, fields, &mut out, extract_udp);
            out.committed = view.committed();
            return out;
        }
    };

    // L3.
    if matches!(ether_type, ETHTYPE_IPV4 | ETHTYPE_IPV6) {
        if run_layer(view, fields, &mut out, extract_ip) == 0 {
            out.committed = view.committed();
            return out;
        }
    } else {
        log::debug!("unknown ethertype {:#06x}", ether_type);
        out.committed = view.committed();
        return out;
    }

    // Fragment gating: only a first fragment continues to L4.
    if fields.ip_flags & IP_MF != 0 || fields.ip_frag_offset != 0 {
        if !(fields.ip_flags & IP_MF != 0 && fields.ip_frag_offset == 0) {
            out.committed = view.committed();
            return out;
        }
    }

    // L4.
    match fields.ip_proto {
        IP_PROTO_TCP => {
            fields.proto_flags |= PROTO_TCP;
            run_layer(view, fields, &mut out, extract_tcp);
        }
        IP_PROTO_UDP => {
            fields.proto_flags |= PROTO_UDP;
            run_layer(view, fields, &mut out, extract_udp);
        }
        IP_PROTO_ICMP => {
            run_layer(view, fields, &mut out, extract_icmpv4);
        }
        IP_PROTO_ICMPV6 => {
            run_layer(view, fields, &mut out, extract_icmpv6);
        }
        IP_PROTO_IPSEC_AH => {
            run_layer(view, fields, &mut out, extract_ipsec_ah);
        }
        IP_PROTO_IPSEC_ESP => {
            run_layer(view, fields, &mut out, extract_ipsec_esp);
        }
        other => {
            log::debug!("unknown ip protocol {}", other);
        }
    }

    out.committed = view.committed();
    out
}

/// Ethernet header plus any VLAN tag stack. The outermost VLAN id is kept;
/// nested tags are stripped without being recorded.
fn extract_ethernet(view: &mut View, fields: &mut Fields) -> LayerResult {
    fields.eth_dst = view.get_uint(6)?;
    fields.eth_src = view.get_uint(6)?;
    let mut ether_type = view.get_u16()?;

    if ether_type == ETHTYPE_VLAN {
        fields.vlan_id = view.get_u16()? & 0x0fff;
        ether_type = view.get_u16()?;
        while ether_type == ETHTYPE_VLAN {
            view.discard(2)?;
            ether_type = view.get_u16()?;
        }
    }
    fields.eth_type = ether_type;

    let extracted = view.pending();
    view.commit();
    Ok(extracted)
}

/// Dispatches on the IP version nibble. An unknown version leaves the view
/// at the last commit and reports zero bytes.
fn extract_ip(view: &mut View, fields: &mut Fields) -> LayerResult {
    match view.peek_u8()? >> 4 {
        4 => {
            fields.proto_flags |= PROTO_IPV4;
            extract_ipv4(view, fields)
        }
        6 => {
            fields.proto_flags |= PROTO_IPV6;
            extract_ipv6(view, fields)
        }
        v => {
            log::debug!("unknown ip version {}", v);
            Ok(0)
        }
    }
}

fn extract_ipv4(view: &mut View, fields: &mut Fields) -> LayerResult {
    let ver_ihl = view.get_u8()?;
    let version = ver_ihl >> 4;
    let ihl = ver_ihl & 0x0f;
    if version != 4 {
        view.rollback();
        return Ok(0);
    }
    if ihl < 5 || ihl as usize * 4 > view.committed_remaining() {
        log::debug!("ipv4 ihl {} inconsistent with buffer", ihl);
    }

    fields.ip_tc = view.get_u8()?;
    fields.ip_length = view.get_u16()?;
    if fields.ip_length as usize != view.committed_remaining() {
        log::debug!(
            "ipv4 total_length {} != {} remaining",
            fields.ip_length,
            view.committed_remaining()
        );
    }

    view.discard(2)?; // identification
    let flags_frag = view.get_u16()?;
    fields.ip_flags = ((flags_frag >> 13) & 0b11) as u8;
    fields.ip_frag_offset = flags_frag & 0x1fff;
    view.discard(1)?; // ttl
    fields.ip_proto = view.get_u8()?;
    view.discard(2)?; // checksum
    fields.ipv4_src = view.get_u32()?;
    fields.ipv4_dst = view.get_u32()?;

    if ihl > 5 {
        view.discard((ihl as usize - 5) * 4)?;
    }

    let extracted = view.pending();
    view.commit();
    Ok(extracted)
}

/// Fixed IPv6 header. Extension-header chain traversal is not implemented;
/// a non-final next-header ends extraction after L3.
fn extract_ipv6(view: &mut View, fields: &mut Fields) -> LayerResult {
    let b0 = view.get_u8()?;
    if b0 >> 4 != 6 {
        view.rollback();
        return Ok(0);
    }
    let b1 = view.get_u8()?;
    fields.ip_tc = (b0 & 0x0f) << 4 | (b1 >> 4);
    fields.ip_flow_label = ((b1 as u32 & 0x0f) << 16) | view.get_u16()? as u32;
    fields.ip_length = view.get_u16()?;
    if fields.ip_length as usize > view.committed_remaining() {
        log::debug!(
            "ipv6 payload_length {} exceeds {} remaining",
            fields.ip_length,
            view.committed_remaining()
        );
    }
    fields.ip_proto = view.get_u8()?;
    fields.ip_hop_limit = view.get_u8()?;
    fields.ipv6_src = view.get_u128()?;
    fields.ipv6_dst = view.get_u128()?;

    let extracted = view.pending();
    view.commit();
    Ok(extracted)
}

fn extract_tcp(view: &mut View, fields: &mut Fields) -> LayerResult {
    fields.src_port = view.get_u16()?;
    fields.dst_port = view.get_u16()?;
    fields.tcp_seq = view.get_u32()?;
    fields.tcp_ack = view.get_u32()?;

    let b12 = view.get_u8()?;
    let offset = b12 >> 4;
    fields.tcp_offset = offset;
    fields.tcp_flags = (((b12 as u16 & 0x0f) << 8) | view.get_u8()? as u16) & 0x1ff;
    if offset < 5 {
        log::debug!("tcp data offset {} too small", offset);
    }
    if offset as usize * 4 > view.committed_remaining() {
        log::debug!("tcp data offset {} exceeds buffer", offset);
    }

    fields.tcp_window = view.get_u16()?;
    view.discard(2)?; // checksum
    view.discard(2)?; // urgent pointer

    let mut extracted = view.pending();
    view.commit();

    // Options are skipped, not decoded.
    if offset > 5 {
        let skip = (offset as usize - 5) * 4;
        if skip <= view.remaining() && view.discard(skip).is_ok() {
            extracted += view.pending();
            view.commit();
        }
    }
    Ok(extracted)
}

fn extract_udp(view: &mut View, fields: &mut Fields) -> LayerResult {
    fields.src_port = view.get_u16()?;
    fields.dst_port = view.get_u16()?;
    let udp_len = view.get_u16()?;
    if udp_len < 8 {
        log::debug!("udp length {} too small", udp_len);
    }
    if udp_len as usize > view.committed_remaining() {
        log::debug!("udp length {} exceeds buffer", udp_len);
    }
    view.discard(2)?; // checksum

    let extracted = view.pending();
    view.commit();
    Ok(extracted)
}

fn extract_icmpv4(view: &mut View, fields: &mut Fields) -> LayerResult {
    fields.icmp_type = view.get_u8()?;
    fields.icmp_code = view.get_u8()?;
    view.discard(2)?; // checksum
    view.discard(4)?; // rest of header

    let extracted = view.pending();
    view.commit();
    Ok(extracted)
}

fn extract_icmpv6(view: &mut View, fields: &mut Fields) -> LayerResult {
    extract_icmpv4(view, fields)
}

/// IPsec authentication header. The next-header field replaces `ip_proto`;
/// the encapsulated payload itself is not walked.
fn extract_ipsec_ah(view: &mut View, fields: &mut Fields) -> LayerResult {
    fields.ip_proto = view.get_u8()?;
    view.discard(1)?; // payload length
    view.discard(2)?; // reserved
    view.discard(4)?; // spi
    view.discard(4)?; // sequence

    let extracted = view.pending();
    view.commit();
    Ok(extracted)
}

fn extract_ipsec_esp(view: &mut View, fields: &mut Fields) -> LayerResult {
    view.discard(4)?; // spi
    view.discard(4)?; // sequence

    let extracted = view.pending();
    view.commit();
    Ok(extracted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{tcp_packet, udp_packet, PacketSpec};

    #[test]
    fn core_extract_tcp_packet() {
        let pkt = tcp_packet(&PacketSpec {
            src_ip: 0x0a00_0001,
            dst_ip: 0x0a00_0002,
            src_port: 49152,
            dst_port: 443,
            seq: 1000,
            flags: TCP_SYN,
            payload: 0,
        });
        let mut view = View::new(&pkt);
        let mut fields = Fields::default();
        let out = extract(&mut view, &mut fields, StartLayer::Ethernet);

        assert!(!out.malformed);
        assert_eq!(out.committed, pkt.len());
        assert!(fields.is_tcp());
        assert_eq!(fields.ipv4_src, 0x0a00_0001);
        assert_eq!(fields.ipv4_dst, 0x0a00_0002);
        assert_eq!(fields.src_port, 49152);
        assert_eq!(fields.dst_port, 443);
        assert_eq!(fields.tcp_seq, 1000);
        assert_eq!(fields.tcp_flags, TCP_SYN);
        assert_eq!(fields.ip_proto, IP_PROTO_TCP);
    }

    #[test]
    fn core_extract_udp_packet() {
        let pkt = udp_packet(0x0a00_0001, 0x0a00_0002, 5353, 5353, 16);
        let mut view = View::new(&pkt);
        let mut fields = Fields::default();
        let out = extract(&mut view, &mut fields, StartLayer::Ethernet);

        assert!(!out.malformed);
        assert!(fields.is_udp());
        assert_eq!(fields.src_port, 5353);
        assert_eq!(fields.dst_port, 5353);
    }

    #[test]
    fn core_extract_vlan_strip() {
        let inner = tcp_packet(&PacketSpec {
            src_ip: 1,
            dst_ip: 2,
            src_port: 3,
            dst_port: 4,
            seq: 0,
            flags: TCP_ACK,
            payload: 0,
        });
        // Rebuild with an 802.1Q tag after the MAC addresses.
        let mut pkt = Vec::new();
        pkt.extend_from_slice(&inner[..12]);
        pkt.extend_from_slice(&ETHTYPE_VLAN.to_be_bytes());
        pkt.extend_from_slice(&(0x2064u16).to_be_bytes()); // pcp=1, vid=100
        pkt.extend_from_slice(&inner[12..]);

        let mut view = View::new(&pkt);
        let mut fields = Fields::default();
        let out = extract(&mut view, &mut fields, StartLayer::Ethernet);

        assert!(!out.malformed);
        assert_eq!(fields.vlan_id, 100);
        assert_eq!(fields.eth_type, ETHTYPE_IPV4);
        assert!(fields.is_tcp());
    }

    #[test]
    fn core_extract_truncated_l4_keeps_l3() {
        let pkt = tcp_packet(&PacketSpec {
            src_ip: 0x0a00_0001,
            dst_ip: 0x0a00_0002,
            src_port: 80,
            dst_port: 8080,
            seq: 7,
            flags: TCP_ACK,
            payload: 0,
        });
        // Slice mid-TCP: ethernet (14) + ipv4 (20) + 6 bytes of TCP.
        let cut = &pkt[..40];
        let mut view = View::new(cut);
        let mut fields = Fields::default();
        let out = extract(&mut view, &mut fields, StartLayer::Ethernet);

        assert!(out.malformed);
        // Only L2 + L3 were committed; the partial TCP read rolled back.
        assert_eq!(out.committed, 34);
        assert_eq!(fields.ipv4_src, 0x0a00_0001);
    }

    #[test]
    fn core_extract_fragment_stops_at_l3() {
        let mut pkt = tcp_packet(&PacketSpec {
            src_ip: 1,
            dst_ip: 2,
            src_port: 3,
            dst_port: 4,
            seq: 0,
            flags: TCP_ACK,
            payload: 0,
        });
        // Set fragment offset 0x10 in the IPv4 header (byte 20..22 of frame).
        pkt[20] = 0x00;
        pkt[21] = 0x10;

        let mut view = View::new(&pkt);
        let mut fields = Fields::default();
        let out = extract(&mut view, &mut fields, StartLayer::Ethernet);

        assert!(!out.malformed);
        assert_eq!(fields.ip_frag_offset, 0x10);
        // Non-first fragment: L4 untouched.
        assert_eq!(fields.src_port, 0);
        assert_eq!(out.committed, 34);
    }

    #[test]
    fn core_extract_first_fragment_parses_l4() {
        let mut pkt = tcp_packet(&PacketSpec {
            src_ip: 1,
            dst_ip: 2,
            src_port: 3,
            dst_port: 4,
            seq: 0,
            flags: TCP_ACK,
            payload: 0,
        });
        // MF set, offset zero.
        pkt[20] = 0x20;
        pkt[21] = 0x00;

        let mut view = View::new(&pkt);
        let mut fields = Fields::default();
        extract(&mut view, &mut fields, StartLayer::Ethernet);

        assert_eq!(fields.ip_flags & IP_MF, IP_MF);
        assert_eq!(fields.src_port, 3);
    }

    #[test]
    fn core_extract_start_at_ip() {
        let pkt = tcp_packet(&PacketSpec {
            src_ip: 9,
            dst_ip: 10,
            src_port: 11,
            dst_port: 12,
            seq: 0,
            flags: TCP_ACK,
            payload: 4,
        });
        let l3 = &pkt[14..];
        let mut view = View::new(l3);
        let mut fields = Fields::default();
        let out = extract(&mut view, &mut fields, StartLayer::Ip);

        assert!(!out.malformed);
        assert_eq!(fields.ipv4_src, 9);
        assert_eq!(fields.src_port, 11);
        assert_eq!(out.committed, l3.len() - 4); // payload not consumed
    }
}
