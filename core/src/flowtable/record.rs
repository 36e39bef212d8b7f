//! Per-flow state records.

use crate::protocols::{Fields, FlowKey, IP_MF, TCP_ACK, TCP_FIN, TCP_PSH, TCP_RST, TCP_SYN, TCP_URG};
use crate::utils::TimeSpec;

use std::fmt;

use serde::Serialize;

/// Monotonic flow identifier, unique for the process lifetime. Id `0` is
/// reserved for "flow not found".
pub type FlowId = u64;

/// Why a record left the live table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RetireReason {
    /// A new SYN with a different sequence number arrived on a live record.
    SynReuse,
    /// Idle after RST.
    RstIdle,
    /// Idle after FIN.
    FinIdle,
    /// TCP flow idle past the long timeout.
    TcpIdle,
    /// UDP or other flow idle past the short timeout.
    UdpIdle,
}

impl fmt::Display for RetireReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RetireReason::SynReuse => "SYN_REUSE",
            RetireReason::RstIdle => "RST_IDLE",
            RetireReason::FinIdle => "FIN_IDLE",
            RetireReason::TcpIdle => "TCP_IDLE",
            RetireReason::UdpIdle => "UDP_IDLE",
        };
        f.write_str(s)
    }
}

/// Accumulated state for one flow.
///
/// Counters are updated once per packet by [`update`](FlowRecord::update).
/// With the timeseries mode enabled the record keeps the full arrival-delta
/// and size series; otherwise only the latest arrival offset is retained.
#[derive(Debug)]
pub struct FlowRecord {
    flow_id: FlowId,
    key: FlowKey,
    start: TimeSpec,
    timeseries: bool,

    pkts: u64,
    bytes: u64,
    /// Arrival offsets from `start` in nanoseconds. Holds the full series in
    /// timeseries mode, otherwise only the most recent value.
    arrival_ns: Vec<u64>,
    /// Per-packet wire sizes, timeseries mode only.
    byte_series: Vec<u16>,

    proto_flags: u8,
    fragments: u64,
    retransmits: u64,
    /// Pure ACKs decrement, payload-carrying ACKs increment.
    directionality: i64,

    last_seq: u32,
    saw_syn: bool,
    saw_fin: bool,
    saw_rst: bool,
    ack_count: u64,
    psh_count: u64,
    urg_count: u64,
}

impl FlowRecord {
    pub fn new(flow_id: FlowId, key: FlowKey, start: TimeSpec, timeseries: bool) -> Self {
        FlowRecord {
            flow_id,
            key,
            start,
            timeseries,
            pkts: 0,
            bytes: 0,
            arrival_ns: Vec::new(),
            byte_series: Vec::new(),
            proto_flags: 0,
            fragments: 0,
            retransmits: 0,
            directionality: 0,
            last_seq: 0,
            saw_syn: false,
            saw_fin: false,
            saw_rst: false,
            ack_count: 0,
            psh_count: 0,
            urg_count: 0,
        }
    }

    /// Folds one packet into the record. `payload_bytes` is the wire length
    /// minus the bytes committed by extraction.
    pub fn update(&mut self, fields: &Fields, wire_bytes: u16, payload_bytes: i64, ts: TimeSpec) {
        if self.pkts == 0 {
            self.proto_flags = fields.proto_flags;
        }

        if fields.ip_flags & IP_MF != 0 || fields.ip_frag_offset != 0 {
            self.fragments += 1;
        }

        if fields.is_tcp() {
            if fields.tcp_flag(TCP_SYN) {
                self.saw_syn = true;
            } else if fields.tcp_flag(TCP_FIN) {
                self.saw_fin = true;
            } else if fields.tcp_flag(TCP_RST) {
                self.saw_rst = true;
            }

            if fields.tcp_flag(TCP_ACK) {
                self.ack_count += 1;
                match payload_bytes {
                    p if p > 0 => self.directionality += 1,
                    0 => self.directionality -= 1,
                    p => log::debug!("negative payload size {} for directionality", p),
                }
            }
            if fields.tcp_flag(TCP_URG) {
                self.urg_count += 1;
            }
            if fields.tcp_flag(TCP_PSH) {
                self.psh_count += 1;
            }

            if self.pkts > 0
                && !fields.tcp_flag(TCP_SYN)
                && fields.tcp_seq == self.last_seq
                && payload_bytes > 0
            {
                self.retransmits += 1;
            }
            self.last_seq = fields.tcp_seq;
        }

        self.pkts += 1;
        self.bytes += wire_bytes as u64;

        let delta_ns = ts.nanos_since(&self.start).max(0) as u64;
        if self.timeseries {
            self.arrival_ns.push(delta_ns);
            self.byte_series.push(wire_bytes);
        } else {
            self.arrival_ns.clear();
            self.arrival_ns.push(delta_ns);
        }
    }

    #[inline]
    pub fn flow_id(&self) -> FlowId {
        self.flow_id
    }

    #[inline]
    pub fn key(&self) -> FlowKey {
        self.key
    }

    #[inline]
    pub fn start(&self) -> TimeSpec {
        self.start
    }

    #[inline]
    pub fn packets(&self) -> u64 {
        self.pkts
    }

    #[inline]
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Offset and absolute timestamp of the most recent packet.
    pub fn last(&self) -> (u64, TimeSpec) {
        let ns = self.arrival_ns.last().copied().unwrap_or(0);
        (
            ns,
            TimeSpec::from_nanos(self.start.as_nanos() + ns as i64),
        )
    }

    #[inline]
    pub fn arrival_series(&self) -> &[u64] {
        &self.arrival_ns
    }

    #[inline]
    pub fn byte_series(&self) -> &[u16] {
        &self.byte_series
    }

    #[inline]
    pub fn is_tcp(&self) -> bool {
        self.proto_flags & crate::protocols::PROTO_TCP != 0
    }

    #[inline]
    pub fn is_udp(&self) -> bool {
        self.proto_flags & crate::protocols::PROTO_UDP != 0
    }

    #[inline]
    pub fn saw_syn(&self) -> bool {
        self.saw_syn
    }

    #[inline]
    pub fn saw_fin(&self) -> bool {
        self.saw_fin
    }

    #[inline]
    pub fn saw_rst(&self) -> bool {
        self.saw_rst
    }

    /// A flow is alive until it signals close or reset.
    #[inline]
    pub fn is_alive(&self) -> bool {
        !(self.saw_fin || self.saw_rst)
    }

    #[inline]
    pub fn last_seq(&self) -> u32 {
        self.last_seq
    }

    #[inline]
    pub fn fragments(&self) -> u64 {
        self.fragments
    }

    #[inline]
    pub fn retransmits(&self) -> u64 {
        self.retransmits
    }

    #[inline]
    pub fn directionality(&self) -> i64 {
        self.directionality
    }

    #[inline]
    pub fn ack_count(&self) -> u64 {
        self.ack_count
    }

    #[inline]
    pub fn psh_count(&self) -> u64 {
        self.psh_count
    }

    #[inline]
    pub fn urg_count(&self) -> u64 {
        self.urg_count
    }

    /// Session-state nibble: `{saw_rst, saw_fin, saw_syn, is_tcp}`.
    pub fn tcp_state(&self) -> u8 {
        (self.is_tcp() as u8)
            | (self.saw_syn as u8) << 1
            | (self.saw_fin as u8) << 2
            | (self.saw_rst as u8) << 3
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::{PROTO_IPV4, PROTO_TCP};

    fn tcp_fields(flags: u16, seq: u32) -> Fields {
        Fields {
            proto_flags: PROTO_IPV4 | PROTO_TCP,
            tcp_flags: flags,
            tcp_seq: seq,
            ..Default::default()
        }
    }

    fn key() -> FlowKey {
        FlowKey::new(1, 2, 3, 4, 6)
    }

    #[test]
    fn core_record_session_flags() {
        let mut r = FlowRecord::new(1, key(), TimeSpec::default(), false);
        r.update(&tcp_fields(TCP_SYN, 100), 60, 0, TimeSpec::new(0, 0));
        assert!(r.saw_syn());
        assert!(r.is_alive());
        assert_eq!(r.tcp_state(), 0b0011);

        r.update(&tcp_fields(TCP_FIN | TCP_ACK, 101), 60, 0, TimeSpec::new(1, 0));
        assert!(r.saw_fin());
        assert!(!r.is_alive());
        assert_eq!(r.tcp_state(), 0b0111);
        assert_eq!(r.packets(), 2);
        assert_eq!(r.last_seq(), 101);
    }

    #[test]
    fn core_record_rst_kills_flow() {
        let mut r = FlowRecord::new(1, key(), TimeSpec::default(), false);
        r.update(&tcp_fields(TCP_RST, 5), 40, 0, TimeSpec::new(0, 0));
        assert!(r.saw_rst());
        assert!(!r.is_alive());
    }

    #[test]
    fn core_record_directionality() {
        let mut r = FlowRecord::new(1, key(), TimeSpec::default(), false);
        r.update(&tcp_fields(TCP_ACK, 1), 60, 0, TimeSpec::new(0, 0));
        r.update(&tcp_fields(TCP_ACK, 2), 60, 0, TimeSpec::new(0, 10));
        r.update(&tcp_fields(TCP_ACK, 3), 1500, 1440, TimeSpec::new(0, 20));
        assert_eq!(r.directionality(), -1);
        assert_eq!(r.ack_count(), 3);
    }

    #[test]
    fn core_record_timeseries_mode() {
        let mut r = FlowRecord::new(1, key(), TimeSpec::new(10, 0), true);
        r.update(&tcp_fields(TCP_ACK, 1), 60, 0, TimeSpec::new(10, 0));
        r.update(&tcp_fields(TCP_ACK, 2), 70, 0, TimeSpec::new(10, 500));
        r.update(&tcp_fields(TCP_ACK, 3), 80, 0, TimeSpec::new(11, 0));
        assert_eq!(r.arrival_series(), &[0, 500, 1_000_000_000]);
        assert_eq!(r.byte_series(), &[60, 70, 80]);
        let (ns, ts) = r.last();
        assert_eq!(ns, 1_000_000_000);
        assert_eq!(ts, TimeSpec::new(11, 0));
    }

    #[test]
    fn core_record_last_only_without_timeseries() {
        let mut r = FlowRecord::new(1, key(), TimeSpec::new(0, 0), false);
        for i in 0..5 {
            r.update(&tcp_fields(TCP_ACK, i), 60, 0, TimeSpec::new(i as i64, 0));
        }
        assert_eq!(r.arrival_series().len(), 1);
        assert_eq!(r.last().0, 4_000_000_000);
        assert_eq!(r.packets(), 5);
    }

    #[test]
    fn core_record_retransmit_detection() {
        let mut r = FlowRecord::new(1, key(), TimeSpec::default(), false);
        r.update(&tcp_fields(TCP_ACK | TCP_PSH, 1000), 100, 40, TimeSpec::new(0, 0));
        r.update(&tcp_fields(TCP_ACK | TCP_PSH, 1000), 100, 40, TimeSpec::new(0, 10));
        assert_eq!(r.retransmits(), 1);
    }
}
