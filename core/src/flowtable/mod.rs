//! Flow identification and lifecycle management.
//!
//! The table maps each packed 5-tuple key to a vector of flow ids, newest
//! first; the front id is the current incarnation of the key. Records are
//! retired on TCP port reuse (a new SYN with a changed sequence number) and
//! by a periodic idle sweep run every [`SWEEP_INTERVAL`] allocated ids.
//! Retired records are buffered for the driver to sample or persist.

pub mod record;

pub use record::{FlowId, FlowRecord, RetireReason};

use crate::protocols::{Fields, FlowKey, TCP_FIN, TCP_RST, TCP_SYN};
use crate::utils::TimeSpec;

use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::rc::Rc;

use hashlink::LinkedHashMap;

/// Idle sweep cadence, in newly allocated flow ids.
pub const SWEEP_INTERVAL: u64 = 131_072;

/// Idle timeouts per flow state, in seconds.
pub const RST_TIMEOUT_SECS: i64 = 10;
pub const FIN_TIMEOUT_SECS: i64 = 60;
pub const TCP_TIMEOUT_SECS: i64 = 600;
pub const IDLE_TIMEOUT_SECS: i64 = 120;

pub type SharedRecord = Rc<RefCell<FlowRecord>>;

/// A record removed from the live table, with the reason it was retired.
#[derive(Debug)]
pub struct RetiredFlow {
    pub record: SharedRecord,
    pub reason: RetireReason,
}

/// Classification of one ingested packet.
#[derive(Debug)]
pub enum Ingest {
    /// First packet of a new flow incarnation (compulsory simulator insert).
    New { id: FlowId, record: SharedRecord },
    /// Subsequent packet of a tracked flow (simulator update).
    Seen { id: FlowId, record: SharedRecord },
    /// The key resolves to a blacklisted id; `fresh` marks the packet that
    /// caused the blacklisting.
    Blacklisted { id: FlowId, fresh: bool },
    /// The id's record was retired and the packet does not open a new flow.
    Untracked { id: FlowId },
}

/// Summary of one idle sweep, for epoch reporting.
#[derive(Debug, Clone, Copy)]
pub struct SweepReport {
    pub touched: usize,
    pub tracked: usize,
    pub expired: usize,
}

pub struct FlowTable {
    timeseries: bool,
    next_id: FlowId,
    ids: HashMap<FlowKey, Vec<FlowId>>,
    records: LinkedHashMap<FlowId, SharedRecord>,
    blacklist: HashSet<FlowId>,
    /// Flows seen since the last sweep.
    touched: BTreeSet<FlowId>,
    /// Retired records awaiting pickup by the driver.
    retired: Vec<RetiredFlow>,
    last_sweep: Option<SweepReport>,

    port_reuse: u64,
    blacklist_packets: u64,
    timeout_packets: u64,
    sweeps: u64,
}

impl FlowTable {
    pub fn new(timeseries: bool) -> Self {
        FlowTable {
            timeseries,
            next_id: 1,
            ids: HashMap::new(),
            records: LinkedHashMap::new(),
            blacklist: HashSet::new(),
            touched: BTreeSet::new(),
            retired: Vec::new(),
            last_sweep: None,
            port_reuse: 0,
            blacklist_packets: 0,
            timeout_packets: 0,
            sweeps: 0,
        }
    }

    /// Number of live records.
    #[inline]
    pub fn size(&self) -> usize {
        self.records.len()
    }

    #[inline]
    pub fn total_flows(&self) -> usize {
        self.ids.len()
    }

    #[inline]
    pub fn port_reuse(&self) -> u64 {
        self.port_reuse
    }

    #[inline]
    pub fn blacklist_packets(&self) -> u64 {
        self.blacklist_packets
    }

    #[inline]
    pub fn blacklist_flows(&self) -> usize {
        self.blacklist.len()
    }

    #[inline]
    pub fn timeout_packets(&self) -> u64 {
        self.timeout_packets
    }

    #[inline]
    pub fn sweeps(&self) -> u64 {
        self.sweeps
    }

    #[inline]
    pub fn last_sweep(&self) -> Option<SweepReport> {
        self.last_sweep
    }

    /// Associates one packet with a flow, creating or retiring records as
    /// the stream dictates.
    pub fn ingest(
        &mut self,
        fields: &Fields,
        ts: TimeSpec,
        wire_bytes: u16,
        payload_bytes: i64,
    ) -> Ingest {
        let key = fields.flow_key();
        let current = self.ids.get(&key).and_then(|v| v.first().copied());

        let Some(id) = current else {
            return self.first_sighting(key, fields, ts, wire_bytes, payload_bytes);
        };

        if let Some(record) = self.records.get(&id).cloned() {
            // Port reuse: a fresh SYN whose sequence number does not match
            // the record means the old flow is done.
            let reuse = {
                let r = record.borrow();
                fields.is_tcp() && fields.tcp_flag(TCP_SYN) && fields.tcp_seq != r.last_seq()
            };
            if reuse {
                {
                    let r = record.borrow();
                    let since = ts.secs_since(&r.last().1);
                    log::info!(
                        "{} flow {} terminated by new SYN after {} packets, {}s before port reuse; {}",
                        if r.is_tcp() { "TCP" } else { "???" },
                        id,
                        r.packets(),
                        since,
                        r.key()
                    );
                }
                self.records.remove(&id);
                self.retired.push(RetiredFlow {
                    record,
                    reason: RetireReason::SynReuse,
                });
                self.port_reuse += 1;
                return self.open_flow(key, fields, ts, wire_bytes, payload_bytes);
            }

            record
                .borrow_mut()
                .update(fields, wire_bytes, payload_bytes, ts);
            self.touched.insert(id);
            return Ingest::Seen { id, record };
        }

        // Key known but the record is gone.
        if self.blacklist.contains(&id) {
            self.blacklist_packets += 1;
            return Ingest::Blacklisted { id, fresh: false };
        }
        if fields.is_tcp() && fields.tcp_flag(TCP_SYN) {
            // Retired flow resurrected by a new SYN: a fresh incarnation.
            self.port_reuse += 1;
            return self.open_flow(key, fields, ts, wire_bytes, payload_bytes);
        }
        log::debug!("flow id {} no longer tracked; {}", id, key);
        self.timeout_packets += 1;
        Ingest::Untracked { id }
    }

    /// First packet ever observed on this key.
    fn first_sighting(
        &mut self,
        key: FlowKey,
        fields: &Fields,
        ts: TimeSpec,
        wire_bytes: u16,
        payload_bytes: i64,
    ) -> Ingest {
        // TCP scans: a first packet carrying RST or FIN is never tracked.
        if fields.is_tcp() && (fields.tcp_flag(TCP_RST) || fields.tcp_flag(TCP_FIN)) {
            let id = self.alloc_id(ts);
            self.ids.insert(key, vec![id]);
            self.blacklist.insert(id);
            return Ingest::Blacklisted { id, fresh: true };
        }

        let id = self.alloc_id(ts);
        self.ids.insert(key, vec![id]);
        let record = self.track(id, key, fields, ts, wire_bytes, payload_bytes);
        Ingest::New { id, record }
    }

    /// Allocates a fresh incarnation for an already-known key.
    fn open_flow(
        &mut self,
        key: FlowKey,
        fields: &Fields,
        ts: TimeSpec,
        wire_bytes: u16,
        payload_bytes: i64,
    ) -> Ingest {
        let id = self.alloc_id(ts);
        if let Some(v) = self.ids.get_mut(&key) {
            v.insert(0, id);
        }
        let record = self.track(id, key, fields, ts, wire_bytes, payload_bytes);
        Ingest::New { id, record }
    }

    fn track(
        &mut self,
        id: FlowId,
        key: FlowKey,
        fields: &Fields,
        ts: TimeSpec,
        wire_bytes: u16,
        payload_bytes: i64,
    ) -> SharedRecord {
        let record = Rc::new(RefCell::new(FlowRecord::new(id, key, ts, self.timeseries)));
        record
            .borrow_mut()
            .update(fields, wire_bytes, payload_bytes, ts);
        self.records.insert(id, record.clone());
        self.touched.insert(id);
        record
    }

    fn alloc_id(&mut self, now: TimeSpec) -> FlowId {
        let id = self.next_id;
        self.next_id += 1;
        if id % SWEEP_INTERVAL == 0 {
            self.sweep(now);
        }
        id
    }

    /// Retires every dormant record whose idle time exceeds its per-state
    /// timeout. Dormant means untouched since the previous sweep.
    pub fn sweep(&mut self, now: TimeSpec) {
        self.sweeps += 1;
        let touched = std::mem::take(&mut self.touched);
        let tracked = self.records.len();

        let dormant: Vec<FlowId> = self
            .records
            .keys()
            .filter(|id| !touched.contains(id))
            .copied()
            .collect();

        let mut expired = 0;
        for id in dormant {
            let Some(record) = self.records.get(&id).cloned() else {
                continue;
            };
            let reason = {
                let r = record.borrow();
                let idle = now.secs_since(&r.last().1);
                if r.saw_rst() && idle >= RST_TIMEOUT_SECS {
                    Some(RetireReason::RstIdle)
                } else if r.saw_fin() && idle >= FIN_TIMEOUT_SECS {
                    Some(RetireReason::FinIdle)
                } else if r.is_tcp() && idle >= TCP_TIMEOUT_SECS {
                    Some(RetireReason::TcpIdle)
                } else if !r.is_tcp() && idle >= IDLE_TIMEOUT_SECS {
                    Some(RetireReason::UdpIdle)
                } else {
                    None
                }
            };
            if let Some(reason) = reason {
                {
                    let r = record.borrow();
                    log::info!(
                        "flow {} retired ({}) after {} packets, {}s idle; {}",
                        id,
                        reason,
                        r.packets(),
                        now.secs_since(&r.last().1),
                        r.key()
                    );
                }
                self.records.remove(&id);
                self.retired.push(RetiredFlow { record, reason });
                expired += 1;
            }
        }

        self.last_sweep = Some(SweepReport {
            touched: touched.len(),
            tracked,
            expired,
        });
        log::debug!(
            "sweep: {}/{} flows touched, {} expired",
            touched.len(),
            tracked,
            expired
        );
    }

    /// Retires everything still live. Used at shutdown; the reason reported
    /// is the per-state idle reason regardless of elapsed time.
    pub fn drain(&mut self) {
        let ids: Vec<FlowId> = self.records.keys().copied().collect();
        for id in ids {
            if let Some(record) = self.records.remove(&id) {
                let reason = {
                    let r = record.borrow();
                    if r.saw_rst() {
                        RetireReason::RstIdle
                    } else if r.saw_fin() {
                        RetireReason::FinIdle
                    } else if r.is_tcp() {
                        RetireReason::TcpIdle
                    } else {
                        RetireReason::UdpIdle
                    }
                };
                self.retired.push(RetiredFlow { record, reason });
            }
        }
    }

    /// Takes the retired records accumulated since the last call.
    pub fn take_retired(&mut self) -> Vec<RetiredFlow> {
        std::mem::take(&mut self.retired)
    }
}
